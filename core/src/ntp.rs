//! NTP client configuration: the `enabled` flag and the list of time sources.
//!
//! Both live in the collection service next to the resolver collections and are written whole,
//! the same way as [`crate::dns`].

use std::net::IpAddr;
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::adapter::{Adapter, Granularity};
use crate::change::{ChangeEvent, ChangeOperation};
use crate::errors::ReconcileError;
use crate::hostname::check_hostname;
use crate::resolver::{CollectionProxy, CollectionService};

pub const DEFAULT_NTP_PORT: u16 = 123;

pub const SERVERS_COLLECTION: &str = "ntp-servers";
pub const SETTINGS_COLLECTION: &str = "ntp-settings";

const BACKEND: &str = "ntp";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssociationType {
    #[default]
    Server,
    Pool,
    Peer,
}

impl FromStr for AssociationType {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "server" => Ok(Self::Server),
            "pool" => Ok(Self::Pool),
            "peer" => Ok(Self::Peer),
            other => Err(ReconcileError::invalid(format!(
                "{other:?} is not an NTP association type"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NtpServer {
    pub name: String,
    /// Host name or IP address; unset until an `address` leaf arrives.
    pub address: Option<String>,
    pub port: Option<u16>,
    pub association_type: AssociationType,
    pub iburst: bool,
    pub prefer: bool,
}

impl NtpServer {
    fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            address: None,
            port: None,
            association_type: AssociationType::default(),
            iburst: false,
            prefer: false,
        }
    }

    pub fn effective_port(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_NTP_PORT)
    }
}

/// Element of the `ntp-servers` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireNtpServer {
    pub ifindex: i32,
    #[serde(default)]
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub association_type: AssociationType,
    #[serde(default)]
    pub iburst: bool,
    #[serde(default)]
    pub prefer: bool,
}

/// Element of the `ntp-settings` collection; at most one per interface index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireNtpSettings {
    pub ifindex: i32,
    pub enabled: bool,
}

fn check_address(raw: &str) -> Result<String, ReconcileError> {
    let address = raw.trim();
    if address.parse::<IpAddr>().is_ok() || check_hostname(address).is_ok() {
        Ok(address.to_string())
    } else {
        Err(ReconcileError::invalid(format!(
            "{raw:?} is neither an IP address nor a host name"
        )))
    }
}

fn parse_flag(raw: &str) -> Result<bool, ReconcileError> {
    match raw.trim() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ReconcileError::invalid(format!("{other:?} is not a boolean"))),
    }
}

fn parse_port(raw: &str) -> Result<Option<u16>, ReconcileError> {
    let port = raw
        .trim()
        .parse::<u16>()
        .map_err(|_| ReconcileError::invalid(format!("{raw:?} is not a port number")))?;
    Ok((port != 0).then_some(port))
}

pub struct NtpServerList<'a> {
    servers_proxy: CollectionProxy<'a, WireNtpServer>,
    settings_proxy: CollectionProxy<'a, WireNtpSettings>,
    ifindex: i32,
    enabled: bool,
    servers: Vec<NtpServer>,
}

impl<'a> NtpServerList<'a> {
    pub fn new(service: &'a dyn CollectionService, ifindex: i32) -> Self {
        Self {
            servers_proxy: CollectionProxy::new(service, SERVERS_COLLECTION),
            settings_proxy: CollectionProxy::new(service, SETTINGS_COLLECTION),
            ifindex,
            enabled: true,
            servers: Vec::new(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn servers(&self) -> &[NtpServer] {
        &self.servers
    }

    fn upsert(&mut self, name: &str) -> &mut NtpServer {
        match self.servers.iter().position(|s| s.name == name) {
            Some(idx) => &mut self.servers[idx],
            None => {
                self.servers.push(NtpServer::named(name));
                let last = self.servers.len() - 1;
                &mut self.servers[last]
            }
        }
    }

    fn remove(&mut self, name: &str) -> bool {
        let before = self.servers.len();
        self.servers.retain(|s| s.name != name);
        before != self.servers.len()
    }

    fn encode(&self) -> Vec<WireNtpServer> {
        self.servers
            .iter()
            .filter_map(|server| {
                Some(WireNtpServer {
                    ifindex: self.ifindex,
                    name: server.name.clone(),
                    address: server.address.clone()?,
                    port: server.effective_port(),
                    association_type: server.association_type,
                    iburst: server.iburst,
                    prefer: server.prefer,
                })
            })
            .collect()
    }
}

impl Adapter for NtpServerList<'_> {
    fn name(&self) -> &'static str {
        "ntp"
    }

    fn granularity(&self) -> Granularity {
        Granularity::WholeCollection
    }

    /// No settings element for the interface means the client is enabled.
    fn load(&mut self) -> Result<(), ReconcileError> {
        let settings = self
            .settings_proxy
            .get()
            .map_err(|err| ReconcileError::load(BACKEND, err))?;
        self.enabled = settings
            .iter()
            .find(|s| s.ifindex == self.ifindex)
            .map_or(true, |s| s.enabled);

        let wire = self
            .servers_proxy
            .get()
            .map_err(|err| ReconcileError::load(BACKEND, err))?;
        self.servers = wire
            .into_iter()
            .filter(|item| item.ifindex == self.ifindex)
            .map(|item| NtpServer {
                name: if item.name.is_empty() {
                    item.address.clone()
                } else {
                    item.name
                },
                address: Some(item.address),
                port: (item.port != 0).then_some(item.port),
                association_type: item.association_type,
                iburst: item.iburst,
                prefer: item.prefer,
            })
            .collect();
        Ok(())
    }

    fn apply(&mut self, event: &ChangeEvent) -> Result<(), ReconcileError> {
        if event.operation == ChangeOperation::Move {
            return Ok(());
        }
        let path = event.node_path()?;
        if !path.contains("server") {
            if path.leaf_name() == "enabled" {
                self.enabled = match event.operation {
                    ChangeOperation::Delete => true,
                    _ => parse_flag(event.required_value()?)?,
                };
            } else {
                debug!("ntp: ignoring {}", event.path);
            }
            return Ok(());
        }

        let name = path
            .list_key("server", "name")
            .ok_or_else(|| ReconcileError::key(&event.path))?
            .to_string();
        let leaf = path.below("server").last().copied();

        match event.operation {
            ChangeOperation::Create | ChangeOperation::Modify => match leaf {
                None | Some("name") => {
                    self.upsert(&name);
                }
                Some("address") => {
                    let address = check_address(event.required_value()?)?;
                    self.upsert(&name).address = Some(address);
                }
                Some("port") => {
                    let port = parse_port(event.required_value()?)?;
                    self.upsert(&name).port = port;
                }
                Some("association-type") => {
                    let kind = event.required_value()?.parse::<AssociationType>()?;
                    self.upsert(&name).association_type = kind;
                }
                Some("iburst") => {
                    let flag = parse_flag(event.required_value()?)?;
                    self.upsert(&name).iburst = flag;
                }
                Some("prefer") => {
                    let flag = parse_flag(event.required_value()?)?;
                    self.upsert(&name).prefer = flag;
                }
                Some(other) => {
                    self.upsert(&name);
                    debug!("ntp server {name}: ignoring leaf {other}");
                }
            },
            ChangeOperation::Delete => {
                let Some(server) = self.servers.iter_mut().find(|s| s.name == name) else {
                    debug!("ntp server {name} already absent");
                    return Ok(());
                };
                match leaf {
                    None => {
                        self.remove(&name);
                    }
                    Some("port") => server.port = None,
                    Some("association-type") => server.association_type = AssociationType::Server,
                    Some("iburst") => server.iburst = false,
                    Some("prefer") => server.prefer = false,
                    Some(_) => {}
                }
            }
            ChangeOperation::Move => {}
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ReconcileError> {
        match self.servers.iter().find(|s| s.address.is_none()) {
            Some(server) => Err(ReconcileError::invalid(format!(
                "ntp server {} has no address",
                server.name
            ))),
            None => Ok(()),
        }
    }

    fn store(&mut self) -> Result<(), ReconcileError> {
        self.validate()?;
        let settings = [WireNtpSettings {
            ifindex: self.ifindex,
            enabled: self.enabled,
        }];
        self.settings_proxy
            .set(self.ifindex, &settings)
            .map_err(|err| ReconcileError::store(BACKEND, err))?;
        self.servers_proxy
            .set(self.ifindex, &self.encode())
            .map_err(|err| ReconcileError::store(BACKEND, err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::MemoryCollectionService;
    use serde_json::json;

    const NTP: &str = "/ietf-system:system/ntp";

    fn server_events(name: &str, address: &str) -> Vec<ChangeEvent> {
        let base = format!("{NTP}/server[name='{name}']");
        vec![
            ChangeEvent::create(base.clone(), None),
            ChangeEvent::create(format!("{base}/name"), Some(name)),
            ChangeEvent::create(format!("{base}/udp/address"), Some(address)),
            ChangeEvent::create(format!("{base}/association-type"), Some("pool")),
            ChangeEvent::create(format!("{base}/iburst"), Some("true")),
        ]
    }

    #[test]
    fn created_server_is_written_with_its_options() {
        let service = MemoryCollectionService::new();
        service.insert(
            SERVERS_COLLECTION,
            json!({"ifindex": 0, "name": "a", "address": "10.0.0.1", "port": 123,
                   "association_type": "server", "iburst": false, "prefer": true}),
        );
        let mut list = NtpServerList::new(&service, 0);
        list.load().unwrap();
        assert!(list.enabled());
        for event in server_events("pool", "pool.ntp.org") {
            list.apply(&event).unwrap();
        }
        list.store().unwrap();

        assert_eq!(
            service.items(SERVERS_COLLECTION),
            vec![
                json!({"ifindex": 0, "name": "a", "address": "10.0.0.1", "port": 123,
                       "association_type": "server", "iburst": false, "prefer": true}),
                json!({"ifindex": 0, "name": "pool", "address": "pool.ntp.org", "port": 123,
                       "association_type": "pool", "iburst": true, "prefer": false}),
            ]
        );
        assert_eq!(
            service.items(SETTINGS_COLLECTION),
            vec![json!({"ifindex": 0, "enabled": true})]
        );
    }

    #[test]
    fn enabled_flag_round_trips() {
        let service = MemoryCollectionService::new();
        let mut list = NtpServerList::new(&service, 0);
        list.load().unwrap();
        list.apply(&ChangeEvent::modify(format!("{NTP}/enabled"), "false"))
            .unwrap();
        list.store().unwrap();

        let mut reloaded = NtpServerList::new(&service, 0);
        reloaded.load().unwrap();
        assert!(!reloaded.enabled());
    }

    #[test]
    fn server_without_address_blocks_store() {
        let service = MemoryCollectionService::new();
        let mut list = NtpServerList::new(&service, 0);
        list.load().unwrap();
        list.apply(&ChangeEvent::create(format!("{NTP}/server[name='x']"), None))
            .unwrap();
        assert_eq!(list.store().unwrap_err().code(), "VAL-1001");
        assert!(service.set_calls().is_empty());
    }

    #[test]
    fn delete_drops_entry_and_resets_options() {
        let service = MemoryCollectionService::new();
        let mut list = NtpServerList::new(&service, 0);
        list.load().unwrap();
        for event in server_events("a", "192.0.2.1")
            .into_iter()
            .chain(server_events("b", "192.0.2.2"))
        {
            list.apply(&event).unwrap();
        }
        list.apply(&ChangeEvent::delete(format!("{NTP}/server[name='a']")))
            .unwrap();
        list.apply(&ChangeEvent::delete(format!("{NTP}/server[name='b']/iburst")))
            .unwrap();

        assert_eq!(list.servers().len(), 1);
        assert_eq!(list.servers()[0].name, "b");
        assert!(!list.servers()[0].iburst);
        assert_eq!(list.servers()[0].association_type, AssociationType::Pool);
    }

    #[test]
    fn bad_values_are_validation_failures() {
        let service = MemoryCollectionService::new();
        let mut list = NtpServerList::new(&service, 0);
        list.load().unwrap();
        for (leaf, value) in [
            ("udp/address", "not a host"),
            ("udp/port", "70000"),
            ("association-type", "broadcast"),
            ("prefer", "yes"),
        ] {
            let err = list
                .apply(&ChangeEvent::create(
                    format!("{NTP}/server[name='s']/{leaf}"),
                    Some(value),
                ))
                .unwrap_err();
            assert_eq!(err.code(), "VAL-1001", "{leaf}");
        }
    }

    #[test]
    fn unkeyed_server_event_is_a_key_resolution_failure() {
        let service = MemoryCollectionService::new();
        let mut list = NtpServerList::new(&service, 0);
        let err = list
            .apply(&ChangeEvent::create(format!("{NTP}/server/udp/address"), Some("192.0.2.1")))
            .unwrap_err();
        assert!(err.is_key_resolution());
    }

    #[test]
    fn unnamed_wire_entries_are_keyed_by_address() {
        let service = MemoryCollectionService::new();
        service.insert(
            SERVERS_COLLECTION,
            json!({"ifindex": 0, "address": "time.example.net"}),
        );
        let mut list = NtpServerList::new(&service, 0);
        list.load().unwrap();
        assert_eq!(list.servers()[0].name, "time.example.net");
        assert_eq!(list.servers()[0].effective_port(), DEFAULT_NTP_PORT);
        assert_eq!(list.servers()[0].association_type, AssociationType::Server);
    }
}
