//! Resolver configuration: DNS servers and search domains.
//!
//! Both collections live in the remote collection service and can only be written as a whole,
//! so each pass reads the full collection for one interface index, edits it in memory and
//! writes everything back. Anything left out of the write is deleted by the service.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::adapter::{Adapter, Granularity};
use crate::change::{ChangeEvent, ChangeOperation, NodePath};
use crate::errors::ReconcileError;
use crate::resolver::{CollectionProxy, CollectionService};

/// Interface index addressing the global (link-independent) configuration.
pub const GLOBAL_IFINDEX: i32 = 0;
pub const DEFAULT_DNS_PORT: u16 = 53;

pub const SERVERS_COLLECTION: &str = "dns-servers";
pub const DOMAINS_COLLECTION: &str = "dns-domains";

const AF_INET: i32 = 2;
const AF_INET6: i32 = 10;

const BACKEND: &str = "dns-resolver";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DnsAddress {
    V4([u8; 4]),
    V6([u8; 16]),
}

impl DnsAddress {
    pub fn family(&self) -> i32 {
        match self {
            Self::V4(_) => AF_INET,
            Self::V6(_) => AF_INET6,
        }
    }

    pub fn octets(&self) -> Vec<u8> {
        match self {
            Self::V4(bytes) => bytes.to_vec(),
            Self::V6(bytes) => bytes.to_vec(),
        }
    }

    /// Decode the `(family, bytes)` pair used on the wire.
    pub fn from_wire(family: i32, bytes: &[u8]) -> Option<Self> {
        match family {
            AF_INET => <[u8; 4]>::try_from(bytes).ok().map(Self::V4),
            AF_INET6 => <[u8; 16]>::try_from(bytes).ok().map(Self::V6),
            _ => None,
        }
    }
}

impl From<IpAddr> for DnsAddress {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Self::V4(v4.octets()),
            IpAddr::V6(v6) => Self::V6(v6.octets()),
        }
    }
}

impl FromStr for DnsAddress {
    type Err = ReconcileError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<IpAddr>()
            .map(Self::from)
            .map_err(|_| ReconcileError::invalid(format!("{s:?} is not an IP address")))
    }
}

impl fmt::Display for DnsAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(bytes) => write!(f, "{}", Ipv4Addr::from(*bytes)),
            Self::V6(bytes) => write!(f, "{}", Ipv6Addr::from(*bytes)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsServer {
    pub name: String,
    pub ifindex: i32,
    pub address: DnsAddress,
    pub port: Option<u16>,
}

impl DnsServer {
    pub fn effective_port(&self) -> u16 {
        match self.port {
            Some(0) | None => DEFAULT_DNS_PORT,
            Some(port) => port,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsSearchDomain {
    pub domain: String,
    pub ifindex: i32,
    pub routing_only: bool,
}

/// Element of the `dns-servers` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireDnsServer {
    pub ifindex: i32,
    pub family: i32,
    pub address: Vec<u8>,
    #[serde(default)]
    pub port: u16,
    #[serde(default)]
    pub name: String,
}

/// Element of the `dns-domains` collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireSearchDomain {
    pub ifindex: i32,
    pub domain: String,
    #[serde(default)]
    pub routing_only: bool,
}

fn parse_port(raw: &str) -> Result<Option<u16>, ReconcileError> {
    let port = raw
        .trim()
        .parse::<u16>()
        .map_err(|_| ReconcileError::invalid(format!("{raw:?} is not a port number")))?;
    Ok((port != 0).then_some(port))
}

/// A server named by a change event before its address arrived.
#[derive(Debug, Clone)]
struct PendingServer {
    name: String,
    port: Option<u16>,
}

pub struct DnsServerList<'a> {
    proxy: CollectionProxy<'a, WireDnsServer>,
    ifindex: i32,
    servers: Vec<DnsServer>,
    pending: Vec<PendingServer>,
}

impl<'a> DnsServerList<'a> {
    pub fn new(service: &'a dyn CollectionService, ifindex: i32) -> Self {
        Self {
            proxy: CollectionProxy::new(service, SERVERS_COLLECTION),
            ifindex,
            servers: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn servers(&self) -> &[DnsServer] {
        &self.servers
    }

    pub fn upsert(&mut self, name: &str, address: DnsAddress, port: Option<u16>) {
        self.pending.retain(|p| p.name != name);
        match self.servers.iter_mut().find(|s| s.name == name) {
            Some(server) => {
                server.address = address;
                server.port = port;
            }
            None => self.servers.push(DnsServer {
                name: name.to_string(),
                ifindex: self.ifindex,
                address,
                port,
            }),
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.servers.len() + self.pending.len();
        self.servers.retain(|s| s.name != name);
        self.pending.retain(|p| p.name != name);
        before != self.servers.len() + self.pending.len()
    }

    fn set_address(&mut self, name: &str, address: DnsAddress) {
        if let Some(server) = self.servers.iter_mut().find(|s| s.name == name) {
            server.address = address;
            return;
        }
        let port = self
            .pending
            .iter()
            .find(|p| p.name == name)
            .and_then(|p| p.port);
        self.upsert(name, address, port);
    }

    fn set_port(&mut self, name: &str, port: Option<u16>) {
        if let Some(server) = self.servers.iter_mut().find(|s| s.name == name) {
            server.port = port;
        } else if let Some(pending) = self.pending.iter_mut().find(|p| p.name == name) {
            pending.port = port;
        } else {
            self.pending.push(PendingServer {
                name: name.to_string(),
                port,
            });
        }
    }

    fn touch(&mut self, name: &str) {
        let known = self.servers.iter().any(|s| s.name == name)
            || self.pending.iter().any(|p| p.name == name);
        if !known {
            self.pending.push(PendingServer {
                name: name.to_string(),
                port: None,
            });
        }
    }

    fn encode(&self) -> Vec<WireDnsServer> {
        self.servers
            .iter()
            .map(|server| WireDnsServer {
                ifindex: self.ifindex,
                family: server.address.family(),
                address: server.address.octets(),
                port: server.effective_port(),
                name: server.name.clone(),
            })
            .collect()
    }
}

impl Adapter for DnsServerList<'_> {
    fn name(&self) -> &'static str {
        "dns-servers"
    }

    fn granularity(&self) -> Granularity {
        Granularity::WholeCollection
    }

    fn load(&mut self) -> Result<(), ReconcileError> {
        let wire = self
            .proxy
            .get()
            .map_err(|err| ReconcileError::load(BACKEND, err))?;

        let mut servers = Vec::new();
        for item in wire.into_iter().filter(|item| item.ifindex == self.ifindex) {
            let address = DnsAddress::from_wire(item.family, &item.address).ok_or_else(|| {
                ReconcileError::load(
                    BACKEND,
                    format!(
                        "server {:?} has address family {} with {} bytes",
                        item.name,
                        item.family,
                        item.address.len()
                    ),
                )
            })?;
            servers.push(DnsServer {
                name: item.name,
                ifindex: item.ifindex,
                address,
                port: (item.port != 0).then_some(item.port),
            });
        }

        self.servers = servers;
        self.pending.clear();
        Ok(())
    }

    fn apply(&mut self, event: &ChangeEvent) -> Result<(), ReconcileError> {
        if event.operation == ChangeOperation::Move {
            return Ok(());
        }
        let path = event.node_path()?;
        let name = server_key(&path, &event.path)?;
        let below = path.below("server");
        let leaf = below.last().copied();

        match event.operation {
            ChangeOperation::Create | ChangeOperation::Modify => match leaf {
                None | Some("name") => self.touch(&name),
                Some("address") => {
                    let address = event.required_value()?.parse::<DnsAddress>()?;
                    self.set_address(&name, address);
                }
                Some("port") => {
                    let port = parse_port(event.required_value()?)?;
                    self.set_port(&name, port);
                }
                Some(other) => {
                    self.touch(&name);
                    debug!("dns server {name}: ignoring leaf {other}");
                }
            },
            ChangeOperation::Delete => match leaf {
                None => {
                    if !self.remove(&name) {
                        debug!("dns server {name} already absent");
                    }
                }
                Some("port") => {
                    if let Some(server) = self.servers.iter_mut().find(|s| s.name == name) {
                        server.port = None;
                    }
                }
                Some(_) => {}
            },
            ChangeOperation::Move => {}
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ReconcileError> {
        match self.pending.first() {
            Some(pending) => Err(ReconcileError::invalid(format!(
                "dns server {} has no address",
                pending.name
            ))),
            None => Ok(()),
        }
    }

    fn store(&mut self) -> Result<(), ReconcileError> {
        self.validate()?;
        self.proxy
            .set(self.ifindex, &self.encode())
            .map_err(|err| ReconcileError::store(BACKEND, err))
    }
}

fn server_key(path: &NodePath, raw: &str) -> Result<String, ReconcileError> {
    path.list_key("server", "name")
        .map(str::to_string)
        .ok_or_else(|| ReconcileError::key(raw))
}

pub struct DnsSearchList<'a> {
    proxy: CollectionProxy<'a, WireSearchDomain>,
    ifindex: i32,
    domains: Vec<DnsSearchDomain>,
}

impl<'a> DnsSearchList<'a> {
    pub fn new(service: &'a dyn CollectionService, ifindex: i32) -> Self {
        Self {
            proxy: CollectionProxy::new(service, DOMAINS_COLLECTION),
            ifindex,
            domains: Vec::new(),
        }
    }

    pub fn domains(&self) -> &[DnsSearchDomain] {
        &self.domains
    }

    pub fn upsert(&mut self, domain: &str, routing_only: bool) {
        match self.domains.iter_mut().find(|d| d.domain == domain) {
            Some(existing) => existing.routing_only = routing_only,
            None => self.domains.push(DnsSearchDomain {
                domain: domain.to_string(),
                ifindex: self.ifindex,
                routing_only,
            }),
        }
    }

    pub fn remove(&mut self, domain: &str) -> bool {
        let before = self.domains.len();
        self.domains.retain(|d| d.domain != domain);
        before != self.domains.len()
    }
}

impl Adapter for DnsSearchList<'_> {
    fn name(&self) -> &'static str {
        "dns-search"
    }

    fn granularity(&self) -> Granularity {
        Granularity::WholeCollection
    }

    fn load(&mut self) -> Result<(), ReconcileError> {
        let wire = self
            .proxy
            .get()
            .map_err(|err| ReconcileError::load(BACKEND, err))?;
        self.domains = wire
            .into_iter()
            .filter(|item| item.ifindex == self.ifindex)
            .map(|item| DnsSearchDomain {
                domain: item.domain,
                ifindex: item.ifindex,
                routing_only: item.routing_only,
            })
            .collect();
        Ok(())
    }

    fn apply(&mut self, event: &ChangeEvent) -> Result<(), ReconcileError> {
        if event.operation == ChangeOperation::Move {
            return Ok(());
        }
        let path = event.node_path()?;
        if !path.contains("search") {
            return Err(ReconcileError::key(&event.path));
        }
        let domain = path
            .list_key("search", ".")
            .or(event.value.as_deref())
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .ok_or_else(|| ReconcileError::key(&event.path))?
            .to_string();

        if event.is_upsert() {
            if !self.domains.iter().any(|d| d.domain == domain) {
                self.upsert(&domain, false);
            }
        } else if !self.remove(&domain) {
            debug!("search domain {domain} already absent");
        }
        Ok(())
    }

    fn store(&mut self) -> Result<(), ReconcileError> {
        let wire: Vec<WireSearchDomain> = self
            .domains
            .iter()
            .map(|d| WireSearchDomain {
                ifindex: self.ifindex,
                domain: d.domain.clone(),
                routing_only: d.routing_only,
            })
            .collect();
        self.proxy
            .set(self.ifindex, &wire)
            .map_err(|err| ReconcileError::store(BACKEND, err))
    }
}
