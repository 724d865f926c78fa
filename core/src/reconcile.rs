//! Reconciliation driver.
//!
//! A batch of change events for one subscribed subtree is turned into one pass over one backend:
//! the route table picks the adapter, the adapter loads the live state, every event is applied in
//! delivery order, and the result is validated and (in the apply phase) stored.
//!
//! | phase    | load | apply | validate | store |
//! |----------|------|-------|----------|-------|
//! | `Verify` | yes  | yes   | yes      | no    |
//! | `Apply`  | yes  | yes   | yes      | yes   |
//! | `Abort`  | no   | no    | no       | no    |

use std::sync::Arc;

use anyhow::{Context, Result as AnyResult};
use log::{debug, error, info, warn};
use serde::Serialize;
use uuid::Uuid;

use crate::adapter::{Adapter, Granularity};
use crate::change::{ChangeBatch, ChangeEvent, NodePath, TransactionPhase};
use crate::config::{self, IdentityBackend, SystemSettings};
use crate::db::DbPool;
use crate::dns::{DnsSearchList, DnsServerList};
use crate::errors::ReconcileError;
use crate::hostname::HostnameAdapter;
use crate::identity::{
    AuthorizedKeysAdapter, FlatFileIdentityStore, HomeProvisioner, IdentityStore, LocalUserList,
    SqliteIdentityStore,
};
use crate::logging;
use crate::ntp::NtpServerList;
use crate::resolver::{CollectionService, HttpCollectionService, MemoryCollectionService};
use crate::timezone::{TimezoneAdapter, TimezoneName};

pub const HOSTNAME_PATH: &str = "/ietf-system:system/hostname";
pub const TIMEZONE_PATH: &str = "/ietf-system:system/clock/timezone-name";
pub const DNS_SERVER_PATH: &str = "/ietf-system:system/dns-resolver/server";
pub const DNS_SEARCH_PATH: &str = "/ietf-system:system/dns-resolver/search";
pub const NTP_PATH: &str = "/ietf-system:system/ntp";
pub const USER_PATH: &str = "/ietf-system:system/authentication/user";
pub const AUTHORIZED_KEY_PATH: &str = "/ietf-system:system/authentication/user/authorized-key";

/// Handles on every backend a pass may touch.
#[derive(Clone)]
pub struct Backends {
    pub collections: Arc<dyn CollectionService>,
    pub identity: Arc<dyn IdentityStore>,
    pub settings: SystemSettings,
    /// Pass outcomes are written to `event_log` when set.
    pub audit: Option<DbPool>,
}

impl Backends {
    /// Build the backends described by the stored settings.
    ///
    /// Without a resolver endpoint the resolver collections are kept in memory.
    pub fn open(pool: DbPool) -> AnyResult<Self> {
        let settings = {
            let conn = pool.get()?;
            config::get_settings(&conn)?
        };

        let collections: Arc<dyn CollectionService> = match &settings.resolver_endpoint {
            Some(url) => Arc::new(
                HttpCollectionService::new(url.as_str(), settings.resolver_timeout())
                    .with_context(|| format!("failed to set up resolver client for {url}"))?,
            ),
            None => Arc::new(MemoryCollectionService::new()),
        };
        let identity: Arc<dyn IdentityStore> = match settings.identity_backend {
            IdentityBackend::Files => Arc::new(FlatFileIdentityStore::new(&settings.identity_dir)),
            IdentityBackend::Sqlite => Arc::new(SqliteIdentityStore::new(pool.clone())),
        };

        Ok(Self {
            collections,
            identity,
            settings,
            audit: Some(pool),
        })
    }
}

pub type AdapterFactory = for<'b> fn(&'b Backends) -> Box<dyn Adapter + 'b>;

pub struct Route {
    pub subtree: &'static str,
    pub build: AdapterFactory,
}

fn hostname(backends: &Backends) -> Box<dyn Adapter + '_> {
    Box::new(HostnameAdapter::new(&backends.settings.hostname_file))
}

fn timezone(backends: &Backends) -> Box<dyn Adapter + '_> {
    let s = &backends.settings;
    Box::new(TimezoneAdapter::new(TimezoneName::new(
        &s.zoneinfo_dir,
        &s.localtime_link,
    )))
}

fn dns_servers(backends: &Backends) -> Box<dyn Adapter + '_> {
    Box::new(DnsServerList::new(
        backends.collections.as_ref(),
        backends.settings.resolver_ifindex,
    ))
}

fn dns_search(backends: &Backends) -> Box<dyn Adapter + '_> {
    Box::new(DnsSearchList::new(
        backends.collections.as_ref(),
        backends.settings.resolver_ifindex,
    ))
}

fn ntp(backends: &Backends) -> Box<dyn Adapter + '_> {
    Box::new(NtpServerList::new(
        backends.collections.as_ref(),
        backends.settings.resolver_ifindex,
    ))
}

fn local_users(backends: &Backends) -> Box<dyn Adapter + '_> {
    let s = &backends.settings;
    let list = LocalUserList::new(backends.identity.as_ref(), s.user_defaults());
    if s.provision_home {
        Box::new(list.with_provisioner(HomeProvisioner::new(&s.skel_dir)))
    } else {
        Box::new(list)
    }
}

fn authorized_keys(backends: &Backends) -> Box<dyn Adapter + '_> {
    let s = &backends.settings;
    Box::new(AuthorizedKeysAdapter::new(&s.home_root, &s.root_home))
}

/// Subscribed subtrees. Passes for one transaction run in this order.
pub static ROUTES: &[Route] = &[
    Route {
        subtree: HOSTNAME_PATH,
        build: hostname,
    },
    Route {
        subtree: TIMEZONE_PATH,
        build: timezone,
    },
    Route {
        subtree: DNS_SERVER_PATH,
        build: dns_servers,
    },
    Route {
        subtree: DNS_SEARCH_PATH,
        build: dns_search,
    },
    Route {
        subtree: NTP_PATH,
        build: ntp,
    },
    Route {
        subtree: USER_PATH,
        build: local_users,
    },
    Route {
        subtree: AUTHORIZED_KEY_PATH,
        build: authorized_keys,
    },
];

fn node_names(path: &NodePath) -> Vec<&str> {
    path.segments().iter().map(|s| s.name.as_str()).collect()
}

/// Index into [`ROUTES`] of the longest subtree prefix of `path`, compared node by node.
fn route_index(path: &str) -> Option<usize> {
    let parsed = NodePath::parse(path).ok()?;
    let names = node_names(&parsed);
    ROUTES
        .iter()
        .enumerate()
        .filter_map(|(idx, route)| {
            let subtree = NodePath::parse(route.subtree).ok()?;
            let prefix = node_names(&subtree);
            names.starts_with(&prefix).then_some((prefix.len(), idx))
        })
        .max_by_key(|(len, _)| *len)
        .map(|(_, idx)| idx)
}

/// Route whose subtree is the longest prefix of `path`.
pub fn route_for(path: &str) -> Option<&'static Route> {
    route_index(path).map(|idx| &ROUTES[idx])
}

/// Outcome of a pass that did not fail.
#[derive(Debug, Clone, Serialize)]
pub struct PassSummary {
    pub id: Uuid,
    pub subtree: String,
    pub adapter: &'static str,
    pub phase: TransactionPhase,
    pub applied: usize,
    /// Paths of events dropped because their list key could not be resolved.
    pub skipped: Vec<String>,
    pub stored: bool,
}

impl PassSummary {
    fn new(batch: &ChangeBatch, adapter: &'static str) -> Self {
        Self {
            id: Uuid::new_v4(),
            subtree: batch.subtree.clone(),
            adapter,
            phase: batch.phase,
            applied: 0,
            skipped: Vec::new(),
            stored: false,
        }
    }
}

/// Run one reconciliation pass for `batch`.
pub fn run_pass(backends: &Backends, batch: &ChangeBatch) -> Result<PassSummary, ReconcileError> {
    let result = drive(backends, batch);
    match &result {
        Ok(summary) => info!(
            "{} {} pass over {}: {} applied, {} skipped",
            summary.adapter,
            batch.phase.as_str(),
            batch.subtree,
            summary.applied,
            summary.skipped.len()
        ),
        Err(err @ ReconcileError::Store { .. }) if batch.phase == TransactionPhase::Apply => error!(
            "{}: committed configuration was not applied, system state has diverged: {err}",
            batch.subtree
        ),
        Err(err) => warn!(
            "{} {} pass failed [{}]: {err}",
            batch.subtree,
            batch.phase.as_str(),
            err.code()
        ),
    }
    audit(backends, batch, &result);
    result
}

fn drive(backends: &Backends, batch: &ChangeBatch) -> Result<PassSummary, ReconcileError> {
    let route = ROUTES
        .iter()
        .find(|r| r.subtree == batch.subtree)
        .or_else(|| route_for(&batch.subtree))
        .ok_or_else(|| ReconcileError::UnknownSubtree(batch.subtree.clone()))?;

    let mut adapter = (route.build)(backends);
    let mut summary = PassSummary::new(batch, adapter.name());
    if batch.phase == TransactionPhase::Abort {
        debug!("{}: abort, nothing to undo", batch.subtree);
        return Ok(summary);
    }

    adapter.load()?;
    for event in &batch.events {
        match adapter.apply(event) {
            Ok(()) => {
                debug!("{}: {:?} {}", adapter.name(), event.operation, event.path);
                summary.applied += 1;
            }
            Err(err)
                if err.is_key_resolution() && adapter.granularity() == Granularity::PerItem =>
            {
                warn!("{}: skipping event: {err}", adapter.name());
                summary.skipped.push(event.path.clone());
            }
            Err(err) => return Err(err),
        }
    }
    adapter.validate()?;

    if batch.phase == TransactionPhase::Apply {
        adapter.store()?;
        summary.stored = true;
    }
    Ok(summary)
}

fn audit(backends: &Backends, batch: &ChangeBatch, result: &Result<PassSummary, ReconcileError>) {
    let Some(pool) = &backends.audit else {
        return;
    };
    let conn = match pool.get() {
        Ok(conn) => conn,
        Err(err) => {
            warn!("audit log unavailable: {err}");
            return;
        }
    };
    let written = match result {
        Ok(summary) => logging::record_pass(&conn, summary),
        Err(err) => logging::record_failure(&conn, &batch.subtree, batch.phase, err),
    };
    if let Err(err) = written {
        warn!("failed to write audit record: {err}");
    }
}

/// Split a mixed event stream into one batch per route, in route order, keeping delivery order
/// inside each batch. Fails before anything runs if an event has no route.
pub fn split_by_route(
    phase: TransactionPhase,
    events: Vec<ChangeEvent>,
) -> Result<Vec<ChangeBatch>, ReconcileError> {
    let mut grouped: Vec<Vec<ChangeEvent>> = ROUTES.iter().map(|_| Vec::new()).collect();
    for event in events {
        let idx = route_index(&event.path)
            .ok_or_else(|| ReconcileError::UnknownSubtree(event.path.clone()))?;
        grouped[idx].push(event);
    }
    Ok(ROUTES
        .iter()
        .zip(grouped)
        .filter(|(_, events)| !events.is_empty())
        .map(|(route, events)| ChangeBatch::new(route.subtree, phase, events))
        .collect())
}

/// Run every batch of a mixed event stream; stops at the first failing pass.
pub fn dispatch(
    backends: &Backends,
    phase: TransactionPhase,
    events: Vec<ChangeEvent>,
) -> Result<Vec<PassSummary>, ReconcileError> {
    let batches = split_by_route(phase, events)?;
    let mut summaries = Vec::with_capacity(batches.len());
    for batch in &batches {
        match run_pass(backends, batch) {
            Ok(summary) => summaries.push(summary),
            Err(err) => {
                if phase == TransactionPhase::Apply && summaries.iter().any(|s| s.stored) {
                    error!(
                        "{} of {} passes were stored before {} failed",
                        summaries.len(),
                        batches.len(),
                        batch.subtree
                    );
                }
                return Err(err);
            }
        }
    }
    Ok(summaries)
}
