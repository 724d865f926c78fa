//! Reconciles committed system configuration with the live system.
//!
//! Each subscribed configuration subtree maps onto one backend, and every batch of change events
//! is replayed against that backend in a load, apply, store pass:
//! - [`change`] models change events and parses the instance paths they carry.
//! - [`adapter`] is the contract every backend adapter implements.
//! - [`reconcile`] holds the route table, the per-pass driver and the dispatcher.
//! - [`dns`] and [`resolver`] cover resolver servers and search domains behind the collection
//!   service.
//! - [`identity`] manages local users, their mirror groups and authorized SSH keys.
//! - [`ntp`] covers the NTP client flag and its time sources.
//! - [`timezone`] and [`hostname`] cover the clock zone link and the static host name.
//! - [`config`], [`db`] and [`logging`] keep settings, the SQLite state and the audit log.
//! - [`errors`] keeps the error catalogue with stable codes.

pub mod adapter;
pub mod change;
pub mod config;
pub mod db;
pub mod dns;
pub mod errors;
pub mod fsutil;
pub mod hostname;
pub mod identity;
pub mod logging;
pub mod ntp;
pub mod reconcile;
pub mod resolver;
pub mod timezone;

pub use adapter::{Adapter, Granularity};
pub use change::{ChangeBatch, ChangeEvent, ChangeOperation, TransactionPhase};
pub use errors::ReconcileError;
pub use reconcile::{dispatch, run_pass, Backends, PassSummary};
