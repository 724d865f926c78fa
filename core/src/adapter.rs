//! Shared contract implemented by every backend adapter.
//!
//! An adapter lives for exactly one reconciliation pass: the driver builds it, calls
//! [`Adapter::load`] once, feeds it every change event in delivery order through
//! [`Adapter::apply`], checks [`Adapter::validate`] and finally persists with
//! [`Adapter::store`] when the phase allows mutation.

use crate::change::ChangeEvent;
use crate::errors::ReconcileError;

/// Write granularity of the backend behind an adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    /// Only the whole collection can be replaced; a bad event poisons the pass.
    WholeCollection,
    /// Entities are written one by one; a bad event only loses itself.
    PerItem,
}

pub trait Adapter {
    /// Short backend label used in logs and error messages.
    fn name(&self) -> &'static str;

    fn granularity(&self) -> Granularity;

    /// Read the authoritative state. Must not mutate the backend.
    fn load(&mut self) -> Result<(), ReconcileError>;

    /// Apply one change event to the in-memory state.
    fn apply(&mut self, event: &ChangeEvent) -> Result<(), ReconcileError>;

    /// Check that the in-memory state can be stored.
    fn validate(&self) -> Result<(), ReconcileError> {
        Ok(())
    }

    /// Persist the in-memory state.
    fn store(&mut self) -> Result<(), ReconcileError>;
}
