//! Change events delivered by the configuration datastore.

pub mod path;

use serde::{Deserialize, Serialize};

use crate::errors::ReconcileError;
pub use path::{NodePath, PathError, PathSegment};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOperation {
    Create,
    Modify,
    Delete,
    Move,
}

/// Phase of the datastore transaction a batch of events belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionPhase {
    /// Pre-commit; a failure aborts the whole transaction.
    Verify,
    /// Post-commit; a failure cannot be rolled back.
    Apply,
    /// The transaction was abandoned after a successful verify.
    Abort,
}

impl TransactionPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Verify => "verify",
            Self::Apply => "apply",
            Self::Abort => "abort",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub operation: ChangeOperation,
    pub path: String,
    #[serde(default)]
    pub value: Option<String>,
}

impl ChangeEvent {
    pub fn new(operation: ChangeOperation, path: impl Into<String>, value: Option<&str>) -> Self {
        Self {
            operation,
            path: path.into(),
            value: value.map(str::to_string),
        }
    }

    pub fn create(path: impl Into<String>, value: Option<&str>) -> Self {
        Self::new(ChangeOperation::Create, path, value)
    }

    pub fn modify(path: impl Into<String>, value: &str) -> Self {
        Self::new(ChangeOperation::Modify, path, Some(value))
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(ChangeOperation::Delete, path, None)
    }

    pub fn moved(path: impl Into<String>) -> Self {
        Self::new(ChangeOperation::Move, path, None)
    }

    /// Parse the event path; an unparsable path is treated as an unresolvable key.
    pub fn node_path(&self) -> Result<NodePath, ReconcileError> {
        NodePath::parse(&self.path).map_err(|err| {
            log::debug!("unparsable change path {}: {err}", self.path);
            ReconcileError::key(&self.path)
        })
    }

    /// True for create and modify, the two operations that upsert.
    pub fn is_upsert(&self) -> bool {
        matches!(
            self.operation,
            ChangeOperation::Create | ChangeOperation::Modify
        )
    }

    pub fn required_value(&self) -> Result<&str, ReconcileError> {
        self.value
            .as_deref()
            .ok_or_else(|| ReconcileError::invalid(format!("{} carries no value", self.path)))
    }
}

/// Ordered events for one subscribed subtree in one transaction phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeBatch {
    pub subtree: String,
    pub phase: TransactionPhase,
    pub events: Vec<ChangeEvent>,
}

impl ChangeBatch {
    pub fn new(subtree: impl Into<String>, phase: TransactionPhase, events: Vec<ChangeEvent>) -> Self {
        Self {
            subtree: subtree.into(),
            phase,
            events,
        }
    }
}
