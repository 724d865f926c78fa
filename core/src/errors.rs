use std::fmt::Display;

use thiserror::Error;

/// Failure of a single reconciliation pass.
///
/// Every backend error is folded into one of these variants before it reaches the driver so
/// that a pass reports exactly one result, tagged with a stable catalogue code.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to load {backend} state: {reason}")]
    Load { backend: &'static str, reason: String },
    #[error("cannot resolve the list key of {path}")]
    KeyResolution { path: String },
    #[error("failed to store {backend} state: {reason}")]
    Store { backend: &'static str, reason: String },
    #[error("rejected: {0}")]
    Validation(String),
    #[error("no adapter is registered for {0}")]
    UnknownSubtree(String),
}

impl ReconcileError {
    pub fn load(backend: &'static str, reason: impl Display) -> Self {
        Self::Load {
            backend,
            reason: reason.to_string(),
        }
    }

    pub fn store(backend: &'static str, reason: impl Display) -> Self {
        Self::Store {
            backend,
            reason: reason.to_string(),
        }
    }

    pub fn key(path: impl Into<String>) -> Self {
        Self::KeyResolution { path: path.into() }
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Validation(reason.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Load { .. } => "LOAD-1001",
            Self::KeyResolution { .. } => "KEY-1001",
            Self::Store { .. } => "STORE-1001",
            Self::Validation(_) => "VAL-1001",
            Self::UnknownSubtree(_) => "ROUTE-1001",
        }
    }

    pub fn explain(&self) -> &'static str {
        match self {
            Self::Load { .. } => {
                "The backend could not be read; the pass was aborted before any write."
            }
            Self::KeyResolution { .. } => {
                "A change event referenced an entry whose list key could not be extracted."
            }
            Self::Store { .. } => {
                "The backend rejected the new state; the in-memory diff was discarded."
            }
            Self::Validation(_) => "The requested value was rejected before any destructive action.",
            Self::UnknownSubtree(_) => "The change was delivered for a subtree without a route.",
        }
    }

    pub fn is_key_resolution(&self) -> bool {
        matches!(self, Self::KeyResolution { .. })
    }
}
