/// Error Module
///
/// Typed failures of the node gateway and the integrity warnings raised while
/// assembling a block graph. Everything else propagates as `anyhow::Error`.
use std::fmt;
use thiserror::Error;

/// RPC error code returned when a height is beyond the node's tip
pub const RPC_INVALID_PARAMETER: i64 = -8;
/// RPC error code returned for an unknown block or transaction
pub const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;

/// Failure of a single node call
#[derive(Debug, Error)]
pub enum NodeError {
    /// Network or HTTP layer fault
    #[error("transport failure: {0}")]
    Transport(String),

    /// The node answered with an explicit error object
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },

    /// The node answered with a body we could not interpret
    #[error("undecodable response to {method}: {reason}")]
    Decode { method: String, reason: String },

    /// No matching hash or height on the node
    #[error("not found: {0}")]
    NotFound(String),
}

impl NodeError {
    /// Whether the same call can reasonably succeed on a later cycle
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transport(_) | Self::NotFound(_))
    }

    pub(crate) fn from_rpc(code: i64, message: String) -> Self {
        if code == RPC_INVALID_PARAMETER || code == RPC_INVALID_ADDRESS_OR_KEY {
            Self::NotFound(message)
        } else {
            Self::Rpc { code, message }
        }
    }
}

impl From<reqwest::Error> for NodeError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

/// What disagreed between a source bundle and its assembled entities
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegrityKind {
    InputCount,
    OutputCount,
    MissingTransaction,
    StoredBlock,
}

impl fmt::Display for IntegrityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IntegrityKind::InputCount => write!(f, "inputs"),
            IntegrityKind::OutputCount => write!(f, "outputs"),
            IntegrityKind::MissingTransaction => write!(f, "missing transaction"),
            IntegrityKind::StoredBlock => write!(f, "stored block"),
        }
    }
}

/// A count mismatch between assembled and source data.
///
/// Recorded for later inspection; never aborts an import.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("integrity mismatch ({kind}) on {subject}: expected {expected}, got {actual}")]
pub struct IntegrityWarning {
    pub subject: String,
    pub kind: IntegrityKind,
    pub expected: usize,
    pub actual: usize,
}
