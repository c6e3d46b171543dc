use thiserror::Error;

use crate::types::{RestorationId, TransferId, TransferState};

/// Result type for transfer engine operations
pub type TransferResult<T> = Result<T, TransferError>;

/// Errors surfaced by the transfer engine's public API
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    /// The start request was rejected before any record was created
    #[error("Planning error: {0}")]
    Planning(String),

    #[error("Transfer not found: {0}")]
    NotFound(TransferId),

    #[error("Cannot {action} transfer {id} while it is {from}")]
    InvalidTransition {
        id: TransferId,
        from: TransferState,
        action: &'static str,
    },

    /// Only the network gate may lift a policy pause
    #[error("Transfer {0} is paused by network policy")]
    PolicyPaused(TransferId),

    #[error("Restoration ID mismatch: engine owns {expected}, requested {got}")]
    RestorationMismatch {
        expected: RestorationId,
        got: RestorationId,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Local I/O error: {0}")]
    LocalIo(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Engine has been shut down")]
    Shutdown,
}

impl TransferError {
    /// Create a planning error
    pub fn planning(message: impl Into<String>) -> Self {
        Self::Planning(message.into())
    }

    /// Create a persistence error
    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence(message.into())
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub(crate) fn invalid(id: &TransferId, from: TransferState, action: &'static str) -> Self {
        Self::InvalidTransition {
            id: id.clone(),
            from,
            action,
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(err: std::io::Error) -> Self {
        Self::LocalIo(err.to_string())
    }
}

impl From<serde_json::Error> for TransferError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Failure reported by a [`ChunkTransport`](crate::transport::ChunkTransport) call
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// Network blip, timeout, throttling or 5xx-class response
    #[error("Transient transport error: {0}")]
    Transient(String),

    /// Authentication failure or 4xx-class response other than throttling
    #[error("Permanent transport error: {0}")]
    Permanent(String),
}

impl TransportError {
    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Classify an HTTP status code returned by the blob endpoint
    pub fn from_status(status: u16, msg: impl Into<String>) -> Self {
        let msg = format!("HTTP {}: {}", status, msg.into());
        match status {
            408 | 429 | 500..=599 => Self::Transient(msg),
            _ => Self::Permanent(msg),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Outcome of a single chunk operation attempt - determines retry behavior
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChunkError {
    /// Retried automatically until the attempt budget is spent
    #[error("Transient error: {0}")]
    Transient(String),

    /// Fails the chunk immediately
    #[error("Permanent error: {0}")]
    Permanent(String),

    /// Disk full, permission denied and friends; never retried
    #[error("Local I/O error: {0}")]
    LocalIo(String),
}

impl ChunkError {
    /// Create a transient error
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a permanent error
    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        match self {
            Self::Transient(msg) | Self::Permanent(msg) | Self::LocalIo(msg) => msg,
        }
    }
}

impl From<TransportError> for ChunkError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Transient(msg) => Self::Transient(msg),
            TransportError::Permanent(msg) => Self::Permanent(msg),
        }
    }
}

impl From<std::io::Error> for ChunkError {
    fn from(err: std::io::Error) -> Self {
        Self::LocalIo(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert!(TransportError::from_status(503, "busy").is_transient());
        assert!(TransportError::from_status(429, "slow down").is_transient());
        assert!(TransportError::from_status(408, "timeout").is_transient());
        assert!(!TransportError::from_status(403, "auth").is_transient());
        assert!(!TransportError::from_status(404, "missing").is_transient());
    }

    #[test]
    fn test_chunk_error_retryability() {
        let transient: ChunkError = TransportError::transient("reset").into();
        let permanent: ChunkError = TransportError::permanent("denied").into();
        let local: ChunkError = std::io::Error::new(std::io::ErrorKind::Other, "disk full").into();

        assert!(transient.is_retryable());
        assert!(!permanent.is_retryable());
        assert!(!local.is_retryable());
        assert_eq!(local.message(), "disk full");
    }
}
