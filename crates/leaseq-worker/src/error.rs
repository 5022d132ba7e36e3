//! Error types for queue coordination.
//!
//! Store failures are wrapped with the protocol step that hit them and the
//! record involved, if any. Errors are `Clone` so the same value can be
//! returned to a caller and forwarded on the event channel.

use std::{fmt, time::Duration};

use leaseq_core::{CoreError, RecordId};
use thiserror::Error;

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, WorkerError>;

/// Protocol step during which an error occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Selecting and taking ownership of a record.
    Claim,
    /// Renewing a held lease.
    Heartbeat,
    /// Releasing a record for redelivery.
    Requeue,
    /// Deleting a finished record.
    Complete,
    /// Releasing expired leases.
    Reclaim,
    /// Inserting or flagging a record from the producer side.
    Send,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Claim => write!(f, "claim"),
            Self::Heartbeat => write!(f, "heartbeat"),
            Self::Requeue => write!(f, "requeue"),
            Self::Complete => write!(f, "complete"),
            Self::Reclaim => write!(f, "reclaim"),
            Self::Send => write!(f, "send"),
        }
    }
}

/// Errors surfaced by the worker controller and producer.
#[derive(Debug, Clone, Error)]
pub enum WorkerError {
    /// A store call failed.
    #[error("store error during {operation}: {message}")]
    Store {
        /// Step that issued the call
        operation: Operation,
        /// Record the call targeted, if it targeted one
        record: Option<RecordId>,
        /// Store error message
        message: String,
        /// Whether the store classified the failure as transient
        transient: bool,
    },

    /// A heartbeat matched no record held by this worker.
    #[error("lease lost on record {id}")]
    LeaseLost {
        /// Record whose lease is gone
        id: RecordId,
    },

    /// The insert/flag alternation hit its cycle bound.
    #[error("could not send record {id} after {cycles} cycles")]
    SendExhausted {
        /// Digest of the payload that could not be sent
        id: RecordId,
        /// Number of insert/flag cycles attempted
        cycles: u32,
    },

    /// A payload could not be encoded or decoded.
    #[error("payload serialization failed: {message}")]
    Serialization {
        /// Serializer error message
        message: String,
    },

    /// Invalid worker configuration.
    #[error("invalid worker configuration: {message}")]
    Configuration {
        /// Configuration error message
        message: String,
    },

    /// Background loops did not stop within the shutdown timeout.
    #[error("worker shutdown timed out after {timeout:?}")]
    ShutdownTimeout {
        /// Timeout that was exceeded
        timeout: Duration,
    },
}

impl WorkerError {
    /// Wraps a store error with the step and record it belongs to.
    pub fn store(operation: Operation, record: Option<&RecordId>, error: &CoreError) -> Self {
        Self::Store {
            operation,
            record: record.cloned(),
            message: error.to_string(),
            transient: error.is_transient(),
        }
    }

    /// Creates a lease lost error.
    pub fn lease_lost(id: RecordId) -> Self {
        Self::LeaseLost { id }
    }

    /// Creates a send exhausted error.
    pub fn send_exhausted(id: RecordId, cycles: u32) -> Self {
        Self::SendExhausted { id, cycles }
    }

    /// Creates a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into() }
    }

    /// Creates a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Record this error concerns, when there is one.
    pub fn record(&self) -> Option<&RecordId> {
        match self {
            Self::Store { record, .. } => record.as_ref(),
            Self::LeaseLost { id } | Self::SendExhausted { id, .. } => Some(id),
            _ => None,
        }
    }

    /// Whether repeating the same call later may succeed.
    ///
    /// Transient store failures are; a lost lease, an exhausted send and
    /// configuration problems are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Store { transient, .. } => *transient,
            Self::ShutdownTimeout { .. } => true,
            Self::LeaseLost { .. }
            | Self::SendExhausted { .. }
            | Self::Serialization { .. }
            | Self::Configuration { .. } => false,
        }
    }
}

impl From<serde_json::Error> for WorkerError {
    fn from(error: serde_json::Error) -> Self {
        Self::serialization(error.to_string())
    }
}
