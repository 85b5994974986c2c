//! Error types for the subscription engine.

use crate::types::{DocumentId, NodeTag, RaftIndex};
use std::collections::BTreeMap;
use thiserror::Error;

/// Main error type.
///
/// The subscription variants mirror the statuses a connection reports to its
/// client; see [`SubscriptionError::is_transport`] for the ones treated as
/// plain cancellation.
#[derive(Debug, Error)]
pub enum SubscriptionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Subscription '{0}' does not exist")]
    DoesNotExist(String),

    #[error("Database '{0}' does not exist")]
    DatabaseDoesNotExist(String),

    /// This node is not responsible for the subscription.
    #[error("{message}")]
    DoesNotBelongToNode {
        message: String,
        appropriate_node: Option<NodeTag>,
        reasons: BTreeMap<String, String>,
        index: RaftIndex,
    },

    #[error("{message}")]
    Closed {
        message: String,
        can_reconnect: bool,
        no_docs_left: bool,
    },

    #[error("{0}")]
    InvalidState(String),

    #[error("{0}")]
    InUse(String),

    /// Transient: the client should reconnect right away.
    #[error("{0}")]
    ChangeVectorUpdateConcurrency(String),

    #[error("Script failed for document '{id}': {message}")]
    Script { id: DocumentId, message: String },

    #[error("Subscriber failed to process batch: {0}")]
    Subscriber(String),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error("Connection is down: {0}")]
    ConnectionDown(String),

    #[error("Invalid change vector: '{0}'")]
    InvalidChangeVector(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Corruption detected: {0}")]
    Corruption(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Journal is locked by another process")]
    Locked,

    #[error("Invalid journal format: {0}")]
    InvalidFormat(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl SubscriptionError {
    /// Shorthand for a non-reconnectable closure.
    pub fn closed(message: impl Into<String>) -> Self {
        SubscriptionError::Closed {
            message: message.into(),
            can_reconnect: false,
            no_docs_left: false,
        }
    }

    /// Client disconnects and cancellations: recovery relies on the
    /// persisted resend queue, not on error reporting.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SubscriptionError::Cancelled
                | SubscriptionError::ConnectionDown(_)
                | SubscriptionError::Io(_)
        )
    }
}

impl From<serde_json::Error> for SubscriptionError {
    fn from(e: serde_json::Error) -> Self {
        SubscriptionError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for SubscriptionError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        SubscriptionError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for SubscriptionError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        SubscriptionError::Deserialization(e.to_string())
    }
}

/// Result type for subscription operations.
pub type Result<T> = std::result::Result<T, SubscriptionError>;
