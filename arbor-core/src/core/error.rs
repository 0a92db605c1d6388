//! Error types for the Arbor replication core.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors that can occur within the Arbor replication core.
#[derive(Debug, Error)]
pub enum ArborError {
    /// A SQLite operation failed.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// An I/O operation on the filesystem failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be serialised to or from JSON.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The opened file is not a valid Arbor replica.
    #[error("Invalid replica: {0}")]
    InvalidReplica(String),

    /// Replication has no peer address configured.
    #[error("Sync is not configured: {0}")]
    NotConfigured(String),

    /// The peer could not be reached (refused connection, gateway failure, ...).
    #[error("Transport error: {0}")]
    Transport(String),

    /// A round trip did not complete before the attempt deadline.
    #[error("Timed out: {0}")]
    Timeout(String),

    /// The peer rejected the request or answered with something unexpected.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Login failed: bad signature, clock skew or missing session.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The configured peer turned out to be this very replica.
    #[error("Peer instance id {0} is the local instance id; refusing to sync with itself")]
    SelfSync(String),

    /// Sector hashes kept disagreeing after repeated re-queues.
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// An entity referenced by a change row does not exist.
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// An entity row or entity type could not be interpreted.
    #[error("Invalid entity: {0}")]
    InvalidEntity(String),

    /// Encrypting or decrypting protected content failed.
    #[error("Crypto error: {0}")]
    Crypto(String),
}

/// Convenience alias that pins the error type to [`ArborError`].
pub type Result<T> = std::result::Result<T, ArborError>;

/// Coarse classification of a failed sync attempt, reported to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureKind {
    /// Replication target not set up; nothing is retried until reconfigured.
    Configuration,
    /// The peer was unreachable; the next scheduled attempt retries.
    Transport,
    /// Version mismatch, bad credentials or self-sync; needs an operator.
    Protocol,
    /// Sector hashes did not converge.
    Consistency,
    /// Anything else (local database, serialisation, ...).
    Internal,
}

impl ArborError {
    /// Returns a short, human-readable message suitable for display to the end user.
    #[must_use]
    pub fn user_message(&self) -> String {
        match self {
            Self::Database(e) => format!("Failed to save: {e}"),
            Self::Io(e) => format!("File error: {e}"),
            Self::Json(e) => format!("Data format error: {e}"),
            Self::InvalidReplica(_) => "Could not open the note database".to_string(),
            Self::NotConfigured(_) => "Sync server is not configured".to_string(),
            Self::Transport(_) | Self::Timeout(_) => {
                "Sync server could not be reached, will retry later".to_string()
            }
            Self::Protocol(msg) => format!("Sync server rejected the request: {msg}"),
            Self::Unauthorized(_) => "Sync login failed, check the sync setup".to_string(),
            Self::SelfSync(_) => "Sync server address points at this instance".to_string(),
            Self::Consistency(msg) => format!("Replicas did not converge: {msg}"),
            Self::EntityNotFound(id) => format!("Entity {id} no longer exists"),
            Self::InvalidEntity(msg) => msg.clone(),
            Self::Crypto(_) => "Protected content could not be processed".to_string(),
        }
    }

    /// Maps the error onto the failure taxonomy reported by a sync attempt.
    #[must_use]
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::NotConfigured(_) => FailureKind::Configuration,
            Self::Transport(_) | Self::Timeout(_) => FailureKind::Transport,
            Self::Protocol(_) | Self::Unauthorized(_) | Self::SelfSync(_) => FailureKind::Protocol,
            Self::Consistency(_) => FailureKind::Consistency,
            _ => FailureKind::Internal,
        }
    }
}
