//! Error types with one enum per failure domain instead of a single
//! grab-bag. Command rejection, store infrastructure, cache
//! infrastructure and projection failures stay separate so callers
//! can tell "do not retry" from "reload and retry" from "back off".

use crate::delivery::InvariantViolation;
use crate::event::ExpectedRevision;

/// Failures surfaced to business-command callers.
///
/// `NotFound` and `Invariant` are final: retrying the same command
/// cannot succeed. `Conflict` means another writer committed first;
/// the caller reloads and reapplies. Commands never retry
/// internally.
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("delivery request {entity_id} not found for tenant {tenant}")]
    NotFound { tenant: String, entity_id: String },

    #[error(transparent)]
    Invariant(#[from] InvariantViolation),

    #[error(
        "concurrent writer committed stream {stream} first (expected {expected:?}, found {actual:?})"
    )]
    Conflict {
        stream: String,
        expected: ExpectedRevision,
        actual: Option<u64>,
    },

    #[error("event store failure: {0}")]
    Store(StoreError),
}

impl From<StoreError> for CommandError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict {
                stream,
                expected,
                actual,
            } => Self::Conflict {
                stream,
                expected,
                actual,
            },
            other => Self::Store(other),
        }
    }
}

/// Event store infrastructure failures.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("version conflict on stream {stream}: expected {expected:?}, found {actual:?}")]
    Conflict {
        stream: String,
        expected: ExpectedRevision,
        actual: Option<u64>,
    },

    /// The append may or may not have committed. The caller must
    /// re-read the stream's actual revision before retrying.
    #[error("append outcome unknown for stream {stream}; re-read before retrying")]
    UnknownOutcome { stream: String },

    #[error("transient store failure: {0}")]
    Transient(String),

    #[error("store backend failure: {0}")]
    Backend(String),

    #[error("event codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Cache infrastructure failures. Version-guard rejections are not
/// errors; they are reported through the versioned-write outcome.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("transient cache failure: {0}")]
    Transient(String),

    #[error("cache backend failure: {0}")]
    Backend(String),

    #[error("cache codec failure: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Failures while applying one event to the read model.
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("cannot decode event {event_type} at revision {revision}: {source}")]
    Decode {
        event_type: String,
        revision: u64,
        source: serde_json::Error,
    },

    #[error("stream {stream} does not match the delivery stream layout")]
    MalformedStream { stream: String },

    #[error("row key {row_key} and index key {index_key} do not share a cluster slot")]
    SlotMismatch { row_key: String, index_key: String },

    #[error("cache failure: {0}")]
    Cache(#[from] CacheError),
}
