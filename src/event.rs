//! Event envelope types shared by the store boundary, the command
//! side and the projection side.
//!
//! Per-stream ordering is carried by [`RecordedEvent::revision`]
//! (monotonic within one aggregate, starting at 0). Cross-stream
//! catch-up ordering is carried by [`StreamPosition`], the global
//! append order assigned by the store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::keys::TenantId;

/// Identifies one aggregate's stream, e.g. `delivery-t1-<uuid>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(category: &str, tail: impl std::fmt::Display) -> Self {
        Self(format!("{category}-{tail}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn has_prefix(&self, prefix: &str) -> bool {
        self.0.starts_with(prefix)
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Global position in the store's append order. Checkpoints record
/// the position of the last processed event.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct StreamPosition(pub u64);

impl StreamPosition {
    pub const START: Self = Self(0);

    /// Position immediately after this one, for resuming a
    /// subscription past its checkpoint.
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Optimistic-concurrency guard for appends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedRevision {
    /// The stream must not exist yet.
    NoStream,
    /// The stream's last committed revision must be exactly this.
    Exact(u64),
}

/// Metadata attached to every committed event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub tenant: TenantId,
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    /// Identity of the actor that issued the command.
    pub actor: Option<String>,
    pub schema_version: u16,
    pub occurred_at: DateTime<Utc>,
}

impl EventMetadata {
    pub fn new(tenant: TenantId) -> Self {
        Self {
            tenant,
            correlation_id: None,
            causation_id: None,
            actor: None,
            schema_version: 1,
            occurred_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: Option<Uuid>) -> Self {
        self.correlation_id = correlation_id;
        self
    }

    #[must_use]
    pub fn with_causation_id(mut self, causation_id: Option<Uuid>) -> Self {
        self.causation_id = causation_id;
        self
    }

    #[must_use]
    pub fn with_actor(mut self, actor: Option<String>) -> Self {
        self.actor = actor;
        self
    }
}

/// An event prepared for appending; the store assigns revision and
/// global position on commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    pub event_type: String,
    pub data: Value,
    pub metadata: EventMetadata,
}

/// A committed, immutable event as read back from the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub stream_id: StreamId,
    /// Monotonic revision within the stream, starting at 0.
    pub revision: u64,
    /// Global append-order position.
    pub position: StreamPosition,
    pub event_type: String,
    pub data: Value,
    pub metadata: EventMetadata,
}
