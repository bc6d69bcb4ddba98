//! In-memory doubles for the external collaborators: the event
//! store, the cache, checkpoints and the job queue. Used by unit and
//! integration tests; they implement the same traits as the real
//! backends, including version guards, TTL expiry and
//! expected-revision conflicts.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use crate::cache::{ProjectionCache, RowOp, VersionedWrite, VersionedWriteOutcome};
use crate::checkpoint::{CheckpointError, CheckpointStore, SubscriptionGroup};
use crate::delivery::{DeliveryEvent, DeliveryId, DeliveryRequest};
use crate::dispatch::{DeliveryJob, JobQueue, QueueError};
use crate::error::{CacheError, StoreError};
use crate::event::{ExpectedRevision, NewEvent, RecordedEvent, StreamId, StreamPosition};
use crate::keys::{CacheKey, TenantId};
use crate::store::EventStore;

/// Rebuild aggregate state from raw history, the way command
/// handlers do.
pub fn replay(id: DeliveryId, tenant: TenantId, events: &[DeliveryEvent]) -> Option<DeliveryRequest> {
    DeliveryRequest::reconstitute(id, tenant, events)
}

#[derive(Debug, Default)]
struct StoreState {
    log: Vec<RecordedEvent>,
    // Next revision per stream; a present entry means the stream exists.
    streams: HashMap<String, u64>,
}

/// Append-only event store with a single global log, per-stream
/// revisions and expected-revision conflict detection.
#[derive(Debug, Clone, Default)]
pub struct InMemoryEventStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of committed events across all streams.
    pub fn committed(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .log
            .len()
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append_to_stream(
        &self,
        stream: &StreamId,
        expected: ExpectedRevision,
        events: Vec<NewEvent>,
    ) -> Result<u64, StoreError> {
        if events.is_empty() {
            return Err(StoreError::Backend(format!(
                "empty append to stream {stream}"
            )));
        }

        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        let next_revision = state.streams.get(stream.as_str()).copied();
        let actual = next_revision.map(|next| next - 1);

        let valid = match (expected, next_revision) {
            (ExpectedRevision::NoStream, None) => true,
            (ExpectedRevision::Exact(revision), Some(_)) => actual == Some(revision),
            _ => false,
        };

        if !valid {
            return Err(StoreError::Conflict {
                stream: stream.to_string(),
                expected,
                actual,
            });
        }

        let mut revision = next_revision.unwrap_or(0);
        for event in events {
            let position = StreamPosition(state.log.len() as u64);
            state.log.push(RecordedEvent {
                stream_id: stream.clone(),
                revision,
                position,
                event_type: event.event_type,
                data: event.data,
                metadata: event.metadata,
            });
            revision += 1;
        }

        state.streams.insert(stream.as_str().to_string(), revision);
        Ok(revision - 1)
    }

    async fn read_stream(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>, StoreError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        Ok(state
            .log
            .iter()
            .filter(|event| &event.stream_id == stream)
            .cloned()
            .collect())
    }

    async fn read_by_prefix(
        &self,
        prefixes: &[String],
        from: StreamPosition,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);

        Ok(state
            .log
            .iter()
            .filter(|event| event.position >= from)
            .filter(|event| prefixes.iter().any(|prefix| event.stream_id.has_prefix(prefix)))
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Store wrapper that commits the next append but loses its
/// acknowledgement, reporting [`StoreError::UnknownOutcome`] the way
/// a timed-out append does after the write already landed. Callers
/// must resolve it by re-reading the stream, never by blind retry.
#[derive(Debug, Clone, Default)]
pub struct UnreliableEventStore {
    inner: InMemoryEventStore,
    lose_next_ack: Arc<Mutex<bool>>,
}

impl UnreliableEventStore {
    pub fn new(inner: InMemoryEventStore) -> Self {
        Self {
            inner,
            lose_next_ack: Arc::new(Mutex::new(false)),
        }
    }

    /// Arm the wrapper: the next successful append commits but
    /// answers with an unknown outcome.
    pub fn lose_next_append_ack(&self) {
        *self.lose_next_ack.lock().unwrap_or_else(PoisonError::into_inner) = true;
    }
}

#[async_trait]
impl EventStore for UnreliableEventStore {
    async fn append_to_stream(
        &self,
        stream: &StreamId,
        expected: ExpectedRevision,
        events: Vec<NewEvent>,
    ) -> Result<u64, StoreError> {
        let lose_ack = {
            let mut flag = self.lose_next_ack.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *flag)
        };

        let revision = self.inner.append_to_stream(stream, expected, events).await?;

        if lose_ack {
            return Err(StoreError::UnknownOutcome {
                stream: stream.to_string(),
            });
        }
        Ok(revision)
    }

    async fn read_stream(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>, StoreError> {
        self.inner.read_stream(stream).await
    }

    async fn read_by_prefix(
        &self,
        prefixes: &[String],
        from: StreamPosition,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        self.inner.read_by_prefix(prefixes, from, limit).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CacheValue {
    Str(String),
    Hash(BTreeMap<String, String>),
    Set(BTreeSet<String>),
}

#[derive(Debug, Clone)]
struct CacheEntry {
    value: CacheValue,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Key-value double with string, hash and set values, TTL expiry,
/// atomic set-if-absent and the guarded versioned write.
#[derive(Debug, Default)]
pub struct InMemoryCache {
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl InMemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, CacheEntry>,
        key: &CacheKey,
    ) -> Option<&'a CacheEntry> {
        if entries.get(key.as_str()).is_some_and(CacheEntry::is_expired) {
            entries.remove(key.as_str());
        }
        entries.get(key.as_str())
    }
}

#[async_trait]
impl ProjectionCache for InMemoryCache {
    async fn set_if_absent(
        &self,
        key: &CacheKey,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        if Self::live(&mut entries, key).is_some() {
            return Ok(false);
        }

        entries.insert(
            key.as_str().to_string(),
            CacheEntry {
                value: CacheValue::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(true)
    }

    async fn get(&self, key: &CacheKey) -> Result<Option<String>, CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        match Self::live(&mut entries, key) {
            Some(CacheEntry {
                value: CacheValue::Str(value),
                ..
            }) => Ok(Some(value.clone())),
            Some(_) => Err(CacheError::Backend(format!(
                "key {key} does not hold a string"
            ))),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(
        &self,
        key: &CacheKey,
        value: &str,
        ttl: Duration,
    ) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        entries.insert(
            key.as_str().to_string(),
            CacheEntry {
                value: CacheValue::Str(value.to_string()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.remove(key.as_str());
        Ok(())
    }

    async fn get_row(
        &self,
        key: &CacheKey,
    ) -> Result<Option<BTreeMap<String, String>>, CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        match Self::live(&mut entries, key) {
            Some(CacheEntry {
                value: CacheValue::Hash(fields),
                ..
            }) => Ok(Some(fields.clone())),
            Some(_) => Err(CacheError::Backend(format!("key {key} does not hold a hash"))),
            None => Ok(None),
        }
    }

    async fn index_members(&self, key: &CacheKey) -> Result<Vec<String>, CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        match Self::live(&mut entries, key) {
            Some(CacheEntry {
                value: CacheValue::Set(members),
                ..
            }) => Ok(members.iter().cloned().collect()),
            Some(_) => Err(CacheError::Backend(format!("key {key} does not hold a set"))),
            None => Ok(Vec::new()),
        }
    }

    async fn apply_versioned(
        &self,
        write: &VersionedWrite,
    ) -> Result<VersionedWriteOutcome, CacheError> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let mut row = match Self::live(&mut entries, write.row_key()) {
            Some(CacheEntry {
                value: CacheValue::Hash(fields),
                ..
            }) => {
                match fields.get("version").map(|raw| raw.parse::<u64>()) {
                    Some(Ok(stored)) => {
                        if stored >= write.revision() {
                            return Ok(VersionedWriteOutcome::RejectedStale { stored });
                        }
                    }
                    Some(Err(_)) | None => {
                        return Ok(VersionedWriteOutcome::Unrecognized {
                            detail: format!(
                                "row {} holds no readable version field",
                                write.row_key()
                            ),
                        });
                    }
                }
                fields.clone()
            }
            Some(_) => {
                return Ok(VersionedWriteOutcome::Unrecognized {
                    detail: format!("row {} does not hold a hash", write.row_key()),
                });
            }
            None => BTreeMap::new(),
        };

        // Both target shapes are checked before any mutation, so a
        // rejected write leaves the cache untouched.
        match Self::live(&mut entries, write.index_key()) {
            None
            | Some(CacheEntry {
                value: CacheValue::Set(_),
                ..
            }) => {}
            Some(_) => {
                return Ok(VersionedWriteOutcome::Unrecognized {
                    detail: format!("index {} does not hold a set", write.index_key()),
                });
            }
        }

        let (fields, add_to_index) = match write.op() {
            RowOp::Upsert { fields } => (fields, true),
            RowOp::SoftDelete { fields } => (fields, false),
        };
        row.extend(fields.clone());

        entries.insert(
            write.row_key().as_str().to_string(),
            CacheEntry {
                value: CacheValue::Hash(row),
                expires_at: None,
            },
        );

        let index = entries
            .entry(write.index_key().as_str().to_string())
            .or_insert_with(|| CacheEntry {
                value: CacheValue::Set(BTreeSet::new()),
                expires_at: None,
            });
        if let CacheValue::Set(members) = &mut index.value {
            if add_to_index {
                members.insert(write.entity_id().to_string());
            } else {
                members.remove(write.entity_id());
            }
        }

        Ok(VersionedWriteOutcome::Committed)
    }
}

/// Checkpoint store backed by a map, for runner tests that do not
/// need SQLite.
#[derive(Debug, Default)]
pub struct InMemoryCheckpoints {
    positions: Mutex<HashMap<String, StreamPosition>>,
}

impl InMemoryCheckpoints {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpoints {
    async fn load(
        &self,
        group: &SubscriptionGroup,
    ) -> Result<Option<StreamPosition>, CheckpointError> {
        let positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(positions.get(group.as_str()).copied())
    }

    async fn save(
        &self,
        group: &SubscriptionGroup,
        position: StreamPosition,
    ) -> Result<(), CheckpointError> {
        let mut positions = self.positions.lock().unwrap_or_else(PoisonError::into_inner);
        positions.insert(group.as_str().to_string(), position);
        Ok(())
    }
}

/// Queue double that records every enqueued job.
#[derive(Debug, Default)]
pub struct RecordingQueue {
    jobs: Mutex<Vec<DeliveryJob>>,
}

impl RecordingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn jobs(&self) -> Vec<DeliveryJob> {
        self.jobs
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl JobQueue for RecordingQueue {
    async fn enqueue(&self, job: DeliveryJob) -> Result<(), QueueError> {
        let mut jobs = self.jobs.lock().unwrap_or_else(PoisonError::into_inner);
        jobs.push(job);
        Ok(())
    }
}
