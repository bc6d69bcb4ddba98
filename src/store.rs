//! Event store boundary.
//!
//! The store itself is an external collaborator: an append-only,
//! per-stream-ordered, revision-numbered log with prefix catch-up
//! reads. This trait pins down the exact contract the rest of the
//! crate relies on; [`crate::testing::InMemoryEventStore`] provides
//! the in-process implementation used by tests.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::StoreError;
use crate::event::{ExpectedRevision, NewEvent, RecordedEvent, StreamId, StreamPosition};

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Append events to one stream under an expected-revision guard.
    ///
    /// Returns the revision of the last appended event. Exactly one
    /// concurrent writer succeeds per revision; the rest receive
    /// [`StoreError::Conflict`] and must reload before retrying. A
    /// timeout is reported as [`StoreError::UnknownOutcome`] because
    /// the write may have landed.
    async fn append_to_stream(
        &self,
        stream: &StreamId,
        expected: ExpectedRevision,
        events: Vec<NewEvent>,
    ) -> Result<u64, StoreError>;

    /// Read one stream's full committed history in revision order.
    /// Returns an empty vector for a stream that does not exist.
    async fn read_stream(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>, StoreError>;

    /// Read up to `limit` committed events at or after `from`,
    /// filtered to streams matching any of `prefixes`, in global
    /// append order. The catch-up runner's only read path.
    async fn read_by_prefix(
        &self,
        prefixes: &[String],
        from: StreamPosition,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, StoreError>;
}

/// Applies a per-call deadline to every store operation.
///
/// An elapsed append surfaces as [`StoreError::UnknownOutcome`]: the
/// write may have landed, so the caller must re-read the stream's
/// actual revision before retrying. Elapsed reads are plain
/// transient failures and safe to retry as-is.
pub struct TimeoutStore<S> {
    inner: S,
    op_timeout: Duration,
}

impl<S> TimeoutStore<S> {
    pub fn new(inner: S, op_timeout: Duration) -> Self {
        Self { inner, op_timeout }
    }
}

#[async_trait]
impl<S: EventStore> EventStore for TimeoutStore<S> {
    async fn append_to_stream(
        &self,
        stream: &StreamId,
        expected: ExpectedRevision,
        events: Vec<NewEvent>,
    ) -> Result<u64, StoreError> {
        let append = self.inner.append_to_stream(stream, expected, events);
        match tokio::time::timeout(self.op_timeout, append).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::UnknownOutcome {
                stream: stream.to_string(),
            }),
        }
    }

    async fn read_stream(&self, stream: &StreamId) -> Result<Vec<RecordedEvent>, StoreError> {
        match tokio::time::timeout(self.op_timeout, self.inner.read_stream(stream)).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Transient(format!(
                "read of stream {stream} timed out"
            ))),
        }
    }

    async fn read_by_prefix(
        &self,
        prefixes: &[String],
        from: StreamPosition,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, StoreError> {
        let read = self.inner.read_by_prefix(prefixes, from, limit);
        match tokio::time::timeout(self.op_timeout, read).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Transient("prefix read timed out".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMetadata;
    use crate::keys::TenantId;
    use crate::testing::InMemoryEventStore;

    /// Never answers within any reasonable deadline.
    struct StallStore;

    #[async_trait]
    impl EventStore for StallStore {
        async fn append_to_stream(
            &self,
            _stream: &StreamId,
            _expected: ExpectedRevision,
            _events: Vec<NewEvent>,
        ) -> Result<u64, StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(StoreError::Backend("stalled".to_string()))
        }

        async fn read_stream(&self, _stream: &StreamId) -> Result<Vec<RecordedEvent>, StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(StoreError::Backend("stalled".to_string()))
        }

        async fn read_by_prefix(
            &self,
            _prefixes: &[String],
            _from: StreamPosition,
            _limit: usize,
        ) -> Result<Vec<RecordedEvent>, StoreError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(StoreError::Backend("stalled".to_string()))
        }
    }

    fn new_event() -> NewEvent {
        NewEvent {
            event_type: "Requested".to_string(),
            data: serde_json::Value::Null,
            metadata: EventMetadata::new(TenantId::new("t1").unwrap()),
        }
    }

    #[tokio::test]
    async fn elapsed_append_reports_an_unknown_outcome() {
        let store = TimeoutStore::new(StallStore, Duration::from_millis(5));

        let err = store
            .append_to_stream(
                &StreamId::new("delivery", "t1-r1"),
                ExpectedRevision::NoStream,
                vec![new_event()],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::UnknownOutcome { .. }));
    }

    #[tokio::test]
    async fn elapsed_reads_are_transient() {
        let store = TimeoutStore::new(StallStore, Duration::from_millis(5));

        let err = store
            .read_stream(&StreamId::new("delivery", "t1-r1"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transient(_)));

        let err = store
            .read_by_prefix(&["delivery-".to_string()], StreamPosition::START, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Transient(_)));
    }

    #[tokio::test]
    async fn calls_within_the_deadline_pass_through() {
        let store = TimeoutStore::new(InMemoryEventStore::new(), Duration::from_secs(5));
        let stream = StreamId::new("delivery", "t1-r1");

        let revision = store
            .append_to_stream(&stream, ExpectedRevision::NoStream, vec![new_event()])
            .await
            .unwrap();
        assert_eq!(revision, 0);

        let read = store.read_stream(&stream).await.unwrap();
        assert_eq!(read.len(), 1);
    }
}
