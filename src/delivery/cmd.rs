//! Business-command entry points for delivery requests.
//!
//! Each method loads and reconstitutes the aggregate, runs one
//! command, and persists the resulting event with an
//! expected-version append. A version conflict means another writer
//! committed first; it is surfaced as a retryable
//! [`CommandError::Conflict`] and never retried here; only the caller
//! knows whether reload-and-retry is safe.

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{CommandError, StoreError};
use crate::event::{EventMetadata, ExpectedRevision, StreamId};
use crate::keys::TenantId;
use crate::store::EventStore;

use super::{DeliveryEvent, DeliveryId, DeliveryRequest, FailureDetail, SentDetail};

/// Stream prefix the catch-up runner subscribes to.
pub const DELIVERY_STREAM_PREFIX: &str = "delivery-";

/// Stream identity for one delivery request:
/// `delivery-<tenant>-<id>`.
pub fn delivery_stream(tenant: &TenantId, id: &DeliveryId) -> StreamId {
    StreamId::new("delivery", format!("{tenant}-{id}"))
}

/// Caller-supplied tracing identity attached to emitted events.
#[derive(Debug, Clone, Default)]
pub struct CallerContext {
    pub correlation_id: Option<Uuid>,
    pub causation_id: Option<Uuid>,
    pub actor: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RequestDelivery {
    pub id: DeliveryId,
    pub tenant: TenantId,
    pub channel: String,
    pub context: CallerContext,
}

#[derive(Debug, Clone)]
pub struct MarkValidated {
    pub id: DeliveryId,
    pub tenant: TenantId,
    pub context: CallerContext,
}

#[derive(Debug, Clone)]
pub struct MarkQueued {
    pub id: DeliveryId,
    pub tenant: TenantId,
    pub context: CallerContext,
}

#[derive(Debug, Clone)]
pub struct RecordSent {
    pub id: DeliveryId,
    pub tenant: TenantId,
    pub ts: String,
    pub channel: String,
    pub attempts: u32,
    pub context: CallerContext,
}

#[derive(Debug, Clone)]
pub struct RecordFailed {
    pub id: DeliveryId,
    pub tenant: TenantId,
    pub reason: String,
    pub attempts: u32,
    pub retryable: bool,
    pub last_error: Option<String>,
    pub context: CallerContext,
}

pub struct DeliveryCommandService<S> {
    store: S,
}

impl<S: EventStore> DeliveryCommandService<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Create a new delivery request. Fails with a conflict if the
    /// stream already exists.
    #[tracing::instrument(skip_all, fields(tenant = %cmd.tenant, id = %cmd.id))]
    pub async fn request(&self, cmd: RequestDelivery) -> Result<DeliveryRequest, CommandError> {
        let stream = delivery_stream(&cmd.tenant, &cmd.id);
        let (aggregate, event) =
            DeliveryRequest::request(cmd.id, cmd.tenant.clone(), cmd.channel);

        let new_event = event
            .to_new_event(metadata(cmd.tenant, &cmd.context))
            .map_err(StoreError::Codec)?;

        self.store
            .append_to_stream(&stream, ExpectedRevision::NoStream, vec![new_event])
            .await?;

        info!(stream = %stream, "Delivery requested");
        Ok(aggregate)
    }

    #[tracing::instrument(skip_all, fields(tenant = %cmd.tenant, id = %cmd.id))]
    pub async fn mark_validated(&self, cmd: MarkValidated) -> Result<DeliveryRequest, CommandError> {
        let mut aggregate = self.load(&cmd.tenant, cmd.id).await?;
        let prior = aggregate.version;

        let event = aggregate.mark_validated()?;
        self.commit(&cmd.tenant, &cmd.id, prior, event, &cmd.context)
            .await?;

        Ok(aggregate)
    }

    #[tracing::instrument(skip_all, fields(tenant = %cmd.tenant, id = %cmd.id))]
    pub async fn mark_queued(&self, cmd: MarkQueued) -> Result<DeliveryRequest, CommandError> {
        let mut aggregate = self.load(&cmd.tenant, cmd.id).await?;
        let prior = aggregate.version;

        let event = aggregate.mark_queued()?;
        self.commit(&cmd.tenant, &cmd.id, prior, event, &cmd.context)
            .await?;

        Ok(aggregate)
    }

    /// Record a successful delivery. Repeating the command with
    /// identical detail succeeds without committing a second event.
    #[tracing::instrument(skip_all, fields(tenant = %cmd.tenant, id = %cmd.id))]
    pub async fn record_sent(&self, cmd: RecordSent) -> Result<DeliveryRequest, CommandError> {
        let mut aggregate = self.load(&cmd.tenant, cmd.id).await?;
        let prior = aggregate.version;

        let event = aggregate.mark_sent(SentDetail {
            ts: cmd.ts,
            channel: cmd.channel,
            attempts: cmd.attempts,
        })?;
        self.commit(&cmd.tenant, &cmd.id, prior, event, &cmd.context)
            .await?;

        Ok(aggregate)
    }

    /// Record a definitive delivery failure.
    #[tracing::instrument(skip_all, fields(tenant = %cmd.tenant, id = %cmd.id))]
    pub async fn record_failed(&self, cmd: RecordFailed) -> Result<DeliveryRequest, CommandError> {
        let mut aggregate = self.load(&cmd.tenant, cmd.id).await?;
        let prior = aggregate.version;

        let event = aggregate.mark_failed(FailureDetail {
            reason: cmd.reason,
            attempts: cmd.attempts,
            retryable: cmd.retryable,
            last_error: cmd.last_error,
        })?;
        self.commit(&cmd.tenant, &cmd.id, prior, event, &cmd.context)
            .await?;

        Ok(aggregate)
    }

    /// Reconstitute the current aggregate state from its stream.
    pub async fn load(
        &self,
        tenant: &TenantId,
        id: DeliveryId,
    ) -> Result<DeliveryRequest, CommandError> {
        let stream = delivery_stream(tenant, &id);
        let recorded = self.store.read_stream(&stream).await?;

        if recorded.is_empty() {
            return Err(CommandError::NotFound {
                tenant: tenant.to_string(),
                entity_id: id.to_string(),
            });
        }

        let mut history = Vec::with_capacity(recorded.len());
        for event in &recorded {
            history.push(DeliveryEvent::from_recorded(event).map_err(StoreError::Codec)?);
        }

        DeliveryRequest::reconstitute(id, tenant.clone(), &history).ok_or_else(|| {
            CommandError::Store(StoreError::Backend(format!(
                "stream {stream} does not begin with a Requested event"
            )))
        })
    }

    async fn commit(
        &self,
        tenant: &TenantId,
        id: &DeliveryId,
        prior_version: u64,
        event: Option<DeliveryEvent>,
        context: &CallerContext,
    ) -> Result<(), CommandError> {
        let Some(event) = event else {
            debug!(tenant = %tenant, id = %id, "Command was an idempotent replay; nothing to commit");
            return Ok(());
        };

        let stream = delivery_stream(tenant, id);
        let new_event = event
            .to_new_event(metadata(tenant.clone(), context))
            .map_err(StoreError::Codec)?;

        let committed = self
            .store
            .append_to_stream(&stream, ExpectedRevision::Exact(prior_version), vec![new_event])
            .await?;

        debug!(stream = %stream, revision = committed, "Committed delivery event");
        Ok(())
    }
}

fn metadata(tenant: TenantId, context: &CallerContext) -> EventMetadata {
    EventMetadata::new(tenant)
        .with_correlation_id(context.correlation_id)
        .with_causation_id(context.causation_id)
        .with_actor(context.actor.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delivery::DeliveryStatus;
    use crate::testing::InMemoryEventStore;

    fn tenant() -> TenantId {
        TenantId::new("t1").unwrap()
    }

    fn service() -> DeliveryCommandService<InMemoryEventStore> {
        DeliveryCommandService::new(InMemoryEventStore::new())
    }

    fn record_sent(id: DeliveryId) -> RecordSent {
        RecordSent {
            id,
            tenant: tenant(),
            ts: "100.1".into(),
            channel: "#c".into(),
            attempts: 1,
            context: CallerContext::default(),
        }
    }

    #[tokio::test]
    async fn request_then_record_sent_reaches_version_one() {
        let service = service();
        let id = DeliveryId::generate();

        service
            .request(RequestDelivery {
                id,
                tenant: tenant(),
                channel: "#c".into(),
                context: CallerContext::default(),
            })
            .await
            .unwrap();

        let aggregate = service.record_sent(record_sent(id)).await.unwrap();

        assert_eq!(aggregate.status, DeliveryStatus::Sent);
        assert_eq!(aggregate.version, 1);
    }

    #[tokio::test]
    async fn duplicate_record_sent_commits_exactly_one_event() {
        let service = service();
        let id = DeliveryId::generate();

        service
            .request(RequestDelivery {
                id,
                tenant: tenant(),
                channel: "#c".into(),
                context: CallerContext::default(),
            })
            .await
            .unwrap();

        service.record_sent(record_sent(id)).await.unwrap();
        let replay = service.record_sent(record_sent(id)).await.unwrap();

        assert_eq!(replay.version, 1);

        let loaded = service.load(&tenant(), id).await.unwrap();
        assert_eq!(loaded.version, 1);
    }

    #[tokio::test]
    async fn record_failed_after_sent_is_an_invariant_violation() {
        let service = service();
        let id = DeliveryId::generate();

        service
            .request(RequestDelivery {
                id,
                tenant: tenant(),
                channel: "#c".into(),
                context: CallerContext::default(),
            })
            .await
            .unwrap();
        service.record_sent(record_sent(id)).await.unwrap();

        let err = service
            .record_failed(RecordFailed {
                id,
                tenant: tenant(),
                reason: "timeout".into(),
                attempts: 2,
                retryable: true,
                last_error: None,
                context: CallerContext::default(),
            })
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Invariant(_)));

        let loaded = service.load(&tenant(), id).await.unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.status, DeliveryStatus::Sent);
    }

    #[tokio::test]
    async fn commands_against_missing_streams_return_not_found() {
        let service = service();

        let err = service
            .record_sent(record_sent(DeliveryId::generate()))
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::NotFound { .. }));
    }

    #[tokio::test]
    async fn duplicate_request_is_a_conflict() {
        let service = service();
        let id = DeliveryId::generate();
        let cmd = RequestDelivery {
            id,
            tenant: tenant(),
            channel: "#c".into(),
            context: CallerContext::default(),
        };

        service.request(cmd.clone()).await.unwrap();
        let err = service.request(cmd).await.unwrap_err();

        assert!(matches!(err, CommandError::Conflict { .. }));
    }

    #[tokio::test]
    async fn stale_writer_gets_a_retryable_conflict() {
        let store = InMemoryEventStore::new();
        let service_a = DeliveryCommandService::new(store.clone());
        let service_b = DeliveryCommandService::new(store);

        let id = DeliveryId::generate();
        service_a
            .request(RequestDelivery {
                id,
                tenant: tenant(),
                channel: "#c".into(),
                context: CallerContext::default(),
            })
            .await
            .unwrap();

        // Writer A advances the stream underneath writer B's read.
        let stale = service_b.load(&tenant(), id).await.unwrap();
        assert_eq!(stale.version, 0);

        service_a
            .mark_validated(MarkValidated {
                id,
                tenant: tenant(),
                context: CallerContext::default(),
            })
            .await
            .unwrap();

        // B now appends against the stale revision by replaying the
        // same command path; the load inside sees the new revision,
        // so simulate the race at the store level instead.
        let event = DeliveryEvent::Queued
            .to_new_event(EventMetadata::new(tenant()))
            .unwrap();
        let err = service_b
            .store
            .append_to_stream(
                &delivery_stream(&tenant(), &id),
                ExpectedRevision::Exact(0),
                vec![event],
            )
            .await
            .unwrap_err();

        assert!(matches!(err, StoreError::Conflict { .. }));
    }
}
