//! Lock-guarded job dispatch. Many workers may observe the same
//! dispatch-worthy state; the dispatch lock collapses them to one
//! enqueue per lock window.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use tracing::info;

use crate::cache::ProjectionCache;
use crate::error::CacheError;
use crate::idempotency::{IdempotencyLocks, LockPurpose};
use crate::keys::TenantId;
use crate::outcome::ProjectionOutcome;

/// A unit of outbound work handed to the queue backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub tenant: TenantId,
    pub entity_id: String,
    pub channel: String,
    pub attempt: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("transient queue failure: {0}")]
    Transient(String),

    #[error("queue backend failure: {0}")]
    Backend(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("lock failure: {0}")]
    Lock(#[from] CacheError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Queue backend boundary. Implementations must be safe to call
/// concurrently.
#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, job: DeliveryJob) -> Result<(), QueueError>;
}

/// Enqueue `job` exactly once per dispatch-lock window. A held lock
/// means a peer already dispatched; that is reported as
/// [`ProjectionOutcome::Deduplicated`], not an error.
pub async fn dispatch_once<C: ProjectionCache, Q: JobQueue>(
    locks: &IdempotencyLocks<C>,
    queue: &Q,
    job: DeliveryJob,
) -> Result<ProjectionOutcome, DispatchError> {
    let acquisition = locks
        .acquire(&job.tenant, LockPurpose::Dispatch, &job.entity_id)
        .await?;

    if !acquisition.is_first() {
        return Ok(ProjectionOutcome::Deduplicated);
    }

    queue.enqueue(job.clone()).await?;

    info!(tenant = %job.tenant, entity_id = %job.entity_id, "Dispatched delivery job");
    Ok(ProjectionOutcome::Applied)
}
