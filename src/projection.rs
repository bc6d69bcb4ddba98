//! Projection executor: applies one committed event to the cached
//! read model.
//!
//! Order of operations per event: hint check, versioned write, hint
//! refresh. The hint check is only an optimization; correctness
//! rests entirely on the versioned write's guard, which rejects any
//! event at or below the stored row version. Redelivery after a
//! crash between write and checkpoint therefore converges to
//! `StaleOcc` or `SkippedHint` with the row untouched.

use std::sync::Arc;

use tracing::{debug, error};

use crate::cache::{ProjectionCache, RowOp, VersionedWrite, VersionedWriteOutcome};
use crate::delivery::{DELIVERY_PROJECTOR, RowPatch};
use crate::error::ProjectionError;
use crate::event::RecordedEvent;
use crate::hint::VersionHints;
use crate::keys;
use crate::outcome::ProjectionOutcome;

pub struct ProjectionExecutor<C> {
    cache: Arc<C>,
    hints: VersionHints<C>,
}

impl<C: ProjectionCache> ProjectionExecutor<C> {
    pub fn new(cache: Arc<C>, hints: VersionHints<C>) -> Self {
        Self { cache, hints }
    }

    /// Apply one committed delivery event. Infallible outcomes
    /// (stale, deduplicated, unrecognized) are reported through
    /// [`ProjectionOutcome`]; only decode and transport failures are
    /// errors.
    #[tracing::instrument(skip_all, fields(stream = %event.stream_id, revision = event.revision))]
    pub async fn apply(&self, event: &RecordedEvent) -> Result<ProjectionOutcome, ProjectionError> {
        let patch = RowPatch::from_recorded(event)?;
        self.apply_patch(patch).await
    }

    /// Apply a prepared row patch. Also the entry point for
    /// tombstones, which have no backing event.
    pub async fn apply_patch(&self, patch: RowPatch) -> Result<ProjectionOutcome, ProjectionError> {
        if self
            .hints
            .already_applied(&patch.tenant, DELIVERY_PROJECTOR, &patch.entity_id, patch.revision)
            .await?
        {
            debug!(entity_id = %patch.entity_id, revision = patch.revision, "Hint shows row is current; skipping");
            return Ok(ProjectionOutcome::SkippedHint);
        }

        let row_key = keys::row_key(&patch.tenant, DELIVERY_PROJECTOR, &patch.entity_id);
        let index_key = keys::index_key(&patch.tenant, DELIVERY_PROJECTOR);

        let op = if patch.deleted_at.is_some() {
            RowOp::SoftDelete {
                fields: patch.fields,
            }
        } else {
            RowOp::Upsert {
                fields: patch.fields,
            }
        };

        let write =
            VersionedWrite::new(row_key, index_key, patch.entity_id.clone(), patch.revision, op)
                .map_err(|err| ProjectionError::SlotMismatch {
                    row_key: err.row_key,
                    index_key: err.index_key,
                })?;

        let outcome = match self.cache.apply_versioned(&write).await? {
            VersionedWriteOutcome::Committed => ProjectionOutcome::Applied,
            VersionedWriteOutcome::RejectedStale { stored } => {
                debug!(
                    entity_id = %patch.entity_id,
                    revision = patch.revision,
                    stored,
                    "Versioned write rejected stale event"
                );
                ProjectionOutcome::StaleOcc
            }
            VersionedWriteOutcome::Unrecognized { detail } => {
                error!(
                    entity_id = %patch.entity_id,
                    revision = patch.revision,
                    detail = %detail,
                    "Versioned write returned an unrecognized answer"
                );
                ProjectionOutcome::Unknown
            }
        };

        // Even a stale rejection proves the row is at least this new.
        self.hints
            .update(&patch.tenant, DELIVERY_PROJECTOR, &patch.entity_id, patch.revision)
            .await?;

        Ok(outcome)
    }
}
