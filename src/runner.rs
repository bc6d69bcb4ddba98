//! Catch-up runner: reads the prefix-ordered event log in batches,
//! feeds each event to a handler strictly in order, and persists a
//! durable checkpoint as it goes.
//!
//! The checkpoint records the last fully processed position; a
//! restart resumes just past it. A crash between processing and
//! checkpointing redelivers a suffix of events, which the projection
//! guard absorbs as stale or hint-skipped outcomes.
//!
//! A persistently failing event is poison: after the retry budget is
//! exhausted the runner checkpoints the last good position and
//! returns an error, halting the group. Skipping is never an option,
//! later events for the same stream assume the earlier ones landed.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cache::ProjectionCache;
use crate::checkpoint::{CheckpointError, CheckpointStore, SubscriptionGroup};
use crate::error::{ProjectionError, StoreError};
use crate::event::{RecordedEvent, StreamPosition};
use crate::outcome::{OutcomeTally, ProjectionOutcome};
use crate::projection::ProjectionExecutor;
use crate::store::EventStore;

/// Tuning for one catch-up run.
#[derive(Debug, Clone)]
pub struct CatchUpOptions {
    /// Stream prefixes this subscription consumes.
    pub prefixes: Vec<String>,
    /// Events fetched per store read.
    pub batch_size: usize,
    /// Events processed between durable checkpoint writes.
    pub checkpoint_interval: usize,
    /// Retries per event before it is declared poison.
    pub max_retries: u32,
    pub retry_delay: Duration,
    /// How long to sleep when the log is exhausted before polling
    /// again.
    pub idle_poll_interval: Duration,
    /// Return instead of polling once the log is exhausted. Used by
    /// rebuilds and tests; live subscriptions poll.
    pub stop_when_caught_up: bool,
}

impl Default for CatchUpOptions {
    fn default() -> Self {
        Self {
            prefixes: vec!["delivery-".to_string()],
            batch_size: 500,
            checkpoint_interval: 50,
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            idle_poll_interval: Duration::from_secs(1),
            stop_when_caught_up: false,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error(transparent)]
    Projection(#[from] ProjectionError),

    #[error("handler failure: {0}")]
    Other(String),
}

#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("checkpoint failure: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    /// One event kept failing past the retry budget. The checkpoint
    /// holds the last good position; the group is halted until an
    /// operator intervenes.
    #[error("poison event at position {position} after {attempts} attempts: {source}")]
    Poisoned {
        position: StreamPosition,
        attempts: u32,
        source: HandlerError,
    },
}

/// How a run ended, when it ended without error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The log was exhausted and `stop_when_caught_up` was set.
    CaughtUp,
    /// The stop signal was raised.
    Stopped,
}

/// Per-event consumer driven by the runner.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &RecordedEvent) -> Result<ProjectionOutcome, HandlerError>;
}

#[async_trait]
impl<C: ProjectionCache> EventHandler for ProjectionExecutor<C> {
    async fn handle(&self, event: &RecordedEvent) -> Result<ProjectionOutcome, HandlerError> {
        Ok(self.apply(event).await?)
    }
}

pub struct CatchUpRunner<S, K> {
    store: Arc<S>,
    checkpoints: Arc<K>,
}

impl<S: EventStore, K: CheckpointStore> CatchUpRunner<S, K> {
    pub fn new(store: Arc<S>, checkpoints: Arc<K>) -> Self {
        Self { store, checkpoints }
    }

    /// Drive `handler` over the subscribed prefixes until the stop
    /// signal is raised, the log is exhausted (when
    /// `stop_when_caught_up`), or a poison event halts the group.
    #[tracing::instrument(skip_all, fields(group = %group))]
    pub async fn run<H: EventHandler>(
        &self,
        group: &SubscriptionGroup,
        handler: &H,
        options: &CatchUpOptions,
        mut stop: watch::Receiver<bool>,
    ) -> Result<RunOutcome, RunError> {
        let mut from = match self.checkpoints.load(group).await? {
            Some(position) => {
                info!(position = %position, "Resuming past stored checkpoint");
                position.next()
            }
            None => {
                info!("No checkpoint; starting from the beginning of the log");
                StreamPosition::START
            }
        };

        let mut tally = OutcomeTally::default();

        loop {
            if *stop.borrow() {
                info!(tally = %tally, "Stop requested; run ending");
                return Ok(RunOutcome::Stopped);
            }

            let batch = self
                .store
                .read_by_prefix(&options.prefixes, from, options.batch_size)
                .await?;

            if batch.is_empty() {
                if options.stop_when_caught_up {
                    info!(tally = %tally, "Caught up with the log");
                    return Ok(RunOutcome::CaughtUp);
                }

                tokio::select! {
                    _ = tokio::time::sleep(options.idle_poll_interval) => {}
                    changed = stop.changed() => {
                        if changed.is_err() || *stop.borrow() {
                            info!(tally = %tally, "Stop requested while idle; run ending");
                            return Ok(RunOutcome::Stopped);
                        }
                    }
                }
                continue;
            }

            let mut last_processed: Option<StreamPosition> = None;
            let mut since_checkpoint = 0usize;

            for event in &batch {
                match self.handle_with_retry(event, handler, options).await {
                    Ok(outcome) => tally.record(outcome),
                    Err(poison) => {
                        if let Some(position) = last_processed {
                            self.checkpoints.save(group, position).await?;
                        }
                        error!(
                            position = %event.position,
                            stream = %event.stream_id,
                            "Poison event; halting group"
                        );
                        return Err(poison);
                    }
                }

                last_processed = Some(event.position);
                since_checkpoint += 1;

                if since_checkpoint >= options.checkpoint_interval {
                    self.checkpoints.save(group, event.position).await?;
                    since_checkpoint = 0;
                }
            }

            // Batch fully processed; last_processed is always set here.
            if let Some(position) = last_processed {
                self.checkpoints.save(group, position).await?;
                from = position.next();
            }

            info!(batch = batch.len(), position = %from, tally = %tally, "Processed batch");
        }
    }

    async fn handle_with_retry<H: EventHandler>(
        &self,
        event: &RecordedEvent,
        handler: &H,
        options: &CatchUpOptions,
    ) -> Result<ProjectionOutcome, RunError> {
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;

            match handler.handle(event).await {
                Ok(outcome) => return Ok(outcome),
                Err(err) if attempt <= options.max_retries => {
                    warn!(
                        position = %event.position,
                        attempt,
                        error = %err,
                        "Handler failed; retrying in place"
                    );
                    tokio::time::sleep(options.retry_delay).await;
                }
                Err(err) => {
                    return Err(RunError::Poisoned {
                        position: event.position,
                        attempts: attempt,
                        source: err,
                    });
                }
            }
        }
    }
}
