//! Event-sourced lifecycle tracking for outbound notifications.
//!
//! The write side appends facts about each delivery request to an
//! append-only event store under optimistic concurrency. The read
//! side is a catch-up subscription that projects those facts into a
//! cache-backed read model with per-row version guards, so events can
//! be redelivered and reordered without corrupting rows. TTL-bounded
//! idempotency locks keep concurrent dispatchers from duplicating
//! outbound work.
//!
//! Layout:
//! - [`delivery`]: the aggregate, its events, commands and read rows
//! - [`store`] / [`checkpoint`]: event log and subscription positions
//! - [`cache`] / [`keys`]: read-model cache boundary and key layout
//! - [`projection`] / [`hint`] / [`outcome`]: the projection path
//! - [`idempotency`] / [`dispatch`]: lock-guarded job dispatch
//! - [`runner`]: the catch-up loop tying the above together
//! - [`testing`]: in-memory doubles for all external collaborators

pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod delivery;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod hint;
pub mod idempotency;
pub mod keys;
pub mod outcome;
pub mod projection;
pub mod runner;
pub mod store;
pub mod testing;
