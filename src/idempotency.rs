//! TTL-bounded idempotency locks over the cache's atomic
//! set-if-absent.
//!
//! Finding a lock already held is the system working: some peer is
//! (or recently was) doing the job. Callers treat `AlreadyHeld` as a
//! successful no-op, never as an error. Expiry bounds the damage of
//! a crashed holder; the TTLs are sized to comfortably exceed the
//! normal duration of the guarded work.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::cache::ProjectionCache;
use crate::error::CacheError;
use crate::keys::{self, TenantId};

/// What a lock protects. The purpose is part of the key, so the
/// same entity can hold independent dispatch and execute locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPurpose {
    /// Claiming the right to enqueue a job for an entity.
    Dispatch,
    /// Claiming the right to perform the delivery itself.
    Execute,
}

impl LockPurpose {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Dispatch => "dispatch",
            Self::Execute => "execute",
        }
    }
}

/// Per-purpose lock lifetimes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockTtls {
    pub dispatch: Duration,
    pub execute: Duration,
}

impl Default for LockTtls {
    fn default() -> Self {
        Self {
            dispatch: Duration::from_secs(300),
            execute: Duration::from_secs(1800),
        }
    }
}

impl LockTtls {
    fn for_purpose(&self, purpose: LockPurpose) -> Duration {
        match purpose {
            LockPurpose::Dispatch => self.dispatch,
            LockPurpose::Execute => self.execute,
        }
    }
}

/// Result of an acquisition attempt. Both variants are success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// This caller created the lock and owns the guarded work.
    Acquired,
    /// A peer already holds it; the work is covered elsewhere.
    AlreadyHeld,
}

impl Acquisition {
    pub fn is_first(&self) -> bool {
        matches!(self, Self::Acquired)
    }
}

pub struct IdempotencyLocks<C> {
    cache: Arc<C>,
    ttls: LockTtls,
}

impl<C: ProjectionCache> IdempotencyLocks<C> {
    pub fn new(cache: Arc<C>, ttls: LockTtls) -> Self {
        Self { cache, ttls }
    }

    /// Try to claim the lock for `entity_id` under `purpose`. At most
    /// one concurrent caller per key observes `Acquired` until the
    /// lock expires or is released.
    pub async fn acquire(
        &self,
        tenant: &TenantId,
        purpose: LockPurpose,
        entity_id: &str,
    ) -> Result<Acquisition, CacheError> {
        let key = keys::lock_key(tenant, purpose.as_str(), entity_id);
        let marker = Utc::now().to_rfc3339();

        let created = self
            .cache
            .set_if_absent(&key, &marker, self.ttls.for_purpose(purpose))
            .await?;

        if created {
            debug!(key = %key, "Acquired idempotency lock");
            Ok(Acquisition::Acquired)
        } else {
            debug!(key = %key, "Idempotency lock already held");
            Ok(Acquisition::AlreadyHeld)
        }
    }

    /// Best-effort early release after the guarded work finishes.
    /// Failures are logged and swallowed; expiry cleans up anyway.
    pub async fn release(&self, tenant: &TenantId, purpose: LockPurpose, entity_id: &str) {
        let key = keys::lock_key(tenant, purpose.as_str(), entity_id);

        if let Err(err) = self.cache.delete(&key).await {
            warn!(key = %key, error = %err, "Failed to release idempotency lock; TTL will reclaim it");
        }
    }
}
