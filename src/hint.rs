//! Version-hint cache. A pure optimization in front of the
//! versioned-write guard: hints let the executor skip redelivered
//! events without a round trip through the full write path. Losing a
//! hint is always safe, the guard still rejects stale writes.

use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::cache::ProjectionCache;
use crate::error::CacheError;
use crate::keys::{self, TenantId};

pub struct VersionHints<C> {
    cache: Arc<C>,
    ttl: Duration,
}

impl<C: ProjectionCache> VersionHints<C> {
    pub fn new(cache: Arc<C>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// True when the stored hint proves the row already reflects
    /// `candidate` or newer. A missing or unparseable hint never
    /// skips; the write path decides.
    pub async fn already_applied(
        &self,
        tenant: &TenantId,
        projector: &str,
        entity_id: &str,
        candidate: u64,
    ) -> Result<bool, CacheError> {
        let key = keys::hint_key(tenant, projector, entity_id);

        let Some(raw) = self.cache.get(&key).await? else {
            return Ok(false);
        };

        match raw.parse::<u64>() {
            Ok(stored) => Ok(stored >= candidate),
            Err(_) => {
                warn!(key = %key, value = %raw, "Discarding unparseable version hint");
                Ok(false)
            }
        }
    }

    /// Refresh the hint after a processed event. Written
    /// unconditionally: even a stale-rejected event proves the row is
    /// at least this new.
    pub async fn update(
        &self,
        tenant: &TenantId,
        projector: &str,
        entity_id: &str,
        revision: u64,
    ) -> Result<(), CacheError> {
        let key = keys::hint_key(tenant, projector, entity_id);
        self.cache
            .set_with_ttl(&key, &revision.to_string(), self.ttl)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryCache;

    fn tenant() -> TenantId {
        TenantId::new("t1").unwrap()
    }

    fn hints(cache: Arc<InMemoryCache>) -> VersionHints<InMemoryCache> {
        VersionHints::new(cache, Duration::from_secs(600))
    }

    #[tokio::test]
    async fn missing_hint_never_skips() {
        let hints = hints(Arc::new(InMemoryCache::new()));

        assert!(!hints.already_applied(&tenant(), "delivery", "r1", 1).await.unwrap());
    }

    #[tokio::test]
    async fn hint_at_or_above_candidate_skips() {
        let hints = hints(Arc::new(InMemoryCache::new()));
        hints.update(&tenant(), "delivery", "r1", 3).await.unwrap();

        assert!(hints.already_applied(&tenant(), "delivery", "r1", 3).await.unwrap());
        assert!(hints.already_applied(&tenant(), "delivery", "r1", 2).await.unwrap());
        assert!(!hints.already_applied(&tenant(), "delivery", "r1", 4).await.unwrap());
    }

    #[tokio::test]
    async fn garbage_hint_is_treated_as_absent() {
        let cache = Arc::new(InMemoryCache::new());
        let key = keys::hint_key(&tenant(), "delivery", "r1");
        cache
            .set_with_ttl(&key, "not-a-number", Duration::from_secs(600))
            .await
            .unwrap();

        let hints = hints(cache);

        assert!(!hints.already_applied(&tenant(), "delivery", "r1", 1).await.unwrap());
    }
}
