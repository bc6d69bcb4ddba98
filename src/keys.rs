//! Tenant-scoped cache key layout.
//!
//! Every key embeds the tenant inside braces as a cluster partition
//! tag, so all keys for one tenant hash to the same cluster slot and
//! multi-key atomic operations stay legal. Layout:
//!
//! ```text
//! row   {tenant}:projector:entity
//! index {tenant}:projector:index
//! hint  {tenant}:projector:entity:hint
//! lock  {tenant}:purpose:entity
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Validated tenant identifier used as the cluster partition tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TenantId(String);

impl TenantId {
    pub fn new(value: impl Into<String>) -> Result<Self, InvalidTenantError> {
        let value = value.into();

        if value.is_empty() {
            return Err(InvalidTenantError::Empty);
        }

        if value.contains(['{', '}', ':']) {
            return Err(InvalidTenantError::ReservedCharacter(value));
        }

        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for TenantId {
    type Error = InvalidTenantError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TenantId> for String {
    fn from(tenant: TenantId) -> Self {
        tenant.0
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum InvalidTenantError {
    #[error("Tenant identifier cannot be empty")]
    Empty,

    #[error("Tenant identifier cannot contain '{{', '}}' or ':': {0}")]
    ReservedCharacter(String),
}

/// A fully built cache key carrying its partition tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The braced partition tag, e.g. `t1` for `{t1}:delivery:r1`.
    pub fn partition_tag(&self) -> Option<&str> {
        let start = self.0.find('{')?;
        let end = self.0[start..].find('}')? + start;
        Some(&self.0[start + 1..end])
    }

    /// Whether two keys route to the same cluster slot under
    /// tag-based partitioning.
    pub fn same_slot(&self, other: &Self) -> bool {
        match (self.partition_tag(), other.partition_tag()) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub fn row_key(tenant: &TenantId, projector: &str, entity_id: &str) -> CacheKey {
    CacheKey(format!("{{{tenant}}}:{projector}:{entity_id}"))
}

pub fn index_key(tenant: &TenantId, projector: &str) -> CacheKey {
    CacheKey(format!("{{{tenant}}}:{projector}:index"))
}

pub fn hint_key(tenant: &TenantId, projector: &str, entity_id: &str) -> CacheKey {
    CacheKey(format!("{{{tenant}}}:{projector}:{entity_id}:hint"))
}

pub fn lock_key(tenant: &TenantId, purpose: &str, entity_id: &str) -> CacheKey {
    CacheKey(format!("{{{tenant}}}:{purpose}:{entity_id}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant(value: &str) -> TenantId {
        TenantId::new(value).unwrap()
    }

    #[test]
    fn row_and_index_keys_share_a_slot() {
        let t = tenant("t1");
        let row = row_key(&t, "delivery", "r1");
        let index = index_key(&t, "delivery");

        assert_eq!(row.as_str(), "{t1}:delivery:r1");
        assert_eq!(index.as_str(), "{t1}:delivery:index");
        assert!(row.same_slot(&index));
    }

    #[test]
    fn different_tenants_do_not_share_a_slot() {
        let row_a = row_key(&tenant("t1"), "delivery", "r1");
        let row_b = row_key(&tenant("t2"), "delivery", "r1");

        assert!(!row_a.same_slot(&row_b));
    }

    #[test]
    fn partition_tag_extracts_braced_segment() {
        let key = hint_key(&tenant("acme"), "delivery", "r9");

        assert_eq!(key.partition_tag(), Some("acme"));
        assert_eq!(key.as_str(), "{acme}:delivery:r9:hint");
    }

    #[test]
    fn lock_key_embeds_purpose() {
        let key = lock_key(&tenant("t1"), "dispatch", "r1");

        assert_eq!(key.as_str(), "{t1}:dispatch:r1");
    }

    #[test]
    fn tenant_rejects_empty_and_reserved_characters() {
        assert_eq!(TenantId::new(""), Err(InvalidTenantError::Empty));
        assert!(matches!(
            TenantId::new("a{b"),
            Err(InvalidTenantError::ReservedCharacter(_))
        ));
        assert!(matches!(
            TenantId::new("a:b"),
            Err(InvalidTenantError::ReservedCharacter(_))
        ));
    }
}
