//! Cache boundary for the read model, hints and locks.
//!
//! The cache engine is an external collaborator (a clustered
//! key-value store with atomic set-if-absent and scripted multi-key
//! writes). [`ProjectionCache`] pins down the operations this crate
//! needs; [`crate::testing::InMemoryCache`] implements them for
//! tests.
//!
//! The versioned write is the heart of at-most-once projection: one
//! atomic operation that checks the stored row's version, writes the
//! row hash, and adds or removes the entity in the tenant index. Its
//! outcome is a closed three-way enum: a genuine guard rejection is
//! [`VersionedWriteOutcome::RejectedStale`], an answer of unexpected
//! shape is [`VersionedWriteOutcome::Unrecognized`], and transport
//! failures are [`CacheError`]. The three are never conflated.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::CacheError;
use crate::keys::CacheKey;

/// Row-level mutation carried by a versioned write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowOp {
    /// Merge `fields` into the row hash and add the entity to the
    /// tenant index.
    Upsert { fields: BTreeMap<String, String> },
    /// Merge `fields` (including the deletion marker) into the row
    /// hash and remove the entity from the tenant index. The row
    /// itself is kept for audit.
    SoftDelete { fields: BTreeMap<String, String> },
}

/// One atomic multi-key write guarded by the stored row version.
///
/// Construction verifies that the row key and the index key carry
/// the same partition tag, so the whole operation is legal on a
/// slot-partitioned cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedWrite {
    row_key: CacheKey,
    index_key: CacheKey,
    entity_id: String,
    revision: u64,
    op: RowOp,
}

impl VersionedWrite {
    pub fn new(
        row_key: CacheKey,
        index_key: CacheKey,
        entity_id: impl Into<String>,
        revision: u64,
        op: RowOp,
    ) -> Result<Self, SlotMismatchError> {
        if !row_key.same_slot(&index_key) {
            return Err(SlotMismatchError {
                row_key: row_key.to_string(),
                index_key: index_key.to_string(),
            });
        }

        Ok(Self {
            row_key,
            index_key,
            entity_id: entity_id.into(),
            revision,
            op,
        })
    }

    pub fn row_key(&self) -> &CacheKey {
        &self.row_key
    }

    pub fn index_key(&self) -> &CacheKey {
        &self.index_key
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// The incoming event revision the stored version is checked
    /// against.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn op(&self) -> &RowOp {
        &self.op
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("row key {row_key} and index key {index_key} do not share a cluster slot")]
pub struct SlotMismatchError {
    pub row_key: String,
    pub index_key: String,
}

/// Result of a versioned write, distinct from transport errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionedWriteOutcome {
    /// The guard passed and all operations committed.
    Committed,
    /// The stored row is already at `stored` >= the incoming
    /// revision; nothing was written.
    RejectedStale { stored: u64 },
    /// The cache answered with a shape this crate does not
    /// recognize. Must be logged loudly and never treated as
    /// success.
    Unrecognized { detail: String },
}

#[async_trait]
pub trait ProjectionCache: Send + Sync {
    /// Atomic set-if-absent with TTL. Returns `true` if this call
    /// created the key.
    async fn set_if_absent(
        &self,
        key: &CacheKey,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, CacheError>;

    async fn get(&self, key: &CacheKey) -> Result<Option<String>, CacheError>;

    async fn set_with_ttl(
        &self,
        key: &CacheKey,
        value: &str,
        ttl: Duration,
    ) -> Result<(), CacheError>;

    async fn delete(&self, key: &CacheKey) -> Result<(), CacheError>;

    /// Read a row hash's fields. Returns `None` for a missing row.
    async fn get_row(&self, key: &CacheKey)
    -> Result<Option<BTreeMap<String, String>>, CacheError>;

    /// Members of an index set, for tenant listings and tests.
    async fn index_members(&self, key: &CacheKey) -> Result<Vec<String>, CacheError>;

    /// Execute one guarded multi-key write atomically.
    async fn apply_versioned(
        &self,
        write: &VersionedWrite,
    ) -> Result<VersionedWriteOutcome, CacheError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{TenantId, index_key, row_key};

    #[test]
    fn versioned_write_accepts_same_slot_keys() {
        let tenant = TenantId::new("t1").unwrap();
        let write = VersionedWrite::new(
            row_key(&tenant, "delivery", "r1"),
            index_key(&tenant, "delivery"),
            "r1",
            3,
            RowOp::Upsert {
                fields: BTreeMap::new(),
            },
        )
        .unwrap();

        assert_eq!(write.revision(), 3);
        assert_eq!(write.entity_id(), "r1");
    }

    #[test]
    fn versioned_write_rejects_cross_slot_keys() {
        let t1 = TenantId::new("t1").unwrap();
        let t2 = TenantId::new("t2").unwrap();

        let err = VersionedWrite::new(
            row_key(&t1, "delivery", "r1"),
            index_key(&t2, "delivery"),
            "r1",
            1,
            RowOp::Upsert {
                fields: BTreeMap::new(),
            },
        )
        .unwrap_err();

        assert_eq!(err.row_key, "{t1}:delivery:r1");
        assert_eq!(err.index_key, "{t2}:delivery:index");
    }
}
