// Copyright 2025 Oxide Computer Company
use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::DdtError;

pub type ObjectId = u64;

/// The pool's root directory object. Always exists.
pub const POOL_DIRECTORY_OBJECT: ObjectId = 1;

/// Name of the directory object holding every class's histogram, linked
/// from the pool directory.
pub const DDT_STATS_NAME: &str = "DDT-statistics";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Directory,
    /// Backing object for one dedup class. `prehash` is set when keys are
    /// strong checksums that need no further hashing.
    DedupTable { prehash: bool },
    DedupStats,
}

/// Size information about an object, as the object store tracks it.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub block_count: u64,
    pub physical_blocks_512: u64,
    pub fill_count: u64,
    pub data_block_size: u64,
}

/// Persistent named key/value objects with transactional updates.
///
/// Every mutation names the transaction group it belongs to. Reads see
/// mutations made in the open transaction group. `commit` makes the group
/// durable; `abort` throws it away.
///
/// Lookups of a missing object, key, or name fail with
/// [`DdtError::NotFound`].
pub trait ObjectStore: Send + Sync + Debug {
    fn create_object(
        &self,
        kind: ObjectKind,
        txg: u64,
    ) -> Result<ObjectId, DdtError>;

    fn destroy_object(&self, id: ObjectId, txg: u64) -> Result<(), DdtError>;

    /// Add `name` to directory `dir`. Fails if the name already exists.
    fn directory_add(
        &self,
        dir: ObjectId,
        name: &str,
        value: &[u8],
        txg: u64,
    ) -> Result<(), DdtError>;

    /// Add or replace `name` in directory `dir`.
    fn directory_update(
        &self,
        dir: ObjectId,
        name: &str,
        value: &[u8],
        txg: u64,
    ) -> Result<(), DdtError>;

    fn directory_remove(
        &self,
        dir: ObjectId,
        name: &str,
        txg: u64,
    ) -> Result<(), DdtError>;

    fn directory_lookup(
        &self,
        dir: ObjectId,
        name: &str,
    ) -> Result<Vec<u8>, DdtError>;

    fn object_lookup(
        &self,
        id: ObjectId,
        key: &[u8],
    ) -> Result<Vec<u8>, DdtError>;

    fn object_update(
        &self,
        id: ObjectId,
        key: &[u8],
        record: &[u8],
        txg: u64,
    ) -> Result<(), DdtError>;

    fn object_remove(
        &self,
        id: ObjectId,
        key: &[u8],
        txg: u64,
    ) -> Result<(), DdtError>;

    /// The record at `cursor` and the cursor of the one after it, in key
    /// order. `NotFound` once the cursor runs off the end.
    #[allow(clippy::type_complexity)]
    fn object_walk(
        &self,
        id: ObjectId,
        cursor: u64,
    ) -> Result<(Vec<u8>, Vec<u8>, u64), DdtError>;

    /// Hint that `key` will be looked up soon. Never fails.
    fn object_prefetch(&self, id: ObjectId, key: &[u8]);

    fn object_count(&self, id: ObjectId) -> Result<u64, DdtError>;

    fn object_info(&self, id: ObjectId) -> Result<ObjectInfo, DdtError>;

    fn commit(&self, txg: u64) -> Result<(), DdtError>;

    fn abort(&self, txg: u64);
}
