// Copyright 2025 Oxide Computer Company
//! Deduplication table engine.
//!
//! Tracks reference-counted, content-addressed blocks so that identical
//! writes share one physical copy. Entries are kept in memory between
//! syncs and persisted per checksum algorithm into class objects (ditto,
//! duplicate, unique) in an [`ObjectStore`].

pub use bytes::Bytes;
pub use ddt_common::*;

mod checksum;
pub use checksum::*;

mod key;
pub use key::*;

mod stats;
pub use stats::*;

mod entry;
pub use entry::*;

mod table;
pub use table::Table;

pub mod object_store;
pub use object_store::*;

pub mod in_memory;
pub use in_memory::InMemoryObjectStore;

mod class_store;
pub use class_store::ClassStore;

mod io;
pub use io::*;

mod repair;
pub use repair::{RepairCounters, RepairEntry, RepairQueue, RepairStats};

mod ddt;
pub use ddt::{Ddt, LeadWrite};

mod engine;
pub use engine::{Bookmark, DedupEngine};


/// One persisted dedup record: a key's copies and the class object holding
/// them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DdtRecord {
    pub checksum: ChecksumAlgo,
    pub key: Key,
    pub phys: [Phys; DDT_PHYS_TYPES],
    pub table_type: TableType,
    pub class: TableClass,
}

impl DdtRecord {
    /// Logical references across the referenced slots.
    pub fn total_refcnt(&self) -> u64 {
        PhysSlot::referenced()
            .map(|s| self.phys[s.index()].refcnt.max(0) as u64)
            .sum()
    }
}
