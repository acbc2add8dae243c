// Copyright 2025 Oxide Computer Company
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::EnumIter;

use crate::*;

pub const DDT_PHYS_TYPES: usize = 4;

/// The four physical copies an entry can track. A slot's index is also the
/// number of DVAs that copy was written with, except for `Ditto`, which is
/// the extra safety copy kept for very hot blocks.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    EnumIter,
    Serialize,
    Deserialize,
)]
pub enum PhysSlot {
    Ditto,
    Single,
    Double,
    Triple,
}

impl PhysSlot {
    pub fn index(self) -> usize {
        self as usize
    }

    /// The slot a block written with `copies` DVAs lands in, if any.
    pub fn for_copies(copies: usize) -> Option<PhysSlot> {
        match copies {
            1 => Some(PhysSlot::Single),
            2 => Some(PhysSlot::Double),
            3 => Some(PhysSlot::Triple),
            _ => None,
        }
    }

    /// Slots that carry logical references.
    pub fn referenced() -> impl Iterator<Item = PhysSlot> {
        PhysSlot::iter().filter(|p| *p != PhysSlot::Ditto)
    }
}

/// One physical copy of a deduplicated block.
///
/// `phys_birth` and `refcnt` are both zero exactly when the slot is unused,
/// which holds whenever the entry is at rest between sync passes.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize,
)]
pub struct Phys {
    pub dva: [Dva; SPA_DVAS_PER_BP],
    pub phys_birth: u64,
    pub refcnt: i64,
}

impl Phys {
    pub fn is_used(&self) -> bool {
        self.phys_birth != 0
    }

    pub fn fill(&mut self, bp: &BlockPointer) {
        assert_eq!(self.phys_birth, 0, "filling a slot already in use");
        self.dva = bp.dva;
        self.phys_birth = bp.physical_birth();
    }

    pub fn clear(&mut self) {
        *self = Phys::default();
    }

    pub fn add_ref(&mut self) {
        assert!(self.refcnt < i64::MAX, "dedup reference count overflow");
        self.refcnt += 1;
    }

    pub fn remove_ref(&mut self) {
        assert!(self.refcnt > 0, "dedup reference count going negative");
        self.refcnt -= 1;
    }

    /// Bytes allocated for this copy across all its DVAs.
    pub fn dsize(&self) -> u64 {
        self.dva.iter().map(|d| d.asize).sum()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
}

/// The mutable part of an entry, behind the entry's own lock.
#[derive(Debug, Default)]
pub struct EntryData {
    pub phys: [Phys; DDT_PHYS_TYPES],

    /// Where the entry is persisted, or `None` if it is not.
    pub location: Option<(TableType, TableClass)>,

    /// The entry's contribution to the histogram as of load time. Taken
    /// back out at sync before the new contribution is added.
    pub lookup_stat: Stat,

    /// References waiting on an in-flight lead write, per slot. Zero means
    /// no lead write is outstanding for that slot.
    pub pending: [u64; DDT_PHYS_TYPES],

    /// Good data captured by a reader, used to rewrite damaged copies.
    pub repair_data: Option<bytes::Bytes>,
}

impl EntryData {
    pub fn phys(&self, slot: PhysSlot) -> &Phys {
        &self.phys[slot.index()]
    }

    pub fn phys_mut(&mut self, slot: PhysSlot) -> &mut Phys {
        &mut self.phys[slot.index()]
    }

    /// The slot holding the copy `bp` points at, if any.
    pub fn select_for(&self, bp: &BlockPointer) -> Option<PhysSlot> {
        PhysSlot::iter().find(|s| {
            let p = self.phys(*s);
            p.dva[0] == *bp.identity() && p.phys_birth == bp.physical_birth()
        })
    }

    /// Logical references across the referenced slots. The ditto copy is a
    /// replica, not a reference, so it is not counted.
    pub fn total_refcnt(&self) -> u64 {
        PhysSlot::referenced()
            .map(|s| self.phys(s).refcnt.max(0) as u64)
            .sum()
    }

    pub fn has_lead_writes(&self) -> bool {
        self.pending.iter().any(|p| *p != 0)
    }

    /// Block accounting for this entry's current slots.
    pub fn generate_stat(&self, key: &Key) -> Stat {
        let lsize = key.lsize();
        let psize = key.psize();
        let mut stat = Stat::default();

        for slot in PhysSlot::iter() {
            let p = self.phys(slot);
            if !p.is_used() {
                continue;
            }
            let refcnt = match slot {
                PhysSlot::Ditto => 0,
                _ => p.refcnt.max(0) as u64,
            };
            let dsize = p.dsize();

            stat.blocks += 1;
            stat.lsize += lsize;
            stat.psize += psize;
            stat.dsize += dsize;

            stat.ref_blocks += refcnt;
            stat.ref_lsize += lsize * refcnt;
            stat.ref_psize += psize * refcnt;
            stat.ref_dsize += dsize * refcnt;
        }

        stat
    }

    /// How many more copies this content should have, counting committed
    /// references, references waiting on lead writes, and the caller's
    /// reference to `willref` if it is about to add one.
    ///
    /// Copies are only ever added here. Dropping a ditto copy happens at
    /// sync time.
    pub fn ditto_copies_needed(
        &self,
        willref: Option<PhysSlot>,
        ditto_limit: u64,
    ) -> i32 {
        let mut total_refcnt: u64 = 0;
        let mut total_copies: i32 = 0;

        for slot in PhysSlot::referenced() {
            let mut refcnt =
                self.phys(slot).refcnt.max(0) as u64 + self.pending[slot.index()];
            if willref == Some(slot) {
                refcnt += 1;
            }
            if refcnt != 0 {
                total_refcnt += refcnt;
                total_copies += slot.index() as i32;
            }
        }

        let mut desired: i32 = 0;
        if total_refcnt >= 1 {
            desired += 1;
        }
        if total_refcnt >= ditto_limit {
            desired += 1;
        }
        if total_refcnt >= ditto_limit.saturating_mul(ditto_limit) {
            desired += 1;
        }

        desired.max(total_copies) - total_copies
    }

    /// Valid addresses in the ditto slot. A gang block's addresses point at
    /// its gang header, which is not a copy of the data, so one is taken
    /// off for it.
    pub fn ditto_copies_present(&self) -> usize {
        let p = self.phys(PhysSlot::Ditto);
        let valid = p.dva.iter().filter(|d| d.is_valid()).count();
        let copies = valid.saturating_sub(usize::from(p.dva[0].gang));
        debug_assert!(copies < SPA_DVAS_PER_BP);
        copies
    }
}

/// A resident dedup table entry.
///
/// The key never changes. The first lookup to find the entry unloaded runs
/// the load; any concurrent lookup of the same key blocks until that load
/// finishes and sees its result.
#[derive(Debug)]
pub struct Entry {
    key: Key,
    loading: AtomicBool,
    loaded: OnceLock<Result<(), DdtError>>,
    data: Mutex<EntryData>,
}

pub type EntryHandle = Arc<Entry>;

impl Entry {
    pub fn new(key: Key) -> Entry {
        Entry {
            key,
            loading: AtomicBool::new(false),
            loaded: OnceLock::new(),
            data: Mutex::new(EntryData::default()),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn lock(&self) -> MutexGuard<'_, EntryData> {
        self.data.lock().unwrap()
    }

    pub fn state(&self) -> LoadState {
        if self.loaded.get().is_some() {
            LoadState::Loaded
        } else if self.loading.load(Ordering::Acquire) {
            LoadState::Loading
        } else {
            LoadState::Unloaded
        }
    }

    /// The load ran and failed. The lookup that ran it takes the entry back
    /// out of the table, but a sync may drain it first.
    pub(crate) fn load_failed(&self) -> bool {
        matches!(self.loaded.get(), Some(Err(_)))
    }

    /// Run `load` if nobody has yet, or wait for whoever is running it.
    /// Returns the load's result and whether this caller ran it.
    pub(crate) fn load_once<F>(&self, load: F) -> (Result<(), DdtError>, bool)
    where
        F: FnOnce(&Entry) -> Result<(), DdtError>,
    {
        let mut ran = false;
        let result = self.loaded.get_or_init(|| {
            ran = true;
            self.loading.store(true, Ordering::Release);
            load(self)
        });
        // Only cleared once the result is published, so `state` never
        // drops back to Unloaded.
        if ran {
            self.loading.store(false, Ordering::Release);
        }
        (result.clone(), ran)
    }
}
