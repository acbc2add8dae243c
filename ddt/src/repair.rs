// Copyright 2025 Oxide Computer Company
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use itertools::iproduct;
use slog::{debug, info, warn, Logger};
use strum::IntoEnumIterator;

use crate::*;

/// A detached copy of an entry's persisted state, used to repair damaged
/// copies of its block. Never inserted into the table.
#[derive(Debug, Clone)]
pub struct RepairEntry {
    key: Key,
    pub phys: [Phys; DDT_PHYS_TYPES],
    pub location: Option<(TableType, TableClass)>,
    repair_data: Option<Bytes>,
}

impl RepairEntry {
    pub fn new(key: Key) -> RepairEntry {
        RepairEntry {
            key,
            phys: [Phys::default(); DDT_PHYS_TYPES],
            location: None,
            repair_data: None,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Attach known-good content, read from a copy that checksummed
    /// correctly.
    pub fn set_repair_data(&mut self, data: Bytes) {
        assert_eq!(
            data.len() as u64,
            self.key.psize(),
            "repair data does not match the block's physical size"
        );
        self.repair_data = Some(data);
    }

    pub fn repair_data(&self) -> Option<&Bytes> {
        self.repair_data.as_ref()
    }

    pub fn phys(&self, slot: PhysSlot) -> &Phys {
        &self.phys[slot.index()]
    }
}

#[derive(Debug, Default)]
pub struct RepairCounters {
    in_flight: AtomicU64,
    released: AtomicU64,
    rewrites: AtomicU64,
}

impl RepairCounters {
    pub fn in_flight(&self) -> u64 {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn released(&self) -> u64 {
        self.released.load(Ordering::Acquire)
    }

    pub fn rewrites(&self) -> u64 {
        self.rewrites.load(Ordering::Acquire)
    }
}

#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct RepairStats {
    /// Repairs queued for the next sync.
    pub pending: usize,
    /// Repairs with rewrites still outstanding.
    pub in_flight: u64,
    /// Repairs whose rewrites have all completed.
    pub released: u64,
    /// Rewrites issued, ever.
    pub rewrites: u64,
}

/// Keeps a repair entry alive while its rewrites are outstanding.
#[derive(Debug)]
pub struct RepairTicket {
    entry: RepairEntry,
    counters: Arc<RepairCounters>,
}

impl RepairTicket {
    pub(crate) fn new(
        entry: RepairEntry,
        counters: Arc<RepairCounters>,
    ) -> RepairTicket {
        counters.in_flight.fetch_add(1, Ordering::AcqRel);
        RepairTicket { entry, counters }
    }

    pub fn key(&self) -> &Key {
        self.entry.key()
    }
}

impl Drop for RepairTicket {
    fn drop(&mut self) {
        self.counters.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.counters.released.fetch_add(1, Ordering::AcqRel);
    }
}

/// Repairs collected since the last sync, one per key. Has its own lock so
/// scrub reads never contend with the table's bucket locks.
#[derive(Debug)]
pub struct RepairQueue {
    tree: Mutex<BTreeMap<Key, RepairEntry>>,
    counters: Arc<RepairCounters>,
    log: Logger,
}

impl RepairQueue {
    pub fn new(log: Logger) -> RepairQueue {
        RepairQueue {
            tree: Mutex::new(BTreeMap::new()),
            counters: Arc::new(RepairCounters::default()),
            log,
        }
    }

    /// Queue `entry` if it carries good data, the pool is writeable, and
    /// nothing is queued for its key yet. Otherwise it is dropped. Returns
    /// whether it was queued.
    pub fn done(&self, entry: RepairEntry, writeable: bool) -> bool {
        let mut tree = self.tree.lock().unwrap();
        if entry.repair_data.is_none()
            || !writeable
            || tree.contains_key(entry.key())
        {
            return false;
        }
        tree.insert(*entry.key(), entry);
        true
    }

    /// Put back an entry taken by `pop_first`, unless a newer one for the
    /// same key arrived in the meantime.
    fn requeue(&self, entry: RepairEntry) {
        self.tree
            .lock()
            .unwrap()
            .entry(*entry.key())
            .or_insert(entry);
    }

    fn pop_first(&self) -> Option<RepairEntry> {
        self.tree.lock().unwrap().pop_first().map(|(_, e)| e)
    }

    pub fn len(&self) -> usize {
        self.tree.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RepairStats {
        RepairStats {
            pending: self.len(),
            in_flight: self.counters.in_flight(),
            released: self.counters.released(),
            rewrites: self.counters.rewrites(),
        }
    }
}

impl Ddt {
    /// A detached entry holding what the pool knows about the copies of
    /// `key`. Classes other than unique are searched first, since a unique
    /// block has no second copy to repair from. Comes back with no copies
    /// if nothing is found.
    pub fn repair_start(&self, key: &Key) -> Result<RepairEntry, DdtError> {
        let mut entry = RepairEntry::new(*key);

        let order = iproduct!(TableType::iter(), TableClass::iter())
            .filter(|(_, c)| *c != TableClass::Unique)
            .chain(TableType::iter().map(|t| (t, TableClass::Unique)));

        for (t, c) in order {
            match self.classes.lookup(t, c, key) {
                Ok(phys) => {
                    entry.phys = phys;
                    entry.location = Some((t, c));
                    return Ok(entry);
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(entry)
    }

    pub fn repair_done(&self, entry: RepairEntry, writeable: bool) {
        let key = *entry.key();
        if self.repair.done(entry, writeable) {
            debug!(self.log, "queued repair of {}", key);
        }
    }

    /// Issue rewrites for everything queued. Only runs on the first pass of
    /// a sync. Waiters for the issued rewrites are pushed onto `waiters`.
    pub(crate) fn repair_table(
        &self,
        io: &dyn BlockIo,
        writeable: bool,
        pass: u32,
        waiters: &mut Vec<RewriteWaiter>,
    ) -> Result<(), DdtError> {
        if pass > 1 {
            return Ok(());
        }

        while let Some(rdde) = self.repair.pop_first() {
            let fresh = match self.repair_start(rdde.key()) {
                Ok(fresh) => fresh,
                Err(e) => {
                    warn!(self.log, "repair of {} deferred: {}", rdde.key(), e);
                    self.repair.requeue(rdde);
                    return Err(e);
                }
            };
            self.repair_entry(&fresh, rdde, io, waiters);
            self.repair_done(fresh, writeable);
        }

        Ok(())
    }

    /// Rewrite every copy that the repair entry and the current state of
    /// the table agree on.
    fn repair_entry(
        &self,
        current: &RepairEntry,
        rdde: RepairEntry,
        io: &dyn BlockIo,
        waiters: &mut Vec<RewriteWaiter>,
    ) {
        let Some(data) = rdde.repair_data().cloned() else {
            return;
        };

        let slots: Vec<PhysSlot> = PhysSlot::iter()
            .filter(|s| {
                let p = current.phys(*s);
                let r = rdde.phys(*s);
                p.is_used()
                    && p.phys_birth == r.phys_birth
                    && p.dva[0] == r.dva[0]
            })
            .collect();

        let key = *rdde.key();
        let ticket =
            Arc::new(RepairTicket::new(rdde, self.repair.counters.clone()));

        for slot in slots.iter() {
            let bp = key.to_block_pointer(self.checksum, Some(current.phys(*slot)));
            let (req, waiter) = RewriteReq::new(ticket.clone());
            self.repair.counters.rewrites.fetch_add(1, Ordering::AcqRel);
            io.rewrite_block(&bp, data.clone(), IoPriority::SyncWrite, req);
            waiters.push(waiter);
        }

        info!(
            self.log,
            "repair of {} issued {} rewrites", key, slots.len()
        );
    }
}
