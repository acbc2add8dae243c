// Copyright 2025 Oxide Computer Company
use std::sync::Arc;

use ddt_common::ddt_bail;
use itertools::iproduct;
use slog::{debug, error, info, o, Logger};
use strum::IntoEnumIterator;

use crate::repair::RepairQueue;
use crate::*;

/// The table type new and migrating entries are written to.
const CURRENT_TYPE: TableType = TableType::Zap;

/// A write of new content in flight for one slot of an entry. Writers of the
/// same content that arrive while it is in flight join it instead of
/// writing a copy of their own, and get their reference when it finishes.
///
/// Holds only the key and slot; the entry is found again through the table
/// whenever the write is joined or finished.
#[must_use]
#[derive(Debug)]
pub struct LeadWrite {
    key: Key,
    slot: PhysSlot,
}

impl LeadWrite {
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn slot(&self) -> PhysSlot {
        self.slot
    }
}

/// The dedup table for one checksum algorithm: resident entries, the
/// persistent class objects behind them, and pending repairs.
#[derive(Debug)]
pub struct Ddt {
    pub(crate) checksum: ChecksumAlgo,
    table: Table,
    pub(crate) classes: ClassStore,
    pub(crate) repair: RepairQueue,
    pub(crate) log: Logger,
}

impl Ddt {
    pub fn new(
        checksum: ChecksumAlgo,
        store: Arc<dyn ObjectStore>,
        hash_bits: u32,
        max_resident_entries: usize,
        log: &Logger,
    ) -> Ddt {
        let log = log.new(o!("checksum" => checksum.name()));
        Ddt {
            checksum,
            table: Table::new(hash_bits, max_resident_entries),
            classes: ClassStore::new(checksum, store, log.clone()),
            repair: RepairQueue::new(log.clone()),
            log,
        }
    }

    pub fn checksum(&self) -> ChecksumAlgo {
        self.checksum
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn classes(&self) -> &ClassStore {
        &self.classes
    }

    /// The entry for `key`, loaded from storage on the first lookup since
    /// the last sync. Without `create`, a key that is not already resident
    /// comes back as `None` and nothing is allocated.
    ///
    /// A load that fails for any reason other than a miss fails every
    /// lookup waiting on it, and the entry is dropped from the table.
    pub fn lookup(
        &self,
        key: &Key,
        create: bool,
    ) -> Result<Option<EntryHandle>, DdtError> {
        let entry = if create {
            self.table.lookup_or_insert(key)?.0
        } else {
            match self.table.find(key) {
                Some(e) => e,
                None => return Ok(None),
            }
        };

        let (result, ran) = entry.load_once(|e| self.load(e));
        if let Err(e) = result {
            if ran {
                error!(self.log, "load of {} failed: {}", key, e);
                self.table.remove_exact(&entry);
            }
            return Err(e);
        }

        Ok(Some(entry))
    }

    fn load(&self, entry: &Entry) -> Result<(), DdtError> {
        let key = entry.key();

        for (t, c) in iproduct!(TableType::iter(), TableClass::iter()) {
            match self.classes.lookup(t, c, key) {
                Ok(phys) => {
                    let mut d = entry.lock();
                    d.phys = phys;
                    d.location = Some((t, c));
                    d.lookup_stat = d.generate_stat(key);
                    return Ok(());
                }
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }

        debug!(self.log, "{} is not in any class", key);
        Ok(())
    }

    pub fn prefetch(&self, key: &Key) {
        for (t, c) in iproduct!(TableType::iter(), TableClass::iter()) {
            self.classes.prefetch(t, c, key);
        }
    }

    /// Take a resident entry out of the table without syncing it.
    pub fn remove(&self, key: &Key) -> Option<EntryHandle> {
        self.table.remove(key)
    }

    /// Whether anything is resident, and so whether a sync has work.
    pub fn is_dirty(&self) -> bool {
        !self.table.is_empty()
    }

    /// Start writing the first copy of `entry`'s content into `slot`. The
    /// slot must be empty with no other lead write in flight.
    pub fn begin_lead_write(
        &self,
        entry: &EntryHandle,
        slot: PhysSlot,
    ) -> LeadWrite {
        let mut d = entry.lock();
        assert!(
            !d.phys(slot).is_used(),
            "lead write of {} into used slot {:?}",
            entry.key(),
            slot
        );
        assert_eq!(
            d.pending[slot.index()],
            0,
            "second lead write of {} into {:?}",
            entry.key(),
            slot
        );
        d.pending[slot.index()] = 1;
        LeadWrite {
            key: *entry.key(),
            slot,
        }
    }

    fn lead_entry(&self, lead: &LeadWrite) -> EntryHandle {
        match self.table.find(&lead.key) {
            Some(e) => e,
            None => panic!("lead write of {} lost its entry", lead.key),
        }
    }

    /// Add one more reference to be committed when `lead` finishes.
    pub fn join_lead_write(&self, lead: &LeadWrite) {
        let entry = self.lead_entry(lead);
        entry.lock().pending[lead.slot.index()] += 1;
    }

    /// The lead write landed at `bp`. Fill its slot and commit a reference
    /// for the lead and every writer that joined it.
    pub fn finish_lead_write(&self, lead: LeadWrite, bp: &BlockPointer) {
        let entry = self.lead_entry(&lead);
        let mut d = entry.lock();
        let waiting = std::mem::take(&mut d.pending[lead.slot.index()]);
        let p = d.phys_mut(lead.slot);
        p.fill(bp);
        for _ in 0..waiting {
            p.add_ref();
        }
        debug!(
            self.log,
            "lead write of {} done with {} references", lead.key, waiting
        );
    }

    /// The lead write failed. Nothing is committed; writers that joined it
    /// must write again.
    pub fn abandon_lead_write(&self, lead: LeadWrite) {
        let entry = self.lead_entry(&lead);
        entry.lock().pending[lead.slot.index()] = 0;
    }

    /// Write every resident entry back to its class objects and empty the
    /// table. The caller has made sure `stat_object` exists.
    pub(crate) fn sync_table(
        &self,
        cfg: &DedupConfig,
        stat_object: ObjectId,
        io: &dyn BlockIo,
        scan: &dyn ScanNotifier,
        txg: u64,
    ) -> Result<(), DdtError> {
        let mut synced = 0;
        for i in 0..self.table.bucket_count() {
            for entry in self.table.drain_bucket(i) {
                if entry.load_failed() {
                    continue;
                }
                self.sync_entry(&entry, cfg, stat_object, io, scan, txg)?;
                synced += 1;
            }
        }

        for (t, c) in iproduct!(TableType::iter(), cfg.classes()) {
            if !self.classes.exists(t, c) {
                continue;
            }
            self.classes.sync(t, c, stat_object, txg)?;
            if self.classes.count(t, c)? == 0 {
                self.classes.destroy(t, c, stat_object, txg)?;
            }
        }

        self.classes.publish_histograms();
        debug!(self.log, "synced {} entries", synced; "txg" => txg);
        Ok(())
    }

    fn sync_entry(
        &self,
        entry: &Entry,
        cfg: &DedupConfig,
        stat_object: ObjectId,
        io: &dyn BlockIo,
        scan: &dyn ScanNotifier,
        txg: u64,
    ) -> Result<(), DdtError> {
        let key = *entry.key();
        assert_eq!(entry.state(), LoadState::Loaded, "syncing unloaded {}", key);

        let mut d = entry.lock();
        assert!(
            !d.has_lead_writes(),
            "syncing {} with lead writes in flight",
            key
        );
        let old = d.location;

        // Undo what this entry contributed when it was loaded.
        if let Some((t, c)) = old {
            if d.lookup_stat.ref_blocks != 0 {
                self.classes.apply_stat(t, c, &d.lookup_stat, StatSign::Sub);
            }
        }

        let ditto_limit = cfg.ditto_limit();
        let mut total_refcnt = 0;
        for slot in PhysSlot::iter() {
            let p = *d.phys(slot);
            assert!(p.refcnt >= 0, "{} has a negative refcnt", key);
            if !p.is_used() {
                assert_eq!(p.refcnt, 0, "unused slot of {} is referenced", key);
                continue;
            }

            if slot == PhysSlot::Ditto {
                if d.ditto_copies_needed(None, ditto_limit) == 0 {
                    io.free_block(self.checksum, &key, &p, txg);
                    d.phys_mut(slot).clear();
                }
                continue;
            }

            if p.refcnt == 0 {
                io.free_block(self.checksum, &key, &p, txg);
                d.phys_mut(slot).clear();
            }
            total_refcnt += p.refcnt as u64;
        }

        let nclass = if d.phys(PhysSlot::Ditto).is_used() {
            TableClass::Ditto
        } else if total_refcnt > 1 {
            TableClass::Duplicate
        } else {
            TableClass::Unique
        };
        let nclass = cfg.clamp_class(nclass);
        let ntype = CURRENT_TYPE;

        if let Some((ot, oc)) = old {
            if ot != ntype || oc != nclass || total_refcnt == 0 {
                self.classes.remove(ot, oc, &key, txg)?;
                match self.classes.lookup(ot, oc, &key) {
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                    Ok(_) => {
                        ddt_bail!(
                            StorageCorruption,
                            "{} still in {} after removal",
                            key,
                            self.classes.object_name(ot, oc)
                        );
                    }
                }
            }
        }

        if total_refcnt == 0 {
            d.location = None;
            return Ok(());
        }

        d.location = Some((ntype, nclass));
        let stat = d.generate_stat(&key);
        self.classes.apply_stat(ntype, nclass, &stat, StatSign::Add);
        if !self.classes.exists(ntype, nclass) {
            self.classes.create(ntype, nclass, stat_object, txg)?;
        }
        self.classes.update(ntype, nclass, &key, &d.phys, txg)?;

        // A scan walks classes hottest first. One that has already passed
        // the new class would miss this entry, so it is told now.
        let decreased = match old {
            Some((_, oc)) => nclass < oc,
            None => true,
        };
        if decreased {
            let record = DdtRecord {
                checksum: self.checksum,
                key,
                phys: d.phys,
                table_type: ntype,
                class: nclass,
            };
            scan.class_decreased(self.checksum, &record, txg);
        }

        if let Some((_, oc)) = old.filter(|(_, oc)| *oc != nclass) {
            info!(self.log, "{} moved from {} to {}", key, oc, nclass; "txg" => txg);
        }

        Ok(())
    }

    /// Forget every resident entry, as when a transaction group is thrown
    /// away.
    pub(crate) fn discard(&self) -> usize {
        (0..self.table.bucket_count())
            .map(|i| self.table.drain_bucket(i).len())
            .sum()
    }
}
