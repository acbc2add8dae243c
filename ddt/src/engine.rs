// Copyright 2025 Oxide Computer Company
use std::sync::{Arc, Mutex, RwLock};

use ddt_common::ddt_bail;
use itertools::iproduct;
use serde::{Deserialize, Serialize};
use slog::{debug, error, info, o, warn, Logger};
use strum::IntoEnumIterator;

use crate::*;

/// Where a walk of the persisted dedup records is up to.
///
/// Classes are walked hottest first. Within a class every table type is
/// walked, and within a type every checksum algorithm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bookmark {
    pub class: TableClass,
    pub table_type: TableType,
    pub checksum: ChecksumAlgo,
    pub cursor: u64,
    done: bool,
}

impl Default for Bookmark {
    fn default() -> Self {
        Bookmark {
            class: TableClass::Ditto,
            table_type: TableType::Zap,
            checksum: ChecksumAlgo::Inherit,
            cursor: 0,
            done: false,
        }
    }
}

impl Bookmark {
    pub fn new() -> Bookmark {
        Bookmark::default()
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    fn advance(&mut self) {
        self.cursor = 0;
        if let Some(c) = self.checksum.next() {
            self.checksum = c;
            return;
        }
        self.checksum = ChecksumAlgo::Inherit;

        if let Some(t) = self.table_type.next() {
            self.table_type = t;
            return;
        }
        self.table_type = TableType::Zap;

        match self.class.next() {
            Some(c) => self.class = c,
            None => self.done = true,
        }
    }
}

/**
 * The pool's dedup tables, one per checksum algorithm, and the statistics
 * kept across all of them.
 *
 * Lookups and reference changes may come from any number of threads. Only
 * one sync runs at a time; it writes every resident entry back to the
 * object store, flushes pending repairs, and leaves the tables empty.
 */
#[derive(Debug)]
pub struct DedupEngine {
    store: Arc<dyn ObjectStore>,
    io: Arc<dyn BlockIo>,
    scan: Arc<dyn ScanNotifier>,
    config: RwLock<DedupConfig>,
    ddts: Vec<Ddt>,

    /// Holds every class's histogram. Created by the first sync with
    /// anything to write.
    stat_object: Mutex<Option<ObjectId>>,

    sync_lock: Mutex<()>,
    log: Logger,
}

impl DedupEngine {
    /// Build the tables for every checksum algorithm and load whatever
    /// dedup state `store` already holds.
    pub fn open(
        store: Arc<dyn ObjectStore>,
        io: Arc<dyn BlockIo>,
        scan: Arc<dyn ScanNotifier>,
        config: DedupConfig,
        log: &Logger,
    ) -> Result<DedupEngine, DdtError> {
        config
            .validate()
            .map_err(|e| DdtError::InvalidConfig(e.to_string()))?;

        let log = log.new(o!("component" => "ddt"));
        let ddts = ChecksumAlgo::iter()
            .map(|c| {
                Ddt::new(
                    c,
                    store.clone(),
                    config.hash_bits,
                    config.max_resident_entries,
                    &log,
                )
            })
            .collect();

        let engine = DedupEngine {
            store,
            io,
            scan,
            config: RwLock::new(config),
            ddts,
            stat_object: Mutex::new(None),
            sync_lock: Mutex::new(()),
            log,
        };
        engine.load()?;

        let entries = engine.get_dedup_object_stats().count;
        info!(engine.log, "dedup tables open"; "entries" => entries);
        Ok(engine)
    }

    /// Find the statistics object and every class object, and seed the
    /// cached statistics from them. Forgets any class state held before.
    fn load(&self) -> Result<(), DdtError> {
        let mut stat_object = self.stat_object.lock().unwrap();
        *stat_object = None;
        for ddt in self.ddts.iter() {
            ddt.classes.reset();
        }

        let id: ObjectId = match self
            .store
            .directory_lookup(POOL_DIRECTORY_OBJECT, DDT_STATS_NAME)
        {
            Ok(buf) => bincode::deserialize(&buf)?,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        for ddt in self.ddts.iter() {
            for (t, c) in iproduct!(TableType::iter(), TableClass::iter()) {
                match ddt.classes.load(t, c, id) {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            ddt.classes.publish_histograms();
        }

        *stat_object = Some(id);
        Ok(())
    }

    pub fn config(&self) -> DedupConfig {
        *self.config.read().unwrap()
    }

    /// Replace the configuration. Takes effect from the next sync pass.
    /// `hash_bits` and `max_resident_entries` are only read at open.
    pub fn set_config(&self, config: DedupConfig) -> Result<(), DdtError> {
        config
            .validate()
            .map_err(|e| DdtError::InvalidConfig(e.to_string()))?;

        let mut current = self.config.write().unwrap();
        if current.hash_bits != config.hash_bits
            || current.max_resident_entries != config.max_resident_entries
        {
            warn!(
                self.log,
                "table shape changes are ignored until the pool is reopened"
            );
        }
        *current = config;
        Ok(())
    }

    pub fn select(&self, checksum: ChecksumAlgo) -> &Ddt {
        &self.ddts[checksum.id()]
    }

    pub fn select_by_block_pointer(&self, bp: &BlockPointer) -> &Ddt {
        self.select(bp.checksum_algo)
    }

    pub fn lookup(
        &self,
        bp: &BlockPointer,
        create: bool,
    ) -> Result<Option<EntryHandle>, DdtError> {
        self.select_by_block_pointer(bp)
            .lookup(&Key::from_block_pointer(bp), create)
    }

    fn lookup_or_create(
        &self,
        bp: &BlockPointer,
    ) -> Result<EntryHandle, DdtError> {
        self.lookup(bp, true)?.ok_or(DdtError::NotFound)
    }

    /// Warm the object store for a dedup block that is about to be looked
    /// up, typically because it is being freed.
    pub fn prefetch(&self, bp: &BlockPointer) {
        if !self.config().prefetch || !bp.dedup {
            return;
        }
        self.select_by_block_pointer(bp)
            .prefetch(&Key::from_block_pointer(bp));
    }

    pub fn ditto_copies_needed(
        &self,
        entry: &EntryHandle,
        willref: Option<PhysSlot>,
    ) -> i32 {
        let limit = self.config().ditto_limit();
        entry.lock().ditto_copies_needed(willref, limit)
    }

    /// Record a new logical reference to the content `bp` names. If no copy
    /// with `bp`'s number of DVAs exists yet, `bp` becomes that copy.
    /// Returns the copy the reference now points at.
    pub fn commit_reference(&self, bp: &BlockPointer) -> Result<Phys, DdtError> {
        let Some(slot) = PhysSlot::for_copies(bp.ndvas()) else {
            ddt_bail!(
                BadBlockPointer,
                "{} has {} valid DVAs",
                Key::from_block_pointer(bp),
                bp.ndvas()
            );
        };
        let entry = self.lookup_or_create(bp)?;
        let mut d = entry.lock();
        let p = d.phys_mut(slot);
        if !p.is_used() {
            p.fill(bp);
        }
        p.add_ref();
        Ok(*p)
    }

    /// Drop the reference `bp` holds. `bp` must point at a copy the table
    /// knows about.
    pub fn release_reference(&self, bp: &BlockPointer) -> Result<(), DdtError> {
        let entry = self.lookup_or_create(bp)?;
        let mut d = entry.lock();
        let Some(slot) = d.select_for(bp) else {
            panic!("release of {} which is not a known copy", entry.key());
        };
        d.phys_mut(slot).remove_ref();
        Ok(())
    }

    /// Record `bp` as the extra ditto copy of its content.
    pub fn commit_ditto(&self, bp: &BlockPointer) -> Result<(), DdtError> {
        let entry = self.lookup_or_create(bp)?;
        let mut d = entry.lock();
        let p = d.phys_mut(PhysSlot::Ditto);
        p.fill(bp);
        p.add_ref();
        Ok(())
    }

    /// Take a resident entry out of its table without syncing it.
    pub fn remove(&self, bp: &BlockPointer) -> Option<EntryHandle> {
        self.select_by_block_pointer(bp)
            .remove(&Key::from_block_pointer(bp))
    }

    /// Run one sync pass for `txg` and commit it.
    pub fn sync(&self, txg: u64) -> Result<(), DdtError> {
        self.sync_pass(txg, 1)?;
        self.commit(txg)
    }

    /// Write every resident entry for `txg` to the object store. Repairs
    /// are only flushed on the first pass. Returns once every rewrite it
    /// issued has completed. On failure the transaction group is aborted.
    pub fn sync_pass(&self, txg: u64, pass: u32) -> Result<(), DdtError> {
        let _guard = self.sync_lock.lock().unwrap();
        let cfg = self.config();

        let mut waiters = Vec::new();
        let result = self.sync_tables(&cfg, txg, pass, &mut waiters);

        for w in waiters {
            if let Err(e) = w.wait() {
                warn!(self.log, "repair rewrite failed: {}", e; "txg" => txg);
            }
        }

        if let Err(e) = result {
            self.abort(txg, &e);
            return Err(e);
        }
        Ok(())
    }

    pub fn commit(&self, txg: u64) -> Result<(), DdtError> {
        let _guard = self.sync_lock.lock().unwrap();
        if let Err(e) = self.store.commit(txg) {
            self.abort(txg, &e);
            return Err(e);
        }
        debug!(self.log, "committed"; "txg" => txg);
        Ok(())
    }

    fn sync_tables(
        &self,
        cfg: &DedupConfig,
        txg: u64,
        pass: u32,
        waiters: &mut Vec<RewriteWaiter>,
    ) -> Result<(), DdtError> {
        for ddt in self.ddts.iter() {
            if ddt.is_dirty() {
                let stat_object = self.stat_object(txg)?;
                ddt.sync_table(
                    cfg,
                    stat_object,
                    self.io.as_ref(),
                    self.scan.as_ref(),
                    txg,
                )?;
            }
            ddt.repair_table(self.io.as_ref(), cfg.writeable, pass, waiters)?;
        }
        Ok(())
    }

    fn stat_object(&self, txg: u64) -> Result<ObjectId, DdtError> {
        let mut stat_object = self.stat_object.lock().unwrap();
        if let Some(id) = *stat_object {
            return Ok(id);
        }

        let id = self.store.create_object(ObjectKind::DedupStats, txg)?;
        self.store.directory_add(
            POOL_DIRECTORY_OBJECT,
            DDT_STATS_NAME,
            &bincode::serialize(&id)?,
            txg,
        )?;
        info!(self.log, "created {} as object {}", DDT_STATS_NAME, id; "txg" => txg);
        *stat_object = Some(id);
        Ok(id)
    }

    /// Throw away everything `txg` changed: the store's open group and
    /// every resident entry. Class state goes back to what is committed.
    fn abort(&self, txg: u64, cause: &DdtError) {
        error!(self.log, "aborting: {}", cause; "txg" => txg);
        self.store.abort(txg);

        let discarded: usize = self.ddts.iter().map(|d| d.discard()).sum();
        if discarded != 0 {
            warn!(self.log, "discarded {} resident entries", discarded);
        }

        if let Err(e) = self.load() {
            error!(self.log, "reload after abort failed: {}", e);
        }
    }

    /// The next persisted record after `bookmark`, advancing it. `None`
    /// once every record has been visited.
    pub fn walk(
        &self,
        bookmark: &mut Bookmark,
    ) -> Result<Option<DdtRecord>, DdtError> {
        while !bookmark.done {
            let ddt = self.select(bookmark.checksum);
            let (t, c) = (bookmark.table_type, bookmark.class);
            if ddt.classes.exists(t, c) {
                match ddt.classes.walk(t, c, &mut bookmark.cursor) {
                    Ok((key, phys)) => {
                        return Ok(Some(DdtRecord {
                            checksum: ddt.checksum,
                            key,
                            phys,
                            table_type: t,
                            class: c,
                        }));
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            bookmark.advance();
        }
        Ok(None)
    }

    /// Whether `bp`'s content is persisted in `max_class` or a hotter class.
    pub fn class_contains(
        &self,
        max_class: TableClass,
        bp: &BlockPointer,
    ) -> Result<bool, DdtError> {
        if !bp.dedup {
            return Ok(false);
        }

        let cfg = self.config();
        let max_class = max_class.min(cfg.class_max);
        let ddt = self.select_by_block_pointer(bp);
        let key = Key::from_block_pointer(bp);

        for (t, c) in iproduct!(
            TableType::iter(),
            TableClass::range(cfg.class_min, max_class)
        ) {
            match ddt.classes.lookup(t, c, &key) {
                Ok(_) => return Ok(true),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(false)
    }

    pub fn repair_start(
        &self,
        bp: &BlockPointer,
    ) -> Result<RepairEntry, DdtError> {
        self.select_by_block_pointer(bp)
            .repair_start(&Key::from_block_pointer(bp))
    }

    pub fn repair_done(&self, bp: &BlockPointer, entry: RepairEntry) {
        let writeable = self.config().writeable;
        self.select_by_block_pointer(bp)
            .repair_done(entry, writeable);
    }

    pub fn repair_stats(&self) -> RepairStats {
        self.ddts.iter().map(|d| d.repair.stats()).fold(
            RepairStats::default(),
            |mut acc, s| {
                acc.pending += s.pending;
                acc.in_flight += s.in_flight;
                acc.released += s.released;
                acc.rewrites += s.rewrites;
                acc
            },
        )
    }

    /// Object counts and average per-entry disk and memory space across
    /// every class in the configured range.
    pub fn get_dedup_object_stats(&self) -> ObjectStats {
        let cfg = self.config();
        let mut total = ObjectStats::default();
        for (ddt, t, c) in
            iproduct!(self.ddts.iter(), TableType::iter(), cfg.classes())
        {
            let o = ddt.classes.object_stats(t, c);
            total.count += o.count;
            total.dspace += o.dspace;
            total.mspace += o.mspace;
        }

        if total.count != 0 {
            total.dspace /= total.count;
            total.mspace /= total.count;
        }
        total
    }

    /// The published histograms of every class in range, summed.
    pub fn get_dedup_histogram(&self) -> Histogram {
        let cfg = self.config();
        let mut h = Histogram::default();
        for (ddt, t, c) in
            iproduct!(self.ddts.iter(), TableType::iter(), cfg.classes())
        {
            h.add(&ddt.classes.cached_histogram(t, c));
        }
        h
    }

    pub fn get_dedup_stats(&self) -> Stat {
        self.get_dedup_histogram().total()
    }

    /// Space saved by dedup: referenced minus allocated.
    pub fn get_dedup_dspace(&self) -> i64 {
        let s = self.get_dedup_stats();
        s.ref_dsize as i64 - s.dsize as i64
    }

    /// Referenced over allocated space, as a percentage.
    pub fn get_pool_dedup_ratio(&self) -> u64 {
        let s = self.get_dedup_stats();
        if s.dsize == 0 {
            return 100;
        }
        s.ref_dsize * 100 / s.dsize
    }
}
