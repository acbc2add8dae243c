// Copyright 2025 Oxide Computer Company

#[cfg(test)]
mod test {
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Barrier, Mutex};
    use std::thread;
    use std::time::Duration;

    use anyhow::Result;
    use ddt::*;
    use proptest::prelude::*;
    use rand::Rng;
    use sha2::{Digest, Sha256};
    use slog::Logger;
    use test_strategy::proptest;

    const BLOCK_SIZE: u64 = 4096;

    fn csl() -> Logger {
        build_logger()
    }

    /// Block IO that records frees and holds rewrites until the test
    /// completes them.
    #[derive(Debug, Default)]
    struct CollectingIo {
        freed: Mutex<Vec<(Key, Phys, u64)>>,
        rewrites: Mutex<Vec<(BlockPointer, RewriteReq)>>,
        submitted: Mutex<Vec<BlockPointer>>,
    }

    impl CollectingIo {
        fn freed_in(&self, txg: u64) -> BTreeSet<(Key, Dva)> {
            self.freed
                .lock()
                .unwrap()
                .iter()
                .filter(|(_, _, t)| *t == txg)
                .map(|(k, p, _)| (*k, p.dva[0]))
                .collect()
        }

        fn take_rewrites(&self) -> Vec<(BlockPointer, RewriteReq)> {
            std::mem::take(&mut *self.rewrites.lock().unwrap())
        }
    }

    impl BlockIo for CollectingIo {
        fn free_block(
            &self,
            _checksum: ChecksumAlgo,
            key: &Key,
            phys: &Phys,
            txg: u64,
        ) {
            self.freed.lock().unwrap().push((*key, *phys, txg));
        }

        fn rewrite_block(
            &self,
            bp: &BlockPointer,
            _data: Bytes,
            _priority: IoPriority,
            req: RewriteReq,
        ) {
            self.submitted.lock().unwrap().push(*bp);
            self.rewrites.lock().unwrap().push((*bp, req));
        }
    }

    #[derive(Debug, Default)]
    struct CountingScan {
        moves: Mutex<Vec<(Key, TableClass)>>,
    }

    impl ScanNotifier for CountingScan {
        fn class_decreased(
            &self,
            _checksum: ChecksumAlgo,
            record: &DdtRecord,
            _txg: u64,
        ) {
            self.moves.lock().unwrap().push((record.key, record.class));
        }
    }

    struct TestPool {
        store: Arc<InMemoryObjectStore>,
        io: Arc<CollectingIo>,
        scan: Arc<CountingScan>,
        engine: DedupEngine,
        txg: u64,
    }

    impl TestPool {
        fn new(config: DedupConfig) -> Result<TestPool> {
            TestPool::with_store(Arc::new(InMemoryObjectStore::new()), config)
        }

        fn with_store(
            store: Arc<InMemoryObjectStore>,
            config: DedupConfig,
        ) -> Result<TestPool> {
            let io = Arc::new(CollectingIo::default());
            let scan = Arc::new(CountingScan::default());
            let engine = DedupEngine::open(
                store.clone(),
                io.clone(),
                scan.clone(),
                config,
                &csl(),
            )?;
            let txg = 0;
            Ok(TestPool {
                store,
                io,
                scan,
                engine,
                txg,
            })
        }

        /// Sync the next transaction group, returning its number.
        fn sync(&mut self) -> Result<u64> {
            self.txg += 1;
            self.engine.sync(self.txg)?;
            Ok(self.txg)
        }

        fn records(&self) -> Result<Vec<DdtRecord>> {
            let mut bm = Bookmark::new();
            let mut out = Vec::new();
            while let Some(r) = self.engine.walk(&mut bm)? {
                out.push(r);
            }
            Ok(out)
        }

        fn record_of(&self, bp: &BlockPointer) -> Result<Option<DdtRecord>> {
            let key = Key::from_block_pointer(bp);
            Ok(self.records()?.into_iter().find(|r| r.key == key))
        }
    }

    fn fingerprint(data: &[u8]) -> Checksum {
        let digest = Sha256::digest(data);
        let mut words = [0u64; 4];
        for (w, chunk) in words.iter_mut().zip(digest.chunks(8)) {
            *w = u64::from_be_bytes(chunk.try_into().unwrap());
        }
        Checksum(words)
    }

    fn content(seed: u64) -> Vec<u8> {
        let mut data = vec![0u8; BLOCK_SIZE as usize];
        for (i, b) in data.iter_mut().enumerate() {
            *b = (seed as usize * 31 + i) as u8;
        }
        data
    }

    /// A dedup block pointer for `data` with `copies` DVAs at `offset`.
    fn block_pointer(
        data: &[u8],
        offset: u64,
        copies: usize,
        birth: u64,
    ) -> BlockPointer {
        let mut dva = [Dva::default(); SPA_DVAS_PER_BP];
        for (i, d) in dva.iter_mut().take(copies).enumerate() {
            *d = Dva {
                vdev: i as u32,
                offset,
                asize: BLOCK_SIZE,
                gang: false,
            };
        }
        BlockPointer {
            dva,
            checksum_algo: ChecksumAlgo::Sha256,
            checksum: fingerprint(data),
            lsize: data.len() as u64,
            psize: data.len() as u64,
            compress: 0,
            birth,
            phys_birth: 0,
            dedup: true,
        }
    }

    #[test]
    fn unique_then_duplicate_then_gone() -> Result<()> {
        let mut pool = TestPool::new(DedupConfig::default())?;
        let data = content(1);
        let first = block_pointer(&data, 0x100000, 1, 5);

        // One reference: unique, in bucket 0.
        pool.engine.commit_reference(&first)?;
        pool.sync()?;
        let r = pool.record_of(&first)?.unwrap();
        assert_eq!(r.class, TableClass::Unique);
        let hist = pool.engine.get_dedup_histogram();
        assert_eq!(
            *hist.bucket(0),
            Stat {
                blocks: 1,
                lsize: BLOCK_SIZE,
                psize: BLOCK_SIZE,
                dsize: BLOCK_SIZE,
                ref_blocks: 1,
                ref_lsize: BLOCK_SIZE,
                ref_psize: BLOCK_SIZE,
                ref_dsize: BLOCK_SIZE,
            }
        );

        // A second writer of the same content, this time with two copies.
        let second = block_pointer(&data, 0x200000, 2, 6);
        pool.engine.commit_reference(&second)?;
        let entry = pool.engine.lookup(&second, false)?.unwrap();
        assert_eq!(entry.lock().total_refcnt(), 2);
        pool.sync()?;

        let records = pool.records()?;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].class, TableClass::Duplicate);
        let ddt = pool.engine.select(ChecksumAlgo::Sha256);
        assert!(!ddt.classes().exists(TableType::Zap, TableClass::Unique));
        assert!(ddt.classes().exists(TableType::Zap, TableClass::Duplicate));
        let hist = pool.engine.get_dedup_histogram();
        assert!(hist.bucket(0).is_empty());
        assert_eq!(hist.bucket(1).ref_blocks, 2);
        assert_eq!(hist.bucket(1).blocks, 2);

        // Both references go, and so do both copies.
        pool.engine.release_reference(&first)?;
        pool.engine.release_reference(&second)?;
        let txg = pool.sync()?;

        let freed = pool.io.freed_in(txg);
        assert_eq!(freed.len(), 2);
        assert!(freed.iter().any(|(_, d)| *d == first.dva[0]));
        assert!(freed.iter().any(|(_, d)| *d == second.dva[0]));
        assert!(pool.records()?.is_empty());
        assert!(pool.engine.lookup(&first, false)?.is_none());
        assert!(pool.engine.get_dedup_histogram().is_empty());
        Ok(())
    }

    #[test]
    fn hot_content_gets_a_ditto_copy() -> Result<()> {
        let mut pool = TestPool::new(DedupConfig {
            ditto_threshold: 4,
            ..Default::default()
        })?;
        let data = content(2);
        let bp = block_pointer(&data, 0x100000, 1, 5);

        for _ in 0..3 {
            pool.engine.commit_reference(&bp)?;
        }
        pool.sync()?;

        // The fourth reference crosses the threshold: one more copy.
        let entry = pool.engine.lookup(&bp, true)?.unwrap();
        assert_eq!(
            pool.engine
                .ditto_copies_needed(&entry, Some(PhysSlot::Single)),
            1
        );
        pool.engine.commit_reference(&bp)?;
        assert_eq!(pool.engine.ditto_copies_needed(&entry, None), 1);

        pool.engine
            .commit_ditto(&block_pointer(&data, 0x900000, 1, 5))?;
        assert_eq!(pool.engine.ditto_copies_needed(&entry, None), 1);
        pool.sync()?;

        let r = pool.record_of(&bp)?.unwrap();
        assert_eq!(r.class, TableClass::Ditto);
        assert_eq!(r.total_refcnt(), 4);

        // Moving to a hotter class was reported to the scanner.
        let moves = pool.scan.moves.lock().unwrap();
        assert_eq!(moves.last().unwrap().1, TableClass::Ditto);
        Ok(())
    }

    #[test]
    fn repair_releases_after_rewrites_submitted() -> Result<()> {
        let mut pool = TestPool::new(DedupConfig::default())?;
        let data = content(3);
        let one = block_pointer(&data, 0x100000, 1, 7);
        let two = block_pointer(&data, 0x300000, 2, 7);
        pool.engine.commit_reference(&one)?;
        pool.engine.commit_reference(&two)?;
        pool.sync()?;

        let mut rdde = pool.engine.repair_start(&one)?;
        assert_eq!(
            rdde.location,
            Some((TableType::Zap, TableClass::Duplicate))
        );
        rdde.set_repair_data(Bytes::from(data.clone()));
        pool.engine.repair_done(&one, rdde);

        let txg = pool.txg + 1;
        let seen = thread::scope(|s| {
            let completer = s.spawn(|| {
                let mut reqs = Vec::new();
                while reqs.len() < 2 {
                    reqs.extend(pool.io.take_rewrites());
                    thread::sleep(Duration::from_millis(1));
                }
                // Every rewrite is out, and the repair entry is still held.
                let stats = pool.engine.repair_stats();
                for (_, req) in reqs {
                    req.send_ok();
                }
                stats
            });
            pool.engine.sync(txg).unwrap();
            completer.join().unwrap()
        });
        pool.txg = txg;

        assert_eq!(seen.in_flight, 1);
        assert_eq!(seen.released, 0);
        assert_eq!(seen.rewrites, 2);

        let after = pool.engine.repair_stats();
        assert_eq!(after.in_flight, 0);
        assert_eq!(after.released, 1);
        assert_eq!(after.pending, 0);

        let submitted = pool.io.submitted.lock().unwrap();
        assert_eq!(submitted.len(), 2);
        assert!(submitted.iter().any(|bp| bp.dva == one.dva));
        assert!(submitted.iter().any(|bp| bp.dva == two.dva));
        Ok(())
    }

    #[test]
    fn repairs_only_flush_on_first_pass() -> Result<()> {
        let mut pool = TestPool::new(DedupConfig::default())?;
        let data = content(4);
        let bp = block_pointer(&data, 0x100000, 1, 7);
        pool.engine.commit_reference(&bp)?;
        pool.engine.commit_reference(&bp)?;
        pool.sync()?;

        let mut rdde = pool.engine.repair_start(&bp)?;
        rdde.set_repair_data(Bytes::from(data));
        pool.engine.repair_done(&bp, rdde);

        pool.txg += 1;
        pool.engine.sync_pass(pool.txg, 2)?;
        pool.engine.commit(pool.txg)?;
        assert_eq!(pool.engine.repair_stats().pending, 1);
        assert!(pool.io.submitted.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn failed_rewrite_does_not_fail_sync() -> Result<()> {
        let mut pool = TestPool::new(DedupConfig::default())?;
        let data = content(5);
        let bp = block_pointer(&data, 0x100000, 1, 7);
        pool.engine.commit_reference(&bp)?;
        pool.engine.commit_reference(&bp)?;
        pool.sync()?;

        let mut rdde = pool.engine.repair_start(&bp)?;
        rdde.set_repair_data(Bytes::from(data));
        pool.engine.repair_done(&bp, rdde);

        let txg = pool.txg + 1;
        thread::scope(|s| {
            s.spawn(|| loop {
                let reqs = pool.io.take_rewrites();
                if !reqs.is_empty() {
                    for (_, req) in reqs {
                        req.send_err(DdtError::IoError("checksum".into()));
                    }
                    break;
                }
                thread::sleep(Duration::from_millis(1));
            });
            pool.engine.sync(txg).unwrap();
        });

        assert_eq!(pool.engine.repair_stats().released, 1);
        Ok(())
    }

    #[test]
    fn dspace_grows_with_duplicates() -> Result<()> {
        let mut pool = TestPool::new(DedupConfig::default())?;
        assert_eq!(pool.engine.get_dedup_dspace(), 0);

        let data = content(6);
        let bp = block_pointer(&data, 0x100000, 1, 5);
        pool.engine.commit_reference(&bp)?;
        pool.sync()?;
        let mut last = pool.engine.get_dedup_dspace();
        assert_eq!(last, 0);

        for _ in 0..4 {
            pool.engine.commit_reference(&bp)?;
            pool.sync()?;
            let now = pool.engine.get_dedup_dspace();
            assert!(now > last, "dspace went from {} to {}", last, now);
            last = now;
        }
        Ok(())
    }

    #[test]
    fn dedup_ratio_never_drops_as_duplicates_arrive() -> Result<()> {
        let mut pool = TestPool::new(DedupConfig::default())?;
        let mut rng = rand::thread_rng();

        // Some unrelated unique content.
        for seed in 100..110 {
            let offset = rng.gen_range(1..1u64 << 30) * BLOCK_SIZE;
            pool.engine
                .commit_reference(&block_pointer(&content(seed), offset, 1, 3))?;
        }
        pool.sync()?;
        assert_eq!(pool.engine.get_pool_dedup_ratio(), 100);

        let data = content(7);
        let bp = block_pointer(&data, 0x100000, 1, 5);
        let mut last = pool.engine.get_pool_dedup_ratio();
        for _ in 0..16 {
            pool.engine.commit_reference(&bp)?;
            pool.sync()?;
            let ratio = pool.engine.get_pool_dedup_ratio();
            assert!(ratio >= last, "ratio went from {} to {}", last, ratio);
            last = ratio;
        }
        assert!(last > 100);
        Ok(())
    }

    #[test]
    fn reload_after_eviction_matches_every_class() -> Result<()> {
        let mut pool = TestPool::new(DedupConfig {
            ditto_threshold: 2,
            ..Default::default()
        })?;

        let unique = block_pointer(&content(8), 0x100000, 1, 5);
        pool.engine.commit_reference(&unique)?;

        let duplicate = block_pointer(&content(9), 0x200000, 2, 5);
        pool.engine.commit_reference(&duplicate)?;
        pool.engine.commit_reference(&duplicate)?;

        let data = content(10);
        let ditto = block_pointer(&data, 0x300000, 1, 5);
        pool.engine.commit_reference(&ditto)?;
        pool.engine.commit_reference(&ditto)?;
        pool.engine
            .commit_ditto(&block_pointer(&data, 0x400000, 1, 5))?;
        pool.sync()?;

        let expect = [
            (unique, TableClass::Unique),
            (duplicate, TableClass::Duplicate),
            (ditto, TableClass::Ditto),
        ];
        for (bp, class) in expect.iter() {
            let record = pool.record_of(bp)?.unwrap();
            assert_eq!(record.class, *class);

            let entry = pool.engine.lookup(bp, true)?.unwrap();
            let d = entry.lock();
            assert_eq!(d.location, Some((TableType::Zap, *class)));
            assert_eq!(d.phys, record.phys);
        }

        // Two copies of `duplicate` already meet the target.
        let entry = pool.engine.lookup(&duplicate, true)?.unwrap();
        assert!(!entry.lock().phys(PhysSlot::Ditto).is_used());
        Ok(())
    }

    #[test]
    fn concurrent_first_lookups_read_storage_once() -> Result<()> {
        let mut pool = TestPool::new(DedupConfig::default())?;
        pool.engine
            .commit_reference(&block_pointer(&content(11), 0x100000, 1, 5))?;
        pool.sync()?;

        let threads = 16;
        pool.store.set_lookup_delay(Some(Duration::from_millis(25)));
        let before = pool.store.lookup_count();
        let bp = block_pointer(&content(12), 0x200000, 1, 6);
        let barrier = Barrier::new(threads);

        let handles: Vec<EntryHandle> = thread::scope(|s| {
            let workers: Vec<_> = (0..threads)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        pool.engine.lookup(&bp, true).unwrap().unwrap()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });
        pool.store.set_lookup_delay(None);

        assert_eq!(handles.len(), threads);
        assert_eq!(pool.store.lookup_count() - before, 1);
        assert!(handles.iter().all(|h| Arc::ptr_eq(h, &handles[0])));
        Ok(())
    }

    #[test]
    fn class_contains_during_syncs() -> Result<()> {
        let mut pool = TestPool::new(DedupConfig::default())?;
        let bp = block_pointer(&content(13), 0x100000, 1, 5);
        pool.engine.commit_reference(&bp)?;
        pool.sync()?;

        let stop = AtomicBool::new(false);
        let txg = pool.txg;
        thread::scope(|s| {
            let reader = s.spawn(|| {
                let mut checks = 0;
                loop {
                    assert!(pool
                        .engine
                        .class_contains(TableClass::Unique, &bp)
                        .unwrap());
                    checks += 1;
                    if stop.load(Ordering::Acquire) {
                        return checks;
                    }
                }
            });
            // Other content comes and goes while the reader runs.
            for t in txg + 1..txg + 20 {
                let other = block_pointer(&content(1000 + t), 0x200000, 1, t);
                pool.engine.prefetch(&bp);
                pool.engine.commit_reference(&other).unwrap();
                pool.engine.sync(t).unwrap();
            }
            stop.store(true, Ordering::Release);
            assert!(reader.join().unwrap() > 0);
        });
        Ok(())
    }

    #[test]
    fn snapshot_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("pool.json");

        let mut pool = TestPool::new(DedupConfig::default())?;
        for seed in 0..8 {
            let bp = block_pointer(&content(seed), 0x100000 * (seed + 1), 1, 5);
            for _ in 0..=seed % 3 {
                pool.engine.commit_reference(&bp)?;
            }
        }
        pool.sync()?;
        pool.store.save(&path)?;

        let store = Arc::new(InMemoryObjectStore::open(&path)?);
        let reopened = TestPool::with_store(store, DedupConfig::default())?;
        assert_eq!(
            reopened.engine.get_dedup_histogram(),
            pool.engine.get_dedup_histogram()
        );
        assert_eq!(reopened.records()?, pool.records()?);
        Ok(())
    }

    #[derive(Debug, Clone, Copy)]
    enum Op {
        Commit { content: u64, copies: usize },
        Release { content: u64, copies: usize },
        Sync,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0u64..4, 1usize..3)
                .prop_map(|(content, copies)| Op::Commit { content, copies }),
            (0u64..4, 1usize..3)
                .prop_map(|(content, copies)| Op::Release { content, copies }),
            Just(Op::Sync),
        ]
    }

    fn op_block(content: u64, copies: usize) -> BlockPointer {
        let offset = 0x100000 * (content * 4 + copies as u64 + 1);
        block_pointer(&self::content(content), offset, copies, 9)
    }

    /// Every sync frees exactly the copies that lost their last reference,
    /// and leaves each key in at most one class.
    #[proptest]
    fn frees_match_lost_references(
        #[strategy(proptest::collection::vec(op(), 1..60))] ops: Vec<Op>,
    ) {
        let mut pool = TestPool::new(DedupConfig::default()).unwrap();
        let mut refs: BTreeMap<(u64, usize), i64> = BTreeMap::new();
        let mut used: BTreeSet<(u64, usize)> = BTreeSet::new();

        for op in ops.into_iter().chain(std::iter::once(Op::Sync)) {
            match op {
                Op::Commit { content, copies } => {
                    pool.engine
                        .commit_reference(&op_block(content, copies))
                        .unwrap();
                    *refs.entry((content, copies)).or_default() += 1;
                    used.insert((content, copies));
                }
                Op::Release { content, copies } => {
                    let r = refs.entry((content, copies)).or_default();
                    if *r == 0 {
                        continue;
                    }
                    pool.engine
                        .release_reference(&op_block(content, copies))
                        .unwrap();
                    *r -= 1;
                }
                Op::Sync => {
                    let txg = pool.sync().unwrap();

                    let expect: BTreeSet<(Key, Dva)> = used
                        .iter()
                        .filter(|k| refs.get(k).copied().unwrap_or(0) == 0)
                        .map(|(c, n)| {
                            let bp = op_block(*c, *n);
                            (Key::from_block_pointer(&bp), bp.dva[0])
                        })
                        .collect();
                    prop_assert_eq!(pool.io.freed_in(txg), expect);
                    used.retain(|k| refs.get(k).copied().unwrap_or(0) != 0);

                    let records = pool.records().unwrap();
                    let keys: BTreeSet<Key> =
                        records.iter().map(|r| r.key).collect();
                    prop_assert_eq!(keys.len(), records.len());
                    for r in records.iter() {
                        for p in r.phys.iter() {
                            prop_assert_eq!(p.phys_birth == 0, p.refcnt == 0);
                        }
                    }
                }
            }
        }
    }
}
