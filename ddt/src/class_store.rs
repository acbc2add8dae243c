// Copyright 2025 Oxide Computer Company
use std::sync::{Arc, Mutex, RwLock};

use slog::{debug, info, Logger};

use crate::*;

type Grid<T> = [[T; DDT_CLASSES]; DDT_TYPES];

#[derive(Debug, Default)]
struct ClassStats {
    /// Live histograms, changed only while syncing.
    histogram: Grid<Histogram>,
    /// What queries see: a copy of `histogram` taken after each sync.
    histogram_cache: Grid<Histogram>,
    object_stats: Grid<ObjectStats>,
}

/// Records are the entry's four physical slots. Only the `Zap` format
/// exists, so this is the one encoding.
fn encode_record(
    table_type: TableType,
    phys: &[Phys; DDT_PHYS_TYPES],
) -> Result<Vec<u8>, DdtError> {
    match table_type {
        TableType::Zap => Ok(bincode::serialize(phys)?),
    }
}

fn decode_record(
    table_type: TableType,
    buf: &[u8],
) -> Result<[Phys; DDT_PHYS_TYPES], DdtError> {
    match table_type {
        TableType::Zap => Ok(bincode::deserialize(buf)?),
    }
}

/// Something the pool must have, a directory name or a record the table
/// already knows about: losing it is corruption, not a miss.
fn required(e: DdtError, name: &str) -> DdtError {
    match e {
        DdtError::NotFound => {
            DdtError::StorageCorruption(format!("{} is missing", name))
        }
        e => e,
    }
}

/// The persistent side of one checksum algorithm's dedup table: a backing
/// object per (type, class), each with a histogram in the pool's stats
/// object and some cached size information.
#[derive(Debug)]
pub struct ClassStore {
    checksum: ChecksumAlgo,
    store: Arc<dyn ObjectStore>,
    objects: RwLock<Grid<Option<ObjectId>>>,
    stats: Mutex<ClassStats>,
    log: Logger,
}

impl ClassStore {
    pub fn new(
        checksum: ChecksumAlgo,
        store: Arc<dyn ObjectStore>,
        log: Logger,
    ) -> ClassStore {
        ClassStore {
            checksum,
            store,
            objects: RwLock::new(Default::default()),
            stats: Mutex::new(ClassStats::default()),
            log,
        }
    }

    /// "<checksum>-<type>-<class>", the object's name in the pool
    /// directory and in the stats object.
    pub fn object_name(&self, t: TableType, c: TableClass) -> String {
        format!("{}-{}-{}", self.checksum.name(), t, c)
    }

    fn object(&self, t: TableType, c: TableClass) -> Option<ObjectId> {
        self.objects.read().unwrap()[t.index()][c.index()]
    }

    fn existing(&self, t: TableType, c: TableClass) -> ObjectId {
        match self.object(t, c) {
            Some(id) => id,
            None => panic!("{} does not exist", self.object_name(t, c)),
        }
    }

    pub fn exists(&self, t: TableType, c: TableClass) -> bool {
        self.object(t, c).is_some()
    }

    pub fn create(
        &self,
        t: TableType,
        c: TableClass,
        stat_object: ObjectId,
        txg: u64,
    ) -> Result<(), DdtError> {
        assert!(!self.exists(t, c));

        let name = self.object_name(t, c);
        let prehash = self.checksum.dedup();
        let id = self
            .store
            .create_object(ObjectKind::DedupTable { prehash }, txg)?;

        self.store.directory_add(
            POOL_DIRECTORY_OBJECT,
            &name,
            &bincode::serialize(&id)?,
            txg,
        )?;

        let histogram =
            self.stats.lock().unwrap().histogram[t.index()][c.index()].clone();
        self.store.directory_add(
            stat_object,
            &name,
            &bincode::serialize(&histogram)?,
            txg,
        )?;

        self.objects.write().unwrap()[t.index()][c.index()] = Some(id);
        info!(self.log, "created {} as object {}", name, id; "txg" => txg);
        Ok(())
    }

    pub fn destroy(
        &self,
        t: TableType,
        c: TableClass,
        stat_object: ObjectId,
        txg: u64,
    ) -> Result<(), DdtError> {
        let id = self.existing(t, c);
        let name = self.object_name(t, c);

        assert_eq!(self.count(t, c)?, 0, "destroying non-empty {}", name);
        assert!(
            self.stats.lock().unwrap().histogram[t.index()][c.index()]
                .is_empty(),
            "destroying {} with a non-empty histogram",
            name
        );

        self.store
            .directory_remove(POOL_DIRECTORY_OBJECT, &name, txg)
            .map_err(|e| required(e, &name))?;
        self.store
            .directory_remove(stat_object, &name, txg)
            .map_err(|e| required(e, &name))?;
        self.store.destroy_object(id, txg)?;

        self.stats.lock().unwrap().object_stats[t.index()][c.index()] =
            ObjectStats::default();
        self.objects.write().unwrap()[t.index()][c.index()] = None;
        info!(self.log, "destroyed {}", name; "txg" => txg);
        Ok(())
    }

    /// Find this class's object and histogram in the pool, and seed the
    /// cached stats from it. `NotFound` if the class has no object.
    pub fn load(
        &self,
        t: TableType,
        c: TableClass,
        stat_object: ObjectId,
    ) -> Result<(), DdtError> {
        let name = self.object_name(t, c);

        let id: ObjectId = bincode::deserialize(
            &self.store.directory_lookup(POOL_DIRECTORY_OBJECT, &name)?,
        )?;
        let histogram: Histogram = bincode::deserialize(
            &self
                .store
                .directory_lookup(stat_object, &name)
                .map_err(|e| required(e, &name))?,
        )?;

        self.objects.write().unwrap()[t.index()][c.index()] = Some(id);
        self.stats.lock().unwrap().histogram[t.index()][c.index()] = histogram;
        self.refresh_object_stats(t, c)?;

        debug!(self.log, "loaded {} from object {}", name, id);
        Ok(())
    }

    /// Write the histogram back and refresh the cached size information.
    pub fn sync(
        &self,
        t: TableType,
        c: TableClass,
        stat_object: ObjectId,
        txg: u64,
    ) -> Result<(), DdtError> {
        let name = self.object_name(t, c);
        let histogram =
            self.stats.lock().unwrap().histogram[t.index()][c.index()].clone();
        self.store.directory_update(
            stat_object,
            &name,
            &bincode::serialize(&histogram)?,
            txg,
        )?;

        self.refresh_object_stats(t, c)
    }

    fn refresh_object_stats(
        &self,
        t: TableType,
        c: TableClass,
    ) -> Result<(), DdtError> {
        let info = self.info(t, c)?;
        let count = self.count(t, c)?;
        self.stats.lock().unwrap().object_stats[t.index()][c.index()] =
            ObjectStats {
                count,
                dspace: info.physical_blocks_512 << 9,
                mspace: info.fill_count * info.data_block_size,
            };
        Ok(())
    }

    pub fn lookup(
        &self,
        t: TableType,
        c: TableClass,
        key: &Key,
    ) -> Result<[Phys; DDT_PHYS_TYPES], DdtError> {
        let Some(id) = self.object(t, c) else {
            return Err(DdtError::NotFound);
        };
        let record = self.store.object_lookup(id, &key.to_bytes())?;
        decode_record(t, &record)
    }

    pub fn update(
        &self,
        t: TableType,
        c: TableClass,
        key: &Key,
        phys: &[Phys; DDT_PHYS_TYPES],
        txg: u64,
    ) -> Result<(), DdtError> {
        let id = self.existing(t, c);
        self.store.object_update(
            id,
            &key.to_bytes(),
            &encode_record(t, phys)?,
            txg,
        )
    }

    pub fn remove(
        &self,
        t: TableType,
        c: TableClass,
        key: &Key,
        txg: u64,
    ) -> Result<(), DdtError> {
        let id = self.existing(t, c);
        self.store
            .object_remove(id, &key.to_bytes(), txg)
            .map_err(|e| {
                required(e, &format!("{} in {}", key, self.object_name(t, c)))
            })
    }

    /// The record at `cursor`, advancing it. `NotFound` at the end.
    pub fn walk(
        &self,
        t: TableType,
        c: TableClass,
        cursor: &mut u64,
    ) -> Result<(Key, [Phys; DDT_PHYS_TYPES]), DdtError> {
        let id = self.existing(t, c);
        let (key, record, next) = self.store.object_walk(id, *cursor)?;
        *cursor = next;
        Ok((Key::from_bytes(&key)?, decode_record(t, &record)?))
    }

    pub fn prefetch(&self, t: TableType, c: TableClass, key: &Key) {
        if let Some(id) = self.object(t, c) {
            self.store.object_prefetch(id, &key.to_bytes());
        }
    }

    pub fn count(&self, t: TableType, c: TableClass) -> Result<u64, DdtError> {
        self.store.object_count(self.existing(t, c))
    }

    pub fn info(
        &self,
        t: TableType,
        c: TableClass,
    ) -> Result<ObjectInfo, DdtError> {
        self.store.object_info(self.existing(t, c))
    }

    pub fn apply_stat(
        &self,
        t: TableType,
        c: TableClass,
        stat: &Stat,
        sign: StatSign,
    ) {
        self.stats.lock().unwrap().histogram[t.index()][c.index()]
            .apply(stat, sign);
    }

    pub fn histogram(&self, t: TableType, c: TableClass) -> Histogram {
        self.stats.lock().unwrap().histogram[t.index()][c.index()].clone()
    }

    /// Copy the live histograms to the ones queries read.
    pub fn publish_histograms(&self) {
        let mut stats = self.stats.lock().unwrap();
        stats.histogram_cache = stats.histogram.clone();
    }

    pub fn cached_histogram(&self, t: TableType, c: TableClass) -> Histogram {
        self.stats.lock().unwrap().histogram_cache[t.index()][c.index()]
            .clone()
    }

    pub fn object_stats(&self, t: TableType, c: TableClass) -> ObjectStats {
        self.stats.lock().unwrap().object_stats[t.index()][c.index()]
    }

    /// Forget every object and statistic, as before the first load.
    pub fn reset(&self) {
        *self.objects.write().unwrap() = Default::default();
        *self.stats.lock().unwrap() = ClassStats::default();
    }
}
