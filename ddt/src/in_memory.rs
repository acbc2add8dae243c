// Copyright 2025 Oxide Computer Company
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use anyhow::Result;
use ddt_common::{ddt_bail, read_json_maybe, write_json};
use serde::{Deserialize, Serialize};

use crate::object_store::*;
use crate::DdtError;

/// Block size the in-memory store reports for every object.
const STORE_BLOCK_SIZE: u64 = 4096;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(from = "ObjectImage", into = "ObjectImage")]
struct StoredObject {
    kind: ObjectKind,
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

/// JSON maps need string keys, so entries are saved as a list of pairs.
#[derive(Serialize, Deserialize)]
struct ObjectImage {
    kind: ObjectKind,
    entries: Vec<(Vec<u8>, Vec<u8>)>,
}

impl From<ObjectImage> for StoredObject {
    fn from(i: ObjectImage) -> Self {
        StoredObject {
            kind: i.kind,
            entries: i.entries.into_iter().collect(),
        }
    }
}

impl From<StoredObject> for ObjectImage {
    fn from(o: StoredObject) -> Self {
        ObjectImage {
            kind: o.kind,
            entries: o.entries.into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Objects {
    next_id: ObjectId,
    objects: BTreeMap<ObjectId, StoredObject>,
}

impl Default for Objects {
    fn default() -> Self {
        let mut objects = BTreeMap::new();
        objects.insert(
            POOL_DIRECTORY_OBJECT,
            StoredObject {
                kind: ObjectKind::Directory,
                entries: BTreeMap::new(),
            },
        );
        Objects {
            next_id: POOL_DIRECTORY_OBJECT + 1,
            objects,
        }
    }
}

impl Objects {
    fn get(&self, id: ObjectId) -> Result<&StoredObject, DdtError> {
        match self.objects.get(&id) {
            Some(o) => Ok(o),
            None => ddt_bail!(ObjectStore, "object {} does not exist", id),
        }
    }

    fn get_mut(&mut self, id: ObjectId) -> Result<&mut StoredObject, DdtError> {
        match self.objects.get_mut(&id) {
            Some(o) => Ok(o),
            None => ddt_bail!(ObjectStore, "object {} does not exist", id),
        }
    }
}

#[derive(Debug, Default)]
struct Inner {
    committed: Objects,
    last_committed: u64,

    /// Copy-on-first-write state for the open transaction group.
    open: Option<(u64, Objects)>,
}

impl Inner {
    fn current(&self) -> &Objects {
        match &self.open {
            Some((_, o)) => o,
            None => &self.committed,
        }
    }

    fn writable(&mut self, txg: u64) -> Result<&mut Objects, DdtError> {
        match &self.open {
            Some((open, _)) if *open != txg => {
                return Err(DdtError::TxgMismatch {
                    open: *open,
                    requested: txg,
                });
            }
            None if txg <= self.last_committed => {
                return Err(DdtError::TxgMismatch {
                    open: self.last_committed + 1,
                    requested: txg,
                });
            }
            _ => {}
        }

        let committed = &self.committed;
        let (_, objects) =
            self.open.get_or_insert_with(|| (txg, committed.clone()));
        Ok(objects)
    }
}

/// An [`ObjectStore`] kept in memory, with optional JSON snapshots on disk.
///
/// Also counts lookups and prefetches, and can be told to delay or fail
/// lookups, which the engine's tests lean on.
#[derive(Debug, Default)]
pub struct InMemoryObjectStore {
    inner: Mutex<Inner>,
    lookups: AtomicU64,
    prefetches: AtomicU64,
    lookup_delay: Mutex<Option<Duration>>,
    lookup_error: Mutex<Option<DdtError>>,
    update_error: Mutex<Option<DdtError>>,
}

impl InMemoryObjectStore {
    pub fn new() -> InMemoryObjectStore {
        InMemoryObjectStore::default()
    }

    /// Load a snapshot written by [`save`](Self::save), or start empty if
    /// `path` does not exist.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<InMemoryObjectStore> {
        let store = InMemoryObjectStore::new();
        if let Some(objects) = read_json_maybe::<_, Objects>(path)? {
            store.lock().committed = objects;
        }
        Ok(store)
    }

    /// Write the committed state to `path`. Uncommitted changes are not
    /// included.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let committed = self.lock().committed.clone();
        write_json(path, &committed, true)
    }

    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Acquire)
    }

    pub fn prefetch_count(&self) -> u64 {
        self.prefetches.load(Ordering::Acquire)
    }

    pub fn set_lookup_delay(&self, delay: Option<Duration>) {
        *self.lookup_delay.lock().unwrap() = delay;
    }

    /// Fail every object lookup with `error` until cleared with `None`.
    pub fn inject_lookup_error(&self, error: Option<DdtError>) {
        *self.lookup_error.lock().unwrap() = error;
    }

    /// Fail every object update with `error` until cleared with `None`.
    pub fn inject_update_error(&self, error: Option<DdtError>) {
        *self.update_error.lock().unwrap() = error;
    }

    /// Number of objects in the committed state.
    pub fn committed_objects(&self) -> usize {
        self.lock().committed.objects.len()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }
}

impl ObjectStore for InMemoryObjectStore {
    fn create_object(
        &self,
        kind: ObjectKind,
        txg: u64,
    ) -> Result<ObjectId, DdtError> {
        let mut inner = self.lock();
        let objects = inner.writable(txg)?;
        let id = objects.next_id;
        objects.next_id += 1;
        objects.objects.insert(
            id,
            StoredObject {
                kind,
                entries: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    fn destroy_object(&self, id: ObjectId, txg: u64) -> Result<(), DdtError> {
        if id == POOL_DIRECTORY_OBJECT {
            ddt_bail!(ObjectStore, "cannot destroy the pool directory");
        }
        let mut inner = self.lock();
        let objects = inner.writable(txg)?;
        match objects.objects.remove(&id) {
            Some(_) => Ok(()),
            None => ddt_bail!(ObjectStore, "object {} does not exist", id),
        }
    }

    fn directory_add(
        &self,
        dir: ObjectId,
        name: &str,
        value: &[u8],
        txg: u64,
    ) -> Result<(), DdtError> {
        let mut inner = self.lock();
        let d = inner.writable(txg)?.get_mut(dir)?;
        if d.entries.contains_key(name.as_bytes()) {
            ddt_bail!(ObjectStore, "{} already exists in {}", name, dir);
        }
        d.entries.insert(name.as_bytes().to_vec(), value.to_vec());
        Ok(())
    }

    fn directory_update(
        &self,
        dir: ObjectId,
        name: &str,
        value: &[u8],
        txg: u64,
    ) -> Result<(), DdtError> {
        let mut inner = self.lock();
        let d = inner.writable(txg)?.get_mut(dir)?;
        d.entries.insert(name.as_bytes().to_vec(), value.to_vec());
        Ok(())
    }

    fn directory_remove(
        &self,
        dir: ObjectId,
        name: &str,
        txg: u64,
    ) -> Result<(), DdtError> {
        let mut inner = self.lock();
        let d = inner.writable(txg)?.get_mut(dir)?;
        match d.entries.remove(name.as_bytes()) {
            Some(_) => Ok(()),
            None => Err(DdtError::NotFound),
        }
    }

    fn directory_lookup(
        &self,
        dir: ObjectId,
        name: &str,
    ) -> Result<Vec<u8>, DdtError> {
        let inner = self.lock();
        inner
            .current()
            .get(dir)?
            .entries
            .get(name.as_bytes())
            .cloned()
            .ok_or(DdtError::NotFound)
    }

    fn object_lookup(
        &self,
        id: ObjectId,
        key: &[u8],
    ) -> Result<Vec<u8>, DdtError> {
        self.lookups.fetch_add(1, Ordering::AcqRel);

        let delay = *self.lookup_delay.lock().unwrap();
        if let Some(d) = delay {
            std::thread::sleep(d);
        }
        if let Some(e) = self.lookup_error.lock().unwrap().clone() {
            return Err(e);
        }

        let inner = self.lock();
        inner
            .current()
            .get(id)?
            .entries
            .get(key)
            .cloned()
            .ok_or(DdtError::NotFound)
    }

    fn object_update(
        &self,
        id: ObjectId,
        key: &[u8],
        record: &[u8],
        txg: u64,
    ) -> Result<(), DdtError> {
        if let Some(e) = self.update_error.lock().unwrap().clone() {
            return Err(e);
        }
        let mut inner = self.lock();
        let o = inner.writable(txg)?.get_mut(id)?;
        o.entries.insert(key.to_vec(), record.to_vec());
        Ok(())
    }

    fn object_remove(
        &self,
        id: ObjectId,
        key: &[u8],
        txg: u64,
    ) -> Result<(), DdtError> {
        let mut inner = self.lock();
        let o = inner.writable(txg)?.get_mut(id)?;
        match o.entries.remove(key) {
            Some(_) => Ok(()),
            None => Err(DdtError::NotFound),
        }
    }

    fn object_walk(
        &self,
        id: ObjectId,
        cursor: u64,
    ) -> Result<(Vec<u8>, Vec<u8>, u64), DdtError> {
        let inner = self.lock();
        let o = inner.current().get(id)?;
        match o.entries.iter().nth(cursor as usize) {
            Some((k, v)) => Ok((k.clone(), v.clone(), cursor + 1)),
            None => Err(DdtError::NotFound),
        }
    }

    fn object_prefetch(&self, _id: ObjectId, _key: &[u8]) {
        self.prefetches.fetch_add(1, Ordering::AcqRel);
    }

    fn object_count(&self, id: ObjectId) -> Result<u64, DdtError> {
        let inner = self.lock();
        Ok(inner.current().get(id)?.entries.len() as u64)
    }

    fn object_info(&self, id: ObjectId) -> Result<ObjectInfo, DdtError> {
        let inner = self.lock();
        let o = inner.current().get(id)?;
        let bytes: u64 = o
            .entries
            .iter()
            .map(|(k, v)| (k.len() + v.len()) as u64)
            .sum();
        let blocks = bytes.div_ceil(STORE_BLOCK_SIZE).max(1);
        Ok(ObjectInfo {
            block_count: blocks,
            physical_blocks_512: blocks * (STORE_BLOCK_SIZE >> 9),
            fill_count: blocks,
            data_block_size: STORE_BLOCK_SIZE,
        })
    }

    fn commit(&self, txg: u64) -> Result<(), DdtError> {
        let mut inner = self.lock();
        match inner.open.take() {
            Some((open, objects)) if open == txg => {
                inner.committed = objects;
                inner.last_committed = txg;
                Ok(())
            }
            Some((open, objects)) => {
                inner.open = Some((open, objects));
                Err(DdtError::TxgMismatch {
                    open,
                    requested: txg,
                })
            }
            None => {
                inner.last_committed = inner.last_committed.max(txg);
                Ok(())
            }
        }
    }

    fn abort(&self, txg: u64) {
        let mut inner = self.lock();
        if matches!(inner.open, Some((open, _)) if open == txg) {
            inner.open = None;
        }
    }
}
