// Copyright 2025 Oxide Computer Company
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::*;

/// Resident entries for one checksum algorithm, striped across buckets by
/// the top bits of the checksum. Each bucket has its own lock, held only
/// while the bucket's index is searched or changed.
#[derive(Debug)]
pub struct Table {
    hash_bits: u32,
    buckets: Vec<Mutex<BTreeMap<Key, EntryHandle>>>,
    resident: AtomicUsize,
    limit: usize,
}

impl Table {
    /// `limit` caps the number of resident entries; zero means no cap.
    pub fn new(hash_bits: u32, limit: usize) -> Table {
        let buckets = (0..(1usize << hash_bits))
            .map(|_| Mutex::new(BTreeMap::new()))
            .collect();
        Table {
            hash_bits,
            buckets,
            resident: AtomicUsize::new(0),
            limit,
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub fn bucket_of(&self, key: &Key) -> usize {
        key.hash(self.hash_bits)
    }

    pub fn len(&self) -> usize {
        self.resident.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, key: &Key) -> Option<EntryHandle> {
        let bucket = self.buckets[self.bucket_of(key)].lock().unwrap();
        bucket.get(key).cloned()
    }

    /// Find the entry for `key`, inserting a new unloaded one if there is
    /// none. The bool is true when this call inserted it.
    pub fn lookup_or_insert(
        &self,
        key: &Key,
    ) -> Result<(EntryHandle, bool), DdtError> {
        let mut bucket = self.buckets[self.bucket_of(key)].lock().unwrap();
        if let Some(e) = bucket.get(key) {
            return Ok((e.clone(), false));
        }

        if self.limit != 0 && self.resident.load(Ordering::Acquire) >= self.limit
        {
            return Err(DdtError::OutOfEntries { limit: self.limit });
        }

        let e = Arc::new(Entry::new(*key));
        bucket.insert(*key, e.clone());
        self.resident.fetch_add(1, Ordering::AcqRel);
        Ok((e, true))
    }

    /// Take `key` out of the index. The entry must be done loading and have
    /// no lead writes in flight.
    pub fn remove(&self, key: &Key) -> Option<EntryHandle> {
        let mut bucket = self.buckets[self.bucket_of(key)].lock().unwrap();
        let e = bucket.remove(key)?;
        assert_ne!(e.state(), LoadState::Loading, "removing a loading entry");
        assert!(
            !e.lock().has_lead_writes(),
            "removing an entry with lead writes in flight"
        );
        self.resident.fetch_sub(1, Ordering::AcqRel);
        Some(e)
    }

    /// Remove `key` only if it still maps to `entry`.
    pub(crate) fn remove_exact(&self, entry: &EntryHandle) -> bool {
        let key = entry.key();
        let mut bucket = self.buckets[self.bucket_of(key)].lock().unwrap();
        match bucket.get(key) {
            Some(e) if Arc::ptr_eq(e, entry) => {
                bucket.remove(key);
                self.resident.fetch_sub(1, Ordering::AcqRel);
                true
            }
            _ => false,
        }
    }

    /// Empty bucket `i`, returning its entries in key order.
    pub fn drain_bucket(&self, i: usize) -> Vec<EntryHandle> {
        let taken = std::mem::take(&mut *self.buckets[i].lock().unwrap());
        self.resident.fetch_sub(taken.len(), Ordering::AcqRel);
        taken.into_values().collect()
    }
}
