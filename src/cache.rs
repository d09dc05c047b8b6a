//! Content cache: fingerprint -> bytes.
//!
//! Append-only for the lifetime of the owning process. The source side fills
//! it from disk reads, the consumer side from verified transfers.

use bytes::Bytes;
use std::collections::{BTreeSet, HashMap};

use crate::fingerprint::Fingerprint;

#[derive(Debug, Default, Clone)]
pub struct ContentCache {
    entries: HashMap<Fingerprint, Bytes>,
    total_bytes: u64,
}

impl ContentCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes` under `fp`. Returns false if the fingerprint was already present.
    ///
    /// The caller is responsible for `fp` being the fingerprint of `bytes`.
    pub fn put(&mut self, fp: Fingerprint, bytes: Bytes) -> bool {
        if self.entries.contains_key(&fp) {
            return false;
        }
        self.total_bytes += bytes.len() as u64;
        self.entries.insert(fp, bytes);
        true
    }

    /// Fingerprint `bytes` and store them.
    pub fn insert(&mut self, bytes: Bytes) -> Fingerprint {
        let fp = Fingerprint::of(&bytes);
        self.put(fp, bytes);
        fp
    }

    pub fn get(&self, fp: &Fingerprint) -> Option<&Bytes> {
        self.entries.get(fp)
    }

    pub fn contains(&self, fp: &Fingerprint) -> bool {
        self.entries.contains_key(fp)
    }

    /// Every fingerprint held, as sent in a fetch request.
    pub fn known(&self) -> BTreeSet<Fingerprint> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }
}
