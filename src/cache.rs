//! Translation Cache
//!
//! Fixed-size, direct-mapped map from (model, source words) to a finished
//! history. Records are partitioned across a handful of locks so concurrent
//! workers rarely contend; a colliding store simply overwrites. Misses on
//! collision are accepted — the cache trades hit-rate for near-zero
//! overhead in the translation hot path.

use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};

use crate::search::History;
use crate::types::Word;

type Record = (u64, Option<History>);

pub struct TranslationCache {
    /// Record `r` lives in shard `r % M` at position `r / M`.
    shards: Vec<Mutex<Box<[Record]>>>,
    size: usize,
}

/// Key over the model identity and the exact source token ids.
pub fn cache_key(model_id: u64, words: &[Word]) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(model_id.to_le_bytes());
    for &word in words {
        hasher.update(word.to_le_bytes());
    }
    let digest = hasher.finalize();
    LittleEndian::read_u64(&digest[..8])
}

impl TranslationCache {
    /// `size` records across `shard_count` locks. Both are clamped to at
    /// least one.
    pub fn new(size: usize, shard_count: usize) -> Self {
        let size = size.max(1);
        let shard_count = shard_count.max(1).min(size);
        let shards = (0..shard_count)
            .map(|s| {
                let records = (s..size).step_by(shard_count).count();
                Mutex::new(vec![(0u64, None); records].into_boxed_slice())
            })
            .collect();
        Self { shards, size }
    }

    fn locate(&self, key: u64) -> (usize, usize) {
        let index = (key % self.size as u64) as usize;
        (index % self.shards.len(), index / self.shards.len())
    }

    pub fn find(&self, key: u64) -> Option<History> {
        let (shard, position) = self.locate(key);
        let records = self.shards[shard].lock().expect("cache lock");
        let (stored_key, value) = &records[position];
        if *stored_key == key {
            value.clone()
        } else {
            None
        }
    }

    pub fn store(&self, key: u64, value: History) {
        let (shard, position) = self.locate(key);
        let mut records = self.shards[shard].lock().expect("cache lock");
        records[position] = (key, Some(value));
    }
}
