//! Batching Pool
//!
//! Length-bucketed scheduling: segments queue in per-length buckets and
//! batches are drawn shortest-first under a padded-word budget, so every
//! batch holds equal-length rows and padding stays at zero. The
//! `AggregateBatcher` runs one pool per model for multi-model frontends,
//! and `Monitor` wraps either in the mutex/condvar producer–consumer
//! protocol the worker threads block on.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex};

use tracing::debug;

use crate::model::Model;
use crate::request::{Batch, Request, SegmentRef};

/// Per-model batching pool.
pub struct Batcher {
    max_words: usize,
    buckets: Vec<BTreeSet<SegmentRef>>,
    running_max_bucket: usize,
}

impl Batcher {
    pub fn new(max_words: usize, wrap_length: usize, tgt_length_limit_factor: f32) -> Self {
        assert!(
            wrap_length <= max_words,
            "wrap_length > max_words would strand sentences no batch can hold"
        );
        // Pivot inputs are re-tokenized model output and may exceed the
        // wrap length by up to the target length factor; reserve slack so
        // those land in a bucket without reallocating in the common case.
        let pivot_slack =
            (wrap_length as f32 * tgt_length_limit_factor) as usize - wrap_length;
        let buckets = (0..=wrap_length + pivot_slack).map(|_| BTreeSet::new()).collect();
        Self {
            max_words,
            buckets,
            running_max_bucket: 0,
        }
    }

    /// Queue every segment of `request` that the cache did not already
    /// answer. Returns the number of segments actually enqueued.
    pub fn enqueue(&mut self, request: &Arc<Request>) -> usize {
        let mut enqueued = 0;
        for index in 0..request.segment_count() {
            if request.is_prefilled(index) {
                continue;
            }
            let segment = SegmentRef::new(index, request.clone());
            let bucket_id = segment.word_count();
            if bucket_id >= self.buckets.len() {
                self.buckets.resize_with(bucket_id + 1, BTreeSet::new);
            }
            self.buckets[bucket_id].insert(segment);
            self.running_max_bucket = self.running_max_bucket.max(bucket_id);
            enqueued += 1;
        }
        enqueued
    }

    /// Draw the next batch from the shortest occupied bucket: segments of
    /// one length only, so the padded tensor carries no padding, pulled
    /// while one more row still fits the padded-word budget. Within a
    /// bucket, draw order is (request id, segment index).
    pub fn generate(&mut self) -> Batch {
        let mut batch = Batch::default();
        for length in 1..=self.running_max_bucket.min(self.buckets.len() - 1) {
            let bucket = &mut self.buckets[length];
            while let Some(first) = bucket.first() {
                let padded_size = (batch.size() + 1) * length;
                if padded_size > self.max_words {
                    debug_assert!(
                        batch.size() > 0,
                        "a single segment exceeds the word budget"
                    );
                    return batch;
                }
                let segment = first.clone();
                bucket.remove(&segment);
                batch.add(segment);
            }
            if !batch.is_empty() {
                // Rows of one batch all come from this bucket.
                return batch;
            }
        }
        batch
    }

    /// Drop all pending segments. Their requests never complete; callers
    /// own any promise cleanup.
    pub fn clear(&mut self) {
        for bucket in &mut self.buckets {
            bucket.clear();
        }
    }
}

/// Batching across models: one `Batcher` per model, drained in model-id
/// order. A model with no pending work leaves the active set until its
/// next enqueue.
#[derive(Default)]
pub struct AggregateBatcher {
    pools: BTreeMap<u64, (Arc<Model>, Batcher)>,
    active: BTreeSet<u64>,
}

impl AggregateBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, model: &Arc<Model>, request: &Arc<Request>) -> usize {
        let entry = self.pools.entry(model.id()).or_insert_with(|| {
            let config = model.config();
            (
                model.clone(),
                Batcher::new(
                    config.max_words,
                    config.wrap_length,
                    config.tgt_length_limit_factor,
                ),
            )
        });
        let enqueued = entry.1.enqueue(request);
        self.active.insert(model.id());
        enqueued
    }

    /// The first non-empty batch over models with pending work, together
    /// with its owning model.
    pub fn generate(&mut self) -> Option<(Arc<Model>, Batch)> {
        while let Some(&candidate) = self.active.iter().next() {
            let (model, batcher) = self.pools.get_mut(&candidate).expect("active pool exists");
            let batch = batcher.generate();
            if !batch.is_empty() {
                return Some((model.clone(), batch));
            }
            self.active.remove(&candidate);
        }
        None
    }

    pub fn clear(&mut self) {
        for (_, batcher) in self.pools.values_mut() {
            batcher.clear();
        }
        self.active.clear();
    }
}

struct MonitorState {
    pool: AggregateBatcher,
    /// Segments sitting in the pool.
    enqueued: usize,
    shutdown: bool,
}

/// Producer–consumer monitor over the aggregate pool. Producers enqueue
/// and notify; workers block in [`Monitor::generate`] until work or
/// shutdown arrives. The lock is never held across translation.
pub struct Monitor {
    state: Mutex<MonitorState>,
    work: Condvar,
}

impl Monitor {
    pub fn new(pool: AggregateBatcher) -> Self {
        Self {
            state: Mutex::new(MonitorState {
                pool,
                enqueued: 0,
                shutdown: false,
            }),
            work: Condvar::new(),
        }
    }

    /// Enqueue after shutdown is a contract violation.
    pub fn enqueue(&self, model: &Arc<Model>, request: &Arc<Request>) {
        let mut state = self.state.lock().expect("monitor lock");
        assert!(!state.shutdown, "enqueue after shutdown");
        let added = state.pool.enqueue(model, request);
        state.enqueued += added;
        self.work.notify_all();
    }

    /// Block until a batch is available; `None` signals shutdown with the
    /// pool drained.
    pub fn generate(&self) -> Option<(Arc<Model>, Batch)> {
        let mut state = self.state.lock().expect("monitor lock");
        loop {
            while state.enqueued == 0 && !state.shutdown {
                state = self.work.wait(state).expect("monitor lock");
            }
            if state.enqueued == 0 {
                return None; // shutdown, fully drained
            }
            match state.pool.generate() {
                Some((model, batch)) => {
                    state.enqueued -= batch.size();
                    return Some((model, batch));
                }
                None => {
                    // Counter out of step with the pool (cleared backend);
                    // resynchronize rather than spin.
                    debug!("monitor counter reset");
                    state.enqueued = 0;
                }
            }
        }
    }

    /// Drop pending work. Requests already drawn into batches still
    /// complete; everything else is abandoned.
    pub fn clear(&self) {
        let mut state = self.state.lock().expect("monitor lock");
        state.pool.clear();
        state.enqueued = 0;
    }

    /// After shutdown workers drain the pool, then observe `None`.
    pub fn shutdown(&self) {
        let mut state = self.state.lock().expect("monitor lock");
        state.shutdown = true;
        self.work.notify_all();
    }
}
