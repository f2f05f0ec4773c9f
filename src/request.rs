//! Request Lifecycle
//!
//! A `Request` is one client input after text processing: its annotated
//! source, the token segments to translate, and slots for the histories
//! workers fill in. Segments complete independently and concurrently; the
//! continuation fires exactly once, when the last one lands (or straight
//! from the constructor when the cache already answers everything).
//!
//! `SegmentRef` lends single segments to the batcher; `Batch` carries a
//! drawn set of them through translation and fans completion back out.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::annotation::AnnotatedText;
use crate::cache::{cache_key, TranslationCache};
use crate::response::{assemble, Response};
use crate::search::{Histories, History};
use crate::types::{Segment, Segments};
use crate::vocab::Vocabulary;

pub type Continuation = Box<dyn FnOnce(Response) + Send>;

/// Source text and continuation, surrendered together when the request
/// finishes.
struct Finish {
    source: AnnotatedText,
    continuation: Continuation,
}

pub struct Request {
    id: u64,
    model_id: u64,
    segments: Segments,
    vocabulary: Arc<dyn Vocabulary>,
    cache: Option<Arc<TranslationCache>>,
    histories: Mutex<Vec<Option<History>>>,
    /// Segments whose history is still pending.
    remaining: AtomicUsize,
    completed_words: AtomicUsize,
    total_words: usize,
    finish: Mutex<Option<Finish>>,
}

impl Request {
    /// Build a request, probe the cache, and — if nothing is left to
    /// translate — run the continuation before returning.
    pub fn new(
        id: u64,
        model_id: u64,
        source: AnnotatedText,
        segments: Segments,
        vocabulary: Arc<dyn Vocabulary>,
        cache: Option<Arc<TranslationCache>>,
        continuation: Continuation,
    ) -> Arc<Self> {
        let total_words = segments.iter().map(Vec::len).sum();
        let count = segments.len();
        let request = Arc::new(Self {
            id,
            model_id,
            segments,
            vocabulary,
            cache,
            histories: Mutex::new(vec![None; count]),
            remaining: AtomicUsize::new(count),
            completed_words: AtomicUsize::new(0),
            total_words,
            finish: Mutex::new(Some(Finish {
                source,
                continuation,
            })),
        });

        // Empty input produces an empty response immediately; no worker
        // will ever touch this request.
        if count == 0 {
            request.finalize();
            return request;
        }

        if request.cache.is_some() {
            let mut filled = 0;
            {
                let cache = request.cache.as_ref().expect("checked");
                let mut histories = request.histories.lock().expect("request lock");
                for (index, segment) in request.segments.iter().enumerate() {
                    let key = cache_key(request.model_id, segment);
                    if let Some(history) = cache.find(key) {
                        histories[index] = Some(history);
                        request
                            .completed_words
                            .fetch_add(segment.len(), Ordering::Relaxed);
                        filled += 1;
                    }
                }
            }
            if filled > 0 {
                debug!(request = id, segments = filled, "cache prefilled");
                if request.remaining.fetch_sub(filled, Ordering::AcqRel) == filled {
                    request.finalize();
                }
            }
        }

        request
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    pub fn segment(&self, index: usize) -> &Segment {
        &self.segments[index]
    }

    pub fn word_count(&self, index: usize) -> usize {
        self.segments[index].len()
    }

    /// True when the cache already supplied this segment's history.
    pub fn is_prefilled(&self, index: usize) -> bool {
        self.histories.lock().expect("request lock")[index].is_some()
    }

    /// Progress snapshot in segments: (completed, total).
    pub fn segment_progress(&self) -> (usize, usize) {
        let total = self.segments.len();
        (total - self.remaining.load(Ordering::Acquire), total)
    }

    /// Progress snapshot in words: (completed, total).
    pub fn word_progress(&self) -> (usize, usize) {
        (self.completed_words.load(Ordering::Relaxed), self.total_words)
    }

    /// Accept a freshly translated history for one segment. Runs on worker
    /// threads; the last segment in triggers response assembly and the
    /// continuation.
    pub fn complete(&self, index: usize, history: History) {
        {
            let mut histories = self.histories.lock().expect("request lock");
            histories[index] = Some(history.clone());
        }
        if let Some(cache) = &self.cache {
            let key = cache_key(self.model_id, &self.segments[index]);
            cache.store(key, history);
        }
        self.completed_words
            .fetch_add(self.segments[index].len(), Ordering::Relaxed);

        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.finalize();
        }
    }

    /// Assemble the response and run the continuation. Called exactly once;
    /// all locks are released before the continuation runs so it may
    /// enqueue follow-up work.
    fn finalize(&self) {
        let Finish {
            source,
            continuation,
        } = self
            .finish
            .lock()
            .expect("request lock")
            .take()
            .expect("request finalized twice");

        let histories: Histories = {
            let mut slots = self.histories.lock().expect("request lock");
            slots
                .drain(..)
                .map(|slot| slot.expect("finalize with incomplete segment"))
                .collect()
        };

        let response = assemble(source, &histories, self.vocabulary.as_ref());
        continuation(response);
    }
}

/// A single segment of a request, as the batcher sees it. Ordering is by
/// (request id, segment index), giving the bucket sets a deterministic
/// draw order.
#[derive(Clone)]
pub struct SegmentRef {
    index: usize,
    request: Arc<Request>,
}

impl SegmentRef {
    pub fn new(index: usize, request: Arc<Request>) -> Self {
        Self { index, request }
    }

    pub fn word_count(&self) -> usize {
        self.request.word_count(self.index)
    }

    pub fn segment(&self) -> &Segment {
        self.request.segment(self.index)
    }

    pub fn complete(&self, history: History) {
        self.request.complete(self.index, history);
    }

    fn key(&self) -> (u64, usize) {
        (self.request.id, self.index)
    }
}

impl PartialEq for SegmentRef {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}
impl Eq for SegmentRef {}
impl PartialOrd for SegmentRef {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for SegmentRef {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.key().cmp(&other.key())
    }
}

/// Segments drawn from one bucket for one translation pass. An empty batch
/// is the shutdown poison for workers.
#[derive(Default)]
pub struct Batch {
    refs: Vec<SegmentRef>,
}

impl Batch {
    pub fn add(&mut self, segment: SegmentRef) {
        self.refs.push(segment);
    }

    pub fn size(&self) -> usize {
        self.refs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    pub fn segment_refs(&self) -> &[SegmentRef] {
        &self.refs
    }

    /// Longest segment in the batch; every row of the padded tensor gets
    /// this many slots.
    pub fn max_length(&self) -> usize {
        self.refs
            .iter()
            .map(SegmentRef::word_count)
            .max()
            .unwrap_or(0)
    }

    /// Fan per-segment histories back into their owning requests.
    pub fn complete(self, histories: Histories) {
        assert_eq!(self.refs.len(), histories.len());
        for (segment, history) in self.refs.into_iter().zip(histories) {
            segment.complete(history);
        }
    }

    /// Batch statistics at debug level, recorded just before translation.
    pub fn log(&self) {
        let tokens: usize = self.refs.iter().map(SegmentRef::word_count).sum();
        debug!(
            sentences = self.refs.len(),
            tokens,
            max_length = self.max_length(),
            "translating batch"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::Hypothesis;
    use crate::types::Range;
    use std::sync::atomic::AtomicUsize;

    struct TinyVocabulary;
    impl Vocabulary for TinyVocabulary {
        fn encode(
            &self,
            _line: &str,
            _add_eos: bool,
        ) -> Result<(crate::types::Words, Vec<Range>), crate::error::Error> {
            Ok((vec![], vec![]))
        }
        fn decode(&self, words: &[u32], _ignore_eos: bool) -> (String, Vec<Range>) {
            let mut text = String::new();
            let mut ranges = Vec::new();
            for &w in words {
                let begin = text.len();
                text.push_str(&format!("{w}"));
                ranges.push(Range::new(begin, text.len()));
            }
            (text, ranges)
        }
        fn pad_id(&self) -> u32 {
            0
        }
        fn eos_id(&self) -> u32 {
            1
        }
        fn size(&self) -> usize {
            100
        }
    }

    fn one_sentence_source(text: &str) -> AnnotatedText {
        let mut source = AnnotatedText::new(text.to_string());
        source.record_existing_sentence(&[Range::new(0, text.len())], 0);
        source
    }

    fn history(words: Vec<u32>) -> History {
        Arc::new(Hypothesis {
            target: words,
            alignment: vec![],
        })
    }

    #[test]
    fn test_empty_request_completes_immediately() {
        let calls = Arc::new(AtomicUsize::new(0));
        let observed = calls.clone();
        let _request = Request::new(
            1,
            0,
            AnnotatedText::default(),
            Segments::new(),
            Arc::new(TinyVocabulary),
            None,
            Box::new(move |response| {
                assert_eq!(response.size(), 0);
                observed.fetch_add(1, Ordering::SeqCst);
            }),
        );
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_continuation_fires_once_after_last_segment() {
        let calls = Arc::new(AtomicUsize::new(0));
        let observed = calls.clone();
        let mut source = AnnotatedText::new("ab cd".to_string());
        source.record_existing_sentence(&[Range::new(0, 2)], 0);
        source.record_existing_sentence(&[Range::new(3, 5)], 3);
        let request = Request::new(
            3,
            0,
            source,
            vec![vec![3, 1], vec![4, 1]],
            Arc::new(TinyVocabulary),
            None,
            Box::new(move |response| {
                assert_eq!(response.size(), 2);
                observed.fetch_add(1, Ordering::SeqCst);
            }),
        );

        assert_eq!(request.segment_progress(), (0, 2));
        // Out-of-order completion: the response still assembles in segment
        // order and the continuation fires exactly once, on the last one.
        request.complete(1, history(vec![6, 1]));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(request.segment_progress(), (1, 2));
        assert_eq!(request.word_progress(), (2, 4));
        request.complete(0, history(vec![5, 1]));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cache_prefill_skips_translation() {
        let cache = Arc::new(TranslationCache::new(16, 2));
        let segment = vec![7u32, 8, 1];
        cache.store(cache_key(0, &segment), history(vec![9, 1]));

        let calls = Arc::new(AtomicUsize::new(0));
        let observed = calls.clone();
        let request = Request::new(
            1,
            0,
            one_sentence_source("xyz"),
            vec![segment],
            Arc::new(TinyVocabulary),
            Some(cache),
            Box::new(move |_| {
                observed.fetch_add(1, Ordering::SeqCst);
            }),
        );
        // All segments answered from cache: continuation already ran.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(request.is_prefilled(0));
    }

    #[test]
    fn test_segment_refs_order_by_request_then_index() {
        let request_a = Request::new(
            1,
            0,
            one_sentence_source("a"),
            vec![vec![1]],
            Arc::new(TinyVocabulary),
            None,
            Box::new(|_| {}),
        );
        let request_b = Request::new(
            2,
            0,
            one_sentence_source("b"),
            vec![vec![1]],
            Arc::new(TinyVocabulary),
            None,
            Box::new(|_| {}),
        );

        let mut refs = vec![
            SegmentRef::new(0, request_b.clone()),
            SegmentRef::new(0, request_a.clone()),
        ];
        refs.sort();
        assert_eq!(refs[0].key(), (1, 0));
        assert_eq!(refs[1].key(), (2, 0));
    }
}
