//! Frontends
//!
//! Two ways in: `Blocking` drives a local batching pool on the caller's
//! thread and returns finished responses; `Async` runs a fixed worker pool
//! over a monitored aggregate pool and hands back awaitable handles.
//! Pivoted (two-hop) translation exists on both, joining the hops with the
//! alignment remap in [`crate::response::combine`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::debug;

use crate::batcher::{AggregateBatcher, Batcher, Monitor};
use crate::cache::TranslationCache;
use crate::config::Config;
use crate::error::Error;
use crate::html::{MarkupProcessor, PassthroughMarkup};
use crate::input::Input;
use crate::model::Model;
use crate::request::{Batch, Request};
use crate::response::{combine, Options, Response};

/// Pack a drawn batch into the rectangular input tensor.
fn convert(batch: &Batch, pad_id: u32, limit_factor: f32) -> Input {
    let mut input = Input::new(batch.size(), batch.max_length(), pad_id, limit_factor);
    for segment_ref in batch.segment_refs() {
        input.add(segment_ref.segment());
    }
    input
}

/// Translate one batch and fan results back into its requests.
fn translate_batch(model: &Model, batch: Batch, limit_factor: f32) {
    let input = convert(&batch, model.vocabulary().pad_id(), limit_factor);
    batch.log();

    let started = Instant::now();
    let histories = model.translate_input(&input);
    let elapsed = started.elapsed().as_secs_f32();

    debug!(
        words_per_second = input.words().len() as f32 / elapsed.max(f32::EPSILON),
        occupancy = input.occupancy(),
        "batch translated"
    );
    batch.complete(histories);
}

/// Drain a local batcher to empty on the current thread.
fn exhaust(model: &Arc<Model>, batcher: &mut Batcher, limit_factor: f32) {
    loop {
        let batch = batcher.generate();
        if batch.is_empty() {
            break;
        }
        translate_batch(model, batch, limit_factor);
    }
}

fn make_cache(size: usize, shards: usize) -> Option<Arc<TranslationCache>> {
    (size > 0).then(|| Arc::new(TranslationCache::new(size, shards)))
}

/// Single-threaded frontend: enqueue everything, drain the pool, return
/// responses in input order.
pub struct Blocking {
    config: Config,
    cache: Option<Arc<TranslationCache>>,
    markup: Arc<dyn MarkupProcessor>,
    request_id: AtomicU64,
}

impl Blocking {
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let cache = make_cache(config.cache_size, 1);
        Ok(Self {
            config,
            cache,
            markup: Arc::new(PassthroughMarkup),
            request_id: AtomicU64::new(0),
        })
    }

    /// Swap in a real markup processor for `options.html` inputs.
    pub fn with_markup(mut self, markup: Arc<dyn MarkupProcessor>) -> Self {
        self.markup = markup;
        self
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn translate(
        &self,
        model: &Arc<Model>,
        sources: Vec<String>,
        options: &Options,
    ) -> Result<Vec<Response>, Error> {
        let mut batcher = Batcher::new(
            self.config.max_words,
            self.config.wrap_length,
            self.config.tgt_length_limit_factor,
        );

        let mut markups = Vec::with_capacity(sources.len());
        let mut slots = Vec::with_capacity(sources.len());

        for mut source in sources {
            let markup = options
                .html
                .then(|| self.markup.extract(&mut source));
            markups.push(markup);

            let (annotated, segments) = model
                .processor()
                .process(source, self.config.wrap_length)?;

            let slot = Arc::new(Mutex::new(None));
            slots.push(slot.clone());
            let request = Request::new(
                self.next_request_id(),
                model.id(),
                annotated,
                segments,
                model.vocabulary().clone(),
                self.cache.clone(),
                Box::new(move |response| {
                    *slot.lock().expect("response slot") = Some(response);
                }),
            );
            batcher.enqueue(&request);
        }

        exhaust(model, &mut batcher, self.config.tgt_length_limit_factor);

        let mut responses = Vec::with_capacity(slots.len());
        for (slot, markup) in slots.into_iter().zip(markups) {
            let mut response = slot
                .lock()
                .expect("response slot")
                .take()
                .ok_or(Error::Abandoned)?;
            if let Some(markup) = markup {
                markup.restore(&mut response);
            }
            responses.push(response);
        }
        Ok(responses)
    }

    /// Two-hop translation through a pivot language. Markup is stripped
    /// before the first hop and restored only after the hops combine.
    pub fn pivot(
        &self,
        first: &Arc<Model>,
        second: &Arc<Model>,
        sources: Vec<String>,
        options: &Options,
    ) -> Result<Vec<Response>, Error> {
        let mut markups = Vec::with_capacity(sources.len());
        let mut stripped = Vec::with_capacity(sources.len());
        for mut source in sources {
            markups.push(options.html.then(|| self.markup.extract(&mut source)));
            stripped.push(source);
        }

        let raw = Options {
            alignment: options.alignment,
            html: false,
        };
        let source_to_pivots = self.translate(first, stripped, &raw)?;

        // Second hop re-tokenizes each pivot text while keeping sentence
        // boundaries aligned with the first hop's output.
        let mut batcher = Batcher::new(
            self.config.max_words,
            self.config.wrap_length,
            self.config.tgt_length_limit_factor,
        );
        let mut slots = Vec::with_capacity(source_to_pivots.len());
        for source_to_pivot in &source_to_pivots {
            let (annotated, segments) = second.processor().process_annotated(&source_to_pivot.target)?;
            let slot = Arc::new(Mutex::new(None));
            slots.push(slot.clone());
            let request = Request::new(
                self.next_request_id(),
                second.id(),
                annotated,
                segments,
                second.vocabulary().clone(),
                self.cache.clone(),
                Box::new(move |response| {
                    *slot.lock().expect("response slot") = Some(response);
                }),
            );
            batcher.enqueue(&request);
        }

        exhaust(second, &mut batcher, self.config.tgt_length_limit_factor);

        let mut responses = Vec::with_capacity(slots.len());
        for ((slot, source_to_pivot), markup) in
            slots.into_iter().zip(source_to_pivots).zip(markups)
        {
            let pivot_to_target = slot
                .lock()
                .expect("response slot")
                .take()
                .ok_or(Error::Abandoned)?;
            let mut response = combine(source_to_pivot, pivot_to_target);
            if let Some(markup) = markup {
                markup.restore(&mut response);
            }
            responses.push(response);
        }
        Ok(responses)
    }
}

/// Awaitable result of one async translation, with progress snapshots.
pub struct Handle {
    request: Arc<Request>,
    parts: usize,
    receiver: oneshot::Receiver<Response>,
}

impl Handle {
    /// Await the finished response.
    pub async fn response(self) -> Result<Response, Error> {
        self.receiver.await.map_err(|_| Error::Abandoned)
    }

    /// Block the current (non-async) thread until the response arrives.
    pub fn wait(self) -> Result<Response, Error> {
        self.receiver.blocking_recv().map_err(|_| Error::Abandoned)
    }

    /// `(completed, total)` words of the first hop's request.
    pub fn words(&self) -> (usize, usize) {
        self.request.word_progress()
    }

    /// `(completed, total)` segments of the first hop's request.
    pub fn segments(&self) -> (usize, usize) {
        self.request.segment_progress()
    }

    /// Translation hops behind this handle: 1, or 2 when pivoting.
    pub fn parts(&self) -> usize {
        self.parts
    }
}

/// Worker-pool frontend over a monitored multi-model batching pool.
/// Workers are plain OS threads; the handle side uses a oneshot channel so
/// callers may await or block as they prefer.
pub struct Async {
    config: Config,
    monitor: Arc<Monitor>,
    workers: Vec<std::thread::JoinHandle<()>>,
    cache: Option<Arc<TranslationCache>>,
    markup: Arc<dyn MarkupProcessor>,
    request_id: Arc<AtomicU64>,
}

impl Async {
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let monitor = Arc::new(Monitor::new(AggregateBatcher::new()));
        let cache = make_cache(config.cache_size, config.workers);

        let mut workers = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers {
            let monitor = monitor.clone();
            let limit_factor = config.tgt_length_limit_factor;
            workers.push(
                std::thread::Builder::new()
                    .name(format!("translate-worker-{worker_id}"))
                    .spawn(move || {
                        while let Some((model, batch)) = monitor.generate() {
                            translate_batch(&model, batch, limit_factor);
                        }
                    })
                    .expect("spawn worker"),
            );
        }

        Ok(Self {
            config,
            monitor,
            workers,
            cache,
            markup: Arc::new(PassthroughMarkup),
            request_id: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn with_markup(mut self, markup: Arc<dyn MarkupProcessor>) -> Self {
        self.markup = markup;
        self
    }

    fn next_request_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn translate(
        &self,
        model: &Arc<Model>,
        source: String,
        options: &Options,
    ) -> Result<Handle, Error> {
        let mut source = source;
        let markup = options.html.then(|| self.markup.extract(&mut source));

        let (annotated, segments) = model
            .processor()
            .process(source, self.config.wrap_length)?;

        let (sender, receiver) = oneshot::channel();
        let request = Request::new(
            self.next_request_id(),
            model.id(),
            annotated,
            segments,
            model.vocabulary().clone(),
            self.cache.clone(),
            Box::new(move |mut response| {
                if let Some(markup) = &markup {
                    markup.restore(&mut response);
                }
                // A dropped handle just discards the response.
                let _ = sender.send(response);
            }),
        );

        self.monitor.enqueue(model, &request);
        Ok(Handle {
            request,
            parts: 1,
            receiver,
        })
    }

    /// Continuation-chained two-hop translation: when the first hop's
    /// response is ready, a worker synthesizes the second request and
    /// enqueues it; the second continuation fulfills the caller's handle.
    pub fn pivot(
        &self,
        first: &Arc<Model>,
        second: &Arc<Model>,
        source: String,
        options: &Options,
    ) -> Result<Handle, Error> {
        let mut source = source;
        let markup = options.html.then(|| self.markup.extract(&mut source));

        let (sender, receiver) = oneshot::channel();

        let monitor = self.monitor.clone();
        let cache = self.cache.clone();
        let request_id = self.request_id.clone();
        let second_model = second.clone();

        let continuation: Box<dyn FnOnce(Response) + Send> =
            Box::new(move |source_to_pivot: Response| {
                let processed = second_model
                    .processor()
                    .process_annotated(&source_to_pivot.target);
                let (annotated, segments) = match processed {
                    Ok(parts) => parts,
                    // A pivot text the second model cannot tokenize leaves
                    // the handle unfulfilled with an error signal.
                    Err(_) => return,
                };

                let joining: Box<dyn FnOnce(Response) + Send> =
                    Box::new(move |pivot_to_target: Response| {
                        let mut response = combine(source_to_pivot, pivot_to_target);
                        if let Some(markup) = &markup {
                            markup.restore(&mut response);
                        }
                        let _ = sender.send(response);
                    });

                let request = Request::new(
                    request_id.fetch_add(1, Ordering::Relaxed),
                    second_model.id(),
                    annotated,
                    segments,
                    second_model.vocabulary().clone(),
                    cache,
                    joining,
                );
                monitor.enqueue(&second_model, &request);
            });

        let (annotated, segments) = first
            .processor()
            .process(source, self.config.wrap_length)?;
        let request = Request::new(
            self.next_request_id(),
            first.id(),
            annotated,
            segments,
            first.vocabulary().clone(),
            self.cache.clone(),
            continuation,
        );
        self.monitor.enqueue(first, &request);

        Ok(Handle {
            request,
            parts: 2,
            receiver,
        })
    }

    /// Drop pending (undrawn) work. Continuations of dropped requests
    /// never run; their handles resolve to [`Error::Abandoned`].
    pub fn clear(&self) {
        self.monitor.clear();
    }
}

impl Drop for Async {
    fn drop(&mut self) {
        self.monitor.shutdown();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
