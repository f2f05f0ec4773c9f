//! skiff
//!
//! A self-contained CPU inference runtime for small quantized
//! encoder–decoder translation models:
//! - INT8 tensor kernels and a quantized GEMM provider
//! - transformer forward path with an SSRU decoder and greedy generation
//! - length-bucketed batching with a worker pool and translation cache
//! - blocking and async frontends, including two-hop pivot translation
//!
//! Tokenization, sentence splitting and markup handling are collaborators
//! behind traits; the core ships adapters and defaults for each.

pub mod annotation;
pub mod batcher;
pub mod cache;
pub mod config;
pub mod error;
pub mod html;
pub mod input;
pub mod mem;
pub mod model;
pub mod qgemm;
pub mod request;
pub mod response;
pub mod search;
pub mod service;
pub mod shortlist;
pub mod tensor;
pub mod text;
pub mod transformer;
pub mod types;
pub mod vocab;

// Re-exports for convenience
pub use config::{Config, SplitMode};
pub use error::Error;
pub use model::{Model, Package};
pub use response::{Options, Response};
pub use service::{Async, Blocking, Handle};
pub use vocab::Vocabulary;
