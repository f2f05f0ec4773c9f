//! Configuration
//!
//! Scalar knobs for model geometry, batching and the worker pool. Every key
//! is optional in serialized form; defaults match the shipped tiny models.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// How input text is divided into translatable units.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SplitMode {
    #[default]
    Sentence,
    Paragraph,
    WrappedText,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Encoder stack depth.
    pub encoder_layers: usize,
    /// Decoder stack depth.
    pub decoder_layers: usize,
    /// FFN projections per block.
    pub feed_forward_depth: usize,
    /// Attention heads.
    pub num_heads: usize,
    /// Padded-word budget per batch.
    pub max_words: usize,
    /// Hard wrap for input segments, in tokens; one slot is reserved for
    /// EOS.
    pub wrap_length: usize,
    /// Maximum target length relative to source length.
    pub tgt_length_limit_factor: f32,
    /// Translation cache slots; 0 disables the cache.
    pub cache_size: usize,
    /// Worker threads for the async frontend.
    pub workers: usize,
    pub split_mode: SplitMode,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            encoder_layers: 6,
            decoder_layers: 2,
            feed_forward_depth: 2,
            num_heads: 8,
            max_words: 1024,
            wrap_length: 128,
            tgt_length_limit_factor: 3.0,
            cache_size: 0,
            workers: 1,
            split_mode: SplitMode::Sentence,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::InvalidConfig(
                "workers must be at least 1".to_string(),
            ));
        }
        if self.wrap_length > self.max_words {
            // Sentences longer than the batch budget could never be drawn.
            return Err(Error::InvalidConfig(format!(
                "wrap_length {} exceeds max_words {}",
                self.wrap_length, self.max_words
            )));
        }
        if self.encoder_layers == 0 || self.decoder_layers == 0 {
            return Err(Error::InvalidConfig(
                "encoder and decoder need at least one layer".to_string(),
            ));
        }
        Ok(())
    }
}

/// Ready-made geometries for the shipped model families.
pub mod preset {
    use super::{Config, SplitMode};

    pub fn tiny() -> Config {
        Config {
            encoder_layers: 6,
            decoder_layers: 2,
            feed_forward_depth: 2,
            num_heads: 8,
            split_mode: SplitMode::Sentence,
            ..Config::default()
        }
    }

    pub fn base() -> Config {
        tiny()
    }

    pub fn nano() -> Config {
        Config {
            encoder_layers: 4,
            ..tiny()
        }
    }
}
