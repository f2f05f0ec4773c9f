//! Shared fixtures: a deterministic tiny model container, a numeric fake
//! vocabulary and shortlist blobs, so end-to-end scenarios run without any
//! real model files.

// Each test binary compiles its own copy and uses a different subset.
#![allow(dead_code)]

use std::sync::Arc;

use skiff::config::Config;
use skiff::error::Error;
use skiff::model::io::{write_items, WriteItem};
use skiff::model::Model;
use skiff::tensor::{ElementType, Shape};
use skiff::text::RuleSplitter;
use skiff::types::{Range, Word, Words};
use skiff::vocab::Vocabulary;

pub const HIDDEN: usize = 16;
pub const VOCAB: usize = 32;

/// xorshift-style generator so fixtures are identical on every run.
pub struct Rng(u64);

impl Rng {
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    /// Small signed weight value in [-2, 2].
    fn weight(&mut self) -> i8 {
        (self.next() % 5) as i8 - 2
    }

    fn small_f32(&mut self) -> f32 {
        ((self.next() % 100) as f32 - 50.0) / 100.0
    }
}

fn quantized(rng: &mut Rng, rows: usize, cols: usize, multiplier: f32) -> Vec<u8> {
    let mut data: Vec<u8> = (0..rows * cols).map(|_| rng.weight() as u8).collect();
    data.extend_from_slice(&multiplier.to_le_bytes());
    data
}

fn floats(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn item(name: &str, ty: ElementType, dims: Vec<usize>, data: Vec<u8>) -> WriteItem {
    WriteItem {
        name: name.to_string(),
        ty,
        shape: Shape::new(dims),
        data,
    }
}

fn push_affine(items: &mut Vec<WriteItem>, rng: &mut Rng, prefix: &str, k: usize, n: usize) {
    items.push(item(
        prefix,
        ElementType::Ig8,
        vec![k, n],
        quantized(rng, k, n, 1.0),
    ));
    items.push(item(
        &format!("{prefix}_QuantMultA"),
        ElementType::F32,
        vec![1],
        floats(&[8.0]),
    ));
}

fn push_bias(items: &mut Vec<WriteItem>, rng: &mut Rng, name: &str, n: usize) {
    let values: Vec<f32> = (0..n).map(|_| rng.small_f32() * 0.1).collect();
    items.push(item(name, ElementType::F32, vec![n], floats(&values)));
}

fn push_layer_norm(items: &mut Vec<WriteItem>, prefix: &str, n: usize) {
    items.push(item(
        &format!("{prefix}_ln_scale"),
        ElementType::F32,
        vec![n],
        floats(&vec![1.0; n]),
    ));
    items.push(item(
        &format!("{prefix}_ln_bias"),
        ElementType::F32,
        vec![n],
        floats(&vec![0.0; n]),
    ));
}

fn push_attention(items: &mut Vec<WriteItem>, rng: &mut Rng, prefix: &str, name: &str, h: usize) {
    for suffix in ["q", "k", "v", "o"] {
        push_affine(items, rng, &format!("{prefix}_{name}_W{suffix}"), h, h);
        push_bias(items, rng, &format!("{prefix}_{name}_b{suffix}"), h);
    }
    push_layer_norm(items, &format!("{prefix}_{name}_Wo"), h);
}

fn push_ffn(items: &mut Vec<WriteItem>, rng: &mut Rng, prefix: &str, depth: usize, h: usize) {
    for i in 1..=depth {
        push_affine(items, rng, &format!("{prefix}_ffn_W{i}"), h, h);
        push_bias(items, rng, &format!("{prefix}_ffn_b{i}"), h);
    }
    push_layer_norm(items, &format!("{prefix}_ffn_ffn"), h);
}

/// A complete container for `config`'s geometry, with deterministic
/// pseudo-random weights. The output-projection bias pushes EOS down so
/// decoding does not collapse to empty targets.
pub fn tiny_model_blob(config: &Config, seed: u64) -> Vec<u8> {
    let mut rng = Rng::new(seed);
    let h = HIDDEN;
    let v = VOCAB;
    let mut items = Vec::new();

    items.push(item(
        "Wemb",
        ElementType::Ig8,
        vec![v, h],
        quantized(&mut rng, v, h, 1.0),
    ));
    // Placeholder kept for offset compatibility; the value is unused.
    items.push(item(
        "Wemb_QuantMultA",
        ElementType::Ig8,
        vec![8],
        vec![0u8; 8],
    ));
    items.push(item(
        "none_QuantMultA",
        ElementType::F32,
        vec![1],
        floats(&[8.0]),
    ));

    let mut logit_bias: Vec<f32> = (0..v).map(|_| rng.small_f32()).collect();
    logit_bias[1] = -4.0; // EOS stays reachable but never trivially wins
    logit_bias[0] = -4000.0; // pad is out of reach of any bounded logit
    items.push(item(
        "decoder_ff_logit_out_b",
        ElementType::F32,
        vec![v],
        floats(&logit_bias),
    ));

    for depth in 1..=config.encoder_layers {
        let prefix = format!("encoder_l{depth}");
        push_attention(&mut items, &mut rng, &prefix, "self", h);
        push_ffn(&mut items, &mut rng, &prefix, config.feed_forward_depth, h);
    }

    for depth in 1..=config.decoder_layers {
        let prefix = format!("decoder_l{depth}");
        push_attention(&mut items, &mut rng, &prefix, "context", h);
        push_ffn(&mut items, &mut rng, &prefix, config.feed_forward_depth, h);

        push_affine(&mut items, &mut rng, &format!("{prefix}_rnn_W"), h, h);
        push_affine(&mut items, &mut rng, &format!("{prefix}_rnn_Wf"), h, h);
        push_bias(&mut items, &mut rng, &format!("{prefix}_rnn_bf"), h);
        push_layer_norm(&mut items, &format!("{prefix}_rnn_ffn"), h);
    }

    write_items(&items)
}

/// Numeric fake vocabulary: token `"7"` has id 9 (ids 0 and 1 are pad and
/// EOS). Surfaces decode back to the number, space-separated.
pub struct NumberVocabulary;

impl Vocabulary for NumberVocabulary {
    fn encode(&self, line: &str, add_eos: bool) -> Result<(Words, Vec<Range>), Error> {
        let mut words = Words::new();
        let mut ranges = Vec::new();
        let bytes = line.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i].is_ascii_digit() {
                let begin = i;
                while i < bytes.len() && bytes[i].is_ascii_digit() {
                    i += 1;
                }
                let value: u32 = line[begin..i].parse().expect("digits");
                words.push((value + 2).min(VOCAB as u32 - 1));
                ranges.push(Range::new(begin, i));
            } else {
                i += 1;
            }
        }
        if add_eos {
            words.push(self.eos_id());
            ranges.push(Range::new(line.len(), line.len()));
        }
        Ok((words, ranges))
    }

    fn decode(&self, words: &[Word], ignore_eos: bool) -> (String, Vec<Range>) {
        let mut text = String::new();
        let mut ranges = Vec::new();
        for &word in words {
            if word == self.eos_id() || word == self.pad_id() {
                if word == self.eos_id() && !ignore_eos {
                    ranges.push(Range::new(text.len(), text.len()));
                }
                continue;
            }
            let begin = text.len();
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(&(word - 2).to_string());
            ranges.push(Range::new(begin, text.len()));
        }
        (text, ranges)
    }

    fn pad_id(&self) -> Word {
        0
    }

    fn eos_id(&self) -> Word {
        1
    }

    fn size(&self) -> usize {
        VOCAB
    }
}

/// Opt into log output with `RUST_LOG=skiff=debug cargo test`.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}

/// Build a ready model around the tiny container. `geometry` tweaks layer
/// counts; weights derive from `seed`.
pub fn tiny_model(config: Config, seed: u64) -> Arc<Model> {
    let blob = tiny_model_blob(&config, seed);
    let map = skiff::mem::MemoryMap::from_bytes(blob);
    Model::from_parts(
        config,
        map,
        Arc::new(NumberVocabulary),
        None,
        Arc::new(RuleSplitter::new()),
    )
    .expect("tiny model loads")
}
