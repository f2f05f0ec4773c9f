//! Batch Input
//!
//! Variable-length token sequences packed into a rectangular `[B, T]` id
//! tensor with a matching 1.0/0.0 mask. Rows fill top-down; whatever stays
//! unfilled is all padding.

use crate::tensor::{ElementType, Shape, Tensor};
use crate::types::{Word, Words};

pub struct Input {
    /// Flat concatenation of all added words, fingerprinting the batch and
    /// feeding shortlist generation.
    words: Words,
    lengths: Vec<usize>,
    indices: Tensor,
    mask: Tensor,
    index: usize,
    pad_id: Word,
    used: usize,
    limit_factor: f32,
}

impl Input {
    pub fn new(batch_size: usize, sequence_length: usize, pad_id: Word, limit_factor: f32) -> Self {
        Self {
            words: Words::new(),
            lengths: Vec::with_capacity(batch_size),
            indices: Tensor::new(
                ElementType::U32,
                Shape::new(vec![batch_size, sequence_length]),
                "batch",
            ),
            mask: Tensor::new(
                ElementType::F32,
                Shape::new(vec![batch_size, sequence_length]),
                "mask",
            ),
            index: 0,
            pad_id,
            used: 0,
            limit_factor,
        }
    }

    /// Copy one segment into the next free row, padding the remainder.
    pub fn add(&mut self, words: &[Word]) {
        let sequence_length = self.indices.dim(-1);
        let batch_size = self.indices.dim(-2);
        assert!(words.len() <= sequence_length);
        assert!(self.index < batch_size);

        self.words.extend_from_slice(words);
        self.lengths.push(words.len());

        let row = self.index * sequence_length;
        let ids = self.indices.as_u32_mut();
        ids[row..row + words.len()].copy_from_slice(words);
        ids[row + words.len()..row + sequence_length].fill(self.pad_id);

        let mask = self.mask.as_f32_mut();
        mask[row..row + words.len()].fill(1.0);
        mask[row + words.len()..row + sequence_length].fill(0.0);

        self.index += 1;
        self.used += words.len();
    }

    pub fn indices(&self) -> &Tensor {
        &self.indices
    }

    pub fn mask(&self) -> &Tensor {
        &self.mask
    }

    pub fn words(&self) -> &Words {
        &self.words
    }

    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    pub fn batch_size(&self) -> usize {
        self.index
    }

    pub fn limit_factor(&self) -> f32 {
        self.limit_factor
    }

    /// Real-token density of the padded tensor; batching telemetry.
    pub fn occupancy(&self) -> f32 {
        let sequence_length = self.indices.dim(-1);
        let batch_size = self.indices.dim(-2);
        self.used as f32 / (batch_size * sequence_length) as f32
    }
}
