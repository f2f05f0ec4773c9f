//! Greedy Generation
//!
//! Encode once, then decode token by token: sample the argmax per batch
//! row, record the last decoder layer's cross-attention as the alignment
//! distribution, freeze rows that emit EOS, and stop when every row is done
//! or the length limit is reached. Beam search would slot in as a sibling
//! of [`Greedy`]; only the greedy contract ships.

use std::sync::Arc;

use crate::input::Input;
use crate::shortlist::ShortlistGenerator;
use crate::tensor::ops::index_select;
use crate::tensor::Tensor;
use crate::transformer::{transform_embedding, Transformer};
use crate::types::{Alignment, Distribution, Word, Words};

/// Decoded target ids and per-step source alignment rows for one segment.
#[derive(Debug, Clone, Default)]
pub struct Hypothesis {
    pub target: Words,
    pub alignment: Alignment,
}

pub type History = Arc<Hypothesis>;
pub type Histories = Vec<History>;

/// Argmax over each row of `[B, C]` logits where class `c` is vocabulary id
/// `c` (full-vocabulary decoding).
pub fn greedy_sample(logits: &Tensor, num_classes: usize, batch_size: usize) -> Words {
    let data = logits.as_f32();
    let mut sampled = Words::with_capacity(batch_size);
    for i in 0..batch_size {
        let row = &data[i * num_classes..(i + 1) * num_classes];
        let mut max_index = 0;
        let mut max_value = row[0];
        for (cls, &value) in row.iter().enumerate().skip(1) {
            if value > max_value {
                max_index = cls;
                max_value = value;
            }
        }
        sampled.push(max_index as Word);
    }
    sampled
}

/// Argmax over shortlisted logits, mapping class positions back to
/// vocabulary ids through `words`.
pub fn greedy_sample_from_words(logits: &Tensor, words: &[Word], batch_size: usize) -> Words {
    let sampled = greedy_sample(logits, words.len(), batch_size);
    sampled.into_iter().map(|cls| words[cls as usize]).collect()
}

/// Per-row completion tracking across decoding steps.
struct DecodingResult {
    eos_id: Word,
    complete: Vec<bool>,
    sentences: Vec<Words>,
    alignments: Vec<Alignment>,
}

impl DecodingResult {
    fn new(eos_id: Word, batch_size: usize) -> Self {
        Self {
            eos_id,
            complete: vec![false; batch_size],
            sentences: vec![Words::new(); batch_size],
            alignments: vec![Alignment::new(); batch_size],
        }
    }

    /// Append the sampled words to rows still running, marking EOS rows
    /// complete. Returns the number of rows still incomplete.
    fn record(&mut self, step: &Words) -> usize {
        let mut finished = 0;
        for (i, &word) in step.iter().enumerate() {
            if !self.complete[i] {
                self.complete[i] = word == self.eos_id;
                self.sentences[i].push(word);
            }
            finished += usize::from(self.complete[i]);
        }
        self.sentences.len() - finished
    }

    /// Record head 0 of the `[B, h, 1, S]` cross-attention for every row
    /// still running, truncated to the row's true source length.
    fn update_alignment(&mut self, attn: &Tensor, input_lengths: &[usize]) {
        let data = attn.as_f32();
        let batch_size = attn.dim(-4);
        let num_heads = attn.dim(-3);
        let slice = attn.dim(-2);
        let source_length = attn.dim(-1);

        let batch_stride = num_heads * slice * source_length;
        for (id, &length) in input_lengths.iter().enumerate().take(batch_size) {
            if !self.complete[id] {
                let row = &data[id * batch_stride..id * batch_stride + length];
                let distribution: Distribution = row.to_vec();
                self.alignments[id].push(distribution);
            }
        }
    }

    fn consume(self) -> Histories {
        self.sentences
            .into_iter()
            .zip(self.alignments)
            .map(|(target, alignment)| Arc::new(Hypothesis { target, alignment }))
            .collect()
    }
}

/// Greedy decoder over one padded input batch.
pub struct Greedy<'a> {
    transformer: &'a Transformer,
    eos_id: Word,
    shortlist_generator: Option<&'a ShortlistGenerator>,
}

impl<'a> Greedy<'a> {
    pub fn new(
        transformer: &'a Transformer,
        eos_id: Word,
        shortlist_generator: Option<&'a ShortlistGenerator>,
    ) -> Self {
        Self {
            transformer,
            eos_id,
            shortlist_generator,
        }
    }

    pub fn generate(&self, input: &Input) -> Histories {
        let mask = input.mask();

        let mut word_embedding =
            index_select(self.transformer.embedding(), input.indices(), "word_embedding");
        transform_embedding(&mut word_embedding, 0);
        let encoder_out = self.transformer.encode(word_embedding, mask);

        let shortlist = self
            .shortlist_generator
            .map(|generator| generator.generate(input.words()));
        let shortlist_words = shortlist.as_ref().map(|s| s.words().as_slice());

        let batch_size = encoder_out.dim(-3);
        let source_sequence_length = encoder_out.dim(-2);
        let max_steps =
            (input.limit_factor() * source_sequence_length as f32).ceil() as usize;

        let mut states = self.transformer.start_states(batch_size);
        let mut previous = Words::new();
        let mut result = DecodingResult::new(self.eos_id, batch_size);

        for step in 0..max_steps {
            let (logits, attn) = self.transformer.step(
                &encoder_out,
                mask,
                &mut states,
                &previous,
                shortlist_words,
                step,
            );

            previous = match shortlist_words {
                Some(words) => greedy_sample_from_words(&logits, words, batch_size),
                None => greedy_sample(&logits, logits.dim(-1), batch_size),
            };

            // Alignment first: the distribution belongs to the word sampled
            // this step, EOS included.
            result.update_alignment(&attn, input.lengths());
            let remaining = result.record(&previous);
            if remaining == 0 {
                break;
            }
        }

        result.consume()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::{ElementType, Shape};

    fn logits_from(values: &[f32], dims: Vec<usize>) -> Tensor {
        let mut t = Tensor::new(ElementType::F32, Shape::new(dims), "logits");
        t.as_f32_mut().copy_from_slice(values);
        t
    }

    #[test]
    fn test_greedy_sample_picks_argmax_per_row() {
        let logits = logits_from(&[0.1, 0.9, 0.0, 0.5, 0.2, 0.1], vec![2, 3]);
        assert_eq!(greedy_sample(&logits, 3, 2), vec![1, 0]);
    }

    #[test]
    fn test_greedy_sample_from_words_maps_back_to_vocab() {
        let logits = logits_from(&[0.0, 1.0], vec![1, 2]);
        assert_eq!(greedy_sample_from_words(&logits, &[10, 42], 1), vec![42]);
    }

    #[test]
    fn test_record_freezes_completed_rows() {
        let mut result = DecodingResult::new(2, 2);
        assert_eq!(result.record(&vec![5, 2]), 1);
        // Row 1 hit EOS; later words must not extend it.
        assert_eq!(result.record(&vec![2, 7]), 0);
        assert_eq!(result.sentences[0], vec![5, 2]);
        assert_eq!(result.sentences[1], vec![2]);
        assert!(result.complete.iter().all(|&c| c));
    }

    #[test]
    fn test_alignment_rows_truncate_to_source_length() {
        let mut result = DecodingResult::new(0, 2);
        // [B=2, h=1, 1, S=4] attention.
        let attn = logits_from(
            &[0.4, 0.3, 0.2, 0.1, 0.25, 0.25, 0.25, 0.25],
            vec![2, 1, 1, 4],
        );
        result.update_alignment(&attn, &[3, 4]);
        assert_eq!(result.alignments[0][0], vec![0.4, 0.3, 0.2]);
        assert_eq!(result.alignments[1][0].len(), 4);
    }

    #[test]
    fn test_completed_rows_record_no_alignment() {
        let mut result = DecodingResult::new(9, 2);
        result.record(&vec![9, 1]); // row 0 completes immediately
        let attn = logits_from(&[1.0, 0.0, 0.5, 0.5], vec![2, 1, 1, 2]);
        result.update_alignment(&attn, &[2, 2]);
        assert!(result.alignments[0].is_empty());
        assert_eq!(result.alignments[1].len(), 1);
    }
}
