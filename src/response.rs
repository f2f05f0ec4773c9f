//! Response
//!
//! The unit handed back to clients: annotated source and target text plus
//! per-sentence soft alignments. Also hosts the two-hop pivot combination,
//! which remaps the second hop's alignments from its own tokenization of
//! the pivot text onto the first hop's before marginalizing the pivot out.

use crate::annotation::AnnotatedText;
use crate::search::Histories;
use crate::types::{Alignment, Range};
use crate::vocab::Vocabulary;

/// Translated text with sentence/token annotations and alignments.
///
/// `alignments[sentence][t][s] = p(source token s | target token t)`.
#[derive(Debug, Clone, Default)]
pub struct Response {
    pub source: AnnotatedText,
    pub target: AnnotatedText,
    pub alignments: Vec<Alignment>,
}

impl Response {
    /// Number of translated units; identical for source and target.
    pub fn size(&self) -> usize {
        self.source.sentence_count()
    }
}

/// Per-request knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct Options {
    /// Attach alignment matrices to the response.
    pub alignment: bool,
    /// Treat the source as markup: strip tags before translation and
    /// restore them afterwards.
    pub html: bool,
}

/// Decode completed histories into target text, interleaving the source
/// gaps so whitespace between sentences survives translation.
pub fn assemble(source: AnnotatedText, histories: &Histories, vocabulary: &dyn Vocabulary) -> Response {
    assert_eq!(
        source.sentence_count(),
        histories.len(),
        "history count does not match source sentences"
    );

    let mut target = AnnotatedText::default();
    let mut alignments = Vec::with_capacity(histories.len());

    for (sentence_id, history) in histories.iter().enumerate() {
        let (decoded, ranges) = vocabulary.decode(&history.target, false);
        let views: Vec<&str> = ranges
            .iter()
            .map(|range| &decoded[range.begin..range.end])
            .collect();

        let prefix = source.gap(sentence_id).to_string();
        target.append_sentence(&prefix, &views);

        if sentence_id + 1 == histories.len() {
            let ending = source.gap(sentence_id + 1).to_string();
            target.append_ending_whitespace(&ending);
        }

        alignments.push(history.alignment.clone());
    }

    Response {
        source,
        target,
        alignments,
    }
}

/// Rewrite `p(q' | t)` over target-side pivot tokens into `p(q | t)` over
/// source-side pivot tokens by walking both token streams over the same
/// pivot bytes and spreading probability by byte overlap. Residual mass at
/// a trailing zero-width token (an unmatched EOS) is redistributed
/// uniformly.
fn transfer_through_characters(
    source_side_pivots: &[Range],
    target_side_pivots: &[Range],
    pivot_given_targets: &Alignment,
) -> Alignment {
    let mut remapped: Alignment =
        vec![vec![0.0; source_side_pivots.len()]; pivot_given_targets.len()];

    let mut sq = 0;
    let mut qt = 0;
    while sq < source_side_pivots.len() && qt < target_side_pivots.len() {
        let source_side = &source_side_pivots[sq];
        let target_side = &target_side_pivots[qt];
        if source_side == target_side {
            for (row, given) in remapped.iter_mut().zip(pivot_given_targets) {
                row[sq] += given[qt];
            }
            sq += 1;
            qt += 1;
        } else {
            let left = source_side.begin.max(target_side.begin);
            let right = source_side.end.min(target_side.end);
            debug_assert!(left < right, "pivot tokenizations must overlap");

            let overlap = right - left;
            let spread = target_side.size();
            for (row, given) in remapped.iter_mut().zip(pivot_given_targets) {
                row[sq] += overlap as f32 * given[qt] / spread as f32;
            }

            // Advance whichever stream ended first, both on a tie.
            if source_side.end == target_side.end {
                sq += 1;
                qt += 1;
            } else if source_side.end > target_side.end {
                qt += 1;
            } else {
                sq += 1;
            }
        }
    }

    debug_assert_eq!(sq, source_side_pivots.len());

    while qt < target_side_pivots.len() {
        // Typically an unpredicted EOS of zero width; give its mass to
        // every source-side pivot evenly.
        debug_assert!(
            qt == target_side_pivots.len() - 1 && target_side_pivots[qt].size() == 0
        );
        for (row, given) in remapped.iter_mut().zip(pivot_given_targets) {
            let gift = given[qt] / source_side_pivots.len() as f32;
            for value in row.iter_mut() {
                *value += gift;
            }
        }
        qt += 1;
    }

    remapped
}

/// Combine both hops' alignments: remap the pivot tokenization, then
/// marginalize `p(s | t) = Σ_q p(s | q) · p(q | t)`.
pub fn remap_alignments(first: &Response, second: &Response) -> Vec<Alignment> {
    let mut alignments = Vec::with_capacity(first.source.sentence_count());
    for sentence_id in 0..first.source.sentence_count() {
        let source_given_pivots = &first.alignments[sentence_id];
        let pivot_given_targets = &second.alignments[sentence_id];

        let word_ranges = |annotated: &AnnotatedText| -> Vec<Range> {
            (0..annotated.word_count(sentence_id))
                .map(|w| annotated.word_as_range(sentence_id, w))
                .collect()
        };
        let source_side_pivots = word_ranges(&first.target);
        let target_side_pivots = word_ranges(&second.source);

        let remapped = transfer_through_characters(
            &source_side_pivots,
            &target_side_pivots,
            pivot_given_targets,
        );

        let source_token_count = first.source.word_count(sentence_id);
        let target_token_count = second.target.word_count(sentence_id);
        let mut output: Alignment = vec![vec![0.0; source_token_count]; target_token_count];
        for (idt, out_row) in output.iter_mut().enumerate() {
            for (idq, source_row) in source_given_pivots.iter().enumerate() {
                let weight = remapped[idt][idq];
                for (ids, value) in out_row.iter_mut().enumerate() {
                    *value += source_row[ids] * weight;
                }
            }
        }
        alignments.push(output);
    }
    alignments
}

/// Join a source→pivot and a pivot→target response into source→target.
/// Only valid when `first.target` and `second.source` carry the same text.
pub fn combine(first: Response, second: Response) -> Response {
    let alignments = if first.alignments.is_empty() {
        Vec::new()
    } else {
        remap_alignments(&first, &second)
    };

    Response {
        source: first.source,
        target: second.target,
        alignments,
    }
}
