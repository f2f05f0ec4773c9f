//! Text Processing
//!
//! Turns raw input strings into annotated text plus token segments sized
//! for the batcher. Sentence splitting itself is a collaborator behind
//! [`SentenceSplitter`]; a regex rule splitter ships as the default. Long
//! sentences are hard-wrapped to the configured token budget, reserving
//! one slot for EOS.

use std::sync::Arc;

use regex::Regex;

use crate::annotation::AnnotatedText;
use crate::config::SplitMode;
use crate::error::Error;
use crate::types::{Range, Segment, Segments};
use crate::vocab::Vocabulary;

/// Produces sentence byte-ranges over a text. Implementations must yield
/// non-overlapping ranges in ascending order.
pub trait SentenceSplitter: Send + Sync {
    fn split(&self, text: &str, mode: SplitMode) -> Vec<Range>;
}

/// Regex-backed splitter: terminal punctuation for `sentence` mode, blank
/// lines for `paragraph`, single lines for `wrapped_text`.
pub struct RuleSplitter {
    sentence_break: Regex,
    paragraph_break: Regex,
}

impl Default for RuleSplitter {
    fn default() -> Self {
        Self {
            sentence_break: Regex::new(r#"[.!?]+['")\]]*\s+"#).expect("static pattern"),
            paragraph_break: Regex::new(r"\n\s*\n").expect("static pattern"),
        }
    }
}

impl RuleSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    fn split_by(
        &self,
        text: &str,
        breaks: impl Iterator<Item = (usize, usize)>,
    ) -> Vec<Range> {
        let mut ranges = Vec::new();
        let mut begin = 0;
        for (break_begin, break_end) in breaks {
            if break_begin > begin {
                ranges.push(trim_range(text, Range::new(begin, break_begin)));
            }
            begin = break_end;
        }
        if begin < text.len() {
            ranges.push(trim_range(text, Range::new(begin, text.len())));
        }
        ranges.retain(|range| range.size() > 0);
        ranges
    }
}

/// Shrink a range to exclude surrounding whitespace.
fn trim_range(text: &str, range: Range) -> Range {
    let slice = &text[range.begin..range.end];
    let trimmed_start = slice.len() - slice.trim_start().len();
    let trimmed_end = slice.trim_end().len();
    Range::new(range.begin + trimmed_start, range.begin + trimmed_end)
}

impl SentenceSplitter for RuleSplitter {
    fn split(&self, text: &str, mode: SplitMode) -> Vec<Range> {
        match mode {
            SplitMode::Sentence => {
                // The break pattern ends each sentence; the matched
                // punctuation belongs to the sentence before it.
                let mut ranges = Vec::new();
                let mut begin = 0;
                for found in self.sentence_break.find_iter(text) {
                    let end = found.start()
                        + text[found.start()..found.end()]
                            .trim_end()
                            .len();
                    ranges.push(trim_range(text, Range::new(begin, end)));
                    begin = found.end();
                }
                if begin < text.len() {
                    ranges.push(trim_range(text, Range::new(begin, text.len())));
                }
                ranges.retain(|range| range.size() > 0);
                ranges
            }
            SplitMode::Paragraph => self.split_by(
                text,
                self.paragraph_break
                    .find_iter(text)
                    .map(|m| (m.start(), m.end())),
            ),
            SplitMode::WrappedText => self.split_by(
                text,
                text.match_indices('\n').map(|(i, _)| (i, i + 1)),
            ),
        }
    }
}

/// Splits, tokenizes and wraps client text into translatable segments.
pub struct TextProcessor {
    mode: SplitMode,
    vocabulary: Arc<dyn Vocabulary>,
    splitter: Arc<dyn SentenceSplitter>,
}

impl TextProcessor {
    pub fn new(
        mode: SplitMode,
        vocabulary: Arc<dyn Vocabulary>,
        splitter: Arc<dyn SentenceSplitter>,
    ) -> Self {
        Self {
            mode,
            vocabulary,
            splitter,
        }
    }

    /// Process a fresh input string: split into sentences, tokenize each,
    /// wrap to `wrap_length` tokens (EOS slot included) and record the
    /// sentence boundaries on the annotated source.
    pub fn process(&self, input: String, wrap_length: usize) -> Result<(AnnotatedText, Segments), Error> {
        let mut source = AnnotatedText::new(input);
        let mut segments = Segments::new();

        let sentence_ranges = self.splitter.split(&source.text, self.mode);
        for sentence_range in sentence_ranges {
            let sentence = &source.text[sentence_range.begin..sentence_range.end];
            let (words, ranges) = match self.vocabulary.encode(sentence, false) {
                Ok(encoded) => encoded,
                // A sentence the tokenizer cannot handle contributes no
                // translatable unit.
                Err(_) => continue,
            };
            if words.is_empty() {
                continue;
            }
            // Rebase token ranges from the sentence to the whole text.
            let ranges: Vec<Range> = ranges
                .iter()
                .map(|r| Range::new(r.begin + sentence_range.begin, r.end + sentence_range.begin))
                .collect();

            wrap(
                &words,
                &ranges,
                wrap_length,
                self.vocabulary.eos_id(),
                &mut segments,
                &mut source,
            );
        }

        Ok((source, segments))
    }

    /// Re-tokenize text that already carries sentence annotations — the
    /// pivot second hop, where sentence consistency with the first hop
    /// matters and no wrapping happens.
    pub fn process_annotated(
        &self,
        source: &AnnotatedText,
    ) -> Result<(AnnotatedText, Segments), Error> {
        let mut replacement = AnnotatedText::new(source.text.clone());
        let mut segments = Segments::new();

        for s in 0..source.sentence_count() {
            let sentence_range = source.sentence_as_range(s);
            let sentence = &replacement.text[sentence_range.begin..sentence_range.end];

            let (mut words, ranges) = self.vocabulary.encode(sentence, false)?;
            words.push(self.vocabulary.eos_id());

            let mut token_ranges: Vec<Range> = ranges
                .iter()
                .map(|r| Range::new(r.begin + sentence_range.begin, r.end + sentence_range.begin))
                .collect();
            // EOS occupies a zero-width range at the sentence end.
            let end = token_ranges
                .last()
                .map(|r| r.end)
                .unwrap_or(sentence_range.end);
            token_ranges.push(Range::new(end, end));

            segments.push(words);
            let begin = token_ranges.first().map(|r| r.begin).unwrap_or(sentence_range.begin);
            replacement.record_existing_sentence(&token_ranges, begin);
        }

        Ok((replacement, segments))
    }
}

/// Wrap one tokenized sentence into segments of at most `wrap_length`
/// tokens, EOS included, recording each wrapped piece as its own sentence.
fn wrap(
    words: &Segment,
    ranges: &[Range],
    wrap_length: usize,
    eos_id: u32,
    segments: &mut Segments,
    source: &mut AnnotatedText,
) {
    let step = wrap_length.saturating_sub(1).max(1);

    let mut offset = 0;
    while offset < words.len() {
        let take = step.min(words.len() - offset);

        let mut segment: Segment = words[offset..offset + take].to_vec();
        segment.push(eos_id);
        segments.push(segment);

        let mut token_ranges: Vec<Range> = ranges[offset..offset + take].to_vec();
        let end = token_ranges.last().expect("non-empty wrap").end;
        token_ranges.push(Range::new(end, end)); // zero-width EOS
        let begin = token_ranges.first().expect("non-empty wrap").begin;
        source.record_existing_sentence(&token_ranges, begin);

        offset += take;
    }
}
