//! Text Annotation
//!
//! Sentence and token boundaries expressed as byte ranges over one owned
//! string. Text alternates gaps (whitespace between sentences) and
//! sentences, with a gap at each end, so there is always one more gap than
//! there are sentences. Tokens tile the text without holes; a gap is a
//! single token holding whatever lies between sentences.

use crate::types::Range;

/// Boundary bookkeeping, separate from the string it describes.
#[derive(Debug, Clone)]
pub struct Annotation {
    /// Byte offset where token `i` begins; token `i` is
    /// `[token_begin[i], token_begin[i + 1])`. Padded so the indices stay
    /// valid at the end, hence `len() == token count + 1`.
    token_begin: Vec<usize>,
    /// Indices (into `token_begin`) of the tokens that are gaps.
    /// `gap.len() == sentence_count() + 1`.
    gap: Vec<usize>,
}

impl Default for Annotation {
    fn default() -> Self {
        // An empty text: one empty gap.
        Self {
            token_begin: vec![0, 0],
            gap: vec![0],
        }
    }
}

impl Annotation {
    pub fn sentence_count(&self) -> usize {
        self.gap.len() - 1
    }

    pub fn word_count(&self, sentence_idx: usize) -> usize {
        self.gap[sentence_idx + 1] - self.gap[sentence_idx] - 1
    }

    pub fn word(&self, sentence_idx: usize, word_idx: usize) -> Range {
        let token_idx = self.gap[sentence_idx] + 1 + word_idx;
        Range::new(self.token_begin[token_idx], self.token_begin[token_idx + 1])
    }

    pub fn sentence(&self, sentence_idx: usize) -> Range {
        Range::new(
            self.token_begin[self.gap[sentence_idx] + 1],
            self.token_begin[self.gap[sentence_idx + 1]],
        )
    }

    pub fn gap(&self, gap_idx: usize) -> Range {
        let token_idx = self.gap[gap_idx];
        Range::new(self.token_begin[token_idx], self.token_begin[token_idx + 1])
    }
}

/// A string together with its sentence/token annotation.
#[derive(Debug, Clone, Default)]
pub struct AnnotatedText {
    pub text: String,
    pub annotation: Annotation,
}

impl AnnotatedText {
    /// Wrap a string whose sentences are not recorded yet; the whole text
    /// starts out as one gap for `record_existing_sentence` to break up.
    pub fn new(text: String) -> Self {
        let mut annotated = Self {
            text,
            annotation: Annotation::default(),
        };
        let len = annotated.text.len();
        *annotated.annotation.token_begin.last_mut().expect("padded") = len;
        annotated
    }

    pub fn sentence_count(&self) -> usize {
        self.annotation.sentence_count()
    }

    pub fn word_count(&self, sentence_idx: usize) -> usize {
        self.annotation.word_count(sentence_idx)
    }

    pub fn word(&self, sentence_idx: usize, word_idx: usize) -> &str {
        self.slice(self.annotation.word(sentence_idx, word_idx))
    }

    pub fn sentence(&self, sentence_idx: usize) -> &str {
        self.slice(self.annotation.sentence(sentence_idx))
    }

    pub fn gap(&self, gap_idx: usize) -> &str {
        self.slice(self.annotation.gap(gap_idx))
    }

    pub fn word_as_range(&self, sentence_idx: usize, word_idx: usize) -> Range {
        self.annotation.word(sentence_idx, word_idx)
    }

    pub fn sentence_as_range(&self, sentence_idx: usize) -> Range {
        self.annotation.sentence(sentence_idx)
    }

    fn slice(&self, range: Range) -> &str {
        &self.text[range.begin..range.end]
    }

    /// Append a sentence built from contiguous token surfaces, preceded by
    /// the whitespace `prefix` separating it from what came before.
    pub fn append_sentence(&mut self, prefix: &str, tokens: &[&str]) {
        debug_assert_eq!(
            *self.annotation.token_begin.last().expect("padded"),
            self.text.len()
        );

        self.append_ending_whitespace(prefix);

        let mut offset = self.text.len();
        for token in tokens {
            offset += token.len();
            self.annotation.token_begin.push(offset);
            self.text.push_str(token);
        }

        // Empty gap after the sentence; extended by the next append.
        self.annotation
            .gap
            .push(self.annotation.token_begin.len() - 1);
        self.annotation.token_begin.push(offset);
    }

    /// Extend the final gap with trailing whitespace.
    pub fn append_ending_whitespace(&mut self, whitespace: &str) {
        self.text.push_str(whitespace);
        *self.annotation.token_begin.last_mut().expect("padded") = self.text.len();
    }

    /// Record a sentence already present in the text. `ranges` are the
    /// contiguous token byte-ranges; `sentence_begin` anchors an empty
    /// sentence. Sentences must be recorded left to right.
    pub fn record_existing_sentence(&mut self, ranges: &[Range], sentence_begin: usize) {
        debug_assert!(sentence_begin <= self.text.len());
        debug_assert_eq!(
            *self.annotation.token_begin.last().expect("padded"),
            self.text.len()
        );
        if let Some(first) = ranges.first() {
            debug_assert_eq!(first.begin, sentence_begin);
        }

        // Drop the end-of-text padding while splicing the sentence in.
        self.annotation.token_begin.pop();
        for range in ranges {
            debug_assert!(range.end <= self.text.len());
            self.annotation.token_begin.push(range.begin);
        }
        self.annotation.gap.push(self.annotation.token_begin.len());
        match ranges.last() {
            Some(last) => self.annotation.token_begin.push(last.end),
            None => self.annotation.token_begin.push(sentence_begin),
        }
        self.annotation.token_begin.push(self.text.len());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text_is_one_gap() {
        let annotated = AnnotatedText::new(String::new());
        assert_eq!(annotated.sentence_count(), 0);
        assert_eq!(annotated.gap(0), "");
    }

    #[test]
    fn test_record_existing_sentence() {
        let mut annotated = AnnotatedText::new("  hi there!".to_string());
        let ranges = [Range::new(2, 4), Range::new(4, 10), Range::new(10, 11)];
        annotated.record_existing_sentence(&ranges, 2);

        assert_eq!(annotated.sentence_count(), 1);
        assert_eq!(annotated.word_count(0), 3);
        assert_eq!(annotated.gap(0), "  ");
        assert_eq!(annotated.word(0, 0), "hi");
        assert_eq!(annotated.word(0, 1), " there");
        assert_eq!(annotated.word(0, 2), "!");
        assert_eq!(annotated.sentence(0), "hi there!");
        assert_eq!(annotated.gap(1), "");
    }

    #[test]
    fn test_append_sentences_with_gaps() {
        let mut target = AnnotatedText::default();
        target.append_sentence("", &["hello", " world"]);
        target.append_sentence("  ", &["again"]);
        target.append_ending_whitespace("\n");

        assert_eq!(target.text, "hello world  again\n");
        assert_eq!(target.sentence_count(), 2);
        assert_eq!(target.sentence(0), "hello world");
        assert_eq!(target.gap(1), "  ");
        assert_eq!(target.sentence(1), "again");
        assert_eq!(target.gap(2), "\n");
        assert_eq!(target.word(1, 0), "again");
    }

    #[test]
    fn test_word_count_matches_recorded_tokens() {
        let mut annotated = AnnotatedText::new("ab cd".to_string());
        annotated.record_existing_sentence(&[Range::new(0, 2)], 0);
        annotated.record_existing_sentence(&[Range::new(3, 5)], 3);
        assert_eq!(annotated.sentence_count(), 2);
        assert_eq!(annotated.word_count(0), 1);
        assert_eq!(annotated.word_count(1), 1);
        assert_eq!(annotated.gap(1), " ");
    }
}
