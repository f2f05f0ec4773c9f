//! Vocabulary
//!
//! The core is tokenizer-agnostic: it consumes this trait and nothing else.
//! `SubwordVocabulary` adapts a `tokenizers` model to it; tests plug in
//! deterministic fakes.

use tokenizers::Tokenizer;

use crate::error::Error;
use crate::types::{Range, Word, Words};

/// Sub-word vocabulary boundary. Encoding yields token ids plus the byte
/// range each token covers in the input; decoding rebuilds a surface string
/// with one byte range per token (EOS surfaces as a zero-width range).
pub trait Vocabulary: Send + Sync {
    fn encode(&self, line: &str, add_eos: bool) -> Result<(Words, Vec<Range>), Error>;
    fn decode(&self, words: &[Word], ignore_eos: bool) -> (String, Vec<Range>);
    fn pad_id(&self) -> Word;
    fn eos_id(&self) -> Word;
    fn size(&self) -> usize;
}

/// `tokenizers`-backed implementation for SentencePiece-style sub-word
/// models. The `▁` marker is rendered as a space on decode, suppressed at
/// the start of a sentence.
pub struct SubwordVocabulary {
    tokenizer: Tokenizer,
    pad_id: Word,
    eos_id: Word,
}

const WORD_BOUNDARY: &str = "\u{2581}"; // "▁"

impl SubwordVocabulary {
    pub fn new(tokenizer: Tokenizer) -> Self {
        let pad_id = tokenizer.token_to_id("<pad>").unwrap_or(0);
        let eos_id = tokenizer.token_to_id("</s>").unwrap_or(0);
        Self {
            tokenizer,
            pad_id,
            eos_id,
        }
    }

    /// Load a serialized tokenizer model from bytes, as shipped next to the
    /// weights.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let tokenizer =
            Tokenizer::from_bytes(bytes).map_err(|e| Error::Tokenizer(e.to_string()))?;
        Ok(Self::new(tokenizer))
    }
}

impl Vocabulary for SubwordVocabulary {
    fn encode(&self, line: &str, add_eos: bool) -> Result<(Words, Vec<Range>), Error> {
        let encoding = self
            .tokenizer
            .encode(line, false)
            .map_err(|e| Error::Tokenizer(e.to_string()))?;

        let mut words: Words = encoding.get_ids().to_vec();
        let mut ranges: Vec<Range> = encoding
            .get_offsets()
            .iter()
            .map(|&(begin, end)| Range::new(begin, end))
            .collect();

        if add_eos {
            words.push(self.eos_id);
            ranges.push(Range::new(line.len(), line.len()));
        }
        Ok((words, ranges))
    }

    fn decode(&self, words: &[Word], ignore_eos: bool) -> (String, Vec<Range>) {
        let mut text = String::new();
        let mut ranges = Vec::with_capacity(words.len());

        for &word in words {
            if word == self.eos_id {
                if !ignore_eos {
                    ranges.push(Range::new(text.len(), text.len()));
                }
                continue;
            }
            let piece = self.tokenizer.id_to_token(word).unwrap_or_default();
            let surface = if let Some(rest) = piece.strip_prefix(WORD_BOUNDARY) {
                if text.is_empty() {
                    rest.to_string()
                } else {
                    format!(" {rest}")
                }
            } else {
                piece
            };
            let begin = text.len();
            text.push_str(&surface);
            ranges.push(Range::new(begin, text.len()));
        }
        (text, ranges)
    }

    fn pad_id(&self) -> Word {
        self.pad_id
    }

    fn eos_id(&self) -> Word {
        self.eos_id
    }

    fn size(&self) -> usize {
        self.tokenizer.get_vocab_size(true)
    }
}
