//! Lexical Shortlist
//!
//! Per-sentence restriction of the output vocabulary, read from a binary
//! lexical table: a fixed header, cumulative per-source-word offsets, then
//! the flat target-id array. Generation unions the `frequent` head of the
//! vocabulary with every source word's row and pads the set to a multiple
//! of eight for the int8 kernel tiling.

use byteorder::{ByteOrder, LittleEndian};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::error::Error;
use crate::types::{Word, Words};

pub const SHORTLIST_MAGIC: u64 = 0xF11A_48D5_0134_17F5;

/// Kernel tile requirement on the number of output classes.
const CLASS_ALIGNMENT: usize = 8;

/// Header fields after `magic` and `checksum`, plus both arrays, feed the
/// checksum; the first eight little-endian bytes of the digest are stored.
fn checksum_bytes(payload: &[u8]) -> u64 {
    let digest = Sha256::digest(payload);
    LittleEndian::read_u64(&digest[..8])
}

/// Sorted, unique target ids admitted as output classes for one sentence.
#[derive(Debug, Clone)]
pub struct Shortlist {
    words: Words,
}

impl Shortlist {
    pub fn new(words: Words) -> Self {
        Self { words }
    }

    pub fn words(&self) -> &Words {
        &self.words
    }

    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    /// Vocabulary id for a class position.
    pub fn reverse_map(&self, idx: usize) -> Word {
        self.words[idx]
    }

    /// Class position for a vocabulary id, if admitted.
    pub fn try_forward_map(&self, word: Word) -> Option<usize> {
        self.words.binary_search(&word).ok()
    }
}

pub struct ShortlistGenerator {
    frequent: u64,
    #[allow(dead_code)]
    best: u64,
    word_to_offset: Vec<u64>,
    shortlist: Vec<Word>,
    target_size: usize,
    shared: bool,
}

impl ShortlistGenerator {
    /// Parse a shortlist blob. `target_size` bounds the stored ids;
    /// `shared` marks source/target vocabulary sharing, which admits the
    /// source words themselves as output classes.
    pub fn load(data: &[u8], target_size: usize, shared: bool, check: bool) -> Result<Self, Error> {
        const HEADER: usize = 6 * 8;
        if data.len() < HEADER {
            return Err(Error::MalformedShortlist(format!(
                "blob of {} bytes is shorter than the header",
                data.len()
            )));
        }

        let magic = LittleEndian::read_u64(&data[0..8]);
        if magic != SHORTLIST_MAGIC {
            return Err(Error::MalformedShortlist("incorrect magic".to_string()));
        }
        let checksum = LittleEndian::read_u64(&data[8..16]);
        let frequent = LittleEndian::read_u64(&data[16..24]);
        let best = LittleEndian::read_u64(&data[24..32]);
        let word_to_offset_size = LittleEndian::read_u64(&data[32..40]) as usize;
        let shortlist_size = LittleEndian::read_u64(&data[40..48]) as usize;

        let expected = HEADER + word_to_offset_size * 8 + shortlist_size * 4;
        if expected != data.len() {
            return Err(Error::MalformedShortlist(format!(
                "header claims {expected} bytes but blob is {}",
                data.len()
            )));
        }

        if check && checksum_bytes(&data[16..]) != checksum {
            return Err(Error::MalformedShortlist(
                "checksum mismatch, shortlist is corrupted".to_string(),
            ));
        }

        let mut word_to_offset = vec![0u64; word_to_offset_size];
        LittleEndian::read_u64_into(&data[HEADER..HEADER + word_to_offset_size * 8], &mut word_to_offset);
        let mut shortlist = vec![0u32; shortlist_size];
        LittleEndian::read_u32_into(&data[HEADER + word_to_offset_size * 8..], &mut shortlist);

        info!(frequent, best, "loaded lexical shortlist");

        let generator = Self {
            frequent,
            best,
            word_to_offset,
            shortlist,
            target_size,
            shared,
        };
        if check {
            generator.content_check()?;
        }
        Ok(generator)
    }

    fn content_check(&self) -> Result<(), Error> {
        let size = self.shortlist.len() as u64;
        let (last, head) = self
            .word_to_offset
            .split_last()
            .ok_or_else(|| Error::MalformedShortlist("empty offset table".to_string()))?;
        if head.iter().any(|&offset| offset >= size) && size > 0 {
            return Err(Error::MalformedShortlist(
                "offset table exceeds shortlist size".to_string(),
            ));
        }
        if *last != size {
            return Err(Error::MalformedShortlist(
                "final offset does not equal shortlist size".to_string(),
            ));
        }
        if self
            .shortlist
            .iter()
            .any(|&id| id as usize >= self.target_size)
        {
            return Err(Error::MalformedShortlist(
                "shortlist ids exceed the target vocabulary".to_string(),
            ));
        }
        Ok(())
    }

    /// Admitted output classes for one input sentence: the `frequent` head
    /// of the vocabulary, each unique source word's translation row, the
    /// source words themselves under a shared vocabulary, padded up to a
    /// multiple of eight, sorted.
    pub fn generate(&self, words: &[Word]) -> Shortlist {
        let target_size = self.target_size;
        let mut seen_source = vec![false; self.word_to_offset.len()];
        let mut table = vec![false; target_size];

        for i in 0..(self.frequent as usize).min(target_size) {
            table[i] = true;
        }

        for &word in words {
            let word = word as usize;
            if self.shared && word < target_size {
                table[word] = true;
            }
            if word + 1 >= self.word_to_offset.len() {
                continue; // no lexical row for this id
            }
            if !seen_source[word] {
                let begin = self.word_to_offset[word] as usize;
                let end = self.word_to_offset[word + 1] as usize;
                for &target in &self.shortlist[begin..end] {
                    table[target as usize] = true;
                }
                seen_source[word] = true;
            }
        }

        let mut marked = table.iter().filter(|&&m| m).count();

        // Top up with the next unmarked ids until the class count meets the
        // kernel's multiple-of-eight tiling.
        let mut cursor = self.frequent as usize;
        while cursor < target_size && marked % CLASS_ALIGNMENT != 0 {
            if !table[cursor] {
                table[cursor] = true;
                marked += 1;
            }
            cursor += 1;
        }

        let indices: Words = (0..target_size as Word)
            .filter(|&i| table[i as usize])
            .collect();
        Shortlist::new(indices)
    }
}

/// Serialize a lexical table in the layout [`ShortlistGenerator::load`]
/// reads, checksum included. Fixture and conversion support.
pub fn write_shortlist(frequent: u64, best: u64, word_to_offset: &[u64], shortlist: &[Word]) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(&frequent.to_le_bytes());
    payload.extend_from_slice(&best.to_le_bytes());
    payload.extend_from_slice(&(word_to_offset.len() as u64).to_le_bytes());
    payload.extend_from_slice(&(shortlist.len() as u64).to_le_bytes());
    for &offset in word_to_offset {
        payload.extend_from_slice(&offset.to_le_bytes());
    }
    for &word in shortlist {
        payload.extend_from_slice(&word.to_le_bytes());
    }

    let mut blob = Vec::with_capacity(16 + payload.len());
    blob.extend_from_slice(&SHORTLIST_MAGIC.to_le_bytes());
    blob.extend_from_slice(&checksum_bytes(&payload).to_le_bytes());
    blob.extend_from_slice(&payload);
    blob
}
