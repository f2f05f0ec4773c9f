//! Model
//!
//! One loaded translation model: the bound transformer graph, its
//! vocabulary, the text processor feeding it and an optional lexical
//! shortlist. Models are cheap to share; everything inside is read-only
//! after load and workers translate against them concurrently.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::info;

use crate::config::Config;
use crate::error::Error;
use crate::input::Input;
use crate::mem::MemoryMap;
use crate::search::{Greedy, Histories};
use crate::shortlist::ShortlistGenerator;
use crate::text::{RuleSplitter, SentenceSplitter, TextProcessor};
use crate::transformer::Transformer;
use crate::vocab::{SubwordVocabulary, Vocabulary};

pub mod io;

/// The set of artifacts one model needs: weights, a tokenizer model and an
/// optional lexical shortlist.
pub struct Package<T> {
    pub model: T,
    pub vocabulary: T,
    pub shortlist: Option<T>,
}

/// Process-wide model identity; feeds cache keys and the aggregate queue.
static MODEL_ID: AtomicU64 = AtomicU64::new(0);

pub struct Model {
    id: u64,
    config: Config,
    vocabulary: Arc<dyn Vocabulary>,
    processor: TextProcessor,
    transformer: Transformer,
    shortlist_generator: Option<ShortlistGenerator>,
}

impl Model {
    /// Load from files on disk, with the default rule splitter and a
    /// `tokenizers` vocabulary.
    pub fn load(config: Config, package: &Package<PathBuf>) -> Result<Arc<Self>, Error> {
        let map = MemoryMap::open(&package.model)?;
        let vocabulary_bytes =
            std::fs::read(&package.vocabulary).map_err(|source| Error::Io {
                path: package.vocabulary.clone(),
                source,
            })?;
        let vocabulary: Arc<dyn Vocabulary> =
            Arc::new(SubwordVocabulary::from_bytes(&vocabulary_bytes)?);

        let shortlist = match &package.shortlist {
            Some(path) => Some(std::fs::read(path).map_err(|source| Error::Io {
                path: path.clone(),
                source,
            })?),
            None => None,
        };

        Self::from_parts(
            config,
            map,
            vocabulary,
            shortlist.as_deref(),
            Arc::new(RuleSplitter::new()),
        )
    }

    /// Assemble from already-materialized parts. The seam tests and
    /// embedders use: any vocabulary and splitter implementation plugs in.
    pub fn from_parts(
        config: Config,
        map: MemoryMap,
        vocabulary: Arc<dyn Vocabulary>,
        shortlist_blob: Option<&[u8]>,
        splitter: Arc<dyn SentenceSplitter>,
    ) -> Result<Arc<Self>, Error> {
        config.validate()?;

        let transformer = Transformer::load(&map, &config)?;
        let shortlist_generator = match shortlist_blob {
            Some(blob) => Some(ShortlistGenerator::load(
                blob,
                vocabulary.size(),
                false,
                true,
            )?),
            None => None,
        };

        let id = MODEL_ID.fetch_add(1, Ordering::Relaxed);
        info!(
            model = id,
            encoder_layers = config.encoder_layers,
            decoder_layers = config.decoder_layers,
            shortlisted = shortlist_generator.is_some(),
            "model ready"
        );

        let processor = TextProcessor::new(config.split_mode, vocabulary.clone(), splitter);
        Ok(Arc::new(Self {
            id,
            config,
            vocabulary,
            processor,
            transformer,
            shortlist_generator,
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn vocabulary(&self) -> &Arc<dyn Vocabulary> {
        &self.vocabulary
    }

    pub fn processor(&self) -> &TextProcessor {
        &self.processor
    }

    pub fn transformer(&self) -> &Transformer {
        &self.transformer
    }

    /// Greedy-decode one packed batch.
    pub fn translate_input(&self, input: &Input) -> Histories {
        let greedy = Greedy::new(
            &self.transformer,
            self.vocabulary.eos_id(),
            self.shortlist_generator.as_ref(),
        );
        greedy.generate(input)
    }
}
