//! Transformer
//!
//! The encoder–decoder forward path: an encoder stack applied once per
//! batch, and an SSRU-based decoder stepped token by token against the
//! cached encoder output. Parameters bind by name from the model container;
//! whatever the modules do not consume is logged and dropped.

use tracing::warn;

use crate::config::Config;
use crate::error::Error;
use crate::mem::MemoryMap;
use crate::model::io;
use crate::tensor::ops::index_select;
use crate::tensor::{ElementType, Shape, Tensor};

pub mod modules;

use modules::{take, Affine, DecoderLayer, EncoderLayer, ParameterMap};

pub use modules::transform_embedding;

pub struct Encoder {
    layers: Vec<EncoderLayer>,
}

impl Encoder {
    fn load(
        parameters: &mut ParameterMap,
        layers: usize,
        ffn_count: usize,
        num_heads: usize,
    ) -> Result<Self, Error> {
        let mut stack = Vec::with_capacity(layers);
        for depth in 1..=layers {
            stack.push(EncoderLayer::load(parameters, depth, ffn_count, num_heads)?);
        }
        Ok(Self { layers: stack })
    }

    /// Run the stack over position-transformed embeddings, reusing `x` as
    /// working storage between layers.
    pub fn forward(&self, word_embedding: Tensor, mask: &Tensor) -> Tensor {
        let mut x = word_embedding;
        for layer in &self.layers {
            x = layer.forward(&x, mask);
        }
        x
    }
}

pub struct Decoder {
    layers: Vec<DecoderLayer>,
    output: Affine,
}

impl Decoder {
    fn load(
        parameters: &mut ParameterMap,
        layers: usize,
        ffn_count: usize,
        num_heads: usize,
    ) -> Result<Self, Error> {
        let mut stack = Vec::with_capacity(layers);
        for depth in 1..=layers {
            stack.push(DecoderLayer::load(parameters, depth, ffn_count, num_heads)?);
        }
        // The output projection reuses the shared embedding, repacked at
        // load time. Its activation multiplier ships as `none_QuantMultA`
        // in the weight files.
        let output = Affine::load(
            parameters,
            "Wemb_intgemm8",
            "decoder_ff_logit_out_b",
            "none_QuantMultA",
        )?;
        Ok(Self {
            layers: stack,
            output,
        })
    }

    /// Zero recurrent state per layer.
    pub fn start_states(&self, batch_size: usize) -> Vec<Tensor> {
        self.layers
            .iter()
            .map(|layer| layer.start_state(batch_size))
            .collect()
    }

    /// One decoding step. `previous` holds the words sampled at the prior
    /// step (empty on the first), `position` the target position for the
    /// sinusoidal signal. Returns logits over the shortlist (or the full
    /// vocabulary) and the last layer's cross-attention.
    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &self,
        embedding: &Tensor,
        encoder_out: &Tensor,
        mask: &Tensor,
        states: &mut [Tensor],
        previous: &[u32],
        shortlist: Option<&[u32]>,
        position: usize,
    ) -> (Tensor, Tensor) {
        let batch_size = encoder_out.dim(-3);
        let embed_dim = embedding.dim(-1);

        let mut decoder_embed = if previous.is_empty() {
            // First step decodes from an all-zero embedding.
            Tensor::new(
                ElementType::F32,
                Shape::new(vec![batch_size, 1, embed_dim]),
                "target_embed",
            )
        } else {
            let mut indices = Tensor::new(
                ElementType::U32,
                Shape::new(vec![batch_size, 1]),
                "target_indices",
            );
            indices.as_u32_mut().copy_from_slice(previous);
            index_select(embedding, &indices, "target_embed")
        };
        transform_embedding(&mut decoder_embed, position);

        let mut x = decoder_embed;
        let mut alignment = None;
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            let (y, attn) = layer.forward(encoder_out, mask, &mut states[i], &x);
            x = y;
            if i == last {
                alignment = Some(attn);
            }
        }
        let alignment = alignment.expect("decoder has at least one layer");

        let logits = match shortlist {
            Some(indices) => self.output.forward_with_select(&x, indices),
            None => self.output.forward(&x),
        };
        (logits, alignment)
    }
}

/// The full model graph bound to one weight container.
pub struct Transformer {
    embedding: Tensor,
    encoder: Encoder,
    decoder: Decoder,
}

impl Transformer {
    pub fn load(map: &MemoryMap, config: &Config) -> Result<Self, Error> {
        let items = io::load_items(map)?;
        let parameters: ParameterMap = items.into_iter().collect();
        Self::from_parameters(parameters, config)
    }

    pub fn from_parameters(mut parameters: ParameterMap, config: &Config) -> Result<Self, Error> {
        let embedding = take(&mut parameters, "Wemb")?;
        let encoder = Encoder::load(
            &mut parameters,
            config.encoder_layers,
            config.feed_forward_depth,
            config.num_heads,
        )?;
        let decoder = Decoder::load(
            &mut parameters,
            config.decoder_layers,
            config.feed_forward_depth,
            config.num_heads,
        )?;

        // Offset-preserving placeholder; carries no useful value.
        parameters.remove("Wemb_QuantMultA");
        for name in parameters.keys() {
            warn!(parameter = %name, "container entry left unbound");
        }

        Ok(Self {
            embedding,
            encoder,
            decoder,
        })
    }

    /// Shared source/target token embedding, dequantized at load.
    pub fn embedding(&self) -> &Tensor {
        &self.embedding
    }

    pub fn encode(&self, word_embedding: Tensor, mask: &Tensor) -> Tensor {
        self.encoder.forward(word_embedding, mask)
    }

    pub fn start_states(&self, batch_size: usize) -> Vec<Tensor> {
        self.decoder.start_states(batch_size)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn step(
        &self,
        encoder_out: &Tensor,
        mask: &Tensor,
        states: &mut [Tensor],
        previous: &[u32],
        shortlist: Option<&[u32]>,
        position: usize,
    ) -> (Tensor, Tensor) {
        self.decoder.step(
            &self.embedding,
            encoder_out,
            mask,
            states,
            previous,
            shortlist,
            position,
        )
    }
}
