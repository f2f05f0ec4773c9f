//! Transformer Modules
//!
//! The building blocks of the forward path: layer norm, quantized affine and
//! linear projections, multi-head attention, the feed-forward stack and the
//! SSRU recurrent cell that replaces decoder self-attention. Each module
//! binds its tensors out of a flat name → tensor map produced by the
//! container loader, following the `component_lN_part` naming scheme of the
//! shipped weight files.

use std::collections::HashMap;

use crate::error::Error;
use crate::qgemm;
use crate::tensor::ops::{
    self, add, batch_matrix_multiply, highway, relu, softmax_rows, transpose_3120_rows,
};
use crate::tensor::{ElementType, Shape, Tensor};

/// Flat parameter pool the loader fills and the modules drain.
pub type ParameterMap = HashMap<String, Tensor>;

/// Layer-norm epsilon baked into the shipped models.
pub const LN_EPS: f32 = 1e-6;

pub fn take(parameters: &mut ParameterMap, name: &str) -> Result<Tensor, Error> {
    parameters
        .remove(name)
        .ok_or_else(|| Error::MissingParameter(name.to_string()))
}

/// Per-row normalization with learned scale and bias.
pub struct LayerNorm {
    scale: Tensor,
    bias: Tensor,
}

impl LayerNorm {
    pub fn load(parameters: &mut ParameterMap, prefix: &str) -> Result<Self, Error> {
        Ok(Self {
            scale: take(parameters, &format!("{prefix}_ln_scale"))?,
            bias: take(parameters, &format!("{prefix}_ln_bias"))?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        ops::layer_norm(x, &self.scale, &self.bias, LN_EPS)
    }
}

/// `y = x · W + b` through the quantized provider. The activation multiplier
/// comes from the trained `QuantMultA` entry; the weight multiplier trails
/// the prepared weight bytes.
pub struct Affine {
    w: Tensor,
    b: Tensor,
    a_quant: f32,
    b_quant: f32,
}

impl Affine {
    pub fn load(
        parameters: &mut ParameterMap,
        w_name: &str,
        b_name: &str,
        quant_name: &str,
    ) -> Result<Self, Error> {
        let w = take(parameters, w_name)?;
        let b = take(parameters, b_name)?;
        let a_quant = take(parameters, quant_name)?.item_f32();
        let b_quant = w.trailing_f32();
        Ok(Self {
            w,
            b,
            a_quant,
            b_quant,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        qgemm::affine(x, &self.w, &self.b, self.a_quant, self.b_quant)
    }

    pub fn forward_with_select(&self, x: &Tensor, indices: &[u32]) -> Tensor {
        qgemm::affine_with_select(x, &self.w, &self.b, self.a_quant, self.b_quant, indices)
    }

    pub fn output_dim(&self) -> usize {
        self.w.dim(-1)
    }
}

/// Bias-free projection, used for the SSRU output transform.
pub struct Linear {
    w: Tensor,
    a_quant: f32,
    b_quant: f32,
}

impl Linear {
    pub fn load(
        parameters: &mut ParameterMap,
        w_name: &str,
        quant_name: &str,
    ) -> Result<Self, Error> {
        let w = take(parameters, w_name)?;
        let a_quant = take(parameters, quant_name)?.item_f32();
        let b_quant = w.trailing_f32();
        Ok(Self {
            w,
            a_quant,
            b_quant,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        qgemm::dot(x, &self.w, self.a_quant, self.b_quant)
    }

    pub fn output_dim(&self) -> usize {
        self.w.dim(-1)
    }
}

/// `[B, L, H] → [B, h, L, H/h]`.
fn split_heads(x: &Tensor, num_heads: usize) -> Tensor {
    let batch_size = x.dim(-3);
    let sequence_length = x.dim(-2);
    let feature_dim = x.dim(-1);
    assert!(feature_dim % num_heads == 0);
    let dim_head = feature_dim / num_heads;

    let shape = Shape::new(vec![batch_size, sequence_length, num_heads, dim_head]);
    let mut y = Tensor::new(x.ty(), shape.transpose(-3, -2), x.name().to_string());
    transpose_3120_rows(
        x.as_f32(),
        batch_size,
        sequence_length,
        num_heads,
        dim_head,
        y.as_f32_mut(),
    );
    y
}

/// `[B, h, L, H/h] → [B, L, H]`.
fn join_heads(x: &Tensor) -> Tensor {
    let batch_size = x.dim(-4);
    let num_heads = x.dim(-3);
    let sequence_length = x.dim(-2);
    let dim_head = x.dim(-1);

    let shape = Shape::new(vec![batch_size, sequence_length, num_heads * dim_head]);
    let mut y = Tensor::new(x.ty(), shape, "concat");
    transpose_3120_rows(
        x.as_f32(),
        batch_size,
        num_heads,
        sequence_length,
        dim_head,
        y.as_f32_mut(),
    );
    y
}

/// `softmax((q · kᵀ) / √d_head + mask) · v`, returning the attention
/// distribution alongside the weighted values.
fn scaled_dot_product_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    mask: &Tensor,
) -> (Tensor, Tensor) {
    let batch_size = q.dim(-4);
    let num_heads = q.dim(-3);
    let query_length = q.dim(-2);
    let dim_head = q.dim(-1);
    let value_length = v.dim(-2);

    let shape = Shape::new(vec![batch_size, num_heads, query_length, value_length]);
    let mut qkt = Tensor::new(q.ty(), shape, "qkt");

    let d_k = 1.0 / (dim_head as f32).sqrt();
    let folded_batch = batch_size * num_heads;
    batch_matrix_multiply(
        q.as_f32(),
        k.as_f32(),
        folded_batch,
        query_length,
        dim_head,
        value_length,
        dim_head,
        false,
        true,
        d_k,
        qkt.as_f32_mut(),
    );

    // Broadcast the [B, Lk] mask over every (head, query) slice.
    let batch_stride = num_heads * query_length * value_length;
    let mask_data = mask.as_f32();
    let qkt_data = qkt.as_f32_mut();
    for batch_id in 0..batch_size {
        let mask_row = &mask_data[batch_id * value_length..(batch_id + 1) * value_length];
        let block = &mut qkt_data[batch_id * batch_stride..(batch_id + 1) * batch_stride];
        for chunk in block.chunks_exact_mut(value_length) {
            for (value, &m) in chunk.iter_mut().zip(mask_row) {
                *value += m;
            }
        }
    }

    let mut attn = Tensor::new(v.ty(), qkt.shape().clone(), "sdpa_attn");
    softmax_rows(
        qkt.as_f32(),
        folded_batch * query_length,
        value_length,
        attn.as_f32_mut(),
    );

    let mut out = Tensor::new(q.ty(), q.shape().clone(), "sdpa_out");
    batch_matrix_multiply(
        attn.as_f32(),
        v.as_f32(),
        folded_batch,
        query_length,
        value_length,
        value_length,
        dim_head,
        false,
        false,
        1.0,
        out.as_f32_mut(),
    );

    (out, attn)
}

/// Multi-head attention with residual add and post layer-norm. Instantiated
/// as `self` attention in the encoder and `context` (cross) attention in the
/// decoder.
pub struct Attention {
    q: Affine,
    k: Affine,
    v: Affine,
    o: Affine,
    ln: LayerNorm,
    num_heads: usize,
}

impl Attention {
    pub fn load(
        parameters: &mut ParameterMap,
        prefix: &str,
        name: &str,
        num_heads: usize,
    ) -> Result<Self, Error> {
        let affine = |parameters: &mut ParameterMap, suffix: &str| {
            Affine::load(
                parameters,
                &format!("{prefix}_{name}_W{suffix}"),
                &format!("{prefix}_{name}_b{suffix}"),
                &format!("{prefix}_{name}_W{suffix}_QuantMultA"),
            )
        };
        Ok(Self {
            q: affine(parameters, "q")?,
            k: affine(parameters, "k")?,
            v: affine(parameters, "v")?,
            o: affine(parameters, "o")?,
            ln: LayerNorm::load(parameters, &format!("{prefix}_{name}_Wo"))?,
            num_heads,
        })
    }

    pub fn forward(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: &Tensor) -> (Tensor, Tensor) {
        let yq = self.q.forward(q);
        let yk = self.k.forward(k);
        let yv = self.v.forward(v);

        let split_yq = split_heads(&yq, self.num_heads);
        let split_yk = split_heads(&yk, self.num_heads);
        let split_yv = split_heads(&yv, self.num_heads);

        let (attn_out, attn) = scaled_dot_product_attention(&split_yq, &split_yk, &split_yv, mask);

        let joined = join_heads(&attn_out);
        let yo = self.o.forward(&joined);

        // Residual against the query input, then norm.
        let x_plus_y = add(q, &yo);
        let y = self.ln.forward(&x_plus_y);

        (y, attn)
    }
}

/// One feed-forward projection of the two-layer FFN block.
pub struct Ffn {
    projection: Affine,
}

impl Ffn {
    pub fn load(parameters: &mut ParameterMap, prefix: &str, depth: usize) -> Result<Self, Error> {
        Ok(Self {
            projection: Affine::load(
                parameters,
                &format!("{prefix}_ffn_W{depth}"),
                &format!("{prefix}_ffn_b{depth}"),
                &format!("{prefix}_ffn_W{depth}_QuantMultA"),
            )?,
        })
    }

    pub fn forward(&self, x: &Tensor) -> Tensor {
        self.projection.forward(x)
    }
}

/// Apply the feed-forward chain with ReLU between layers, then residual and
/// post layer-norm: `post_ln(ffn_n(…relu(ffn_1(x))…) + x)`.
fn feed_forward_block(ffn: &[Ffn], post_ln: &LayerNorm, x: &Tensor) -> Tensor {
    let mut acts = ffn[0].forward(x);
    for layer in &ffn[1..] {
        acts = layer.forward(&relu(&acts));
    }
    let y = add(&acts, x);
    post_ln.forward(&y)
}

/// Simple Self-Recurrent Unit. One hidden state per decoder layer:
///
/// ```text
/// f(t) = σ(W_f·x(t) + b_f)
/// c(t) = f(t) ⊙ c(t−1) + (1 − f(t)) ⊙ W·x(t)
/// y(t) = relu(c(t))
/// h(t) = layer_norm(x(t) + y(t))
/// ```
pub struct Ssru {
    f: Affine,
    o: Linear,
    ln: LayerNorm,
}

impl Ssru {
    pub fn load(parameters: &mut ParameterMap, prefix: &str) -> Result<Self, Error> {
        let local = format!("{prefix}_rnn");
        Ok(Self {
            f: Affine::load(
                parameters,
                &format!("{local}_Wf"),
                &format!("{local}_bf"),
                &format!("{local}_Wf_QuantMultA"),
            )?,
            o: Linear::load(
                parameters,
                &format!("{local}_W"),
                &format!("{local}_W_QuantMultA"),
            )?,
            ln: LayerNorm::load(parameters, &format!("{local}_ffn"))?,
        })
    }

    pub fn start_state(&self, batch_size: usize) -> Tensor {
        let feature_dim = self.o.output_dim();
        Tensor::new(
            ElementType::F32,
            Shape::new(vec![batch_size, feature_dim]),
            "start",
        )
    }

    pub fn forward(&self, state: &mut Tensor, x: &Tensor) -> Tensor {
        let f = self.f.forward(x);
        let wxt = self.o.forward(x);

        // The gate sigmoid lives inside highway: c' = σ(f)·c + (1−σ(f))·Wx.
        let c_t = highway(state, &wxt, &f);
        let y = relu(&c_t);
        let h = self.ln.forward(&add(x, &y));

        *state = c_t;
        h
    }
}

/// Self-attention followed by the feed-forward block.
pub struct EncoderLayer {
    attention: Attention,
    ffn: Vec<Ffn>,
    post_ln: LayerNorm,
}

impl EncoderLayer {
    pub fn load(
        parameters: &mut ParameterMap,
        depth: usize,
        ffn_count: usize,
        num_heads: usize,
    ) -> Result<Self, Error> {
        let prefix = format!("encoder_l{depth}");
        let mut ffn = Vec::with_capacity(ffn_count);
        for i in 1..=ffn_count {
            ffn.push(Ffn::load(parameters, &prefix, i)?);
        }
        Ok(Self {
            attention: Attention::load(parameters, &prefix, "self", num_heads)?,
            ffn,
            post_ln: LayerNorm::load(parameters, &format!("{prefix}_ffn_ffn"))?,
        })
    }

    pub fn forward(&self, x: &Tensor, mask: &Tensor) -> Tensor {
        let (out, _attn) = self.attention.forward(x, x, x, mask);
        feed_forward_block(&self.ffn, &self.post_ln, &out)
    }
}

/// SSRU recurrence, cross-attention over the encoder output, feed-forward.
pub struct DecoderLayer {
    rnn: Ssru,
    attention: Attention,
    ffn: Vec<Ffn>,
    post_ln: LayerNorm,
}

impl DecoderLayer {
    pub fn load(
        parameters: &mut ParameterMap,
        depth: usize,
        ffn_count: usize,
        num_heads: usize,
    ) -> Result<Self, Error> {
        let prefix = format!("decoder_l{depth}");
        let mut ffn = Vec::with_capacity(ffn_count);
        for i in 1..=ffn_count {
            ffn.push(Ffn::load(parameters, &prefix, i)?);
        }
        Ok(Self {
            rnn: Ssru::load(parameters, &prefix)?,
            attention: Attention::load(parameters, &prefix, "context", num_heads)?,
            ffn,
            post_ln: LayerNorm::load(parameters, &format!("{prefix}_ffn_ffn"))?,
        })
    }

    pub fn start_state(&self, batch_size: usize) -> Tensor {
        self.rnn.start_state(batch_size)
    }

    /// Returns the layer output and the cross-attention distribution; the
    /// last layer's distribution doubles as the reported alignment.
    pub fn forward(
        &self,
        encoder_out: &Tensor,
        mask: &Tensor,
        state: &mut Tensor,
        x: &Tensor,
    ) -> (Tensor, Tensor) {
        let decoder_out = self.rnn.forward(state, x);
        let (out, attn) = self
            .attention
            .forward(&decoder_out, encoder_out, encoder_out, mask);
        let y = feed_forward_block(&self.ffn, &self.post_ln, &out);
        (y, attn)
    }
}

/// Add the position signal in place: `x = x·√H + sinusoidal(start, L, H)`,
/// broadcast over the batch.
pub fn transform_embedding(word_embedding: &mut Tensor, start: usize) {
    let embed_dim = word_embedding.dim(-1);
    let sequence_length = word_embedding.dim(-2);
    let batch_size = word_embedding.dim(-3);

    let scale = (embed_dim as f32).sqrt();
    let data = word_embedding.as_f32_mut();
    for value in data.iter_mut() {
        *value *= scale;
    }

    let mut signal = vec![0.0f32; sequence_length * embed_dim];
    ops::sinusoidal_signal(start, sequence_length, embed_dim, &mut signal);
    for batch_id in 0..batch_size {
        let row = &mut data[batch_id * signal.len()..(batch_id + 1) * signal.len()];
        for (value, &s) in row.iter_mut().zip(&signal) {
            *value += s;
        }
    }
}
