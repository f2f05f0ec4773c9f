//! Tensor Kernels
//!
//! Dense, stride-free operations over f32 data: elementwise arithmetic,
//! reductions, the attention transposes, a batched sgemm, layer norm and the
//! sinusoidal positional signal. Elementwise loops run over 8-lane chunks
//! with a scalar tail so the compiler can keep the hot path vectorized.

use super::{ElementType, Shape, Tensor};

const LANES: usize = 8;

#[inline]
fn sigmoid_scalar(x: f32) -> f32 {
    if x > 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

macro_rules! binary_kernel {
    ($name:ident, $op:expr) => {
        pub fn $name(a: &[f32], b: &[f32], out: &mut [f32]) {
            assert_eq!(a.len(), b.len());
            assert_eq!(a.len(), out.len());
            let op = $op;
            let mut chunks = out.chunks_exact_mut(LANES);
            let mut a_chunks = a.chunks_exact(LANES);
            let mut b_chunks = b.chunks_exact(LANES);
            for ((c, x), y) in (&mut chunks).zip(&mut a_chunks).zip(&mut b_chunks) {
                for i in 0..LANES {
                    c[i] = op(x[i], y[i]);
                }
            }
            for ((c, x), y) in chunks
                .into_remainder()
                .iter_mut()
                .zip(a_chunks.remainder())
                .zip(b_chunks.remainder())
            {
                *c = op(*x, *y);
            }
        }
    };
}

binary_kernel!(add_into, |x: f32, y: f32| x + y);
binary_kernel!(sub_into, |x: f32, y: f32| x - y);
binary_kernel!(mul_into, |x: f32, y: f32| x * y);

pub fn relu_into(a: &[f32], out: &mut [f32]) {
    assert_eq!(a.len(), out.len());
    for (c, x) in out.iter_mut().zip(a) {
        *c = x.max(0.0);
    }
}

pub fn sigmoid_into(a: &[f32], out: &mut [f32]) {
    assert_eq!(a.len(), out.len());
    for (c, x) in out.iter_mut().zip(a) {
        *c = sigmoid_scalar(*x);
    }
}

pub fn mul_scalar_into(a: &[f32], scalar: f32, out: &mut [f32]) {
    assert_eq!(a.len(), out.len());
    for (c, x) in out.iter_mut().zip(a) {
        *c = x * scalar;
    }
}

/// `out = σ(g)·x + (1−σ(g))·y`, elementwise.
pub fn highway_into(x: &[f32], y: &[f32], g: &[f32], out: &mut [f32]) {
    assert_eq!(x.len(), y.len());
    assert_eq!(x.len(), g.len());
    assert_eq!(x.len(), out.len());
    for i in 0..out.len() {
        let s = sigmoid_scalar(g[i]);
        out[i] = s * x[i] + (1.0 - s) * y[i];
    }
}

/// Row-wise numerically stable softmax over `[rows, cols]`.
pub fn softmax_rows(logits: &[f32], rows: usize, cols: usize, out: &mut [f32]) {
    assert_eq!(logits.len(), rows * cols);
    assert_eq!(out.len(), rows * cols);
    for r in 0..rows {
        let xs = &logits[r * cols..(r + 1) * cols];
        let ys = &mut out[r * cols..(r + 1) * cols];

        let max = xs.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0;
        for (y, &x) in ys.iter_mut().zip(xs) {
            let e = (x - max).exp();
            *y = e;
            sum += e;
        }
        for y in ys.iter_mut() {
            *y /= sum;
        }
    }
}

/// `y = scale·(x − μ)/σ + bias` per row of `[rows, cols]`, statistics in f32.
pub fn layer_norm_rows(
    input: &[f32],
    scale: &[f32],
    bias: &[f32],
    eps: f32,
    rows: usize,
    cols: usize,
    out: &mut [f32],
) {
    assert_eq!(input.len(), rows * cols);
    assert_eq!(scale.len(), cols);
    assert_eq!(bias.len(), cols);
    for r in 0..rows {
        let xs = &input[r * cols..(r + 1) * cols];
        let ys = &mut out[r * cols..(r + 1) * cols];

        let mean = xs.iter().sum::<f32>() / cols as f32;
        let mut centered_sq = 0.0;
        for &x in xs {
            let v = x - mean;
            centered_sq += v * v;
        }
        let sigma = (centered_sq / cols as f32 + eps).sqrt();

        for ((y, &x), (&s, &b)) in ys.iter_mut().zip(xs).zip(scale.iter().zip(bias)) {
            *y = s * ((x - mean) / sigma) + b;
        }
    }
}

/// `out[b, t, :] = source[indices[b, t], :]` — embedding row gather.
pub fn index_select_rows(
    source: &[f32],
    indices: &[u32],
    batch_size: usize,
    sequence_length: usize,
    embed_dim: usize,
    out: &mut [f32],
) {
    assert_eq!(indices.len(), batch_size * sequence_length);
    assert_eq!(out.len(), batch_size * sequence_length * embed_dim);
    for (slot, &token) in indices.iter().enumerate() {
        let row = &source[token as usize * embed_dim..(token as usize + 1) * embed_dim];
        out[slot * embed_dim..(slot + 1) * embed_dim].copy_from_slice(row);
    }
}

pub fn index_select(source: &Tensor, indices: &Tensor, name: &str) -> Tensor {
    let sequence_length = indices.dim(-1);
    let batch_size = indices.dim(-2);
    let embed_dim = source.dim(-1);

    let shape = Shape::new(vec![batch_size, sequence_length, embed_dim]);
    let mut selected = Tensor::new(ElementType::F32, shape, name);
    index_select_rows(
        source.as_f32(),
        indices.as_u32(),
        batch_size,
        sequence_length,
        embed_dim,
        selected.as_f32_mut(),
    );
    selected
}

/// Plain 2-d transpose, `out[j, i] = in[i, j]`.
pub fn transpose_10<T: Copy>(input: &[T], rows: usize, cols: usize, out: &mut [T]) {
    assert_eq!(input.len(), rows * cols);
    assert_eq!(out.len(), rows * cols);
    for i in 0..rows {
        for j in 0..cols {
            out[j * rows + i] = input[i * cols + j];
        }
    }
}

/// Permute the two leading axes of `[d2, d1, d0]`, keeping rows contiguous.
pub fn transpose_120(input: &[f32], d2: usize, d1: usize, d0: usize, out: &mut [f32]) {
    assert_eq!(input.len(), d2 * d1 * d0);
    assert_eq!(out.len(), input.len());
    let rows = d2 * d1;
    for src in 0..rows {
        let dst = src / d1 + (src % d1) * d2;
        out[dst * d0..(dst + 1) * d0].copy_from_slice(&input[src * d0..(src + 1) * d0]);
    }
}

/// Permute the middle two axes of `[outer, d2, d1, d0]`. Self-inverse, used
/// for attention head split and join.
pub fn transpose_3120_rows(
    input: &[f32],
    outer: usize,
    d2: usize,
    d1: usize,
    d0: usize,
    out: &mut [f32],
) {
    assert_eq!(input.len(), outer * d2 * d1 * d0);
    assert_eq!(out.len(), input.len());
    for k in 0..outer {
        let shift = k * d2 * d1;
        for j in 0..d2 * d1 {
            let src = j + shift;
            let dst = j / d1 + (j % d1) * d2 + shift;
            out[dst * d0..(dst + 1) * d0].copy_from_slice(&input[src * d0..(src + 1) * d0]);
        }
    }
}

pub fn transpose_3120(x: &Tensor) -> Tensor {
    let d3 = x.dim(-3);
    let d2 = x.dim(-2);
    let d1 = x.dim(-1);
    let outer = x.size() / (d3 * d2 * d1);
    let mut y = Tensor::new(x.ty(), x.shape().transpose(-3, -2), x.name().to_string());
    transpose_3120_rows(x.as_f32(), outer, d3, d2, d1, y.as_f32_mut());
    y
}

/// Row-major sgemm `C = alpha · op(A) · op(B)` with `beta = 0`.
fn matrix_multiply(
    trans_a: bool,
    trans_b: bool,
    m: usize,
    n: usize,
    k: usize,
    alpha: f32,
    a: &[f32],
    lda: usize,
    b: &[f32],
    ldb: usize,
    c: &mut [f32],
    ldc: usize,
) {
    for i in 0..m {
        c[i * ldc..i * ldc + n].fill(0.0);
        for l in 0..k {
            let a_il = if trans_a { a[l * lda + i] } else { a[i * lda + l] };
            let row = &mut c[i * ldc..i * ldc + n];
            if trans_b {
                for (j, out) in row.iter_mut().enumerate() {
                    *out += a_il * b[j * ldb + l];
                }
            } else {
                for (j, out) in row.iter_mut().enumerate() {
                    *out += a_il * b[l * ldb + j];
                }
            }
        }
        if alpha != 1.0 {
            for out in &mut c[i * ldc..i * ldc + n] {
                *out *= alpha;
            }
        }
    }
}

/// Per-batch-element sgemm over equally sized matrices laid out back to
/// back. `A` is `[batch, rows_a, cols_a]`, `B` is `[batch, rows_b, cols_b]`.
#[allow(clippy::too_many_arguments)]
pub fn batch_matrix_multiply(
    a: &[f32],
    b: &[f32],
    batch_size: usize,
    rows_a: usize,
    cols_a: usize,
    rows_b: usize,
    cols_b: usize,
    trans_a: bool,
    trans_b: bool,
    alpha: f32,
    c: &mut [f32],
) {
    let mut m = rows_a;
    let mut k = cols_a;
    let mut l = rows_b;
    let mut n = cols_b;
    if trans_a {
        std::mem::swap(&mut m, &mut k);
    }
    if trans_b {
        std::mem::swap(&mut l, &mut n);
    }
    assert_eq!(k, l, "incompatible operand widths");

    // Leading dimensions are the storage strides, i.e. columns in row-major.
    let (lda, ldb, ldc) = (cols_a, cols_b, n);
    let (stride_a, stride_b, stride_c) = (m * k, k * n, m * n);

    for i in 0..batch_size {
        matrix_multiply(
            trans_a,
            trans_b,
            m,
            n,
            k,
            alpha,
            &a[i * stride_a..(i + 1) * stride_a],
            lda,
            &b[i * stride_b..(i + 1) * stride_b],
            ldb,
            &mut c[i * stride_c..(i + 1) * stride_c],
            ldc,
        );
    }
}

/// Add a `[size]` vector to every row of `[batch, size]`.
pub fn batch_add_vector(a: &[f32], x: &[f32], batch_size: usize, size: usize, out: &mut [f32]) {
    for batch_id in 0..batch_size {
        let offset = batch_id * size;
        add_into(&a[offset..offset + size], x, &mut out[offset..offset + size]);
    }
}

/// Sinusoidal positional signal for positions `[start, start + length)`:
/// `pos[p, i] = sin(v)` for the first half of the features and `cos(v)` for
/// the second, with `v = p · exp(−i · ln(10000) / (H/2 − 1))`.
pub fn sinusoidal_signal(start: usize, length: usize, embed_dim: usize, out: &mut [f32]) {
    assert_eq!(out.len(), length * embed_dim);
    let num_timescales = embed_dim / 2;
    let log_timescale_increment = 10000.0f32.ln() / (num_timescales as f32 - 1.0);

    for p in start..start + length {
        for i in 0..num_timescales {
            let v = p as f32 * (-(i as f32) * log_timescale_increment).exp();
            let offset = (p - start) * embed_dim + i;
            out[offset] = v.sin();
            out[offset + num_timescales] = v.cos();
        }
    }
}

// Tensor-level conveniences used by the forward path. Each allocates its
// output; the encoder/decoder recycle tensors by moving them.

pub fn add(x: &Tensor, y: &Tensor) -> Tensor {
    let mut out = x.like("x_plus_y");
    add_into(x.as_f32(), y.as_f32(), out.as_f32_mut());
    out
}

pub fn relu(x: &Tensor) -> Tensor {
    let mut out = x.like("relu");
    relu_into(x.as_f32(), out.as_f32_mut());
    out
}

pub fn highway(x: &Tensor, y: &Tensor, g: &Tensor) -> Tensor {
    let mut out = x.like("highway");
    highway_into(x.as_f32(), y.as_f32(), g.as_f32(), out.as_f32_mut());
    out
}

pub fn layer_norm(x: &Tensor, scale: &Tensor, bias: &Tensor, eps: f32) -> Tensor {
    let cols = x.dim(-1);
    let rows = x.size() / cols;
    let mut out = x.like("ln_out");
    layer_norm_rows(
        x.as_f32(),
        scale.as_f32(),
        bias.as_f32(),
        eps,
        rows,
        cols,
        out.as_f32_mut(),
    );
    out
}

/// Mean squared error between two f32 tensors. Test support.
pub fn mse(x: &Tensor, y: &Tensor) -> f32 {
    assert_eq!(x.size(), y.size());
    let mut sum = 0.0;
    for (&a, &b) in x.as_f32().iter().zip(y.as_f32()) {
        let d = a - b;
        sum += d * d;
    }
    sum / x.size() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let logits = [1.0, 2.0, 3.0, -1.0, 0.0, 1000.0, -2.5, 0.5];
        let mut out = [0.0; 8];
        softmax_rows(&logits, 2, 4, &mut out);
        for row in out.chunks(4) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-5, "row sums to {sum}");
            assert!(row.iter().all(|&p| p > 0.0 && p < 1.0 + 1e-6));
        }
    }

    #[test]
    fn test_layer_norm_unit_scale_zero_bias() {
        let input: Vec<f32> = (0..32).map(|i| i as f32 * 0.37 - 3.0).collect();
        let scale = vec![1.0; 16];
        let bias = vec![0.0; 16];
        let mut out = vec![0.0; 32];
        layer_norm_rows(&input, &scale, &bias, 1e-9, 2, 16, &mut out);
        for row in out.chunks(16) {
            let mean: f32 = row.iter().sum::<f32>() / 16.0;
            let var: f32 = row.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / 16.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
    }

    #[test]
    fn test_transpose_3120_is_involution() {
        let (outer, d2, d1, d0) = (2usize, 3usize, 4usize, 5usize);
        let input: Vec<f32> = (0..outer * d2 * d1 * d0).map(|i| i as f32).collect();
        let mut once = vec![0.0; input.len()];
        let mut twice = vec![0.0; input.len()];
        transpose_3120_rows(&input, outer, d2, d1, d0, &mut once);
        transpose_3120_rows(&once, outer, d1, d2, d0, &mut twice);
        assert_eq!(input, twice);
    }

    #[test]
    fn test_transpose_10_round_trip() {
        let input: Vec<i8> = (0..12).collect();
        let mut t = vec![0i8; 12];
        let mut back = vec![0i8; 12];
        transpose_10(&input, 3, 4, &mut t);
        transpose_10(&t, 4, 3, &mut back);
        assert_eq!(input, back);
    }

    #[test]
    fn test_index_select_copies_rows() {
        let vocab: Vec<f32> = (0..5 * 3).map(|i| i as f32).collect();
        let indices = [4u32, 0, 2, 2];
        let mut out = vec![0.0; 4 * 3];
        index_select_rows(&vocab, &indices, 2, 2, 3, &mut out);
        assert_eq!(&out[0..3], &vocab[12..15]);
        assert_eq!(&out[3..6], &vocab[0..3]);
        assert_eq!(&out[6..9], &vocab[6..9]);
        assert_eq!(&out[9..12], &vocab[6..9]);
    }

    #[test]
    fn test_batch_matrix_multiply_identity() {
        // A · I = A, per batch element.
        let a: Vec<f32> = (0..2 * 2 * 3).map(|i| i as f32).collect();
        let eye = [1.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 1.0];
        let b: Vec<f32> = eye.iter().chain(eye.iter()).copied().collect();
        let mut c = vec![0.0; 2 * 2 * 3];
        batch_matrix_multiply(&a, &b, 2, 2, 3, 3, 3, false, false, 1.0, &mut c);
        assert_eq!(a, c);
    }

    #[test]
    fn test_batch_matrix_multiply_transpose_b() {
        // [1, 2] · [[1, 2], [3, 4]]^T = [5, 11] with trans_b reading rows.
        let a = [1.0, 2.0];
        let b = [1.0, 2.0, 3.0, 4.0];
        let mut c = [0.0; 2];
        batch_matrix_multiply(&a, &b, 1, 1, 2, 2, 2, false, true, 1.0, &mut c);
        assert_eq!(c, [5.0, 11.0]);
    }

    #[test]
    fn test_sgemm_alpha_scaling() {
        let a = [2.0, 0.0];
        let b = [1.0, 0.0, 0.0, 1.0];
        let mut c = [0.0; 2];
        batch_matrix_multiply(&a, &b, 1, 1, 2, 2, 2, false, false, 0.5, &mut c);
        assert_eq!(c, [1.0, 0.0]);
    }

    #[test]
    fn test_sinusoidal_signal_endpoints() {
        let embed = 8;
        let mut out = vec![0.0; 2 * embed];
        sinusoidal_signal(0, 2, embed, &mut out);
        // Position 0: sin(0) = 0 in the first half, cos(0) = 1 in the second.
        for i in 0..embed / 2 {
            assert_eq!(out[i], 0.0);
            assert_eq!(out[embed / 2 + i], 1.0);
        }
        // Position 1, timescale 0: sin(1), cos(1).
        assert!((out[embed] - 1.0f32.sin()).abs() < 1e-6);
        assert!((out[embed + embed / 2] - 1.0f32.cos()).abs() < 1e-6);
    }

    #[test]
    fn test_highway_gate_extremes() {
        let x = [1.0, 1.0];
        let y = [-1.0, -1.0];
        let g = [40.0, -40.0];
        let mut out = [0.0; 2];
        highway_into(&x, &y, &g, &mut out);
        assert!((out[0] - 1.0).abs() < 1e-5); // gate saturated open
        assert!((out[1] + 1.0).abs() < 1e-5); // gate saturated closed
    }

    #[test]
    fn test_elementwise_with_remainder_tail() {
        // 11 elements exercises both the 8-lane chunk and the scalar tail.
        let a: Vec<f32> = (0..11).map(|i| i as f32).collect();
        let b: Vec<f32> = (0..11).map(|i| (i * 2) as f32).collect();
        let mut out = vec![0.0; 11];
        add_into(&a, &b, &mut out);
        for i in 0..11 {
            assert_eq!(out[i], (i * 3) as f32);
        }
        sub_into(&b, &a, &mut out);
        for i in 0..11 {
            assert_eq!(out[i], i as f32);
        }
    }
}
