//! Quantized GEMM Provider
//!
//! INT8 × INT8 → F32 affine transforms backing every projection in the
//! forward path. One integer back-end ships: activations are quantized to
//! signed 8-bit on entry, weights arrive pre-transposed (column-major) from
//! the model container, products accumulate in i32 and are unquantized with
//! `1 / (a_quant · b_quant)` while the bias is added in the same pass.
//!
//! Column selection for shortlisted output projections is a contiguous copy
//! per column thanks to the column-major weight layout.

use crate::tensor::{ElementType, Shape, Tensor};

/// Largest magnitude representable in the signed 8-bit weight/activation
/// domain. Quantized values clamp here rather than wrapping.
pub const INT8_MAX: f32 = 127.0;

/// Quantize f32 values by `round(scale · x)` clamped to `[-127, 127]`.
pub fn quantize(input: &[f32], scale: f32, out: &mut [i8]) {
    assert_eq!(input.len(), out.len());
    for (y, &x) in out.iter_mut().zip(input) {
        let value = (scale * x).round().clamp(-INT8_MAX, INT8_MAX);
        *y = value as i8;
    }
}

/// `C_i32 = A · B` with `A` row-major `[m, k]` and `B` column-major `[k, n]`.
fn int8_matmul(a: &[i8], b: &[i8], m: usize, k: usize, n: usize, c: &mut [i32]) {
    assert_eq!(a.len(), m * k);
    assert_eq!(b.len(), k * n);
    assert_eq!(c.len(), m * n);
    for i in 0..m {
        let a_row = &a[i * k..(i + 1) * k];
        for j in 0..n {
            let b_col = &b[j * k..(j + 1) * k];
            let mut acc: i32 = 0;
            for (&x, &y) in a_row.iter().zip(b_col) {
                acc += x as i32 * y as i32;
            }
            c[i * n + j] = acc;
        }
    }
}

fn unquantize_add_bias(
    acc: &[i32],
    bias: &[f32],
    unquant_multiplier: f32,
    rows: usize,
    cols: usize,
    out: &mut [f32],
) {
    assert_eq!(bias.len(), cols);
    for i in 0..rows {
        for j in 0..cols {
            let idx = i * cols + j;
            out[idx] = acc[idx] as f32 * unquant_multiplier + bias[j];
        }
    }
}

fn quantize_activations(x: &Tensor, a_quant: f32) -> (Tensor, usize, usize) {
    let a_cols = x.dim(-1);
    let a_rows = x.size() / a_cols;
    let mut prepared = Tensor::new(ElementType::I8, x.shape().clone(), "quantized_acts");
    quantize(x.as_f32(), a_quant, prepared.as_i8_mut());
    (prepared, a_rows, a_cols)
}

/// `y = x · W + b`. `x` is `[.., k]` f32, `W` a prepared `[k, n]` weight,
/// `b` an `[n]` f32 bias.
pub fn affine(x: &Tensor, w: &Tensor, bias: &Tensor, a_quant: f32, b_quant: f32) -> Tensor {
    let (prepared_a, a_rows, a_cols) = quantize_activations(x, a_quant);
    let b_cols = w.dim(-1);
    let b_rows = w.size() / b_cols;
    assert_eq!(a_cols, b_rows, "operand widths differ");

    let mut acc = vec![0i32; a_rows * b_cols];
    int8_matmul(prepared_a.as_i8(), w.as_i8(), a_rows, a_cols, b_cols, &mut acc);

    let mut out_shape = x.shape().clone();
    out_shape.set_dim(-1, b_cols);
    let mut y = Tensor::new(ElementType::F32, out_shape, "affine_out");

    let unquant_multiplier = 1.0 / (a_quant * b_quant);
    unquantize_add_bias(
        &acc,
        bias.as_f32(),
        unquant_multiplier,
        a_rows,
        b_cols,
        y.as_f32_mut(),
    );
    y
}

/// `y = x · select_columns(W, indices) + b[indices]`. The selected classes
/// must be sorted and unique; the caller maps positions back to ids.
pub fn affine_with_select(
    x: &Tensor,
    w: &Tensor,
    bias: &Tensor,
    a_quant: f32,
    b_quant: f32,
    indices: &[u32],
) -> Tensor {
    let (prepared_a, a_rows, a_cols) = quantize_activations(x, a_quant);
    let b_cols = w.dim(-1);
    let width = w.size() / b_cols;
    assert_eq!(a_cols, width, "operand widths differ");

    // Columns are contiguous in the prepared layout, so selection is a
    // straight copy per index.
    let w_data = w.as_i8();
    let mut selected = vec![0i8; width * indices.len()];
    for (c, &index) in indices.iter().enumerate() {
        let index = index as usize;
        assert!(index < b_cols, "selected class out of range");
        selected[c * width..(c + 1) * width]
            .copy_from_slice(&w_data[index * width..(index + 1) * width]);
    }

    let bias_data = bias.as_f32();
    let selected_bias: Vec<f32> = indices.iter().map(|&i| bias_data[i as usize]).collect();

    let mut acc = vec![0i32; a_rows * indices.len()];
    int8_matmul(
        prepared_a.as_i8(),
        &selected,
        a_rows,
        a_cols,
        indices.len(),
        &mut acc,
    );

    let mut out_shape = x.shape().clone();
    out_shape.set_dim(-1, indices.len());
    let mut y = Tensor::new(ElementType::F32, out_shape, "affine_select_out");

    let unquant_multiplier = 1.0 / (a_quant * b_quant);
    unquantize_add_bias(
        &acc,
        &selected_bias,
        unquant_multiplier,
        a_rows,
        indices.len(),
        y.as_f32_mut(),
    );
    y
}

/// `y = x · W`, the bias-free variant used by the SSRU output transform.
pub fn dot(x: &Tensor, w: &Tensor, a_quant: f32, b_quant: f32) -> Tensor {
    let (prepared_a, a_rows, a_cols) = quantize_activations(x, a_quant);
    let b_cols = w.dim(-1);
    let b_rows = w.size() / b_cols;
    assert_eq!(a_cols, b_rows, "operand widths differ");

    let mut acc = vec![0i32; a_rows * b_cols];
    int8_matmul(prepared_a.as_i8(), w.as_i8(), a_rows, a_cols, b_cols, &mut acc);

    let mut out_shape = x.shape().clone();
    out_shape.set_dim(-1, b_cols);
    let mut y = Tensor::new(ElementType::F32, out_shape, "dot_out");

    let unquant_multiplier = 1.0 / (a_quant * b_quant);
    for (out, &v) in y.as_f32_mut().iter_mut().zip(&acc) {
        *out = v as f32 * unquant_multiplier;
    }
    y
}

/// Quantize an f32 weight already laid out transposed (`[cols, rows]` of the
/// logical matrix, i.e. column-major) into the provider layout. The integer
/// back-end's layout is exactly column-major, so this is quantization alone.
pub fn prepare_weight_transposed(
    weights: &[f32],
    prepared: &mut [i8],
    quantization_multiplier: f32,
    cols: usize,
    rows: usize,
) {
    assert_eq!(weights.len(), cols * rows);
    assert_eq!(prepared.len(), cols * rows);
    quantize(weights, quantization_multiplier, prepared);
}

/// Re-tile an already-quantized transposed weight. Containers ship weights
/// pre-transposed for this provider, so the pass is a plain copy.
pub fn prepare_weight_quantized_transposed(input: &[i8], output: &mut [i8], rows: usize, cols: usize) {
    assert_eq!(input.len(), rows * cols);
    assert_eq!(output.len(), rows * cols);
    output.copy_from_slice(input);
}
