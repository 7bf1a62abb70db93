//! Portable CPU kernels.
//!
//! The host implementation of every primitive in the catalog. Reductions run
//! over eight independent lanes (AVX2 registers when built with the `simd`
//! feature on an AVX2 target, unrolled scalars otherwise); matrix
//! multiplication and pooling split output rows across threads with
//! [`rayon`].
//!
//! All functions check operand lengths and fail with
//! [`ComputeError::ShapeMismatch`](crate::error::ComputeError::ShapeMismatch)
//! before touching any output.

#[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
use core::arch::x86_64::*;

use rayon::prelude::*;
use xxhash_rust::xxh3::xxh3_128;

use super::{ContentDigest, MatrixDims, PoolingDims, ValidationReport};
use crate::device::KernelMetrics;
use crate::error::{Result, ensure_len, ensure_shape};

const LANES: usize = 8;

/// `Σ x[i]·y[i]`
pub fn dot(x: &[f32], y: &[f32]) -> Result<f32> {
    ensure_len(x.len(), y.len())?;
    Ok(dot_unchecked(x, y))
}

/// Euclidean norm.
pub fn norm(x: &[f32]) -> f32 {
    dot_unchecked(x, x).sqrt()
}

/// Cosine of the angle between `x` and `y`; 0 when either has zero norm.
pub fn cosine_similarity(x: &[f32], y: &[f32]) -> Result<f32> {
    ensure_len(x.len(), y.len())?;
    let xy = dot_unchecked(x, y);
    let xx = dot_unchecked(x, x);
    let yy = dot_unchecked(y, y);
    Ok(cosine_from_parts(xy, xx, yy))
}

pub(crate) fn cosine_from_parts(xy: f32, xx: f32, yy: f32) -> f32 {
    let denom = xx.sqrt() * yy.sqrt();
    if denom == 0.0 { 0.0 } else { xy / denom }
}

#[cfg(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2"))]
fn dot_unchecked(x: &[f32], y: &[f32]) -> f32 {
    let n = x.len().min(y.len());
    let mut idx = 0;
    let mut acc = unsafe { _mm256_setzero_ps() };
    while idx + LANES <= n {
        unsafe {
            let a = _mm256_loadu_ps(x.as_ptr().add(idx));
            let b = _mm256_loadu_ps(y.as_ptr().add(idx));
            acc = _mm256_add_ps(acc, _mm256_mul_ps(a, b));
        }
        idx += LANES;
    }
    let mut lanes = [0.0f32; LANES];
    unsafe { _mm256_storeu_ps(lanes.as_mut_ptr(), acc) };
    let mut sum: f32 = lanes.iter().sum();
    for i in idx..n {
        sum += x[i] * y[i];
    }
    sum
}

#[cfg(not(all(feature = "simd", target_arch = "x86_64", target_feature = "avx2")))]
fn dot_unchecked(x: &[f32], y: &[f32]) -> f32 {
    let mut lanes = [0.0f32; LANES];
    let xs = x.chunks_exact(LANES);
    let ys = y.chunks_exact(LANES);
    let (x_tail, y_tail) = (xs.remainder(), ys.remainder());
    for (a, b) in xs.zip(ys) {
        for l in 0..LANES {
            lanes[l] += a[l] * b[l];
        }
    }
    let mut sum: f32 = lanes.iter().sum();
    for (a, b) in x_tail.iter().zip(y_tail) {
        sum += a * b;
    }
    sum
}

/// Numerically stable softmax of `x` into `out`.
pub fn softmax(x: &[f32], out: &mut [f32]) -> Result<()> {
    ensure_len(x.len(), out.len())?;
    softmax_row(x, out);
    Ok(())
}

/// Row-wise softmax over a `rows × cols` matrix.
pub fn softmax_rows(x: &[f32], out: &mut [f32], rows: usize, cols: usize) -> Result<()> {
    ensure_shape(&[rows, cols], x.len())?;
    ensure_len(x.len(), out.len())?;
    if cols == 0 {
        return Ok(());
    }
    out.par_chunks_mut(cols)
        .zip(x.par_chunks(cols))
        .for_each(|(o, row)| softmax_row(row, o));
    Ok(())
}

fn softmax_row(x: &[f32], out: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for (o, &v) in out.iter_mut().zip(x) {
        *o = (v - max).exp();
        sum += *o;
    }
    let inv = 1.0 / sum;
    for o in out.iter_mut() {
        *o *= inv;
    }
}

/// `out[i] = max(0, x[i])`
pub fn relu(x: &[f32], out: &mut [f32]) -> Result<()> {
    ensure_len(x.len(), out.len())?;
    for (o, &v) in out.iter_mut().zip(x) {
        *o = if v > 0.0 { v } else { 0.0 };
    }
    Ok(())
}

/// `out[i] = x[i] + y[i]`
pub fn add(x: &[f32], y: &[f32], out: &mut [f32]) -> Result<()> {
    ensure_len(x.len(), y.len())?;
    ensure_len(x.len(), out.len())?;
    for ((o, a), b) in out.iter_mut().zip(x).zip(y) {
        *o = a + b;
    }
    Ok(())
}

/// `out[i] = x[i] · y[i]`
pub fn multiply(x: &[f32], y: &[f32], out: &mut [f32]) -> Result<()> {
    ensure_len(x.len(), y.len())?;
    ensure_len(x.len(), out.len())?;
    for ((o, a), b) in out.iter_mut().zip(x).zip(y) {
        *o = a * b;
    }
    Ok(())
}

/// `c = a · b` for row-major `a: m×k`, `b: k×n`, `c: m×n`.
pub fn matmul(a: &[f32], b: &[f32], c: &mut [f32], dims: MatrixDims) -> Result<()> {
    let MatrixDims { m, n, k } = dims;
    ensure_shape(&[m, k], a.len())?;
    ensure_shape(&[k, n], b.len())?;
    ensure_shape(&[m, n], c.len())?;
    if n == 0 {
        return Ok(());
    }

    c.par_chunks_mut(n).enumerate().for_each(|(i, row)| {
        let a_row = &a[i * k..(i + 1) * k];
        for (j, out) in row.iter_mut().enumerate() {
            let mut sum = 0.0f32;
            for (l, &av) in a_row.iter().enumerate() {
                sum += av * b[l * n + j];
            }
            *out = sum;
        }
    });
    Ok(())
}

/// Mean of `input` over sequence positions whose mask is non-zero.
///
/// `input` is `batch × seq × hidden`, `mask` is `batch × seq`, `out` is
/// `batch × hidden`. A row whose mask is all zero yields zeros.
pub fn mean_pooling(input: &[f32], mask: &[i64], out: &mut [f32], dims: PoolingDims) -> Result<()> {
    let PoolingDims { batch, seq, hidden } = dims;
    ensure_shape(&[batch, seq, hidden], input.len())?;
    ensure_shape(&[batch, seq], mask.len())?;
    ensure_shape(&[batch, hidden], out.len())?;
    if hidden == 0 {
        return Ok(());
    }

    out.par_chunks_mut(hidden).enumerate().for_each(|(b, row)| {
        row.fill(0.0);
        let mut count = 0usize;
        for s in 0..seq {
            if mask[b * seq + s] == 0 {
                continue;
            }
            count += 1;
            let offset = (b * seq + s) * hidden;
            for (o, &v) in row.iter_mut().zip(&input[offset..offset + hidden]) {
                *o += v;
            }
        }
        if count > 0 {
            let inv = 1.0 / count as f32;
            row.iter_mut().for_each(|o| *o *= inv);
        }
    });
    Ok(())
}

/// Largest absolute value; NaN if any element is NaN, 0 for an empty slice.
pub fn max_abs(x: &[f32]) -> f32 {
    let mut max = 0.0f32;
    for &v in x {
        if v.is_nan() {
            return f32::NAN;
        }
        max = max.max(v.abs());
    }
    max
}

/// Checks every magnitude against `threshold`.
pub fn validate_content(data: &[f32], threshold: f32) -> ValidationReport {
    let max_magnitude = max_abs(data);
    ValidationReport {
        valid: max_magnitude <= threshold,
        max_magnitude,
        metrics: KernelMetrics::host(core::mem::size_of_val(data)),
    }
}

/// 128-bit xxh3 digest of `bytes`.
pub fn hash_content(bytes: &[u8]) -> ContentDigest {
    ContentDigest(xxh3_128(bytes))
}
