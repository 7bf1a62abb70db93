//! # Primitive Operations
//!
//! The fixed catalog of numeric primitives and the two paths that run it.
//!
//! ## Submodules
//!
//! - [`cpu`]: parallel and SIMD host kernels, always available
//! - [`dispatch`]: the [`dispatch::ComputeBackend`] strategy trait, its CPU and
//!   device variants, and [`dispatch::NativeComputeContext`] which picks one
//! - `wgpu` *(feature `wgpu`)*: the WebGPU accelerator
//!
//! ## Feature Flags
//!
//! - `simd`: AVX2 reductions on x86_64 targets built with `avx2`
//! - `wgpu`: WebGPU accelerator and compute shaders

pub mod cpu;
pub mod dispatch;
#[cfg(feature = "wgpu")]
pub mod wgpu;

use core::fmt;

use serde::Serialize;

use crate::device::KernelMetrics;

/// Elements below which `add` and `multiply` stay on the host even when a
/// device is present.
pub const ELEMENTWISE_DEVICE_THRESHOLD: usize = 4096;

/// 128-bit content digest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ContentDigest(pub u128);

impl ContentDigest {
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }
}

impl fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// Outcome of a magnitude check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ValidationReport {
    /// `max_magnitude <= threshold`; false if any element is NaN.
    pub valid: bool,
    pub max_magnitude: f32,
    pub metrics: KernelMetrics,
}

/// Dimensions of `c[m×n] = a[m×k] · b[k×n]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatrixDims {
    pub m: usize,
    pub n: usize,
    pub k: usize,
}

/// Dimensions of a `batch × seq × hidden` pooling input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolingDims {
    pub batch: usize,
    pub seq: usize,
    pub hidden: usize,
}
