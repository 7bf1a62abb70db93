//! Host-side accelerator contract.
//!
//! Every device backend implements [`Accelerator`]: a device query, a small
//! region allocator, host↔device copies and a fixed kernel catalog
//! ([`Kernel`]). Regions are opaque [`DeviceRegion`] handles; the backend maps
//! them to its native resources and the [`crate::pool::MemoryPool`] is the
//! only code that allocates or frees them.
//!
//! ## Implementations
//!
//! - [`reference::ReferenceAccelerator`]: host-emulated device with scalar
//!   kernels, always available.
//! - `ops::wgpu::WgpuAccelerator` *(feature `wgpu`)*: WGSL compute shaders.

pub mod reference;

use core::fmt;

use serde::Serialize;

use crate::error::Result;

/// Opaque handle to a device-resident `f32` region.
///
/// Handles are plain values; whether the region is still alive is tracked by
/// the owning pool's arena, not by the handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceRegion {
    id: u64,
    len: usize,
}

impl DeviceRegion {
    /// Creates a handle. Only accelerator implementations should call this.
    pub fn new(id: u64, len: usize) -> Self {
        Self { id, len }
    }

    /// Backend-specific identifier.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Capacity in `f32` elements.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity in bytes.
    pub fn size_bytes(&self) -> usize {
        self.len * core::mem::size_of::<f32>()
    }
}

/// Point-in-time description of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComputeDeviceInfo {
    pub device_id: u32,
    pub name: String,
    pub total_memory: u64,
    pub free_memory: u64,
    pub compute_capability_major: u32,
    pub compute_capability_minor: u32,
    pub multiprocessor_count: u32,
    pub max_threads_per_block: u32,
}

impl ComputeDeviceInfo {
    /// Bytes in use on the device.
    pub fn used_memory(&self) -> u64 {
        self.total_memory.saturating_sub(self.free_memory)
    }
}

/// Timing and memory figures reported by a kernel launch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct KernelMetrics {
    pub compute_time_ms: f32,
    pub memory_usage_mb: f32,
    pub active_kernels: u32,
}

impl KernelMetrics {
    /// Metrics for work done on the host: no device time, memory derived from
    /// the bytes touched.
    pub fn host(bytes: usize) -> Self {
        Self {
            compute_time_ms: 0.0,
            memory_usage_mb: bytes as f32 / (1024.0 * 1024.0),
            active_kernels: 0,
        }
    }
}

/// The kernel catalog every accelerator must execute.
///
/// All operands are row-major `f32` regions; lengths are in elements. The
/// attention mask is staged as `f32` where any non-zero value marks a valid
/// position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Kernel {
    /// `out[0] = Σ x[i]·y[i]`
    Dot { x: DeviceRegion, y: DeviceRegion, out: DeviceRegion, len: usize },
    /// `out[0..3] = [Σ x·y, Σ x·x, Σ y·y]`
    CosineParts { x: DeviceRegion, y: DeviceRegion, out: DeviceRegion, len: usize },
    /// `out[0] = max |x[i]|`
    MaxAbs { x: DeviceRegion, out: DeviceRegion, len: usize },
    /// Row-wise numerically stable softmax over a `rows × cols` matrix.
    Softmax { input: DeviceRegion, output: DeviceRegion, rows: usize, cols: usize },
    /// `output[i] = max(0, input[i])`
    Relu { input: DeviceRegion, output: DeviceRegion, len: usize },
    /// `out[i] = x[i] + y[i]`
    Add { x: DeviceRegion, y: DeviceRegion, out: DeviceRegion, len: usize },
    /// `out[i] = x[i] · y[i]`
    Multiply { x: DeviceRegion, y: DeviceRegion, out: DeviceRegion, len: usize },
    /// `c[m×n] = a[m×k] · b[k×n]`
    MatMul { a: DeviceRegion, b: DeviceRegion, c: DeviceRegion, m: usize, n: usize, k: usize },
    /// Masked mean over the sequence axis of a `batch × seq × hidden` tensor.
    MeanPooling {
        input: DeviceRegion,
        mask: DeviceRegion,
        output: DeviceRegion,
        batch: usize,
        seq: usize,
        hidden: usize,
    },
}

impl Kernel {
    /// Short kernel name, used in logs and labels.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dot { .. } => "dot",
            Self::CosineParts { .. } => "cosine_parts",
            Self::MaxAbs { .. } => "max_abs",
            Self::Softmax { .. } => "softmax",
            Self::Relu { .. } => "relu",
            Self::Add { .. } => "add",
            Self::Multiply { .. } => "multiply",
            Self::MatMul { .. } => "matmul",
            Self::MeanPooling { .. } => "mean_pooling",
        }
    }
}

/// Host-side contract of a compute device.
///
/// Implementations must be safe to call from several threads; kernel launches
/// from one caller are issued sequentially.
pub trait Accelerator: Send + Sync + fmt::Debug {
    /// Backend name for logs.
    fn name(&self) -> &str;

    /// Number of usable devices.
    fn device_count(&self) -> Result<usize>;

    /// Fresh description of `device_id`.
    fn device_info(&self, device_id: u32) -> Result<ComputeDeviceInfo>;

    /// Allocates a zeroed region of `len` `f32` elements.
    fn allocate(&self, len: usize) -> Result<DeviceRegion>;

    /// Releases a region. Unknown handles are ignored.
    fn free(&self, region: DeviceRegion);

    /// Copies `data` into the start of `region`.
    fn upload(&self, region: DeviceRegion, data: &[f32]) -> Result<()>;

    /// Copies the first `out.len()` elements of `region` into `out`.
    fn download(&self, region: DeviceRegion, out: &mut [f32]) -> Result<()>;

    /// Zero-fills `region`.
    fn zero(&self, region: DeviceRegion) -> Result<()>;

    /// Runs one kernel to completion.
    fn launch(&self, kernel: &Kernel) -> Result<KernelMetrics>;
}
