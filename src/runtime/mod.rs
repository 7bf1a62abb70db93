//! # Tensor Runtime
//!
//! [`TensorRuntime`] is the public entry point. It wires the device probe,
//! the buffer pool, the native compute context and the mode service together
//! and routes every call:
//!
//! 1. the mode service decides whether the operation's [`OperationType`]
//!    should be offloaded;
//! 2. offloaded calls run on the device path when a device exists, staging
//!    operands through pooled buffers that are returned on every exit path;
//! 3. `Gpu` mode without a device and without fallback fails with
//!    [`ComputeError::AcceleratorRequired`];
//! 4. everything else runs on the CPU path.
//!
//! A device error or an exhausted pool with fallback enabled is retried once
//! on the CPU. Every
//! successful call is timed and handed to the [`ResourceMonitor`].
//!
//! ```rust
//! use briny_compute::{ComputeOptions, TensorRuntime};
//!
//! let runtime = TensorRuntime::new(ComputeOptions::default()).unwrap();
//! let sim = runtime.cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]).unwrap();
//! assert!((sim - 1.0).abs() < 1e-6);
//! ```

pub mod batch;
pub mod monitor;

pub use batch::{CancellationToken, PoolingInput};
pub use monitor::{OperationMetrics, OperationRecord, OperationRecorder, ResourceMonitor, TracingRecorder};

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::backend::{ComputeMode, ExecutionPath, OffloadStrategy};
use crate::config::ComputeOptions;
use crate::error::{ComputeError, Result};
use crate::mode::{ComputeModeService, ComputeStatistics, OperationType};
use crate::ops::dispatch::{ComputeBackend, NativeComputeContext};
use crate::ops::{ContentDigest, MatrixDims, PoolingDims, ValidationReport};
use crate::pool::{MemoryPool, PoolConfig};
use crate::probe::{self, DeviceProbe};

const F32_BYTES: usize = core::mem::size_of::<f32>();

#[derive(Debug)]
pub struct TensorRuntime {
    options: ComputeOptions,
    probe: Arc<DeviceProbe>,
    pool: Arc<MemoryPool>,
    context: NativeComputeContext,
    modes: ComputeModeService,
    monitor: ResourceMonitor,
}

impl TensorRuntime {
    /// Builds a runtime over the process-wide device probe.
    pub fn new(options: ComputeOptions) -> Result<Self> {
        Self::with_probe(options, probe::global())
    }

    /// Builds a runtime over `probe`.
    ///
    /// Fails with [`ComputeError::Config`] for invalid options and with
    /// [`ComputeError::AcceleratorRequired`] when `Gpu` mode is requested
    /// without a device and without fallback.
    pub fn with_probe(options: ComputeOptions, probe: Arc<DeviceProbe>) -> Result<Self> {
        options.check()?;
        let modes = ComputeModeService::new(&options, probe.clone())?;

        let device = probe.available_accelerator();
        let device_memory = match &device {
            Some(_) => match probe.device_info(options.device_id) {
                Ok(info) => Some(info.total_memory),
                Err(e) => {
                    warn!(device_id = options.device_id, error = %e, "device info unavailable, pool budget unbounded");
                    None
                }
            },
            None => None,
        };

        let pool = Arc::new(MemoryPool::new(
            PoolConfig::from_options(&options, device_memory),
            device.clone(),
        ));
        let context = NativeComputeContext::new(pool.clone(), device, options.verify_device_results);
        let monitor = ResourceMonitor::new(probe.clone(), pool.clone(), options.device_id);

        info!(
            mode = ?modes.mode(),
            strategy = ?modes.strategy(),
            device = context.device_available(),
            max_buffers = pool.config().max_buffers,
            "tensor runtime ready"
        );
        Ok(Self {
            options,
            probe,
            pool,
            context,
            modes,
            monitor,
        })
    }

    pub fn options(&self) -> &ComputeOptions {
        &self.options
    }

    pub fn probe(&self) -> &Arc<DeviceProbe> {
        &self.probe
    }

    pub fn pool(&self) -> &Arc<MemoryPool> {
        &self.pool
    }

    pub fn context(&self) -> &NativeComputeContext {
        &self.context
    }

    pub fn modes(&self) -> &ComputeModeService {
        &self.modes
    }

    pub fn monitor(&self) -> &ResourceMonitor {
        &self.monitor
    }

    pub fn statistics(&self) -> ComputeStatistics {
        self.modes.statistics()
    }

    pub fn set_mode(&self, mode: ComputeMode) -> bool {
        self.modes.set_mode(mode)
    }

    pub fn set_strategy(&self, strategy: OffloadStrategy) {
        self.modes.set_strategy(strategy)
    }

    /// Picks the execution path for one `op`, counting where it runs.
    pub fn route(&self, op: OperationType) -> Result<ExecutionPath> {
        let device = self.context.device_available();
        if !device && self.modes.mode() == ComputeMode::Gpu && !self.modes.fallback_enabled() {
            return Err(ComputeError::AcceleratorRequired);
        }
        Ok(if self.modes.place(op, device) {
            ExecutionPath::Device
        } else {
            ExecutionPath::Cpu
        })
    }

    /// Runs `f` on the backend for `path`, retrying once on the CPU if the
    /// device path fails or cannot get pool buffers and fallback is enabled.
    fn execute<T, F>(&self, op: OperationType, path: ExecutionPath, mut f: F) -> Result<T>
    where
        F: FnMut(&dyn ComputeBackend) -> Result<T>,
    {
        match f(self.context.backend_for(path)?) {
            Err(e @ (ComputeError::Device(_) | ComputeError::PoolExhausted { .. }))
                if path == ExecutionPath::Device && self.modes.fallback_enabled() =>
            {
                warn!(operation = %op, error = %e, "device path failed, retrying on cpu");
                f(self.context.cpu())
            }
            other => other,
        }
    }

    fn run<T, F>(&self, op: OperationType, bytes: usize, f: F) -> Result<T>
    where
        F: FnMut(&dyn ComputeBackend) -> Result<T>,
    {
        let path = self.route(op)?;
        let start = Instant::now();
        let out = self.execute(op, path, f)?;
        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        debug!(operation = %op, ?path, elapsed_ms = elapsed, "operation complete");
        self.monitor.record_operation(op, elapsed, bytes);
        Ok(out)
    }

    pub fn dot(&self, x: &[f32], y: &[f32]) -> Result<f32> {
        self.run(OperationType::VectorSearch, (x.len() + y.len()) * F32_BYTES, |b| b.dot(x, y))
    }

    pub fn norm(&self, x: &[f32]) -> Result<f32> {
        self.run(OperationType::VectorSearch, x.len() * F32_BYTES, |b| b.norm(x))
    }

    /// Cosine similarity; `0.0` when either vector has zero norm.
    pub fn cosine_similarity(&self, x: &[f32], y: &[f32]) -> Result<f32> {
        self.run(OperationType::VectorSearch, (x.len() + y.len()) * F32_BYTES, |b| {
            b.cosine_similarity(x, y)
        })
    }

    pub fn softmax(&self, x: &[f32], out: &mut [f32]) -> Result<()> {
        self.run(OperationType::ModelInference, x.len() * F32_BYTES, |b| b.softmax(x, out))
    }

    /// Row-wise softmax over a `rows × cols` matrix.
    pub fn softmax_rows(&self, x: &[f32], out: &mut [f32], rows: usize, cols: usize) -> Result<()> {
        self.run(OperationType::ModelInference, x.len() * F32_BYTES, |b| {
            b.softmax_rows(x, out, rows, cols)
        })
    }

    pub fn relu(&self, x: &[f32], out: &mut [f32]) -> Result<()> {
        self.run(OperationType::ModelInference, x.len() * F32_BYTES, |b| b.relu(x, out))
    }

    pub fn add(&self, x: &[f32], y: &[f32], out: &mut [f32]) -> Result<()> {
        self.run(OperationType::ModelInference, (x.len() + y.len()) * F32_BYTES, |b| {
            b.add(x, y, out)
        })
    }

    pub fn multiply(&self, x: &[f32], y: &[f32], out: &mut [f32]) -> Result<()> {
        self.run(OperationType::ModelInference, (x.len() + y.len()) * F32_BYTES, |b| {
            b.multiply(x, y, out)
        })
    }

    /// `c = a · b` for row-major `a[m×k]` and `b[k×n]`.
    pub fn matrix_multiply(&self, a: &[f32], b: &[f32], c: &mut [f32], dims: MatrixDims) -> Result<()> {
        self.run(OperationType::MatrixMultiply, (a.len() + b.len()) * F32_BYTES, |be| {
            be.matmul(a, b, c, dims)
        })
    }

    /// Masked mean over the sequence axis. All-masked rows pool to zero.
    pub fn mean_pooling(&self, input: &[f32], mask: &[i64], out: &mut [f32], dims: PoolingDims) -> Result<()> {
        let bytes = input.len() * F32_BYTES + mask.len() * core::mem::size_of::<i64>();
        self.run(OperationType::Pooling, bytes, |b| b.mean_pooling(input, mask, out, dims))
    }

    /// Checks that no element's magnitude exceeds `threshold`.
    pub fn validate_content(&self, data: &[f32], threshold: f32) -> Result<ValidationReport> {
        self.run(OperationType::ContentValidation, data.len() * F32_BYTES, |b| {
            b.validate_content(data, threshold)
        })
    }

    pub fn hash_content(&self, bytes: &[u8]) -> Result<ContentDigest> {
        self.run(OperationType::ContentHashing, bytes.len(), |b| Ok(b.hash_content(bytes)))
    }
}
