//! Execution path selection.
//!
//! [`ComputeBackend`] is the strategy interface every execution path
//! implements. Two variants exist:
//!
//! - [`CpuBackend`] runs [`super::cpu`] kernels over the caller's slices.
//! - [`DeviceBackend`] stages operands into pooled buffers, launches an
//!   [`Accelerator`] kernel and copies the result back. Every staging buffer is
//!   held in a [`crate::pool::BufferScope`], so it is returned on every exit.
//!
//! [`NativeComputeContext`] owns both and hands out the one that is usable,
//! so call sites never branch on device presence themselves.
//!
//! # Example
//! ```rust
//! use std::sync::Arc;
//! use briny_compute::ops::dispatch::NativeComputeContext;
//! use briny_compute::pool::{MemoryPool, PoolConfig};
//!
//! let pool = Arc::new(MemoryPool::new(PoolConfig::default(), None));
//! let ctx = NativeComputeContext::new(pool, None, false);
//! assert!(!ctx.device_available());
//! assert_eq!(ctx.dot(&[1.0, 2.0], &[3.0, 4.0]).unwrap(), 11.0);
//! ```

use core::fmt;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use super::{ContentDigest, ELEMENTWISE_DEVICE_THRESHOLD, MatrixDims, PoolingDims, ValidationReport, cpu};
use crate::approx;
use crate::backend::ExecutionPath;
use crate::device::{Accelerator, DeviceRegion, Kernel, KernelMetrics};
use crate::error::{ComputeError, Result, ensure_len, ensure_shape};
use crate::pool::{BufferScope, MemoryPool};

/// One execution path for the primitive catalog.
pub trait ComputeBackend: Send + Sync + fmt::Debug {
    /// Where this backend runs.
    fn path(&self) -> ExecutionPath;

    fn dot(&self, x: &[f32], y: &[f32]) -> Result<f32>;

    fn norm(&self, x: &[f32]) -> Result<f32>;

    /// Zero when either vector has zero norm.
    fn cosine_similarity(&self, x: &[f32], y: &[f32]) -> Result<f32>;

    /// Softmax of a single row.
    fn softmax(&self, x: &[f32], out: &mut [f32]) -> Result<()> {
        self.softmax_rows(x, out, 1, x.len())
    }

    /// Row-wise softmax over a `rows × cols` matrix.
    fn softmax_rows(&self, x: &[f32], out: &mut [f32], rows: usize, cols: usize) -> Result<()>;

    fn relu(&self, x: &[f32], out: &mut [f32]) -> Result<()>;

    fn add(&self, x: &[f32], y: &[f32], out: &mut [f32]) -> Result<()>;

    fn multiply(&self, x: &[f32], y: &[f32], out: &mut [f32]) -> Result<()>;

    fn matmul(&self, a: &[f32], b: &[f32], c: &mut [f32], dims: MatrixDims) -> Result<()>;

    /// Masked mean over the sequence axis; all-masked rows yield zeros.
    fn mean_pooling(&self, input: &[f32], mask: &[i64], out: &mut [f32], dims: PoolingDims) -> Result<()>;

    /// Valid iff every magnitude is at most `threshold`.
    fn validate_content(&self, data: &[f32], threshold: f32) -> Result<ValidationReport>;

    /// Deterministic 128-bit digest, identical on every path.
    fn hash_content(&self, bytes: &[u8]) -> ContentDigest {
        cpu::hash_content(bytes)
    }
}

/// Host execution path.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpuBackend;

impl ComputeBackend for CpuBackend {
    fn path(&self) -> ExecutionPath {
        ExecutionPath::Cpu
    }

    fn dot(&self, x: &[f32], y: &[f32]) -> Result<f32> {
        cpu::dot(x, y)
    }

    fn norm(&self, x: &[f32]) -> Result<f32> {
        Ok(cpu::norm(x))
    }

    fn cosine_similarity(&self, x: &[f32], y: &[f32]) -> Result<f32> {
        cpu::cosine_similarity(x, y)
    }

    fn softmax(&self, x: &[f32], out: &mut [f32]) -> Result<()> {
        cpu::softmax(x, out)
    }

    fn softmax_rows(&self, x: &[f32], out: &mut [f32], rows: usize, cols: usize) -> Result<()> {
        cpu::softmax_rows(x, out, rows, cols)
    }

    fn relu(&self, x: &[f32], out: &mut [f32]) -> Result<()> {
        cpu::relu(x, out)
    }

    fn add(&self, x: &[f32], y: &[f32], out: &mut [f32]) -> Result<()> {
        cpu::add(x, y, out)
    }

    fn multiply(&self, x: &[f32], y: &[f32], out: &mut [f32]) -> Result<()> {
        cpu::multiply(x, y, out)
    }

    fn matmul(&self, a: &[f32], b: &[f32], c: &mut [f32], dims: MatrixDims) -> Result<()> {
        cpu::matmul(a, b, c, dims)
    }

    fn mean_pooling(&self, input: &[f32], mask: &[i64], out: &mut [f32], dims: PoolingDims) -> Result<()> {
        cpu::mean_pooling(input, mask, out, dims)
    }

    fn validate_content(&self, data: &[f32], threshold: f32) -> Result<ValidationReport> {
        Ok(cpu::validate_content(data, threshold))
    }
}

/// Accelerator execution path over pooled staging buffers.
///
/// Every operand and the result buffer are rented in one all-or-nothing pool
/// call. If the pool cannot hold them all, or could only hand out
/// host-resident buffers (device full or allocation refused), the call is
/// computed on the host instead.
#[derive(Debug)]
pub struct DeviceBackend {
    device: Arc<dyn Accelerator>,
    pool: Arc<MemoryPool>,
    verify: bool,
}

const F32_BYTES: usize = core::mem::size_of::<f32>();

/// Operands uploaded to the device plus the buffer the kernel writes.
struct Staged<'p, const N: usize> {
    inputs: [DeviceRegion; N],
    out: DeviceRegion,
    output: BufferScope<'p>,
    _held: Vec<BufferScope<'p>>,
}

impl<const N: usize> Staged<'_, N> {
    /// Downloads the first `len` result elements.
    fn result(&mut self, len: usize) -> Result<&[f32]> {
        self.output.download()?;
        self.output
            .get(..len)
            .ok_or(ComputeError::ShapeMismatch {
                expected: len,
                actual: self.output.len(),
            })
    }
}

impl DeviceBackend {
    /// `pool` must have been built over the same `device`.
    pub fn new(device: Arc<dyn Accelerator>, pool: Arc<MemoryPool>, verify: bool) -> Self {
        Self { device, pool, verify }
    }

    pub fn accelerator(&self) -> &Arc<dyn Accelerator> {
        &self.device
    }

    fn launch(&self, kernel: &Kernel) -> Result<KernelMetrics> {
        let metrics = self.device.launch(kernel)?;
        trace!(
            kernel = kernel.name(),
            backend = self.device.name(),
            compute_time_ms = metrics.compute_time_ms,
            "kernel finished"
        );
        Ok(metrics)
    }

    /// Uploads `inputs` and reserves `out_len` result elements.
    ///
    /// `None` means the call runs on the host.
    fn stage<const N: usize>(
        &self,
        op: &'static str,
        inputs: [&[f32]; N],
        out_len: usize,
    ) -> Result<Option<Staged<'_, N>>> {
        let mut sizes: Vec<usize> = inputs.iter().map(|x| x.len().max(1) * F32_BYTES).collect();
        sizes.push(out_len.max(1) * F32_BYTES);
        let mut held = match self.pool.scoped_many(&sizes) {
            Ok(scopes) => scopes,
            Err(ComputeError::PoolExhausted { max_buffers }) => {
                debug!(op, needed = sizes.len(), max_buffers, "pool cannot stage every operand, computing on the host");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let Some(output) = held.pop() else {
            return Ok(None);
        };
        let Some(out) = output.region()? else {
            debug!(op, "staging buffers are host resident, computing on the host");
            return Ok(None);
        };

        let mut regions = [out; N];
        for ((slot, scope), data) in regions.iter_mut().zip(held.iter_mut()).zip(inputs) {
            let Some(region) = scope.region()? else {
                debug!(op, "staging buffers are host resident, computing on the host");
                return Ok(None);
            };
            scope[..data.len()].copy_from_slice(data);
            scope.upload()?;
            *slot = region;
        }
        Ok(Some(Staged {
            inputs: regions,
            out,
            output,
            _held: held,
        }))
    }

    /// Cross-checks a device result against the host path. Debug builds only.
    fn verify<F>(&self, op: &'static str, device: &[f32], host: F)
    where
        F: FnOnce() -> Result<Vec<f32>>,
    {
        if !self.verify || !cfg!(debug_assertions) {
            return;
        }
        match host() {
            Ok(reference) if approx::approx_eq(device, &reference[..]) => {
                trace!(op, "device result verified");
            }
            Ok(_) => warn!(op, backend = self.device.name(), "device result differs from host path"),
            Err(e) => debug!(op, error = %e, "host reference failed, skipping verification"),
        }
    }

    fn elementwise(
        &self,
        op: &'static str,
        x: &[f32],
        y: &[f32],
        out: &mut [f32],
        kernel: fn(DeviceRegion, DeviceRegion, DeviceRegion, usize) -> Kernel,
        host: fn(&[f32], &[f32], &mut [f32]) -> Result<()>,
    ) -> Result<()> {
        ensure_len(x.len(), y.len())?;
        ensure_len(x.len(), out.len())?;
        if x.len() < ELEMENTWISE_DEVICE_THRESHOLD {
            return host(x, y, out);
        }
        let Some(mut staged) = self.stage(op, [x, y], out.len())? else {
            return host(x, y, out);
        };
        let [rx, ry] = staged.inputs;
        self.launch(&kernel(rx, ry, staged.out, x.len()))?;
        out.copy_from_slice(staged.result(out.len())?);
        self.verify(op, out, || {
            let mut reference = vec![0.0; x.len()];
            host(x, y, &mut reference).map(|_| reference)
        });
        Ok(())
    }
}

impl ComputeBackend for DeviceBackend {
    fn path(&self) -> ExecutionPath {
        ExecutionPath::Device
    }

    fn dot(&self, x: &[f32], y: &[f32]) -> Result<f32> {
        ensure_len(x.len(), y.len())?;
        let Some(mut staged) = self.stage("dot", [x, y], 1)? else {
            return cpu::dot(x, y);
        };
        let [rx, ry] = staged.inputs;
        self.launch(&Kernel::Dot { x: rx, y: ry, out: staged.out, len: x.len() })?;
        let result = staged.result(1)?[0];
        self.verify("dot", &[result], || cpu::dot(x, y).map(|v| vec![v]));
        Ok(result)
    }

    fn norm(&self, x: &[f32]) -> Result<f32> {
        let Some(mut staged) = self.stage("norm", [x], 1)? else {
            return Ok(cpu::norm(x));
        };
        let [rx] = staged.inputs;
        self.launch(&Kernel::Dot { x: rx, y: rx, out: staged.out, len: x.len() })?;
        let result = staged.result(1)?[0].sqrt();
        self.verify("norm", &[result], || Ok(vec![cpu::norm(x)]));
        Ok(result)
    }

    fn cosine_similarity(&self, x: &[f32], y: &[f32]) -> Result<f32> {
        ensure_len(x.len(), y.len())?;
        let Some(mut staged) = self.stage("cosine_similarity", [x, y], 3)? else {
            return cpu::cosine_similarity(x, y);
        };
        let [rx, ry] = staged.inputs;
        self.launch(&Kernel::CosineParts { x: rx, y: ry, out: staged.out, len: x.len() })?;
        let &[xy, xx, yy] = staged.result(3)? else {
            return cpu::cosine_similarity(x, y);
        };
        let result = cpu::cosine_from_parts(xy, xx, yy);
        self.verify("cosine_similarity", &[result], || {
            cpu::cosine_similarity(x, y).map(|v| vec![v])
        });
        Ok(result)
    }

    fn softmax_rows(&self, x: &[f32], out: &mut [f32], rows: usize, cols: usize) -> Result<()> {
        ensure_shape(&[rows, cols], x.len())?;
        ensure_len(x.len(), out.len())?;
        let Some(mut staged) = self.stage("softmax", [x], out.len())? else {
            return cpu::softmax_rows(x, out, rows, cols);
        };
        let [rx] = staged.inputs;
        self.launch(&Kernel::Softmax { input: rx, output: staged.out, rows, cols })?;
        out.copy_from_slice(staged.result(out.len())?);
        self.verify("softmax", out, || {
            let mut host = vec![0.0; x.len()];
            cpu::softmax_rows(x, &mut host, rows, cols).map(|_| host)
        });
        Ok(())
    }

    fn relu(&self, x: &[f32], out: &mut [f32]) -> Result<()> {
        ensure_len(x.len(), out.len())?;
        let Some(mut staged) = self.stage("relu", [x], out.len())? else {
            return cpu::relu(x, out);
        };
        let [rx] = staged.inputs;
        self.launch(&Kernel::Relu { input: rx, output: staged.out, len: x.len() })?;
        out.copy_from_slice(staged.result(out.len())?);
        Ok(())
    }

    fn add(&self, x: &[f32], y: &[f32], out: &mut [f32]) -> Result<()> {
        self.elementwise(
            "add",
            x,
            y,
            out,
            |x, y, out, len| Kernel::Add { x, y, out, len },
            cpu::add,
        )
    }

    fn multiply(&self, x: &[f32], y: &[f32], out: &mut [f32]) -> Result<()> {
        self.elementwise(
            "multiply",
            x,
            y,
            out,
            |x, y, out, len| Kernel::Multiply { x, y, out, len },
            cpu::multiply,
        )
    }

    fn matmul(&self, a: &[f32], b: &[f32], c: &mut [f32], dims: MatrixDims) -> Result<()> {
        let MatrixDims { m, n, k } = dims;
        ensure_shape(&[m, k], a.len())?;
        ensure_shape(&[k, n], b.len())?;
        ensure_shape(&[m, n], c.len())?;
        let Some(mut staged) = self.stage("matmul", [a, b], c.len())? else {
            return cpu::matmul(a, b, c, dims);
        };
        let [ra, rb] = staged.inputs;
        self.launch(&Kernel::MatMul { a: ra, b: rb, c: staged.out, m, n, k })?;
        c.copy_from_slice(staged.result(c.len())?);
        self.verify("matmul", c, || {
            let mut host = vec![0.0; m * n];
            cpu::matmul(a, b, &mut host, dims).map(|_| host)
        });
        Ok(())
    }

    fn mean_pooling(&self, input: &[f32], mask: &[i64], out: &mut [f32], dims: PoolingDims) -> Result<()> {
        let PoolingDims { batch, seq, hidden } = dims;
        ensure_shape(&[batch, seq, hidden], input.len())?;
        ensure_shape(&[batch, seq], mask.len())?;
        ensure_shape(&[batch, hidden], out.len())?;
        let staged_mask: Vec<f32> = mask.iter().map(|&m| if m != 0 { 1.0 } else { 0.0 }).collect();
        let Some(mut staged) = self.stage("mean_pooling", [input, staged_mask.as_slice()], out.len())? else {
            return cpu::mean_pooling(input, mask, out, dims);
        };
        let [ri, rm] = staged.inputs;
        self.launch(&Kernel::MeanPooling { input: ri, mask: rm, output: staged.out, batch, seq, hidden })?;
        out.copy_from_slice(staged.result(out.len())?);
        self.verify("mean_pooling", out, || {
            let mut host = vec![0.0; batch * hidden];
            cpu::mean_pooling(input, mask, &mut host, dims).map(|_| host)
        });
        Ok(())
    }

    fn validate_content(&self, data: &[f32], threshold: f32) -> Result<ValidationReport> {
        let Some(mut staged) = self.stage("validate_content", [data], 1)? else {
            return Ok(cpu::validate_content(data, threshold));
        };
        let [rx] = staged.inputs;
        let metrics = self.launch(&Kernel::MaxAbs { x: rx, out: staged.out, len: data.len() })?;
        let max_magnitude = staged.result(1)?[0];
        Ok(ValidationReport {
            valid: max_magnitude <= threshold,
            max_magnitude,
            metrics,
        })
    }
}

/// Owns the host path and, when a device is present, the device path.
#[derive(Debug)]
pub struct NativeComputeContext {
    cpu: CpuBackend,
    device: Option<DeviceBackend>,
}

impl NativeComputeContext {
    /// Builds a context over `device`, staging through `pool`.
    ///
    /// Pass `None` for hosts without an accelerator; every call then runs on
    /// the CPU.
    pub fn new(pool: Arc<MemoryPool>, device: Option<Arc<dyn Accelerator>>, verify: bool) -> Self {
        let device = device.map(|device| DeviceBackend::new(device, pool, verify));
        debug!(device = device.is_some(), verify, "native compute context ready");
        Self {
            cpu: CpuBackend,
            device,
        }
    }

    /// Host-only context.
    pub fn cpu_only() -> Self {
        Self {
            cpu: CpuBackend,
            device: None,
        }
    }

    pub fn device_available(&self) -> bool {
        self.device.is_some()
    }

    /// The device path if present, otherwise the host path.
    pub fn backend(&self) -> &dyn ComputeBackend {
        match &self.device {
            Some(device) => device,
            None => &self.cpu,
        }
    }

    /// The backend for `path`, failing if the device path was requested but
    /// no device exists.
    pub fn backend_for(&self, path: ExecutionPath) -> Result<&dyn ComputeBackend> {
        match (path, &self.device) {
            (ExecutionPath::Cpu, _) => Ok(&self.cpu),
            (ExecutionPath::Device, Some(device)) => Ok(device),
            (ExecutionPath::Device, None) => Err(ComputeError::AcceleratorRequired),
        }
    }

    pub fn cpu(&self) -> &dyn ComputeBackend {
        &self.cpu
    }

    pub fn dot(&self, x: &[f32], y: &[f32]) -> Result<f32> {
        self.backend().dot(x, y)
    }

    pub fn norm(&self, x: &[f32]) -> Result<f32> {
        self.backend().norm(x)
    }

    pub fn cosine_similarity(&self, x: &[f32], y: &[f32]) -> Result<f32> {
        self.backend().cosine_similarity(x, y)
    }

    pub fn softmax(&self, x: &[f32], out: &mut [f32]) -> Result<()> {
        self.backend().softmax(x, out)
    }

    pub fn relu(&self, x: &[f32], out: &mut [f32]) -> Result<()> {
        self.backend().relu(x, out)
    }

    pub fn add(&self, x: &[f32], y: &[f32], out: &mut [f32]) -> Result<()> {
        self.backend().add(x, y, out)
    }

    pub fn multiply(&self, x: &[f32], y: &[f32], out: &mut [f32]) -> Result<()> {
        self.backend().multiply(x, y, out)
    }

    pub fn matmul(&self, a: &[f32], b: &[f32], c: &mut [f32], dims: MatrixDims) -> Result<()> {
        self.backend().matmul(a, b, c, dims)
    }

    pub fn mean_pooling(&self, input: &[f32], mask: &[i64], out: &mut [f32], dims: PoolingDims) -> Result<()> {
        self.backend().mean_pooling(input, mask, out, dims)
    }

    pub fn validate_content(&self, data: &[f32], threshold: f32) -> Result<ValidationReport> {
        self.backend().validate_content(data, threshold)
    }

    pub fn hash_content(&self, bytes: &[u8]) -> ContentDigest {
        self.backend().hash_content(bytes)
    }
}
