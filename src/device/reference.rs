//! Host-emulated accelerator.
//!
//! [`ReferenceAccelerator`] keeps every "device" region in host memory and
//! runs the kernel catalog with plain scalar loops and `f64` accumulators. It
//! is deliberately independent of the SIMD code in [`crate::ops::cpu`], so
//! comparing the two paths actually checks something.
//!
//! Failure knobs (`failing_queries`, `set_fail_allocations`,
//! `set_fail_launches`) let callers
//! exercise the probe and pool degradation paths without real hardware, and
//! [`ReferenceAccelerator::set_launch_hook`] observes each finished kernel.

use core::fmt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use super::{Accelerator, ComputeDeviceInfo, DeviceRegion, Kernel, KernelMetrics};
use crate::error::{ComputeError, Result};

const DEFAULT_TOTAL_MEMORY: u64 = 8 * 1024 * 1024 * 1024;

type HookFn = dyn Fn(&Kernel, u64) + Send + Sync;

/// Callback run after every successful launch.
#[derive(Clone)]
struct LaunchHook(Arc<HookFn>);

impl fmt::Debug for LaunchHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LaunchHook")
    }
}

/// Scalar host implementation of the [`Accelerator`] contract.
#[derive(Debug)]
pub struct ReferenceAccelerator {
    devices: usize,
    total_memory: u64,
    fail_queries: bool,
    fail_allocations: AtomicBool,
    fail_launches: AtomicBool,
    next_region: AtomicU64,
    launches: AtomicU64,
    launch_hook: Mutex<Option<LaunchHook>>,
    regions: Mutex<HashMap<u64, Vec<f32>>>,
}

impl Default for ReferenceAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceAccelerator {
    /// One device with 8 GiB of emulated memory.
    pub fn new() -> Self {
        Self {
            devices: 1,
            total_memory: DEFAULT_TOTAL_MEMORY,
            fail_queries: false,
            fail_allocations: AtomicBool::new(false),
            fail_launches: AtomicBool::new(false),
            next_region: AtomicU64::new(1),
            launches: AtomicU64::new(0),
            launch_hook: Mutex::new(None),
            regions: Mutex::new(HashMap::new()),
        }
    }

    /// Reports `devices` devices. Zero models a host with no accelerator.
    pub fn with_devices(mut self, devices: usize) -> Self {
        self.devices = devices;
        self
    }

    /// Caps emulated memory; allocations beyond it fail.
    pub fn with_total_memory(mut self, bytes: u64) -> Self {
        self.total_memory = bytes;
        self
    }

    /// Makes every device query fail, like a missing driver.
    pub fn failing_queries(mut self) -> Self {
        self.fail_queries = true;
        self
    }

    /// Makes subsequent allocations fail (or succeed again).
    pub fn set_fail_allocations(&self, fail: bool) {
        self.fail_allocations.store(fail, Ordering::Release);
    }

    /// Makes subsequent kernel launches fail.
    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::Release);
    }

    /// Number of regions currently allocated.
    pub fn live_regions(&self) -> usize {
        self.regions.lock().len()
    }

    /// Number of kernels launched so far.
    /// Runs `hook` with the kernel and the running launch count after every
    /// successful launch.
    pub fn set_launch_hook<F>(&self, hook: F)
    where
        F: Fn(&Kernel, u64) + Send + Sync + 'static,
    {
        *self.launch_hook.lock() = Some(LaunchHook(Arc::new(hook)));
    }

    pub fn launches(&self) -> u64 {
        self.launches.load(Ordering::Relaxed)
    }

    fn used_bytes(regions: &HashMap<u64, Vec<f32>>) -> u64 {
        regions.values().map(|r| (r.len() * 4) as u64).sum()
    }

    fn read(&self, region: DeviceRegion, len: usize) -> Result<Vec<f32>> {
        let regions = self.regions.lock();
        let data = regions
            .get(&region.id())
            .ok_or_else(|| ComputeError::Device(format!("unknown region {}", region.id())))?;
        if len > data.len() {
            return Err(ComputeError::ShapeMismatch { expected: data.len(), actual: len });
        }
        Ok(data[..len].to_vec())
    }

    fn write(&self, region: DeviceRegion, values: &[f32]) -> Result<()> {
        let mut regions = self.regions.lock();
        let data = regions
            .get_mut(&region.id())
            .ok_or_else(|| ComputeError::Device(format!("unknown region {}", region.id())))?;
        if values.len() > data.len() {
            return Err(ComputeError::ShapeMismatch { expected: data.len(), actual: values.len() });
        }
        data[..values.len()].copy_from_slice(values);
        Ok(())
    }

    fn run(&self, kernel: &Kernel) -> Result<()> {
        match *kernel {
            Kernel::Dot { x, y, out, len } => {
                let (x, y) = (self.read(x, len)?, self.read(y, len)?);
                let dot: f64 = x.iter().zip(&y).map(|(&a, &b)| a as f64 * b as f64).sum();
                self.write(out, &[dot as f32])
            }
            Kernel::CosineParts { x, y, out, len } => {
                let (x, y) = (self.read(x, len)?, self.read(y, len)?);
                let (mut xy, mut xx, mut yy) = (0.0f64, 0.0f64, 0.0f64);
                for (&a, &b) in x.iter().zip(&y) {
                    let (a, b) = (a as f64, b as f64);
                    xy += a * b;
                    xx += a * a;
                    yy += b * b;
                }
                self.write(out, &[xy as f32, xx as f32, yy as f32])
            }
            Kernel::MaxAbs { x, out, len } => {
                let x = self.read(x, len)?;
                let mut max = 0.0f32;
                for v in x {
                    if v.is_nan() {
                        max = f32::NAN;
                        break;
                    }
                    max = max.max(v.abs());
                }
                self.write(out, &[max])
            }
            Kernel::Softmax { input, output, rows, cols } => {
                let input = self.read(input, rows * cols)?;
                let mut result = vec![0.0f32; rows * cols];
                for r in 0..rows {
                    let row = &input[r * cols..(r + 1) * cols];
                    let max = row.iter().fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                    let sum: f64 = row.iter().map(|&v| ((v - max) as f64).exp()).sum();
                    for c in 0..cols {
                        result[r * cols + c] = (((row[c] - max) as f64).exp() / sum) as f32;
                    }
                }
                self.write(output, &result)
            }
            Kernel::Relu { input, output, len } => {
                let input = self.read(input, len)?;
                let result: Vec<f32> = input.iter().map(|&v| if v > 0.0 { v } else { 0.0 }).collect();
                self.write(output, &result)
            }
            Kernel::Add { x, y, out, len } => {
                let (x, y) = (self.read(x, len)?, self.read(y, len)?);
                let result: Vec<f32> = x.iter().zip(&y).map(|(a, b)| a + b).collect();
                self.write(out, &result)
            }
            Kernel::Multiply { x, y, out, len } => {
                let (x, y) = (self.read(x, len)?, self.read(y, len)?);
                let result: Vec<f32> = x.iter().zip(&y).map(|(a, b)| a * b).collect();
                self.write(out, &result)
            }
            Kernel::MatMul { a, b, c, m, n, k } => {
                let (a, b) = (self.read(a, m * k)?, self.read(b, k * n)?);
                let mut result = vec![0.0f32; m * n];
                for row in 0..m {
                    for col in 0..n {
                        let mut sum = 0.0f64;
                        for i in 0..k {
                            sum += a[row * k + i] as f64 * b[i * n + col] as f64;
                        }
                        result[row * n + col] = sum as f32;
                    }
                }
                self.write(c, &result)
            }
            Kernel::MeanPooling { input, mask, output, batch, seq, hidden } => {
                let input = self.read(input, batch * seq * hidden)?;
                let mask = self.read(mask, batch * seq)?;
                let mut result = vec![0.0f32; batch * hidden];
                for b in 0..batch {
                    for h in 0..hidden {
                        let mut sum = 0.0f64;
                        let mut count = 0usize;
                        for s in 0..seq {
                            if mask[b * seq + s] != 0.0 {
                                sum += input[(b * seq + s) * hidden + h] as f64;
                                count += 1;
                            }
                        }
                        result[b * hidden + h] = if count > 0 { (sum / count as f64) as f32 } else { 0.0 };
                    }
                }
                self.write(output, &result)
            }
        }
    }
}

impl Accelerator for ReferenceAccelerator {
    fn name(&self) -> &str {
        "reference"
    }

    fn device_count(&self) -> Result<usize> {
        if self.fail_queries {
            return Err(ComputeError::DeviceQueryFailed("reference driver unavailable".into()));
        }
        Ok(self.devices)
    }

    fn device_info(&self, device_id: u32) -> Result<ComputeDeviceInfo> {
        let count = self.device_count()?;
        if device_id as usize >= count {
            return Err(ComputeError::DeviceQueryFailed(format!(
                "device {device_id} out of range ({count} present)"
            )));
        }
        let used = Self::used_bytes(&self.regions.lock());
        Ok(ComputeDeviceInfo {
            device_id,
            name: format!("Reference Device {device_id}"),
            total_memory: self.total_memory,
            free_memory: self.total_memory.saturating_sub(used),
            compute_capability_major: 1,
            compute_capability_minor: 0,
            multiprocessor_count: std::thread::available_parallelism().map_or(1, |n| n.get() as u32),
            max_threads_per_block: 1,
        })
    }

    fn allocate(&self, len: usize) -> Result<DeviceRegion> {
        if self.fail_allocations.load(Ordering::Acquire) {
            return Err(ComputeError::Device("allocation rejected".into()));
        }
        let mut regions = self.regions.lock();
        let requested = (len * 4) as u64;
        if Self::used_bytes(&regions) + requested > self.total_memory {
            return Err(ComputeError::Device(format!(
                "out of device memory: {requested} bytes requested"
            )));
        }
        let id = self.next_region.fetch_add(1, Ordering::Relaxed);
        regions.insert(id, vec![0.0; len]);
        Ok(DeviceRegion::new(id, len))
    }

    fn free(&self, region: DeviceRegion) {
        self.regions.lock().remove(&region.id());
    }

    fn upload(&self, region: DeviceRegion, data: &[f32]) -> Result<()> {
        self.write(region, data)
    }

    fn download(&self, region: DeviceRegion, out: &mut [f32]) -> Result<()> {
        let data = self.read(region, out.len())?;
        out.copy_from_slice(&data);
        Ok(())
    }

    fn zero(&self, region: DeviceRegion) -> Result<()> {
        let mut regions = self.regions.lock();
        match regions.get_mut(&region.id()) {
            Some(data) => {
                data.fill(0.0);
                Ok(())
            }
            None => Err(ComputeError::Device(format!("unknown region {}", region.id()))),
        }
    }

    fn launch(&self, kernel: &Kernel) -> Result<KernelMetrics> {
        if self.fail_launches.load(Ordering::Acquire) {
            return Err(ComputeError::Device(format!("{} launch rejected", kernel.name())));
        }
        let start = Instant::now();
        self.run(kernel)?;
        let launches = self.launches.fetch_add(1, Ordering::Relaxed) + 1;
        let hook = self.launch_hook.lock().clone();
        if let Some(LaunchHook(hook)) = hook {
            hook(kernel, launches);
        }
        let used = Self::used_bytes(&self.regions.lock());
        Ok(KernelMetrics {
            compute_time_ms: start.elapsed().as_secs_f32() * 1000.0,
            memory_usage_mb: used as f32 / (1024.0 * 1024.0),
            active_kernels: 1,
        })
    }
}
