//! WebGPU accelerator.
//!
//! [`WgpuAccelerator`] implements the [`Accelerator`] contract with WGSL
//! compute shaders. The adapter, device, queue and every pipeline are created
//! once per process (via `lazy_static`) and shared by all accelerator values.
//!
//! All kernels share one bind group layout:
//!
//! | binding | kind              | use                         |
//! |---------|-------------------|-----------------------------|
//! | 0       | uniform           | four `u32` parameters       |
//! | 1       | storage, read     | first operand               |
//! | 2       | storage, read     | second operand (or first)   |
//! | 3       | storage, write    | result                      |
//!
//! WebGPU exposes no VRAM query, so [`ComputeDeviceInfo::total_memory`]
//! reports the adapter's largest buffer size and free memory is derived from
//! the regions this accelerator holds.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc;
use std::time::Instant;

use briny::prelude::*;
use parking_lot::Mutex;
use tracing::{debug, info};
use wgpu::util::DeviceExt;

use crate::device::{Accelerator, ComputeDeviceInfo, DeviceRegion, Kernel, KernelMetrics};
use crate::error::{ComputeError, Result};

const REDUCE: &str = include_str!("shaders/reduce.wgsl");
const ELEMENTWISE: &str = include_str!("shaders/elementwise.wgsl");
const SOFTMAX: &str = include_str!("shaders/softmax.wgsl");
const MATMUL: &str = include_str!("shaders/matmul.wgsl");
const MEAN_POOLING: &str = include_str!("shaders/mean_pooling.wgsl");

const MAX_GROUPS_PER_DIM: u32 = 65_535;

/// WGSL source checked before compilation.
pub struct WgslSource<'a>(pub &'a str);

impl Validate for WgslSource<'_> {
    fn validate(&self) -> core::result::Result<(), ValidationError> {
        let src = self.0;
        if src.len() > 65536 || !src.contains("fn main") {
            return Err(ValidationError);
        }
        if src.contains("#include") || src.contains("import") {
            return Err(ValidationError);
        }
        Ok(())
    }
}

struct Pipelines {
    reduce: wgpu::ComputePipeline,
    elementwise: wgpu::ComputePipeline,
    softmax: wgpu::ComputePipeline,
    matmul: wgpu::ComputePipeline,
    mean_pooling: wgpu::ComputePipeline,
}

/// Process-wide WebGPU device, queue and compiled kernels.
pub struct GpuContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub info: wgpu::AdapterInfo,
    layout: wgpu::BindGroupLayout,
    pipelines: Pipelines,
}

fn storage_entry(binding: u32, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility: wgpu::ShaderStages::COMPUTE,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

impl GpuContext {
    /// Selects the default adapter and compiles every kernel.
    pub fn new() -> core::result::Result<Self, String> {
        let instance = wgpu::Instance::default();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions::default()))
            .map_err(|e| format!("adapter request failed: {e}"))?;
        let info = adapter.get_info();
        let (device, queue) = pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor {
            label: Some("briny_compute"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            trace: wgpu::Trace::default(),
        }))
        .map_err(|e| format!("device request failed: {e}"))?;

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("kernel_bgl"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                storage_entry(1, true),
                storage_entry(2, true),
                storage_entry(3, false),
            ],
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("kernel_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let build = |label: &str, source: &str| -> core::result::Result<wgpu::ComputePipeline, String> {
            WgslSource(source)
                .validate()
                .map_err(|_| format!("shader {label} failed validation"))?;
            let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
                label: Some(label),
                source: wgpu::ShaderSource::Wgsl(source.into()),
            });
            Ok(device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&pipeline_layout),
                module: &module,
                entry_point: Some("main"),
                cache: None,
                compilation_options: wgpu::PipelineCompilationOptions::default(),
            }))
        };

        let pipelines = Pipelines {
            reduce: build("reduce", REDUCE)?,
            elementwise: build("elementwise", ELEMENTWISE)?,
            softmax: build("softmax", SOFTMAX)?,
            matmul: build("matmul", MATMUL)?,
            mean_pooling: build("mean_pooling", MEAN_POOLING)?,
        };

        info!(adapter = %info.name, backend = ?info.backend, "wgpu context initialised");
        Ok(Self {
            device,
            queue,
            info,
            layout,
            pipelines,
        })
    }

    fn wait(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait)
            .map(|_| ())
            .map_err(|e| ComputeError::Device(format!("device poll failed: {e}")))
    }
}

lazy_static::lazy_static! {
    static ref GPU_CONTEXT: core::result::Result<GpuContext, String> = GpuContext::new();
}

fn context() -> Result<&'static GpuContext> {
    GPU_CONTEXT
        .as_ref()
        .map_err(|e| ComputeError::DeviceQueryFailed(e.clone()))
}

fn as_bytes<T: Copy>(data: &[T]) -> &[u8] {
    let len = core::mem::size_of_val(data);
    // SAFETY: `T` is a plain `Copy` number type and the length covers exactly `data`.
    unsafe { core::slice::from_raw_parts(data.as_ptr() as *const u8, len) }
}

/// Shader parameters are `u32`; larger extents cannot be expressed.
fn param(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| ComputeError::Device(format!("{what} {value} exceeds the u32 shader range")))
}

/// Workgroup grid for `items` invocations at `per_group` per workgroup,
/// folded into two dimensions past the per-dimension limit.
fn grid(items: usize, per_group: u32) -> Result<(u32, u32)> {
    let groups = param(items, "length")?.div_ceil(per_group).max(1);
    let x = groups.min(MAX_GROUPS_PER_DIM);
    let y = groups.div_ceil(x);
    if y > MAX_GROUPS_PER_DIM {
        return Err(ComputeError::Device(format!("{items} items need more than {MAX_GROUPS_PER_DIM}² workgroups")));
    }
    Ok((x, y))
}

/// Workgroups along one unfolded tile axis (matmul rows, pooling batches).
fn tiles(extent: usize, what: &str) -> Result<u32> {
    let groups = param(extent, what)?.div_ceil(16).max(1);
    if groups > MAX_GROUPS_PER_DIM {
        return Err(ComputeError::Device(format!(
            "{what} {extent} needs {groups} workgroups, over the {MAX_GROUPS_PER_DIM} limit"
        )));
    }
    Ok(groups)
}

/// WebGPU implementation of [`Accelerator`].
#[derive(Debug)]
pub struct WgpuAccelerator {
    next_region: AtomicU64,
    regions: Mutex<HashMap<u64, wgpu::Buffer>>,
}

impl Default for WgpuAccelerator {
    fn default() -> Self {
        Self::new()
    }
}

impl WgpuAccelerator {
    pub fn new() -> Self {
        Self {
            next_region: AtomicU64::new(1),
            regions: Mutex::new(HashMap::new()),
        }
    }

    fn used_bytes(&self) -> u64 {
        self.regions.lock().values().map(|b| b.size()).sum()
    }

    fn dispatch(
        &self,
        ctx: &GpuContext,
        pipeline: &wgpu::ComputePipeline,
        params: [u32; 4],
        operands: [DeviceRegion; 3],
        groups: (u32, u32),
    ) -> Result<()> {
        let regions = self.regions.lock();
        let lookup = |r: DeviceRegion| {
            regions
                .get(&r.id())
                .ok_or_else(|| ComputeError::Device(format!("unknown region {}", r.id())))
        };
        let (x, y, out) = (lookup(operands[0])?, lookup(operands[1])?, lookup(operands[2])?);

        ctx.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let params = ctx.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("params"),
            contents: as_bytes(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        let bind_group = ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("kernel_bind_group"),
            layout: &ctx.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: params.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: x.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: y.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: out.as_entire_binding(),
                },
            ],
        });

        let mut encoder = ctx.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("kernel_encoder"),
        });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("kernel_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups.0, groups.1, 1);
        }
        ctx.queue.submit(Some(encoder.finish()));
        drop(regions);
        if let Some(e) = pollster::block_on(ctx.device.pop_error_scope()) {
            return Err(ComputeError::Device(format!("kernel rejected: {e}")));
        }
        ctx.wait()
    }
}

impl Accelerator for WgpuAccelerator {
    fn name(&self) -> &str {
        "wgpu"
    }

    fn device_count(&self) -> Result<usize> {
        context().map(|_| 1)
    }

    fn device_info(&self, device_id: u32) -> Result<ComputeDeviceInfo> {
        let ctx = context()?;
        if device_id != 0 {
            return Err(ComputeError::DeviceQueryFailed(format!(
                "device {device_id} out of range (1 present)"
            )));
        }
        let limits = ctx.device.limits();
        let total = limits.max_buffer_size;
        Ok(ComputeDeviceInfo {
            device_id,
            name: ctx.info.name.clone(),
            total_memory: total,
            free_memory: total.saturating_sub(self.used_bytes()),
            compute_capability_major: 0,
            compute_capability_minor: 0,
            multiprocessor_count: 0,
            max_threads_per_block: limits.max_compute_invocations_per_workgroup,
        })
    }

    fn allocate(&self, len: usize) -> Result<DeviceRegion> {
        let ctx = context()?;
        let limits = ctx.device.limits();
        let limit = limits.max_buffer_size.min(u64::from(limits.max_storage_buffer_binding_size));
        let size = len
            .max(1)
            .checked_mul(core::mem::size_of::<f32>())
            .and_then(|bytes| u64::try_from(bytes).ok())
            .filter(|&bytes| bytes <= limit)
            .ok_or_else(|| ComputeError::Device(format!("{len} elements exceed the {limit} byte binding limit")))?;
        let buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("region"),
            size,
            usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        let id = self.next_region.fetch_add(1, Ordering::Relaxed);
        self.regions.lock().insert(id, buffer);
        debug!(region = id, size, "wgpu region allocated");
        Ok(DeviceRegion::new(id, len))
    }

    fn free(&self, region: DeviceRegion) {
        if let Some(buffer) = self.regions.lock().remove(&region.id()) {
            buffer.destroy();
        }
    }

    fn upload(&self, region: DeviceRegion, data: &[f32]) -> Result<()> {
        let ctx = context()?;
        let regions = self.regions.lock();
        let buffer = regions
            .get(&region.id())
            .ok_or_else(|| ComputeError::Device(format!("unknown region {}", region.id())))?;
        if (data.len() * 4) as u64 > buffer.size() {
            return Err(ComputeError::ShapeMismatch {
                expected: region.len(),
                actual: data.len(),
            });
        }
        if !data.is_empty() {
            ctx.queue.write_buffer(buffer, 0, as_bytes(data));
        }
        Ok(())
    }

    fn download(&self, region: DeviceRegion, out: &mut [f32]) -> Result<()> {
        if out.is_empty() {
            return Ok(());
        }
        let ctx = context()?;
        let size = (out.len() * 4) as u64;
        let staging = ctx.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("staging"),
            size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        {
            let regions = self.regions.lock();
            let buffer = regions
                .get(&region.id())
                .ok_or_else(|| ComputeError::Device(format!("unknown region {}", region.id())))?;
            if size > buffer.size() {
                return Err(ComputeError::ShapeMismatch {
                    expected: region.len(),
                    actual: out.len(),
                });
            }
            let mut encoder = ctx.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("download_encoder"),
            });
            encoder.copy_buffer_to_buffer(buffer, 0, &staging, 0, size);
            ctx.queue.submit(Some(encoder.finish()));
        }

        let slice = staging.slice(..);
        let (tx, rx) = mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = tx.send(result);
        });
        ctx.wait()?;
        rx.recv()
            .map_err(|_| ComputeError::Device("map callback dropped".into()))?
            .map_err(|e| ComputeError::Device(format!("buffer map failed: {e}")))?;

        {
            let data = slice.get_mapped_range();
            for (o, chunk) in out.iter_mut().zip(data.chunks_exact(4)) {
                *o = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            }
        }
        staging.unmap();
        Ok(())
    }

    fn zero(&self, region: DeviceRegion) -> Result<()> {
        let ctx = context()?;
        {
            let regions = self.regions.lock();
            let buffer = regions
                .get(&region.id())
                .ok_or_else(|| ComputeError::Device(format!("unknown region {}", region.id())))?;
            let mut encoder = ctx.device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("zero_encoder"),
            });
            encoder.clear_buffer(buffer, 0, None);
            ctx.queue.submit(Some(encoder.finish()));
        }
        ctx.wait()
    }

    fn launch(&self, kernel: &Kernel) -> Result<KernelMetrics> {
        let ctx = context()?;
        let p = &ctx.pipelines;
        let start = Instant::now();
        match *kernel {
            Kernel::Dot { x, y, out, len } => {
                self.dispatch(ctx, &p.reduce, [0, param(len, "length")?, 0, 0], [x, y, out], (1, 1))?
            }
            Kernel::CosineParts { x, y, out, len } => {
                self.dispatch(ctx, &p.reduce, [1, param(len, "length")?, 0, 0], [x, y, out], (1, 1))?
            }
            Kernel::MaxAbs { x, out, len } => {
                self.dispatch(ctx, &p.reduce, [2, param(len, "length")?, 0, 0], [x, x, out], (1, 1))?
            }
            Kernel::Relu { input, output, len } => self.dispatch(
                ctx,
                &p.elementwise,
                [0, param(len, "length")?, 0, 0],
                [input, input, output],
                grid(len, 256)?,
            )?,
            Kernel::Add { x, y, out, len } => self.dispatch(
                ctx,
                &p.elementwise,
                [1, param(len, "length")?, 0, 0],
                [x, y, out],
                grid(len, 256)?,
            )?,
            Kernel::Multiply { x, y, out, len } => self.dispatch(
                ctx,
                &p.elementwise,
                [2, param(len, "length")?, 0, 0],
                [x, y, out],
                grid(len, 256)?,
            )?,
            Kernel::Softmax { input, output, rows, cols } => self.dispatch(
                ctx,
                &p.softmax,
                [param(rows, "rows")?, param(cols, "cols")?, 0, 0],
                [input, input, output],
                grid(rows, 64)?,
            )?,
            Kernel::MatMul { a, b, c, m, n, k } => self.dispatch(
                ctx,
                &p.matmul,
                [param(m, "m")?, param(n, "n")?, param(k, "k")?, 0],
                [a, b, c],
                (tiles(n, "n")?, tiles(m, "m")?),
            )?,
            Kernel::MeanPooling { input, mask, output, batch, seq, hidden } => self.dispatch(
                ctx,
                &p.mean_pooling,
                [param(batch, "batch")?, param(seq, "seq")?, param(hidden, "hidden")?, 0],
                [input, mask, output],
                (tiles(hidden, "hidden")?, tiles(batch, "batch")?),
            )?,
        }
        Ok(KernelMetrics {
            compute_time_ms: start.elapsed().as_secs_f32() * 1000.0,
            memory_usage_mb: self.used_bytes() as f32 / (1024.0 * 1024.0),
            active_kernels: 1,
        })
    }
}
