//! briny_compute: pooled-memory tensor compute with GPU offload and a SIMD CPU
//! fallback.
//!
//! The runtime answers one question per call: should this operation run on
//! the accelerator or on the host? The answer comes from a process-wide
//! compute policy, and the work itself comes from a fixed catalog of numeric
//! primitives that exist on both paths.
//!
//! # Features
//!
//! - Device discovery that never fails: a host without an accelerator simply
//!   reports zero devices.
//! - A bounded buffer pool with blocking rent, best-fit reuse and
//!   zero-on-return, plus scoped guards that always give buffers back.
//! - Dot product, norm, cosine similarity, softmax, ReLU, element-wise add and
//!   multiply, matrix multiply, masked mean pooling, magnitude validation and
//!   content hashing, each on a device path and a CPU path.
//! - Runtime-switchable compute mode (`Gpu`, `Cpu`, `Hybrid`) and offload
//!   strategy (`Full`, `Selective`, `Local`) with change notifications.
//! - Batch variants with cancellation, and a resource monitor that aggregates
//!   per-operation timings.
//!
//! # Modules
//!
//! - [`probe`]: device discovery
//! - [`device`]: the accelerator contract and a host-emulated reference device
//! - [`pool`]: the buffer pool and scoped buffer guards
//! - [`ops`]: the primitive catalog and its CPU and device paths
//! - [`mode`]: the compute mode service
//! - [`runtime`]: the [`TensorRuntime`] façade, batch operations and the
//!   resource monitor
//!
//! # Feature Flags
//!
//! - `simd`: AVX2 reductions on x86_64 targets built with `avx2`
//! - `wgpu`: a WebGPU accelerator discovered by [`probe::global`]
//!
//! # Example
//!
//! ```rust
//! use briny_compute::{ComputeOptions, TensorRuntime};
//!
//! let runtime = TensorRuntime::new(ComputeOptions::load_or_default()).unwrap();
//!
//! let mut probs = [0.0; 3];
//! runtime.softmax(&[1.0, 2.0, 3.0], &mut probs).unwrap();
//! assert!((probs.iter().sum::<f32>() - 1.0).abs() < 1e-5);
//!
//! let digest = runtime.hash_content(b"model.safetensors").unwrap();
//! assert_eq!(digest.to_string().len(), 32);
//! ```

pub mod approx;
pub mod backend;
pub mod config;
pub mod device;
pub mod error;
pub mod mode;
pub mod ops;
pub mod pool;
pub mod probe;
pub mod runtime;
pub mod tensors;

pub use backend::{ComputeMode, ExecutionPath, OffloadStrategy};
pub use config::ComputeOptions;
pub use device::{Accelerator, ComputeDeviceInfo};
pub use error::{ComputeError, Result};
pub use mode::{ComputeModeService, ComputeStatistics, ModeChanged, OperationType};
pub use ops::dispatch::NativeComputeContext;
pub use ops::{ContentDigest, MatrixDims, PoolingDims, ValidationReport};
pub use pool::{BufferScope, ComputeBuffer, MemoryPool, PoolConfig, PoolStats};
pub use probe::DeviceProbe;
pub use runtime::{CancellationToken, PoolingInput, ResourceMonitor, TensorRuntime};
pub use tensors::Tensor;
