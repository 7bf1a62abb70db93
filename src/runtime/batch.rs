//! Batch operations.
//!
//! Each batch call routes once for its item kind, then fans the items out.
//! On the CPU path items run in parallel on the rayon pool. On the device
//! path they run one after another, since kernel launches on a single queue
//! are not safely concurrent. A [`CancellationToken`] is checked before each
//! item; an item already running always completes.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use rayon::prelude::*;
use tracing::debug;

use super::{F32_BYTES, TensorRuntime};
use crate::backend::ExecutionPath;
use crate::error::{ComputeError, Result};
use crate::mode::OperationType;
use crate::ops::dispatch::ComputeBackend;
use crate::ops::{MatrixDims, PoolingDims};
use crate::tensors::Tensor;

/// Shared flag that stops a batch between items.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

fn check(cancel: Option<&CancellationToken>) -> Result<()> {
    match cancel {
        Some(token) if token.is_cancelled() => Err(ComputeError::Cancelled),
        _ => Ok(()),
    }
}

/// One pooling item: `hidden_states` is `[batch, seq, hidden]` and
/// `attention_mask` is `[batch, seq]`.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolingInput {
    pub hidden_states: Tensor<f32>,
    pub attention_mask: Tensor<i64>,
}

impl PoolingInput {
    fn dims(&self) -> Result<PoolingDims> {
        let (batch, seq, hidden) = self.hidden_states.dims3()?;
        let mask = self.attention_mask.dims2()?;
        if mask != (batch, seq) {
            return Err(ComputeError::ShapeMismatch {
                expected: batch.saturating_mul(seq),
                actual: self.attention_mask.numel(),
            });
        }
        Ok(PoolingDims { batch, seq, hidden })
    }
}

fn matmul_dims(a: &Tensor<f32>, b: &Tensor<f32>) -> Result<MatrixDims> {
    let (m, k) = a.dims2()?;
    let (k2, n) = b.dims2()?;
    if k != k2 {
        return Err(ComputeError::ShapeMismatch { expected: k, actual: k2 });
    }
    Ok(MatrixDims { m, n, k })
}

impl TensorRuntime {
    fn run_batch<I, T, F>(
        &self,
        op: OperationType,
        items: &[I],
        bytes: usize,
        cancel: Option<&CancellationToken>,
        f: F,
    ) -> Result<Vec<T>>
    where
        I: Sync,
        T: Send,
        F: Fn(&dyn ComputeBackend, &I) -> Result<T> + Sync,
    {
        let path = self.route(op)?;
        let start = Instant::now();
        let results = match path {
            ExecutionPath::Cpu => {
                let cpu = self.context.cpu();
                items
                    .par_iter()
                    .map(|item| {
                        check(cancel)?;
                        f(cpu, item)
                    })
                    .collect::<Result<Vec<T>>>()?
            }
            ExecutionPath::Device => {
                let mut results = Vec::with_capacity(items.len());
                for item in items {
                    check(cancel)?;
                    results.push(self.execute(op, path, |b| f(b, item))?);
                }
                results
            }
        };
        let elapsed = start.elapsed().as_secs_f64() * 1000.0;
        debug!(operation = %op, ?path, items = items.len(), elapsed_ms = elapsed, "batch complete");
        self.monitor.record_operation(op, elapsed, bytes);
        self.monitor.record_operation(OperationType::BatchProcessing, elapsed, bytes);
        Ok(results)
    }

    /// Similarity of `query` against every candidate, in candidate order.
    pub fn cosine_similarity_batch<V>(
        &self,
        query: &[f32],
        candidates: &[V],
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<f32>>
    where
        V: AsRef<[f32]> + Sync,
    {
        let bytes = candidates.iter().map(|c| (query.len() + c.as_ref().len()) * F32_BYTES).sum();
        self.run_batch(OperationType::VectorSearch, candidates, bytes, cancel, |b, c| {
            b.cosine_similarity(query, c.as_ref())
        })
    }

    /// Products of rank-2 pairs.
    pub fn matrix_multiply_batch(
        &self,
        pairs: &[(Tensor<f32>, Tensor<f32>)],
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Tensor<f32>>> {
        let bytes = pairs.iter().map(|(a, b)| (a.numel() + b.numel()) * F32_BYTES).sum();
        self.run_batch(OperationType::MatrixMultiply, pairs, bytes, cancel, |be, (a, b)| {
            let dims = matmul_dims(a, b)?;
            let mut c = Tensor::zeros([dims.m, dims.n]);
            be.matmul(&a.data, &b.data, &mut c.data, dims)?;
            Ok(c)
        })
    }

    /// Masked mean pooling per item. Each result is `[batch, hidden]`.
    pub fn mean_pooling_batch(
        &self,
        inputs: &[PoolingInput],
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Tensor<f32>>> {
        let bytes = inputs
            .iter()
            .map(|i| i.hidden_states.numel() * F32_BYTES + i.attention_mask.numel() * core::mem::size_of::<i64>())
            .sum();
        self.run_batch(OperationType::Pooling, inputs, bytes, cancel, |be, input| {
            let dims = input.dims()?;
            let mut out = Tensor::zeros([dims.batch, dims.hidden]);
            be.mean_pooling(&input.hidden_states.data, &input.attention_mask.data, &mut out.data, dims)?;
            Ok(out)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ComputeOptions;
    use crate::device::reference::ReferenceAccelerator;
    use crate::probe::DeviceProbe;
    use crate::tensor;

    fn host_runtime() -> TensorRuntime {
        TensorRuntime::with_probe(ComputeOptions::default(), Arc::new(DeviceProbe::none())).unwrap()
    }

    fn device_runtime() -> (Arc<ReferenceAccelerator>, TensorRuntime) {
        let device = Arc::new(ReferenceAccelerator::new());
        let runtime =
            TensorRuntime::with_probe(ComputeOptions::default(), Arc::new(DeviceProbe::new(device.clone()))).unwrap();
        (device, runtime)
    }

    #[test]
    fn cosine_batch_keeps_candidate_order() {
        let runtime = host_runtime();
        let candidates = vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![0.0, 0.0]];
        let sims = runtime.cosine_similarity_batch(&[1.0, 0.0], &candidates, None).unwrap();
        assert_eq!(sims.len(), 3);
        assert!((sims[0] - 1.0).abs() < 1e-6);
        assert!(sims[1].abs() < 1e-6);
        assert_eq!(sims[2], 0.0);
    }

    #[test]
    fn cancelled_batch_stops() {
        let runtime = host_runtime();
        let token = CancellationToken::new();
        token.cancel();
        let candidates = vec![vec![1.0f32; 4]; 8];
        assert_eq!(
            runtime.cosine_similarity_batch(&[1.0; 4], &candidates, Some(&token)),
            Err(ComputeError::Cancelled)
        );
    }

    #[test]
    fn matmul_batch_on_device_runs_each_item() {
        let (device, runtime) = device_runtime();
        let pairs = vec![
            (tensor!([[1.0f32, 2.0], [3.0, 4.0]]), tensor!([[5.0f32, 6.0], [7.0, 8.0]])),
            (tensor!([[1.0f32, 0.0, 2.0]]), tensor!([[1.0f32], [1.0], [1.0]])),
        ];
        let out = runtime.matrix_multiply_batch(&pairs, None).unwrap();
        assert_eq!(out[0], tensor!([[19.0f32, 22.0], [43.0, 50.0]]));
        assert_eq!(out[1], tensor!([[3.0f32]]));
        assert_eq!(device.launches(), 2);
        assert_eq!(runtime.pool().stats().rented_buffers, 0);
    }

    #[test]
    fn cancel_between_device_items_keeps_finished_work_only() {
        let (device, runtime) = device_runtime();
        let token = CancellationToken::new();
        let trigger = token.clone();
        device.set_launch_hook(move |_, launches| {
            if launches == 2 {
                trigger.cancel();
            }
        });

        let pairs = vec![(tensor!([[2.0f32]]), tensor!([[3.0f32]])); 5];
        assert_eq!(runtime.matrix_multiply_batch(&pairs, Some(&token)), Err(ComputeError::Cancelled));
        assert_eq!(device.launches(), 2);
        assert_eq!(runtime.pool().stats().rented_buffers, 0);
        assert!(runtime.monitor().operation_metrics().is_empty());
    }

    #[test]
    fn matmul_batch_rejects_inner_dimension_mismatch() {
        let runtime = host_runtime();
        let pairs = vec![(Tensor::zeros([2, 3]), Tensor::zeros([2, 2]))];
        assert_eq!(
            runtime.matrix_multiply_batch(&pairs, None),
            Err(ComputeError::ShapeMismatch { expected: 3, actual: 2 })
        );
    }

    #[test]
    fn mean_pooling_batch_zeroes_masked_rows() {
        let runtime = host_runtime();
        let input = PoolingInput {
            hidden_states: tensor!([[[1.0f32, 2.0], [3.0, 4.0]], [[5.0, 6.0], [7.0, 8.0]]]),
            attention_mask: tensor!([[1i64, 1], [0, 0]]),
        };
        let out = runtime.mean_pooling_batch(&[input], None).unwrap();
        assert_eq!(out[0], tensor!([[2.0f32, 3.0], [0.0, 0.0]]));
    }

    #[test]
    fn batches_are_recorded_once() {
        let runtime = host_runtime();
        runtime
            .cosine_similarity_batch(&[1.0, 1.0], &[[1.0f32, 1.0]; 3], None)
            .unwrap();
        let metrics = runtime.monitor().operation_metrics();
        assert_eq!(metrics[&OperationType::VectorSearch].count, 1);
        assert_eq!(metrics[&OperationType::BatchProcessing].count, 1);
        assert_eq!(metrics[&OperationType::BatchProcessing].total_bytes, 48);
    }
}
