use std::sync::Arc;
use std::time::Duration;

use briny_compute::device::reference::ReferenceAccelerator;
use briny_compute::mode::OperationType;
use briny_compute::runtime::{OperationRecord, OperationRecorder};
use briny_compute::{
    CancellationToken, ComputeError, ComputeMode, ComputeOptions, DeviceProbe, ExecutionPath, MatrixDims,
    OffloadStrategy, PoolingDims, PoolingInput, Tensor, TensorRuntime, tensor,
};
use parking_lot::Mutex;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn runtime(options: ComputeOptions, device: Option<Arc<ReferenceAccelerator>>) -> TensorRuntime {
    init_tracing();
    let probe = match device {
        Some(device) => DeviceProbe::new(device),
        None => DeviceProbe::none(),
    };
    TensorRuntime::with_probe(options, Arc::new(probe)).unwrap()
}

#[derive(Default)]
struct Collect(Mutex<Vec<OperationRecord>>);

impl OperationRecorder for Collect {
    fn record(&self, record: &OperationRecord) {
        self.0.lock().push(*record);
    }
}

#[test]
fn host_only_runtime_serves_every_primitive() {
    let rt = runtime(ComputeOptions::default(), None);
    assert_eq!(rt.modes().mode(), ComputeMode::Cpu);

    assert_eq!(rt.dot(&[1.0, 2.0, 3.0], &[4.0, 5.0, 6.0]).unwrap(), 32.0);
    assert_eq!(rt.norm(&[3.0, 4.0]).unwrap(), 5.0);
    assert_eq!(rt.cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]).unwrap(), 0.0);

    let mut out = [0.0; 3];
    rt.relu(&[-1.0, 0.0, 2.0], &mut out).unwrap();
    assert_eq!(out, [0.0, 0.0, 2.0]);
    rt.add(&[1.0, 2.0, 3.0], &[1.0, 1.0, 1.0], &mut out).unwrap();
    assert_eq!(out, [2.0, 3.0, 4.0]);
    rt.multiply(&[1.0, 2.0, 3.0], &[2.0, 2.0, 2.0], &mut out).unwrap();
    assert_eq!(out, [2.0, 4.0, 6.0]);

    let mut c = [0.0; 4];
    rt.matrix_multiply(&[1.0, 2.0, 3.0, 4.0], &[1.0, 0.0, 0.0, 1.0], &mut c, MatrixDims { m: 2, n: 2, k: 2 })
        .unwrap();
    assert_eq!(c, [1.0, 2.0, 3.0, 4.0]);

    let mut pooled = [f32::NAN; 2];
    rt.mean_pooling(&[1.0, 2.0, 3.0, 4.0], &[0, 0], &mut pooled, PoolingDims { batch: 1, seq: 2, hidden: 2 })
        .unwrap();
    assert_eq!(pooled, [0.0, 0.0]);

    let report = rt.validate_content(&[0.5, -2.0, 1.0], 1.5).unwrap();
    assert!(!report.valid);
    assert_eq!(report.max_magnitude, 2.0);

    assert_eq!(rt.hash_content(b"abc").unwrap(), rt.hash_content(b"abc").unwrap());
    assert_ne!(rt.hash_content(b"abc").unwrap(), rt.hash_content(b"abd").unwrap());
}

#[test]
fn gpu_mode_without_device_requires_fallback() {
    init_tracing();
    let options = ComputeOptions {
        mode: ComputeMode::Gpu,
        enable_fallback: false,
        ..ComputeOptions::default()
    };
    let err = TensorRuntime::with_probe(options, Arc::new(DeviceProbe::none())).unwrap_err();
    assert_eq!(err, ComputeError::AcceleratorRequired);
}

#[test]
fn selective_strategy_splits_work_between_paths() {
    let device = Arc::new(ReferenceAccelerator::new());
    let options = ComputeOptions {
        mode: ComputeMode::Hybrid,
        strategy: OffloadStrategy::Selective,
        ..ComputeOptions::default()
    };
    let rt = runtime(options, Some(device.clone()));

    rt.cosine_similarity(&[1.0, 2.0], &[2.0, 1.0]).unwrap();
    assert_eq!(device.launches(), 0);

    let mut c = [0.0; 1];
    rt.matrix_multiply(&[2.0], &[3.0], &mut c, MatrixDims { m: 1, n: 1, k: 1 })
        .unwrap();
    assert_eq!(c, [6.0]);
    assert_eq!(device.launches(), 1);

    let stats = rt.statistics();
    assert_eq!(stats.total_operations, 2);
    assert_eq!(stats.offloaded_operations, 1);
    assert_eq!(stats.cpu_operations, 1);
    assert_eq!(rt.pool().stats().rented_buffers, 0);
}

#[test]
fn switching_to_cpu_stops_offload() {
    let device = Arc::new(ReferenceAccelerator::new());
    let rt = runtime(ComputeOptions::default(), Some(device.clone()));
    assert_eq!(rt.route(OperationType::ModelInference).unwrap(), ExecutionPath::Device);
    assert!(rt.set_mode(ComputeMode::Cpu));
    assert_eq!(rt.route(OperationType::ModelInference).unwrap(), ExecutionPath::Cpu);

    rt.set_strategy(OffloadStrategy::Local);
    assert!(rt.set_mode(ComputeMode::Gpu));
    assert_eq!(rt.route(OperationType::Pooling).unwrap(), ExecutionPath::Device);
}

#[test]
fn batches_agree_across_paths() {
    let device = Arc::new(ReferenceAccelerator::new());
    let on_device = runtime(ComputeOptions::default(), Some(device.clone()));
    let on_host = runtime(ComputeOptions::default(), None);

    let pairs = vec![
        (tensor!([[1.0f32, 2.0, 3.0]]), tensor!([[1.0f32], [2.0], [3.0]])),
        (Tensor::new(vec![2, 2], vec![0.5f32, 1.5, -1.0, 2.0]), Tensor::new(vec![2, 1], vec![2.0f32, 4.0])),
    ];
    let a = on_device.matrix_multiply_batch(&pairs, None).unwrap();
    let b = on_host.matrix_multiply_batch(&pairs, None).unwrap();
    assert_eq!(a, b);
    assert_eq!(a[0].data, vec![14.0]);
    assert_eq!(a[1].shape, vec![2, 1]);

    let inputs = vec![PoolingInput {
        hidden_states: tensor!([[[1.0f32, 1.0], [3.0, 5.0]]]),
        attention_mask: tensor!([[1i64, 1]]),
    }];
    let a = on_device.mean_pooling_batch(&inputs, None).unwrap();
    let b = on_host.mean_pooling_batch(&inputs, None).unwrap();
    assert_eq!(a, b);
    assert_eq!(a[0].data, vec![2.0, 3.0]);

    let candidates = vec![vec![1.0f32, 0.0], vec![1.0, 1.0]];
    let a = on_device.cosine_similarity_batch(&[1.0, 0.0], &candidates, None).unwrap();
    let b = on_host.cosine_similarity_batch(&[1.0, 0.0], &candidates, None).unwrap();
    for (x, y) in a.iter().zip(&b) {
        assert!((x - y).abs() < 1e-6);
    }
    assert!(device.launches() >= 5);
}

#[test]
fn cancelled_device_batch_leaves_pool_clean() {
    let device = Arc::new(ReferenceAccelerator::new());
    let rt = runtime(ComputeOptions::default(), Some(device.clone()));
    let token = CancellationToken::new();
    let clone = token.clone();
    clone.cancel();

    let pairs = vec![(tensor!([[1.0f32]]), tensor!([[1.0f32]])); 4];
    assert_eq!(rt.matrix_multiply_batch(&pairs, Some(&token)), Err(ComputeError::Cancelled));
    assert_eq!(device.launches(), 0);
    assert_eq!(rt.pool().stats().rented_buffers, 0);
}

#[test]
fn cancel_from_inside_a_device_item_stops_the_batch() {
    let device = Arc::new(ReferenceAccelerator::new());
    let rt = runtime(ComputeOptions::default(), Some(device.clone()));
    let token = CancellationToken::new();
    let trigger = token.clone();
    device.set_launch_hook(move |kernel, launches| {
        if kernel.name() == "mean_pooling" && launches == 3 {
            trigger.cancel();
        }
    });

    let inputs = vec![
        PoolingInput {
            hidden_states: tensor!([[[1.0f32, 2.0], [3.0, 4.0]]]),
            attention_mask: tensor!([[1i64, 1]]),
        };
        6
    ];
    assert_eq!(rt.mean_pooling_batch(&inputs, Some(&token)), Err(ComputeError::Cancelled));
    assert_eq!(device.launches(), 3);
    assert_eq!(rt.pool().stats().rented_buffers, 0);
}

#[test]
fn tight_pool_still_serves_device_runtime() {
    let device = Arc::new(ReferenceAccelerator::new());
    let options = ComputeOptions {
        max_buffers: 2,
        rent_timeout: Duration::from_millis(50),
        ..ComputeOptions::default()
    };
    let rt = runtime(options, Some(device.clone()));

    assert_eq!(rt.dot(&[1.0, 2.0], &[3.0, 4.0]).unwrap(), 11.0);
    let mut c = [0.0; 1];
    rt.matrix_multiply(&[2.0, 3.0], &[4.0, 5.0], &mut c, MatrixDims { m: 1, n: 1, k: 2 })
        .unwrap();
    assert_eq!(c, [23.0]);
    assert_eq!(rt.norm(&[6.0, 8.0]).unwrap(), 10.0);
    assert_eq!(device.launches(), 1);

    let stats = rt.pool().stats();
    assert_eq!(stats.rented_buffers, 0);
    assert!(stats.allocated_buffers <= 2);
}

#[test]
fn concurrent_device_operations_complete() {
    let device = Arc::new(ReferenceAccelerator::new());
    let options = ComputeOptions {
        max_buffers: 4,
        default_buffer_size: 64,
        ..ComputeOptions::default()
    };
    let rt = runtime(options, Some(device.clone()));

    std::thread::scope(|s| {
        for worker in 0..6 {
            let rt = &rt;
            s.spawn(move || {
                for round in 0..20 {
                    let v = (worker * 20 + round) as f32;
                    let mut c = [0.0; 1];
                    rt.matrix_multiply(&[v], &[2.0], &mut c, MatrixDims { m: 1, n: 1, k: 1 })
                        .unwrap();
                    assert_eq!(c, [2.0 * v]);
                }
            });
        }
    });
    assert_eq!(device.launches(), 120);
    assert_eq!(rt.pool().stats().rented_buffers, 0);
    assert_eq!(rt.statistics().gpu_operations, 120);
}

#[test]
fn offload_without_device_is_counted_as_cpu() {
    let options = ComputeOptions {
        mode: ComputeMode::Hybrid,
        ..ComputeOptions::default()
    };
    let rt = runtime(options, None);
    rt.norm(&[1.0, 1.0]).unwrap();
    let stats = rt.statistics();
    assert_eq!(stats.total_operations, 1);
    assert_eq!(stats.cpu_operations, 1);
    assert_eq!(stats.offloaded_operations + stats.gpu_operations, 0);
}

#[test]
fn monitor_reports_recorded_operations() {
    let rt = runtime(ComputeOptions::default(), None);
    let sink = Arc::new(Collect::default());
    rt.monitor().add_recorder(sink.clone());

    rt.norm(&[1.0; 16]).unwrap();
    rt.hash_content(&[0u8; 100]).unwrap();

    let records = sink.0.lock().clone();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].operation, OperationType::VectorSearch);
    assert_eq!(records[0].bytes_processed, 64);
    assert_eq!(records[1].bytes_processed, 100);

    let json = serde_json::to_value(rt.monitor().operation_metrics()).unwrap();
    assert_eq!(json["ContentHashing"]["count"], 1);
}

#[test]
fn options_load_from_toml() {
    let options = ComputeOptions::from_toml_str(
        r#"
        mode = "Hybrid"
        strategy = "Selective"
        max_buffers = 4
        default_buffer_size = 4096
        "#,
    )
    .unwrap();
    let rt = runtime(options, Some(Arc::new(ReferenceAccelerator::new())));
    assert_eq!(rt.modes().mode(), ComputeMode::Hybrid);
    assert_eq!(rt.modes().strategy(), OffloadStrategy::Selective);
    assert_eq!(rt.pool().config().max_buffers, 4);
    assert!(rt.pool().config().device_budget_bytes.is_some());
}
