use std::sync::Arc;

use briny_compute::approx::relative_error;
use briny_compute::device::reference::ReferenceAccelerator;
use briny_compute::ops::cpu;
use briny_compute::ops::dispatch::{ComputeBackend, NativeComputeContext};
use briny_compute::pool::{MemoryPool, PoolConfig};
use briny_compute::{ExecutionPath, MatrixDims, PoolingDims};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const TOLERANCE: f64 = 1e-4;

fn positive(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.random_range(0.01f32..1.0)).collect()
}

fn signed(rng: &mut StdRng, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.random_range(-4.0f32..4.0)).collect()
}

fn rel(actual: f32, expected: f64) -> f64 {
    (actual as f64 - expected).abs() / expected.abs().max(f64::MIN_POSITIVE)
}

fn dot64(x: &[f32], y: &[f32]) -> f64 {
    x.iter().zip(y).map(|(&a, &b)| a as f64 * b as f64).sum()
}

fn assert_close(label: &str, actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len(), "{label}: length");
    for (i, (&a, &e)) in actual.iter().zip(expected).enumerate() {
        let err = relative_error(a as f64, e as f64);
        assert!(err <= TOLERANCE, "{label}[{i}]: {a} vs {e} (relative error {err})");
    }
}

#[test]
fn cpu_reductions_match_double_precision() {
    let mut rng = StdRng::seed_from_u64(0x5eed);
    for len in [1, 7, 64, 1000, 4099] {
        let x = positive(&mut rng, len);
        let y = positive(&mut rng, len);

        let dot = dot64(&x, &y);
        let (nx, ny) = (dot64(&x, &x).sqrt(), dot64(&y, &y).sqrt());

        assert!(rel(cpu::dot(&x, &y).unwrap(), dot) <= TOLERANCE, "dot len={len}");
        assert!(rel(cpu::norm(&x), nx) <= TOLERANCE, "norm len={len}");
        assert!(
            rel(cpu::cosine_similarity(&x, &y).unwrap(), dot / (nx * ny)) <= TOLERANCE,
            "cosine len={len}"
        );
    }
}

#[test]
fn cpu_softmax_matches_double_precision() {
    let mut rng = StdRng::seed_from_u64(7);
    let x = signed(&mut rng, 513);
    let mut out = vec![0.0; x.len()];
    cpu::softmax(&x, &mut out).unwrap();

    let max = x.iter().fold(f64::NEG_INFINITY, |m, &v| m.max(v as f64));
    let sum: f64 = x.iter().map(|&v| (v as f64 - max).exp()).sum();
    for (&got, &v) in out.iter().zip(&x) {
        assert!(rel(got, (v as f64 - max).exp() / sum) <= TOLERANCE);
    }
}

fn compare_into<F>(label: &str, gpu: &dyn ComputeBackend, host: &dyn ComputeBackend, len: usize, f: F)
where
    F: Fn(&dyn ComputeBackend, &mut [f32]),
{
    let (mut a, mut b) = (vec![0.0; len], vec![0.0; len]);
    f(gpu, &mut a);
    f(host, &mut b);
    assert_close(label, &a, &b);
}

fn device_context() -> (Arc<ReferenceAccelerator>, NativeComputeContext) {
    let device = Arc::new(ReferenceAccelerator::new());
    let pool = Arc::new(MemoryPool::new(PoolConfig::default(), Some(device.clone())));
    let context = NativeComputeContext::new(pool, Some(device.clone()), true);
    (device, context)
}

#[test]
fn device_path_matches_cpu_path() {
    let (device, context) = device_context();
    let gpu = context.backend_for(ExecutionPath::Device).unwrap();
    let host = context.cpu();
    let mut rng = StdRng::seed_from_u64(42);

    let x = positive(&mut rng, 5000);
    let y = positive(&mut rng, 5000);
    assert_close("dot", &[gpu.dot(&x, &y).unwrap()], &[host.dot(&x, &y).unwrap()]);
    assert_close("norm", &[gpu.norm(&x).unwrap()], &[host.norm(&x).unwrap()]);
    assert_close(
        "cosine",
        &[gpu.cosine_similarity(&x, &y).unwrap()],
        &[host.cosine_similarity(&x, &y).unwrap()],
    );

    let s = signed(&mut rng, 5000);
    compare_into("relu", gpu, host, s.len(), |be, out| be.relu(&s, out).unwrap());
    compare_into("add", gpu, host, s.len(), |be, out| be.add(&s, &x, out).unwrap());
    compare_into("multiply", gpu, host, s.len(), |be, out| be.multiply(&s, &y, out).unwrap());
    compare_into("softmax_rows", gpu, host, s.len(), |be, out| {
        be.softmax_rows(&s, out, 50, 100).unwrap()
    });

    let dims = MatrixDims { m: 33, n: 17, k: 40 };
    let ma = signed(&mut rng, dims.m * dims.k);
    let mb = signed(&mut rng, dims.k * dims.n);
    let (mut ca, mut cb) = (vec![0.0; dims.m * dims.n], vec![0.0; dims.m * dims.n]);
    gpu.matmul(&ma, &mb, &mut ca, dims).unwrap();
    host.matmul(&ma, &mb, &mut cb, dims).unwrap();
    for (i, (&a, &b)) in ca.iter().zip(&cb).enumerate() {
        assert!((a - b).abs() <= 1e-3 * b.abs().max(1.0), "matmul[{i}]: {a} vs {b}");
    }

    let pd = PoolingDims { batch: 3, seq: 5, hidden: 8 };
    let hidden = signed(&mut rng, pd.batch * pd.seq * pd.hidden);
    let mask: Vec<i64> = (0..pd.batch * pd.seq)
        .map(|i| if i / pd.seq == 2 { 0 } else { (i % 2) as i64 })
        .collect();
    let (mut pa, mut pb) = (vec![f32::NAN; pd.batch * pd.hidden], vec![f32::NAN; pd.batch * pd.hidden]);
    gpu.mean_pooling(&hidden, &mask, &mut pa, pd).unwrap();
    host.mean_pooling(&hidden, &mask, &mut pb, pd).unwrap();
    assert_close("mean_pooling", &pa, &pb);
    assert!(pa[2 * pd.hidden..].iter().all(|&v| v == 0.0));

    let report_gpu = gpu.validate_content(&s, 3.5).unwrap();
    let report_host = host.validate_content(&s, 3.5).unwrap();
    assert_eq!(report_gpu.valid, report_host.valid);
    assert_eq!(report_gpu.max_magnitude, report_host.max_magnitude);

    assert_eq!(gpu.hash_content(b"weights"), host.hash_content(b"weights"));
    assert_eq!(device.launches(), 10);
}

#[test]
fn nan_fails_validation_on_both_paths() {
    let (_device, context) = device_context();
    let mut data = vec![0.5f32; 64];
    data[17] = f32::NAN;
    for backend in [context.backend_for(ExecutionPath::Device).unwrap(), context.cpu()] {
        let report = backend.validate_content(&data, 10.0).unwrap();
        assert!(!report.valid, "{:?}", backend.path());
        assert!(report.max_magnitude.is_nan());
    }
}
