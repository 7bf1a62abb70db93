//! Resource monitor.
//!
//! Reports memory and utilisation for the runtime's device (or, without one,
//! for its buffer pool) and aggregates per-operation timings. Each recorded
//! operation is also forwarded to every registered [`OperationRecorder`];
//! the default [`TracingRecorder`] emits a `tracing` event.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, warn};

use crate::device::ComputeDeviceInfo;
use crate::error::Result;
use crate::mode::OperationType;
use crate::pool::MemoryPool;
use crate::probe::DeviceProbe;

/// One completed operation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OperationRecord {
    pub operation: OperationType,
    pub duration_ms: f64,
    pub bytes_processed: usize,
}

/// Sink for completed operations, e.g. an external telemetry collector.
pub trait OperationRecorder: Send + Sync {
    fn record(&self, record: &OperationRecord);
}

/// Emits each record as a `debug` event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingRecorder;

impl OperationRecorder for TracingRecorder {
    fn record(&self, record: &OperationRecord) {
        debug!(
            operation = %record.operation,
            duration_ms = record.duration_ms,
            bytes = record.bytes_processed,
            "operation recorded"
        );
    }
}

/// Running aggregate for one operation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct OperationMetrics {
    pub count: u64,
    pub total_duration_ms: f64,
    pub max_duration_ms: f64,
    pub total_bytes: u64,
}

impl OperationMetrics {
    pub fn mean_duration_ms(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.total_duration_ms / self.count as f64
        }
    }
}

/// Point-in-time device record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: u32,
    pub name: String,
    pub total_memory: u64,
    pub free_memory: u64,
    pub used_memory: u64,
    pub utilization_percent: f64,
    pub compute_capability: (u32, u32),
    pub multiprocessor_count: u32,
    pub max_threads_per_block: u32,
    pub captured_at: SystemTime,
}

impl From<ComputeDeviceInfo> for DeviceSnapshot {
    fn from(info: ComputeDeviceInfo) -> Self {
        let used = info.used_memory();
        Self {
            device_id: info.device_id,
            utilization_percent: percent(used, info.total_memory),
            used_memory: used,
            total_memory: info.total_memory,
            free_memory: info.free_memory,
            compute_capability: (info.compute_capability_major, info.compute_capability_minor),
            multiprocessor_count: info.multiprocessor_count,
            max_threads_per_block: info.max_threads_per_block,
            name: info.name,
            captured_at: SystemTime::now(),
        }
    }
}

fn percent(part: u64, whole: u64) -> f64 {
    if whole == 0 {
        0.0
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

pub struct ResourceMonitor {
    probe: Arc<DeviceProbe>,
    pool: Arc<MemoryPool>,
    device_id: u32,
    device: RwLock<Option<ComputeDeviceInfo>>,
    metrics: Mutex<BTreeMap<OperationType, OperationMetrics>>,
    recorders: RwLock<Vec<Arc<dyn OperationRecorder>>>,
}

impl core::fmt::Debug for ResourceMonitor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ResourceMonitor")
            .field("device_id", &self.device_id)
            .field("device", &*self.device.read())
            .field("recorders", &self.recorders.read().len())
            .finish()
    }
}

impl ResourceMonitor {
    /// Monitor for `device_id`, reading its first snapshot immediately.
    pub fn new(probe: Arc<DeviceProbe>, pool: Arc<MemoryPool>, device_id: u32) -> Self {
        let monitor = Self {
            probe,
            pool,
            device_id,
            device: RwLock::new(None),
            metrics: Mutex::new(BTreeMap::new()),
            recorders: RwLock::new(vec![Arc::new(TracingRecorder)]),
        };
        monitor.refresh();
        monitor
    }

    /// Re-reads device information. Failures clear the cached snapshot.
    pub fn refresh(&self) {
        let info = if self.probe.is_available() {
            match self.probe.device_info(self.device_id) {
                Ok(info) => Some(info),
                Err(e) => {
                    warn!(device_id = self.device_id, error = %e, "device refresh failed");
                    None
                }
            }
        } else {
            None
        };
        *self.device.write() = info;
    }

    /// Percent of memory in use: device memory when a device is present,
    /// otherwise rented pool slots.
    pub fn current_utilization(&self) -> f64 {
        match &*self.device.read() {
            Some(info) => percent(info.used_memory(), info.total_memory),
            None => {
                let stats = self.pool.stats();
                percent(stats.rented_buffers as u64, self.pool.config().max_buffers as u64)
            }
        }
    }

    /// Device memory, or the pool's nominal capacity without a device.
    pub fn total_memory(&self) -> u64 {
        match &*self.device.read() {
            Some(info) => info.total_memory,
            None => {
                let config = self.pool.config();
                (config.max_buffers * config.default_buffer_size) as u64
            }
        }
    }

    /// Bytes currently held by the pool.
    pub fn allocated_memory(&self) -> u64 {
        self.pool.stats().allocated_bytes as u64
    }

    pub fn available_memory(&self) -> u64 {
        self.total_memory().saturating_sub(self.allocated_memory())
    }

    /// Fresh snapshot of `device_id`.
    pub fn device_snapshot(&self, device_id: u32) -> Result<DeviceSnapshot> {
        self.probe.device_info(device_id).map(DeviceSnapshot::from)
    }

    pub fn add_recorder(&self, recorder: Arc<dyn OperationRecorder>) {
        self.recorders.write().push(recorder);
    }

    /// Aggregates one completed operation and forwards it to the recorders.
    pub fn record_operation(&self, operation: OperationType, duration_ms: f64, bytes_processed: usize) {
        {
            let mut metrics = self.metrics.lock();
            let entry = metrics.entry(operation).or_default();
            entry.count += 1;
            entry.total_duration_ms += duration_ms;
            entry.max_duration_ms = entry.max_duration_ms.max(duration_ms);
            entry.total_bytes += bytes_processed as u64;
        }
        let record = OperationRecord {
            operation,
            duration_ms,
            bytes_processed,
        };
        for recorder in self.recorders.read().iter() {
            recorder.record(&record);
        }
    }

    /// Aggregates per operation kind, for kinds seen so far.
    pub fn operation_metrics(&self) -> BTreeMap<OperationType, OperationMetrics> {
        self.metrics.lock().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::Accelerator;
    use crate::device::reference::ReferenceAccelerator;
    use crate::pool::PoolConfig;

    struct Collect(Mutex<Vec<OperationRecord>>);

    impl OperationRecorder for Collect {
        fn record(&self, record: &OperationRecord) {
            self.0.lock().push(*record);
        }
    }

    fn host_monitor() -> ResourceMonitor {
        let pool = Arc::new(MemoryPool::new(
            PoolConfig {
                max_buffers: 4,
                default_buffer_size: 1024,
                ..PoolConfig::default()
            },
            None,
        ));
        ResourceMonitor::new(Arc::new(DeviceProbe::none()), pool, 0)
    }

    #[test]
    fn without_device_reports_pool_figures() {
        let monitor = host_monitor();
        assert_eq!(monitor.total_memory(), 4096);
        let buf = monitor.pool.rent(1024).unwrap();
        assert_eq!(monitor.allocated_memory(), 1024);
        assert_eq!(monitor.available_memory(), 3072);
        assert_eq!(monitor.current_utilization(), 25.0);
        monitor.pool.return_buffer(buf).unwrap();
        assert!(monitor.device_snapshot(0).is_err());
    }

    #[test]
    fn refresh_tracks_device_usage() {
        let device = Arc::new(ReferenceAccelerator::new().with_total_memory(4096));
        let probe = Arc::new(DeviceProbe::new(device.clone()));
        let pool = Arc::new(MemoryPool::new(PoolConfig::default(), None));
        let monitor = ResourceMonitor::new(probe, pool, 0);
        assert_eq!(monitor.current_utilization(), 0.0);

        let region = device.allocate(512).unwrap();
        monitor.refresh();
        assert_eq!(monitor.current_utilization(), 50.0);
        let snapshot = monitor.device_snapshot(0).unwrap();
        assert_eq!(snapshot.used_memory, 2048);
        device.free(region);
    }

    #[test]
    fn records_aggregate_and_fan_out() {
        let monitor = host_monitor();
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        monitor.add_recorder(sink.clone());

        monitor.record_operation(OperationType::VectorSearch, 2.0, 100);
        monitor.record_operation(OperationType::VectorSearch, 4.0, 50);

        let metrics = monitor.operation_metrics();
        let search = metrics[&OperationType::VectorSearch];
        assert_eq!(search.count, 2);
        assert_eq!(search.total_bytes, 150);
        assert_eq!(search.max_duration_ms, 4.0);
        assert_eq!(search.mean_duration_ms(), 3.0);
        assert_eq!(sink.0.lock().len(), 2);
    }
}
