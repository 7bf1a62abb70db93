//! Device probe.
//!
//! Answers "is there an accelerator, and how many devices does it expose?".
//! The first [`DeviceProbe::device_count`] call queries the accelerator and
//! caches the answer until [`DeviceProbe::reset_cache`]. Query failures are
//! logged and read as zero devices: accelerator absence is the common case,
//! not an error.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::device::{Accelerator, ComputeDeviceInfo};
use crate::error::{ComputeError, Result};

/// Cached view of one accelerator's device count.
#[derive(Debug)]
pub struct DeviceProbe {
    accelerator: Option<Arc<dyn Accelerator>>,
    cached: Mutex<Option<usize>>,
}

impl DeviceProbe {
    /// Probe over `accelerator`.
    pub fn new(accelerator: Arc<dyn Accelerator>) -> Self {
        Self {
            accelerator: Some(accelerator),
            cached: Mutex::new(None),
        }
    }

    /// Probe for a host with no accelerator at all.
    pub fn none() -> Self {
        Self {
            accelerator: None,
            cached: Mutex::new(None),
        }
    }

    /// Number of usable devices, queried once and then cached.
    pub fn device_count(&self) -> usize {
        let mut cached = self.cached.lock();
        if let Some(count) = *cached {
            return count;
        }
        let count = match &self.accelerator {
            None => 0,
            Some(accelerator) => match accelerator.device_count() {
                Ok(count) => count,
                Err(e) => {
                    let e = match e {
                        ComputeError::DeviceQueryFailed(_) => e,
                        other => ComputeError::DeviceQueryFailed(other.to_string()),
                    };
                    warn!(backend = accelerator.name(), error = %e, "treating accelerator as absent");
                    0
                }
            },
        };
        debug!(devices = count, "device probe populated");
        *cached = Some(count);
        count
    }

    /// Whether at least one device is present.
    pub fn is_available(&self) -> bool {
        self.device_count() > 0
    }

    /// Forgets the cached count; the next query re-detects.
    pub fn reset_cache(&self) {
        *self.cached.lock() = None;
    }

    /// Fresh, uncached description of `device_id`.
    pub fn device_info(&self, device_id: u32) -> Result<ComputeDeviceInfo> {
        match &self.accelerator {
            Some(accelerator) => accelerator.device_info(device_id),
            None => Err(ComputeError::DeviceQueryFailed("no accelerator backend".into())),
        }
    }

    /// The accelerator behind this probe, present or not.
    pub fn accelerator(&self) -> Option<&Arc<dyn Accelerator>> {
        self.accelerator.as_ref()
    }

    /// The accelerator, only if it reports at least one device.
    pub fn available_accelerator(&self) -> Option<Arc<dyn Accelerator>> {
        if self.is_available() {
            self.accelerator.clone()
        } else {
            None
        }
    }
}

/// Process-wide probe over the platform accelerator.
pub fn global() -> Arc<DeviceProbe> {
    static GLOBAL: OnceLock<Arc<DeviceProbe>> = OnceLock::new();
    GLOBAL
        .get_or_init(|| {
            Arc::new(match platform_accelerator() {
                Some(accelerator) => DeviceProbe::new(accelerator),
                None => DeviceProbe::none(),
            })
        })
        .clone()
}

/// The accelerator compiled into this build, if any.
#[cfg(feature = "wgpu")]
pub fn platform_accelerator() -> Option<Arc<dyn Accelerator>> {
    Some(Arc::new(crate::ops::wgpu::WgpuAccelerator::new()))
}

/// The accelerator compiled into this build, if any.
#[cfg(not(feature = "wgpu"))]
pub fn platform_accelerator() -> Option<Arc<dyn Accelerator>> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::reference::ReferenceAccelerator;

    #[test]
    fn absent_backend_reports_zero() {
        let probe = DeviceProbe::none();
        assert_eq!(probe.device_count(), 0);
        assert!(!probe.is_available());
        assert!(probe.device_info(0).is_err());
    }

    #[test]
    fn query_failure_reads_as_unavailable() {
        let probe = DeviceProbe::new(Arc::new(ReferenceAccelerator::new().failing_queries()));
        assert!(!probe.is_available());
        assert!(probe.available_accelerator().is_none());
    }

    #[test]
    fn count_is_cached_until_reset() {
        let probe = DeviceProbe::new(Arc::new(ReferenceAccelerator::new().with_devices(2)));
        assert_eq!(probe.device_count(), 2);
        assert_eq!(*probe.cached.lock(), Some(2));
        probe.reset_cache();
        assert_eq!(*probe.cached.lock(), None);
        assert_eq!(probe.device_count(), 2);
    }

    #[test]
    fn device_info_is_fresh() {
        let device = Arc::new(ReferenceAccelerator::new().with_total_memory(1024));
        let probe = DeviceProbe::new(device.clone());
        assert_eq!(probe.device_info(0).unwrap().free_memory, 1024);
        let region = device.allocate(64).unwrap();
        assert_eq!(probe.device_info(0).unwrap().free_memory, 768);
        device.free(region);
    }
}
