//! Bounded pool of reusable compute buffers.
//!
//! [`MemoryPool`] hands out [`ComputeBuffer`]s and takes them back. At most
//! `max_buffers` buffers exist at once; renting past that blocks on a condition
//! variable until a buffer comes back or `rent_timeout` elapses.
//!
//! With an accelerator present each buffer owns a device region (kept in the
//! pool's arena) plus a host alias synchronised through [`MemoryPool::upload`]
//! and [`MemoryPool::download`]. Without one, or when the device refuses an
//! allocation, buffers are plain pinned-host memory. The API is the same
//! either way.
//!
//! A rented buffer that is dropped instead of returned finds its way back to
//! the pool that issued it, so a forgotten return or an early `?` never costs
//! a slot. Such drops are counted in [`PoolStats::reclaimed`].
//!
//! ```rust
//! use briny_compute::pool::{MemoryPool, PoolConfig};
//!
//! let pool = MemoryPool::new(PoolConfig::default(), None);
//! let mut scope = pool.scoped(256).unwrap();
//! scope[0] = 1.0;
//! drop(scope); // returned and zeroed
//! assert_eq!(pool.stats().available_buffers, 1);
//! ```

pub mod buffer;
pub mod scope;

pub use buffer::{BufferId, ComputeBuffer, Residency};
pub use scope::BufferScope;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, trace, warn};

use crate::config::ComputeOptions;
use crate::device::{Accelerator, DeviceRegion};
use crate::error::{ComputeError, Result};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

const F32_BYTES: usize = core::mem::size_of::<f32>();

/// Pool sizing.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Most buffers that may exist (available + rented).
    pub max_buffers: usize,
    /// Size in bytes of a buffer rented without a larger minimum.
    pub default_buffer_size: usize,
    /// Bound on how long `rent` blocks at capacity.
    pub rent_timeout: Duration,
    /// Cap on device-resident bytes; beyond it buffers go to pinned host.
    pub device_budget_bytes: Option<usize>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_buffers: 16,
            default_buffer_size: 1024 * 1024,
            rent_timeout: Duration::from_secs(5),
            device_budget_bytes: None,
        }
    }
}

impl PoolConfig {
    /// Pool sizing from runtime options. `device_memory` is the device's
    /// total memory, scaled by `memory_fraction` into a budget.
    pub fn from_options(options: &ComputeOptions, device_memory: Option<u64>) -> Self {
        Self {
            max_buffers: options.max_buffers,
            default_buffer_size: options.default_buffer_size,
            rent_timeout: options.rent_timeout,
            device_budget_bytes: device_memory
                .map(|total| (total as f64 * options.memory_fraction as f64) as usize),
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct PoolStats {
    pub available_buffers: usize,
    pub rented_buffers: usize,
    pub allocated_buffers: usize,
    pub allocated_bytes: usize,
    pub device_bytes: usize,
    /// Fresh allocations over the pool's lifetime.
    pub total_allocations: u64,
    pub hits: u64,
    pub misses: u64,
    pub returns: u64,
    /// Rented buffers that were dropped without a return.
    pub reclaimed: u64,
    pub retired: u64,
}

impl PoolStats {
    /// Fraction of rents served from the available set.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    available: VecDeque<ComputeBuffer>,
    rented: HashSet<BufferId>,
    arena: HashMap<u64, DeviceRegion>,
    next_slot: u64,
    allocated_buffers: usize,
    allocated_bytes: usize,
    device_bytes: usize,
    total_allocations: u64,
    hits: u64,
    misses: u64,
    returns: u64,
    reclaimed: u64,
    retired: u64,
}

/// State shared between a pool and the buffers it has on loan.
#[derive(Debug)]
pub(crate) struct PoolShared {
    id: u64,
    config: PoolConfig,
    device: Option<Arc<dyn Accelerator>>,
    state: Mutex<PoolState>,
    slot_freed: Condvar,
}

/// Bounded buffer pool. See the [module docs](self).
#[derive(Debug)]
pub struct MemoryPool {
    shared: Arc<PoolShared>,
}

impl MemoryPool {
    /// Creates an empty pool. Buffers are allocated on first demand.
    pub fn new(config: PoolConfig, device: Option<Arc<dyn Accelerator>>) -> Self {
        let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
        debug!(
            pool = id,
            max_buffers = config.max_buffers,
            default_buffer_size = config.default_buffer_size,
            device = device.as_ref().map(|d| d.name()),
            "memory pool created"
        );
        Self {
            shared: Arc::new(PoolShared {
                id,
                config,
                device,
                state: Mutex::new(PoolState::default()),
                slot_freed: Condvar::new(),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Whether buffers from this pool may be device resident.
    pub fn has_device(&self) -> bool {
        self.shared.device.is_some()
    }

    /// Rents a buffer of at least `minimum_size` bytes, blocking at capacity.
    ///
    /// Fails with [`ComputeError::PoolExhausted`] if no buffer is returned
    /// within the configured `rent_timeout`.
    pub fn rent(&self, minimum_size: usize) -> Result<ComputeBuffer> {
        let mut rented = self.rent_many(&[minimum_size])?;
        rented.pop().ok_or(ComputeError::PoolExhausted {
            max_buffers: self.shared.config.max_buffers,
        })
    }

    /// Rents one buffer per entry of `sizes`, all of them or none.
    ///
    /// Waits like [`rent`](Self::rent) until every buffer can be handed out
    /// at once, so callers needing several buffers never hold some while
    /// blocking on the rest. Asking for more buffers than `max_buffers` fails
    /// immediately with [`ComputeError::PoolExhausted`].
    pub fn rent_many(&self, sizes: &[usize]) -> Result<Vec<ComputeBuffer>> {
        let shared = &self.shared;
        let exhausted = ComputeError::PoolExhausted {
            max_buffers: shared.config.max_buffers,
        };
        if sizes.len() > shared.config.max_buffers {
            debug!(pool = shared.id, needed = sizes.len(), "request exceeds pool capacity");
            return Err(exhausted);
        }
        let deadline = Instant::now() + shared.config.rent_timeout;
        let mut state = shared.state.lock();
        loop {
            if let Some(taken) = shared.try_take_all(&mut state, sizes) {
                drop(state);
                return Ok(self.lease(taken));
            }
            trace!(pool = shared.id, needed = sizes.len(), "pool at capacity, waiting for a return");
            if shared.slot_freed.wait_until(&mut state, deadline).timed_out() {
                if let Some(taken) = shared.try_take_all(&mut state, sizes) {
                    drop(state);
                    return Ok(self.lease(taken));
                }
                warn!(pool = shared.id, max_buffers = shared.config.max_buffers, "memory pool exhausted");
                return Err(exhausted);
            }
        }
    }

    /// Rents a buffer of the default size.
    pub fn rent_default(&self) -> Result<ComputeBuffer> {
        self.rent(self.shared.config.default_buffer_size)
    }

    /// Like [`rent`](Self::rent) but fails immediately at capacity.
    pub fn try_rent(&self, minimum_size: usize) -> Result<ComputeBuffer> {
        let taken = self.shared.try_take_all(&mut self.shared.state.lock(), &[minimum_size]);
        taken
            .map(|taken| self.lease(taken))
            .and_then(|mut rented| rented.pop())
            .ok_or(ComputeError::PoolExhausted {
                max_buffers: self.shared.config.max_buffers,
            })
    }

    /// Rents a buffer wrapped in a [`BufferScope`] that returns it on drop.
    pub fn scoped(&self, minimum_size: usize) -> Result<BufferScope<'_>> {
        Ok(BufferScope::new(self, self.rent(minimum_size)?))
    }

    /// [`rent_many`](Self::rent_many) with every buffer wrapped in a
    /// [`BufferScope`].
    pub fn scoped_many(&self, sizes: &[usize]) -> Result<Vec<BufferScope<'_>>> {
        Ok(self
            .rent_many(sizes)?
            .into_iter()
            .map(|buffer| BufferScope::new(self, buffer))
            .collect())
    }

    /// Takes a buffer back. Contents are zeroed on host and device.
    ///
    /// A buffer this pool did not rent out fails with
    /// [`ComputeError::InvalidBufferState`]. Dropping the rejected buffer
    /// sends it back to the pool that did rent it.
    pub fn return_buffer(&self, buffer: ComputeBuffer) -> Result<()> {
        if buffer.id.pool != self.shared.id {
            return Err(ComputeError::InvalidBufferState(format!(
                "buffer {} belongs to pool {}, not pool {}",
                buffer.id, buffer.id.pool, self.shared.id
            )));
        }
        self.shared.take_back(buffer, false)
    }

    /// Copies the host view of `buffer` to its device region.
    pub fn upload(&self, buffer: &ComputeBuffer) -> Result<()> {
        match (&self.shared.device, self.region(buffer)?) {
            (Some(device), Some(region)) => device.upload(region, &buffer.host),
            _ => Ok(()),
        }
    }

    /// Refreshes the host view of `buffer` from its device region.
    pub fn download(&self, buffer: &mut ComputeBuffer) -> Result<()> {
        match (&self.shared.device, self.region(buffer)?) {
            (Some(device), Some(region)) => device.download(region, &mut buffer.host),
            _ => Ok(()),
        }
    }

    /// Device region backing `buffer`, or `None` for pinned-host buffers.
    pub fn region(&self, buffer: &ComputeBuffer) -> Result<Option<DeviceRegion>> {
        if buffer.id.pool != self.shared.id {
            return Err(ComputeError::InvalidBufferState(format!(
                "buffer {} belongs to another pool",
                buffer.id
            )));
        }
        if buffer.residency == Residency::PinnedHost {
            return Ok(None);
        }
        self.shared
            .state
            .lock()
            .arena
            .get(&buffer.id.slot)
            .copied()
            .map(Some)
            .ok_or_else(|| {
                ComputeError::InvalidBufferState(format!("buffer {} has no device region", buffer.id))
            })
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            available_buffers: state.available.len(),
            rented_buffers: state.rented.len(),
            allocated_buffers: state.allocated_buffers,
            allocated_bytes: state.allocated_bytes,
            device_bytes: state.device_bytes,
            total_allocations: state.total_allocations,
            hits: state.hits,
            misses: state.misses,
            returns: state.returns,
            reclaimed: state.reclaimed,
            retired: state.retired,
        }
    }

    /// Ties freshly taken buffers to this pool. Must run outside the state
    /// lock: a leased buffer locks it again when dropped.
    fn lease(&self, taken: Vec<ComputeBuffer>) -> Vec<ComputeBuffer> {
        taken
            .into_iter()
            .map(|mut buffer| {
                buffer.lease = Some(Arc::downgrade(&self.shared));
                buffer
            })
            .collect()
    }
}

impl PoolShared {
    /// Takes one buffer per size, or none if the pool cannot cover all of
    /// them right now.
    fn try_take_all(&self, state: &mut PoolState, sizes: &[usize]) -> Option<Vec<ComputeBuffer>> {
        if state.rented.len() + sizes.len() > self.config.max_buffers {
            return None;
        }
        let mut taken = Vec::with_capacity(sizes.len());
        for &size in sizes {
            match self.try_take(state, size) {
                Some(buffer) => taken.push(buffer),
                None => {
                    for buffer in taken {
                        state.rented.remove(&buffer.id);
                        state.available.push_back(buffer);
                    }
                    return None;
                }
            }
        }
        Some(taken)
    }

    fn try_take(&self, state: &mut PoolState, minimum_size: usize) -> Option<ComputeBuffer> {
        let best = state
            .available
            .iter()
            .enumerate()
            .filter(|(_, b)| b.size_bytes >= minimum_size)
            .min_by_key(|(_, b)| b.size_bytes)
            .map(|(i, _)| i);
        if let Some(buffer) = best.and_then(|i| state.available.remove(i)) {
            state.hits += 1;
            state.rented.insert(buffer.id);
            trace!(pool = self.id, buffer = %buffer.id, size = buffer.size_bytes, "pool hit");
            return Some(buffer);
        }

        if state.rented.len() >= self.config.max_buffers {
            return None;
        }
        if state.allocated_buffers >= self.config.max_buffers {
            self.retire_smallest(state);
        }

        let size_bytes = minimum_size
            .max(self.config.default_buffer_size)
            .div_ceil(F32_BYTES)
            * F32_BYTES;
        let buffer = self.allocate(state, size_bytes);
        state.misses += 1;
        state.rented.insert(buffer.id);
        Some(buffer)
    }

    /// Moves a rented buffer back to the available set and wakes a waiter.
    fn take_back(&self, mut buffer: ComputeBuffer, reclaimed: bool) -> Result<()> {
        buffer.lease = None;
        let mut state = self.state.lock();
        if !state.rented.remove(&buffer.id) {
            return Err(ComputeError::InvalidBufferState(format!(
                "buffer {} is not currently rented",
                buffer.id
            )));
        }
        buffer.clear();
        if let (Some(device), Some(region)) = (&self.device, state.arena.get(&buffer.id.slot)) {
            if let Err(e) = device.zero(*region) {
                warn!(pool = self.id, buffer = %buffer.id, error = %e, "failed to zero device region");
            }
        }
        if reclaimed {
            state.reclaimed += 1;
        } else {
            state.returns += 1;
        }
        state.available.push_back(buffer);
        drop(state);
        self.slot_freed.notify_all();
        Ok(())
    }

    /// Called when a leased buffer is dropped without being returned.
    pub(crate) fn reclaim(&self, buffer: ComputeBuffer) {
        let id = buffer.id;
        match self.take_back(buffer, true) {
            Ok(()) => debug!(pool = self.id, buffer = %id, "rented buffer dropped, slot reclaimed"),
            Err(e) => warn!(pool = self.id, buffer = %id, error = %e, "could not reclaim dropped buffer"),
        }
    }

    fn retire_smallest(&self, state: &mut PoolState) {
        let smallest = state
            .available
            .iter()
            .enumerate()
            .min_by_key(|(_, b)| b.size_bytes)
            .map(|(i, _)| i);
        let Some(buffer) = smallest.and_then(|i| state.available.remove(i)) else {
            return;
        };
        if let Some(region) = state.arena.remove(&buffer.id.slot) {
            state.device_bytes -= buffer.size_bytes;
            if let Some(device) = &self.device {
                device.free(region);
            }
        }
        state.allocated_buffers -= 1;
        state.allocated_bytes -= buffer.size_bytes;
        state.retired += 1;
        debug!(pool = self.id, buffer = %buffer.id, size = buffer.size_bytes, "retired buffer");
    }

    fn allocate(&self, state: &mut PoolState, size_bytes: usize) -> ComputeBuffer {
        state.next_slot += 1;
        let id = BufferId {
            pool: self.id,
            slot: state.next_slot,
        };
        let within_budget = self
            .config
            .device_budget_bytes
            .is_none_or(|budget| state.device_bytes + size_bytes <= budget);

        let residency = match &self.device {
            Some(device) if within_budget => match device.allocate(size_bytes / F32_BYTES) {
                Ok(region) => {
                    state.arena.insert(id.slot, region);
                    state.device_bytes += size_bytes;
                    Residency::Device
                }
                Err(e) => {
                    debug!(pool = self.id, error = %e, "device allocation failed, using pinned host memory");
                    Residency::PinnedHost
                }
            },
            _ => Residency::PinnedHost,
        };

        state.allocated_buffers += 1;
        state.allocated_bytes += size_bytes;
        state.total_allocations += 1;
        debug!(pool = self.id, buffer = %id, size = size_bytes, ?residency, "allocated buffer");
        ComputeBuffer::new(id, size_bytes, residency)
    }
}

impl Drop for PoolShared {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(device) = &self.device {
            for (_, region) in state.arena.drain() {
                device.free(region);
            }
        }
        if !state.rented.is_empty() {
            warn!(pool = self.id, outstanding = state.rented.len(), "pool dropped with rented buffers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::reference::ReferenceAccelerator;

    fn small(max_buffers: usize) -> PoolConfig {
        PoolConfig {
            max_buffers,
            default_buffer_size: 64,
            rent_timeout: Duration::from_millis(20),
            device_budget_bytes: None,
        }
    }

    #[test]
    fn sizes_round_up_to_whole_elements() {
        let pool = MemoryPool::new(small(2), None);
        let buf = pool.rent(130).unwrap();
        assert_eq!(buf.size_bytes(), 132);
        assert_eq!(buf.len(), 33);
        pool.return_buffer(buf).unwrap();
    }

    #[test]
    fn try_rent_fails_fast_at_capacity() {
        let pool = MemoryPool::new(small(1), None);
        let held = pool.try_rent(8).unwrap();
        assert_eq!(
            pool.try_rent(8).unwrap_err(),
            ComputeError::PoolExhausted { max_buffers: 1 }
        );
        pool.return_buffer(held).unwrap();
    }

    #[test]
    fn foreign_buffer_is_rejected() {
        let a = MemoryPool::new(small(1), None);
        let b = MemoryPool::new(small(1), None);
        let buf = a.rent(8).unwrap();
        assert!(matches!(b.return_buffer(buf), Err(ComputeError::InvalidBufferState(_))));
    }

    #[test]
    fn too_small_buffer_is_retired_at_capacity() {
        let pool = MemoryPool::new(small(1), None);
        let buf = pool.rent(64).unwrap();
        pool.return_buffer(buf).unwrap();

        let big = pool.rent(256).unwrap();
        assert_eq!(big.size_bytes(), 256);
        let stats = pool.stats();
        assert_eq!(stats.retired, 1);
        assert_eq!(stats.allocated_buffers, 1);
        assert_eq!(stats.allocated_bytes, 256);
        pool.return_buffer(big).unwrap();
    }

    #[test]
    fn device_buffers_live_in_arena_until_drop() {
        let device = Arc::new(ReferenceAccelerator::new());
        {
            let pool = MemoryPool::new(small(2), Some(device.clone()));
            let buf = pool.rent(64).unwrap();
            assert_eq!(buf.residency(), Residency::Device);
            assert!(pool.region(&buf).unwrap().is_some());
            pool.return_buffer(buf).unwrap();
            assert_eq!(device.live_regions(), 1);
        }
        assert_eq!(device.live_regions(), 0);
    }

    #[test]
    fn failed_device_allocation_falls_back_to_host() {
        let device = Arc::new(ReferenceAccelerator::new());
        device.set_fail_allocations(true);
        let pool = MemoryPool::new(small(1), Some(device));
        let buf = pool.rent(64).unwrap();
        assert_eq!(buf.residency(), Residency::PinnedHost);
        assert_eq!(pool.region(&buf).unwrap(), None);
        pool.return_buffer(buf).unwrap();
    }

    #[test]
    fn device_budget_limits_residency() {
        let device = Arc::new(ReferenceAccelerator::new());
        let config = PoolConfig {
            device_budget_bytes: Some(64),
            ..small(2)
        };
        let pool = MemoryPool::new(config, Some(device));
        let first = pool.rent(64).unwrap();
        let second = pool.rent(64).unwrap();
        assert_eq!(first.residency(), Residency::Device);
        assert_eq!(second.residency(), Residency::PinnedHost);
        pool.return_buffer(first).unwrap();
        pool.return_buffer(second).unwrap();
    }
}
