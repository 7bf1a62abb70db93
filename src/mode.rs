//! Compute mode service.
//!
//! [`ComputeModeService`] holds the process-wide `(mode, strategy)` policy,
//! the CPU fallback permission and live operation counters. Readers never
//! block: mode and strategy live in [`PolicyCell`]s and counters are atomics.
//! Writers serialize through a transition lock, and every committed mode
//! change is announced to subscribers as a [`ModeChanged`] event.
//!
//! # Offload decisions
//!
//! | mode          | strategy    | offloads                      | counter     |
//! |---------------|-------------|-------------------------------|-------------|
//! | `Cpu`         | any         | never                         | `cpu`       |
//! | `Gpu`/`Hybrid`| `Selective` | heavy operations only         | `offloaded` / `cpu` |
//! | `Gpu`         | `Full`      | always                        | `gpu`       |
//! | otherwise     |             | always (provisional)          | `offloaded` |
//!
//! Hybrid placement has no cost model yet and always offloads outside
//! `Selective`.
//!
//! Counters record where work was placed: an offload decision made while no
//! device can take the work is counted as `cpu`
//! (see [`ComputeModeService::place`]).
//!
//! # Events
//!
//! Mode changes are queued in commit order and delivered outside every lock,
//! so listeners may call back into the service. Concurrent `set_mode` calls
//! hand their events to whichever thread is already delivering; a listener
//! therefore always sees events in the order the changes were committed,
//! but `set_mode` may return before its own event has been delivered.

use core::fmt;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::backend::{ComputeMode, OffloadStrategy, PolicyCell};
use crate::config::ComputeOptions;
use crate::error::{ComputeError, Result};
use crate::probe::DeviceProbe;

/// Kinds of work, used by the `Selective` strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum OperationType {
    MatrixMultiply,
    Convolution,
    Pooling,
    EmbeddingGeneration,
    VectorSearch,
    ModelInference,
    BatchProcessing,
    ContentValidation,
    ContentHashing,
}

impl OperationType {
    pub const ALL: [OperationType; 9] = [
        Self::MatrixMultiply,
        Self::Convolution,
        Self::Pooling,
        Self::EmbeddingGeneration,
        Self::VectorSearch,
        Self::ModelInference,
        Self::BatchProcessing,
        Self::ContentValidation,
        Self::ContentHashing,
    ];

    /// Whether `Selective` offloads this kind.
    pub fn is_heavy(self) -> bool {
        matches!(
            self,
            Self::MatrixMultiply
                | Self::Convolution
                | Self::EmbeddingGeneration
                | Self::ModelInference
                | Self::BatchProcessing
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::MatrixMultiply => "matrix_multiply",
            Self::Convolution => "convolution",
            Self::Pooling => "pooling",
            Self::EmbeddingGeneration => "embedding_generation",
            Self::VectorSearch => "vector_search",
            Self::ModelInference => "model_inference",
            Self::BatchProcessing => "batch_processing",
            Self::ContentValidation => "content_validation",
            Self::ContentHashing => "content_hashing",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A committed mode transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModeChanged {
    pub previous: ComputeMode,
    pub current: ComputeMode,
    pub changed_at: SystemTime,
}

/// Handle returned by [`ComputeModeService::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&ModeChanged) + Send + Sync>;

/// Snapshot of the service counters and policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ComputeStatistics {
    pub total_operations: u64,
    pub gpu_operations: u64,
    pub cpu_operations: u64,
    pub offloaded_operations: u64,
    pub mode: ComputeMode,
    pub strategy: OffloadStrategy,
    pub last_mode_change: SystemTime,
    pub fallback_enabled: bool,
    pub device_available: bool,
}

#[derive(Debug, Default)]
struct Delivery {
    pending: VecDeque<ModeChanged>,
    active: bool,
}

/// Clears `Delivery::active` if a listener panics mid-delivery.
struct Dispatching<'a> {
    delivery: &'a Mutex<Delivery>,
    armed: bool,
}

impl Drop for Dispatching<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.delivery.lock().active = false;
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    total: AtomicU64,
    gpu: AtomicU64,
    cpu: AtomicU64,
    offloaded: AtomicU64,
}

/// Process-wide compute policy. See the [module docs](self).
pub struct ComputeModeService {
    mode: PolicyCell<ComputeMode>,
    strategy: PolicyCell<OffloadStrategy>,
    fallback: AtomicBool,
    transition: Mutex<()>,
    last_change_ms: AtomicU64,
    counters: Counters,
    probe: Arc<DeviceProbe>,
    listeners: RwLock<Vec<(SubscriptionId, Listener)>>,
    next_subscription: AtomicU64,
    delivery: Mutex<Delivery>,
}

impl fmt::Debug for ComputeModeService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeModeService")
            .field("mode", &self.mode())
            .field("strategy", &self.strategy())
            .field("fallback", &self.fallback_enabled())
            .field("listeners", &self.listeners.read().len())
            .finish()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as u64)
}

impl ComputeModeService {
    /// Builds the service from `options`.
    ///
    /// Asking for `Gpu` mode without a device fails with
    /// [`ComputeError::AcceleratorRequired`] when fallback is disabled and
    /// starts in `Cpu` mode otherwise.
    pub fn new(options: &ComputeOptions, probe: Arc<DeviceProbe>) -> Result<Self> {
        let mut mode = options.mode;
        if mode == ComputeMode::Gpu && !probe.is_available() {
            if !options.enable_fallback {
                return Err(ComputeError::AcceleratorRequired);
            }
            warn!("no compute device available, starting in CPU mode");
            mode = ComputeMode::Cpu;
        }
        info!(?mode, strategy = ?options.strategy, fallback = options.enable_fallback, "compute mode service ready");
        Ok(Self {
            mode: PolicyCell::new(mode),
            strategy: PolicyCell::new(options.strategy),
            fallback: AtomicBool::new(options.enable_fallback),
            transition: Mutex::new(()),
            last_change_ms: AtomicU64::new(now_ms()),
            counters: Counters::default(),
            probe,
            listeners: RwLock::new(Vec::new()),
            next_subscription: AtomicU64::new(1),
            delivery: Mutex::new(Delivery::default()),
        })
    }

    pub fn mode(&self) -> ComputeMode {
        self.mode.get()
    }

    pub fn strategy(&self) -> OffloadStrategy {
        self.strategy.get()
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback.load(Ordering::Acquire)
    }

    pub fn set_fallback_enabled(&self, enabled: bool) {
        self.fallback.store(enabled, Ordering::Release);
    }

    pub fn device_available(&self) -> bool {
        self.probe.is_available()
    }

    /// Switches mode.
    ///
    /// Returns `true` on success, including when `mode` is already current (no
    /// event is emitted then). Returns `false` without changing anything when
    /// `Gpu` is requested and no device exists.
    pub fn set_mode(&self, mode: ComputeMode) -> bool {
        {
            let _guard = self.transition.lock();
            let previous = self.mode.get();
            if previous == mode {
                return true;
            }
            if mode == ComputeMode::Gpu && !self.probe.is_available() {
                warn!(?previous, "refusing GPU mode: no compute device available");
                return false;
            }
            self.mode.replace(mode);
            let changed_at = SystemTime::now();
            self.last_change_ms.store(
                changed_at
                    .duration_since(UNIX_EPOCH)
                    .map_or(0, |d| d.as_millis() as u64),
                Ordering::Release,
            );
            info!(?previous, current = ?mode, "compute mode changed");
            self.delivery.lock().pending.push_back(ModeChanged {
                previous,
                current: mode,
                changed_at,
            });
        }
        self.deliver();
        true
    }

    /// Switches offload strategy. Always succeeds.
    pub fn set_strategy(&self, strategy: OffloadStrategy) {
        let _guard = self.transition.lock();
        let previous = self.strategy.replace(strategy);
        if previous != strategy {
            debug!(?previous, current = ?strategy, "offload strategy changed");
        }
    }

    /// Decides whether `op` should run on the accelerator, counting the
    /// decision.
    pub fn should_offload(&self, op: OperationType) -> bool {
        self.place(op, true)
    }

    /// Like [`should_offload`](Self::should_offload) for a caller that may
    /// have no device to offload to. Without one the work is counted as
    /// `cpu` and `false` is returned.
    pub fn place(&self, op: OperationType, device_present: bool) -> bool {
        let c = &self.counters;
        c.total.fetch_add(1, Ordering::Relaxed);
        let (offload, counter) = match (self.mode(), self.strategy()) {
            (ComputeMode::Cpu, _) => (false, &c.cpu),
            (_, OffloadStrategy::Selective) if op.is_heavy() => (true, &c.offloaded),
            (_, OffloadStrategy::Selective) => (false, &c.cpu),
            (ComputeMode::Gpu, OffloadStrategy::Full) => (true, &c.gpu),
            _ => (true, &c.offloaded),
        };
        if offload && !device_present {
            c.cpu.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        counter.fetch_add(1, Ordering::Relaxed);
        offload
    }

    /// Registers `listener` for mode changes.
    ///
    /// Listeners run outside the service's locks, one event at a time in
    /// commit order. See the [module docs](self#events).
    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&ModeChanged) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, Arc::new(listener)));
        id
    }

    /// Removes a listener. Returns whether it was registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    pub fn statistics(&self) -> ComputeStatistics {
        let c = &self.counters;
        ComputeStatistics {
            total_operations: c.total.load(Ordering::Relaxed),
            gpu_operations: c.gpu.load(Ordering::Relaxed),
            cpu_operations: c.cpu.load(Ordering::Relaxed),
            offloaded_operations: c.offloaded.load(Ordering::Relaxed),
            mode: self.mode(),
            strategy: self.strategy(),
            last_mode_change: UNIX_EPOCH + Duration::from_millis(self.last_change_ms.load(Ordering::Acquire)),
            fallback_enabled: self.fallback_enabled(),
            device_available: self.device_available(),
        }
    }

    /// Delivers queued events unless another call is already doing so.
    fn deliver(&self) {
        {
            let mut delivery = self.delivery.lock();
            if delivery.active {
                return;
            }
            delivery.active = true;
        }
        let mut dispatching = Dispatching {
            delivery: &self.delivery,
            armed: true,
        };
        loop {
            let event = {
                let mut delivery = self.delivery.lock();
                match delivery.pending.pop_front() {
                    Some(event) => event,
                    None => {
                        delivery.active = false;
                        dispatching.armed = false;
                        return;
                    }
                }
            };
            self.notify(&event);
        }
    }

    fn notify(&self, event: &ModeChanged) {
        let listeners: Vec<Listener> = self.listeners.read().iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(event);
        }
    }
}
