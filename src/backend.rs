//! Compute policy enumerations.
//!
//! This module defines the process-wide policy values that decide where an
//! operation runs:
//!
//! - [`ComputeMode`]: `Gpu`, `Cpu` or `Hybrid`.
//! - [`OffloadStrategy`]: `Full`, `Selective` or `Local` granularity.
//! - [`ExecutionPath`]: where a single call actually ran.
//!
//! Policy values are stored in a [`PolicyCell`], an `AtomicU8` wrapper, so
//! readers never block and never observe a torn value while a writer switches
//! modes.

use core::convert::TryFrom;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU8, Ordering};
use serde::{Deserialize, Serialize};

/// Process-wide compute mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum ComputeMode {
    /// Prefer the accelerator for every operation the strategy allows.
    #[default]
    Gpu = 0,
    /// Never offload.
    Cpu = 1,
    /// Mix of both; placement is decided per operation.
    Hybrid = 2,
}

impl TryFrom<u8> for ComputeMode {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Gpu),
            1 => Ok(Self::Cpu),
            2 => Ok(Self::Hybrid),
            _ => Err(()),
        }
    }
}

impl From<ComputeMode> for u8 {
    fn from(mode: ComputeMode) -> Self {
        mode as u8
    }
}

/// Granularity rule deciding which operation kinds are offloaded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum OffloadStrategy {
    /// Offload everything.
    #[default]
    Full = 0,
    /// Offload only heavy operation kinds.
    Selective = 1,
    /// Keep work local unless the mode insists otherwise.
    Local = 2,
}

impl TryFrom<u8> for OffloadStrategy {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Full),
            1 => Ok(Self::Selective),
            2 => Ok(Self::Local),
            _ => Err(()),
        }
    }
}

impl From<OffloadStrategy> for u8 {
    fn from(strategy: OffloadStrategy) -> Self {
        strategy as u8
    }
}

/// Where a single operation was executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ExecutionPath {
    /// Accelerator kernels over pooled device buffers.
    Device,
    /// Portable SIMD routines over host slices.
    Cpu,
}

/// Lock-free storage for a `u8`-backed policy enum.
///
/// Stores use `Release` and loads use `Acquire`, so a reader sees either the
/// previous or the newly committed value. An invalid byte (never written by
/// this type) decodes to the enum's default.
#[derive(Debug)]
pub struct PolicyCell<T> {
    raw: AtomicU8,
    _kind: PhantomData<T>,
}

impl<T> PolicyCell<T>
where
    T: Copy + Default + Into<u8> + TryFrom<u8>,
{
    /// Creates a cell holding `value`.
    pub fn new(value: T) -> Self {
        Self {
            raw: AtomicU8::new(value.into()),
            _kind: PhantomData,
        }
    }

    /// Returns the current value.
    pub fn get(&self) -> T {
        T::try_from(self.raw.load(Ordering::Acquire)).unwrap_or_default()
    }

    /// Replaces the value, returning the previous one.
    pub fn replace(&self, value: T) -> T {
        T::try_from(self.raw.swap(value.into(), Ordering::AcqRel)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_u8() {
        for mode in [ComputeMode::Gpu, ComputeMode::Cpu, ComputeMode::Hybrid] {
            assert_eq!(ComputeMode::try_from(u8::from(mode)), Ok(mode));
        }
        assert!(ComputeMode::try_from(7).is_err());
    }

    #[test]
    fn policy_cell_replace_returns_previous() {
        let cell = PolicyCell::new(OffloadStrategy::Full);
        assert_eq!(cell.replace(OffloadStrategy::Selective), OffloadStrategy::Full);
        assert_eq!(cell.get(), OffloadStrategy::Selective);
    }
}
