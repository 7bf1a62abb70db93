//! Pooled buffer handle.

use core::fmt;
use std::sync::Weak;

use serde::Serialize;

use super::PoolShared;

/// Capability token naming one pooled buffer.
///
/// `pool` identifies the owning [`super::MemoryPool`]; `slot` indexes its
/// device arena. Callers never see the device handle itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct BufferId {
    pub pool: u64,
    pub slot: u64,
}

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pool, self.slot)
    }
}

/// Where a buffer's primary storage lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Residency {
    /// Device region with a host alias kept in sync by upload/download.
    Device,
    /// Host memory only; used when no device exists or allocation failed.
    PinnedHost,
}

/// A pooled `f32` region on loan from a [`super::MemoryPool`].
///
/// Move-only: the pool hands out exactly one value per rented slot, so a
/// buffer cannot be returned twice. Its size is fixed at allocation and
/// counts whole `f32` elements. Dropping a rented buffer hands it back to
/// its pool.
#[derive(Debug)]
pub struct ComputeBuffer {
    pub(crate) id: BufferId,
    pub(crate) size_bytes: usize,
    pub(crate) residency: Residency,
    pub(crate) host: Vec<f32>,
    /// Set while on loan.
    pub(super) lease: Option<Weak<PoolShared>>,
}

impl ComputeBuffer {
    pub(crate) fn new(id: BufferId, size_bytes: usize, residency: Residency) -> Self {
        Self {
            id,
            size_bytes,
            residency,
            host: vec![0.0; size_bytes / core::mem::size_of::<f32>()],
            lease: None,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn size_bytes(&self) -> usize {
        self.size_bytes
    }

    pub fn residency(&self) -> Residency {
        self.residency
    }

    /// Capacity in `f32` elements.
    pub fn len(&self) -> usize {
        self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    /// Host view of the buffer.
    pub fn as_slice(&self) -> &[f32] {
        &self.host
    }

    /// Mutable host view of the buffer.
    pub fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.host
    }

    /// Copies `data` into the host view starting at `offset`.
    ///
    /// Returns `false` without writing if it does not fit.
    pub fn write(&mut self, offset: usize, data: &[f32]) -> bool {
        match offset.checked_add(data.len()) {
            Some(end) if end <= self.host.len() => {
                self.host[offset..end].copy_from_slice(data);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn clear(&mut self) {
        self.host.fill(0.0);
    }
}

impl Drop for ComputeBuffer {
    fn drop(&mut self) {
        let Some(pool) = self.lease.take().and_then(|lease| lease.upgrade()) else {
            return;
        };
        pool.reclaim(ComputeBuffer {
            id: self.id,
            size_bytes: self.size_bytes,
            residency: self.residency,
            host: core::mem::take(&mut self.host),
            lease: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_rejects_overflow() {
        let mut buf = ComputeBuffer::new(BufferId { pool: 1, slot: 1 }, 16, Residency::PinnedHost);
        assert_eq!(buf.len(), 4);
        assert!(buf.write(2, &[1.0, 2.0]));
        assert!(!buf.write(3, &[1.0, 2.0]));
        assert_eq!(buf.as_slice(), &[0.0, 0.0, 1.0, 2.0]);
    }
}
