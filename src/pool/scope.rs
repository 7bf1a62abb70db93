//! Scoped buffer acquisition.
//!
//! A [`BufferScope`] borrows its pool and returns the buffer when dropped, so
//! early returns, `?` and panics all give the slot back.

use core::ops::{Deref, DerefMut};

use tracing::warn;

use super::{ComputeBuffer, MemoryPool};
use crate::device::DeviceRegion;
use crate::error::{ComputeError, Result};

/// A rented buffer that goes back to its pool on drop.
#[derive(Debug)]
pub struct BufferScope<'p> {
    pool: &'p MemoryPool,
    /// `None` only once `release` or `drop` has taken it.
    buffer: Option<ComputeBuffer>,
}

impl<'p> BufferScope<'p> {
    pub(crate) fn new(pool: &'p MemoryPool, buffer: ComputeBuffer) -> Self {
        Self {
            pool,
            buffer: Some(buffer),
        }
    }

    fn buffer(&self) -> Result<&ComputeBuffer> {
        self.buffer
            .as_ref()
            .ok_or_else(|| ComputeError::InvalidBufferState("scope already released".into()))
    }

    /// Copies the host view to the device.
    pub fn upload(&self) -> Result<()> {
        self.pool.upload(self.buffer()?)
    }

    /// Refreshes the host view from the device.
    pub fn download(&mut self) -> Result<()> {
        match self.buffer.as_mut() {
            Some(buffer) => self.pool.download(buffer),
            None => Err(ComputeError::InvalidBufferState("scope already released".into())),
        }
    }

    /// Device region behind this buffer, if device resident.
    pub fn region(&self) -> Result<Option<DeviceRegion>> {
        self.pool.region(self.buffer()?)
    }

    /// Returns the buffer now, reporting any failure instead of logging it.
    pub fn release(mut self) -> Result<()> {
        match self.buffer.take() {
            Some(buffer) => self.pool.return_buffer(buffer),
            None => Ok(()),
        }
    }
}

/// Host view of the scoped buffer.
impl Deref for BufferScope<'_> {
    type Target = [f32];

    fn deref(&self) -> &[f32] {
        match &self.buffer {
            Some(buffer) => buffer.as_slice(),
            None => &[],
        }
    }
}

impl DerefMut for BufferScope<'_> {
    fn deref_mut(&mut self) -> &mut [f32] {
        match &mut self.buffer {
            Some(buffer) => buffer.as_mut_slice(),
            None => &mut [],
        }
    }
}

impl Drop for BufferScope<'_> {
    fn drop(&mut self) {
        let Some(buffer) = self.buffer.take() else {
            return;
        };
        let id = buffer.id();
        if let Err(e) = self.pool.return_buffer(buffer) {
            warn!(buffer = %id, error = %e, "failed to return scoped buffer");
        }
    }
}
