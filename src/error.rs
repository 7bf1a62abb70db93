//! Error taxonomy for the compute runtime.
//!
//! Device-probe failures are expected (most hosts have no accelerator) and are
//! swallowed by [`crate::probe`]; everything else is returned to the caller as
//! an explicit [`ComputeError`].

use thiserror::Error;

/// Errors produced by the pool, the dispatch layer and the runtime façade.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
    /// Every pooled buffer stayed rented for the whole bounded wait.
    ///
    /// Recoverable: retry, or build the pool with a larger capacity.
    #[error("memory pool exhausted: all {max_buffers} buffers are rented")]
    PoolExhausted { max_buffers: usize },

    /// A buffer was returned twice, returned to the wrong pool, or used after
    /// its pool released it. Programming error; never retried.
    #[error("invalid buffer state: {0}")]
    InvalidBufferState(String),

    /// A device-only operation was requested with no device present and
    /// CPU fallback disabled.
    #[error("accelerator required: no compute device is available and CPU fallback is disabled")]
    AcceleratorRequired,

    /// Device information could not be queried.
    #[error("device query failed: {0}")]
    DeviceQueryFailed(String),

    /// Operand lengths disagree with each other or with the given dimensions.
    #[error("shape mismatch: expected {expected} elements, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    /// The accelerator rejected an allocation, transfer or kernel launch.
    #[error("device error: {0}")]
    Device(String),

    /// A batch operation observed its cancellation token between items.
    #[error("operation cancelled")]
    Cancelled,

    /// Options failed to load or validate.
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, ComputeError>;

/// Fails with [`ComputeError::ShapeMismatch`] unless `actual == expected`.
#[inline]
pub(crate) fn ensure_len(expected: usize, actual: usize) -> Result<()> {
    if expected == actual {
        Ok(())
    } else {
        Err(ComputeError::ShapeMismatch { expected, actual })
    }
}

/// Element count of a shape, or `None` if it does not fit in `usize`.
#[inline]
pub(crate) fn shape_len(dims: &[usize]) -> Option<usize> {
    dims.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
}

/// Like [`ensure_len`] with the expected length given as a shape. A shape
/// whose element count overflows `usize` never matches.
#[inline]
pub(crate) fn ensure_shape(dims: &[usize], actual: usize) -> Result<()> {
    ensure_len(shape_len(dims).unwrap_or(usize::MAX), actual)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhausted_reports_capacity() {
        let err = ComputeError::PoolExhausted { max_buffers: 4 };
        assert_eq!(err.to_string(), "memory pool exhausted: all 4 buffers are rented");
    }

    #[test]
    fn ensure_len_accepts_equal_lengths_only() {
        assert!(ensure_len(3, 3).is_ok());
        assert_eq!(
            ensure_len(3, 2),
            Err(ComputeError::ShapeMismatch { expected: 3, actual: 2 })
        );
    }

    #[test]
    fn overflowing_shape_is_a_mismatch() {
        assert_eq!(shape_len(&[2, 3, 4]), Some(24));
        assert_eq!(shape_len(&[usize::MAX, 2]), None);
        assert!(ensure_shape(&[4, 4], 16).is_ok());
        assert_eq!(
            ensure_shape(&[usize::MAX / 2, 3], 6),
            Err(ComputeError::ShapeMismatch { expected: usize::MAX, actual: 6 })
        );
    }
}
