//! Minimal shaped tensors for the batch APIs.
//!
//! A [`Tensor<T>`] is a shape plus flat row-major data. The runtime only uses
//! it to carry operand dimensions alongside the numbers; all arithmetic goes
//! through slices.
//!
//! ```rust
//! use briny_compute::tensor;
//!
//! let t = tensor!([[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]]);
//! assert_eq!(t.shape, vec![2, 3]);
//! assert_eq!(t.dims2().unwrap(), (2, 3));
//! ```

use crate::error::{ComputeError, Result, ensure_shape, shape_len};

/// N-dimensional tensor with row-major data.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
}

impl<T> Tensor<T> {
    /// Creates a tensor.
    ///
    /// # Panics
    /// Panics if `data.len()` differs from the product of `shape`.
    pub fn new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Self {
        let shape = shape.into();
        assert_eq!(
            shape_len(&shape),
            Some(data.len()),
            "shape {:?} is incompatible with {} data elements",
            shape,
            data.len()
        );
        Self { shape, data }
    }

    /// Creates a tensor, failing with [`ComputeError::ShapeMismatch`] instead
    /// of panicking.
    pub fn try_new(shape: impl Into<Vec<usize>>, data: Vec<T>) -> Result<Self> {
        let shape = shape.into();
        ensure_shape(&shape, data.len())?;
        Ok(Self { shape, data })
    }

    /// Number of elements.
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// `(rows, cols)` of a rank-2 tensor.
    pub fn dims2(&self) -> Result<(usize, usize)> {
        match self.shape[..] {
            [r, c] => Ok((r, c)),
            _ => Err(ComputeError::ShapeMismatch {
                expected: 2,
                actual: self.shape.len(),
            }),
        }
    }

    /// `(d0, d1, d2)` of a rank-3 tensor.
    pub fn dims3(&self) -> Result<(usize, usize, usize)> {
        match self.shape[..] {
            [a, b, c] => Ok((a, b, c)),
            _ => Err(ComputeError::ShapeMismatch {
                expected: 3,
                actual: self.shape.len(),
            }),
        }
    }
}

impl<T: Clone + Default> Tensor<T> {
    /// Tensor of default values (zeros for numbers).
    pub fn zeros(shape: impl Into<Vec<usize>>) -> Self {
        let shape = shape.into();
        let len = shape.iter().product();
        Self {
            shape,
            data: vec![T::default(); len],
        }
    }
}

/// Builds a tensor from a nested array literal.
///
/// Rows must have matching shapes.
#[macro_export]
macro_rules! tensor {
    ($lit:literal) => {
        $crate::tensors::Tensor::new(Vec::<usize>::new(), vec![$lit])
    };

    ([ $( $inner:tt ),+ $(,)? ]) => {{
        let children = vec![ $( $crate::tensor!($inner) ),+ ];
        let first_shape = children[0].shape.clone();
        assert!(children.iter().all(|c| c.shape == first_shape),
            "ragged tensor literal (rows have mismatched shapes)");
        let mut shape = vec![children.len()];
        shape.extend_from_slice(&first_shape);
        let mut data = Vec::with_capacity(children.len() * children[0].data.len());
        for c in children { data.extend(c.data); }
        $crate::tensors::Tensor::new(shape, data)
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn try_new_rejects_bad_shape() {
        assert_eq!(
            Tensor::try_new(vec![2, 2], vec![1.0f32; 3]),
            Err(ComputeError::ShapeMismatch { expected: 4, actual: 3 })
        );
    }

    #[test]
    fn literal_builds_rank_three() {
        let t = tensor!([[[1.0f32, 2.0]], [[3.0, 4.0]]]);
        assert_eq!(t.dims3().unwrap(), (2, 1, 2));
        assert!(t.dims2().is_err());
    }
}
