//! Tolerance checks for comparing results across execution paths.
//!
//! Device kernels and the host path accumulate in different orders, so their
//! outputs agree only within a tolerance. Errors are measured relative to the
//! larger magnitude, with magnitudes below 1 treated as 1 so values near zero
//! are compared absolutely.

/// Worst error still counted as equal.
pub const F32_MAX_ERROR: f32 = 1e-3;

/// Typical error between two correct reductions.
pub const F32_AVG_ERROR: f32 = 1e-4;

/// Error at the level of `f32` rounding.
pub const F32_MIN_ERROR: f32 = 1e-6;

/// How close two values are.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ApproxEquality {
    /// Within `F32_MIN_ERROR`.
    Precise = 0,
    /// Within `F32_AVG_ERROR`.
    Partial = 1,
    /// Within `F32_MAX_ERROR`.
    Relative = 2,
    /// Not equal.
    Scarce = 3,
}

impl ApproxEquality {
    fn rate(error: f64) -> Self {
        if error < F32_MIN_ERROR as f64 {
            Self::Precise
        } else if error < F32_AVG_ERROR as f64 {
            Self::Partial
        } else if error < F32_MAX_ERROR as f64 {
            Self::Relative
        } else {
            Self::Scarce
        }
    }
}

/// `|a - b| / max(|a|, |b|, 1)`. Two NaNs are equal; one NaN is infinitely far.
pub fn relative_error(a: f64, b: f64) -> f64 {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => 0.0,
        (false, false) if a == b => 0.0,
        (false, false) => (a - b).abs() / a.abs().max(b.abs()).max(1.0),
        _ => f64::INFINITY,
    }
}

/// Rates how close `self` is to `rhs`.
pub trait RelativeEq<Rhs: ?Sized> {
    fn approx_eq(&self, rhs: &Rhs) -> ApproxEquality;
}

impl RelativeEq<Self> for f32 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        ApproxEquality::rate(relative_error(*self as f64, *rhs as f64))
    }
}

impl RelativeEq<Self> for f64 {
    fn approx_eq(&self, rhs: &Self) -> ApproxEquality {
        ApproxEquality::rate(relative_error(*self, *rhs))
    }
}

/// The worst rating over all element pairs; slices of different length are
/// never equal.
impl<T: RelativeEq<U>, U> RelativeEq<[U]> for [T] {
    fn approx_eq(&self, rhs: &[U]) -> ApproxEquality {
        if self.len() != rhs.len() {
            return ApproxEquality::Scarce;
        }
        let mut worst = ApproxEquality::Precise;
        for (a, b) in self.iter().zip(rhs) {
            worst = worst.max(a.approx_eq(b));
            if worst == ApproxEquality::Scarce {
                break;
            }
        }
        worst
    }
}

/// Whether `a` and `b` agree within `F32_MAX_ERROR`.
pub fn approx_eq<A: RelativeEq<B> + ?Sized, B: ?Sized>(a: &A, b: &B) -> bool {
    a.approx_eq(b) != ApproxEquality::Scarce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn small_values_compare_absolutely() {
        assert_eq!(1e-9f32.approx_eq(&0.0), ApproxEquality::Precise);
        assert_eq!(0.01f32.approx_eq(&0.0), ApproxEquality::Scarce);
    }

    #[test]
    fn large_values_compare_relatively() {
        assert!(approx_eq(&1_000_000.0f32, &1_000_050.0f32));
        assert!(!approx_eq(&1_000_000.0f32, &1_010_000.0f32));
    }

    #[test]
    fn slices_take_worst_rating() {
        let a = [1.0f32, 2.0, 3.0];
        let b = [1.0f32, 2.00005, 3.0];
        assert_eq!(a[..].approx_eq(&b[..]), ApproxEquality::Partial);
        assert!(!approx_eq(&a[..], &b[..2]));
    }

    #[test]
    fn nan_matches_only_nan() {
        assert!(approx_eq(&f32::NAN, &f32::NAN));
        assert!(!approx_eq(&f32::NAN, &0.0f32));
    }
}
