//! Sufficient statistics for one aggregation group.
//!
//! An [`Accumulator`] stores `count`, `sum` and `sum_squares`; mean, variance
//! and standard deviation are derived on demand. [`Accumulator::combine`] is
//! associative and commutative with [`Accumulator::IDENTITY`] as its neutral
//! element, so partial accumulators can be reduced in any order.

use std::iter::Sum;
use std::ops::{Add, AddAssign};

/// Running `(count, sum, sum of squares)` over contributed samples.
///
/// Invariants: `sum_squares >= 0`, and `count == 0` implies both sums are 0.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Accumulator {
    count: u64,
    sum: f64,
    sum_squares: f64,
}

impl Accumulator {
    /// The neutral element of [`combine`](Self::combine).
    pub const IDENTITY: Accumulator = Accumulator {
        count: 0,
        sum: 0.0,
        sum_squares: 0.0,
    };

    /// An accumulator holding exactly one sample.
    pub fn sample(value: f64) -> Self {
        Self {
            count: 1,
            sum: value,
            sum_squares: value * value,
        }
    }

    /// Rebuild an accumulator from persisted raw fields.
    ///
    /// Returns `None` when the fields violate the invariants (negative sum of
    /// squares, non-finite values, or non-zero sums with a zero count).
    pub fn from_parts(count: u64, sum: f64, sum_squares: f64) -> Option<Self> {
        if !sum.is_finite() || !sum_squares.is_finite() || sum_squares < 0.0 {
            return None;
        }
        if count == 0 && (sum != 0.0 || sum_squares != 0.0) {
            return None;
        }
        Some(Self {
            count,
            sum,
            sum_squares,
        })
    }

    /// Rebuild an accumulator from the reporting form `(count, sum, stddev)`.
    ///
    /// `sum_squares = count * (stddev² + mean²)`, exact up to floating error.
    pub fn from_summary(count: u64, sum: f64, stddev: f64) -> Option<Self> {
        if count == 0 {
            return Self::from_parts(0, sum, 0.0);
        }
        if !stddev.is_finite() || stddev < 0.0 {
            return None;
        }
        let n = count as f64;
        let mean = sum / n;
        let sum_squares = n * (stddev * stddev + mean * mean);
        Self::from_parts(count, sum, sum_squares.max(0.0))
    }

    /// Associative, commutative merge of two accumulators.
    pub fn combine(self, other: Accumulator) -> Accumulator {
        Accumulator {
            count: self.count + other.count,
            sum: self.sum + other.sum,
            sum_squares: self.sum_squares + other.sum_squares,
        }
    }

    /// Fold one value in as exactly one sample.
    pub fn contribute(self, value: f64) -> Accumulator {
        self.combine(Accumulator::sample(value))
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    pub fn sum(&self) -> f64 {
        self.sum
    }

    pub fn sum_squares(&self) -> f64 {
        self.sum_squares
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// `true` when both sums are finite, i.e. the accumulator can be
    /// persisted and read back.
    pub fn is_finite(&self) -> bool {
        self.sum.is_finite() && self.sum_squares.is_finite()
    }

    /// `sum / count`, or `0.0` for an empty accumulator.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }

    /// Population variance, clamped at zero against cancellation error.
    pub fn variance(&self) -> f64 {
        if self.count <= 1 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum_squares / self.count as f64 - mean * mean).max(0.0)
    }

    pub fn stddev(&self) -> f64 {
        self.variance().sqrt()
    }

    /// Field-wise comparison with a relative tolerance on the float sums.
    pub fn approx_eq(&self, other: &Accumulator, tolerance: f64) -> bool {
        fn close(a: f64, b: f64, tol: f64) -> bool {
            let scale = a.abs().max(b.abs()).max(1.0);
            (a - b).abs() <= tol * scale
        }
        self.count == other.count
            && close(self.sum, other.sum, tolerance)
            && close(self.sum_squares, other.sum_squares, tolerance)
    }
}

impl Add for Accumulator {
    type Output = Accumulator;

    fn add(self, rhs: Accumulator) -> Accumulator {
        self.combine(rhs)
    }
}

impl AddAssign for Accumulator {
    fn add_assign(&mut self, rhs: Accumulator) {
        *self = self.combine(rhs);
    }
}

impl Sum for Accumulator {
    fn sum<I: Iterator<Item = Accumulator>>(iter: I) -> Accumulator {
        iter.fold(Accumulator::IDENTITY, Accumulator::combine)
    }
}

impl FromIterator<f64> for Accumulator {
    fn from_iter<I: IntoIterator<Item = f64>>(iter: I) -> Accumulator {
        iter.into_iter()
            .fold(Accumulator::IDENTITY, Accumulator::contribute)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const TOL: f64 = 1e-9;

    #[test]
    fn test_identity_is_default() {
        assert_eq!(Accumulator::default(), Accumulator::IDENTITY);
        assert!(Accumulator::IDENTITY.is_empty());
        assert_eq!(Accumulator::IDENTITY.mean(), 0.0);
        assert_eq!(Accumulator::IDENTITY.stddev(), 0.0);
    }

    #[test]
    fn test_sample() {
        let acc = Accumulator::sample(-3.0);
        assert_eq!(acc.count(), 1);
        assert_eq!(acc.sum(), -3.0);
        assert_eq!(acc.sum_squares(), 9.0);
        assert_eq!(acc.stddev(), 0.0);
    }

    #[test]
    fn test_two_file_consolidation_statistics() {
        // Two batch totals for the same key against an empty prior state.
        let acc = Accumulator::IDENTITY.contribute(150.5).contribute(80.0);

        assert_eq!(acc.count(), 2);
        assert!((acc.sum() - 230.5).abs() < TOL);
        assert!((acc.mean() - 115.25).abs() < TOL);
        assert!((acc.variance() - 1242.5625).abs() < 1e-6);
        assert!((acc.stddev() - 35.25).abs() < 1e-6);
    }

    #[test]
    fn test_variance_clamped_for_constant_samples() {
        let acc: Accumulator = std::iter::repeat(1e9 + 0.1).take(1000).collect();
        assert_eq!(acc.count(), 1000);
        assert!(acc.variance() >= 0.0);
        assert!(acc.stddev().is_finite());
    }

    #[test]
    fn test_from_parts_rejects_invariant_violations() {
        assert!(Accumulator::from_parts(0, 1.0, 0.0).is_none());
        assert!(Accumulator::from_parts(2, 1.0, -0.5).is_none());
        assert!(Accumulator::from_parts(2, f64::NAN, 1.0).is_none());
        assert!(Accumulator::from_parts(0, 0.0, 0.0).is_some());
        assert!(Accumulator::from_parts(3, -6.0, 14.0).is_some());
    }

    #[test]
    fn test_is_finite_catches_overflowing_squares() {
        assert!(Accumulator::sample(1e150).is_finite());
        assert!(!Accumulator::sample(1e200).is_finite());
        assert!(!Accumulator::sample(1e308).contribute(1e308).is_finite());
        assert!(Accumulator::IDENTITY.is_finite());
    }

    #[test]
    fn test_from_summary_reconstructs_sum_squares() {
        let original = Accumulator::IDENTITY
            .contribute(150.5)
            .contribute(80.0)
            .contribute(12.25);
        let rebuilt =
            Accumulator::from_summary(original.count(), original.sum(), original.stddev())
                .expect("valid summary");
        assert!(rebuilt.approx_eq(&original, TOL));
    }

    #[test]
    fn test_from_summary_empty_and_invalid() {
        assert_eq!(
            Accumulator::from_summary(0, 0.0, 0.0),
            Some(Accumulator::IDENTITY)
        );
        assert!(Accumulator::from_summary(2, 10.0, -1.0).is_none());
    }

    #[test]
    fn test_operators_match_combine() {
        let a = Accumulator::sample(1.0);
        let b = Accumulator::sample(2.0);
        let mut c = a;
        c += b;
        assert_eq!(a + b, a.combine(b));
        assert_eq!(c, a.combine(b));
        let total: Accumulator = vec![a, b, Accumulator::sample(3.0)].into_iter().sum();
        assert_eq!(total.count(), 3);
        assert_eq!(total.sum(), 6.0);
    }

    fn arb_accumulator() -> impl Strategy<Value = Accumulator> {
        proptest::collection::vec(-1.0e6f64..1.0e6, 0..20)
            .prop_map(|values| values.into_iter().collect::<Accumulator>())
    }

    proptest! {
        #[test]
        fn prop_combine_is_commutative(a in arb_accumulator(), b in arb_accumulator()) {
            prop_assert_eq!(a.combine(b), b.combine(a));
        }

        #[test]
        fn prop_combine_is_associative(
            a in arb_accumulator(),
            b in arb_accumulator(),
            c in arb_accumulator(),
        ) {
            let left = a.combine(b).combine(c);
            let right = a.combine(b.combine(c));
            prop_assert!(left.approx_eq(&right, 1e-6));
        }

        #[test]
        fn prop_identity_is_neutral(a in arb_accumulator()) {
            prop_assert_eq!(a.combine(Accumulator::IDENTITY), a);
            prop_assert_eq!(Accumulator::IDENTITY.combine(a), a);
        }

        #[test]
        fn prop_sequence_statistics(values in proptest::collection::vec(-1.0e4f64..1.0e4, 1..50)) {
            let acc: Accumulator = values.iter().copied().collect();
            let n = values.len() as f64;
            let sum: f64 = values.iter().sum();
            let sum_sq: f64 = values.iter().map(|v| v * v).sum();
            let mean = sum / n;
            let expected_std = if values.len() <= 1 {
                0.0
            } else {
                (sum_sq / n - mean * mean).max(0.0).sqrt()
            };

            prop_assert_eq!(acc.count(), values.len() as u64);
            prop_assert!((acc.sum() - sum).abs() <= 1e-6 * sum.abs().max(1.0));
            prop_assert!((acc.mean() - mean).abs() <= 1e-6 * mean.abs().max(1.0));
            prop_assert!((acc.stddev() - expected_std).abs() <= 1e-6 * expected_std.max(1.0));
        }
    }
}
