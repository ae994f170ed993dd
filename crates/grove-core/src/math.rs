//! Small numerical helpers.

use num_traits::Float;

/// Compensated (Kahan) summation.
///
/// Used when reducing over large spatial extents, where naive accumulation
/// loses low-order bits.
#[derive(Debug, Clone, Copy)]
pub struct KahanSum<T> {
    sum: T,
    correction: T,
}

impl<T: Float> KahanSum<T> {
    pub fn new() -> Self {
        Self {
            sum: T::zero(),
            correction: T::zero(),
        }
    }

    pub fn add(&mut self, term: T) {
        let term = term + self.correction;
        let next_sum = self.sum + term;
        self.correction = term - (next_sum - self.sum);
        self.sum = next_sum;
    }

    pub fn value(&self) -> T {
        self.sum
    }
}

impl<T: Float> Default for KahanSum<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kahan_sum_matches_exact_sum_on_small_input() {
        let mut acc = KahanSum::new();
        for v in [1.0f64, 2.0, 3.0, 4.0] {
            acc.add(v);
        }
        assert_eq!(acc.value(), 10.0);
    }

    #[test]
    fn kahan_sum_recovers_bits_naive_sum_loses() {
        // Adding many tiny terms to a large value: naive f32 summation
        // drops them all, compensated summation keeps them.
        let mut naive = 1.0e8f32;
        let mut acc = KahanSum::new();
        acc.add(1.0e8);
        for _ in 0..10_000 {
            naive += 1.0e-1;
            acc.add(1.0e-1);
        }
        let exact = 1.0e8f32 + 1.0e3;
        assert!((acc.value() - exact).abs() < 1.0);
        assert!((naive - exact).abs() > (acc.value() - exact).abs());
    }
}
