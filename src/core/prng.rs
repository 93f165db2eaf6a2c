// Seedable randomness for trial scheduling.
//
// Every stochastic choice the rig makes (class draws, debias noise, block
// lengths, quiet-window jitter, octave sampling) goes through a `TaskRng`, so a
// session replays exactly from its seed.

use rand::distributions::WeightedIndex;
use rand::prelude::*;
use rand::rngs::StdRng;
use rand_distr::{Exp, Normal};

#[derive(Debug, Clone)]
pub struct TaskRng {
    inner: StdRng,
}

impl TaskRng {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: StdRng::seed_from_u64(seed),
        }
    }

    pub fn from_entropy() -> Self {
        Self {
            inner: StdRng::from_entropy(),
        }
    }

    /// Derive an independent generator, e.g. for a worker thread.
    pub fn fork(&mut self) -> Self {
        Self::new(self.inner.gen())
    }

    #[inline]
    pub fn next_f64(&mut self) -> f64 {
        self.inner.gen()
    }

    /// `true` with probability `p`.
    #[inline]
    pub fn chance(&mut self, p: f64) -> bool {
        self.next_f64() < p
    }

    pub fn gauss(&mut self, mean: f64, sd: f64) -> f64 {
        match Normal::new(mean, sd) {
            Ok(dist) => dist.sample(&mut self.inner),
            Err(_) => mean,
        }
    }

    /// Exponential draw parameterised by its mean.
    pub fn exponential(&mut self, scale: f64) -> f64 {
        if scale <= 0.0 {
            return 0.0;
        }
        match Exp::new(1.0 / scale) {
            Ok(dist) => dist.sample(&mut self.inner),
            Err(_) => 0.0,
        }
    }

    /// Uniform integer in `[low, high)`.
    pub fn range_u32(&mut self, low: u32, high: u32) -> u32 {
        if high <= low {
            return low;
        }
        self.inner.gen_range(low..high)
    }

    pub fn index(&mut self, len: usize) -> usize {
        if len <= 1 {
            return 0;
        }
        self.inner.gen_range(0..len)
    }

    pub fn pick<'a, T>(&mut self, items: &'a [T]) -> Option<&'a T> {
        items.choose(&mut self.inner)
    }

    /// Index drawn proportionally to `weights`; `None` when all weights are zero.
    pub fn weighted(&mut self, weights: &[u32]) -> Option<usize> {
        WeightedIndex::new(weights)
            .ok()
            .map(|dist| dist.sample(&mut self.inner))
    }

    /// -1 or +1 with equal probability.
    pub fn sign(&mut self) -> i8 {
        if self.inner.gen::<bool>() {
            1
        } else {
            -1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_seed_same_stream() {
        let mut a = TaskRng::new(7);
        let mut b = TaskRng::new(7);
        for _ in 0..32 {
            assert_eq!(a.next_f64().to_bits(), b.next_f64().to_bits());
        }
        assert_eq!(a.gauss(0.0, 0.5).to_bits(), b.gauss(0.0, 0.5).to_bits());
    }

    #[test]
    fn range_and_weights_respect_bounds() {
        let mut rng = TaskRng::new(3);
        for _ in 0..500 {
            let v = rng.range_u32(30, 70);
            assert!((30..70).contains(&v));
            assert_ne!(rng.weighted(&[100, 0, 0]), Some(1));
        }
        assert_eq!(rng.weighted(&[0, 0, 0]), None);
        assert_eq!(rng.range_u32(5, 5), 5);
    }

    #[test]
    fn exponential_is_non_negative_and_zero_scale_is_zero() {
        let mut rng = TaskRng::new(11);
        assert_eq!(rng.exponential(0.0), 0.0);
        for _ in 0..200 {
            assert!(rng.exponential(0.35) >= 0.0);
        }
    }
}
