//! Random-number source owned by one engine.
//!
//! Every engine consumes its generator in a fixed order per event (waiting
//! time first, then one uniform per tree level, then any draws made while
//! applying the event), so a trajectory is fully reproducible from its seed.

use rand::Rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

#[derive(Clone, Debug)]
pub struct SimRng {
    inner: ChaCha8Rng,
}

impl SimRng {
    pub fn seed_from_u64(seed: u64) -> Self {
        Self {
            inner: ChaCha8Rng::seed_from_u64(seed),
        }
    }

    /// Generator for one replicate trajectory, decorrelated from the base
    /// seed by SplitMix64 mixing.
    pub fn for_trajectory(seed: Option<u64>, trajectory: u64) -> Self {
        Self::seed_from_u64(derive_seed(seed, trajectory))
    }

    /// Uniform draw on `[0, 1)`.
    #[inline]
    pub fn uniform01(&mut self) -> f64 {
        self.inner.gen::<f64>()
    }

    /// Exponential waiting time with the given rate, drawn from `U(0, 1]`
    /// so the logarithm is always finite.
    #[inline]
    pub fn exponential(&mut self, rate: f64) -> f64 {
        debug_assert!(rate > 0.0);
        let u = 1.0 - self.uniform01();
        -u.ln() / rate
    }
}

fn derive_seed(seed: Option<u64>, trajectory: u64) -> u64 {
    const GOLDEN_GAMMA: u64 = 0x9E3779B97F4A7C15;
    let base = seed.unwrap_or(0xDEADBEEFCAFEBABE);
    let z = base ^ (trajectory.wrapping_mul(GOLDEN_GAMMA));
    // SplitMix64
    let mut result = z.wrapping_add(GOLDEN_GAMMA);
    result = (result ^ (result >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
    result = (result ^ (result >> 27)).wrapping_mul(0x94D049BB133111EB);
    result ^ (result >> 31)
}

#[cfg(test)]
pub(crate) fn derive_seed_for_test(seed: Option<u64>, trajectory: u64) -> u64 {
    derive_seed(seed, trajectory)
}
