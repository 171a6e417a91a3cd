//! The control surface shared by both engines.

use std::path::Path;

use crate::error::{SimError, SimResult};

/// Avogadro's number, molecules per mole.
pub const AVOGADRO: f64 = 6.022_141_79e23;

/// Pool flag: the count is held fixed; event writes are suppressed while
/// propensities are still computed as if the writes succeeded.
pub(crate) const CLAMPED: u32 = 0x1;

/// Applies one species delta to a pool, honouring the clamp flag.
#[inline]
pub(crate) fn apply_delta(pools: &mut [u32], flags: &[u32], spec: usize, delta: i32) {
    if flags[spec] & CLAMPED != 0 {
        return;
    }
    let next = pools[spec] as i64 + delta as i64;
    debug_assert!(next >= 0, "population underflow");
    pools[spec] = next.max(0) as u32;
}

/// Rate-constant/volume term of a mass-action propensity: `kcst` scaled by
/// `(N_A · measure)^(order - 1)`, where the measure is the hosting volume
/// (or area, for surface-only reactions).
#[inline]
pub(crate) fn scaled_ccst(kcst: f64, measure: f64, order: u32) -> f64 {
    let scale = AVOGADRO * measure;
    kcst * scale.powi(1 - order as i32)
}

/// Validates a molecule-count target before it is rounded into a pool.
pub(crate) fn check_count(n: f64) -> SimResult<()> {
    if !(n >= 0.0) || !n.is_finite() {
        return Err(SimError::arg(format!(
            "molecule count must be finite and non-negative, got {n}"
        )));
    }
    if n > u32::MAX as f64 {
        return Err(SimError::arg(format!("molecule count {n} exceeds the pool limit")));
    }
    Ok(())
}

/// Rounds a fractional molecule target to an integer count: the integer
/// part plus a Bernoulli draw on the fractional part.
#[inline]
pub(crate) fn round_count(n: f64, rng: &mut crate::rng::SimRng) -> u32 {
    let n_int = n.floor();
    let n_frc = n - n_int;
    let mut c = n_int as u32;
    if n_frc > 0.0 && rng.uniform01() < n_frc {
        c += 1;
    }
    c
}

/// Operations every engine exposes. All indices are global (model-level);
/// species, reactions and diffusion rules that are not mapped into the
/// addressed compartment or patch read as zero and ignore writes, while
/// out-of-range indices fail with [`SimError::InvalidArgument`].
pub trait Solver {
    fn solver_name(&self) -> &'static str;
    fn solver_desc(&self) -> &'static str;

    /// Returns populations, flags, extents, propensities, the clock and the
    /// step counter to their initial state. The object graph is untouched.
    fn reset(&mut self);

    /// Advances the state to `endtime`, executing every event that fires
    /// before it. Fails if `endtime` lies in the past.
    fn run(&mut self, endtime: f64) -> SimResult<()>;

    /// Executes exactly one event; a no-op while the total propensity is
    /// zero.
    fn step(&mut self);

    fn time(&self) -> f64;
    fn nsteps(&self) -> u64;

    /// Sum of all kinetic-process propensities; the inter-event waiting
    /// time is exponential with mean `1 / a0`.
    fn a0(&self) -> f64;

    /// Checkpointing is absent in this build.
    fn save_state(&mut self, _path: &Path) -> SimResult<()> {
        Err(SimError::NotImplemented("state checkpointing"))
    }

    // Compartments.

    fn comp_vol(&self, cidx: usize) -> SimResult<f64>;
    fn comp_count(&self, cidx: usize, sidx: usize) -> SimResult<f64>;
    fn set_comp_count(&mut self, cidx: usize, sidx: usize, n: f64) -> SimResult<()>;
    fn comp_clamped(&self, cidx: usize, sidx: usize) -> SimResult<bool>;
    fn set_comp_clamped(&mut self, cidx: usize, sidx: usize, clamp: bool) -> SimResult<()>;

    fn comp_amount(&self, cidx: usize, sidx: usize) -> SimResult<f64> {
        Ok(self.comp_count(cidx, sidx)? / AVOGADRO)
    }

    fn set_comp_amount(&mut self, cidx: usize, sidx: usize, amount: f64) -> SimResult<()> {
        if !(amount >= 0.0) {
            return Err(SimError::arg(format!("amount must be non-negative, got {amount}")));
        }
        self.set_comp_count(cidx, sidx, amount * AVOGADRO)
    }

    /// Molar concentration: count / (10^3 · V · N_A).
    fn comp_conc(&self, cidx: usize, sidx: usize) -> SimResult<f64> {
        let count = self.comp_count(cidx, sidx)?;
        Ok(count / (1.0e3 * self.comp_vol(cidx)? * AVOGADRO))
    }

    fn set_comp_conc(&mut self, cidx: usize, sidx: usize, conc: f64) -> SimResult<()> {
        if !(conc >= 0.0) {
            return Err(SimError::arg(format!("concentration must be non-negative, got {conc}")));
        }
        let count = conc * 1.0e3 * self.comp_vol(cidx)? * AVOGADRO;
        self.set_comp_count(cidx, sidx, count)
    }

    fn comp_reac_k(&self, _cidx: usize, _ridx: usize) -> SimResult<f64> {
        Err(SimError::NotImplemented("reaction rate-constant access"))
    }

    fn set_comp_reac_k(&mut self, _cidx: usize, _ridx: usize, _kcst: f64) -> SimResult<()> {
        Err(SimError::NotImplemented("reaction rate-constant override"))
    }

    fn comp_reac_active(&self, cidx: usize, ridx: usize) -> SimResult<bool>;
    fn set_comp_reac_active(&mut self, cidx: usize, ridx: usize, active: bool) -> SimResult<()>;

    /// Combinatorial reactant term at current populations, summed over the
    /// compartment's elements.
    fn comp_reac_h(&self, cidx: usize, ridx: usize) -> SimResult<f64>;
    /// Rate-constant/volume term, volume-averaged over the compartment's
    /// elements.
    fn comp_reac_c(&self, cidx: usize, ridx: usize) -> SimResult<f64>;
    /// Current propensity of the reaction over the whole compartment.
    fn comp_reac_a(&self, cidx: usize, ridx: usize) -> SimResult<f64>;
    fn comp_reac_extent(&self, cidx: usize, ridx: usize) -> SimResult<u64>;
    fn reset_comp_reac_extent(&mut self, cidx: usize, ridx: usize) -> SimResult<()>;

    // Patches.

    fn patch_area(&self, pidx: usize) -> SimResult<f64>;
    fn patch_count(&self, pidx: usize, sidx: usize) -> SimResult<f64>;
    fn set_patch_count(&mut self, pidx: usize, sidx: usize, n: f64) -> SimResult<()>;
    fn patch_clamped(&self, pidx: usize, sidx: usize) -> SimResult<bool>;
    fn set_patch_clamped(&mut self, pidx: usize, sidx: usize, clamp: bool) -> SimResult<()>;

    fn patch_amount(&self, pidx: usize, sidx: usize) -> SimResult<f64> {
        Ok(self.patch_count(pidx, sidx)? / AVOGADRO)
    }

    fn set_patch_amount(&mut self, pidx: usize, sidx: usize, amount: f64) -> SimResult<()> {
        if !(amount >= 0.0) {
            return Err(SimError::arg(format!("amount must be non-negative, got {amount}")));
        }
        self.set_patch_count(pidx, sidx, amount * AVOGADRO)
    }

    fn patch_sreac_k(&self, _pidx: usize, _ridx: usize) -> SimResult<f64> {
        Err(SimError::NotImplemented("surface-reaction rate-constant access"))
    }

    fn set_patch_sreac_k(&mut self, _pidx: usize, _ridx: usize, _kcst: f64) -> SimResult<()> {
        Err(SimError::NotImplemented("surface-reaction rate-constant override"))
    }

    fn patch_sreac_active(&self, pidx: usize, ridx: usize) -> SimResult<bool>;
    fn set_patch_sreac_active(&mut self, pidx: usize, ridx: usize, active: bool) -> SimResult<()>;

    fn patch_sreac_h(&self, pidx: usize, ridx: usize) -> SimResult<f64>;
    fn patch_sreac_c(&self, pidx: usize, ridx: usize) -> SimResult<f64>;
    fn patch_sreac_a(&self, pidx: usize, ridx: usize) -> SimResult<f64>;
    fn patch_sreac_extent(&self, pidx: usize, ridx: usize) -> SimResult<u64>;
    fn reset_patch_sreac_extent(&mut self, pidx: usize, ridx: usize) -> SimResult<()>;
}
