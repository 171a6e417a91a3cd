//! Parallel execution of independent replicate trajectories.
//!
//! Each engine stays strictly single-threaded; the parallelism here is over
//! whole trajectories, which share nothing. Every replicate gets its own
//! generator derived from the base seed, so results are reproducible and
//! independent of the thread schedule.

use rayon::prelude::*;
use rayon::ThreadPoolBuilder;

use crate::error::{SimError, SimResult};
use crate::rng::SimRng;

/// Builds and measures `n_traj` replicate simulations in parallel.
///
/// `build` constructs one engine from a derived per-trajectory generator;
/// `measure` runs it and extracts whatever the caller wants to keep.
/// Results come back in trajectory order. `n_threads` overrides the rayon
/// default when given.
pub fn run<S, R, B, M>(
    n_traj: usize,
    seed: Option<u64>,
    n_threads: Option<usize>,
    build: B,
    measure: M,
) -> SimResult<Vec<R>>
where
    B: Fn(SimRng) -> SimResult<S> + Sync,
    M: Fn(&mut S) -> SimResult<R> + Sync,
    R: Send,
{
    if n_traj == 0 {
        return Err(SimError::arg("number of trajectories must be greater than zero"));
    }
    let simulate = |traj: u64| -> SimResult<R> {
        let mut solver = build(SimRng::for_trajectory(seed, traj))?;
        measure(&mut solver)
    };
    let body = || {
        (0..n_traj as u64)
            .into_par_iter()
            .map(simulate)
            .collect::<SimResult<Vec<R>>>()
    };
    match n_threads {
        Some(n) => ThreadPoolBuilder::new()
            .num_threads(n)
            .build()
            .map_err(|e| SimError::ThreadPool(e.to_string()))?
            .install(body),
        None => body(),
    }
}
