//! Hierarchical propensity aggregation.
//!
//! Propensities live in the leaves of an N-ary tree stored as a stack of
//! levels: `levels[0]` has one slot per kinetic process, padded up to a
//! multiple of the branching width, and each slot of a higher level holds
//! the sum of its `width` children. The top level has at most `width`
//! slots; their sum is the total propensity `a0`. Sampling the next event
//! walks one uniform draw per level from the top down, and an event that
//! dirties `k` leaves refreshes the tree in `O(k · log_width n)`.
//!
//! The width is a tuning knob, not a semantic constant; the structure is
//! correct for any width of at least two.

use crate::rng::SimRng;

pub(crate) const DEFAULT_WIDTH: usize = 16;

#[derive(Clone, Debug)]
pub(crate) struct Schedule {
    width: usize,
    /// Bottom-up: `levels[0]` holds the leaf slots.
    levels: Vec<Vec<f64>>,
    a0: f64,
    /// Scratch for the dirty-parent compression pass.
    parents: Vec<usize>,
    /// One uniform draw per level, filled before each descent.
    rannum: Vec<f64>,
}

impl Schedule {
    /// Allocates the level stack for `n_slots` leaves and a scratch buffer
    /// sized for the largest update vector any process can report. All
    /// allocation happens here; the event loop reuses these buffers.
    pub(crate) fn build(n_slots: usize, width: usize, max_upd: usize) -> Self {
        debug_assert!(width >= 2);
        let mut levels = Vec::new();
        let mut clsize = n_slots;
        if clsize > 0 {
            loop {
                let extra = clsize % width;
                if extra != 0 {
                    clsize += width - extra;
                }
                levels.push(vec![0.0; clsize]);
                clsize /= width;
                if clsize <= 1 {
                    break;
                }
            }
        }
        let depth = levels.len();
        Schedule {
            width,
            levels,
            a0: 0.0,
            parents: vec![0; max_upd.max(1)],
            rannum: vec![0.0; depth],
        }
    }

    #[inline]
    pub(crate) fn a0(&self) -> f64 {
        self.a0
    }

    /// Full recompute: refill every leaf from `rate_of` and rebuild the
    /// sums bottom-up.
    pub(crate) fn reset<F: FnMut(usize) -> f64>(&mut self, n_slots: usize, mut rate_of: F) {
        if self.levels.is_empty() {
            self.a0 = 0.0;
            return;
        }
        let leaves = &mut self.levels[0];
        debug_assert!(n_slots <= leaves.len());
        for (slot, leaf) in leaves.iter_mut().take(n_slots).enumerate() {
            *leaf = rate_of(slot);
        }
        for leaf in leaves.iter_mut().skip(n_slots) {
            *leaf = 0.0;
        }
        let width = self.width;
        for l in 1..self.levels.len() {
            let (lower, upper) = self.levels.split_at_mut(l);
            let prev = &lower[l - 1];
            let cur = &mut upper[0];
            let nnodes = prev.len() / width;
            for (slot, node) in cur.iter_mut().take(nnodes).enumerate() {
                *node = prev[slot * width..(slot + 1) * width].iter().sum();
            }
            for node in cur.iter_mut().skip(nnodes) {
                *node = 0.0;
            }
        }
        self.a0 = self.levels.last().map_or(0.0, |top| top.iter().sum());
    }

    /// Samples the leaf slot of the next event, or `None` while the total
    /// propensity is zero. Draws one uniform per level; a zero slot can
    /// never be chosen because accumulation passes it without crossing the
    /// selector.
    pub(crate) fn select(&mut self, rng: &mut SimRng) -> Option<usize> {
        debug_assert!(self.a0 >= 0.0);
        if self.a0 == 0.0 {
            return None;
        }
        for r in self.rannum.iter_mut() {
            *r = rng.uniform01();
        }

        let mut cur = 0usize;
        let mut a = self.a0;
        for l in (0..self.levels.len()).rev() {
            let level = &self.levels[l];
            cur *= self.width;
            let selector = self.rannum[l] * a;

            let mut accum = 0.0;
            let mut chosen = None;
            let mut last_positive = None;
            for slot in cur..cur + self.width {
                let val = level[slot];
                if val > 0.0 {
                    last_positive = Some((slot, val));
                }
                if selector < accum + val {
                    chosen = Some((slot, val));
                    break;
                }
                accum += val;
            }
            // Roundoff can walk past the last child; fall back to the last
            // positive slot rather than leave the subtree.
            let (slot, val) = chosen.or(last_positive)?;
            debug_assert!(val > 0.0);
            cur = slot;
            a = val;
        }
        Some(cur)
    }

    /// Incremental refresh after an event. `dirty` must be sorted and
    /// deduplicated; each pass stores the new leaf rates, compresses the
    /// indices to their parent slots (collapsing consecutive duplicates),
    /// and re-sums the touched slots level by level.
    pub(crate) fn update<F: FnMut(usize) -> f64>(&mut self, dirty: &[usize], mut rate_of: F) {
        if self.levels.is_empty() || dirty.is_empty() {
            return;
        }
        debug_assert!(dirty.windows(2).all(|w| w[0] < w[1]), "dirty set must be sorted");
        if self.parents.len() < dirty.len() {
            // Bulk mutations outside the event loop may exceed the
            // precomputed bound.
            self.parents.resize(dirty.len(), 0);
        }

        let width = self.width;
        let mut n_parents = 0usize;
        {
            let leaves = &mut self.levels[0];
            for &idx in dirty {
                leaves[idx] = rate_of(idx);
                let parent = idx / width;
                if n_parents == 0 || self.parents[n_parents - 1] != parent {
                    self.parents[n_parents] = parent;
                    n_parents += 1;
                }
            }
        }

        for l in 1..self.levels.len() {
            let (lower, upper) = self.levels.split_at_mut(l);
            let prev = &lower[l - 1];
            let cur = &mut upper[0];
            let mut next_n = 0usize;
            for e in 0..n_parents {
                let idx = self.parents[e];
                cur[idx] = prev[idx * width..(idx + 1) * width].iter().sum();
                let parent = idx / width;
                if next_n == 0 || self.parents[next_n - 1] != parent {
                    self.parents[next_n] = parent;
                    next_n += 1;
                }
            }
            n_parents = next_n;
        }

        self.a0 = self.levels.last().map_or(0.0, |top| top.iter().sum());
    }

    #[cfg(test)]
    pub(crate) fn levels_for_test(&self) -> &[Vec<f64>] {
        &self.levels
    }

    /// Checks the child-sum invariant on every internal slot.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        for l in 1..self.levels.len() {
            let prev = &self.levels[l - 1];
            for (slot, &val) in self.levels[l].iter().enumerate() {
                let lo = slot * self.width;
                let hi = prev.len().min(lo + self.width);
                let sum: f64 = if lo < prev.len() {
                    prev[lo..hi].iter().sum()
                } else {
                    0.0
                };
                assert!(
                    (val - sum).abs() <= 1e-12 * sum.abs().max(1.0),
                    "slot {slot} of level {l} out of sync: {val} vs {sum}"
                );
            }
        }
        if let Some(top) = self.levels.last() {
            let sum: f64 = top.iter().sum();
            assert!((self.a0 - sum).abs() <= 1e-12 * sum.abs().max(1.0));
        }
    }
}
