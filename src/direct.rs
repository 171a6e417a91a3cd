//! Well-mixed direct-method engine.
//!
//! Every compartment and patch is a single pool; each reaction and surface
//! reaction is one kinetic process in the schedule. The event loop draws an
//! exponential waiting time from the total propensity, selects the firing
//! process through the propensity tree, applies its population delta and
//! refreshes only the processes whose rates the delta can have changed.

use log::{debug, info};

use crate::error::{SimError, SimResult};
use crate::model::{comb_h, Model, SReacDef};
use crate::rng::SimRng;
use crate::sched::{Schedule, DEFAULT_WIDTH};
use crate::solver::{apply_delta, check_count, round_count, scaled_ccst, Solver, CLAMPED};

struct CompState {
    pools: Vec<u32>,
    flags: Vec<u32>,
    /// Schedule indices of this compartment's reactions, by local index.
    kprocs: Vec<usize>,
}

struct PatchState {
    pools: Vec<u32>,
    flags: Vec<u32>,
    /// Schedule indices of this patch's surface reactions, by local index.
    kprocs: Vec<usize>,
}

enum Kind {
    Reac { cidx: usize, lidx: usize },
    SReac { pidx: usize, lidx: usize },
}

struct KProc {
    kind: Kind,
    inactive: bool,
    extent: u64,
    ccst: f64,
    /// Schedule indices whose rates may change when this process fires.
    /// Sorted, deduplicated, frozen after setup.
    deps: Vec<usize>,
}

impl KProc {
    fn rate(&self, model: &Model, comps: &[CompState], patches: &[PatchState]) -> f64 {
        if self.inactive {
            return 0.0;
        }
        match self.kind {
            Kind::Reac { cidx, lidx } => {
                let def = &model.comp(cidx).reacs[lidx];
                comb_h(&def.lhs, &comps[cidx].pools) * self.ccst
            }
            Kind::SReac { pidx, lidx } => {
                let pdef = model.patch(pidx);
                let def = &pdef.sreacs[lidx];
                let mut h = comb_h(&def.slhs, &patches[pidx].pools);
                if let Some(ic) = pdef.icomp {
                    h *= comb_h(&def.ilhs, &comps[ic].pools);
                }
                if let Some(oc) = pdef.ocomp {
                    h *= comb_h(&def.olhs, &comps[oc].pools);
                }
                h * self.ccst
            }
        }
    }

    fn apply(&mut self, model: &Model, comps: &mut [CompState], patches: &mut [PatchState]) {
        match self.kind {
            Kind::Reac { cidx, lidx } => {
                let def = &model.comp(cidx).reacs[lidx];
                let comp = &mut comps[cidx];
                for d in &def.upd {
                    apply_delta(&mut comp.pools, &comp.flags, d.spec, d.delta);
                }
            }
            Kind::SReac { pidx, lidx } => {
                let pdef = model.patch(pidx);
                let def = &pdef.sreacs[lidx];
                let patch = &mut patches[pidx];
                for d in &def.supd {
                    apply_delta(&mut patch.pools, &patch.flags, d.spec, d.delta);
                }
                if let Some(ic) = pdef.icomp {
                    let comp = &mut comps[ic];
                    for d in &def.iupd {
                        apply_delta(&mut comp.pools, &comp.flags, d.spec, d.delta);
                    }
                }
                if let Some(oc) = pdef.ocomp {
                    let comp = &mut comps[oc];
                    for d in &def.oupd {
                        apply_delta(&mut comp.pools, &comp.flags, d.spec, d.delta);
                    }
                }
            }
        }
        self.extent += 1;
    }

    /// Whether this process reads the given global species in the given
    /// compartment pool.
    fn reads_comp_spec(&self, model: &Model, comp: usize, gidx: usize) -> bool {
        match self.kind {
            Kind::Reac { cidx, lidx } => {
                if cidx != comp {
                    return false;
                }
                match model.comp(cidx).spec_g2l(gidx) {
                    Some(l) => model.comp(cidx).reacs[lidx].lhs.iter().any(|r| r.spec == l),
                    None => false,
                }
            }
            Kind::SReac { pidx, lidx } => {
                let pdef = model.patch(pidx);
                let def = &pdef.sreacs[lidx];
                let side = |cand: Option<usize>, lhs: &[crate::model::Reactant]| {
                    cand == Some(comp)
                        && model
                            .comp(comp)
                            .spec_g2l(gidx)
                            .is_some_and(|l| lhs.iter().any(|r| r.spec == l))
                };
                side(pdef.icomp, &def.ilhs) || side(pdef.ocomp, &def.olhs)
            }
        }
    }

    fn reads_patch_spec(&self, model: &Model, patch: usize, gidx: usize) -> bool {
        match self.kind {
            Kind::Reac { .. } => false,
            Kind::SReac { pidx, lidx } => {
                pidx == patch
                    && model
                        .patch(pidx)
                        .spec_g2l(gidx)
                        .is_some_and(|l| {
                            model.patch(pidx).sreacs[lidx].slhs.iter().any(|r| r.spec == l)
                        })
            }
        }
    }
}

fn sreac_ccst(model: &Model, pidx: usize, def: &SReacDef) -> f64 {
    let pdef = model.patch(pidx);
    let measure = if !def.ilhs.is_empty() {
        model.comp(pdef.icomp.expect("inner reactants require an inner compartment")).vol
    } else if !def.olhs.is_empty() {
        model.comp(pdef.ocomp.expect("outer reactants require an outer compartment")).vol
    } else {
        pdef.area
    };
    scaled_ccst(def.kcst, measure, def.order)
}

pub struct DirectSolver {
    model: Model,
    comps: Vec<CompState>,
    patches: Vec<PatchState>,
    kprocs: Vec<KProc>,
    sched: Schedule,
    rng: SimRng,
    time: f64,
    nsteps: u64,
    upd_scratch: Vec<usize>,
}

impl DirectSolver {
    pub fn new(model: Model, rng: SimRng) -> Self {
        Self::with_schedule_width(model, rng, DEFAULT_WIDTH)
    }

    /// Like [`new`](Self::new) with an explicit propensity-tree branching
    /// width. The width is a performance knob; sampling is exact for any
    /// width of at least two.
    pub fn with_schedule_width(model: Model, rng: SimRng, width: usize) -> Self {
        assert!(width >= 2, "schedule width must be at least 2");
        let mut comps = Vec::with_capacity(model.ncomps());
        let mut patches = Vec::with_capacity(model.npatches());
        let mut kprocs = Vec::new();

        for cidx in 0..model.ncomps() {
            let cdef = model.comp(cidx);
            let mut state = CompState {
                pools: vec![0; cdef.nspecs()],
                flags: vec![0; cdef.nspecs()],
                kprocs: Vec::with_capacity(cdef.reacs.len()),
            };
            for (lidx, rdef) in cdef.reacs.iter().enumerate() {
                state.kprocs.push(kprocs.len());
                kprocs.push(KProc {
                    kind: Kind::Reac { cidx, lidx },
                    inactive: false,
                    extent: 0,
                    ccst: scaled_ccst(rdef.kcst, cdef.vol, rdef.order),
                    deps: Vec::new(),
                });
            }
            comps.push(state);
        }

        for pidx in 0..model.npatches() {
            let pdef = model.patch(pidx);
            let mut state = PatchState {
                pools: vec![0; pdef.nspecs()],
                flags: vec![0; pdef.nspecs()],
                kprocs: Vec::with_capacity(pdef.sreacs.len()),
            };
            for (lidx, sdef) in pdef.sreacs.iter().enumerate() {
                state.kprocs.push(kprocs.len());
                kprocs.push(KProc {
                    kind: Kind::SReac { pidx, lidx },
                    inactive: false,
                    extent: 0,
                    ccst: sreac_ccst(&model, pidx, sdef),
                    deps: Vec::new(),
                });
            }
            patches.push(state);
        }

        setup_deps(&model, &mut kprocs);

        let max_upd = kprocs.iter().map(|k| k.deps.len()).max().unwrap_or(0);
        let mut sched = Schedule::build(kprocs.len(), width, max_upd);
        sched.reset(kprocs.len(), |i| kprocs[i].rate(&model, &comps, &patches));

        info!(
            "well-mixed engine built: {} compartments, {} patches, {} kinetic processes",
            comps.len(),
            patches.len(),
            kprocs.len()
        );

        DirectSolver {
            model,
            comps,
            patches,
            kprocs,
            sched,
            rng,
            time: 0.0,
            nsteps: 0,
            upd_scratch: vec![0; max_upd],
        }
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    fn execute_step(&mut self, kidx: usize, dt: f64) {
        let Self {
            model,
            comps,
            patches,
            kprocs,
            sched,
            upd_scratch,
            time,
            nsteps,
            ..
        } = self;
        kprocs[kidx].apply(model, comps, patches);
        let n = kprocs[kidx].deps.len();
        upd_scratch[..n].copy_from_slice(&kprocs[kidx].deps);
        sched.update(&upd_scratch[..n], |i| kprocs[i].rate(model, comps, patches));
        *time += dt;
        *nsteps += 1;
    }

    /// Re-evaluates the rates of a dirtied process set; falls back to a
    /// full recompute when the set covers a sizeable share of the schedule.
    fn refresh(&mut self, mut dirty: Vec<usize>) {
        dirty.sort_unstable();
        dirty.dedup();
        let Self {
            model,
            comps,
            patches,
            kprocs,
            sched,
            ..
        } = self;
        if dirty.len() * 4 >= kprocs.len().max(1) {
            sched.reset(kprocs.len(), |i| kprocs[i].rate(model, comps, patches));
        } else {
            sched.update(&dirty, |i| kprocs[i].rate(model, comps, patches));
        }
    }

    /// Processes whose rates read the given species pool of a compartment.
    fn comp_spec_dependents(&self, cidx: usize, gidx: usize) -> Vec<usize> {
        let mut dirty = Vec::new();
        for (kidx, kp) in self.kprocs.iter().enumerate() {
            if kp.reads_comp_spec(&self.model, cidx, gidx) {
                dirty.push(kidx);
            }
        }
        dirty
    }

    fn patch_spec_dependents(&self, pidx: usize, gidx: usize) -> Vec<usize> {
        let mut dirty = Vec::new();
        for (kidx, kp) in self.kprocs.iter().enumerate() {
            if kp.reads_patch_spec(&self.model, pidx, gidx) {
                dirty.push(kidx);
            }
        }
        dirty
    }

    #[cfg(test)]
    pub(crate) fn sched_for_test(&self) -> &Schedule {
        &self.sched
    }

    #[cfg(test)]
    pub(crate) fn rates_sum_for_test(&self) -> f64 {
        self.kprocs
            .iter()
            .map(|k| k.rate(&self.model, &self.comps, &self.patches))
            .sum()
    }
}

/// Resolves each process's dependency vector: the processes whose rates can
/// change when it fires. Computed once; the process set and topology are
/// frozen afterwards.
fn setup_deps(model: &Model, kprocs: &mut [KProc]) {
    let mutated: Vec<Vec<(Loc, usize)>> = kprocs.iter().map(|kp| mutated_pools(model, kp)).collect();

    for kidx in 0..kprocs.len() {
        let mut deps = Vec::new();
        for (kother, kp) in kprocs.iter().enumerate() {
            let hit = mutated[kidx].iter().any(|&(loc, gidx)| match loc {
                Loc::Comp(c) => kp.reads_comp_spec(model, c, gidx),
                Loc::Patch(p) => kp.reads_patch_spec(model, p, gidx),
            });
            if hit {
                deps.push(kother);
            }
        }
        kprocs[kidx].deps = deps;
    }

    debug!(
        "dependency vectors resolved: {} processes, max fan-out {}",
        kprocs.len(),
        kprocs.iter().map(|k| k.deps.len()).max().unwrap_or(0)
    );
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Loc {
    Comp(usize),
    Patch(usize),
}

/// The (pool, global species) pairs this process mutates when it fires.
fn mutated_pools(model: &Model, kp: &KProc) -> Vec<(Loc, usize)> {
    let mut out = Vec::new();
    match kp.kind {
        Kind::Reac { cidx, lidx } => {
            let cdef = model.comp(cidx);
            for d in &cdef.reacs[lidx].upd {
                out.push((Loc::Comp(cidx), cdef.spec_l2g[d.spec]));
            }
        }
        Kind::SReac { pidx, lidx } => {
            let pdef = model.patch(pidx);
            let def = &pdef.sreacs[lidx];
            for d in &def.supd {
                out.push((Loc::Patch(pidx), pdef.spec_l2g[d.spec]));
            }
            if let Some(ic) = pdef.icomp {
                for d in &def.iupd {
                    out.push((Loc::Comp(ic), model.comp(ic).spec_l2g[d.spec]));
                }
            }
            if let Some(oc) = pdef.ocomp {
                for d in &def.oupd {
                    out.push((Loc::Comp(oc), model.comp(oc).spec_l2g[d.spec]));
                }
            }
        }
    }
    out
}

impl Solver for DirectSolver {
    fn solver_name(&self) -> &'static str {
        "direct"
    }

    fn solver_desc(&self) -> &'static str {
        "SSA direct method over well-mixed compartments"
    }

    fn reset(&mut self) {
        for comp in &mut self.comps {
            comp.pools.fill(0);
            comp.flags.fill(0);
        }
        for patch in &mut self.patches {
            patch.pools.fill(0);
            patch.flags.fill(0);
        }
        for kp in &mut self.kprocs {
            kp.extent = 0;
            kp.inactive = false;
        }
        self.time = 0.0;
        self.nsteps = 0;
        let Self {
            model,
            comps,
            patches,
            kprocs,
            sched,
            ..
        } = self;
        sched.reset(kprocs.len(), |i| kprocs[i].rate(model, comps, patches));
    }

    fn run(&mut self, endtime: f64) -> SimResult<()> {
        if !endtime.is_finite() || endtime < self.time {
            return Err(SimError::arg(format!(
                "endtime {endtime} is before current simulation time {}",
                self.time
            )));
        }
        loop {
            let a0 = self.sched.a0();
            if a0 == 0.0 {
                break;
            }
            let dt = self.rng.exponential(a0);
            if self.time + dt > endtime {
                break;
            }
            let Some(kidx) = self.sched.select(&mut self.rng) else {
                break;
            };
            self.execute_step(kidx, dt);
        }
        self.time = endtime;
        Ok(())
    }

    fn step(&mut self) {
        let a0 = self.sched.a0();
        if a0 == 0.0 {
            return;
        }
        let dt = self.rng.exponential(a0);
        let Some(kidx) = self.sched.select(&mut self.rng) else {
            return;
        };
        self.execute_step(kidx, dt);
    }

    fn time(&self) -> f64 {
        self.time
    }

    fn nsteps(&self) -> u64 {
        self.nsteps
    }

    fn a0(&self) -> f64 {
        self.sched.a0()
    }

    fn comp_vol(&self, cidx: usize) -> SimResult<f64> {
        self.model.check_comp(cidx)?;
        Ok(self.model.comp(cidx).vol)
    }

    fn comp_count(&self, cidx: usize, sidx: usize) -> SimResult<f64> {
        self.model.check_comp(cidx)?;
        self.model.check_spec(sidx)?;
        Ok(match self.model.comp(cidx).spec_g2l(sidx) {
            Some(l) => self.comps[cidx].pools[l] as f64,
            None => 0.0,
        })
    }

    fn set_comp_count(&mut self, cidx: usize, sidx: usize, n: f64) -> SimResult<()> {
        self.model.check_comp(cidx)?;
        self.model.check_spec(sidx)?;
        check_count(n)?;
        let Some(l) = self.model.comp(cidx).spec_g2l(sidx) else {
            return Ok(());
        };
        let c = round_count(n, &mut self.rng);
        self.comps[cidx].pools[l] = c;
        let dirty = self.comp_spec_dependents(cidx, sidx);
        self.refresh(dirty);
        Ok(())
    }

    fn comp_clamped(&self, cidx: usize, sidx: usize) -> SimResult<bool> {
        self.model.check_comp(cidx)?;
        self.model.check_spec(sidx)?;
        Ok(match self.model.comp(cidx).spec_g2l(sidx) {
            Some(l) => self.comps[cidx].flags[l] & CLAMPED != 0,
            None => false,
        })
    }

    fn set_comp_clamped(&mut self, cidx: usize, sidx: usize, clamp: bool) -> SimResult<()> {
        self.model.check_comp(cidx)?;
        self.model.check_spec(sidx)?;
        if let Some(l) = self.model.comp(cidx).spec_g2l(sidx) {
            // Clamping freezes writes; no propensity changes.
            set_flag(&mut self.comps[cidx].flags[l], clamp);
        }
        Ok(())
    }

    fn comp_reac_active(&self, cidx: usize, ridx: usize) -> SimResult<bool> {
        self.model.check_comp(cidx)?;
        self.model.check_reac(ridx)?;
        Ok(match self.model.reac_g2l(cidx, ridx) {
            Some(l) => !self.kprocs[self.comps[cidx].kprocs[l]].inactive,
            None => false,
        })
    }

    fn set_comp_reac_active(&mut self, cidx: usize, ridx: usize, active: bool) -> SimResult<()> {
        self.model.check_comp(cidx)?;
        self.model.check_reac(ridx)?;
        if let Some(l) = self.model.reac_g2l(cidx, ridx) {
            let kidx = self.comps[cidx].kprocs[l];
            self.kprocs[kidx].inactive = !active;
            self.refresh(vec![kidx]);
        }
        Ok(())
    }

    fn comp_reac_h(&self, cidx: usize, ridx: usize) -> SimResult<f64> {
        self.model.check_comp(cidx)?;
        self.model.check_reac(ridx)?;
        Ok(match self.model.reac_g2l(cidx, ridx) {
            Some(l) => comb_h(&self.model.comp(cidx).reacs[l].lhs, &self.comps[cidx].pools),
            None => 0.0,
        })
    }

    fn comp_reac_c(&self, cidx: usize, ridx: usize) -> SimResult<f64> {
        self.model.check_comp(cidx)?;
        self.model.check_reac(ridx)?;
        Ok(match self.model.reac_g2l(cidx, ridx) {
            Some(l) => self.kprocs[self.comps[cidx].kprocs[l]].ccst,
            None => 0.0,
        })
    }

    fn comp_reac_a(&self, cidx: usize, ridx: usize) -> SimResult<f64> {
        self.model.check_comp(cidx)?;
        self.model.check_reac(ridx)?;
        Ok(match self.model.reac_g2l(cidx, ridx) {
            Some(l) => {
                self.kprocs[self.comps[cidx].kprocs[l]].rate(&self.model, &self.comps, &self.patches)
            }
            None => 0.0,
        })
    }

    fn comp_reac_extent(&self, cidx: usize, ridx: usize) -> SimResult<u64> {
        self.model.check_comp(cidx)?;
        self.model.check_reac(ridx)?;
        Ok(match self.model.reac_g2l(cidx, ridx) {
            Some(l) => self.kprocs[self.comps[cidx].kprocs[l]].extent,
            None => 0,
        })
    }

    fn reset_comp_reac_extent(&mut self, cidx: usize, ridx: usize) -> SimResult<()> {
        self.model.check_comp(cidx)?;
        self.model.check_reac(ridx)?;
        if let Some(l) = self.model.reac_g2l(cidx, ridx) {
            let kidx = self.comps[cidx].kprocs[l];
            self.kprocs[kidx].extent = 0;
        }
        Ok(())
    }

    fn patch_area(&self, pidx: usize) -> SimResult<f64> {
        self.model.check_patch(pidx)?;
        Ok(self.model.patch(pidx).area)
    }

    fn patch_count(&self, pidx: usize, sidx: usize) -> SimResult<f64> {
        self.model.check_patch(pidx)?;
        self.model.check_spec(sidx)?;
        Ok(match self.model.patch(pidx).spec_g2l(sidx) {
            Some(l) => self.patches[pidx].pools[l] as f64,
            None => 0.0,
        })
    }

    fn set_patch_count(&mut self, pidx: usize, sidx: usize, n: f64) -> SimResult<()> {
        self.model.check_patch(pidx)?;
        self.model.check_spec(sidx)?;
        check_count(n)?;
        let Some(l) = self.model.patch(pidx).spec_g2l(sidx) else {
            return Ok(());
        };
        let c = round_count(n, &mut self.rng);
        self.patches[pidx].pools[l] = c;
        let dirty = self.patch_spec_dependents(pidx, sidx);
        self.refresh(dirty);
        Ok(())
    }

    fn patch_clamped(&self, pidx: usize, sidx: usize) -> SimResult<bool> {
        self.model.check_patch(pidx)?;
        self.model.check_spec(sidx)?;
        Ok(match self.model.patch(pidx).spec_g2l(sidx) {
            Some(l) => self.patches[pidx].flags[l] & CLAMPED != 0,
            None => false,
        })
    }

    fn set_patch_clamped(&mut self, pidx: usize, sidx: usize, clamp: bool) -> SimResult<()> {
        self.model.check_patch(pidx)?;
        self.model.check_spec(sidx)?;
        if let Some(l) = self.model.patch(pidx).spec_g2l(sidx) {
            set_flag(&mut self.patches[pidx].flags[l], clamp);
        }
        Ok(())
    }

    fn patch_sreac_active(&self, pidx: usize, ridx: usize) -> SimResult<bool> {
        self.model.check_patch(pidx)?;
        self.model.check_sreac(ridx)?;
        Ok(match self.model.sreac_g2l(pidx, ridx) {
            Some(l) => !self.kprocs[self.patches[pidx].kprocs[l]].inactive,
            None => false,
        })
    }

    fn set_patch_sreac_active(&mut self, pidx: usize, ridx: usize, active: bool) -> SimResult<()> {
        self.model.check_patch(pidx)?;
        self.model.check_sreac(ridx)?;
        if let Some(l) = self.model.sreac_g2l(pidx, ridx) {
            let kidx = self.patches[pidx].kprocs[l];
            self.kprocs[kidx].inactive = !active;
            self.refresh(vec![kidx]);
        }
        Ok(())
    }

    fn patch_sreac_h(&self, pidx: usize, ridx: usize) -> SimResult<f64> {
        self.model.check_patch(pidx)?;
        self.model.check_sreac(ridx)?;
        let Some(l) = self.model.sreac_g2l(pidx, ridx) else {
            return Ok(0.0);
        };
        let pdef = self.model.patch(pidx);
        let def = &pdef.sreacs[l];
        let mut h = comb_h(&def.slhs, &self.patches[pidx].pools);
        if let Some(ic) = pdef.icomp {
            h *= comb_h(&def.ilhs, &self.comps[ic].pools);
        }
        if let Some(oc) = pdef.ocomp {
            h *= comb_h(&def.olhs, &self.comps[oc].pools);
        }
        Ok(h)
    }

    fn patch_sreac_c(&self, pidx: usize, ridx: usize) -> SimResult<f64> {
        self.model.check_patch(pidx)?;
        self.model.check_sreac(ridx)?;
        Ok(match self.model.sreac_g2l(pidx, ridx) {
            Some(l) => self.kprocs[self.patches[pidx].kprocs[l]].ccst,
            None => 0.0,
        })
    }

    fn patch_sreac_a(&self, pidx: usize, ridx: usize) -> SimResult<f64> {
        self.model.check_patch(pidx)?;
        self.model.check_sreac(ridx)?;
        Ok(match self.model.sreac_g2l(pidx, ridx) {
            Some(l) => self.kprocs[self.patches[pidx].kprocs[l]]
                .rate(&self.model, &self.comps, &self.patches),
            None => 0.0,
        })
    }

    fn patch_sreac_extent(&self, pidx: usize, ridx: usize) -> SimResult<u64> {
        self.model.check_patch(pidx)?;
        self.model.check_sreac(ridx)?;
        Ok(match self.model.sreac_g2l(pidx, ridx) {
            Some(l) => self.kprocs[self.patches[pidx].kprocs[l]].extent,
            None => 0,
        })
    }

    fn reset_patch_sreac_extent(&mut self, pidx: usize, ridx: usize) -> SimResult<()> {
        self.model.check_patch(pidx)?;
        self.model.check_sreac(ridx)?;
        if let Some(l) = self.model.sreac_g2l(pidx, ridx) {
            let kidx = self.patches[pidx].kprocs[l];
            self.kprocs[kidx].extent = 0;
        }
        Ok(())
    }
}

#[inline]
fn set_flag(flags: &mut u32, on: bool) {
    if on {
        *flags |= CLAMPED;
    } else {
        *flags &= !CLAMPED;
    }
}
