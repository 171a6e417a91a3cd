//! Model definitions: species, volume reactions, diffusion rules and
//! surface reactions, grouped into compartments and patches.
//!
//! Species carry global indices; each compartment and patch keeps its own
//! local table of the species that actually occur there, with
//! global-to-local maps alongside. A species, reaction or rule that is not
//! mapped into the addressed container is simply absent: queries against it
//! read as zero and writes are ignored. Definitions are frozen once an
//! engine is built from the model.

use crate::error::{SimError, SimResult};

/// One reactant slot: a container-local species index and its
/// stoichiometric count.
#[derive(Clone, Debug)]
pub(crate) struct Reactant {
    pub spec: usize,
    pub count: u32,
}

/// Net population change of one species when a reaction fires.
#[derive(Clone, Debug)]
pub(crate) struct SpecDelta {
    pub spec: usize,
    pub delta: i32,
}

/// Mass-action volume reaction, local to one compartment.
#[derive(Clone, Debug)]
pub(crate) struct ReacDef {
    pub kcst: f64,
    /// Total number of reactant molecules.
    pub order: u32,
    pub lhs: Vec<Reactant>,
    pub upd: Vec<SpecDelta>,
}

/// Diffusion rule for one species in one compartment.
#[derive(Clone, Debug)]
pub(crate) struct DiffDef {
    pub dcst: f64,
    /// Compartment-local index of the diffusing species.
    pub lig: usize,
}

/// Surface reaction on one patch. Reactants and products are split across
/// the surface itself and the inner and outer volumes.
#[derive(Clone, Debug)]
pub(crate) struct SReacDef {
    pub kcst: f64,
    pub order: u32,
    pub slhs: Vec<Reactant>,
    pub ilhs: Vec<Reactant>,
    pub olhs: Vec<Reactant>,
    pub supd: Vec<SpecDelta>,
    pub iupd: Vec<SpecDelta>,
    pub oupd: Vec<SpecDelta>,
}

#[derive(Clone, Debug)]
pub(crate) struct CompDef {
    pub vol: f64,
    /// Local species index to global.
    pub spec_l2g: Vec<usize>,
    spec_g2l: Vec<Option<usize>>,
    pub reacs: Vec<ReacDef>,
    pub diffs: Vec<DiffDef>,
}

impl CompDef {
    #[inline]
    pub(crate) fn spec_g2l(&self, gidx: usize) -> Option<usize> {
        self.spec_g2l.get(gidx).copied().flatten()
    }

    #[inline]
    pub(crate) fn nspecs(&self) -> usize {
        self.spec_l2g.len()
    }
}

#[derive(Clone, Debug)]
pub(crate) struct PatchDef {
    pub area: f64,
    pub icomp: Option<usize>,
    pub ocomp: Option<usize>,
    pub spec_l2g: Vec<usize>,
    spec_g2l: Vec<Option<usize>>,
    pub sreacs: Vec<SReacDef>,
}

impl PatchDef {
    #[inline]
    pub(crate) fn spec_g2l(&self, gidx: usize) -> Option<usize> {
        self.spec_g2l.get(gidx).copied().flatten()
    }

    #[inline]
    pub(crate) fn nspecs(&self) -> usize {
        self.spec_l2g.len()
    }
}

/// Complete model definition, built incrementally and then handed to an
/// engine.
#[derive(Clone, Debug)]
pub struct Model {
    nspecs: usize,
    comps: Vec<CompDef>,
    patches: Vec<PatchDef>,
    /// Global reaction index to (compartment, local index).
    reac_locs: Vec<(usize, usize)>,
    diff_locs: Vec<(usize, usize)>,
    /// Global surface-reaction index to (patch, local index).
    sreac_locs: Vec<(usize, usize)>,
}

impl Model {
    pub fn new(nspecs: usize) -> Self {
        Model {
            nspecs,
            comps: Vec::new(),
            patches: Vec::new(),
            reac_locs: Vec::new(),
            diff_locs: Vec::new(),
            sreac_locs: Vec::new(),
        }
    }

    pub fn nspecs(&self) -> usize {
        self.nspecs
    }

    pub fn ncomps(&self) -> usize {
        self.comps.len()
    }

    pub fn npatches(&self) -> usize {
        self.patches.len()
    }

    pub fn nreacs(&self) -> usize {
        self.reac_locs.len()
    }

    pub fn ndiffs(&self) -> usize {
        self.diff_locs.len()
    }

    pub fn nsreacs(&self) -> usize {
        self.sreac_locs.len()
    }

    pub fn add_comp(&mut self, vol: f64) -> SimResult<usize> {
        if !(vol > 0.0) {
            return Err(SimError::arg(format!("compartment volume must be positive, got {vol}")));
        }
        self.comps.push(CompDef {
            vol,
            spec_l2g: Vec::new(),
            spec_g2l: vec![None; self.nspecs],
            reacs: Vec::new(),
            diffs: Vec::new(),
        });
        Ok(self.comps.len() - 1)
    }

    pub fn add_patch(
        &mut self,
        area: f64,
        icomp: Option<usize>,
        ocomp: Option<usize>,
    ) -> SimResult<usize> {
        if !(area > 0.0) {
            return Err(SimError::arg(format!("patch area must be positive, got {area}")));
        }
        for comp in [icomp, ocomp].into_iter().flatten() {
            self.check_comp(comp)?;
        }
        self.patches.push(PatchDef {
            area,
            icomp,
            ocomp,
            spec_l2g: Vec::new(),
            spec_g2l: vec![None; self.nspecs],
            sreacs: Vec::new(),
        });
        Ok(self.patches.len() - 1)
    }

    /// Registers a species into a compartment's local table (without any
    /// reaction or diffusion rule attached); returns its local index.
    pub fn add_comp_spec(&mut self, cidx: usize, sidx: usize) -> SimResult<usize> {
        self.check_comp(cidx)?;
        self.check_spec(sidx)?;
        Ok(comp_spec_lidx(&mut self.comps[cidx], sidx))
    }

    /// Registers a species into a patch's local table; returns its local
    /// index.
    pub fn add_patch_spec(&mut self, pidx: usize, sidx: usize) -> SimResult<usize> {
        self.check_patch(pidx)?;
        self.check_spec(sidx)?;
        Ok(patch_spec_lidx(&mut self.patches[pidx], sidx))
    }

    /// Adds a mass-action reaction to a compartment. Stoichiometry is given
    /// as species lists with repetition (`2A + B -> C` is
    /// `lhs = [A, A, B]`, `rhs = [C]`). Returns the global reaction index.
    pub fn add_reac(
        &mut self,
        cidx: usize,
        lhs: &[usize],
        rhs: &[usize],
        kcst: f64,
    ) -> SimResult<usize> {
        self.check_comp(cidx)?;
        self.check_kcst(kcst)?;
        for &sidx in lhs.iter().chain(rhs) {
            self.check_spec(sidx)?;
        }
        let comp = &mut self.comps[cidx];
        let lhs_local = tally(lhs, |g| comp_spec_lidx(comp, g));
        let rhs_local = tally(rhs, |g| comp_spec_lidx(comp, g));
        let order = lhs.len() as u32;
        comp.reacs.push(ReacDef {
            kcst,
            order,
            upd: deltas(&lhs_local, &rhs_local),
            lhs: lhs_local,
        });
        self.reac_locs.push((cidx, comp.reacs.len() - 1));
        Ok(self.reac_locs.len() - 1)
    }

    /// Adds a diffusion rule for one species in a compartment. Returns the
    /// global diffusion index.
    pub fn add_diff(&mut self, cidx: usize, sidx: usize, dcst: f64) -> SimResult<usize> {
        self.check_comp(cidx)?;
        self.check_spec(sidx)?;
        if !(dcst >= 0.0) {
            return Err(SimError::arg(format!("diffusion constant must be non-negative, got {dcst}")));
        }
        let comp = &mut self.comps[cidx];
        let lig = comp_spec_lidx(comp, sidx);
        comp.diffs.push(DiffDef { dcst, lig });
        self.diff_locs.push((cidx, comp.diffs.len() - 1));
        Ok(self.diff_locs.len() - 1)
    }

    /// Adds a surface reaction to a patch. Reactant and product species are
    /// listed with repetition, split by location: `s*` on the surface, `i*`
    /// in the inner volume, `o*` in the outer volume. Returns the global
    /// surface-reaction index.
    #[allow(clippy::too_many_arguments)]
    pub fn add_sreac(
        &mut self,
        pidx: usize,
        slhs: &[usize],
        ilhs: &[usize],
        olhs: &[usize],
        srhs: &[usize],
        irhs: &[usize],
        orhs: &[usize],
        kcst: f64,
    ) -> SimResult<usize> {
        self.check_patch(pidx)?;
        self.check_kcst(kcst)?;
        for &sidx in [slhs, ilhs, olhs, srhs, irhs, orhs].into_iter().flatten() {
            self.check_spec(sidx)?;
        }
        let icomp = self.patches[pidx].icomp;
        let ocomp = self.patches[pidx].ocomp;
        if icomp.is_none() && !(ilhs.is_empty() && irhs.is_empty()) {
            return Err(SimError::arg(format!(
                "patch {pidx} has no inner compartment for inner-volume species"
            )));
        }
        if ocomp.is_none() && !(olhs.is_empty() && orhs.is_empty()) {
            return Err(SimError::arg(format!(
                "patch {pidx} has no outer compartment for outer-volume species"
            )));
        }

        let (slhs_l, supd) = {
            let patch = &mut self.patches[pidx];
            let l = tally(slhs, |g| patch_spec_lidx(patch, g));
            let r = tally(srhs, |g| patch_spec_lidx(patch, g));
            let upd = deltas(&l, &r);
            (l, upd)
        };
        let (ilhs_l, iupd) = self.tally_comp_side(icomp, ilhs, irhs);
        let (olhs_l, oupd) = self.tally_comp_side(ocomp, olhs, orhs);

        let order = (slhs.len() + ilhs.len() + olhs.len()) as u32;
        let patch = &mut self.patches[pidx];
        patch.sreacs.push(SReacDef {
            kcst,
            order,
            slhs: slhs_l,
            ilhs: ilhs_l,
            olhs: olhs_l,
            supd,
            iupd,
            oupd,
        });
        self.sreac_locs.push((pidx, patch.sreacs.len() - 1));
        Ok(self.sreac_locs.len() - 1)
    }

    fn tally_comp_side(
        &mut self,
        cidx: Option<usize>,
        lhs: &[usize],
        rhs: &[usize],
    ) -> (Vec<Reactant>, Vec<SpecDelta>) {
        match cidx {
            Some(c) => {
                let comp = &mut self.comps[c];
                let l = tally(lhs, |g| comp_spec_lidx(comp, g));
                let r = tally(rhs, |g| comp_spec_lidx(comp, g));
                let upd = deltas(&l, &r);
                (l, upd)
            }
            None => (Vec::new(), Vec::new()),
        }
    }

    // Lookups used by the engines and the control surface.

    pub(crate) fn comp(&self, cidx: usize) -> &CompDef {
        &self.comps[cidx]
    }

    pub(crate) fn patch(&self, pidx: usize) -> &PatchDef {
        &self.patches[pidx]
    }

    pub(crate) fn reac_g2l(&self, cidx: usize, gidx: usize) -> Option<usize> {
        self.reac_locs
            .get(gidx)
            .and_then(|&(c, l)| (c == cidx).then_some(l))
    }

    pub(crate) fn diff_g2l(&self, cidx: usize, gidx: usize) -> Option<usize> {
        self.diff_locs
            .get(gidx)
            .and_then(|&(c, l)| (c == cidx).then_some(l))
    }

    pub(crate) fn sreac_g2l(&self, pidx: usize, gidx: usize) -> Option<usize> {
        self.sreac_locs
            .get(gidx)
            .and_then(|&(p, l)| (p == pidx).then_some(l))
    }

    pub(crate) fn check_comp(&self, cidx: usize) -> SimResult<()> {
        if cidx >= self.comps.len() {
            return Err(SimError::arg(format!(
                "compartment index {cidx} out of range ({} compartments)",
                self.comps.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn check_patch(&self, pidx: usize) -> SimResult<()> {
        if pidx >= self.patches.len() {
            return Err(SimError::arg(format!(
                "patch index {pidx} out of range ({} patches)",
                self.patches.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn check_spec(&self, sidx: usize) -> SimResult<()> {
        if sidx >= self.nspecs {
            return Err(SimError::arg(format!(
                "species index {sidx} out of range ({} species)",
                self.nspecs
            )));
        }
        Ok(())
    }

    pub(crate) fn check_reac(&self, ridx: usize) -> SimResult<()> {
        if ridx >= self.reac_locs.len() {
            return Err(SimError::arg(format!(
                "reaction index {ridx} out of range ({} reactions)",
                self.reac_locs.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn check_diff(&self, didx: usize) -> SimResult<()> {
        if didx >= self.diff_locs.len() {
            return Err(SimError::arg(format!(
                "diffusion index {didx} out of range ({} rules)",
                self.diff_locs.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn check_sreac(&self, ridx: usize) -> SimResult<()> {
        if ridx >= self.sreac_locs.len() {
            return Err(SimError::arg(format!(
                "surface-reaction index {ridx} out of range ({} reactions)",
                self.sreac_locs.len()
            )));
        }
        Ok(())
    }

    fn check_kcst(&self, kcst: f64) -> SimResult<()> {
        if !(kcst >= 0.0) {
            return Err(SimError::arg(format!("rate constant must be non-negative, got {kcst}")));
        }
        Ok(())
    }
}

fn comp_spec_lidx(comp: &mut CompDef, gidx: usize) -> usize {
    if let Some(l) = comp.spec_g2l[gidx] {
        return l;
    }
    let l = comp.spec_l2g.len();
    comp.spec_l2g.push(gidx);
    comp.spec_g2l[gidx] = Some(l);
    l
}

fn patch_spec_lidx(patch: &mut PatchDef, gidx: usize) -> usize {
    if let Some(l) = patch.spec_g2l[gidx] {
        return l;
    }
    let l = patch.spec_l2g.len();
    patch.spec_l2g.push(gidx);
    patch.spec_g2l[gidx] = Some(l);
    l
}

/// Collapses a species list with repetition into per-species counts,
/// translating global to container-local indices on the way.
fn tally(specs: &[usize], mut lidx_of: impl FnMut(usize) -> usize) -> Vec<Reactant> {
    let mut out: Vec<Reactant> = Vec::new();
    for &gidx in specs {
        let lidx = lidx_of(gidx);
        match out.iter_mut().find(|r| r.spec == lidx) {
            Some(r) => r.count += 1,
            None => out.push(Reactant { spec: lidx, count: 1 }),
        }
    }
    out
}

/// Net per-species deltas for `lhs -> rhs`.
fn deltas(lhs: &[Reactant], rhs: &[Reactant]) -> Vec<SpecDelta> {
    let mut out: Vec<SpecDelta> = Vec::new();
    let mut push = |spec: usize, delta: i32| {
        match out.iter_mut().find(|d| d.spec == spec) {
            Some(d) => d.delta += delta,
            None => out.push(SpecDelta { spec, delta }),
        }
    };
    for r in lhs {
        push(r.spec, -(r.count as i32));
    }
    for r in rhs {
        push(r.spec, r.count as i32);
    }
    out.retain(|d| d.delta != 0);
    out
}

/// Combinatorial number of distinct reactant tuples at the given
/// populations: the product over reactants of
/// `falling_factorial(n, k) / k!`. Zero as soon as any count is below its
/// stoichiometric threshold.
#[inline]
pub(crate) fn comb_h(lhs: &[Reactant], pools: &[u32]) -> f64 {
    const FACT: [f64; 5] = [1.0, 1.0, 2.0, 6.0, 24.0];
    let mut h = 1.0;
    for r in lhs {
        let avail = pools[r.spec];
        if avail < r.count {
            return 0.0;
        }
        let ff = falling_factorial(avail as i64, r.count as i64);
        h *= match FACT.get(r.count as usize) {
            Some(&f) => ff / f,
            None => ff / (1..=r.count as i64).product::<i64>() as f64,
        };
    }
    h
}

#[inline]
pub(crate) fn falling_factorial(value: i64, count: i64) -> f64 {
    match count {
        0 => 1.0,
        1 => value as f64,
        2 if value >= 2 => (value * (value - 1)) as f64,
        3 if value >= 3 => (value * (value - 1) * (value - 2)) as f64,
        _ if value < count => 0.0,
        _ => {
            let mut acc = 1.0;
            for i in 0..count {
                acc *= (value - i) as f64;
            }
            acc
        }
    }
}
