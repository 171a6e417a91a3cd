//! Kinetic processes of the spatial engine: volume reactions, diffusive
//! jumps and surface reactions, each bound to one tet or tri.

use crate::model::{comb_h, Model};
use crate::rng::SimRng;
use crate::solver::apply_delta;

use super::elem::{Tet, Tri};

pub(crate) enum Kind {
    Reac {
        tet: usize,
        lidx: usize,
        ccst: f64,
    },
    Diff {
        tet: usize,
        ldidx: usize,
        /// Per-face jump factor `D · A_f / (V · d_f)`; zero on faces with
        /// no same-compartment neighbour.
        scaled: [f64; 4],
        scaled_total: f64,
        /// Update vector per destination face: dependents on the source
        /// side plus dependents on that face's destination side. Sorted,
        /// frozen after setup.
        upd: [Vec<usize>; 4],
    },
    SReac {
        tri: usize,
        lidx: usize,
        ccst: f64,
    },
}

pub(crate) struct KProc {
    pub kind: Kind,
    pub inactive: bool,
    pub extent: u64,
    /// Dependents when this process fires (for diffusion, the union over
    /// faces). Sorted, frozen after setup.
    pub deps: Vec<usize>,
}

impl KProc {
    pub(crate) fn new(kind: Kind) -> Self {
        KProc {
            kind,
            inactive: false,
            extent: 0,
            deps: Vec::new(),
        }
    }

    /// Rate-constant/volume term; meaningful for reactions and surface
    /// reactions.
    pub(crate) fn ccst(&self) -> f64 {
        match self.kind {
            Kind::Reac { ccst, .. } | Kind::SReac { ccst, .. } => ccst,
            Kind::Diff { .. } => 0.0,
        }
    }

    /// Upper bound on the size of the update set reported by `apply`.
    pub(crate) fn upd_vec_size(&self) -> usize {
        match &self.kind {
            Kind::Diff { upd, .. } => upd.iter().map(Vec::len).max().unwrap_or(0),
            _ => self.deps.len(),
        }
    }

    /// Combinatorial reactant term at current populations.
    pub(crate) fn h(&self, model: &Model, tets: &[Tet], tris: &[Tri]) -> f64 {
        match self.kind {
            Kind::Reac { tet, lidx, .. } => {
                let t = &tets[tet];
                comb_h(&model.comp(t.cidx).reacs[lidx].lhs, &t.pools)
            }
            Kind::Diff { tet, ldidx, .. } => {
                let t = &tets[tet];
                t.pools[model.comp(t.cidx).diffs[ldidx].lig] as f64
            }
            Kind::SReac { tri, lidx, .. } => {
                let r = &tris[tri];
                let def = &model.patch(r.pidx).sreacs[lidx];
                let mut h = comb_h(&def.slhs, &r.pools);
                match r.inner {
                    Some(t) => h *= comb_h(&def.ilhs, &tets[t].pools),
                    None if !def.ilhs.is_empty() => return 0.0,
                    None => {}
                }
                match r.outer {
                    Some(t) => h *= comb_h(&def.olhs, &tets[t].pools),
                    None if !def.olhs.is_empty() => return 0.0,
                    None => {}
                }
                h
            }
        }
    }

    pub(crate) fn rate(&self, model: &Model, tets: &[Tet], tris: &[Tri]) -> f64 {
        if self.inactive {
            return 0.0;
        }
        match self.kind {
            Kind::Diff { scaled_total, .. } => self.h(model, tets, tris) * scaled_total,
            _ => self.h(model, tets, tris) * self.ccst(),
        }
    }

    /// Fires the event: mutates the affected pools, bumps the extent and
    /// writes the update set into `out`, returning its length.
    pub(crate) fn apply(
        &mut self,
        model: &Model,
        tets: &mut [Tet],
        tris: &mut [Tri],
        rng: &mut SimRng,
        out: &mut [usize],
    ) -> usize {
        let n = match &self.kind {
            Kind::Reac { tet, lidx, .. } => {
                let t = &mut tets[*tet];
                for d in &model.comp(t.cidx).reacs[*lidx].upd {
                    apply_delta(&mut t.pools, &t.flags, d.spec, d.delta);
                }
                out[..self.deps.len()].copy_from_slice(&self.deps);
                self.deps.len()
            }
            Kind::Diff {
                tet,
                ldidx,
                scaled,
                scaled_total,
                upd,
            } => {
                // Sample the destination face proportionally to the
                // per-face jump propensity.
                let selector = rng.uniform01() * *scaled_total;
                let mut accum = 0.0;
                let mut face = None;
                let mut last_positive = None;
                for (f, &val) in scaled.iter().enumerate() {
                    if val > 0.0 {
                        last_positive = Some(f);
                    }
                    if selector < accum + val {
                        face = Some(f);
                        break;
                    }
                    accum += val;
                }
                let Some(f) = face.or(last_positive) else {
                    return 0;
                };
                let lig = model.comp(tets[*tet].cidx).diffs[*ldidx].lig;
                let dst = tets[*tet].next_tet[f].expect("selected face has a neighbour");
                {
                    let src = &mut tets[*tet];
                    apply_delta(&mut src.pools, &src.flags, lig, -1);
                }
                {
                    let dst = &mut tets[dst];
                    apply_delta(&mut dst.pools, &dst.flags, lig, 1);
                }
                out[..upd[f].len()].copy_from_slice(&upd[f]);
                upd[f].len()
            }
            Kind::SReac { tri, lidx, .. } => {
                let (pidx, inner, outer) = {
                    let r = &tris[*tri];
                    (r.pidx, r.inner, r.outer)
                };
                let def = &model.patch(pidx).sreacs[*lidx];
                {
                    let r = &mut tris[*tri];
                    for d in &def.supd {
                        apply_delta(&mut r.pools, &r.flags, d.spec, d.delta);
                    }
                }
                if let Some(t) = inner {
                    let t = &mut tets[t];
                    for d in &def.iupd {
                        apply_delta(&mut t.pools, &t.flags, d.spec, d.delta);
                    }
                }
                if let Some(t) = outer {
                    let t = &mut tets[t];
                    for d in &def.oupd {
                        apply_delta(&mut t.pools, &t.flags, d.spec, d.delta);
                    }
                }
                out[..self.deps.len()].copy_from_slice(&self.deps);
                self.deps.len()
            }
        };
        self.extent += 1;
        n
    }

    /// Whether this process reads the given global species in the given
    /// tet's pools.
    pub(crate) fn reads_tet_spec(
        &self,
        model: &Model,
        tets: &[Tet],
        tris: &[Tri],
        tidx: usize,
        gidx: usize,
    ) -> bool {
        match self.kind {
            Kind::Reac { tet, lidx, .. } => {
                tet == tidx
                    && model
                        .comp(tets[tet].cidx)
                        .spec_g2l(gidx)
                        .is_some_and(|l| {
                            model.comp(tets[tet].cidx).reacs[lidx]
                                .lhs
                                .iter()
                                .any(|r| r.spec == l)
                        })
            }
            Kind::Diff { tet, ldidx, .. } => {
                tet == tidx
                    && model
                        .comp(tets[tet].cidx)
                        .spec_g2l(gidx)
                        .is_some_and(|l| model.comp(tets[tet].cidx).diffs[ldidx].lig == l)
            }
            Kind::SReac { tri, lidx, .. } => {
                let r = &tris[tri];
                let def = &model.patch(r.pidx).sreacs[lidx];
                let side = |cand: Option<usize>, lhs: &[crate::model::Reactant]| {
                    cand == Some(tidx)
                        && model
                            .comp(tets[tidx].cidx)
                            .spec_g2l(gidx)
                            .is_some_and(|l| lhs.iter().any(|reac| reac.spec == l))
                };
                side(r.inner, &def.ilhs) || side(r.outer, &def.olhs)
            }
        }
    }

    /// Whether this process reads the given global species in the given
    /// tri's pools.
    pub(crate) fn reads_tri_spec(
        &self,
        model: &Model,
        tris: &[Tri],
        ridx: usize,
        gidx: usize,
    ) -> bool {
        match self.kind {
            Kind::SReac { tri, lidx, .. } => {
                tri == ridx
                    && model
                        .patch(tris[tri].pidx)
                        .spec_g2l(gidx)
                        .is_some_and(|l| {
                            model.patch(tris[tri].pidx).sreacs[lidx]
                                .slhs
                                .iter()
                                .any(|r| r.spec == l)
                        })
            }
            _ => false,
        }
    }
}
