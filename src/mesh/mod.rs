//! Spatial engine over a tetrahedral mesh.
//!
//! Every tet hosts one reaction process per compartment reaction and one
//! diffusion process per compartment diffusion rule; every surface triangle
//! hosts one process per patch surface reaction. Neighbour links between
//! tets of different compartments are severed while wiring connectivity, so
//! diffusion never crosses a compartment boundary; this is intended
//! behaviour, not an artifact of the mesh.

mod elem;
mod kproc;

use std::collections::BTreeSet;

use log::{debug, info};

use crate::error::{SimError, SimResult};
use crate::geom::Mesh;
use crate::model::Model;
use crate::rng::SimRng;
use crate::sched::{Schedule, DEFAULT_WIDTH};
use crate::solver::{check_count, round_count, scaled_ccst, Solver, AVOGADRO, CLAMPED};

use elem::{Comp, Patch, Tet, Tri};
use kproc::{KProc, Kind};

pub struct MeshSolver {
    model: Model,
    comps: Vec<Comp>,
    patches: Vec<Patch>,
    tets: Vec<Tet>,
    tris: Vec<Tri>,
    kprocs: Vec<KProc>,
    sched: Schedule,
    rng: SimRng,
    time: f64,
    nsteps: u64,
    upd_scratch: Vec<usize>,
}

impl MeshSolver {
    pub fn new(model: Model, mesh: Mesh, rng: SimRng) -> SimResult<Self> {
        Self::with_schedule_width(model, mesh, rng, DEFAULT_WIDTH)
    }

    /// Like [`new`](Self::new) with an explicit propensity-tree branching
    /// width. The width is a performance knob; sampling is exact for any
    /// width of at least two.
    pub fn with_schedule_width(
        model: Model,
        mesh: Mesh,
        rng: SimRng,
        width: usize,
    ) -> SimResult<Self> {
        assert!(width >= 2, "schedule width must be at least 2");
        mesh.validate(&model)?;

        let mut comps: Vec<Comp> = (0..model.ncomps())
            .map(|_| Comp {
                vol: 0.0,
                tets: Vec::new(),
            })
            .collect();
        let mut patches: Vec<Patch> = (0..model.npatches())
            .map(|_| Patch {
                area: 0.0,
                tris: Vec::new(),
            })
            .collect();

        let mut tets: Vec<Tet> = Vec::with_capacity(mesh.ntets());
        for (tidx, td) in mesh.tets.iter().enumerate() {
            let cdef = model.comp(td.comp);
            tets.push(Tet::new(
                td.comp,
                td.vol,
                td.areas,
                td.dists,
                cdef.nspecs(),
                cdef.reacs.len(),
            ));
            comps[td.comp].tets.push(tidx);
            comps[td.comp].vol += td.vol;
        }

        // Wire tet-to-tet links; a neighbour in a different compartment is
        // treated as absent for diffusion purposes.
        for (tidx, td) in mesh.tets.iter().enumerate() {
            for (face, &nb) in td.next.iter().enumerate() {
                if let Some(nb) = nb {
                    if mesh.tets[nb].comp == td.comp {
                        tets[tidx].next_tet[face] = Some(nb);
                    }
                }
            }
        }

        let mut tris: Vec<Tri> = Vec::with_capacity(mesh.ntris());
        for (ridx, rd) in mesh.tris.iter().enumerate() {
            let pdef = model.patch(rd.patch);
            for (side, tet, comp) in [
                ("inner", rd.inner, pdef.icomp),
                ("outer", rd.outer, pdef.ocomp),
            ] {
                if let (Some(t), Some(c)) = (tet, comp) {
                    if mesh.tets[t].comp != c {
                        return Err(SimError::Shape(format!(
                            "tri {ridx} {side} tet {t} is in compartment {} but its patch expects {c}",
                            mesh.tets[t].comp
                        )));
                    }
                }
            }
            // A surface reaction that reads or writes a volume needs the
            // corresponding tet on this triangle.
            if rd.inner.is_none()
                && pdef.sreacs.iter().any(|s| !s.ilhs.is_empty() || !s.iupd.is_empty())
            {
                return Err(SimError::Shape(format!(
                    "tri {ridx} has no inner tet for its patch's surface reactions"
                )));
            }
            if rd.outer.is_none()
                && pdef.sreacs.iter().any(|s| !s.olhs.is_empty() || !s.oupd.is_empty())
            {
                return Err(SimError::Shape(format!(
                    "tri {ridx} has no outer tet for its patch's surface reactions"
                )));
            }
            tris.push(Tri::new(
                rd.patch,
                rd.area,
                rd.inner,
                rd.outer,
                pdef.nspecs(),
            ));
            patches[rd.patch].tris.push(ridx);
            patches[rd.patch].area += rd.area;

            // Attach the triangle to a free face of each adjacent tet.
            for tet in [rd.inner, rd.outer].into_iter().flatten() {
                let slot = (0..4).find(|&f| {
                    tets[tet].next_tet[f].is_none() && tets[tet].next_tri[f].is_none()
                });
                match slot {
                    Some(f) => tets[tet].next_tri[f] = Some(ridx),
                    None => {
                        return Err(SimError::Shape(format!(
                            "tet {tet} has no free face for tri {ridx}"
                        )))
                    }
                }
            }
        }

        // Kinetic processes: per tet the compartment's reactions then its
        // diffusion rules, per tri the patch's surface reactions.
        let mut kprocs: Vec<KProc> = Vec::new();
        for (tidx, tet) in tets.iter_mut().enumerate() {
            let cdef = model.comp(tet.cidx);
            for (lidx, rdef) in cdef.reacs.iter().enumerate() {
                tet.kprocs.push(kprocs.len());
                kprocs.push(KProc::new(Kind::Reac {
                    tet: tidx,
                    lidx,
                    ccst: scaled_ccst(rdef.kcst, tet.vol, rdef.order),
                }));
            }
            for (ldidx, ddef) in cdef.diffs.iter().enumerate() {
                let mut scaled = [0.0; 4];
                for f in 0..4 {
                    if tet.next_tet[f].is_some() {
                        scaled[f] = ddef.dcst * tet.areas[f] / (tet.vol * tet.dists[f]);
                    }
                }
                let scaled_total = scaled.iter().sum();
                tet.kprocs.push(kprocs.len());
                kprocs.push(KProc::new(Kind::Diff {
                    tet: tidx,
                    ldidx,
                    scaled,
                    scaled_total,
                    upd: Default::default(),
                }));
            }
        }
        for (ridx, tri) in tris.iter_mut().enumerate() {
            let pdef = model.patch(tri.pidx);
            for (lidx, sdef) in pdef.sreacs.iter().enumerate() {
                let ccst = if !sdef.ilhs.is_empty() {
                    match tri.inner {
                        Some(t) => scaled_ccst(sdef.kcst, tets[t].vol, sdef.order),
                        None => 0.0,
                    }
                } else if !sdef.olhs.is_empty() {
                    match tri.outer {
                        Some(t) => scaled_ccst(sdef.kcst, tets[t].vol, sdef.order),
                        None => 0.0,
                    }
                } else {
                    scaled_ccst(sdef.kcst, tri.area, sdef.order)
                };
                tri.kprocs.push(kprocs.len());
                kprocs.push(KProc::new(Kind::SReac {
                    tri: ridx,
                    lidx,
                    ccst,
                }));
            }
        }

        setup_deps(&model, &tets, &tris, &mut kprocs);

        let max_upd = kprocs.iter().map(KProc::upd_vec_size).max().unwrap_or(0);
        let mut sched = Schedule::build(kprocs.len(), width, max_upd);
        sched.reset(kprocs.len(), |i| kprocs[i].rate(&model, &tets, &tris));

        info!(
            "mesh engine built: {} tets, {} tris, {} kinetic processes",
            tets.len(),
            tris.len(),
            kprocs.len()
        );

        Ok(MeshSolver {
            model,
            comps,
            patches,
            tets,
            tris,
            kprocs,
            sched,
            rng,
            time: 0.0,
            nsteps: 0,
            upd_scratch: vec![0; max_upd],
        })
    }

    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn ntets(&self) -> usize {
        self.tets.len()
    }

    pub fn ntris(&self) -> usize {
        self.tris.len()
    }

    fn execute_step(&mut self, kidx: usize, dt: f64) {
        let Self {
            model,
            tets,
            tris,
            kprocs,
            sched,
            rng,
            upd_scratch,
            time,
            nsteps,
            ..
        } = self;
        let n = kprocs[kidx].apply(model, tets, tris, rng, upd_scratch);
        sched.update(&upd_scratch[..n], |i| kprocs[i].rate(model, tets, tris));
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
            tets,
            tris,
            kprocs,
            sched,
            ..
        } = self;
        if dirty.len() * 4 >= kprocs.len().max(1) {
            sched.reset(kprocs.len(), |i| kprocs[i].rate(model, tets, tris));
        } else {
            sched.update(&dirty, |i| kprocs[i].rate(model, tets, tris));
        }
    }

    /// Every process whose rate can read the given tet's pools: the
    /// processes hosted on it plus the surface reactions on its bordering
    /// triangles.
    fn tet_dependents(&self, tidx: usize) -> Vec<usize> {
        let mut out = self.tets[tidx].kprocs.clone();
        for &tri in self.tets[tidx].next_tri.iter().flatten() {
            out.extend_from_slice(&self.tris[tri].kprocs);
        }
        out
    }

    fn tri_dependents(&self, ridx: usize) -> Vec<usize> {
        self.tris[ridx].kprocs.clone()
    }

    fn check_tet(&self, tidx: usize) -> SimResult<()> {
        if tidx >= self.tets.len() {
            return Err(SimError::arg(format!(
                "tet index {tidx} out of range ({} tets)",
                self.tets.len()
            )));
        }
        Ok(())
    }

    fn check_tri(&self, ridx: usize) -> SimResult<()> {
        if ridx >= self.tris.len() {
            return Err(SimError::arg(format!(
                "tri index {ridx} out of range ({} tris)",
                self.tris.len()
            )));
        }
        Ok(())
    }

    // Per-tet state access.

    pub fn tet_vol(&self, tidx: usize) -> SimResult<f64> {
        self.check_tet(tidx)?;
        Ok(self.tets[tidx].vol)
    }

    pub fn set_tet_vol(&mut self, _tidx: usize, _vol: f64) -> SimResult<()> {
        Err(SimError::NotImplemented("tet volume override"))
    }

    pub fn tet_count(&self, tidx: usize, sidx: usize) -> SimResult<f64> {
        self.check_tet(tidx)?;
        self.model.check_spec(sidx)?;
        let tet = &self.tets[tidx];
        Ok(match self.model.comp(tet.cidx).spec_g2l(sidx) {
            Some(l) => tet.pools[l] as f64,
            None => 0.0,
        })
    }

    pub fn set_tet_count(&mut self, tidx: usize, sidx: usize, n: f64) -> SimResult<()> {
        self.check_tet(tidx)?;
        self.model.check_spec(sidx)?;
        check_count(n)?;
        let Some(l) = self.model.comp(self.tets[tidx].cidx).spec_g2l(sidx) else {
            return Ok(());
        };
        let c = round_count(n, &mut self.rng);
        self.tets[tidx].pools[l] = c;
        let dirty = self.tet_dependents(tidx);
        self.refresh(dirty);
        Ok(())
    }

    pub fn tet_amount(&self, tidx: usize, sidx: usize) -> SimResult<f64> {
        Ok(self.tet_count(tidx, sidx)? / AVOGADRO)
    }

    pub fn set_tet_amount(&mut self, tidx: usize, sidx: usize, amount: f64) -> SimResult<()> {
        if !(amount >= 0.0) {
            return Err(SimError::arg(format!("amount must be non-negative, got {amount}")));
        }
        self.set_tet_count(tidx, sidx, amount * AVOGADRO)
    }

    pub fn tet_conc(&self, tidx: usize, sidx: usize) -> SimResult<f64> {
        let count = self.tet_count(tidx, sidx)?;
        Ok(count / (1.0e3 * self.tets[tidx].vol * AVOGADRO))
    }

    pub fn set_tet_conc(&mut self, tidx: usize, sidx: usize, conc: f64) -> SimResult<()> {
        self.check_tet(tidx)?;
        if !(conc >= 0.0) {
            return Err(SimError::arg(format!("concentration must be non-negative, got {conc}")));
        }
        let count = conc * 1.0e3 * self.tets[tidx].vol * AVOGADRO;
        self.set_tet_count(tidx, sidx, count)
    }

    pub fn tet_clamped(&self, tidx: usize, sidx: usize) -> SimResult<bool> {
        self.check_tet(tidx)?;
        self.model.check_spec(sidx)?;
        let tet = &self.tets[tidx];
        Ok(match self.model.comp(tet.cidx).spec_g2l(sidx) {
            Some(l) => tet.flags[l] & CLAMPED != 0,
            None => false,
        })
    }

    pub fn set_tet_clamped(&mut self, tidx: usize, sidx: usize, clamp: bool) -> SimResult<()> {
        self.check_tet(tidx)?;
        self.model.check_spec(sidx)?;
        if let Some(l) = self.model.comp(self.tets[tidx].cidx).spec_g2l(sidx) {
            let flags = &mut self.tets[tidx].flags[l];
            if clamp {
                *flags |= CLAMPED;
            } else {
                *flags &= !CLAMPED;
            }
        }
        Ok(())
    }

    pub fn tet_reac_k(&self, _tidx: usize, _ridx: usize) -> SimResult<f64> {
        Err(SimError::NotImplemented("reaction rate-constant access"))
    }

    pub fn set_tet_reac_k(&mut self, _tidx: usize, _ridx: usize, _kcst: f64) -> SimResult<()> {
        Err(SimError::NotImplemented("reaction rate-constant override"))
    }

    pub fn tet_reac_active(&self, tidx: usize, ridx: usize) -> SimResult<bool> {
        self.check_tet(tidx)?;
        self.model.check_reac(ridx)?;
        Ok(match self.model.reac_g2l(self.tets[tidx].cidx, ridx) {
            Some(l) => !self.kprocs[self.tets[tidx].reac(l)].inactive,
            None => false,
        })
    }

    pub fn set_tet_reac_active(&mut self, tidx: usize, ridx: usize, active: bool) -> SimResult<()> {
        self.check_tet(tidx)?;
        self.model.check_reac(ridx)?;
        if let Some(l) = self.model.reac_g2l(self.tets[tidx].cidx, ridx) {
            let kidx = self.tets[tidx].reac(l);
            self.kprocs[kidx].inactive = !active;
            self.refresh(vec![kidx]);
        }
        Ok(())
    }

    pub fn tet_diff_d(&self, _tidx: usize, _didx: usize) -> SimResult<f64> {
        Err(SimError::NotImplemented("diffusion-constant access"))
    }

    pub fn set_tet_diff_d(&mut self, _tidx: usize, _didx: usize, _dcst: f64) -> SimResult<()> {
        Err(SimError::NotImplemented("diffusion-constant override"))
    }

    pub fn tet_diff_active(&self, tidx: usize, didx: usize) -> SimResult<bool> {
        self.check_tet(tidx)?;
        self.model.check_diff(didx)?;
        Ok(match self.model.diff_g2l(self.tets[tidx].cidx, didx) {
            Some(l) => !self.kprocs[self.tets[tidx].diff(l)].inactive,
            None => false,
        })
    }

    pub fn set_tet_diff_active(&mut self, tidx: usize, didx: usize, active: bool) -> SimResult<()> {
        self.check_tet(tidx)?;
        self.model.check_diff(didx)?;
        if let Some(l) = self.model.diff_g2l(self.tets[tidx].cidx, didx) {
            let kidx = self.tets[tidx].diff(l);
            self.kprocs[kidx].inactive = !active;
            self.refresh(vec![kidx]);
        }
        Ok(())
    }

    pub fn tet_reac_h(&self, tidx: usize, ridx: usize) -> SimResult<f64> {
        self.check_tet(tidx)?;
        self.model.check_reac(ridx)?;
        Ok(match self.model.reac_g2l(self.tets[tidx].cidx, ridx) {
            Some(l) => self.kprocs[self.tets[tidx].reac(l)].h(&self.model, &self.tets, &self.tris),
            None => 0.0,
        })
    }

    pub fn tet_reac_c(&self, tidx: usize, ridx: usize) -> SimResult<f64> {
        self.check_tet(tidx)?;
        self.model.check_reac(ridx)?;
        Ok(match self.model.reac_g2l(self.tets[tidx].cidx, ridx) {
            Some(l) => self.kprocs[self.tets[tidx].reac(l)].ccst(),
            None => 0.0,
        })
    }

    pub fn tet_reac_a(&self, tidx: usize, ridx: usize) -> SimResult<f64> {
        self.check_tet(tidx)?;
        self.model.check_reac(ridx)?;
        Ok(match self.model.reac_g2l(self.tets[tidx].cidx, ridx) {
            Some(l) => {
                self.kprocs[self.tets[tidx].reac(l)].rate(&self.model, &self.tets, &self.tris)
            }
            None => 0.0,
        })
    }

    pub fn tet_diff_a(&self, tidx: usize, didx: usize) -> SimResult<f64> {
        self.check_tet(tidx)?;
        self.model.check_diff(didx)?;
        Ok(match self.model.diff_g2l(self.tets[tidx].cidx, didx) {
            Some(l) => {
                self.kprocs[self.tets[tidx].diff(l)].rate(&self.model, &self.tets, &self.tris)
            }
            None => 0.0,
        })
    }

    // Per-tri state access.

    pub fn tri_area(&self, ridx: usize) -> SimResult<f64> {
        self.check_tri(ridx)?;
        Ok(self.tris[ridx].area)
    }

    pub fn set_tri_area(&mut self, _ridx: usize, _area: f64) -> SimResult<()> {
        Err(SimError::NotImplemented("tri area override"))
    }

    pub fn tri_count(&self, ridx: usize, sidx: usize) -> SimResult<f64> {
        self.check_tri(ridx)?;
        self.model.check_spec(sidx)?;
        let tri = &self.tris[ridx];
        Ok(match self.model.patch(tri.pidx).spec_g2l(sidx) {
            Some(l) => tri.pools[l] as f64,
            None => 0.0,
        })
    }

    pub fn set_tri_count(&mut self, ridx: usize, sidx: usize, n: f64) -> SimResult<()> {
        self.check_tri(ridx)?;
        self.model.check_spec(sidx)?;
        check_count(n)?;
        let Some(l) = self.model.patch(self.tris[ridx].pidx).spec_g2l(sidx) else {
            return Ok(());
        };
        let c = round_count(n, &mut self.rng);
        self.tris[ridx].pools[l] = c;
        let dirty = self.tri_dependents(ridx);
        self.refresh(dirty);
        Ok(())
    }

    pub fn tri_clamped(&self, ridx: usize, sidx: usize) -> SimResult<bool> {
        self.check_tri(ridx)?;
        self.model.check_spec(sidx)?;
        let tri = &self.tris[ridx];
        Ok(match self.model.patch(tri.pidx).spec_g2l(sidx) {
            Some(l) => tri.flags[l] & CLAMPED != 0,
            None => false,
        })
    }

    pub fn set_tri_clamped(&mut self, ridx: usize, sidx: usize, clamp: bool) -> SimResult<()> {
        self.check_tri(ridx)?;
        self.model.check_spec(sidx)?;
        if let Some(l) = self.model.patch(self.tris[ridx].pidx).spec_g2l(sidx) {
            let flags = &mut self.tris[ridx].flags[l];
            if clamp {
                *flags |= CLAMPED;
            } else {
                *flags &= !CLAMPED;
            }
        }
        Ok(())
    }

    pub fn tri_sreac_k(&self, _ridx: usize, _sridx: usize) -> SimResult<f64> {
        Err(SimError::NotImplemented("surface-reaction rate-constant access"))
    }

    pub fn set_tri_sreac_k(&mut self, _ridx: usize, _sridx: usize, _kcst: f64) -> SimResult<()> {
        Err(SimError::NotImplemented("surface-reaction rate-constant override"))
    }

    pub fn tri_sreac_active(&self, ridx: usize, sridx: usize) -> SimResult<bool> {
        self.check_tri(ridx)?;
        self.model.check_sreac(sridx)?;
        Ok(match self.model.sreac_g2l(self.tris[ridx].pidx, sridx) {
            Some(l) => !self.kprocs[self.tris[ridx].sreac(l)].inactive,
            None => false,
        })
    }

    pub fn set_tri_sreac_active(&mut self, ridx: usize, sridx: usize, active: bool) -> SimResult<()> {
        self.check_tri(ridx)?;
        self.model.check_sreac(sridx)?;
        if let Some(l) = self.model.sreac_g2l(self.tris[ridx].pidx, sridx) {
            let kidx = self.tris[ridx].sreac(l);
            self.kprocs[kidx].inactive = !active;
            self.refresh(vec![kidx]);
        }
        Ok(())
    }

    pub fn tri_sreac_h(&self, ridx: usize, sridx: usize) -> SimResult<f64> {
        self.check_tri(ridx)?;
        self.model.check_sreac(sridx)?;
        Ok(match self.model.sreac_g2l(self.tris[ridx].pidx, sridx) {
            Some(l) => self.kprocs[self.tris[ridx].sreac(l)].h(&self.model, &self.tets, &self.tris),
            None => 0.0,
        })
    }

    pub fn tri_sreac_c(&self, ridx: usize, sridx: usize) -> SimResult<f64> {
        self.check_tri(ridx)?;
        self.model.check_sreac(sridx)?;
        Ok(match self.model.sreac_g2l(self.tris[ridx].pidx, sridx) {
            Some(l) => self.kprocs[self.tris[ridx].sreac(l)].ccst(),
            None => 0.0,
        })
    }

    pub fn tri_sreac_a(&self, ridx: usize, sridx: usize) -> SimResult<f64> {
        self.check_tri(ridx)?;
        self.model.check_sreac(sridx)?;
        Ok(match self.model.sreac_g2l(self.tris[ridx].pidx, sridx) {
            Some(l) => {
                self.kprocs[self.tris[ridx].sreac(l)].rate(&self.model, &self.tets, &self.tris)
            }
            None => 0.0,
        })
    }

    // Per-compartment diffusion flags (reactions are on the Solver trait).

    pub fn comp_diff_d(&self, _cidx: usize, _didx: usize) -> SimResult<f64> {
        Err(SimError::NotImplemented("diffusion-constant access"))
    }

    pub fn set_comp_diff_d(&mut self, _cidx: usize, _didx: usize, _dcst: f64) -> SimResult<()> {
        Err(SimError::NotImplemented("diffusion-constant override"))
    }

    pub fn comp_diff_active(&self, cidx: usize, didx: usize) -> SimResult<bool> {
        self.model.check_comp(cidx)?;
        self.model.check_diff(didx)?;
        Ok(match self.model.diff_g2l(cidx, didx) {
            Some(l) => self.comps[cidx]
                .tets
                .iter()
                .all(|&t| !self.kprocs[self.tets[t].diff(l)].inactive),
            None => false,
        })
    }

    pub fn set_comp_diff_active(&mut self, cidx: usize, didx: usize, active: bool) -> SimResult<()> {
        self.model.check_comp(cidx)?;
        self.model.check_diff(didx)?;
        if let Some(l) = self.model.diff_g2l(cidx, didx) {
            let mut dirty = Vec::with_capacity(self.comps[cidx].tets.len());
            for &t in &self.comps[cidx].tets {
                dirty.push(self.tets[t].diff(l));
            }
            for &kidx in &dirty {
                self.kprocs[kidx].inactive = !active;
            }
            self.refresh(dirty);
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn sched_for_test(&self) -> &Schedule {
        &self.sched
    }

    #[cfg(test)]
    pub(crate) fn rates_sum_for_test(&self) -> f64 {
        self.kprocs
            .iter()
            .map(|k| k.rate(&self.model, &self.tets, &self.tris))
            .sum()
    }
}

#[derive(Clone, Copy)]
enum Elem {
    Tet(usize),
    Tri(usize),
}

/// Resolves every process's dependency vector (and, for diffusion, the
/// per-face update vectors) once all processes exist. The process set and
/// the mesh topology are frozen afterwards.
fn setup_deps(model: &Model, tets: &[Tet], tris: &[Tri], kprocs: &mut [KProc]) {
    enum Resolved {
        Simple(Vec<usize>),
        Diffusive {
            deps: Vec<usize>,
            upd: [Vec<usize>; 4],
        },
    }

    let resolved: Vec<Resolved> = {
        let kprocs: &[KProc] = kprocs;

        // Processes that can read a tet's pools: those hosted on it plus
        // the surface reactions on its bordering triangles.
        let neighbourhood = |t: usize| -> Vec<usize> {
            let mut v = tets[t].kprocs.clone();
            for &tri in tets[t].next_tri.iter().flatten() {
                v.extend_from_slice(&tris[tri].kprocs);
            }
            v
        };

        let dependents =
            |mutated: &[(Elem, usize)], candidates: &[usize], set: &mut BTreeSet<usize>| {
                for &kidx in candidates {
                    if set.contains(&kidx) {
                        continue;
                    }
                    let kp = &kprocs[kidx];
                    let hit = mutated.iter().any(|&(elem, gidx)| match elem {
                        Elem::Tet(t) => kp.reads_tet_spec(model, tets, tris, t, gidx),
                        Elem::Tri(r) => kp.reads_tri_spec(model, tris, r, gidx),
                    });
                    if hit {
                        set.insert(kidx);
                    }
                }
            };

        kprocs
            .iter()
            .map(|kp| match &kp.kind {
                Kind::Reac { tet, lidx, .. } => {
                    let cdef = model.comp(tets[*tet].cidx);
                    let mutated: Vec<(Elem, usize)> = cdef.reacs[*lidx]
                        .upd
                        .iter()
                        .map(|d| (Elem::Tet(*tet), cdef.spec_l2g[d.spec]))
                        .collect();
                    let mut set = BTreeSet::new();
                    dependents(&mutated, &neighbourhood(*tet), &mut set);
                    Resolved::Simple(set.into_iter().collect())
                }
                Kind::SReac { tri, lidx, .. } => {
                    let r = &tris[*tri];
                    let pdef = model.patch(r.pidx);
                    let def = &pdef.sreacs[*lidx];
                    let mut mutated: Vec<(Elem, usize)> = def
                        .supd
                        .iter()
                        .map(|d| (Elem::Tri(*tri), pdef.spec_l2g[d.spec]))
                        .collect();
                    let mut candidates = r.kprocs.clone();
                    if let Some(t) = r.inner {
                        let cdef = model.comp(tets[t].cidx);
                        mutated
                            .extend(def.iupd.iter().map(|d| (Elem::Tet(t), cdef.spec_l2g[d.spec])));
                        candidates.extend(neighbourhood(t));
                    }
                    if let Some(t) = r.outer {
                        let cdef = model.comp(tets[t].cidx);
                        mutated
                            .extend(def.oupd.iter().map(|d| (Elem::Tet(t), cdef.spec_l2g[d.spec])));
                        candidates.extend(neighbourhood(t));
                    }
                    let mut set = BTreeSet::new();
                    dependents(&mutated, &candidates, &mut set);
                    Resolved::Simple(set.into_iter().collect())
                }
                Kind::Diff { tet, ldidx, .. } => {
                    let cdef = model.comp(tets[*tet].cidx);
                    let gidx = cdef.spec_l2g[cdef.diffs[*ldidx].lig];
                    let local = neighbourhood(*tet);

                    let mut union = BTreeSet::new();
                    let mut upd: [Vec<usize>; 4] = Default::default();
                    for f in 0..4 {
                        let Some(nb) = tets[*tet].next_tet[f] else {
                            continue;
                        };
                        let mutated = [(Elem::Tet(*tet), gidx), (Elem::Tet(nb), gidx)];
                        let mut set = BTreeSet::new();
                        dependents(&mutated, &local, &mut set);
                        dependents(&mutated, &neighbourhood(nb), &mut set);
                        union.extend(set.iter().copied());
                        upd[f] = set.into_iter().collect();
                    }
                    if union.is_empty() {
                        // No eligible faces; keep the source-side dependents
                        // so the vector is still meaningful.
                        let mutated = [(Elem::Tet(*tet), gidx)];
                        dependents(&mutated, &local, &mut union);
                    }
                    Resolved::Diffusive {
                        deps: union.into_iter().collect(),
                        upd,
                    }
                }
            })
            .collect()
    };

    for (kp, res) in kprocs.iter_mut().zip(resolved) {
        match res {
            Resolved::Simple(deps) => kp.deps = deps,
            Resolved::Diffusive { deps, upd } => {
                kp.deps = deps;
                if let Kind::Diff { upd: slot, .. } = &mut kp.kind {
                    *slot = upd;
                }
            }
        }
    }

    debug!(
        "dependency vectors resolved: {} processes, max fan-out {}",
        kprocs.len(),
        kprocs.iter().map(|k| k.deps.len()).max().unwrap_or(0)
    );
}

impl Solver for MeshSolver {
    fn solver_name(&self) -> &'static str {
        "mesh"
    }

    fn solver_desc(&self) -> &'static str {
        "SSA direct method over a tetrahedral mesh"
    }

    fn reset(&mut self) {
        for tet in &mut self.tets {
            tet.reset();
        }
        for tri in &mut self.tris {
            tri.reset();
        }
        for kp in &mut self.kprocs {
            kp.extent = 0;
            kp.inactive = false;
        }
        self.time = 0.0;
        self.nsteps = 0;
        let Self {
            model,
            tets,
            tris,
            kprocs,
            sched,
            ..
        } = self;
        sched.reset(kprocs.len(), |i| kprocs[i].rate(model, tets, tris));
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
        Ok(self.comps[cidx].vol)
    }

    fn comp_count(&self, cidx: usize, sidx: usize) -> SimResult<f64> {
        self.model.check_comp(cidx)?;
        self.model.check_spec(sidx)?;
        let Some(l) = self.model.comp(cidx).spec_g2l(sidx) else {
            return Ok(0.0);
        };
        Ok(self.comps[cidx]
            .tets
            .iter()
            .map(|&t| self.tets[t].pools[l] as f64)
            .sum())
    }

    /// Distributes the target count over the compartment's tets,
    /// volume-proportionally: a pre-seeding pass when there are enough
    /// molecules to put at least one per tet on average, then one-at-a-time
    /// placement of the remainder by cumulative volume fraction. The total
    /// placed is exact.
    fn set_comp_count(&mut self, cidx: usize, sidx: usize, n: f64) -> SimResult<()> {
        self.model.check_comp(cidx)?;
        self.model.check_spec(sidx)?;
        check_count(n)?;
        let Some(l) = self.model.comp(cidx).spec_g2l(sidx) else {
            return Ok(());
        };
        {
            let Self {
                comps, tets, rng, ..
            } = self;
            let comp = &comps[cidx];
            let mut c = round_count(n, rng);
            for &t in &comp.tets {
                tets[t].pools[l] = 0;
            }
            if c as usize >= comp.tets.len() {
                let c0 = c as f64;
                for &t in &comp.tets {
                    let share = (c0 * (tets[t].vol / comp.vol)).floor() as u32;
                    tets[t].pools[l] = share;
                    c -= share;
                }
            }
            comp.scatter(tets, rng, l, c);
        }
        let mut dirty = Vec::new();
        for &t in &self.comps[cidx].tets {
            dirty.extend(self.tet_dependents(t));
        }
        self.refresh(dirty);
        Ok(())
    }

    fn comp_clamped(&self, cidx: usize, sidx: usize) -> SimResult<bool> {
        self.model.check_comp(cidx)?;
        self.model.check_spec(sidx)?;
        let Some(l) = self.model.comp(cidx).spec_g2l(sidx) else {
            return Ok(false);
        };
        Ok(self.comps[cidx]
            .tets
            .iter()
            .all(|&t| self.tets[t].flags[l] & CLAMPED != 0))
    }

    fn set_comp_clamped(&mut self, cidx: usize, sidx: usize, clamp: bool) -> SimResult<()> {
        self.model.check_comp(cidx)?;
        self.model.check_spec(sidx)?;
        if let Some(l) = self.model.comp(cidx).spec_g2l(sidx) {
            let Self { comps, tets, .. } = self;
            for &t in &comps[cidx].tets {
                if clamp {
                    tets[t].flags[l] |= CLAMPED;
                } else {
                    tets[t].flags[l] &= !CLAMPED;
                }
            }
        }
        Ok(())
    }

    fn comp_reac_active(&self, cidx: usize, ridx: usize) -> SimResult<bool> {
        self.model.check_comp(cidx)?;
        self.model.check_reac(ridx)?;
        Ok(match self.model.reac_g2l(cidx, ridx) {
            Some(l) => self.comps[cidx]
                .tets
                .iter()
                .all(|&t| !self.kprocs[self.tets[t].reac(l)].inactive),
            None => false,
        })
    }

    fn set_comp_reac_active(&mut self, cidx: usize, ridx: usize, active: bool) -> SimResult<()> {
        self.model.check_comp(cidx)?;
        self.model.check_reac(ridx)?;
        if let Some(l) = self.model.reac_g2l(cidx, ridx) {
            let mut dirty = Vec::with_capacity(self.comps[cidx].tets.len());
            for &t in &self.comps[cidx].tets {
                dirty.push(self.tets[t].reac(l));
            }
            for &kidx in &dirty {
                self.kprocs[kidx].inactive = !active;
            }
            self.refresh(dirty);
        }
        Ok(())
    }

    fn comp_reac_h(&self, cidx: usize, ridx: usize) -> SimResult<f64> {
        self.model.check_comp(cidx)?;
        self.model.check_reac(ridx)?;
        Ok(match self.model.reac_g2l(cidx, ridx) {
            Some(l) => self.comps[cidx]
                .tets
                .iter()
                .map(|&t| self.kprocs[self.tets[t].reac(l)].h(&self.model, &self.tets, &self.tris))
                .sum(),
            None => 0.0,
        })
    }

    fn comp_reac_c(&self, cidx: usize, ridx: usize) -> SimResult<f64> {
        self.model.check_comp(cidx)?;
        self.model.check_reac(ridx)?;
        let Some(l) = self.model.reac_g2l(cidx, ridx) else {
            return Ok(0.0);
        };
        let comp = &self.comps[cidx];
        if comp.tets.is_empty() {
            return Ok(0.0);
        }
        let weighted: f64 = comp
            .tets
            .iter()
            .map(|&t| self.kprocs[self.tets[t].reac(l)].ccst() * self.tets[t].vol)
            .sum();
        Ok(weighted / comp.vol)
    }

    fn comp_reac_a(&self, cidx: usize, ridx: usize) -> SimResult<f64> {
        self.model.check_comp(cidx)?;
        self.model.check_reac(ridx)?;
        Ok(match self.model.reac_g2l(cidx, ridx) {
            Some(l) => self.comps[cidx]
                .tets
                .iter()
                .map(|&t| {
                    self.kprocs[self.tets[t].reac(l)].rate(&self.model, &self.tets, &self.tris)
                })
                .sum(),
            None => 0.0,
        })
    }

    fn comp_reac_extent(&self, cidx: usize, ridx: usize) -> SimResult<u64> {
        self.model.check_comp(cidx)?;
        self.model.check_reac(ridx)?;
        Ok(match self.model.reac_g2l(cidx, ridx) {
            Some(l) => self.comps[cidx]
                .tets
                .iter()
                .map(|&t| self.kprocs[self.tets[t].reac(l)].extent)
                .sum(),
            None => 0,
        })
    }

    fn reset_comp_reac_extent(&mut self, cidx: usize, ridx: usize) -> SimResult<()> {
        self.model.check_comp(cidx)?;
        self.model.check_reac(ridx)?;
        if let Some(l) = self.model.reac_g2l(cidx, ridx) {
            let Self {
                comps,
                tets,
                kprocs,
                ..
            } = self;
            for &t in &comps[cidx].tets {
                kprocs[tets[t].reac(l)].extent = 0;
            }
        }
        Ok(())
    }

    fn patch_area(&self, pidx: usize) -> SimResult<f64> {
        self.model.check_patch(pidx)?;
        Ok(self.patches[pidx].area)
    }

    fn patch_count(&self, pidx: usize, sidx: usize) -> SimResult<f64> {
        self.model.check_patch(pidx)?;
        self.model.check_spec(sidx)?;
        let Some(l) = self.model.patch(pidx).spec_g2l(sidx) else {
            return Ok(0.0);
        };
        Ok(self.patches[pidx]
            .tris
            .iter()
            .map(|&t| self.tris[t].pools[l] as f64)
            .sum())
    }

    fn set_patch_count(&mut self, pidx: usize, sidx: usize, n: f64) -> SimResult<()> {
        self.model.check_patch(pidx)?;
        self.model.check_spec(sidx)?;
        check_count(n)?;
        let Some(l) = self.model.patch(pidx).spec_g2l(sidx) else {
            return Ok(());
        };
        {
            let Self {
                patches, tris, rng, ..
            } = self;
            let patch = &patches[pidx];
            let mut c = round_count(n, rng);
            for &t in &patch.tris {
                tris[t].pools[l] = 0;
            }
            if c as usize >= patch.tris.len() {
                let c0 = c as f64;
                for &t in &patch.tris {
                    let share = (c0 * (tris[t].area / patch.area)).floor() as u32;
                    tris[t].pools[l] = share;
                    c -= share;
                }
            }
            patch.scatter(tris, rng, l, c);
        }
        let mut dirty = Vec::new();
        for &t in &self.patches[pidx].tris {
            dirty.extend(self.tri_dependents(t));
        }
        self.refresh(dirty);
        Ok(())
    }

    fn patch_clamped(&self, pidx: usize, sidx: usize) -> SimResult<bool> {
        self.model.check_patch(pidx)?;
        self.model.check_spec(sidx)?;
        let Some(l) = self.model.patch(pidx).spec_g2l(sidx) else {
            return Ok(false);
        };
        Ok(self.patches[pidx]
            .tris
            .iter()
            .all(|&t| self.tris[t].flags[l] & CLAMPED != 0))
    }

    fn set_patch_clamped(&mut self, pidx: usize, sidx: usize, clamp: bool) -> SimResult<()> {
        self.model.check_patch(pidx)?;
        self.model.check_spec(sidx)?;
        if let Some(l) = self.model.patch(pidx).spec_g2l(sidx) {
            let Self { patches, tris, .. } = self;
            for &t in &patches[pidx].tris {
                if clamp {
                    tris[t].flags[l] |= CLAMPED;
                } else {
                    tris[t].flags[l] &= !CLAMPED;
                }
            }
        }
        Ok(())
    }

    fn patch_sreac_active(&self, pidx: usize, ridx: usize) -> SimResult<bool> {
        self.model.check_patch(pidx)?;
        self.model.check_sreac(ridx)?;
        Ok(match self.model.sreac_g2l(pidx, ridx) {
            Some(l) => self.patches[pidx]
                .tris
                .iter()
                .all(|&t| !self.kprocs[self.tris[t].sreac(l)].inactive),
            None => false,
        })
    }

    fn set_patch_sreac_active(&mut self, pidx: usize, ridx: usize, active: bool) -> SimResult<()> {
        self.model.check_patch(pidx)?;
        self.model.check_sreac(ridx)?;
        if let Some(l) = self.model.sreac_g2l(pidx, ridx) {
            let mut dirty = Vec::with_capacity(self.patches[pidx].tris.len());
            for &t in &self.patches[pidx].tris {
                dirty.push(self.tris[t].sreac(l));
            }
            for &kidx in &dirty {
                self.kprocs[kidx].inactive = !active;
            }
            self.refresh(dirty);
        }
        Ok(())
    }

    fn patch_sreac_h(&self, pidx: usize, ridx: usize) -> SimResult<f64> {
        self.model.check_patch(pidx)?;
        self.model.check_sreac(ridx)?;
        Ok(match self.model.sreac_g2l(pidx, ridx) {
            Some(l) => self.patches[pidx]
                .tris
                .iter()
                .map(|&t| self.kprocs[self.tris[t].sreac(l)].h(&self.model, &self.tets, &self.tris))
                .sum(),
            None => 0.0,
        })
    }

    fn patch_sreac_c(&self, pidx: usize, ridx: usize) -> SimResult<f64> {
        self.model.check_patch(pidx)?;
        self.model.check_sreac(ridx)?;
        let Some(l) = self.model.sreac_g2l(pidx, ridx) else {
            return Ok(0.0);
        };
        let patch = &self.patches[pidx];
        if patch.tris.is_empty() {
            return Ok(0.0);
        }
        let weighted: f64 = patch
            .tris
            .iter()
            .map(|&t| self.kprocs[self.tris[t].sreac(l)].ccst() * self.tris[t].area)
            .sum();
        Ok(weighted / patch.area)
    }

    fn patch_sreac_a(&self, pidx: usize, ridx: usize) -> SimResult<f64> {
        self.model.check_patch(pidx)?;
        self.model.check_sreac(ridx)?;
        Ok(match self.model.sreac_g2l(pidx, ridx) {
            Some(l) => self.patches[pidx]
                .tris
                .iter()
                .map(|&t| {
                    self.kprocs[self.tris[t].sreac(l)].rate(&self.model, &self.tets, &self.tris)
                })
                .sum(),
            None => 0.0,
        })
    }

    fn patch_sreac_extent(&self, pidx: usize, ridx: usize) -> SimResult<u64> {
        self.model.check_patch(pidx)?;
        self.model.check_sreac(ridx)?;
        Ok(match self.model.sreac_g2l(pidx, ridx) {
            Some(l) => self.patches[pidx]
                .tris
                .iter()
                .map(|&t| self.kprocs[self.tris[t].sreac(l)].extent)
                .sum(),
            None => 0,
        })
    }

    fn reset_patch_sreac_extent(&mut self, pidx: usize, ridx: usize) -> SimResult<()> {
        self.model.check_patch(pidx)?;
        self.model.check_sreac(ridx)?;
        if let Some(l) = self.model.sreac_g2l(pidx, ridx) {
            let Self {
                patches,
                tris,
                kprocs,
                ..
            } = self;
            for &t in &patches[pidx].tris {
                kprocs[tris[t].sreac(l)].extent = 0;
            }
        }
        Ok(())
    }
}
