//! Tetrahedral-mesh description consumed by the spatial engine.
//!
//! The mesh is pure geometry: per-tet volume, the four face areas, the four
//! centroid-to-neighbour distances and the neighbour indices, plus surface
//! triangles with their one or two adjacent tets. Compartment and patch
//! membership refers to a [`Model`](crate::model::Model); consistency
//! between the two is checked when an engine is constructed. Neighbour
//! links that cross a compartment boundary are kept here but deliberately
//! severed by the engine, so diffusion never crosses compartments.

use crate::error::{SimError, SimResult};
use crate::model::Model;

#[derive(Clone, Debug)]
pub(crate) struct TetDef {
    pub comp: usize,
    pub vol: f64,
    pub areas: [f64; 4],
    pub dists: [f64; 4],
    pub next: [Option<usize>; 4],
}

#[derive(Clone, Debug)]
pub(crate) struct TriDef {
    pub patch: usize,
    pub area: f64,
    pub inner: Option<usize>,
    pub outer: Option<usize>,
}

#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub(crate) tets: Vec<TetDef>,
    pub(crate) tris: Vec<TriDef>,
}

impl Mesh {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ntets(&self) -> usize {
        self.tets.len()
    }

    pub fn ntris(&self) -> usize {
        self.tris.len()
    }

    /// Adds one tetrahedron: owning compartment, volume, face areas,
    /// centroid distances to each neighbour, and neighbour tet indices
    /// (`None` on boundary faces). Returns the tet index.
    pub fn add_tet(
        &mut self,
        comp: usize,
        vol: f64,
        areas: [f64; 4],
        dists: [f64; 4],
        next: [Option<usize>; 4],
    ) -> SimResult<usize> {
        if !(vol > 0.0) {
            return Err(SimError::arg(format!("tet volume must be positive, got {vol}")));
        }
        for (face, &area) in areas.iter().enumerate() {
            if !(area > 0.0) {
                return Err(SimError::arg(format!(
                    "tet face {face} area must be positive, got {area}"
                )));
            }
        }
        for (face, &dist) in dists.iter().enumerate() {
            if next[face].is_some() && !(dist > 0.0) {
                return Err(SimError::arg(format!(
                    "tet face {face} has a neighbour but non-positive centroid distance {dist}"
                )));
            }
        }
        self.tets.push(TetDef {
            comp,
            vol,
            areas,
            dists,
            next,
        });
        Ok(self.tets.len() - 1)
    }

    /// Adds one surface triangle: owning patch, area, and the inner and
    /// outer adjacent tets. Returns the triangle index.
    pub fn add_tri(
        &mut self,
        patch: usize,
        area: f64,
        inner: Option<usize>,
        outer: Option<usize>,
    ) -> SimResult<usize> {
        if !(area > 0.0) {
            return Err(SimError::arg(format!("tri area must be positive, got {area}")));
        }
        self.tris.push(TriDef {
            patch,
            area,
            inner,
            outer,
        });
        Ok(self.tris.len() - 1)
    }

    /// Cross-checks the mesh against the model: membership indices in
    /// range, neighbour references valid and mutually consistent.
    pub(crate) fn validate(&self, model: &Model) -> SimResult<()> {
        let ntets = self.tets.len();
        for (tidx, tet) in self.tets.iter().enumerate() {
            model.check_comp(tet.comp).map_err(|_| {
                SimError::Shape(format!(
                    "tet {tidx} references compartment {} of {}",
                    tet.comp,
                    model.ncomps()
                ))
            })?;
            for (face, &nb) in tet.next.iter().enumerate() {
                if let Some(nb) = nb {
                    if nb >= ntets {
                        return Err(SimError::Shape(format!(
                            "tet {tidx} face {face} references tet {nb} of {ntets}"
                        )));
                    }
                    if nb == tidx {
                        return Err(SimError::Shape(format!("tet {tidx} neighbours itself")));
                    }
                }
            }
        }
        for (ridx, tri) in self.tris.iter().enumerate() {
            model.check_patch(tri.patch).map_err(|_| {
                SimError::Shape(format!(
                    "tri {ridx} references patch {} of {}",
                    tri.patch,
                    model.npatches()
                ))
            })?;
            if tri.inner.is_none() && tri.outer.is_none() {
                return Err(SimError::Shape(format!("tri {ridx} has no adjacent tet")));
            }
            for tet in [tri.inner, tri.outer].into_iter().flatten() {
                if tet >= ntets {
                    return Err(SimError::Shape(format!(
                        "tri {ridx} references tet {tet} of {ntets}"
                    )));
                }
            }
        }
        Ok(())
    }
}
