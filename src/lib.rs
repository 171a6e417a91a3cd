//! Exact stochastic simulation of reaction-diffusion systems.
//!
//! Chemical models are defined over either well-mixed compartments or a
//! tetrahedral mesh decomposition of 3D geometry, and advanced through
//! exact trajectories of the chemical master equation with Gillespie-style
//! direct-method sampling. Two engines share one design:
//!
//! - [`DirectSolver`] treats every compartment and patch as a single
//!   well-mixed pool.
//! - [`MeshSolver`] resolves compartments into tetrahedra and patches into
//!   surface triangles, adding diffusive jumps between neighbouring tets.
//!
//! Both keep every reaction, diffusion rule and surface reaction instance
//! as one kinetic process in a hierarchical propensity tree, so selecting
//! the next event and refreshing the propensities an event invalidates
//! stay cheap even with very large process counts.
//!
//! ```
//! use stochdiff::{Model, DirectSolver, SimRng, Solver};
//!
//! // A -> (): first-order decay in a 1 fL compartment.
//! let mut model = Model::new(1);
//! let comp = model.add_comp(1.0e-18).unwrap();
//! model.add_reac(comp, &[0], &[], 10.0).unwrap();
//!
//! let mut sim = DirectSolver::new(model, SimRng::seed_from_u64(7));
//! sim.set_comp_count(comp, 0, 1000.0).unwrap();
//! sim.run(1.0).unwrap();
//! assert!(sim.comp_count(comp, 0).unwrap() < 1000.0);
//! ```

pub mod direct;
pub mod ensemble;
pub mod error;
pub mod geom;
pub mod mesh;
pub mod model;
pub mod rng;
mod sched;
pub mod solver;

pub use direct::DirectSolver;
pub use error::{SimError, SimResult};
pub use geom::Mesh;
pub use mesh::MeshSolver;
pub use model::Model;
pub use rng::SimRng;
pub use solver::{Solver, AVOGADRO};

#[cfg(test)]
mod tests;
