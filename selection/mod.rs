//! Projection-predictive variable selection: PSIS-LOO utilities, KL
//! projection of the reference posterior and the forward search over
//! nested submodels.

pub mod projection;
pub mod psis;
pub mod search;

pub use projection::{ProjectedSubmodel, ProjectionError, project_submodel};
pub use search::{SelectionError, SelectionResult, SizeSummary, forward_search};
