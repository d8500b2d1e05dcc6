pub mod diagnostics;
pub mod draws;
pub mod faer_ndarray;
pub mod hmc;
pub mod posterior;
pub mod reference;

pub use draws::{CoefficientDraws, ScoringError};
pub use reference::{FitDiagnostics, FitError, INTERCEPT_NAME, ReferenceModel, fit_reference_model};
