//! Discrimination metrics of risk scores: AUC, a cutpoint constrained by a
//! specificity floor, bootstrap percentile intervals and per-subset reports.

pub mod bootstrap;
pub mod cutpoint;
pub mod roc;
pub mod subsets;

use thiserror::Error;

pub use subsets::{AnalysisSubset, MetricsRecord, SubsetEvaluation, evaluate_scores, evaluate_subsets};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvaluationError {
    #[error("not computable: {cases} case(s) and {controls} control(s) have a score")]
    DegenerateClasses { cases: usize, controls: usize },
    #[error("{scores} scores were given for {outcomes} outcomes")]
    LengthMismatch { scores: usize, outcomes: usize },
    #[error("no threshold reaches a specificity of {min_specificity}")]
    NoFeasibleCutpoint { min_specificity: f64 },
}
