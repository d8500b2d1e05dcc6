//! Metrics per analysis subset.
//!
//! Subsets are views over existing scores: "overall" is every subject, and a
//! subgroup subset is the cases of that subgroup together with all controls.
//! Subjects without a score are excluded and counted.

use crate::config::EvaluationConfig;
use crate::data::ObservationTable;
use crate::evaluate::EvaluationError;
use crate::evaluate::bootstrap::{BootstrapIntervals, bootstrap_metrics};
use crate::evaluate::cutpoint::{Cutpoint, optimal_cutpoint};
use crate::evaluate::roc::{RocPoint, auc, check_classes, roc_curve};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AnalysisSubset {
    Overall,
    Subgroup(String),
}

impl AnalysisSubset {
    pub fn label(&self) -> &str {
        match self {
            AnalysisSubset::Overall => "overall",
            AnalysisSubset::Subgroup(name) => name,
        }
    }

    pub fn contains(&self, table: &ObservationTable, row: usize) -> bool {
        match self {
            AnalysisSubset::Overall => true,
            AnalysisSubset::Subgroup(name) => {
                !table.is_case(row) || table.subgroup[row].as_deref() == Some(name.as_str())
            }
        }
    }

    /// "overall" followed by one subset per configured subgroup.
    pub fn from_config(config: &EvaluationConfig) -> Vec<Self> {
        std::iter::once(AnalysisSubset::Overall)
            .chain(config.subgroups.iter().cloned().map(AnalysisSubset::Subgroup))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub n_cases: usize,
    pub n_controls: usize,
    /// Subjects of the subset without a score.
    pub n_excluded: usize,
    pub auc: f64,
    pub cutpoint: Cutpoint,
    pub intervals: BootstrapIntervals,
}

/// Metrics of one score within one subset, or why they are not computable.
#[derive(Debug, Clone, PartialEq)]
pub struct SubsetEvaluation {
    pub score: String,
    pub subset: AnalysisSubset,
    pub metrics: Result<MetricsRecord, EvaluationError>,
}

/// Drops subjects without a score.
fn complete_pairs(scores: &[Option<f64>], positive: &[bool]) -> (Vec<f64>, Vec<bool>, usize) {
    let mut kept_scores = Vec::with_capacity(scores.len());
    let mut kept_positive = Vec::with_capacity(scores.len());
    for (score, &is_case) in scores.iter().zip(positive) {
        if let Some(value) = score {
            kept_scores.push(*value);
            kept_positive.push(is_case);
        }
    }
    let excluded = scores.len() - kept_scores.len();
    (kept_scores, kept_positive, excluded)
}

/// AUC, constrained cutpoint and bootstrap intervals of one score vector.
pub fn evaluate_scores(
    scores: &[Option<f64>],
    positive: &[bool],
    config: &EvaluationConfig,
    seed: u64,
) -> Result<MetricsRecord, EvaluationError> {
    if scores.len() != positive.len() {
        return Err(EvaluationError::LengthMismatch {
            scores: scores.len(),
            outcomes: positive.len(),
        });
    }
    let (values, labels, n_excluded) = complete_pairs(scores, positive);
    let (n_cases, n_controls) = check_classes(&values, &labels)?;
    let auc = auc(&values, &labels)?;
    let cutpoint = optimal_cutpoint(&values, &labels, config.min_specificity)?;
    let intervals = bootstrap_metrics(
        &values,
        &labels,
        config.min_specificity,
        config.bootstrap_resamples,
        seed,
    );
    Ok(MetricsRecord {
        n_cases,
        n_controls,
        n_excluded,
        auc,
        cutpoint,
        intervals,
    })
}

fn subset_pairs(
    table: &ObservationTable,
    scores: &[Option<f64>],
    subset: &AnalysisSubset,
) -> (Vec<Option<f64>>, Vec<bool>) {
    (0..table.n_rows())
        .filter(|&row| subset.contains(table, row))
        .map(|row| (scores[row], table.is_case(row)))
        .unzip()
}

/// Evaluates `scores` (one per table row) within every configured subset.
pub fn evaluate_subsets(
    table: &ObservationTable,
    score_name: &str,
    scores: &[Option<f64>],
    config: &EvaluationConfig,
    seed: u64,
) -> Result<Vec<SubsetEvaluation>, EvaluationError> {
    if scores.len() != table.n_rows() {
        return Err(EvaluationError::LengthMismatch {
            scores: scores.len(),
            outcomes: table.n_rows(),
        });
    }
    Ok(AnalysisSubset::from_config(config)
        .into_iter()
        .map(|subset| {
            let (subset_scores, positive) = subset_pairs(table, scores, &subset);
            let metrics = evaluate_scores(&subset_scores, &positive, config, seed);
            if let Err(e) = &metrics {
                log::warn!(
                    "Metrics for score '{score_name}' in subset '{}' are not computable: {e}",
                    subset.label()
                );
            }
            SubsetEvaluation {
                score: score_name.to_string(),
                subset,
                metrics,
            }
        })
        .collect())
}

/// ROC points of a score over all subjects with a score.
pub fn overall_roc(
    table: &ObservationTable,
    scores: &[Option<f64>],
) -> Result<Vec<RocPoint>, EvaluationError> {
    let (subset_scores, positive) = subset_pairs(table, scores, &AnalysisSubset::Overall);
    let (values, labels, _) = complete_pairs(&subset_scores, &positive);
    roc_curve(&values, &labels)
}
