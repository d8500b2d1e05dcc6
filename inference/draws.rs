//! Posterior coefficient draws and the scores derived from them.
//!
//! Both the reference model and the projected submodel are represented by a
//! `CoefficientDraws`: a matrix with one row per posterior draw and columns
//! `[intercept, β_1, …, β_K]` in the order of `feature_names`. Scores are
//! always posterior-averaged probabilities, never plug-in point estimates.

use crate::data::ObservationTable;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Linear predictors are clamped before exponentiation.
const ETA_CLAMP: f64 = 700.0;

/// Probabilities are kept away from 0 and 1 inside log-likelihoods.
const PROB_FLOOR: f64 = 1e-12;

#[inline]
pub fn sigmoid(eta: f64) -> f64 {
    let eta = eta.clamp(-ETA_CLAMP, ETA_CLAMP);
    if eta >= 0.0 {
        1.0 / (1.0 + (-eta).exp())
    } else {
        let e = eta.exp();
        e / (1.0 + e)
    }
}

/// Bernoulli log-likelihood of a single 0/1 outcome at linear predictor `eta`.
#[inline]
pub fn bernoulli_log_lik(y: f64, eta: f64) -> f64 {
    let p = sigmoid(eta).clamp(PROB_FLOOR, 1.0 - PROB_FLOOR);
    y * p.ln() + (1.0 - y) * (1.0 - p).ln()
}

#[derive(Error, Debug)]
pub enum ScoringError {
    #[error("Model feature '{0}' is not a column of the observation table.")]
    FeatureNotInTable(String),
    #[error("Design matrix has {found} columns but the model has {expected} features.")]
    DimensionMismatch { found: usize, expected: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientDraws {
    pub feature_names: Vec<String>,
    /// Shape: [n_draws, 1 + n_features]; column 0 is the intercept.
    pub draws: Array2<f64>,
}

impl CoefficientDraws {
    pub fn n_draws(&self) -> usize {
        self.draws.nrows()
    }

    pub fn n_features(&self) -> usize {
        self.feature_names.len()
    }

    pub fn intercepts(&self) -> ArrayView1<'_, f64> {
        self.draws.column(0)
    }

    /// Coefficient columns without the intercept.
    pub fn slopes(&self) -> ArrayView2<'_, f64> {
        self.draws.slice(ndarray::s![.., 1..])
    }

    pub fn posterior_mean(&self) -> Array1<f64> {
        self.draws
            .mean_axis(Axis(0))
            .unwrap_or_else(|| Array1::zeros(self.draws.ncols()))
    }

    /// Linear predictors for every (draw, row) pair: shape [n_draws, n_rows].
    pub fn linear_predictors(&self, x: ArrayView2<f64>) -> Result<Array2<f64>, ScoringError> {
        if x.ncols() != self.n_features() {
            return Err(ScoringError::DimensionMismatch {
                found: x.ncols(),
                expected: self.n_features(),
            });
        }
        let mut eta = self.slopes().dot(&x.t());
        for (mut row, &alpha) in eta.axis_iter_mut(Axis(0)).zip(self.intercepts().iter()) {
            row += alpha;
        }
        Ok(eta)
    }

    /// Posterior-averaged probability `mean_s sigmoid(η_s)` for each row of `x`.
    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ScoringError> {
        let eta = self.linear_predictors(x)?;
        let n_draws = eta.nrows().max(1) as f64;
        Ok(eta.map(|&e| sigmoid(e)).sum_axis(Axis(0)) / n_draws)
    }

    /// Scores every row of `table` on the 0–100 scale.
    ///
    /// Rows with a missing value in any of this model's features receive `None`.
    pub fn score_table(&self, table: &ObservationTable) -> Result<Vec<Option<f64>>, ScoringError> {
        let columns = self
            .feature_names
            .iter()
            .map(|name| {
                table
                    .column_index(name)
                    .ok_or_else(|| ScoringError::FeatureNotInTable(name.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let complete: Vec<usize> = (0..table.n_rows())
            .filter(|&row| columns.iter().all(|&c| table.features[(row, c)].is_finite()))
            .collect();
        let x = Array2::from_shape_fn((complete.len(), columns.len()), |(i, j)| {
            table.features[(complete[i], columns[j])]
        });
        let probabilities = self.predict_proba(x.view())?;

        let mut scores = vec![None; table.n_rows()];
        for (slot, &row) in complete.iter().enumerate() {
            scores[row] = Some((100.0 * probabilities[slot]).clamp(0.0, 100.0));
        }
        Ok(scores)
    }
}
