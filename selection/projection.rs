//! Kullback-Leibler projection of the reference posterior onto a submodel.
//!
//! A submodel is not refitted to the observed outcomes. For every projected
//! reference draw `s`, the submodel coefficients minimize
//!
//! ```text
//! Σ_i KL( Bernoulli(μ_si) ‖ Bernoulli(sigmoid([1, x_i,K] θ)) ) + ½ λ ‖θ_{1..K}‖²
//! ```
//!
//! where `μ_si` is the reference predictive probability of observation `i`
//! under draw `s`. This is a logistic regression with fractional targets,
//! solved here by penalized IRLS.

use crate::config::ProjectionConfig;
use crate::data::ModelFrame;
use crate::inference::draws::{CoefficientDraws, ScoringError, sigmoid};
use crate::inference::faer_ndarray::{FaerCholesky, FaerLinalgError};
use crate::parallel::stream_seed;
use crate::inference::reference::ReferenceModel;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::index;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const IRLS_MAX_ITERATIONS: usize = 50;
const IRLS_TOLERANCE: f64 = 1e-9;

/// Stream index of the projection draw subsample.
const PROJECTION_STREAM: usize = 0x5052_4F4A;

#[derive(Error, Debug)]
pub enum ProjectionError {
    #[error("A submodel needs at least one feature.")]
    EmptySubmodel,
    #[error("Submodel size {size} exceeds the {available} ranked features.")]
    SizeExceedsRanking { size: usize, available: usize },
    #[error("Feature '{0}' is not part of the reference model.")]
    FeatureNotInReference(String),
    #[error("The reference model has no posterior draws.")]
    NoDraws,
    #[error("Scoring the reference model failed: {0}")]
    Scoring(#[from] ScoringError),
    #[error("Linear algebra failure during projection: {0}")]
    Linalg(#[from] FaerLinalgError),
}

/// Prepends a column of ones.
pub fn with_intercept(x: ArrayView2<f64>) -> Array2<f64> {
    let ones = Array2::<f64>::ones((x.nrows(), 1));
    concatenate![Axis(1), ones, x]
}

/// Mean Bernoulli KL divergence from the target probabilities to `p`.
pub fn mean_kl(target: ArrayView1<f64>, p: ArrayView1<f64>) -> f64 {
    let term = |a: f64, b: f64| if a <= 0.0 { 0.0 } else { a * (a / b.max(1e-300)).ln() };
    let total: f64 = target
        .iter()
        .zip(p.iter())
        .map(|(&mu, &pi)| term(mu, pi) + term(1.0 - mu, 1.0 - pi))
        .sum();
    total / target.len().max(1) as f64
}

/// Projects one vector of target probabilities onto `design` (intercept first).
///
/// Returns the coefficients and the mean KL divergence at the solution.
pub fn kl_project(
    design: ArrayView2<f64>,
    target: ArrayView1<f64>,
    regularization: f64,
) -> Result<(Array1<f64>, f64), ProjectionError> {
    let dim = design.ncols();
    let objective = |theta: &Array1<f64>| -> (f64, Array1<f64>) {
        let p = design.dot(theta).mapv(sigmoid);
        let penalty: f64 = theta.iter().skip(1).map(|t| t * t).sum::<f64>() * 0.5 * regularization;
        (mean_kl(target, p.view()) * target.len() as f64 + penalty, p)
    };

    let mut theta = Array1::<f64>::zeros(dim);
    let (mut value, mut p) = objective(&theta);
    for _ in 0..IRLS_MAX_ITERATIONS {
        let weights = p.mapv(|pi| (pi * (1.0 - pi)).max(1e-10));
        let mut gradient = design.t().dot(&(&target - &p));
        let weighted = &design * &weights.view().insert_axis(Axis(1));
        let mut hessian = design.t().dot(&weighted);
        for j in 1..dim {
            gradient[j] -= regularization * theta[j];
            hessian[(j, j)] += regularization;
        }
        let step = hessian.cholesky(Side::Lower)?.solve_vec(&gradient);

        let mut scale = 1.0;
        let mut improved = false;
        for _ in 0..20 {
            let candidate = &theta + &(&step * scale);
            let (candidate_value, candidate_p) = objective(&candidate);
            if candidate_value <= value + 1e-12 {
                theta = candidate;
                value = candidate_value;
                p = candidate_p;
                improved = true;
                break;
            }
            scale *= 0.5;
        }
        let change = step.iter().fold(0.0_f64, |m, v| m.max(v.abs())) * scale;
        if !improved || change < IRLS_TOLERANCE {
            break;
        }
    }
    Ok((theta, mean_kl(target, p.view())))
}

/// Posterior of a submodel obtained by projection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectedSubmodel {
    /// Mean KL divergence to the reference predictive distribution.
    pub mean_kl: f64,
    /// Reference draw each projected draw was computed from.
    pub source_draws: Vec<usize>,
    pub coefficients: CoefficientDraws,
}

impl ProjectedSubmodel {
    pub fn feature_names(&self) -> &[String] {
        &self.coefficients.feature_names
    }
}

/// Projects the reference posterior onto the first `size` features of `ranking`.
pub fn project_submodel(
    reference: &ReferenceModel,
    frame: &ModelFrame,
    ranking: &[String],
    size: usize,
    config: &ProjectionConfig,
    seed: u64,
) -> Result<ProjectedSubmodel, ProjectionError> {
    if size == 0 {
        return Err(ProjectionError::EmptySubmodel);
    }
    if size > ranking.len() {
        return Err(ProjectionError::SizeExceedsRanking {
            size,
            available: ranking.len(),
        });
    }
    let features = &ranking[..size];
    if let Some(unknown) = features
        .iter()
        .find(|f| !reference.feature_names().contains(f))
    {
        return Err(ProjectionError::FeatureNotInReference(unknown.clone()));
    }
    let x_sub = frame
        .select_columns(features)
        .ok_or_else(|| ProjectionError::FeatureNotInReference(features.join(", ")))?;
    let design = with_intercept(x_sub.view());

    let available = reference.coefficients.n_draws();
    if available == 0 {
        return Err(ProjectionError::NoDraws);
    }
    let source_draws: Vec<usize> = if config.draws >= available {
        (0..available).collect()
    } else {
        let mut rng = StdRng::seed_from_u64(stream_seed(seed, PROJECTION_STREAM));
        let mut picked = index::sample(&mut rng, available, config.draws).into_vec();
        picked.sort_unstable();
        picked
    };

    let selected = CoefficientDraws {
        feature_names: reference.feature_names().to_vec(),
        draws: reference.coefficients.draws.select(Axis(0), &source_draws),
    };
    let eta = selected.linear_predictors(frame.x.view())?;

    log::info!(
        "Projecting {} reference draws onto {} feature(s): {}",
        source_draws.len(),
        size,
        features.join(", ")
    );
    let projected: Vec<(Array1<f64>, f64)> = eta
        .axis_iter(Axis(0))
        .into_par_iter()
        .map(|row| {
            let target = row.mapv(sigmoid);
            kl_project(design.view(), target.view(), config.regularization)
        })
        .collect::<Result<_, _>>()?;

    let mut draws = Array2::<f64>::zeros((projected.len(), size + 1));
    let mut kl_total = 0.0;
    for (d, (theta, kl)) in projected.iter().enumerate() {
        draws.row_mut(d).assign(theta);
        kl_total += kl;
    }
    let mean_kl = kl_total / projected.len() as f64;
    log::info!("Projection finished; mean KL divergence to the reference is {mean_kl:.5}.");

    Ok(ProjectedSubmodel {
        mean_kl,
        source_draws,
        coefficients: CoefficientDraws {
            feature_names: features.to_vec(),
            draws,
        },
    })
}
