//! The reference model: a full-feature Bayesian logistic regression.

use crate::inference::diagnostics::{
    IntervalSummary, ParameterSummary, bayes_r2, summarize_parameters,
};
use crate::inference::draws::{CoefficientDraws, ScoringError};
use crate::inference::hmc::{WhitenedPosterior, run_hmc};
use crate::inference::posterior::{LogisticPosterior, PosteriorError, find_mode};
use crate::config::{PriorConfig, SamplerConfig};
use crate::data::ModelFrame;
use ndarray::{Array1, ArrayView2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const INTERCEPT_NAME: &str = "(Intercept)";

#[derive(Error, Debug)]
pub enum FitError {
    #[error("Posterior construction failed: {0}")]
    Posterior(#[from] PosteriorError),
    #[error("Sampler configuration is invalid: {0}")]
    InvalidSampler(String),
}

/// Sampler diagnostics of a reference fit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitDiagnostics {
    pub rhat_threshold: f64,
    pub max_rhat: f64,
    pub min_ess: f64,
    pub divergences: usize,
    pub step_sizes: Vec<f64>,
    pub acceptance: Vec<f64>,
    /// Parameters whose split-R̂ exceeds the threshold (or is undefined).
    pub non_converged: Vec<String>,
}

impl FitDiagnostics {
    pub fn converged(&self) -> bool {
        self.non_converged.is_empty() && self.divergences == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceModel {
    pub n_chains: usize,
    pub n_obs: usize,
    /// Posterior mode `[α, β_1, …, β_p]`.
    pub mode: Vec<f64>,
    pub coefficients: CoefficientDraws,
    pub summaries: Vec<ParameterSummary>,
    pub diagnostics: FitDiagnostics,
    /// Bayesian R² with a 95% interval.
    pub bayes_r2: IntervalSummary,
}

impl ReferenceModel {
    pub fn feature_names(&self) -> &[String] {
        &self.coefficients.feature_names
    }

    pub fn predict_proba(&self, x: ArrayView2<f64>) -> Result<Array1<f64>, ScoringError> {
        self.coefficients.predict_proba(x)
    }
}

/// Fits the reference model on a complete-case frame.
pub fn fit_reference_model(
    frame: &ModelFrame,
    prior: &PriorConfig,
    sampler: &SamplerConfig,
    seed: u64,
) -> Result<ReferenceModel, FitError> {
    if sampler.chains == 0 || sampler.draws == 0 {
        return Err(FitError::InvalidSampler(
            "at least one chain and one draw are required".to_string(),
        ));
    }
    log::info!(
        "Fitting reference model: {} observations, {} features, {} chains x ({} warmup + {} draws)",
        frame.n_obs(),
        frame.n_features(),
        sampler.chains,
        sampler.warmup,
        sampler.draws
    );

    let posterior = LogisticPosterior::new(frame.x.view(), frame.y.view(), prior)?;
    let mode = find_mode(&posterior)?;
    let target = WhitenedPosterior::new(posterior, &mode)?;
    let hmc = run_hmc(&target, sampler, seed);

    let mut names = Vec::with_capacity(frame.n_features() + 1);
    names.push(INTERCEPT_NAME.to_string());
    names.extend(frame.feature_names.iter().cloned());
    let summaries = summarize_parameters(&hmc.chains, &names);

    let dim = names.len();
    let total = sampler.chains * sampler.draws;
    let flat = hmc
        .chains
        .to_shape((total, dim))
        .map_err(|e| FitError::InvalidSampler(format!("draw layout: {e}")))?
        .to_owned();

    let non_converged: Vec<String> = summaries
        .iter()
        .filter(|s| s.rhat.is_nan() || s.rhat > sampler.rhat_threshold)
        .map(|s| s.name.clone())
        .collect();
    let max_rhat = summaries
        .iter()
        .map(|s| s.rhat)
        .fold(f64::NEG_INFINITY, f64::max);
    let min_ess = summaries.iter().map(|s| s.ess).fold(f64::INFINITY, f64::min);

    for summary in summaries.iter().filter(|s| non_converged.contains(&s.name)) {
        log::warn!(
            "Parameter '{}' has R-hat {:.4} above the threshold {:.2}; the posterior may not have converged.",
            summary.name,
            summary.rhat,
            sampler.rhat_threshold
        );
    }
    if hmc.divergences > 0 {
        log::warn!(
            "{} divergent transitions after warmup; consider a higher target acceptance rate.",
            hmc.divergences
        );
    }

    let r2 = bayes_r2(flat.view(), frame.x.view());
    log::info!(
        "Reference model Bayesian R2: {:.3} [{:.3}, {:.3}]",
        r2.median,
        r2.lower,
        r2.upper
    );

    Ok(ReferenceModel {
        n_chains: sampler.chains,
        n_obs: frame.n_obs(),
        mode: mode.beta.to_vec(),
        coefficients: CoefficientDraws {
            feature_names: frame.feature_names.clone(),
            draws: flat,
        },
        summaries,
        diagnostics: FitDiagnostics {
            rhat_threshold: sampler.rhat_threshold,
            max_rhat,
            min_ess,
            divergences: hmc.divergences,
            step_sizes: hmc.step_sizes,
            acceptance: hmc.acceptance,
            non_converged,
        },
        bayes_r2: r2,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{Array1, Array2};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn simulated_frame(n: usize, seed: u64) -> ModelFrame {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array2::from_shape_fn((n, 3), |_| rng.sample::<f64, _>(StandardNormal));
        let y: Array1<f64> = x
            .rows()
            .into_iter()
            .map(|row| {
                let eta = -0.2 + 1.5 * row[0] - 1.0 * row[1];
                let p = crate::inference::draws::sigmoid(eta);
                if rng.gen_range(0.0..1.0) < p { 1.0 } else { 0.0 }
            })
            .collect();
        ModelFrame {
            feature_names: vec!["a".into(), "b".into(), "noise".into()],
            x,
            y,
            rows: (0..n).collect(),
            dropped: 0,
        }
    }

    fn quick_sampler() -> SamplerConfig {
        SamplerConfig {
            chains: 2,
            warmup: 200,
            draws: 200,
            ..SamplerConfig::default()
        }
    }

    #[test]
    fn fit_recovers_signal_direction() {
        let frame = simulated_frame(200, 1);
        let model = fit_reference_model(&frame, &PriorConfig::default(), &quick_sampler(), 3)
            .unwrap();
        assert_eq!(model.coefficients.draws.shape(), &[400, 4]);
        assert_eq!(model.summaries[0].name, INTERCEPT_NAME);
        assert!(model.summaries[1].mean > 0.5);
        assert!(model.summaries[2].mean < -0.3);
        assert!(model.summaries[3].q025 < 0.0 && model.summaries[3].q975 > 0.0);
        assert!(model.bayes_r2.median > 0.0);
    }

    #[test]
    fn refit_with_same_seed_is_identical() {
        let frame = simulated_frame(120, 2);
        let first = fit_reference_model(&frame, &PriorConfig::default(), &quick_sampler(), 9)
            .unwrap();
        let second = fit_reference_model(&frame, &PriorConfig::default(), &quick_sampler(), 9)
            .unwrap();
        assert_eq!(first.summaries, second.summaries);
        assert_eq!(first, second);
    }

    #[test]
    fn impossible_threshold_reports_non_convergence() {
        let frame = simulated_frame(120, 4);
        let sampler = SamplerConfig {
            rhat_threshold: 0.5,
            ..quick_sampler()
        };
        let model = fit_reference_model(&frame, &PriorConfig::default(), &sampler, 1).unwrap();
        assert!(!model.diagnostics.converged());
        assert_eq!(model.diagnostics.non_converged.len(), 4);
    }

    #[test]
    fn zero_draws_is_rejected() {
        let frame = simulated_frame(50, 5);
        let sampler = SamplerConfig {
            draws: 0,
            ..quick_sampler()
        };
        assert!(matches!(
            fit_reference_model(&frame, &PriorConfig::default(), &sampler, 1),
            Err(FitError::InvalidSampler(_))
        ));
    }
}
