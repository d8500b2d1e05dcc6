//! Projection-predictive forward search.
//!
//! The reference posterior draws are partitioned into clusters. A candidate
//! submodel is projected once per cluster (onto the cluster's mean predictive
//! probabilities), and its leave-one-out predictive density is estimated with
//! the reference model's Pareto-smoothed LOO weights aggregated per cluster:
//!
//! ```text
//! elpd_i = log Σ_c W_ic p(y_i | θ⊥_c),   W_ic = Σ_{s ∈ c} w_is
//! ```
//!
//! Observations whose reference LOO weights are not computable are excluded
//! from every submodel and from the reference in the same way.

use crate::config::SelectionConfig;
use crate::data::ModelFrame;
use crate::inference::draws::{ScoringError, bernoulli_log_lik, sigmoid};
use crate::parallel::{create_progress_bar, stream_seed};
use crate::inference::reference::ReferenceModel;
use crate::selection::projection::{ProjectionError, kl_project, with_intercept};
use crate::selection::psis::{PARETO_K_WARNING, log_sum_exp, psis_loo, sum_and_se};
use ndarray::{Array2, Axis};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stream index of the draw clustering.
const CLUSTER_STREAM: usize = 0x434C_5553;

#[derive(Error, Debug)]
pub enum SelectionError {
    #[error("The reference model has no features to rank.")]
    NoFeatures,
    #[error("No observation has a computable leave-one-out term.")]
    NoComputableObservations,
    #[error("Scoring the reference model failed: {0}")]
    Scoring(#[from] ScoringError),
    #[error("Projection of a candidate submodel failed: {0}")]
    Projection(#[from] ProjectionError),
}

/// Utility of the submodel of one size along the search path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SizeSummary {
    pub size: usize,
    /// Feature added at this size; `None` for the intercept-only model.
    pub added: Option<String>,
    pub elpd: f64,
    pub elpd_se: f64,
    /// Difference to the reference model's LOO elpd.
    pub diff: f64,
    pub diff_se: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectionResult {
    pub suggested_size: usize,
    pub reference_elpd: f64,
    pub reference_elpd_se: f64,
    /// Observations excluded because their LOO term was not computable.
    pub n_not_computable: usize,
    /// Observations with Pareto k̂ above 0.7.
    pub n_high_pareto_k: usize,
    /// Features ordered from most to least informative.
    pub ranking: Vec<String>,
    pub pareto_k: Vec<f64>,
    pub path: Vec<SizeSummary>,
}

impl SelectionResult {
    /// The first `size` features of the ranking.
    pub fn top(&self, size: usize) -> &[String] {
        &self.ranking[..size.min(self.ranking.len())]
    }
}

/// Random partition of `n_draws` draws into at most `n_clusters` clusters.
pub fn cluster_draws(n_draws: usize, n_clusters: usize, seed: u64) -> Vec<Vec<usize>> {
    let n_clusters = n_clusters.clamp(1, n_draws.max(1));
    let mut order: Vec<usize> = (0..n_draws).collect();
    let mut rng = StdRng::seed_from_u64(stream_seed(seed, CLUSTER_STREAM));
    order.shuffle(&mut rng);
    let mut clusters = vec![Vec::new(); n_clusters];
    for (position, draw) in order.into_iter().enumerate() {
        clusters[position % n_clusters].push(draw);
    }
    for cluster in &mut clusters {
        cluster.sort_unstable();
    }
    clusters
}

/// Everything a candidate evaluation needs, computed once per search.
struct SearchContext<'a> {
    frame: &'a ModelFrame,
    /// Cluster mean predictive probabilities, [clusters, observations].
    targets: Array2<f64>,
    /// Log of the summed LOO weights per cluster, [clusters, observations].
    log_weights: Array2<f64>,
    missing: Vec<bool>,
    regularization: f64,
}

impl SearchContext<'_> {
    /// Pointwise LOO elpd of the submodel on `columns` of the frame.
    fn pointwise_elpd(&self, columns: &[usize]) -> Result<Vec<f64>, SelectionError> {
        let x = self.frame.x.select(Axis(1), columns);
        let design = with_intercept(x.view());
        let n_obs = self.frame.n_obs();
        let mut log_terms = Array2::<f64>::zeros((self.targets.nrows(), n_obs));
        for (c, target) in self.targets.axis_iter(Axis(0)).enumerate() {
            let (theta, _) = kl_project(design.view(), target, self.regularization)?;
            let eta = design.dot(&theta);
            for i in 0..n_obs {
                log_terms[(c, i)] =
                    self.log_weights[(c, i)] + bernoulli_log_lik(self.frame.y[i], eta[i]);
            }
        }
        Ok((0..n_obs)
            .map(|i| {
                if self.missing[i] {
                    f64::NAN
                } else {
                    log_sum_exp(log_terms.column(i).iter().copied())
                }
            })
            .collect())
    }
}

fn summarize_size(
    size: usize,
    added: Option<String>,
    pointwise: &[f64],
    reference_pointwise: &[f64],
    missing: &[bool],
) -> SizeSummary {
    let (elpd, elpd_se) = sum_and_se(pointwise, missing);
    let diffs: Vec<f64> = pointwise
        .iter()
        .zip(reference_pointwise)
        .map(|(s, r)| s - r)
        .collect();
    let (diff, diff_se) = sum_and_se(&diffs, missing);
    SizeSummary {
        size,
        added,
        elpd,
        elpd_se,
        diff,
        diff_se,
    }
}

/// Smallest size whose elpd is within `se_multiplier` standard errors of the
/// reference. `None` when no size qualifies.
pub fn suggest_size(path: &[SizeSummary], se_multiplier: f64) -> Option<usize> {
    path.iter()
        .find(|s| s.diff + se_multiplier * s.diff_se >= 0.0)
        .map(|s| s.size)
}

/// Ranks the reference model's features by forward search.
pub fn forward_search(
    reference: &ReferenceModel,
    frame: &ModelFrame,
    config: &SelectionConfig,
    seed: u64,
) -> Result<SelectionResult, SelectionError> {
    let n_features = frame.n_features();
    if n_features == 0 {
        return Err(SelectionError::NoFeatures);
    }
    let max_size = config.max_size.unwrap_or(n_features).min(n_features);
    let n_obs = frame.n_obs();

    let eta = reference.coefficients.linear_predictors(frame.x.view())?;
    let mut log_lik = eta.clone();
    for (i, mut column) in log_lik.axis_iter_mut(Axis(1)).enumerate() {
        let y = frame.y[i];
        column.mapv_inplace(|e| bernoulli_log_lik(y, e));
    }
    let loo = psis_loo(log_lik.view());
    let missing = loo.missing();
    let n_not_computable = missing.iter().filter(|&&m| m).count();
    if n_not_computable == n_obs {
        return Err(SelectionError::NoComputableObservations);
    }
    if n_not_computable > 0 {
        log::warn!(
            "{n_not_computable} observation(s) have non-finite LOO weights and are excluded from every submodel comparison."
        );
    }
    let n_high_pareto_k = loo.n_high_k();
    if n_high_pareto_k > 0 {
        log::warn!(
            "{n_high_pareto_k} observation(s) have Pareto k above {PARETO_K_WARNING}; their LOO estimates are unreliable."
        );
    }
    let (reference_elpd, reference_elpd_se) = sum_and_se(&loo.pointwise, &missing);
    log::info!("Reference model LOO elpd: {reference_elpd:.2} (se {reference_elpd_se:.2})");

    let clusters = cluster_draws(eta.nrows(), config.search_clusters, seed);
    let mut targets = Array2::<f64>::zeros((clusters.len(), n_obs));
    let mut log_weights = Array2::<f64>::zeros((clusters.len(), n_obs));
    for (c, members) in clusters.iter().enumerate() {
        for i in 0..n_obs {
            let mean_p = members.iter().map(|&s| sigmoid(eta[(s, i)])).sum::<f64>()
                / members.len() as f64;
            targets[(c, i)] = mean_p;
            log_weights[(c, i)] = log_sum_exp(members.iter().map(|&s| loo.log_weights[(s, i)]));
        }
    }
    let context = SearchContext {
        frame,
        targets,
        log_weights,
        missing,
        regularization: config.regularization,
    };

    let intercept_only = context.pointwise_elpd(&[])?;
    let mut path = vec![summarize_size(
        0,
        None,
        &intercept_only,
        &loo.pointwise,
        &context.missing,
    )];

    let evaluations: usize = (0..max_size).map(|k| n_features - k).sum();
    let progress = create_progress_bar(evaluations as u64, "forward search");
    let mut selected: Vec<usize> = Vec::with_capacity(max_size);
    while selected.len() < max_size {
        let candidates: Vec<usize> = (0..n_features).filter(|j| !selected.contains(j)).collect();
        let results: Vec<(usize, Vec<f64>)> = candidates
            .par_iter()
            .map(|&j| {
                let mut columns = selected.clone();
                columns.push(j);
                let pointwise = context.pointwise_elpd(&columns);
                progress.inc(1);
                pointwise.map(|p| (j, p))
            })
            .collect::<Result<_, _>>()?;

        let mut best: Option<(usize, f64, Vec<f64>)> = None;
        for (j, pointwise) in results {
            let (elpd, _) = sum_and_se(&pointwise, &context.missing);
            let better = match &best {
                None => true,
                Some((_, best_elpd, _)) => elpd > *best_elpd,
            };
            if better {
                best = Some((j, elpd, pointwise));
            }
        }
        let Some((chosen, elpd, pointwise)) = best else {
            break;
        };
        selected.push(chosen);
        let name = frame.feature_names[chosen].clone();
        log::info!("Step {}: added '{name}' (elpd {elpd:.2})", selected.len());
        path.push(summarize_size(
            selected.len(),
            Some(name),
            &pointwise,
            &loo.pointwise,
            &context.missing,
        ));
    }
    progress.finish_and_clear();

    let suggested_size = match suggest_size(&path, config.se_multiplier) {
        Some(size) => size,
        None => {
            log::warn!(
                "No submodel size reaches the reference model's elpd within {} standard error(s); suggesting the largest searched size {max_size}.",
                config.se_multiplier
            );
            max_size
        }
    };
    log::info!("Suggested submodel size: {suggested_size}");

    Ok(SelectionResult {
        suggested_size,
        reference_elpd,
        reference_elpd_se,
        n_not_computable,
        n_high_pareto_k,
        ranking: selected
            .iter()
            .map(|&j| frame.feature_names[j].clone())
            .collect(),
        pareto_k: loo.pareto_k,
        path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PriorConfig, SamplerConfig};
    use crate::inference::reference::fit_reference_model;
    use ndarray::Array1;
    use rand::Rng;
    use rand_distr::StandardNormal;

    fn signal_frame(n: usize, seed: u64) -> ModelFrame {
        let mut rng = StdRng::seed_from_u64(seed);
        let x = Array2::from_shape_fn((n, 4), |_| rng.sample::<f64, _>(StandardNormal));
        let y: Array1<f64> = x
            .rows()
            .into_iter()
            .map(|row| {
                let p = sigmoid(2.5 * row[2] - 1.5 * row[0]);
                if rng.gen_range(0.0..1.0) < p { 1.0 } else { 0.0 }
            })
            .collect();
        ModelFrame {
            feature_names: vec!["n1".into(), "n2".into(), "strong".into(), "n3".into()],
            x,
            y,
            rows: (0..n).collect(),
            dropped: 0,
        }
    }

    fn quick_reference(frame: &ModelFrame) -> ReferenceModel {
        let sampler = SamplerConfig {
            chains: 2,
            warmup: 150,
            draws: 150,
            ..SamplerConfig::default()
        };
        fit_reference_model(frame, &PriorConfig::default(), &sampler, 17).unwrap()
    }

    #[test]
    fn clusters_partition_every_draw_once() {
        let clusters = cluster_draws(103, 10, 5);
        assert_eq!(clusters.len(), 10);
        let mut all: Vec<usize> = clusters.concat();
        all.sort_unstable();
        assert_eq!(all, (0..103).collect::<Vec<_>>());
        assert_eq!(clusters, cluster_draws(103, 10, 5));
        assert_eq!(cluster_draws(4, 10, 5).len(), 4);
    }

    #[test]
    fn suggestion_picks_the_smallest_adequate_size() {
        let step = |size: usize, diff: f64| SizeSummary {
            size,
            added: None,
            elpd: 0.0,
            elpd_se: 1.0,
            diff,
            diff_se: 2.0,
        };
        let path = vec![step(0, -30.0), step(1, -5.0), step(2, -1.5), step(3, 0.2)];
        assert_eq!(suggest_size(&path, 1.0), Some(2));
        assert_eq!(suggest_size(&path, 0.0), Some(3));
        assert_eq!(suggest_size(&path[..2], 1.0), None);
    }

    #[test]
    fn search_ranks_the_informative_features_first() {
        let frame = signal_frame(200, 8);
        let reference = quick_reference(&frame);
        let config = SelectionConfig {
            search_clusters: 10,
            ..SelectionConfig::default()
        };
        let result = forward_search(&reference, &frame, &config, 3).unwrap();
        assert_eq!(result.ranking.len(), 4);
        assert_eq!(result.ranking[0], "strong");
        assert_eq!(result.ranking[1], "n1");
        assert_eq!(result.path.len(), 5);
        assert!(result.path[1].elpd > result.path[0].elpd);
        assert!(result.suggested_size >= 2);
        assert_eq!(result.pareto_k.len(), 200);

        let again = forward_search(&reference, &frame, &config, 3).unwrap();
        assert_eq!(result, again);
    }

    #[test]
    fn max_size_limits_the_path() {
        let frame = signal_frame(120, 9);
        let reference = quick_reference(&frame);
        let config = SelectionConfig {
            search_clusters: 5,
            max_size: Some(2),
            ..SelectionConfig::default()
        };
        let result = forward_search(&reference, &frame, &config, 1).unwrap();
        assert_eq!(result.ranking.len(), 2);
        assert_eq!(result.path.last().map(|s| s.size), Some(2));
        assert_eq!(result.top(5).len(), 2);
    }
}
