//! Percentile bootstrap intervals for the discrimination metrics.

use crate::evaluate::cutpoint::optimal_cutpoint;
use crate::evaluate::roc::auc;
use crate::inference::diagnostics::quantile;
use crate::parallel::stream_seed;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Interval {
    pub lower: f64,
    pub upper: f64,
}

impl Interval {
    /// 2.5% and 97.5% percentiles; `NaN` bounds for an empty sample.
    pub fn percentile(values: &[f64]) -> Self {
        Self {
            lower: quantile(values, 0.025),
            upper: quantile(values, 0.975),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BootstrapIntervals {
    pub requested: usize,
    /// Resamples containing both classes.
    pub valid: usize,
    pub auc: Interval,
    pub sensitivity: Interval,
    pub specificity: Interval,
    pub cutpoint: Interval,
}

struct Replicate {
    auc: f64,
    sensitivity: f64,
    specificity: f64,
    cutpoint: f64,
}

fn replicate(
    scores: &[f64],
    positive: &[bool],
    min_specificity: f64,
    seed: u64,
    index: usize,
) -> Option<Replicate> {
    let n = scores.len();
    let mut rng = StdRng::seed_from_u64(stream_seed(seed, index));
    let mut sample_scores = Vec::with_capacity(n);
    let mut sample_positive = Vec::with_capacity(n);
    for _ in 0..n {
        let row = rng.gen_range(0..n);
        sample_scores.push(scores[row]);
        sample_positive.push(positive[row]);
    }
    let auc = auc(&sample_scores, &sample_positive).ok()?;
    let cut = optimal_cutpoint(&sample_scores, &sample_positive, min_specificity).ok()?;
    Some(Replicate {
        auc,
        sensitivity: cut.sensitivity,
        specificity: cut.specificity,
        cutpoint: cut.threshold,
    })
}

/// Resamples subjects with replacement `resamples` times. Each replicate owns
/// an RNG seeded from `(seed, replicate)`, so the intervals do not depend on
/// the number of workers.
pub fn bootstrap_metrics(
    scores: &[f64],
    positive: &[bool],
    min_specificity: f64,
    resamples: usize,
    seed: u64,
) -> BootstrapIntervals {
    let replicates: Vec<Option<Replicate>> = if scores.is_empty() {
        Vec::new()
    } else {
        (0..resamples)
            .into_par_iter()
            .map(|b| replicate(scores, positive, min_specificity, seed, b))
            .collect()
    };
    let valid: Vec<Replicate> = replicates.into_iter().flatten().collect();
    let skipped = resamples - valid.len();
    if skipped > 0 {
        log::warn!("{skipped} of {resamples} bootstrap resamples lacked a class and were skipped.");
    }

    let column = |f: fn(&Replicate) -> f64| -> Vec<f64> { valid.iter().map(f).collect() };
    BootstrapIntervals {
        requested: resamples,
        valid: valid.len(),
        auc: Interval::percentile(&column(|r: &Replicate| r.auc)),
        sensitivity: Interval::percentile(&column(|r: &Replicate| r.sensitivity)),
        specificity: Interval::percentile(&column(|r: &Replicate| r.specificity)),
        cutpoint: Interval::percentile(&column(|r: &Replicate| r.cutpoint)),
    }
}
