//! Convergence diagnostics and posterior summaries.
//!
//! - Split-R̂ (Gelman et al., BDA3 §11.4): each chain is split in half and the
//!   between/within variance ratio of the halves is reported.
//! - Effective sample size from the multi-chain variogram with Geyer's
//!   initial positive sequence truncation.
//! - Bayesian R² (Gelman, Goodrich, Gabry & Vehtari, 2019) per posterior draw.

use crate::inference::draws::sigmoid;
use ndarray::{Array2, Array3, ArrayView2, Axis, s};
use serde::{Deserialize, Serialize};

/// Linear-interpolated quantile of an unsorted sample (type 7, as R's default).
pub fn quantile(values: &[f64], prob: f64) -> f64 {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| !v.is_nan()).collect();
    if sorted.is_empty() {
        return f64::NAN;
    }
    sorted.sort_by(|a, b| a.total_cmp(b));
    quantile_sorted(&sorted, prob)
}

/// Quantile of an already sorted sample.
pub fn quantile_sorted(sorted: &[f64], prob: f64) -> f64 {
    match sorted.len() {
        0 => f64::NAN,
        1 => sorted[0],
        n => {
            let h = (n - 1) as f64 * prob.clamp(0.0, 1.0);
            let lo = h.floor() as usize;
            let hi = (lo + 1).min(n - 1);
            if sorted[hi] == sorted[lo] {
                return sorted[lo];
            }
            sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
        }
    }
}

/// Splits every chain of one parameter into halves: [2 * chains, half].
fn split_halves(chains: ArrayView2<f64>) -> Array2<f64> {
    let (m, n) = chains.dim();
    let half = n / 2;
    let mut out = Array2::<f64>::zeros((2 * m, half));
    for c in 0..m {
        out.row_mut(2 * c).assign(&chains.slice(s![c, ..half]));
        out.row_mut(2 * c + 1).assign(&chains.slice(s![c, n - half..]));
    }
    out
}

/// Returns (W, var⁺) for chains laid out as [chains, draws].
fn variance_components(chains: ArrayView2<f64>) -> (f64, f64) {
    let (m, n) = chains.dim();
    let chain_means = chains.mean_axis(Axis(1)).unwrap_or_default();
    let grand_mean = chain_means.mean().unwrap_or(0.0);
    let between = if m > 1 {
        n as f64 / (m - 1) as f64 * chain_means.mapv(|v| (v - grand_mean).powi(2)).sum()
    } else {
        0.0
    };
    let within = chains.var_axis(Axis(1), 1.0).mean().unwrap_or(0.0);
    let var_plus = (n as f64 - 1.0) / n as f64 * within + between / n as f64;
    (within, var_plus)
}

/// Split-R̂ of one parameter. `chains` is [chains, draws].
pub fn split_rhat(chains: ArrayView2<f64>) -> f64 {
    if chains.ncols() < 4 {
        return f64::NAN;
    }
    let halves = split_halves(chains);
    let (within, var_plus) = variance_components(halves.view());
    if within <= 0.0 {
        // Constant chains: agreeing constants have converged, disagreeing ones have not.
        return if var_plus <= 0.0 { 1.0 } else { f64::INFINITY };
    }
    (var_plus / within).sqrt()
}

/// Effective sample size of one parameter. `chains` is [chains, draws].
pub fn effective_sample_size(chains: ArrayView2<f64>) -> f64 {
    let (m, n) = chains.dim();
    let total = (m * n) as f64;
    if n < 4 {
        return total;
    }
    let (within, var_plus) = variance_components(chains);
    if within <= 0.0 || var_plus <= 0.0 {
        return total;
    }

    let rho = |lag: usize| -> f64 {
        let mut variogram = 0.0;
        for c in 0..m {
            let row = chains.row(c);
            for t in lag..n {
                let d = row[t] - row[t - lag];
                variogram += d * d;
            }
        }
        variogram /= (m * (n - lag)) as f64;
        1.0 - variogram / (2.0 * var_plus)
    };

    // Geyer: sum autocorrelation pairs while they remain positive.
    let mut sum = 0.0;
    let mut lag = 1;
    while lag + 1 < n {
        let pair = rho(lag) + rho(lag + 1);
        if pair <= 0.0 {
            break;
        }
        sum += pair;
        lag += 2;
    }
    let ess = total / (1.0 + 2.0 * sum);
    ess.min(total * total.log10().max(1.0))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSummary {
    pub name: String,
    pub mean: f64,
    pub sd: f64,
    pub q025: f64,
    pub q50: f64,
    pub q975: f64,
    pub rhat: f64,
    pub ess: f64,
}

/// Summaries for every parameter of draws laid out as [chains, draws, dim].
pub fn summarize_parameters(chains: &Array3<f64>, names: &[String]) -> Vec<ParameterSummary> {
    names
        .iter()
        .enumerate()
        .map(|(k, name)| {
            let per_chain = chains.index_axis(Axis(2), k);
            let flat: Vec<f64> = per_chain.iter().copied().collect();
            let n = flat.len() as f64;
            let mean = flat.iter().sum::<f64>() / n;
            let sd = if flat.len() > 1 {
                (flat.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)).sqrt()
            } else {
                0.0
            };
            let mut sorted = flat;
            sorted.sort_by(|a, b| a.total_cmp(b));
            ParameterSummary {
                name: name.clone(),
                mean,
                sd,
                q025: quantile_sorted(&sorted, 0.025),
                q50: quantile_sorted(&sorted, 0.5),
                q975: quantile_sorted(&sorted, 0.975),
                rhat: split_rhat(per_chain),
                ess: effective_sample_size(per_chain),
            }
        })
        .collect()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntervalSummary {
    pub median: f64,
    pub lower: f64,
    pub upper: f64,
}

impl IntervalSummary {
    pub fn from_sample(values: &[f64]) -> Self {
        Self {
            median: quantile(values, 0.5),
            lower: quantile(values, 0.025),
            upper: quantile(values, 0.975),
        }
    }
}

/// Bayesian R² of a logistic model: var(μ) / (var(μ) + mean(μ(1−μ))) per draw.
///
/// `draws` is [n_draws, 1 + p]; `x` excludes the intercept column.
pub fn bayes_r2(draws: ArrayView2<f64>, x: ArrayView2<f64>) -> IntervalSummary {
    let slopes = draws.slice(s![.., 1..]);
    let eta = slopes.dot(&x.t());
    let values: Vec<f64> = eta
        .axis_iter(Axis(0))
        .zip(draws.column(0).iter())
        .map(|(row, &alpha)| {
            let mu = row.mapv(|e| sigmoid(e + alpha));
            let fit_var = mu.var(1.0);
            let residual_var = mu.mapv(|p| p * (1.0 - p)).mean().unwrap_or(0.0);
            fit_var / (fit_var + residual_var)
        })
        .collect();
    IntervalSummary::from_sample(&values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{Array2, array};
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::StandardNormal;

    fn iid_chains(m: usize, n: usize, offsets: &[f64], seed: u64) -> Array2<f64> {
        let mut rng = StdRng::seed_from_u64(seed);
        Array2::from_shape_fn((m, n), |(c, _)| {
            offsets[c] + rng.sample::<f64, _>(StandardNormal)
        })
    }

    #[test]
    fn quantiles_interpolate() {
        let values = [4.0, 1.0, 3.0, 2.0, 5.0];
        assert_abs_diff_eq!(quantile(&values, 0.5), 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(quantile(&values, 0.25), 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(quantile(&values, 0.1), 1.4, epsilon = 1e-12);
        assert!(quantile(&[], 0.5).is_nan());
    }

    #[test]
    fn rhat_is_near_one_for_mixed_chains() {
        let chains = iid_chains(4, 500, &[0.0; 4], 1);
        let rhat = split_rhat(chains.view());
        assert!((rhat - 1.0).abs() < 0.01, "rhat {rhat}");
    }

    #[test]
    fn rhat_flags_disagreeing_chains() {
        let chains = iid_chains(4, 500, &[0.0, 0.0, 3.0, 3.0], 2);
        assert!(split_rhat(chains.view()) > 1.1);
    }

    #[test]
    fn ess_of_independent_draws_is_close_to_total() {
        let chains = iid_chains(4, 500, &[0.0; 4], 3);
        let ess = effective_sample_size(chains.view());
        assert!(ess > 1400.0 && ess < 2700.0, "ess {ess}");
    }

    #[test]
    fn ess_of_autocorrelated_draws_is_small() {
        let mut rng = StdRng::seed_from_u64(4);
        let mut chains = Array2::<f64>::zeros((2, 1000));
        for c in 0..2 {
            let mut state = 0.0;
            for t in 0..1000 {
                state = 0.95 * state + rng.sample::<f64, _>(StandardNormal);
                chains[(c, t)] = state;
            }
        }
        let ess = effective_sample_size(chains.view());
        assert!(ess < 300.0, "ess {ess}");
    }

    #[test]
    fn bayes_r2_is_zero_without_signal_and_grows_with_it() {
        let x = Array2::from_shape_fn((50, 1), |(i, _)| -2.0 + 0.08 * i as f64);
        let flat = array![[0.0, 0.0], [0.1, 0.0]];
        let strong = array![[0.0, 3.0], [0.1, 3.2]];
        let none = bayes_r2(flat.view(), x.view());
        let some = bayes_r2(strong.view(), x.view());
        assert_abs_diff_eq!(none.median, 0.0, epsilon = 1e-12);
        assert!(some.median > 0.3);
        assert!(some.lower <= some.median && some.median <= some.upper);
    }

    #[test]
    fn summaries_cover_every_parameter() {
        let mut chains = Array3::<f64>::zeros((2, 100, 2));
        for c in 0..2 {
            for d in 0..100 {
                chains[(c, d, 0)] = d as f64;
                chains[(c, d, 1)] = 1.0;
            }
        }
        let names = vec!["(Intercept)".to_string(), "x".to_string()];
        let summary = summarize_parameters(&chains, &names);
        assert_eq!(summary.len(), 2);
        assert_abs_diff_eq!(summary[0].mean, 49.5, epsilon = 1e-12);
        assert_abs_diff_eq!(summary[1].sd, 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(summary[1].rhat, 1.0, epsilon = 1e-12);
    }
}
