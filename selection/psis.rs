//! Pareto smoothed importance sampling for leave-one-out cross-validation.
//!
//! For observation `i` the LOO importance ratios of the posterior draws are
//! `r_s = 1 / p(y_i | θ_s)`. Their upper tail is replaced by order statistics
//! of a generalized Pareto distribution fitted to it (Vehtari, Gelman & Gabry,
//! 2017; Vehtari et al., 2024), and the shape estimate `k̂` of that fit is the
//! reliability diagnostic of the observation.

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

/// Pareto k̂ above which the LOO estimate of an observation is unreliable.
pub const PARETO_K_WARNING: f64 = 0.7;

/// Tail fits need at least this many exceedances.
const MIN_TAIL_LENGTH: usize = 5;

pub fn log_sum_exp<I>(values: I) -> f64
where
    I: IntoIterator<Item = f64>,
    I::IntoIter: Clone,
{
    let iter = values.into_iter();
    let max = iter.clone().fold(f64::NEG_INFINITY, f64::max);
    if max == f64::NEG_INFINITY || max.is_nan() {
        return max;
    }
    if max == f64::INFINITY {
        return f64::INFINITY;
    }
    max + iter.map(|v| (v - max).exp()).sum::<f64>().ln()
}

/// Zhang & Stephens (2009) estimate of the generalized Pareto parameters
/// `(k, σ)` for positive exceedances sorted in ascending order.
///
/// The shape estimate is shrunk towards 0.5 with a weakly informative prior
/// worth ten observations.
pub fn gpd_fit(sorted: &[f64]) -> (f64, f64) {
    let n = sorted.len();
    if n == 0 {
        return (f64::INFINITY, f64::NAN);
    }
    const PRIOR: f64 = 3.0;
    let nf = n as f64;
    let m = 30 + nf.sqrt().floor() as usize;
    let quartile_index = ((nf / 4.0 + 0.5).floor() as usize).clamp(1, n) - 1;
    let xstar = sorted[quartile_index];
    let x_max = sorted[n - 1];

    let theta: Vec<f64> = (1..=m)
        .map(|j| 1.0 / x_max + (1.0 - (m as f64 / (j as f64 - 0.5)).sqrt()) / (PRIOR * xstar))
        .collect();
    let profile: Vec<f64> = theta
        .iter()
        .map(|&t| {
            let k = sorted.iter().map(|&x| (-t * x).ln_1p()).sum::<f64>() / nf;
            nf * ((-t / k).ln() - k - 1.0)
        })
        .collect();
    let normalizer = log_sum_exp(profile.iter().copied().filter(|v| v.is_finite()));
    let mut theta_hat = 0.0;
    for (&t, &l) in theta.iter().zip(&profile) {
        if l.is_finite() {
            theta_hat += t * (l - normalizer).exp();
        }
    }

    let k = sorted.iter().map(|&x| (-theta_hat * x).ln_1p()).sum::<f64>() / nf;
    let sigma = -k / theta_hat;
    let k = k * nf / (nf + 10.0) + 10.0 * 0.5 / (nf + 10.0);
    (k, sigma)
}

/// Quantile function of the generalized Pareto distribution with location 0.
fn gpd_quantile(p: f64, k: f64, sigma: f64) -> f64 {
    if k == 0.0 {
        -sigma * (-p).ln_1p()
    } else {
        sigma * (-k * (-p).ln_1p()).exp_m1() / k
    }
}

/// Pareto-smooths one vector of log importance ratios.
///
/// Returns normalized log weights (they sum to one on the natural scale) and
/// the shape estimate `k̂`. `k̂` is infinite when the tail is too short or
/// constant to fit; the raw ratios are then normalized unsmoothed.
pub fn psis_smooth(log_ratios: ArrayView1<f64>) -> (Array1<f64>, f64) {
    let n_draws = log_ratios.len();
    let max = log_ratios.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
    let mut lw = log_ratios.mapv(|v| v - max);

    let tail_length = (0.2 * n_draws as f64)
        .min(3.0 * (n_draws as f64).sqrt())
        .ceil() as usize;
    let mut k_hat = f64::INFINITY;

    if tail_length >= MIN_TAIL_LENGTH && tail_length < n_draws {
        let mut order: Vec<usize> = (0..n_draws).collect();
        order.sort_by(|&a, &b| lw[a].total_cmp(&lw[b]));
        let cutoff = lw[order[n_draws - tail_length - 1]];
        let tail = &order[n_draws - tail_length..];

        if lw[tail[tail_length - 1]] > cutoff {
            let exp_cutoff = cutoff.exp();
            let exceedances: Vec<f64> = tail.iter().map(|&s| lw[s].exp() - exp_cutoff).collect();
            let (k, sigma) = gpd_fit(&exceedances);
            k_hat = k;
            if k.is_finite() && sigma.is_finite() && sigma > 0.0 {
                for (rank, &s) in tail.iter().enumerate() {
                    let p = (rank as f64 + 0.5) / tail_length as f64;
                    lw[s] = (gpd_quantile(p, k, sigma) + exp_cutoff).ln();
                }
            }
        }
    }

    // Smoothed values never exceed the largest raw ratio.
    lw.mapv_inplace(|v| v.min(0.0));
    let normalizer = log_sum_exp(lw.iter().copied());
    lw.mapv_inplace(|v| v - normalizer);
    (lw, k_hat)
}

/// PSIS-LOO output for a `[draws, observations]` log-likelihood matrix.
#[derive(Debug, Clone)]
pub struct PsisLoo {
    /// Normalized log weights, [draws, observations].
    pub log_weights: Array2<f64>,
    /// Pareto k̂ per observation.
    pub pareto_k: Vec<f64>,
    /// LOO log predictive density per observation; `NaN` when not computable.
    pub pointwise: Vec<f64>,
}

impl PsisLoo {
    /// Observations whose LOO term could not be computed.
    pub fn missing(&self) -> Vec<bool> {
        self.pointwise.iter().map(|v| !v.is_finite()).collect()
    }

    pub fn n_high_k(&self) -> usize {
        self.pareto_k
            .iter()
            .filter(|&&k| !(k <= PARETO_K_WARNING))
            .count()
    }
}

/// Runs PSIS-LOO over every observation in parallel.
pub fn psis_loo(log_lik: ArrayView2<f64>) -> PsisLoo {
    let (n_draws, n_obs) = log_lik.dim();
    let columns: Vec<(Array1<f64>, f64, f64)> = (0..n_obs)
        .into_par_iter()
        .map(|i| {
            let column = log_lik.index_axis(Axis(1), i);
            if column.iter().any(|v| !v.is_finite()) {
                return (Array1::from_elem(n_draws, f64::NAN), f64::NAN, f64::NAN);
            }
            let (lw, k) = psis_smooth(column.mapv(|v| -v).view());
            if lw.iter().any(|v| !v.is_finite()) {
                return (lw, k, f64::NAN);
            }
            let elpd = log_sum_exp(lw.iter().zip(column.iter()).map(|(w, l)| w + l));
            (lw, k, elpd)
        })
        .collect();

    let mut log_weights = Array2::<f64>::zeros((n_draws, n_obs));
    let mut pareto_k = Vec::with_capacity(n_obs);
    let mut pointwise = Vec::with_capacity(n_obs);
    for (i, (lw, k, elpd)) in columns.into_iter().enumerate() {
        log_weights.column_mut(i).assign(&lw);
        pareto_k.push(k);
        pointwise.push(elpd);
    }
    PsisLoo {
        log_weights,
        pareto_k,
        pointwise,
    }
}

/// Sum and standard error of pointwise values, skipping masked observations.
pub fn sum_and_se(pointwise: &[f64], missing: &[bool]) -> (f64, f64) {
    let values: Vec<f64> = pointwise
        .iter()
        .zip(missing)
        .filter(|&(_, &m)| !m)
        .map(|(&v, _)| v)
        .collect();
    let n = values.len() as f64;
    if values.is_empty() {
        return (f64::NAN, f64::NAN);
    }
    let total: f64 = values.iter().sum();
    let mean = total / n;
    let variance = if values.len() > 1 {
        values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0)
    } else {
        0.0
    };
    (total, (n * variance).sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::Array2;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use rand_distr::{Exp, StandardNormal};

    #[test]
    fn log_sum_exp_is_stable() {
        assert_abs_diff_eq!(log_sum_exp([0.0, 0.0]), 2.0_f64.ln(), epsilon = 1e-12);
        assert_abs_diff_eq!(log_sum_exp([1000.0, 1000.0]), 1000.0 + 2.0_f64.ln(), epsilon = 1e-9);
        assert_eq!(log_sum_exp(Vec::<f64>::new()), f64::NEG_INFINITY);
    }

    #[test]
    fn gpd_fit_recovers_exponential_tail() {
        // An exponential distribution is a generalized Pareto with k = 0.
        let mut rng = StdRng::seed_from_u64(1);
        let exp = Exp::new(1.0).unwrap();
        let mut sample: Vec<f64> = (0..2000).map(|_| rng.sample(exp)).collect();
        sample.sort_by(|a, b| a.total_cmp(b));
        let (k, sigma) = gpd_fit(&sample);
        assert!(k.abs() < 0.1, "k {k}");
        assert!((sigma - 1.0).abs() < 0.15, "sigma {sigma}");
    }

    #[test]
    fn gpd_fit_detects_heavy_tail() {
        // Pareto(α = 1.25) exceedances have shape 1 / α = 0.8.
        let mut rng = StdRng::seed_from_u64(2);
        let mut sample: Vec<f64> = (0..2000)
            .map(|_| {
                let u: f64 = rng.gen_range(0.0..1.0);
                (1.0 - u).powf(-1.0 / 1.25) - 1.0
            })
            .collect();
        sample.sort_by(|a, b| a.total_cmp(b));
        let (k, _) = gpd_fit(&sample);
        assert!(k > 0.6 && k < 1.0, "k {k}");
    }

    #[test]
    fn smoothed_weights_are_normalized_and_bounded() {
        let mut rng = StdRng::seed_from_u64(3);
        let ratios = Array1::from_shape_fn(1000, |_| 2.0 * rng.sample::<f64, _>(StandardNormal));
        let (lw, k) = psis_smooth(ratios.view());
        let total: f64 = lw.iter().map(|v| v.exp()).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-10);
        assert!(k.is_finite());
        // Smoothing preserves the ordering of the draws.
        let top_raw = (0..1000)
            .max_by(|&a, &b| ratios[a].total_cmp(&ratios[b]))
            .unwrap();
        let top_smooth = lw.fold(f64::NEG_INFINITY, |m, &v| m.max(v));
        assert_eq!(lw[top_raw], top_smooth);
    }

    #[test]
    fn constant_ratios_give_uniform_weights() {
        let (lw, k) = psis_smooth(Array1::from_elem(100, 0.3).view());
        for v in lw.iter() {
            assert_abs_diff_eq!(*v, -(100.0_f64).ln(), epsilon = 1e-12);
        }
        assert!(k.is_infinite());
    }

    #[test]
    fn loo_of_identical_draws_equals_the_likelihood() {
        let log_lik = Array2::from_shape_fn((200, 3), |(_, i)| -0.1 * (i + 1) as f64);
        let loo = psis_loo(log_lik.view());
        for i in 0..3 {
            assert_abs_diff_eq!(loo.pointwise[i], -0.1 * (i + 1) as f64, epsilon = 1e-10);
        }
        assert!(loo.missing().iter().all(|&m| !m));
    }

    #[test]
    fn non_finite_log_likelihood_is_not_computable() {
        let mut log_lik = Array2::from_elem((50, 2), -0.5);
        log_lik[(3, 1)] = f64::NEG_INFINITY;
        let loo = psis_loo(log_lik.view());
        assert_eq!(loo.missing(), vec![false, true]);
        let (total, _) = sum_and_se(&loo.pointwise, &loo.missing());
        assert_abs_diff_eq!(total, -0.5, epsilon = 1e-10);
    }

    #[test]
    fn loo_is_below_in_sample_density() {
        let mut rng = StdRng::seed_from_u64(4);
        let log_lik = Array2::from_shape_fn((400, 10), |_| {
            -0.7 + 0.3 * rng.sample::<f64, _>(StandardNormal)
        });
        let loo = psis_loo(log_lik.view());
        for i in 0..10 {
            let in_sample = log_sum_exp(log_lik.column(i).iter().copied()) - (400.0_f64).ln();
            assert!(loo.pointwise[i] <= in_sample + 1e-12);
        }
    }

    #[test]
    fn standard_error_uses_the_sample_variance() {
        let (total, se) = sum_and_se(&[1.0, 2.0, 3.0], &[false; 3]);
        assert_abs_diff_eq!(total, 6.0, epsilon = 1e-12);
        assert_abs_diff_eq!(se, 3.0_f64.sqrt(), epsilon = 1e-12);
    }
}
