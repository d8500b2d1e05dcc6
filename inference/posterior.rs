//! Log-posterior of the Bayesian logistic regression and its mode.
//!
//! Parameters are ordered `[α, β_1, …, β_p]`. Every parameter has an
//! independent Student-t prior centred at zero, which is weakly informative
//! and heavy-tailed. The design is shared through `Arc` so the sampler can
//! hand one copy to every chain without duplicating the data.

use crate::inference::faer_ndarray::{FaerCholesky, FaerLinalgError};
use crate::config::PriorConfig;
use faer::Side;
use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate};
use std::sync::Arc;
use thiserror::Error;
use wolfe_bfgs::{Bfgs, BfgsSolution};

#[derive(Error, Debug)]
pub enum PosteriorError {
    #[error("The model frame has no complete observations.")]
    NoObservations,
    #[error("The outcome has a single class ({cases} cases, {controls} controls).")]
    SingleClass { cases: usize, controls: usize },
    #[error("Linear algebra failure at the posterior mode: {0}")]
    Linalg(#[from] FaerLinalgError),
    #[error("The log-posterior is not finite at the mode estimate.")]
    NonFiniteMode,
}

/// Student-t prior on one parameter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StudentT {
    pub df: f64,
    pub scale: f64,
}

impl StudentT {
    /// Log-density up to an additive constant.
    #[inline]
    pub fn log_density(&self, beta: f64) -> f64 {
        -0.5 * (self.df + 1.0) * (beta * beta / (self.df * self.scale * self.scale)).ln_1p()
    }

    #[inline]
    pub fn grad(&self, beta: f64) -> f64 {
        -(self.df + 1.0) * beta / (self.df * self.scale * self.scale + beta * beta)
    }

    /// A positive curvature bound that majorizes the negative Hessian near zero.
    #[inline]
    pub fn curvature(&self, beta: f64) -> f64 {
        (self.df + 1.0) / (self.df * self.scale * self.scale + beta * beta)
    }
}

/// Read-only data of the posterior, shared across chains.
#[derive(Clone)]
struct SharedData {
    /// Design matrix with a leading column of ones, [n_obs, 1 + p].
    x: Arc<Array2<f64>>,
    /// Outcome vector, 0/1, [n_obs].
    y: Arc<Array1<f64>>,
}

#[derive(Clone)]
pub struct LogisticPosterior {
    data: SharedData,
    /// One prior per parameter, intercept first.
    priors: Vec<StudentT>,
}

impl LogisticPosterior {
    pub fn new(
        x: ArrayView2<f64>,
        y: ArrayView1<f64>,
        prior: &PriorConfig,
    ) -> Result<Self, PosteriorError> {
        let n = x.nrows();
        if n == 0 {
            return Err(PosteriorError::NoObservations);
        }
        let cases = y.iter().filter(|&&v| v > 0.5).count();
        if cases == 0 || cases == n {
            return Err(PosteriorError::SingleClass {
                cases,
                controls: n - cases,
            });
        }

        let ones = Array2::<f64>::ones((n, 1));
        let design = concatenate![Axis(1), ones, x];

        let mut priors = Vec::with_capacity(design.ncols());
        priors.push(StudentT {
            df: prior.intercept_df,
            scale: prior.intercept_scale,
        });
        priors.extend((0..x.ncols()).map(|_| StudentT {
            df: prior.coefficient_df,
            scale: prior.coefficient_scale,
        }));

        Ok(Self {
            data: SharedData {
                x: Arc::new(design),
                y: Arc::new(y.to_owned()),
            },
            priors,
        })
    }

    pub fn dim(&self) -> usize {
        self.priors.len()
    }

    pub fn n_obs(&self) -> usize {
        self.data.y.len()
    }

    pub fn design(&self) -> &Array2<f64> {
        &self.data.x
    }

    /// Log-posterior (up to a constant) and its gradient at `beta`.
    pub fn logp_and_grad(&self, beta: &Array1<f64>) -> (f64, Array1<f64>) {
        let eta = self.data.x.dot(beta);
        let mut ll = 0.0;
        let mut residual = Array1::<f64>::zeros(eta.len());
        for i in 0..eta.len() {
            let eta_i = eta[i].clamp(-700.0, 700.0);
            // log(1 + e^η) computed without overflow
            let softplus = if eta_i > 0.0 {
                eta_i + (-eta_i).exp().ln_1p()
            } else {
                eta_i.exp().ln_1p()
            };
            let y_i = self.data.y[i];
            ll += y_i * eta_i - softplus;
            residual[i] = y_i - crate::inference::draws::sigmoid(eta_i);
        }
        let mut grad = self.data.x.t().dot(&residual);
        for (j, prior) in self.priors.iter().enumerate() {
            ll += prior.log_density(beta[j]);
            grad[j] += prior.grad(beta[j]);
        }
        (ll, grad)
    }

    /// Positive definite curvature `Xᵀ W X + D` at `beta`, used for Newton steps
    /// and for whitening the sampler.
    pub fn curvature(&self, beta: &Array1<f64>) -> Array2<f64> {
        let eta = self.data.x.dot(beta);
        let w = eta.mapv(|e| {
            let p = crate::inference::draws::sigmoid(e);
            (p * (1.0 - p)).max(1e-12)
        });
        let xw = &*self.data.x * &w.insert_axis(Axis(1));
        let mut h = self.data.x.t().dot(&xw);
        for (j, prior) in self.priors.iter().enumerate() {
            h[(j, j)] += prior.curvature(beta[j]);
        }
        h
    }
}

/// The posterior mode together with the curvature there.
#[derive(Debug, Clone)]
pub struct PosteriorMode {
    pub beta: Array1<f64>,
    pub log_posterior: f64,
    pub curvature: Array2<f64>,
    pub newton_iterations: usize,
}

const NEWTON_MAX_ITERATIONS: usize = 100;
const NEWTON_STEP_TOLERANCE: f64 = 1e-10;

/// Locates the posterior mode.
///
/// BFGS brings the parameters close to the mode from the origin; damped Newton
/// steps then polish the estimate with the curvature that the sampler will use.
/// If BFGS fails, the Newton stage starts from the origin instead.
pub fn find_mode(posterior: &LogisticPosterior) -> Result<PosteriorMode, PosteriorError> {
    let dim = posterior.dim();
    let start = Array1::<f64>::zeros(dim);

    let cost_and_grad = |beta: &Array1<f64>| -> (f64, Array1<f64>) {
        let (logp, grad) = posterior.logp_and_grad(beta);
        if logp.is_finite() {
            (-logp, -grad)
        } else {
            (1e10, Array1::zeros(beta.len()))
        }
    };

    let mut beta = match Bfgs::new(start.clone(), cost_and_grad)
        .with_tolerance(1e-6)
        .with_max_iterations(500)
        .run()
    {
        Ok(BfgsSolution {
            final_point,
            iterations,
            ..
        }) => {
            log::info!("BFGS reached the posterior mode region in {iterations} iterations.");
            final_point
        }
        Err(e) => {
            log::warn!("BFGS mode search stopped early ({e:?}); continuing with Newton steps.");
            start
        }
    };

    let (mut logp, mut grad) = posterior.logp_and_grad(&beta);
    let mut iterations = 0;
    while iterations < NEWTON_MAX_ITERATIONS {
        iterations += 1;
        let h = posterior.curvature(&beta);
        let step = h.cholesky(Side::Lower)?.solve_vec(&grad);

        // Backtracking keeps every accepted step an ascent step.
        let mut scale = 1.0;
        let mut accepted = false;
        for _ in 0..30 {
            let candidate = &beta + &(&step * scale);
            let (candidate_logp, candidate_grad) = posterior.logp_and_grad(&candidate);
            if candidate_logp.is_finite() && candidate_logp >= logp - 1e-12 {
                beta = candidate;
                logp = candidate_logp;
                grad = candidate_grad;
                accepted = true;
                break;
            }
            scale *= 0.5;
        }

        let step_size = step.iter().fold(0.0_f64, |m, v| m.max(v.abs())) * scale;
        if !accepted || step_size < NEWTON_STEP_TOLERANCE {
            break;
        }
    }

    if !logp.is_finite() {
        return Err(PosteriorError::NonFiniteMode);
    }
    let curvature = posterior.curvature(&beta);
    log::info!(
        "Posterior mode found after {iterations} Newton iterations (log posterior {logp:.4})."
    );
    Ok(PosteriorMode {
        beta,
        log_posterior: logp,
        curvature,
        newton_iterations: iterations,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn toy_posterior() -> LogisticPosterior {
        let x = array![[0.5, -1.0], [1.5, 0.2], [-0.3, 0.8], [-1.2, -0.4], [0.9, 1.1], [-0.7, 0.3]];
        let y = array![1.0, 1.0, 0.0, 0.0, 1.0, 0.0];
        LogisticPosterior::new(x.view(), y.view(), &PriorConfig::default()).unwrap()
    }

    #[test]
    fn student_t_gradient_matches_finite_difference() {
        let prior = StudentT {
            df: 7.0,
            scale: 2.5,
        };
        for &b in &[-4.0, -0.3, 0.0, 1.2, 6.0] {
            let eps = 1e-6;
            let fd = (prior.log_density(b + eps) - prior.log_density(b - eps)) / (2.0 * eps);
            assert_abs_diff_eq!(prior.grad(b), fd, epsilon = 1e-6);
        }
    }

    #[test]
    fn gradient_matches_finite_difference() {
        let posterior = toy_posterior();
        let beta = array![0.2, -0.4, 0.7];
        let (_, grad) = posterior.logp_and_grad(&beta);
        let eps = 1e-6;
        for j in 0..3 {
            let mut plus = beta.clone();
            let mut minus = beta.clone();
            plus[j] += eps;
            minus[j] -= eps;
            let fd = (posterior.logp_and_grad(&plus).0 - posterior.logp_and_grad(&minus).0)
                / (2.0 * eps);
            assert_abs_diff_eq!(grad[j], fd, epsilon = 1e-5);
        }
    }

    #[test]
    fn mode_has_vanishing_gradient() {
        let posterior = toy_posterior();
        let mode = find_mode(&posterior).unwrap();
        let (_, grad) = posterior.logp_and_grad(&mode.beta);
        for g in grad.iter() {
            assert!(g.abs() < 1e-6, "gradient component {g} at the mode");
        }
        assert_eq!(mode.curvature.shape(), &[3, 3]);
    }

    #[test]
    fn single_class_outcome_is_rejected() {
        let x = array![[0.1], [0.2], [0.3]];
        let y = array![1.0, 1.0, 1.0];
        let err = LogisticPosterior::new(x.view(), y.view(), &PriorConfig::default());
        assert!(matches!(
            err,
            Err(PosteriorError::SingleClass {
                cases: 3,
                controls: 0
            })
        ));
    }
}
