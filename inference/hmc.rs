//! Hamiltonian Monte Carlo in a whitened parameter space
//!
//! # Design
//!
//! The Laplace curvature `H` at the posterior mode `μ` is factorized as
//! `H = U Uᵀ`. Sampling happens in `z` with
//!
//! - Transform: β = μ + W z, where W = U⁻ᵀ so that W Wᵀ = H⁻¹
//! - Gradient chain rule: ∇_z = Wᵀ ∇_β
//!
//! so the target is close to a standard normal and a unit mass matrix mixes
//! well. Step size is tuned during warmup by dual averaging towards the
//! configured acceptance rate; trajectory lengths are jittered around π/2.
//!
//! # Determinism
//!
//! Every chain owns an RNG seeded from `(seed, chain)`, and chains are
//! collected in index order, so the draws do not depend on the number of
//! rayon workers.

use crate::inference::faer_ndarray::FaerCholesky;
use crate::inference::posterior::{LogisticPosterior, PosteriorError, PosteriorMode};
use crate::config::SamplerConfig;
use crate::parallel::{create_progress_bar, stream_seed};
use faer::Side;
use indicatif::ProgressBar;
use ndarray::{Array1, Array2, Array3};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rayon::prelude::*;

/// Energy error beyond which a transition counts as divergent.
const DIVERGENCE_THRESHOLD: f64 = 1000.0;

/// Whitened log-posterior target.
#[derive(Clone)]
pub struct WhitenedPosterior {
    posterior: LogisticPosterior,
    mode: Array1<f64>,
    /// W with W Wᵀ = H⁻¹.
    whitening: Array2<f64>,
    /// Wᵀ for the gradient chain rule.
    whitening_t: Array2<f64>,
}

impl WhitenedPosterior {
    pub fn new(posterior: LogisticPosterior, mode: &PosteriorMode) -> Result<Self, PosteriorError> {
        let factor = mode.curvature.cholesky(Side::Lower)?;
        let whitening = factor.inverse_transpose_factor()?;
        let whitening_t = whitening.t().to_owned();
        Ok(Self {
            posterior,
            mode: mode.beta.clone(),
            whitening,
            whitening_t,
        })
    }

    pub fn dim(&self) -> usize {
        self.mode.len()
    }

    /// Maps whitened coordinates back to coefficients.
    pub fn to_beta(&self, z: &Array1<f64>) -> Array1<f64> {
        &self.mode + &self.whitening.dot(z)
    }

    pub fn logp_and_grad(&self, z: &Array1<f64>) -> (f64, Array1<f64>) {
        let beta = self.to_beta(z);
        let (logp, grad_beta) = self.posterior.logp_and_grad(&beta);
        (logp, self.whitening_t.dot(&grad_beta))
    }
}

/// Raw output of the sampler.
#[derive(Debug, Clone)]
pub struct HmcResult {
    /// Coefficient draws in the original space: [chains, draws, dim].
    pub chains: Array3<f64>,
    /// Adapted step size of each chain.
    pub step_sizes: Vec<f64>,
    /// Mean acceptance statistic of each chain after warmup.
    pub acceptance: Vec<f64>,
    /// Divergent transitions after warmup, summed over chains.
    pub divergences: usize,
}

/// Dual-averaging step size adaptation (Hoffman & Gelman, 2014).
struct DualAveraging {
    target: f64,
    mu: f64,
    log_step: f64,
    log_step_bar: f64,
    h_bar: f64,
    iteration: f64,
}

impl DualAveraging {
    const GAMMA: f64 = 0.05;
    const T0: f64 = 10.0;
    const KAPPA: f64 = 0.75;

    fn new(initial_step: f64, target: f64) -> Self {
        Self {
            target,
            mu: (10.0 * initial_step).ln(),
            log_step: initial_step.ln(),
            log_step_bar: 0.0,
            h_bar: 0.0,
            iteration: 0.0,
        }
    }

    fn update(&mut self, accept_stat: f64) -> f64 {
        self.iteration += 1.0;
        let t = self.iteration;
        let w = 1.0 / (t + Self::T0);
        self.h_bar = (1.0 - w) * self.h_bar + w * (self.target - accept_stat);
        self.log_step = self.mu - t.sqrt() / Self::GAMMA * self.h_bar;
        let eta = t.powf(-Self::KAPPA);
        self.log_step_bar = eta * self.log_step + (1.0 - eta) * self.log_step_bar;
        self.log_step.exp()
    }

    fn final_step(&self) -> f64 {
        self.log_step_bar.exp()
    }
}

struct Transition {
    z: Array1<f64>,
    logp: f64,
    grad: Array1<f64>,
    accept_stat: f64,
    divergent: bool,
}

fn standard_normal_vector(rng: &mut StdRng, dim: usize) -> Array1<f64> {
    Array1::from_shape_fn(dim, |_| rng.sample::<f64, _>(StandardNormal))
}

/// One HMC transition with `n_steps` leapfrog steps and a Metropolis correction.
fn transition(
    target: &WhitenedPosterior,
    z: &Array1<f64>,
    logp: f64,
    grad: &Array1<f64>,
    step: f64,
    n_steps: usize,
    rng: &mut StdRng,
) -> Transition {
    let momentum0 = standard_normal_vector(rng, target.dim());
    let h0 = -logp + 0.5 * momentum0.dot(&momentum0);

    let mut q = z.clone();
    let mut p = &momentum0 + &(grad * (0.5 * step));
    let mut current_logp = logp;
    let mut current_grad = grad.clone();
    let mut diverged = false;
    for i in 0..n_steps {
        q = &q + &(&p * step);
        let (lp, g) = target.logp_and_grad(&q);
        current_logp = lp;
        current_grad = g;
        if !current_logp.is_finite() {
            diverged = true;
            break;
        }
        let scale = if i + 1 == n_steps { 0.5 * step } else { step };
        p = &p + &(&current_grad * scale);
    }

    let h1 = -current_logp + 0.5 * p.dot(&p);
    let energy_error = h1 - h0;
    if diverged || !energy_error.is_finite() || energy_error > DIVERGENCE_THRESHOLD {
        return Transition {
            z: z.clone(),
            logp,
            grad: grad.clone(),
            accept_stat: 0.0,
            divergent: true,
        };
    }

    let accept_stat = (-energy_error).exp().min(1.0);
    let u: f64 = rng.gen_range(0.0..1.0);
    if u < accept_stat {
        Transition {
            z: q,
            logp: current_logp,
            grad: current_grad,
            accept_stat,
            divergent: false,
        }
    } else {
        Transition {
            z: z.clone(),
            logp,
            grad: grad.clone(),
            accept_stat,
            divergent: false,
        }
    }
}

struct ChainOutput {
    draws: Array2<f64>,
    step: f64,
    acceptance: f64,
    divergences: usize,
}

fn run_chain(
    target: &WhitenedPosterior,
    config: &SamplerConfig,
    seed: u64,
    chain: usize,
    progress: &ProgressBar,
) -> ChainOutput {
    let mut rng = StdRng::seed_from_u64(stream_seed(seed, chain));
    let dim = target.dim();

    // Overdispersed start around the mode.
    let mut z = standard_normal_vector(&mut rng, dim);
    let (mut logp, mut grad) = target.logp_and_grad(&z);
    if !logp.is_finite() {
        z = Array1::zeros(dim);
        let start = target.logp_and_grad(&z);
        logp = start.0;
        grad = start.1;
    }

    let trajectory = std::f64::consts::FRAC_PI_2;
    let mut step = 0.5;
    let mut adaptation = DualAveraging::new(step, config.target_accept);

    let n_steps_for = |step: f64, rng: &mut StdRng| -> usize {
        let jitter: f64 = rng.gen_range(0.5..1.5);
        ((jitter * trajectory / step).ceil() as usize).clamp(1, config.max_leapfrog_steps)
    };

    for _ in 0..config.warmup {
        let n_steps = n_steps_for(step, &mut rng);
        let t = transition(target, &z, logp, &grad, step, n_steps, &mut rng);
        z = t.z;
        logp = t.logp;
        grad = t.grad;
        step = adaptation.update(t.accept_stat);
        progress.inc(1);
    }
    if config.warmup > 0 {
        step = adaptation.final_step();
    }

    let mut draws = Array2::<f64>::zeros((config.draws, dim));
    let mut accept_sum = 0.0;
    let mut divergences = 0;
    for d in 0..config.draws {
        let n_steps = n_steps_for(step, &mut rng);
        let t = transition(target, &z, logp, &grad, step, n_steps, &mut rng);
        z = t.z;
        logp = t.logp;
        grad = t.grad;
        accept_sum += t.accept_stat;
        if t.divergent {
            divergences += 1;
        }
        draws.row_mut(d).assign(&target.to_beta(&z));
        progress.inc(1);
    }

    ChainOutput {
        draws,
        step,
        acceptance: accept_sum / config.draws.max(1) as f64,
        divergences,
    }
}

/// Runs all chains on the rayon pool.
pub fn run_hmc(target: &WhitenedPosterior, config: &SamplerConfig, seed: u64) -> HmcResult {
    let total = (config.chains * (config.warmup + config.draws)) as u64;
    let progress = create_progress_bar(total, "sampling reference posterior");

    let outputs: Vec<ChainOutput> = (0..config.chains)
        .into_par_iter()
        .map(|chain| run_chain(target, config, seed, chain, &progress))
        .collect();
    progress.finish_and_clear();

    let dim = target.dim();
    let mut chains = Array3::<f64>::zeros((config.chains, config.draws, dim));
    for (c, output) in outputs.iter().enumerate() {
        chains
            .index_axis_mut(ndarray::Axis(0), c)
            .assign(&output.draws);
    }
    let step_sizes: Vec<f64> = outputs.iter().map(|o| o.step).collect();
    let acceptance: Vec<f64> = outputs.iter().map(|o| o.acceptance).collect();
    let divergences = outputs.iter().map(|o| o.divergences).sum();

    log::info!(
        "HMC finished: {} chains x {} draws, step sizes {:?}, mean acceptance {:?}, {} divergences",
        config.chains,
        config.draws,
        step_sizes,
        acceptance,
        divergences
    );

    HmcResult {
        chains,
        step_sizes,
        acceptance,
        divergences,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::posterior::find_mode;
    use crate::config::PriorConfig;
    use ndarray::{Axis, array};

    fn toy_target() -> WhitenedPosterior {
        let x = array![
            [0.5, -1.0],
            [1.5, 0.2],
            [-0.3, 0.8],
            [-1.2, -0.4],
            [0.9, 1.1],
            [-0.7, 0.3],
            [0.2, -0.6],
            [-1.5, 1.4]
        ];
        let y = array![1.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        let posterior = LogisticPosterior::new(x.view(), y.view(), &PriorConfig::default()).unwrap();
        let mode = find_mode(&posterior).unwrap();
        WhitenedPosterior::new(posterior, &mode).unwrap()
    }

    #[test]
    fn whitened_gradient_matches_finite_difference() {
        let target = toy_target();
        let z = array![0.3, -0.2, 0.5];
        let (_, grad) = target.logp_and_grad(&z);
        let eps = 1e-6;
        for i in 0..3 {
            let mut plus = z.clone();
            let mut minus = z.clone();
            plus[i] += eps;
            minus[i] -= eps;
            let fd = (target.logp_and_grad(&plus).0 - target.logp_and_grad(&minus).0) / (2.0 * eps);
            let rel = (grad[i] - fd).abs() / grad[i].abs().max(1e-6);
            assert!(rel < 1e-4, "component {i}: analytical {} vs fd {fd}", grad[i]);
        }
    }

    #[test]
    fn origin_maps_to_the_mode() {
        let target = toy_target();
        let beta = target.to_beta(&Array1::zeros(3));
        for (a, b) in beta.iter().zip(target.mode.iter()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn sampling_is_deterministic_for_a_seed() {
        let target = toy_target();
        let config = SamplerConfig {
            chains: 2,
            warmup: 100,
            draws: 100,
            ..SamplerConfig::default()
        };
        let first = run_hmc(&target, &config, 11);
        let second = run_hmc(&target, &config, 11);
        assert_eq!(first.chains, second.chains);
        assert_eq!(first.chains.shape(), &[2, 100, 3]);

        let third = run_hmc(&target, &config, 12);
        assert_ne!(first.chains, third.chains);
    }

    #[test]
    fn draws_concentrate_around_the_mode() {
        let target = toy_target();
        let config = SamplerConfig {
            chains: 2,
            warmup: 300,
            draws: 600,
            ..SamplerConfig::default()
        };
        let result = run_hmc(&target, &config, 5);
        let flat = result
            .chains
            .to_shape((2 * 600, 3))
            .unwrap()
            .to_owned();
        let mean = flat.mean_axis(Axis(0)).unwrap();
        let sd = flat.std_axis(Axis(0), 1.0);
        for j in 0..3 {
            assert!(mean[j].is_finite());
            // The posterior mean of a weakly identified logistic model sits
            // within a few posterior standard deviations of its mode.
            assert!((mean[j] - target.mode[j]).abs() < 3.0 * sd[j]);
        }
        assert!(result.acceptance.iter().all(|&a| a > 0.5));
    }

    #[test]
    fn dual_averaging_shrinks_step_after_rejections() {
        let mut adaptation = DualAveraging::new(1.0, 0.8);
        let mut step = 1.0;
        for _ in 0..20 {
            step = adaptation.update(0.0);
        }
        assert!(step < 1.0);
    }
}
