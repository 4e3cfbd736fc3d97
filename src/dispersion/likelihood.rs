//! Cox-Reid adjusted profile likelihood of the dispersion and its optimizers
//!
//! Both the gene-wise and the MAP stage maximize the same objective in
//! log(alpha), the MAP stage adding a normal prior on log(alpha). Fitted
//! means are held fixed throughout.

use ndarray::Array2;
use statrs::function::gamma::{digamma, ln_gamma};

use super::DispersionParams;
use crate::glm::linalg::{invert_symmetric, log_det_symmetric, weighted_gram};

/// Hard bounds on proposals in log(alpha)
const MIN_LOG_ALPHA_PROPOSAL: f64 = -30.0;
const MAX_LOG_ALPHA_PROPOSAL: f64 = 10.0;

/// Armijo sufficient-increase constant
const ARMIJO_EPSILON: f64 = 1e-4;

/// Normal prior on log(alpha)
#[derive(Debug, Clone, Copy)]
pub struct LogNormalPrior {
    pub mean: f64,
    pub variance: f64,
}

fn cox_reid_weights(mu: &[f64], alpha: f64) -> Vec<f64> {
    mu.iter().map(|&m| 1.0 / (1.0 / m.max(1e-10) + alpha)).collect()
}

/// Log-likelihood in log(alpha) with the Cox-Reid term, plus the prior if given
pub fn log_posterior(
    counts: &[f64],
    design: &Array2<f64>,
    mu: &[f64],
    log_alpha: f64,
    prior: Option<&LogNormalPrior>,
) -> f64 {
    let alpha = log_alpha.exp();
    let alpha_inv = 1.0 / alpha;

    let ll_part: f64 = counts
        .iter()
        .zip(mu.iter())
        .map(|(&y, &m)| {
            let m = m.max(1e-10);
            ln_gamma(y + alpha_inv) - ln_gamma(alpha_inv) - y * (m + alpha_inv).ln()
                - alpha_inv * (1.0 + m * alpha).ln()
        })
        .sum();

    let p = design.ncols();
    let xtwx = weighted_gram(design, &cox_reid_weights(mu, alpha));
    let cr_term = log_det_symmetric(&xtwx, p).map_or(0.0, |ld| -0.5 * ld);

    let prior_part = prior.map_or(0.0, |pr| -0.5 * (log_alpha - pr.mean).powi(2) / pr.variance);

    ll_part + cr_term + prior_part
}

/// Derivative of [`log_posterior`] with respect to log(alpha)
pub fn d_log_posterior(
    counts: &[f64],
    design: &Array2<f64>,
    mu: &[f64],
    log_alpha: f64,
    prior: Option<&LogNormalPrior>,
) -> f64 {
    let alpha = log_alpha.exp();
    let alpha_inv = 1.0 / alpha;

    let ll_sum: f64 = counts
        .iter()
        .zip(mu.iter())
        .map(|(&y, &m)| {
            let m = m.max(1e-10);
            digamma(alpha_inv) + (1.0 + m * alpha).ln() - m * alpha / (1.0 + m * alpha) - digamma(y + alpha_inv)
                + y / (m + alpha_inv)
        })
        .sum();
    let ll_part = ll_sum * alpha_inv * alpha_inv;

    // d/dalpha of -0.5 log|X'WX| is -0.5 tr((X'WX)^-1 X'(dW)X), dw = -w^2
    let p = design.ncols();
    let w = cox_reid_weights(mu, alpha);
    let dw: Vec<f64> = w.iter().map(|wi| -wi * wi).collect();
    let b = weighted_gram(design, &w);
    let db = weighted_gram(design, &dw);
    let cr_term = if log_det_symmetric(&b, p).is_some() {
        let b_inv = invert_symmetric(&b, p);
        let trace: f64 = (0..p)
            .flat_map(|i| (0..p).map(move |j| (i, j)))
            .map(|(i, j)| b_inv[i * p + j] * db[j * p + i])
            .sum();
        -0.5 * trace
    } else {
        0.0
    };

    let prior_part = prior.map_or(0.0, |pr| -(log_alpha - pr.mean) / pr.variance);

    (ll_part + cr_term) * alpha + prior_part
}

/// Outcome of the Armijo line search
#[derive(Debug, Clone)]
pub struct LineSearchResult {
    pub log_alpha: f64,
    pub initial_lp: f64,
    pub last_lp: f64,
    pub iterations: usize,
    pub converged: bool,
}

/// Gradient ascent on log(alpha) with an Armijo backtracking step
pub fn line_search(
    counts: &[f64],
    design: &Array2<f64>,
    mu: &[f64],
    log_alpha_start: f64,
    prior: Option<&LogNormalPrior>,
    params: &DispersionParams,
) -> LineSearchResult {
    let min_log_alpha = (params.min_disp / 10.0).ln();
    let kappa_0 = params.kappa_0;

    let mut log_alpha = log_alpha_start.clamp(MIN_LOG_ALPHA_PROPOSAL, MAX_LOG_ALPHA_PROPOSAL);
    let initial_lp = log_posterior(counts, design, mu, log_alpha, prior);
    let mut lp = initial_lp;
    let mut dlp = d_log_posterior(counts, design, mu, log_alpha, prior);
    let mut kappa = kappa_0;
    let mut accepted = 0;
    let mut iterations = params.maxit;
    let mut converged = false;

    for iter in 0..params.maxit {
        let raw = log_alpha + kappa * dlp;
        if raw < MIN_LOG_ALPHA_PROPOSAL && dlp != 0.0 {
            kappa = (MIN_LOG_ALPHA_PROPOSAL - log_alpha) / dlp;
        }
        if raw > MAX_LOG_ALPHA_PROPOSAL && dlp != 0.0 {
            kappa = (MAX_LOG_ALPHA_PROPOSAL - log_alpha) / dlp;
        }
        let proposal = log_alpha + kappa * dlp;
        let lp_proposal = log_posterior(counts, design, mu, proposal, prior);

        if lp_proposal >= lp + kappa * ARMIJO_EPSILON * dlp * dlp {
            accepted += 1;
            log_alpha = proposal;
            let change = lp_proposal - lp;
            lp = lp_proposal;

            if change < params.disp_tol || log_alpha < min_log_alpha {
                iterations = iter + 1;
                converged = true;
                break;
            }

            dlp = d_log_posterior(counts, design, mu, log_alpha, prior);
            kappa = (kappa * 1.1).min(kappa_0);
            if accepted % 5 == 0 {
                kappa /= 2.0;
            }
        } else {
            kappa /= 2.0;
        }
    }

    LineSearchResult {
        log_alpha,
        initial_lp,
        last_lp: lp,
        iterations,
        converged,
    }
}

/// Coarse then fine grid over [ln min_disp, ln max_disp], returns alpha
pub fn grid_search(
    counts: &[f64],
    design: &Array2<f64>,
    mu: &[f64],
    min_disp: f64,
    max_disp: f64,
    prior: Option<&LogNormalPrior>,
) -> f64 {
    const N_GRID: usize = 20;

    let best_on = |lo: f64, hi: f64| -> (f64, f64) {
        let delta = (hi - lo) / (N_GRID - 1) as f64;
        let best = (0..N_GRID)
            .map(|i| lo + i as f64 * delta)
            .map(|la| (la, log_posterior(counts, design, mu, la, prior)))
            .fold((lo, f64::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
        (best.0, delta)
    };

    let (coarse, delta) = best_on(min_disp.ln(), max_disp.ln());
    let (fine, _) = best_on(coarse - delta, coarse + delta);
    fine.exp()
}
