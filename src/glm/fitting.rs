//! GLM fitting using Iteratively Reweighted Least Squares (IRLS)

use ndarray::{Array1, Array2, ArrayView2};
use rayon::prelude::*;

use super::linalg::{invert_symmetric, matmul, quad_form, solve_symmetric, weighted_cross, weighted_gram};
use super::negative_binomial::{default_ridge_lambda, nb_deviance, nb_mean, nb_weight, MAX_LFC_BETA, MIN_MU};
use crate::config::AnalysisConfig;

/// Iteration controls for IRLS
#[derive(Debug, Clone)]
pub struct GlmFitParams {
    pub maxit: usize,
    /// Relative deviance change below which IRLS stops
    pub beta_tol: f64,
}

impl Default for GlmFitParams {
    fn default() -> Self {
        Self {
            maxit: 100,
            beta_tol: 1e-8,
        }
    }
}

impl GlmFitParams {
    pub fn from_config(config: &AnalysisConfig) -> Self {
        Self {
            maxit: config.maxit,
            beta_tol: config.beta_tol,
        }
    }
}

/// Weak ridge on every coefficient
pub fn default_ridge(n_coefs: usize) -> Vec<f64> {
    vec![default_ridge_lambda(); n_coefs]
}

/// Fit of one gene, coefficients on the natural log scale
#[derive(Debug, Clone)]
pub struct GeneFit {
    pub coefficients: Vec<f64>,
    pub standard_errors: Vec<f64>,
    /// Row-major `n_coefs x n_coefs`
    pub covariance: Vec<f64>,
    pub n_coefs: usize,
    pub converged: bool,
    pub iterations: usize,
    pub mu: Vec<f64>,
    pub hat_diagonals: Vec<f64>,
    pub deviance: f64,
}

impl GeneFit {
    /// Placeholder for genes that are not fit (all counts zero)
    pub fn unfitted(n_samples: usize, n_coefs: usize) -> Self {
        Self {
            coefficients: vec![f64::NAN; n_coefs],
            standard_errors: vec![f64::NAN; n_coefs],
            covariance: vec![f64::NAN; n_coefs * n_coefs],
            n_coefs,
            converged: false,
            iterations: 0,
            mu: vec![0.0; n_samples],
            hat_diagonals: vec![f64::NAN; n_samples],
            deviance: f64::NAN,
        }
    }

    pub fn is_fitted(&self) -> bool {
        self.coefficients.iter().all(|b| b.is_finite())
    }

    /// Estimate and standard error of c'beta
    pub fn contrast(&self, weights: &[f64]) -> (f64, f64) {
        let estimate = weights.iter().zip(self.coefficients.iter()).map(|(c, b)| c * b).sum();
        let variance = quad_form(&self.covariance, weights);
        let se = if variance > 0.0 { variance.sqrt() } else { f64::NAN };
        (estimate, se)
    }
}

/// Fit every gene in parallel, results in gene order. Genes whose counts are
/// all zero or whose dispersion is not finite are returned unfitted.
pub fn fit_genes(
    counts: ArrayView2<f64>,
    design: &Array2<f64>,
    size_factors: &Array1<f64>,
    dispersions: &[f64],
    ridge: &[f64],
    params: &GlmFitParams,
) -> Vec<GeneFit> {
    let (n_genes, n_samples) = counts.dim();
    let sf = size_factors.to_vec();

    let fits: Vec<GeneFit> = (0..n_genes)
        .into_par_iter()
        .map(|i| {
            let y = counts.row(i).to_vec();
            let alpha = dispersions[i];
            if y.iter().all(|&c| c == 0.0) || !alpha.is_finite() {
                GeneFit::unfitted(n_samples, design.ncols())
            } else {
                fit_gene(&y, design, &sf, alpha, ridge, params)
            }
        })
        .collect();

    let not_converged = fits.iter().filter(|f| f.is_fitted() && !f.converged).count();
    if not_converged > 0 {
        log::warn!("{} genes did not converge in the GLM fit", not_converged);
    }
    fits
}

fn fitted_means(design: &Array2<f64>, beta: &[f64], size_factors: &[f64]) -> Vec<f64> {
    size_factors
        .iter()
        .enumerate()
        .map(|(i, &s)| {
            let eta: f64 = beta.iter().enumerate().map(|(j, b)| design[[i, j]] * b).sum();
            nb_mean(eta, s).max(MIN_MU)
        })
        .collect()
}

/// Fit a single gene at fixed dispersion `alpha` with per-coefficient ridge `ridge`
pub fn fit_gene(
    counts: &[f64],
    design: &Array2<f64>,
    size_factors: &[f64],
    alpha: f64,
    ridge: &[f64],
    params: &GlmFitParams,
) -> GeneFit {
    let n_samples = counts.len();
    let n_coefs = design.ncols();

    // start from least squares on log normalized counts
    let log_counts: Vec<f64> = counts
        .iter()
        .zip(size_factors.iter())
        .map(|(&c, &s)| (c / s + 0.1).ln())
        .collect();
    let ones = vec![1.0; n_samples];
    let xtx = weighted_gram(design, &ones);
    let xty = weighted_cross(design, &ones, &log_counts);
    let mut beta = solve_symmetric(&xtx, &xty, n_coefs);
    if beta.iter().any(|b| !b.is_finite()) {
        let mean_norm = log_counts.iter().map(|l| l.exp()).sum::<f64>() / n_samples as f64;
        beta = vec![0.0; n_coefs];
        beta[0] = mean_norm.max(0.1).ln();
    }

    let mut converged = false;
    let mut iterations = 0;
    let mut dev_old = 0.0_f64;
    let mut mu = fitted_means(design, &beta, size_factors);

    for iter in 0..params.maxit {
        iterations = iter + 1;

        let weights: Vec<f64> = mu.iter().map(|&m| nb_weight(m, alpha)).collect();
        let z: Vec<f64> = mu
            .iter()
            .zip(counts.iter())
            .zip(size_factors.iter())
            .map(|((&m, &y), &s)| (m / s).ln() + (y - m) / m)
            .collect();

        let mut lhs = weighted_gram(design, &weights);
        for (j, &lambda) in ridge.iter().enumerate() {
            lhs[j * n_coefs + j] += lambda;
        }
        let rhs = weighted_cross(design, &weights, &z);
        beta = solve_symmetric(&lhs, &rhs, n_coefs);

        if beta.iter().any(|b| b.abs() > MAX_LFC_BETA || b.is_nan()) {
            break;
        }

        mu = fitted_means(design, &beta, size_factors);
        let dev = nb_deviance(counts, &mu, alpha);
        let conv_test = (dev - dev_old).abs() / (dev.abs() + 0.1);
        if conv_test.is_nan() {
            break;
        }
        if iter > 0 && conv_test < params.beta_tol {
            converged = true;
            break;
        }
        dev_old = dev;
    }

    let mu = fitted_means(design, &beta, size_factors);
    let weights: Vec<f64> = mu.iter().map(|&m| nb_weight(m, alpha)).collect();
    let (covariance, hat_diagonals) = sandwich_covariance(design, &weights, ridge);
    let standard_errors = (0..n_coefs)
        .map(|j| {
            let v = covariance[j * n_coefs + j];
            if v > 0.0 {
                v.sqrt()
            } else {
                f64::NAN
            }
        })
        .collect();
    let deviance = nb_deviance(counts, &mu, alpha);

    GeneFit {
        coefficients: beta,
        standard_errors,
        covariance,
        n_coefs,
        converged,
        iterations,
        mu,
        hat_diagonals,
        deviance,
    }
}

/// (X'WX + L)^-1 X'WX (X'WX + L)^-1 and the hat diagonals w x (X'WX + L)^-1 x'
fn sandwich_covariance(design: &Array2<f64>, weights: &[f64], ridge: &[f64]) -> (Vec<f64>, Vec<f64>) {
    let p = design.ncols();
    let xtwx = weighted_gram(design, weights);
    let mut penalized = xtwx.clone();
    for (j, &lambda) in ridge.iter().enumerate() {
        penalized[j * p + j] += lambda;
    }
    let inv = invert_symmetric(&penalized, p);
    let sigma = matmul(&matmul(&inv, &xtwx, p), &inv, p);

    let hat_diagonals = weights
        .iter()
        .enumerate()
        .map(|(i, &w)| {
            let x: Vec<f64> = (0..p).map(|j| design[[i, j]]).collect();
            w * quad_form(&inv, &x)
        })
        .collect();

    (sigma, hat_diagonals)
}
