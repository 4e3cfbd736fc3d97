//! Normal-prior shrinkage of log fold changes
//!
//! Each non-intercept coefficient gets a zero-centred normal prior whose
//! variance matches the upper tail of the MLE estimates across genes. The
//! GLM is then refit with the matching ridge penalty; only the effect sizes
//! and their standard errors change, the tests stay those of the MLE fit.

use std::f64::consts::{LN_2, LOG2_E};

use ndarray::{Array1, Array2, ArrayView2};

use crate::glm::{default_ridge_lambda, fit_genes, GeneFit, GlmFitParams};
use crate::stats::match_weighted_upper_quantile_for_variance;

/// Upper quantile of |beta| matched by the prior
const PRIOR_UPPER_QUANTILE: f64 = 0.05;

/// Estimates with |log2 beta| beyond this are not used to size the prior
const MAX_PRIOR_BETA: f64 = 10.0;

/// Prior variance on the log2 scale for each coefficient; the intercept gets
/// none (infinite)
///
/// Weights are `1 / (1 / base_mean + trend)`, the inverse of the approximate
/// variance of a log count.
pub fn estimate_beta_prior_variance(fits: &[GeneFit], base_means: &[f64], trended: &[f64]) -> Vec<f64> {
    let n_coefs = fits.first().map_or(0, |f| f.n_coefs);
    let mut variances = vec![f64::INFINITY; n_coefs];

    for (k, variance) in variances.iter_mut().enumerate().skip(1) {
        let (betas, weights): (Vec<f64>, Vec<f64>) = fits
            .iter()
            .zip(base_means.iter().zip(trended.iter()))
            .filter(|(fit, (&m, &t))| fit.is_fitted() && m > 0.0 && t.is_finite())
            .map(|(fit, (&m, &t))| (fit.coefficients[k] * LOG2_E, 1.0 / (1.0 / m + t)))
            .filter(|(b, _)| b.abs() < MAX_PRIOR_BETA)
            .unzip();

        *variance = if betas.is_empty() {
            log::warn!("no usable estimates for coefficient {}; leaving it unshrunk", k);
            f64::INFINITY
        } else {
            match_weighted_upper_quantile_for_variance(&betas, &weights, PRIOR_UPPER_QUANTILE)
        };
    }
    variances
}

/// Ridge vector on the natural-log scale for log2-scale prior variances
pub fn normal_prior_ridge(prior_variances: &[f64]) -> Vec<f64> {
    prior_variances
        .iter()
        .enumerate()
        .map(|(k, &v)| {
            if k == 0 || !v.is_finite() {
                default_ridge_lambda()
            } else {
                1.0 / (v * LN_2 * LN_2)
            }
        })
        .collect()
}

/// Refit every gene under the normal prior
///
/// Returns the shrunk fits and the log2-scale prior variances.
pub fn shrink_lfc_normal(
    counts: ArrayView2<f64>,
    design: &Array2<f64>,
    size_factors: &Array1<f64>,
    dispersions: &[f64],
    mle_fits: &[GeneFit],
    base_means: &[f64],
    trended: &[f64],
    params: &GlmFitParams,
) -> (Vec<GeneFit>, Vec<f64>) {
    let prior_variances = estimate_beta_prior_variance(mle_fits, base_means, trended);
    let ridge = normal_prior_ridge(&prior_variances);
    log::info!(
        "Fold change prior variances (log2): {}",
        prior_variances
            .iter()
            .skip(1)
            .map(|v| format!("{:.4}", v))
            .collect::<Vec<_>>()
            .join(", ")
    );

    let fits = fit_genes(counts, design, size_factors, dispersions, &ridge, params);
    (fits, prior_variances)
}
