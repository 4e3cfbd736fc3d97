//! Maximum a posteriori dispersions
//!
//! Gene-wise estimates are shrunk toward the trend under a log-normal prior
//! whose variance is estimated from the spread of the gene-wise estimates
//! around the trend, less the sampling variance expected at the residual
//! degrees of freedom.

use ndarray::{Array2, ArrayView2};
use rayon::prelude::*;

use super::gene_wise::GeneWiseEstimate;
use super::likelihood::{grid_search, line_search, LogNormalPrior};
use super::DispersionParams;
use crate::stats::{mad_squared, trigamma};

/// Floor on the prior variance of log dispersion
const MIN_PRIOR_VAR: f64 = 0.25;

/// Final dispersion of one gene
#[derive(Debug, Clone, Copy)]
pub struct MapEstimate {
    pub dispersion: f64,
    /// Gene-wise value kept because it lies far above the trend
    pub outlier: bool,
}

/// Prior variance and observed variance of log(gene-wise / trend)
///
/// Only genes marked `usable` with a gene-wise value of at least
/// `100 * min_disp` contribute.
pub fn estimate_prior_variance(
    gene_wise: &[f64],
    trend: &[f64],
    usable: &[bool],
    min_disp: f64,
    residual_df: usize,
) -> (f64, f64) {
    let residuals: Vec<f64> = gene_wise
        .iter()
        .zip(trend.iter())
        .zip(usable.iter())
        .filter(|((&g, &t), &u)| u && g.is_finite() && g >= 100.0 * min_disp && t.is_finite() && t > 0.0)
        .map(|((&g, &t), _)| g.ln() - t.ln())
        .collect();

    if residuals.is_empty() {
        log::warn!("no genes available to estimate the dispersion prior variance; using {}", MIN_PRIOR_VAR);
        return (MIN_PRIOR_VAR, f64::NAN);
    }

    let var_log_disp = mad_squared(&residuals);
    let expected = trigamma(residual_df as f64 / 2.0);
    let prior_var = (var_log_disp - expected).max(MIN_PRIOR_VAR);
    log::debug!(
        "Dispersion prior: {} genes, var(log disp)={:.4}, expected={:.4}, prior var={:.4}",
        residuals.len(),
        var_log_disp,
        expected,
        prior_var
    );
    (prior_var, var_log_disp)
}

/// Posterior mode of log(alpha) for one gene, returned as alpha
///
/// Starts at the gene-wise value unless it is below a tenth of the trend.
/// Falls back to a grid search when the line search does not converge.
pub fn fit_map_dispersion(
    counts: &[f64],
    design: &Array2<f64>,
    mu: &[f64],
    gene_disp: f64,
    trend_disp: f64,
    prior_var: f64,
    params: &DispersionParams,
) -> f64 {
    let prior = LogNormalPrior {
        mean: trend_disp.ln(),
        variance: prior_var,
    };
    let start = if gene_disp > 0.1 * trend_disp { gene_disp } else { trend_disp };

    let search = line_search(counts, design, mu, start.ln(), Some(&prior), params);
    let alpha = if search.converged {
        search.log_alpha.exp()
    } else {
        grid_search(counts, design, mu, params.min_disp, params.max_disp, Some(&prior))
    };
    alpha.clamp(params.min_disp, params.max_disp)
}

/// Shrink every gene toward its trend value, in gene order
///
/// Genes without a finite gene-wise value stay NaN. Genes whose gene-wise
/// search did not converge take the trend value.
pub fn estimate_map_dispersions(
    counts: ArrayView2<f64>,
    design: &Array2<f64>,
    gene_wise: &[GeneWiseEstimate],
    trend: &[f64],
    prior_var: f64,
    var_log_disp: f64,
    params: &DispersionParams,
) -> Vec<MapEstimate> {
    let outlier_threshold = params.outlier_sd * var_log_disp.sqrt();

    let estimates: Vec<MapEstimate> = (0..gene_wise.len())
        .into_par_iter()
        .map(|i| {
            let gene = &gene_wise[i];
            let trend_disp = trend[i];
            if !gene.dispersion.is_finite() {
                return MapEstimate {
                    dispersion: f64::NAN,
                    outlier: false,
                };
            }
            if !(trend_disp.is_finite() && trend_disp > 0.0) {
                return MapEstimate {
                    dispersion: gene.dispersion,
                    outlier: false,
                };
            }
            if !gene.converged {
                return MapEstimate {
                    dispersion: trend_disp.clamp(params.min_disp, params.max_disp),
                    outlier: false,
                };
            }

            if gene.dispersion.ln() > trend_disp.ln() + outlier_threshold {
                return MapEstimate {
                    dispersion: gene.dispersion,
                    outlier: true,
                };
            }

            let y = counts.row(i).to_vec();
            let map = fit_map_dispersion(&y, design, &gene.mu, gene.dispersion, trend_disp, prior_var, params);
            let lo = gene.dispersion.min(trend_disp);
            let hi = gene.dispersion.max(trend_disp);
            MapEstimate {
                dispersion: map.clamp(lo, hi).clamp(params.min_disp, params.max_disp),
                outlier: false,
            }
        })
        .collect();

    let n_outliers = estimates.iter().filter(|e| e.outlier).count();
    log::info!(
        "Dispersion outliers: {} genes above trend by more than {:.3} on the log scale",
        n_outliers,
        outlier_threshold
    );
    estimates
}
