//! Gene-wise dispersion estimation using Cox-Reid adjusted profile likelihood

use ndarray::{Array1, Array2, ArrayView2};
use rayon::prelude::*;

use super::likelihood::line_search;
use super::DispersionParams;
use crate::glm::linalg::least_squares_fitted;
use crate::glm::{default_ridge, fit_gene, DesignMatrix, GlmFitParams, MIN_MU};

/// Tolerance of the GLM fit that provides the mean model
const MU_FIT_TOL: f64 = 1e-6;

/// Maximum-likelihood dispersion of one gene
#[derive(Debug, Clone)]
pub struct GeneWiseEstimate {
    /// NaN for genes whose counts are all zero
    pub dispersion: f64,
    /// Fitted means the estimate was computed under, reused by the MAP stage
    pub mu: Vec<f64>,
    pub converged: bool,
    pub iterations: usize,
}

impl GeneWiseEstimate {
    fn all_zero(n_samples: usize) -> Self {
        Self {
            dispersion: f64::NAN,
            mu: vec![0.0; n_samples],
            converged: true,
            iterations: 0,
        }
    }
}

/// Estimate gene-wise dispersions for every gene, in gene order
pub fn estimate_gene_dispersions(
    counts: ArrayView2<f64>,
    size_factors: &Array1<f64>,
    design: &DesignMatrix,
    params: &DispersionParams,
) -> Vec<GeneWiseEstimate> {
    let (n_genes, n_samples) = counts.dim();
    let sf = size_factors.to_vec();
    let xim = sf.iter().map(|s| 1.0 / s).sum::<f64>() / n_samples as f64;
    let use_linear_mu = design.is_group_design();
    log::debug!(
        "Gene-wise dispersion mean model: {}",
        if use_linear_mu { "cell means" } else { "NB GLM" }
    );

    let estimates: Vec<GeneWiseEstimate> = (0..n_genes)
        .into_par_iter()
        .map(|i| {
            let y = counts.row(i).to_vec();
            estimate_gene(&y, &sf, design.matrix(), xim, use_linear_mu, params)
        })
        .collect();

    let not_converged = estimates.iter().filter(|e| !e.converged).count();
    if not_converged > 0 {
        log::warn!(
            "{} gene-wise dispersion estimates did not converge; their final values use the trend",
            not_converged
        );
    }
    estimates
}

/// Estimate the dispersion of a single gene
///
/// The starting value is the smaller of the rough and moments estimates. If
/// the line search does not improve on it the starting value is kept.
pub fn estimate_gene(
    counts: &[f64],
    size_factors: &[f64],
    design: &Array2<f64>,
    xim: f64,
    use_linear_mu: bool,
    params: &DispersionParams,
) -> GeneWiseEstimate {
    if counts.iter().all(|&c| c == 0.0) {
        return GeneWiseEstimate::all_zero(counts.len());
    }

    let normalized: Vec<f64> = counts.iter().zip(size_factors.iter()).map(|(&c, &s)| c / s).collect();

    let rough = rough_disp_estimate(&normalized, design);
    let moments = moments_disp_estimate(&normalized, xim);
    let alpha_init = rough.min(moments).clamp(params.min_disp, params.max_disp);

    let mu = if use_linear_mu {
        least_squares_fitted(design, &normalized)
            .iter()
            .zip(size_factors.iter())
            .map(|(&m, &s)| (m * s).max(MIN_MU))
            .collect()
    } else {
        let glm_params = GlmFitParams {
            maxit: params.maxit,
            beta_tol: MU_FIT_TOL,
        };
        fit_gene(counts, design, size_factors, alpha_init, &default_ridge(design.ncols()), &glm_params).mu
    };

    let search = line_search(counts, design, &mu, alpha_init.ln(), None, params);
    let no_increase = search.last_lp < search.initial_lp + search.initial_lp.abs() / 1e6;
    let dispersion = if no_increase { alpha_init } else { search.log_alpha.exp() };

    GeneWiseEstimate {
        dispersion: dispersion.clamp(params.min_disp, params.max_disp),
        mu,
        converged: search.converged,
        iterations: search.iterations,
    }
}

/// Residual-based estimate sum(((y - mu)^2 - mu) / mu^2) / (m - p) with mu
/// from least squares on normalized counts, floored at 1
fn rough_disp_estimate(normalized: &[f64], design: &Array2<f64>) -> f64 {
    let (m, p) = design.dim();
    let mu = least_squares_fitted(design, normalized);
    let total: f64 = normalized
        .iter()
        .zip(mu.iter())
        .map(|(&y, &mu)| {
            let mu = mu.max(1.0);
            ((y - mu).powi(2) - mu) / (mu * mu)
        })
        .sum();
    (total / (m - p) as f64).max(0.0)
}

/// (variance - xim * mean) / mean^2, xim being the mean of 1 / size factors
fn moments_disp_estimate(normalized: &[f64], xim: f64) -> f64 {
    let n = normalized.len() as f64;
    let mean = normalized.iter().sum::<f64>() / n;
    let var = normalized.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n - 1.0);
    (var - xim * mean) / (mean * mean)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn two_group_design() -> Array2<f64> {
        array![[1.0, 0.0], [1.0, 0.0], [1.0, 0.0], [1.0, 1.0], [1.0, 1.0], [1.0, 1.0]]
    }

    #[test]
    fn test_all_zero_gene() {
        let est = estimate_gene(
            &[0.0; 6],
            &[1.0; 6],
            &two_group_design(),
            1.0,
            true,
            &DispersionParams::default(),
        );
        assert!(est.dispersion.is_nan());
        assert!(est.converged);
    }

    #[test]
    fn test_moments_estimate() {
        // mean 10, variance 20: (20 - 10) / 100
        let x = [5.0, 10.0, 15.0, 5.0, 10.0, 15.0];
        assert_abs_diff_eq!(moments_disp_estimate(&x, 1.0), 0.1, epsilon = 1e-12);
    }

    #[test]
    fn test_rough_estimate_nonnegative() {
        let design = two_group_design();
        let flat = [10.0, 10.0, 10.0, 20.0, 20.0, 20.0];
        assert_eq!(rough_disp_estimate(&flat, &design), 0.0);
        let noisy = [2.0, 30.0, 10.0, 5.0, 60.0, 20.0];
        assert!(rough_disp_estimate(&noisy, &design) > 0.0);
    }

    #[test]
    fn test_overdispersed_gene_gets_larger_dispersion() {
        let design = two_group_design();
        let params = DispersionParams::default();
        let calm = estimate_gene(&[98.0, 102.0, 100.0, 199.0, 203.0, 201.0], &[1.0; 6], &design, 1.0, true, &params);
        let wild = estimate_gene(&[20.0, 180.0, 100.0, 60.0, 390.0, 150.0], &[1.0; 6], &design, 1.0, true, &params);
        assert!(wild.dispersion > calm.dispersion);
        assert!(wild.dispersion > 0.1);
        assert!(calm.dispersion >= params.min_disp);
    }

    #[test]
    fn test_linear_and_glm_mean_models_agree_for_groups() {
        let design = two_group_design();
        let params = DispersionParams::default();
        let counts = [40.0, 75.0, 52.0, 120.0, 90.0, 160.0];
        let linear = estimate_gene(&counts, &[1.0; 6], &design, 1.0, true, &params);
        let glm = estimate_gene(&counts, &[1.0; 6], &design, 1.0, false, &params);
        assert!((linear.dispersion.ln() - glm.dispersion.ln()).abs() < 0.05);
    }
}
