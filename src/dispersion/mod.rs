//! Dispersion estimation for negative binomial models
//!
//! Three stages run in order with a barrier between each: gene-wise maximum
//! likelihood, a trend over the mean, and shrinkage of the gene-wise values
//! toward the trend.

mod gene_wise;
mod likelihood;
mod map;
mod trend;

pub use gene_wise::{estimate_gene, estimate_gene_dispersions, GeneWiseEstimate};
pub use likelihood::{d_log_posterior, grid_search, line_search, log_posterior, LineSearchResult, LogNormalPrior};
pub use map::{estimate_map_dispersions, estimate_prior_variance, fit_map_dispersion, MapEstimate};
pub use trend::{fit_trend, DispersionTrend, LocalTrend, TrendVertex};

use ndarray::{Array1, ArrayView2, Axis};

use crate::config::{AnalysisConfig, FitType};
use crate::error::{NbseqError, Result};
use crate::glm::DesignMatrix;

/// Configurable parameters for dispersion estimation
#[derive(Debug, Clone)]
pub struct DispersionParams {
    /// Lower bound on every dispersion
    pub min_disp: f64,
    /// Upper bound on every dispersion
    pub max_disp: f64,
    /// Convergence tolerance on the log posterior
    pub disp_tol: f64,
    /// Initial step size of the line search
    pub kappa_0: f64,
    pub maxit: usize,
    /// Standard deviations above the trend beyond which a gene is an outlier
    pub outlier_sd: f64,
}

impl Default for DispersionParams {
    fn default() -> Self {
        Self {
            min_disp: 1e-8,
            max_disp: 10.0,
            disp_tol: 1e-6,
            kappa_0: 1.0,
            maxit: 100,
            outlier_sd: 2.0,
        }
    }
}

impl DispersionParams {
    pub fn from_config(config: &AnalysisConfig, n_samples: usize) -> Self {
        Self {
            min_disp: config.min_disp,
            max_disp: config.max_disp_for(n_samples),
            disp_tol: config.disp_tol,
            kappa_0: 1.0,
            maxit: config.maxit,
            outlier_sd: config.outlier_sd,
        }
    }
}

/// Frozen output of the dispersion stage
#[derive(Debug, Clone)]
pub struct DispersionEstimates {
    /// Mean of normalized counts per gene
    pub base_means: Array1<f64>,
    pub gene_wise: Array1<f64>,
    /// Trend evaluated at each gene's base mean
    pub trended: Array1<f64>,
    /// Shrunk values used downstream
    pub dispersions: Array1<f64>,
    pub trend: DispersionTrend,
    pub prior_var: f64,
    pub var_log_disp: f64,
    pub converged: Vec<bool>,
    pub outlier: Vec<bool>,
    pub all_zero: Vec<bool>,
}

impl DispersionEstimates {
    pub fn n_genes(&self) -> usize {
        self.dispersions.len()
    }
}

/// Run gene-wise, trend and MAP estimation
pub fn estimate_dispersions(
    counts: ArrayView2<f64>,
    size_factors: &Array1<f64>,
    design: &DesignMatrix,
    fit_type: FitType,
    params: &DispersionParams,
) -> Result<DispersionEstimates> {
    let (n_genes, n_samples) = counts.dim();
    for (what, got) in [("size factors", size_factors.len()), ("design rows", design.n_samples())] {
        if got != n_samples {
            return Err(NbseqError::DimensionMismatch {
                expected: format!("{} {}", n_samples, what),
                got: got.to_string(),
            });
        }
    }
    if design.residual_df() == 0 {
        return Err(NbseqError::InvalidDesign {
            reason: "no residual degrees of freedom; dispersion needs replicates".to_string(),
        });
    }

    log::info!("Estimating dispersions for {} genes", n_genes);

    let base_means: Vec<f64> = counts
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .zip(size_factors.iter())
                .map(|(&c, &s)| c / s)
                .sum::<f64>()
                / n_samples as f64
        })
        .collect();
    let all_zero: Vec<bool> = counts
        .axis_iter(Axis(0))
        .map(|row| row.iter().all(|&c| c == 0.0))
        .collect();

    let gene_wise = estimate_gene_dispersions(counts, size_factors, design, params);
    let gene_values: Vec<f64> = gene_wise.iter().map(|e| e.dispersion).collect();
    let converged: Vec<bool> = gene_wise.iter().map(|e| e.converged).collect();
    let usable: Vec<bool> = gene_wise
        .iter()
        .zip(all_zero.iter())
        .map(|(e, &zero)| !zero && e.converged && e.dispersion.is_finite())
        .collect();

    let trend = fit_trend(
        &base_means,
        &gene_values,
        &usable,
        fit_type,
        params.min_disp,
    )?;
    if trend.fit_type() != fit_type {
        log::warn!("Requested {:?} trend, fitted {:?}", fit_type, trend.fit_type());
    }

    let trended: Vec<f64> = base_means.iter().map(|&m| trend.eval(m)).collect();
    let (prior_var, var_log_disp) = estimate_prior_variance(
        &gene_values,
        &trended,
        &usable,
        params.min_disp,
        design.residual_df(),
    );

    let map = estimate_map_dispersions(
        counts,
        design.matrix(),
        &gene_wise,
        &trended,
        prior_var,
        var_log_disp,
        params,
    );

    Ok(DispersionEstimates {
        base_means: Array1::from_vec(base_means),
        gene_wise: Array1::from_vec(gene_values),
        trended: Array1::from_vec(trended),
        dispersions: map.iter().map(|m| m.dispersion).collect(),
        trend,
        prior_var,
        var_log_disp,
        converged,
        outlier: map.iter().map(|m| m.outlier).collect(),
        all_zero,
    })
}
