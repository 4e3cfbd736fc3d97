//! Cook's distance outlier detection
//!
//! Cook's distance measures how much a single sample moves a gene's fit:
//! `PearsonRes^2 / p * h / (1 - h)^2`. The Pearson residuals use a robust
//! method-of-moments dispersion from trimmed within-cell variances, so one
//! extreme count does not hide itself by inflating the dispersion.

use ndarray::{Array2, ArrayView2, Axis};
use rayon::prelude::*;
use statrs::distribution::{ContinuousCDF, FisherSnedecor};

use crate::glm::{nb_variance, GeneFit};
use crate::stats::trimmed_mean;

/// Floor of the robust dispersion
const MIN_ROBUST_DISP: f64 = 0.04;

/// Replicates a cell needs before its samples count toward outlier calls
pub const MIN_REPLICATES: usize = 3;

/// Trim ratio and scale making a trimmed mean square a variance estimate
fn trim_constants(n: usize) -> (f64, f64) {
    if n <= 3 {
        (1.0 / 3.0, 2.04)
    } else if n <= 23 {
        (1.0 / 4.0, 1.86)
    } else {
        (1.0 / 8.0, 1.51)
    }
}

fn trimmed_variance(values: &[f64], trim: f64, scale: f64) -> f64 {
    let center = trimmed_mean(values, trim);
    let squares: Vec<f64> = values.iter().map(|v| (v - center).powi(2)).collect();
    scale * trimmed_mean(&squares, trim)
}

/// Samples that sit in a design cell with at least [`MIN_REPLICATES`] members
pub fn replicated_samples(cells: &[usize]) -> Vec<bool> {
    let n_cells = cells.iter().max().map_or(0, |m| m + 1);
    let mut sizes = vec![0usize; n_cells];
    for &c in cells {
        sizes[c] += 1;
    }
    cells.iter().map(|&c| sizes[c] >= MIN_REPLICATES).collect()
}

/// Robust dispersion `(v - m) / m^2` per gene, floored at 0.04
///
/// `v` is the largest trimmed variance over cells with enough replicates,
/// or the trimmed variance over all samples when no cell qualifies.
pub fn robust_moments_dispersions(normalized: ArrayView2<f64>, cells: &[usize]) -> Vec<f64> {
    let n_cells = cells.iter().max().map_or(0, |m| m + 1);
    let members: Vec<Vec<usize>> = (0..n_cells)
        .map(|c| (0..cells.len()).filter(|&j| cells[j] == c).collect())
        .filter(|m: &Vec<usize>| m.len() >= MIN_REPLICATES)
        .collect();

    normalized
        .axis_iter(Axis(0))
        .map(|row| {
            let mean = row.mean().unwrap_or(0.0);
            if !(mean > 0.0) {
                return MIN_ROBUST_DISP;
            }
            let variance = if members.is_empty() {
                let values = row.to_vec();
                trimmed_variance(&values, 1.0 / 8.0, 1.51)
            } else {
                members
                    .iter()
                    .map(|m| {
                        let values: Vec<f64> = m.iter().map(|&j| row[j]).collect();
                        let (trim, scale) = trim_constants(values.len());
                        trimmed_variance(&values, trim, scale)
                    })
                    .fold(0.0, f64::max)
            };
            ((variance - mean) / (mean * mean)).max(MIN_ROBUST_DISP)
        })
        .collect()
}

/// Cook's distance of every gene and sample; NaN rows for unfitted genes
pub fn cooks_distances(counts: ArrayView2<f64>, fits: &[GeneFit], dispersions: &[f64]) -> Array2<f64> {
    let (n_genes, n_samples) = counts.dim();
    let rows: Vec<Vec<f64>> = (0..n_genes)
        .into_par_iter()
        .map(|i| {
            let fit = &fits[i];
            if !fit.is_fitted() {
                return vec![f64::NAN; n_samples];
            }
            let p = fit.n_coefs as f64;
            let alpha = dispersions[i];
            (0..n_samples)
                .map(|j| {
                    let mu = fit.mu[j];
                    let h = fit.hat_diagonals[j];
                    let pearson_sq = (counts[[i, j]] - mu).powi(2) / nb_variance(mu, alpha);
                    if h.is_finite() && h < 1.0 && pearson_sq.is_finite() {
                        pearson_sq / p * h / (1.0 - h).powi(2)
                    } else {
                        f64::NAN
                    }
                })
                .collect()
        })
        .collect();

    let mut cooks = Array2::from_elem((n_genes, n_samples), f64::NAN);
    for (i, row) in rows.into_iter().enumerate() {
        for (j, value) in row.into_iter().enumerate() {
            cooks[[i, j]] = value;
        }
    }
    cooks
}

/// Largest Cook's distance per gene over `eligible` samples, NaN if none
pub fn max_cooks(cooks: &Array2<f64>, eligible: &[bool]) -> Vec<f64> {
    cooks
        .axis_iter(Axis(0))
        .map(|row| {
            row.iter()
                .zip(eligible.iter())
                .filter(|(c, &e)| e && c.is_finite())
                .map(|(&c, _)| c)
                .fold(f64::NAN, f64::max)
        })
        .collect()
}

/// 0.99 quantile of F(p, m - p)
pub fn default_cooks_cutoff(n_samples: usize, n_coefs: usize) -> f64 {
    if n_samples <= n_coefs {
        return f64::INFINITY;
    }
    FisherSnedecor::new(n_coefs as f64, (n_samples - n_coefs) as f64)
        .map_or(f64::INFINITY, |f| f.inverse_cdf(0.99))
}
