//! Variance stabilizing transformation
//!
//! Maps normalized counts through the integral of 1 / sqrt(variance(mu)) so
//! that the variance of the result no longer depends on the mean. The
//! parametric and mean trends have closed forms; the local trend is
//! integrated numerically and scaled to agree with log2 at high counts.

use std::cmp::Ordering;
use std::f64::consts::LN_2;

use ndarray::{Array1, Array2, ArrayView2, Axis};
use rayon::prelude::*;

use crate::dispersion::DispersionTrend;
use crate::error::{NbseqError, Result};
use crate::normalization::normalized_counts;
use crate::stats::quantile_sorted;

/// Points of the asinh-spaced integration grid
const GRID_POINTS: usize = 1000;

/// Base mean quantiles where the local transform is pinned to log2
const ANCHOR_LOW: f64 = 0.95;
const ANCHOR_HIGH: f64 = 0.999;

/// Closed form for `a0 + a1 / mu`
pub fn vst_parametric(q: f64, asympt_disp: f64, extra_pois: f64) -> f64 {
    let q = q.max(0.0);
    let a = asympt_disp;
    let numerator = 1.0 + extra_pois + 2.0 * a * q + 2.0 * (a * q * (1.0 + extra_pois + a * q)).sqrt();
    (numerator / (4.0 * a)).ln() / LN_2
}

/// Closed form for a constant dispersion
pub fn vst_mean(q: f64, alpha: f64) -> f64 {
    let q = q.max(0.0);
    (2.0 * (alpha * q).sqrt().asinh() - alpha.ln() - 4.0_f64.ln()) / LN_2
}

/// Numerical transform for a local trend
struct LocalIntegral {
    /// asinh of the grid points
    knots: Vec<f64>,
    /// Cumulative integral at each knot
    values: Vec<f64>,
    scale: f64,
    shift: f64,
}

impl LocalIntegral {
    fn build(trend: &DispersionTrend, max_count: f64, xim: f64, base_means: &[f64]) -> Result<Self> {
        let top = max_count.max(1.0).asinh();
        let grid: Vec<f64> = (0..GRID_POINTS)
            .map(|k| (top * k as f64 / (GRID_POINTS - 1) as f64).sinh())
            .collect();
        let integrand = |x: f64| 1.0 / (xim * x + trend.eval(x) * x * x).sqrt();

        let mut values = Vec::with_capacity(GRID_POINTS);
        values.push(0.0);
        // Poisson part dominates near zero: integral of (xim x)^-1/2 over [0, x1]
        values.push(2.0 * (grid[1] / xim).sqrt());
        for k in 2..GRID_POINTS {
            let step = (grid[k] - grid[k - 1]) * (integrand(grid[k]) + integrand(grid[k - 1])) / 2.0;
            values.push(values[k - 1] + step);
        }

        let mut integral = Self {
            knots: grid.iter().map(|x| x.asinh()).collect(),
            values,
            scale: 1.0,
            shift: 0.0,
        };

        let mut sorted: Vec<f64> = base_means.iter().copied().filter(|m| m.is_finite()).collect();
        sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let h1 = quantile_sorted(&sorted, ANCHOR_LOW);
        let h2 = quantile_sorted(&sorted, ANCHOR_HIGH);
        let (f1, f2) = (integral.raw(h1), integral.raw(h2));
        if !(h1 > 0.0 && h2 > h1 && f2 > f1) {
            return Err(NbseqError::TrendFittingFailed {
                reason: format!(
                    "cannot anchor the local transform: base mean quantiles {:.3} and {:.3}",
                    h1, h2
                ),
            });
        }
        integral.scale = (h2.log2() - h1.log2()) / (f2 - f1);
        integral.shift = h1.log2() - integral.scale * f1;
        Ok(integral)
    }

    /// Cumulative integral at `q`, linear in asinh(q) between knots
    fn raw(&self, q: f64) -> f64 {
        let x = q.max(0.0).asinh();
        let n = self.knots.len();
        let idx = self.knots.partition_point(|&k| k <= x).clamp(1, n - 1);
        let (x0, x1) = (self.knots[idx - 1], self.knots[idx]);
        let (y0, y1) = (self.values[idx - 1], self.values[idx]);
        if x1 <= x0 {
            return y0;
        }
        y0 + (x - x0) * (y1 - y0) / (x1 - x0)
    }

    fn transform(&self, q: f64) -> f64 {
        self.scale * self.raw(q) + self.shift
    }
}

/// Variance-stabilized matrix, genes x samples, on a log2-like scale
pub fn vst(counts: ArrayView2<f64>, size_factors: &Array1<f64>, trend: &DispersionTrend) -> Result<Array2<f64>> {
    let normalized = normalized_counts(counts, size_factors);
    let (n_genes, n_samples) = normalized.dim();

    let transform: Box<dyn Fn(f64) -> f64 + Sync> = match trend {
        DispersionTrend::Parametric {
            asympt_disp,
            extra_pois,
        } => {
            let (a0, a1) = (*asympt_disp, *extra_pois);
            Box::new(move |q| vst_parametric(q, a0, a1))
        }
        DispersionTrend::Mean { dispersion } => {
            let alpha = *dispersion;
            Box::new(move |q| vst_mean(q, alpha))
        }
        DispersionTrend::Local(_) => {
            let base_means: Vec<f64> = normalized
                .axis_iter(Axis(0))
                .map(|row| row.mean().unwrap_or(0.0))
                .collect();
            let max_count = normalized.iter().copied().fold(0.0, f64::max);
            let xim = size_factors.iter().map(|s| 1.0 / s).sum::<f64>() / n_samples as f64;
            let integral = LocalIntegral::build(trend, max_count, xim, &base_means)?;
            Box::new(move |q| integral.transform(q))
        }
    };
    log::info!("Variance stabilizing {} genes with the {:?} trend", n_genes, trend.fit_type());

    let rows: Vec<Vec<f64>> = (0..n_genes)
        .into_par_iter()
        .map(|i| normalized.row(i).iter().map(|&q| transform(q)).collect())
        .collect();

    let mut result = Array2::zeros((n_genes, n_samples));
    for (i, row) in rows.into_iter().enumerate() {
        for (j, value) in row.into_iter().enumerate() {
            result[[i, j]] = value;
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FitType;
    use crate::dispersion::fit_trend;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_parametric_approaches_log2() {
        let q = 1e6;
        assert!((vst_parametric(q, 0.05, 2.0) - q.log2()).abs() < 0.01);
        // finite and increasing from zero
        let v0 = vst_parametric(0.0, 0.05, 2.0);
        assert!(v0.is_finite());
        assert!(vst_parametric(10.0, 0.05, 2.0) > v0);
    }

    #[test]
    fn test_mean_form() {
        let alpha = 0.1;
        assert_abs_diff_eq!(vst_mean(0.0, alpha), (-alpha.ln() - 4.0_f64.ln()) / LN_2, epsilon = 1e-12);
        assert!((vst_mean(1e7, alpha) - 1e7_f64.log2()).abs() < 0.01);
    }

    #[test]
    fn test_matrix_is_deterministic_and_monotone() {
        let counts = array![[0.0, 10.0, 100.0, 1000.0], [5.0, 5.0, 5.0, 5.0]];
        let sf = Array1::from_vec(vec![1.0, 1.0, 1.0, 1.0]);
        let trend = DispersionTrend::Parametric {
            asympt_disp: 0.05,
            extra_pois: 1.0,
        };
        let a = vst(counts.view(), &sf, &trend).unwrap();
        let b = vst(counts.view(), &sf, &trend).unwrap();
        assert_eq!(a, b);
        assert!(a[[0, 0]] < a[[0, 1]] && a[[0, 1]] < a[[0, 2]] && a[[0, 2]] < a[[0, 3]]);
        assert_abs_diff_eq!(a[[1, 0]], a[[1, 3]], epsilon = 1e-12);
    }

    #[test]
    fn test_local_transform_anchored_to_log2() {
        let means: Vec<f64> = (0..200).map(|i| (i as f64 * 9.0 / 200.0).exp()).collect();
        let disps: Vec<f64> = means.iter().map(|m| 0.02 + 1.0 / m).collect();
        let trend = fit_trend(&means, &disps, &[true; 200], FitType::Local, 1e-8).unwrap();

        let counts = Array2::from_shape_fn((200, 2), |(i, j)| (means[i] * if j == 0 { 0.9 } else { 1.1 }).round());
        let sf = Array1::from_vec(vec![1.0, 1.0]);
        let out = vst(counts.view(), &sf, &trend).unwrap();

        let top = 199;
        assert!((out[[top, 1]] - counts[[top, 1]].log2()).abs() < 0.1);
        for i in 1..200 {
            assert!(out[[i, 0]] >= out[[i - 1, 0]] - 1e-9);
        }
    }
}
