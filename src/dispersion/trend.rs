//! Dispersion trend fitting
//!
//! The trend describes the expected dispersion as a function of a gene's
//! mean normalized count. The parametric form is tried first; if it cannot
//! be fit the local and then the mean form take over.

use std::cmp::Ordering;

use serde::Serialize;

use crate::config::FitType;
use crate::error::{NbseqError, Result};
use crate::stats::trimmed_mean;

/// Residual window `gene / fitted` used by each parametric round
const RESIDUAL_LOW: f64 = 1e-4;
const RESIDUAL_HIGH: f64 = 15.0;

/// Rounds of residual filtering and refitting
const PARAMETRIC_ROUNDS: usize = 11;

/// Nearest-neighbour span of the local fit
const LOCAL_SPAN: f64 = 0.7;

/// Cell width, relative to bandwidth, above which the local fit adds a vertex
const LOCAL_CUT: f64 = 0.8;

/// Fitted dispersion-mean relationship
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DispersionTrend {
    /// alpha(mean) = asympt_disp + extra_pois / mean
    Parametric { asympt_disp: f64, extra_pois: f64 },
    /// Local regression of log dispersion on log mean
    Local(LocalTrend),
    /// One value for every mean
    Mean { dispersion: f64 },
}

impl DispersionTrend {
    /// Trend value at `mean`, NaN for a non-positive mean
    pub fn eval(&self, mean: f64) -> f64 {
        if !(mean > 0.0) {
            return f64::NAN;
        }
        match self {
            DispersionTrend::Parametric {
                asympt_disp,
                extra_pois,
            } => asympt_disp + extra_pois / mean,
            DispersionTrend::Local(local) => local.predict(mean.ln()).exp(),
            DispersionTrend::Mean { dispersion } => *dispersion,
        }
    }

    pub fn fit_type(&self) -> FitType {
        match self {
            DispersionTrend::Parametric { .. } => FitType::Parametric,
            DispersionTrend::Local(_) => FitType::Local,
            DispersionTrend::Mean { .. } => FitType::Mean,
        }
    }
}

/// Fit the trend of `requested` type, falling back parametric -> local -> mean
///
/// `usable` marks genes whose gene-wise estimate may inform the trend
/// (finite, converged, positive mean).
pub fn fit_trend(
    means: &[f64],
    dispersions: &[f64],
    usable: &[bool],
    requested: FitType,
    min_disp: f64,
) -> Result<DispersionTrend> {
    let select = |threshold: f64| -> Vec<(f64, f64)> {
        means
            .iter()
            .zip(dispersions.iter())
            .zip(usable.iter())
            .filter(|((&m, &d), &u)| u && m > 0.0 && d.is_finite() && d > threshold)
            .map(|((&m, &d), _)| (m, d))
            .collect()
    };

    if requested == FitType::Parametric {
        match fit_parametric(&select(100.0 * min_disp)) {
            Ok(trend) => return Ok(trend),
            Err(e) => log::warn!("{}; falling back to a local fit", e),
        }
    }

    if requested != FitType::Mean {
        match fit_local(&select(10.0 * min_disp)) {
            Ok(trend) => return Ok(trend),
            Err(e) => log::warn!("{}; falling back to the mean dispersion", e),
        }
    }

    let for_mean: Vec<f64> = select(10.0 * min_disp).into_iter().map(|(_, d)| d).collect();
    let dispersion = if for_mean.is_empty() {
        // nothing above the floor, e.g. Poisson-like data
        let finite: Vec<f64> = dispersions
            .iter()
            .zip(usable.iter())
            .filter(|(d, &u)| u && d.is_finite())
            .map(|(&d, _)| d)
            .collect();
        log::warn!(
            "no gene-wise dispersion above {:e}; using the mean of {} estimates",
            10.0 * min_disp,
            finite.len()
        );
        trimmed_mean(&finite, 0.001)
    } else {
        trimmed_mean(&for_mean, 0.001)
    };

    if !(dispersion.is_finite() && dispersion > 0.0) {
        return Err(NbseqError::TrendFittingFailed {
            reason: "no usable gene-wise dispersion estimates".to_string(),
        });
    }
    Ok(DispersionTrend::Mean { dispersion })
}

/// Gamma-family GLM with identity link, disp ~ a0 + a1 / mean, refit after
/// dropping genes with extreme residuals until the coefficients settle
fn fit_parametric(data: &[(f64, f64)]) -> Result<DispersionTrend> {
    if data.len() < 3 {
        return Err(NbseqError::TrendFittingFailed {
            reason: format!("only {} genes available for the parametric trend", data.len()),
        });
    }

    let mut coefs = (0.1_f64, 1.0_f64);
    for round in 0..PARAMETRIC_ROUNDS {
        let old = coefs;
        let kept: Vec<(f64, f64)> = data
            .iter()
            .filter(|&&(mean, disp)| {
                let fitted = coefs.0 + coefs.1 / mean;
                let residual = disp / fitted;
                fitted > 0.0 && residual > RESIDUAL_LOW && residual < RESIDUAL_HIGH
            })
            .copied()
            .collect();
        if kept.len() < 3 {
            return Err(NbseqError::TrendFittingFailed {
                reason: "too few genes inside the residual window for the parametric trend".to_string(),
            });
        }

        let (new_coefs, glm_converged) = fit_gamma_identity(&kept, coefs);
        coefs = new_coefs;
        log::debug!(
            "Parametric trend round {}: {} genes, a0={:.6}, a1={:.6}",
            round + 1,
            kept.len(),
            coefs.0,
            coefs.1
        );

        if !(coefs.0 > 0.0 && coefs.1 > 0.0) {
            return Err(NbseqError::TrendFittingFailed {
                reason: format!(
                    "parametric trend coefficients are not positive (a0={:.4}, a1={:.4})",
                    coefs.0, coefs.1
                ),
            });
        }

        let change = (coefs.0 / old.0).ln().powi(2) + (coefs.1 / old.1).ln().powi(2);
        if change < 1e-6 && glm_converged {
            log::info!("Dispersion trend: {:.6} + {:.6} / mean", coefs.0, coefs.1);
            return Ok(DispersionTrend::Parametric {
                asympt_disp: coefs.0,
                extra_pois: coefs.1,
            });
        }
    }

    Err(NbseqError::TrendFittingFailed {
        reason: "parametric trend did not converge".to_string(),
    })
}

/// IRLS for a Gamma GLM with identity link on one predictor 1 / mean
fn fit_gamma_identity(data: &[(f64, f64)], start: (f64, f64)) -> ((f64, f64), bool) {
    let deviance = |a0: f64, a1: f64| -> f64 {
        data.iter()
            .map(|&(mean, disp)| {
                let mu = (a0 + a1 / mean).max(1e-8);
                2.0 * (-(disp / mu).ln() + (disp - mu) / mu)
            })
            .sum()
    };

    let (mut a0, mut a1) = start;
    let mut dev_old = deviance(a0, a1);
    for _ in 0..25 {
        let (mut sw, mut swx, mut swz, mut swxx, mut swxz) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for &(mean, disp) in data {
            let x = 1.0 / mean;
            let mu = (a0 + a1 * x).max(1e-8);
            let w = 1.0 / (mu * mu);
            sw += w;
            swx += w * x;
            swz += w * disp;
            swxx += w * x * x;
            swxz += w * x * disp;
        }
        let det = sw * swxx - swx * swx;
        if det.abs() < 1e-10 {
            return ((a0, a1), false);
        }
        a0 = (swxx * swz - swx * swxz) / det;
        a1 = (sw * swxz - swx * swz) / det;

        let dev = deviance(a0, a1);
        if (dev_old - dev).abs() / (0.1 + dev.abs()) < 1e-8 {
            return ((a0, a1), true);
        }
        dev_old = dev;
    }
    ((a0, a1), false)
}

/// Vertex of the local fit: fitted log dispersion and slope at `x = ln(mean)`
#[derive(Debug, Clone, Serialize)]
pub struct TrendVertex {
    pub x: f64,
    pub value: f64,
    pub slope: f64,
    #[serde(skip)]
    bandwidth: f64,
}

/// Tricube local linear regression of log dispersion on log mean, evaluated
/// at adaptively placed vertices and interpolated between them
#[derive(Debug, Clone, Serialize)]
pub struct LocalTrend {
    vertices: Vec<TrendVertex>,
}

impl LocalTrend {
    pub fn vertices(&self) -> &[TrendVertex] {
        &self.vertices
    }

    /// Cubic Hermite interpolation, constant beyond the outer vertices
    fn predict(&self, x: f64) -> f64 {
        let n = self.vertices.len();
        let first = &self.vertices[0];
        let last = &self.vertices[n - 1];
        if n == 1 || x <= first.x {
            return first.value;
        }
        if x >= last.x {
            return last.value;
        }

        let right_idx = self.vertices.partition_point(|v| v.x <= x).min(n - 1);
        let left = &self.vertices[right_idx - 1];
        let right = &self.vertices[right_idx];
        let d = right.x - left.x;
        if d <= 0.0 {
            return left.value;
        }
        let t = (x - left.x) / d;
        let h_right = t * t * (3.0 - 2.0 * t);
        let h_left = 1.0 - h_right;
        let s_left = t * (1.0 - t) * (1.0 - t);
        let s_right = t * t * (t - 1.0);
        h_left * left.value + h_right * right.value + d * (s_left * left.slope + s_right * right.slope)
    }
}

struct LocalData {
    x: Vec<f64>,
    y: Vec<f64>,
    weights: Vec<f64>,
    k: usize,
}

impl LocalData {
    fn fit_at(&self, x0: f64) -> TrendVertex {
        let mut distances: Vec<f64> = self.x.iter().map(|x| (x - x0).abs()).collect();
        let kth = self.k - 1;
        distances.select_nth_unstable_by(kth, |a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        let bandwidth = distances[kth].max(1e-10);

        let (mut sw, mut swx, mut swy, mut swxx, mut swxy) = (0.0, 0.0, 0.0, 0.0, 0.0);
        for ((&x, &y), &prior) in self.x.iter().zip(self.y.iter()).zip(self.weights.iter()) {
            let dx = x - x0;
            let u = dx.abs() / bandwidth;
            if u >= 1.0 {
                continue;
            }
            let w = prior * (1.0 - u * u * u).powi(3);
            sw += w;
            swx += w * dx;
            swy += w * y;
            swxx += w * dx * dx;
            swxy += w * dx * y;
        }

        let det = sw * swxx - swx * swx;
        let (value, slope) = if sw <= 0.0 {
            (f64::NAN, 0.0)
        } else if det <= 1e-12 * sw * sw.max(swxx) {
            (swy / sw, 0.0)
        } else {
            ((swxx * swy - swx * swxy) / det, (sw * swxy - swx * swy) / det)
        };

        TrendVertex {
            x: x0,
            value,
            slope,
            bandwidth,
        }
    }

    fn split(&self, vertices: &mut Vec<TrendVertex>, left: usize, right: usize, depth: usize) {
        let width = vertices[right].x - vertices[left].x;
        let min_bandwidth = vertices[left].bandwidth.min(vertices[right].bandwidth);
        if depth > 20 || width < 1e-10 || width / min_bandwidth <= LOCAL_CUT {
            return;
        }
        let mid = self.fit_at((vertices[left].x + vertices[right].x) / 2.0);
        vertices.push(mid);
        let mid_idx = vertices.len() - 1;
        self.split(vertices, left, mid_idx, depth + 1);
        self.split(vertices, mid_idx, right, depth + 1);
    }
}

fn fit_local(data: &[(f64, f64)]) -> Result<DispersionTrend> {
    if data.len() < 5 {
        return Err(NbseqError::TrendFittingFailed {
            reason: format!("only {} genes available for the local trend", data.len()),
        });
    }

    let n = data.len();
    let local = LocalData {
        x: data.iter().map(|&(m, _)| m.ln()).collect(),
        y: data.iter().map(|&(_, d)| d.ln()).collect(),
        weights: data.iter().map(|&(m, _)| m).collect(),
        k: ((n as f64 * LOCAL_SPAN).ceil() as usize).clamp(3, n),
    };

    let x_min = local.x.iter().copied().fold(f64::INFINITY, f64::min);
    let x_max = local.x.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let mut vertices = vec![local.fit_at(x_min), local.fit_at(x_max)];
    local.split(&mut vertices, 0, 1, 0);
    vertices.sort_by(|a, b| a.x.partial_cmp(&b.x).unwrap_or(Ordering::Equal));

    if vertices.iter().any(|v| !v.value.is_finite()) {
        return Err(NbseqError::TrendFittingFailed {
            reason: "local trend produced non-finite values".to_string(),
        });
    }
    log::info!("Dispersion trend: local fit with {} vertices", vertices.len());
    Ok(DispersionTrend::Local(LocalTrend { vertices }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn curve_data() -> (Vec<f64>, Vec<f64>) {
        // exact a0 + a1 / mean with mild multiplicative wobble
        let means: Vec<f64> = (0..200).map(|i| 1.0 + i as f64 * 5.0).collect();
        let disps = means
            .iter()
            .enumerate()
            .map(|(i, m)| (0.05 + 2.0 / m) * if i % 2 == 0 { 1.1 } else { 1.0 / 1.1 })
            .collect();
        (means, disps)
    }

    #[test]
    fn test_parametric_recovers_curve() {
        let (means, disps) = curve_data();
        let usable = vec![true; means.len()];
        let trend = fit_trend(&means, &disps, &usable, FitType::Parametric, 1e-8).unwrap();
        match trend {
            DispersionTrend::Parametric {
                asympt_disp,
                extra_pois,
            } => {
                assert!((asympt_disp - 0.05).abs() < 0.01, "a0 = {}", asympt_disp);
                assert!((extra_pois - 2.0).abs() < 0.3, "a1 = {}", extra_pois);
            }
            other => panic!("expected parametric trend, got {:?}", other),
        }
    }

    #[test]
    fn test_parametric_falls_back_when_increasing() {
        // dispersion rising with the mean gives a negative a1
        let means: Vec<f64> = (1..=100).map(|i| i as f64 * 10.0).collect();
        let disps: Vec<f64> = means.iter().map(|m| 0.001 * m).collect();
        let usable = vec![true; means.len()];
        let trend = fit_trend(&means, &disps, &usable, FitType::Parametric, 1e-8).unwrap();
        assert_eq!(trend.fit_type(), FitType::Local);
        assert!(trend.eval(500.0) > trend.eval(20.0));
    }

    #[test]
    fn test_local_trend_tracks_power_law() {
        let means: Vec<f64> = (0..200).map(|i| (i as f64 * 7.0 / 200.0).exp()).collect();
        let disps: Vec<f64> = means
            .iter()
            .enumerate()
            .map(|(i, m)| 0.5 / m.sqrt() * if i % 2 == 0 { 1.1 } else { 1.0 / 1.1 })
            .collect();
        let usable = vec![true; means.len()];
        let trend = fit_trend(&means, &disps, &usable, FitType::Local, 1e-8).unwrap();
        assert_eq!(trend.fit_type(), FitType::Local);
        for &m in &[10.0, 100.0, 800.0] {
            let truth = 0.5 / f64::sqrt(m);
            let fitted = trend.eval(m);
            assert!((fitted / truth).ln().abs() < 0.1,"mean {}: {} vs {}", m, fitted, truth);
        }
        // clamped outside the data range
        assert_abs_diff_eq!(trend.eval(1e7), trend.eval(1e6), epsilon = 1e-12);
    }

    #[test]
    fn test_mean_trend_and_unusable_genes() {
        let means = vec![10.0, 20.0, 30.0, 40.0];
        let disps = vec![0.1, 0.2, 0.3, 5.0];
        let usable = vec![true, true, true, false];
        let trend = fit_trend(&means, &disps, &usable, FitType::Mean, 1e-8).unwrap();
        assert_abs_diff_eq!(trend.eval(12.0), 0.2, epsilon = 1e-12);
        assert!(trend.eval(0.0).is_nan());
    }

    #[test]
    fn test_floor_level_estimates_still_give_a_trend() {
        let means = vec![10.0, 20.0, 30.0];
        let disps = vec![1e-8; 3];
        let trend = fit_trend(&means, &disps, &[true; 3], FitType::Parametric, 1e-8).unwrap();
        assert_eq!(trend.fit_type(), FitType::Mean);
        assert_abs_diff_eq!(trend.eval(5.0), 1e-8, epsilon = 1e-20);
    }

    #[test]
    fn test_no_estimates_is_an_error() {
        let err = fit_trend(&[10.0], &[f64::NAN], &[true], FitType::Parametric, 1e-8).unwrap_err();
        assert!(matches!(err, NbseqError::TrendFittingFailed { .. }));
    }
}
