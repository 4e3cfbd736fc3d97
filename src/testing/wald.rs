//! Wald test of a contrast against a log2 fold change threshold

use std::f64::consts::LN_2;

use super::pvalue::WaldDistribution;
use crate::config::AltHypothesis;
use crate::glm::GeneFit;

/// Per-gene Wald test outcome, effect sizes on the log2 scale
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaldOutcome {
    pub log2_fold_change: f64,
    pub lfc_se: f64,
    pub stat: f64,
    pub pvalue: f64,
}

impl WaldOutcome {
    pub fn missing() -> Self {
        Self {
            log2_fold_change: f64::NAN,
            lfc_se: f64::NAN,
            stat: f64::NAN,
            pvalue: f64::NAN,
        }
    }
}

/// Statistic and p-value for one log2 fold change and its standard error
///
/// With a zero threshold and `GreaterAbs` this is the ordinary two-sided test.
/// A statistic that falls on the null side of the threshold is reported as 0.
pub fn wald_statistic(
    lfc: f64,
    se: f64,
    threshold: f64,
    alternative: AltHypothesis,
    distribution: WaldDistribution,
) -> (f64, f64) {
    if !(lfc.is_finite() && se.is_finite() && se > 0.0) {
        return (f64::NAN, f64::NAN);
    }
    let tail = |x: f64| distribution.upper_tail(x);

    match alternative {
        AltHypothesis::GreaterAbs => {
            let z = (lfc.abs() - threshold) / se;
            let stat = lfc.signum() * z.max(0.0);
            (stat, (2.0 * tail(z)).min(1.0))
        }
        AltHypothesis::LessAbs => {
            let above = ((threshold - lfc) / se).max(0.0);
            let below = ((lfc + threshold) / se).max(0.0);
            (above.min(below), tail(above).max(tail(below)))
        }
        AltHypothesis::Greater => {
            let z = (lfc - threshold) / se;
            (z.max(0.0), tail(z))
        }
        AltHypothesis::Less => {
            let z = (lfc + threshold) / se;
            (z.min(0.0), tail((-threshold - lfc) / se))
        }
    }
}

/// Test contrast `weights` on every gene, in gene order
///
/// Unfitted genes get NaN throughout.
pub fn wald_test(
    fits: &[GeneFit],
    weights: &[f64],
    threshold: f64,
    alternative: AltHypothesis,
    distribution: WaldDistribution,
) -> Vec<WaldOutcome> {
    fits.iter()
        .map(|fit| {
            if !fit.is_fitted() {
                return WaldOutcome::missing();
            }
            let (estimate, se) = fit.contrast(weights);
            let lfc = estimate / LN_2;
            let lfc_se = se / LN_2;
            let (stat, pvalue) = wald_statistic(lfc, lfc_se, threshold, alternative, distribution);
            WaldOutcome {
                log2_fold_change: lfc,
                lfc_se,
                stat,
                pvalue,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    const N: WaldDistribution = WaldDistribution::Normal;

    fn fit(beta: f64, se: f64) -> GeneFit {
        GeneFit {
            coefficients: vec![1.0, beta],
            standard_errors: vec![0.1, se],
            covariance: vec![0.01, 0.0, 0.0, se * se],
            n_coefs: 2,
            converged: true,
            iterations: 3,
            mu: vec![1.0; 4],
            hat_diagonals: vec![0.5; 4],
            deviance: 1.0,
        }
    }

    #[test]
    fn test_plain_two_sided() {
        let (stat, p) = wald_statistic(2.0, 1.0, 0.0, AltHypothesis::GreaterAbs, N);
        assert_abs_diff_eq!(stat, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p, 0.0455, epsilon = 1e-4);
        let (stat, _) = wald_statistic(-2.0, 1.0, 0.0, AltHypothesis::GreaterAbs, N);
        assert_abs_diff_eq!(stat, -2.0, epsilon = 1e-12);
    }

    #[test]
    fn test_greater_abs_threshold() {
        let (stat, p) = wald_statistic(0.5, 0.2, 1.0, AltHypothesis::GreaterAbs, N);
        assert_eq!(stat, 0.0);
        assert_eq!(p, 1.0);
        let (stat, _) = wald_statistic(-1.6, 0.2, 1.0, AltHypothesis::GreaterAbs, N);
        assert_abs_diff_eq!(stat, -3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_less_abs() {
        // well inside the band
        let (stat, p) = wald_statistic(0.0, 0.1, 1.0, AltHypothesis::LessAbs, N);
        assert_abs_diff_eq!(stat, 10.0, epsilon = 1e-12);
        assert!(p < 1e-10);
        // outside the band
        let (stat, p) = wald_statistic(2.0, 0.1, 1.0, AltHypothesis::LessAbs, N);
        assert_eq!(stat, 0.0);
        assert_abs_diff_eq!(p, 0.5, epsilon = 1e-12);
    }

    #[test]
    fn test_one_sided() {
        let (stat, p) = wald_statistic(1.5, 0.25, 1.0, AltHypothesis::Greater, N);
        assert_abs_diff_eq!(stat, 2.0, epsilon = 1e-12);
        assert_abs_diff_eq!(p, 0.02275, epsilon = 1e-5);
        let (stat, p) = wald_statistic(1.5, 0.25, 1.0, AltHypothesis::Less, N);
        assert_eq!(stat, 0.0);
        assert!(p > 0.99);
    }

    #[test]
    fn test_wald_test_scales_to_log2() {
        let fits = vec![fit(LN_2, 0.5 * LN_2), GeneFit::unfitted(4, 2)];
        let out = wald_test(&fits, &[0.0, 1.0], 0.0, AltHypothesis::GreaterAbs, N);
        assert_abs_diff_eq!(out[0].log2_fold_change, 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(out[0].lfc_se, 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(out[0].stat, 2.0, epsilon = 1e-12);
        assert!(out[1].pvalue.is_nan());
    }
}
