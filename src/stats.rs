//! Statistical helpers shared across modules
//!
//! Order statistics (median, MAD, type-7 quantiles), the trigamma function,
//! and the weighted upper quantile used to size the fold-change prior.

use std::cmp::Ordering;

/// 97.5th percentile of the standard normal
const QNORM_0975: f64 = 1.959963984540054;

/// Consistency constant making the MAD an estimate of the normal SD
const MAD_SCALE: f64 = 1.4826;

fn sort_finite(values: &[f64]) -> Vec<f64> {
    let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    sorted
}

/// Median of the finite values, averaging the two middle values for even counts.
/// Returns NaN when no finite value is present.
pub fn median(values: &[f64]) -> f64 {
    median_of_sorted(&sort_finite(values))
}

fn median_of_sorted(sorted: &[f64]) -> f64 {
    let n = sorted.len();
    if n == 0 {
        f64::NAN
    } else if n % 2 == 0 {
        (sorted[n / 2 - 1] + sorted[n / 2]) / 2.0
    } else {
        sorted[n / 2]
    }
}

/// Scaled median absolute deviation, squared
pub fn mad_squared(values: &[f64]) -> f64 {
    let sorted = sort_finite(values);
    if sorted.is_empty() {
        return f64::NAN;
    }
    let center = median_of_sorted(&sorted);
    let deviations: Vec<f64> = sorted.iter().map(|&x| (x - center).abs()).collect();
    let mad = median(&deviations) * MAD_SCALE;
    mad * mad
}

/// Quantile with linear interpolation between order statistics (type 7).
/// `sorted` must be ascending.
pub fn quantile_sorted(sorted: &[f64], p: f64) -> f64 {
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    if n == 1 {
        return sorted[0];
    }
    let h = (n as f64 - 1.0) * p.clamp(0.0, 1.0);
    let lo = h.floor() as usize;
    let hi = (h.ceil() as usize).min(n - 1);
    sorted[lo] + (h - lo as f64) * (sorted[hi] - sorted[lo])
}

/// Mean after dropping `trim` of the observations at each end
pub fn trimmed_mean(values: &[f64], trim: f64) -> f64 {
    let sorted = sort_finite(values);
    let n = sorted.len();
    if n == 0 {
        return f64::NAN;
    }
    let k = ((n as f64) * trim).floor() as usize;
    let kept = if 2 * k < n { &sorted[k..n - k] } else { &sorted[..] };
    kept.iter().sum::<f64>() / kept.len() as f64
}

/// Trigamma function, the derivative of digamma
pub fn trigamma(x: f64) -> f64 {
    if x < 0.5 {
        let pi = std::f64::consts::PI;
        return (pi / (pi * x).sin()).powi(2) - trigamma(1.0 - x);
    }

    // shift up by recurrence, then use the asymptotic series
    let mut acc = 0.0;
    let mut z = x;
    while z < 8.0 {
        acc += 1.0 / (z * z);
        z += 1.0;
    }
    let z2 = z * z;
    acc + 1.0 / z + 0.5 / z2 + 1.0 / (6.0 * z2 * z) - 1.0 / (30.0 * z2 * z2 * z)
        + 1.0 / (42.0 * z2 * z2 * z2 * z)
}

/// Weighted quantile over normalized weights
///
/// Duplicate values pool their weights. With weights rescaled to sum to the
/// number of observations, the quantile position `1 + (n - 1) * prob` is read
/// off the cumulative weights by right-continuous step interpolation, and the
/// two neighbouring positions are blended linearly.
pub fn weighted_quantile(x: &[f64], weights: &[f64], prob: f64) -> f64 {
    let mut pairs: Vec<(f64, f64)> = x
        .iter()
        .zip(weights.iter())
        .filter(|(xi, wi)| xi.is_finite() && wi.is_finite() && **wi > 0.0)
        .map(|(&xi, &wi)| (xi, wi))
        .collect();
    if pairs.is_empty() {
        return f64::NAN;
    }
    pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));

    let scale = pairs.len() as f64 / pairs.iter().map(|p| p.1).sum::<f64>();

    let mut values: Vec<f64> = Vec::new();
    let mut cumulative: Vec<f64> = Vec::new();
    let mut running = 0.0;
    for &(xi, wi) in &pairs {
        running += wi * scale;
        if values.last() == Some(&xi) {
            if let Some(last) = cumulative.last_mut() {
                *last = running;
            }
        } else {
            values.push(xi);
            cumulative.push(running);
        }
    }

    let total = running;
    let order = 1.0 + (total - 1.0) * prob;
    let low = order.floor().max(1.0);
    let high = (low + 1.0).min(total);
    let frac = order - order.floor();

    let step = |target: f64| -> f64 {
        let idx = cumulative.partition_point(|&c| c < target);
        values[idx.min(values.len() - 1)]
    };

    (1.0 - frac) * step(low) + frac * step(high)
}

/// Variance of a zero-centered normal whose `1 - upper_quantile` two-sided
/// quantile matches the weighted quantile of `|x|`
pub fn match_weighted_upper_quantile_for_variance(x: &[f64], weights: &[f64], upper_quantile: f64) -> f64 {
    let abs_x: Vec<f64> = x.iter().map(|v| v.abs()).collect();
    let q = weighted_quantile(&abs_x, weights, 1.0 - upper_quantile);
    let sd = q / QNORM_0975;
    let var = sd * sd;
    if var.is_finite() && var > 0.0 {
        var
    } else {
        1e-6
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_median_even_odd() {
        assert_eq!(median(&[3.0, 1.0, 2.0]), 2.0);
        assert_eq!(median(&[4.0, 1.0, 3.0, 2.0]), 2.5);
        assert_eq!(median(&[f64::NAN, 5.0, f64::INFINITY, 1.0]), 3.0);
        assert!(median(&[]).is_nan());
    }

    #[test]
    fn test_mad_squared_normal_scale() {
        // deviations from median 3 are 2,1,0,1,2 -> MAD = 1 * 1.4826
        let v = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_abs_diff_eq!(mad_squared(&v), 1.4826 * 1.4826, epsilon = 1e-12);
    }

    #[test]
    fn test_quantile_sorted_interpolates() {
        let v = [10.0, 20.0, 30.0, 40.0, 50.0];
        assert_eq!(quantile_sorted(&v, 0.0), 10.0);
        assert_eq!(quantile_sorted(&v, 1.0), 50.0);
        assert_abs_diff_eq!(quantile_sorted(&v, 0.3), 22.0, epsilon = 1e-12);
    }

    #[test]
    fn test_trimmed_mean() {
        let v = [1.0, 2.0, 3.0, 4.0, 100.0];
        assert_abs_diff_eq!(trimmed_mean(&v, 0.2), 3.0, epsilon = 1e-12);
        assert_abs_diff_eq!(trimmed_mean(&v, 0.0), 22.0, epsilon = 1e-12);
    }

    #[test]
    fn test_trigamma_known_values() {
        let pi2_6 = std::f64::consts::PI.powi(2) / 6.0;
        assert_abs_diff_eq!(trigamma(1.0), pi2_6, epsilon = 1e-9);
        assert_abs_diff_eq!(trigamma(0.5), std::f64::consts::PI.powi(2) / 2.0, epsilon = 1e-9);
        // recurrence: trigamma(x + 1) = trigamma(x) - 1 / x^2
        assert_abs_diff_eq!(trigamma(3.7), trigamma(2.7) - 1.0 / (2.7 * 2.7), epsilon = 1e-10);
    }

    #[test]
    fn test_weighted_quantile_uniform_weights() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let w = [1.0; 5];
        assert_abs_diff_eq!(weighted_quantile(&x, &w, 0.5), 3.0, epsilon = 1e-12);
    }

    #[test]
    fn test_weighted_quantile_heavy_tail_weight() {
        let x = [1.0, 2.0, 3.0, 4.0, 5.0];
        let w = [1.0, 1.0, 1.0, 1.0, 100.0];
        assert!(weighted_quantile(&x, &w, 0.5) >= 4.0);
    }

    #[test]
    fn test_upper_quantile_variance_positive() {
        let x = [0.1, -0.2, 0.3, -0.1, 0.5, -0.3, 0.2, -0.4, 0.15, -0.25];
        let var = match_weighted_upper_quantile_for_variance(&x, &[1.0; 10], 0.05);
        assert!(var > 0.0 && var.is_finite());
        // the 95% quantile of |x| is at most 0.5, so sd <= 0.5 / 1.96
        assert!(var <= (0.5f64 / 1.959963984540054).powi(2) + 1e-12);
    }
}
