//! Size factor estimation by the median of ratios

use ndarray::{Array1, Array2, ArrayView2, Axis};

use crate::config::SizeFactorMethod;
use crate::error::{NbseqError, Result};
use crate::stats::median;

/// Estimate one scale factor per sample
///
/// Every sample must end up with a positive finite factor. A sample whose
/// ratios are all undefined (for instance an all-zero library) aborts the run
/// instead of being silently set to 1.
pub fn estimate_size_factors(counts: ArrayView2<f64>, method: SizeFactorMethod) -> Result<Array1<f64>> {
    let (n_genes, n_samples) = counts.dim();
    if n_genes == 0 || n_samples == 0 {
        return Err(NbseqError::EmptyData {
            reason: "count matrix is empty".to_string(),
        });
    }

    let size_factors = match method {
        SizeFactorMethod::Ratio => median_of_ratios(counts)?,
        SizeFactorMethod::PosCounts => positive_counts_ratios(counts)?,
    };

    check_size_factors(&size_factors)?;
    log::info!(
        "Size factors: {}",
        size_factors
            .iter()
            .map(|s| format!("{:.4}", s))
            .collect::<Vec<_>>()
            .join(", ")
    );
    Ok(size_factors)
}

/// Validate externally supplied or estimated size factors
pub fn check_size_factors(size_factors: &Array1<f64>) -> Result<()> {
    for (j, &s) in size_factors.iter().enumerate() {
        if !(s.is_finite() && s > 0.0) {
            return Err(NbseqError::SizeFactorFailed {
                reason: format!(
                    "size factor for sample {} is {}; the sample has no usable counts",
                    j + 1,
                    s
                ),
            });
        }
    }
    Ok(())
}

/// Median over genes without zeros of count / geometric mean
fn median_of_ratios(counts: ArrayView2<f64>) -> Result<Array1<f64>> {
    let n_samples = counts.ncols();

    // log geometric mean is -inf for any gene with a zero
    let log_geo_means: Vec<f64> = counts
        .axis_iter(Axis(0))
        .map(|row| row.iter().map(|&x| x.ln()).sum::<f64>() / n_samples as f64)
        .collect();

    let usable = log_geo_means.iter().filter(|g| g.is_finite()).count();
    if usable == 0 {
        return Err(NbseqError::SizeFactorFailed {
            reason: "every gene contains at least one zero; try the poscounts method".to_string(),
        });
    }
    log::debug!("Median of ratios over {} genes without zeros", usable);

    let sf = (0..n_samples)
        .map(|j| {
            let ratios: Vec<f64> = counts
                .column(j)
                .iter()
                .zip(log_geo_means.iter())
                .filter(|(&c, lg)| lg.is_finite() && c > 0.0)
                .map(|(&c, &lg)| (c.ln() - lg).exp())
                .collect();
            median(&ratios)
        })
        .collect();
    Ok(Array1::from_vec(sf))
}

/// Geometric means over positive counts, rescaled to geometric mean 1
fn positive_counts_ratios(counts: ArrayView2<f64>) -> Result<Array1<f64>> {
    let n_samples = counts.ncols();

    let log_geo_means: Vec<f64> = counts
        .axis_iter(Axis(0))
        .map(|row| {
            if row.iter().all(|&x| x <= 0.0) {
                return f64::NAN;
            }
            let log_sum: f64 = row.iter().filter(|&&x| x > 0.0).map(|&x| x.ln()).sum();
            log_sum / n_samples as f64
        })
        .collect();

    let mut sf: Vec<f64> = (0..n_samples)
        .map(|j| {
            let ratios: Vec<f64> = counts
                .column(j)
                .iter()
                .zip(log_geo_means.iter())
                .filter(|(&c, &lg)| c > 0.0 && lg.is_finite())
                .map(|(&c, &lg)| (c.ln() - lg).exp())
                .collect();
            median(&ratios)
        })
        .collect();

    if sf.iter().any(|s| !(s.is_finite() && *s > 0.0)) {
        return Err(NbseqError::SizeFactorFailed {
            reason: "a sample has no positive counts among informative genes".to_string(),
        });
    }

    let log_center = sf.iter().map(|s| s.ln()).sum::<f64>() / n_samples as f64;
    for s in sf.iter_mut() {
        *s /= log_center.exp();
    }
    Ok(Array1::from_vec(sf))
}

/// Divide each column by its size factor
pub fn normalized_counts(counts: ArrayView2<f64>, size_factors: &Array1<f64>) -> Array2<f64> {
    let mut normalized = counts.to_owned();
    for (mut col, &s) in normalized.axis_iter_mut(Axis(1)).zip(size_factors.iter()) {
        col.mapv_inplace(|x| x / s);
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn test_proportional_columns_recover_scalars() {
        let reference = [10.0, 50.0, 7.0, 300.0, 22.0];
        let scalars = [1.0, 2.0, 0.5, 4.0];
        let counts = Array2::from_shape_fn((5, 4), |(i, j)| reference[i] * scalars[j] * 2.0);

        let sf = estimate_size_factors(counts.view(), SizeFactorMethod::Ratio).unwrap();

        let geo_mean = (sf.iter().map(|s| s.ln()).sum::<f64>() / 4.0).exp();
        assert_abs_diff_eq!(geo_mean, 1.0, epsilon = 1e-10);
        for j in 1..4 {
            assert_abs_diff_eq!(sf[j] / sf[0], scalars[j] / scalars[0], epsilon = 1e-10);
        }
    }

    #[test]
    fn test_genes_with_zeros_are_ignored() {
        let counts = array![
            [100.0, 200.0, 100.0, 200.0],
            [50.0, 100.0, 50.0, 100.0],
            [0.0, 999.0, 3.0, 1.0],
        ];
        let sf = estimate_size_factors(counts.view(), SizeFactorMethod::Ratio).unwrap();
        assert_abs_diff_eq!(sf[1] / sf[0], 2.0, epsilon = 1e-10);
        assert_abs_diff_eq!(sf[2], sf[0], epsilon = 1e-10);
    }

    #[test]
    fn test_all_zero_sample_is_fatal() {
        // no gene is free of zeros, so no ratio is defined for any sample
        let counts = array![[10.0, 0.0, 12.0], [20.0, 0.0, 25.0]];
        let err = estimate_size_factors(counts.view(), SizeFactorMethod::Ratio).unwrap_err();
        assert!(matches!(err, NbseqError::SizeFactorFailed { .. }));

        let err = estimate_size_factors(counts.view(), SizeFactorMethod::PosCounts).unwrap_err();
        assert!(matches!(err, NbseqError::SizeFactorFailed { .. }));
    }

    #[test]
    fn test_poscounts_handles_sparse_genes() {
        let counts = array![
            [10.0, 20.0, 0.0, 40.0],
            [5.0, 0.0, 15.0, 20.0],
            [8.0, 16.0, 24.0, 0.0],
        ];
        assert!(estimate_size_factors(counts.view(), SizeFactorMethod::Ratio).is_err());
        let sf = estimate_size_factors(counts.view(), SizeFactorMethod::PosCounts).unwrap();
        let geo_mean = (sf.iter().map(|s| s.ln()).sum::<f64>() / 4.0).exp();
        assert_abs_diff_eq!(geo_mean, 1.0, epsilon = 1e-10);
        assert!(sf.iter().all(|&s| s > 0.0));
    }

    #[test]
    fn test_poscounts_keeps_genes_of_ones() {
        // sample 3 is supported only by the gene whose counts are all 1
        let counts = array![
            [1.0, 1.0, 1.0, 1.0],
            [5.0, 10.0, 0.0, 20.0],
            [3.0, 0.0, 0.0, 6.0],
            [0.0, 0.0, 0.0, 0.0],
        ];
        let sf = estimate_size_factors(counts.view(), SizeFactorMethod::PosCounts).unwrap();
        assert!(sf.iter().all(|&s| s.is_finite() && s > 0.0));
        let geo_mean = (sf.iter().map(|s| s.ln()).sum::<f64>() / 4.0).exp();
        assert_abs_diff_eq!(geo_mean, 1.0, epsilon = 1e-10);
        assert!(sf[3] > sf[0]);
    }

    #[test]
    fn test_check_rejects_nonpositive() {
        assert!(check_size_factors(&array![1.0, 0.0]).is_err());
        assert!(check_size_factors(&array![1.0, f64::NAN]).is_err());
        assert!(check_size_factors(&array![0.5, 2.0]).is_ok());
    }

    #[test]
    fn test_normalized_counts() {
        let counts = array![[10.0, 40.0], [4.0, 8.0]];
        let normalized = normalized_counts(counts.view(), &array![1.0, 4.0]);
        assert_eq!(normalized, array![[10.0, 10.0], [4.0, 2.0]]);
    }
}
