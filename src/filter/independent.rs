//! Independent filtering on the mean of normalized counts
//!
//! Genes with low base mean have little power. Removing them before the BH
//! adjustment lightens the multiple-testing burden; the cutoff is the base
//! mean quantile that maximizes the number of rejections at `alpha`.

use std::cmp::Ordering;

use crate::stats::quantile_sorted;
use crate::testing::{benjamini_hochberg, count_rejections};

/// Number of candidate quantiles
const N_THETA: usize = 50;

/// Outcome of the filter search
#[derive(Debug, Clone)]
pub struct FilterResult {
    /// Adjusted p-values, NaN for filtered genes
    pub padj: Vec<f64>,
    /// Genes removed by the chosen cutoff
    pub filtered: Vec<bool>,
    pub theta: f64,
    pub cutoff: f64,
    pub rejections: usize,
}

/// BH adjustment without filtering
pub fn unfiltered(pvalues: &[f64], alpha: f64) -> FilterResult {
    let padj = benjamini_hochberg(pvalues);
    let rejections = count_rejections(&padj, alpha);
    FilterResult {
        padj,
        filtered: vec![false; pvalues.len()],
        theta: 0.0,
        cutoff: 0.0,
        rejections,
    }
}

/// Choose the base-mean quantile with the most rejections, ties going to the
/// smallest quantile; without any rejection no gene is filtered
pub fn independent_filtering(base_means: &[f64], pvalues: &[f64], alpha: f64) -> FilterResult {
    let n = base_means.len();
    let mut sorted: Vec<f64> = base_means.iter().copied().filter(|m| m.is_finite()).collect();
    if n == 0 || sorted.is_empty() {
        return unfiltered(pvalues, alpha);
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));

    let lower = base_means.iter().filter(|&&m| m == 0.0).count() as f64 / n as f64;
    let upper = if lower < 0.95 { 0.95 } else { 1.0 };

    let mut best: Option<FilterResult> = None;
    for k in 0..N_THETA {
        let theta = lower + (upper - lower) * k as f64 / (N_THETA - 1) as f64;
        let cutoff = quantile_sorted(&sorted, theta);
        let filtered: Vec<bool> = base_means.iter().map(|&m| !(m >= cutoff)).collect();
        let kept: Vec<f64> = pvalues
            .iter()
            .zip(filtered.iter())
            .map(|(&p, &f)| if f { f64::NAN } else { p })
            .collect();
        let padj = benjamini_hochberg(&kept);
        let rejections = count_rejections(&padj, alpha);
        log::debug!("theta={:.3} cutoff={:.3} rejections={}", theta, cutoff, rejections);

        if best.as_ref().map_or(true, |b| rejections > b.rejections) {
            best = Some(FilterResult {
                padj,
                filtered,
                theta,
                cutoff,
                rejections,
            });
        }
    }

    match best {
        Some(result) if result.rejections > 0 => {
            log::info!(
                "Independent filtering: cutoff {:.3} (quantile {:.3}) removes {} genes, {} rejections at {}",
                result.cutoff,
                result.theta,
                result.filtered.iter().filter(|&&f| f).count(),
                result.rejections,
                alpha
            );
            result
        }
        _ => {
            log::info!("Independent filtering: no rejections at any cutoff, no genes filtered");
            unfiltered(pvalues, alpha)
        }
    }
}
