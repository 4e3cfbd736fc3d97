//! Benjamini-Hochberg adjustment

use std::cmp::Ordering;

/// BH-adjusted p-values; NaN inputs stay NaN and are not counted as tests
pub fn benjamini_hochberg(pvalues: &[f64]) -> Vec<f64> {
    let mut order: Vec<usize> = (0..pvalues.len()).filter(|&i| pvalues[i].is_finite()).collect();
    let m = order.len();
    let mut padj = vec![f64::NAN; pvalues.len()];
    if m == 0 {
        return padj;
    }

    order.sort_by(|&a, &b| pvalues[a].partial_cmp(&pvalues[b]).unwrap_or(Ordering::Equal));

    // running minimum from the largest p-value down
    let mut running = 1.0_f64;
    for (rank, &i) in order.iter().enumerate().rev() {
        let adjusted = pvalues[i] * m as f64 / (rank + 1) as f64;
        running = running.min(adjusted);
        padj[i] = running;
    }
    padj
}

/// Number of finite adjusted p-values below `alpha`
pub fn count_rejections(padj: &[f64], alpha: f64) -> usize {
    padj.iter().filter(|&&p| p.is_finite() && p < alpha).count()
}
