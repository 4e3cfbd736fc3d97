//! Per-gene results table

use std::cmp::Ordering;
use std::fmt;

use serde::Serialize;

/// Recoverable per-gene conditions recorded alongside the statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GeneStatus {
    pub all_zero: bool,
    /// Gene-wise dispersion did not converge; the trend value was used
    pub dispersion_not_converged: bool,
    /// Gene-wise dispersion kept because it lies far above the trend
    pub dispersion_outlier: bool,
    /// Estimates kept but unreliable
    pub glm_not_converged: bool,
    /// p-value withheld because one sample dominates the fit
    pub cooks_outlier: bool,
    /// Removed by independent filtering, padj withheld
    pub filtered: bool,
}

impl GeneStatus {
    pub fn flags(&self) -> Vec<&'static str> {
        [
            (self.all_zero, "all_zero"),
            (self.dispersion_not_converged, "dispersion_not_converged"),
            (self.dispersion_outlier, "dispersion_outlier"),
            (self.glm_not_converged, "glm_not_converged"),
            (self.cooks_outlier, "cooks_outlier"),
            (self.filtered, "filtered"),
        ]
        .iter()
        .filter(|(set, _)| *set)
        .map(|(_, name)| *name)
        .collect()
    }

    pub fn is_clean(&self) -> bool {
        *self == GeneStatus::default()
    }
}

impl fmt::Display for GeneStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_clean() {
            write!(f, "ok")
        } else {
            write!(f, "{}", self.flags().join(","))
        }
    }
}

/// One row of the results table; NaN marks a missing value
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GeneResult {
    pub gene_id: String,
    pub base_mean: f64,
    pub base_var: f64,
    pub log2_fold_change: f64,
    pub lfc_se: f64,
    pub stat: f64,
    pub pvalue: f64,
    pub padj: f64,
    pub dispersion: f64,
    pub gene_wise_dispersion: f64,
    pub trended_dispersion: f64,
    pub max_cooks: f64,
    pub status: GeneStatus,
}

impl GeneResult {
    pub fn is_significant(&self, alpha: f64) -> bool {
        self.padj.is_finite() && self.padj < alpha
    }
}

/// Orderings offered by [`ResultsTable::sorted_by`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortKey {
    /// Ascending, missing values last
    Padj,
    GeneId,
    /// Descending |log2 fold change|, missing values last
    EffectSize,
}

/// Missing values sort after every finite value
fn cmp_missing_last(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Greater,
        (false, true) => Ordering::Less,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

/// Results of one contrast, rows in input gene order
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultsTable {
    contrast: String,
    alpha: f64,
    rows: Vec<GeneResult>,
}

impl ResultsTable {
    pub fn new(contrast: String, alpha: f64, rows: Vec<GeneResult>) -> Self {
        Self { contrast, alpha, rows }
    }

    pub fn contrast(&self) -> &str {
        &self.contrast
    }

    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    pub fn rows(&self) -> &[GeneResult] {
        &self.rows
    }

    pub fn n_genes(&self) -> usize {
        self.rows.len()
    }

    pub fn get(&self, gene_id: &str) -> Option<&GeneResult> {
        self.rows.iter().find(|r| r.gene_id == gene_id)
    }

    /// Rows with padj below `alpha`
    pub fn significant(&self, alpha: f64) -> Vec<&GeneResult> {
        self.rows.iter().filter(|r| r.is_significant(alpha)).collect()
    }

    /// Rows reordered by `key`; ties keep input order
    pub fn sorted_by(&self, key: SortKey) -> Vec<&GeneResult> {
        let mut rows: Vec<&GeneResult> = self.rows.iter().collect();
        match key {
            SortKey::Padj => rows.sort_by(|a, b| cmp_missing_last(a.padj, b.padj)),
            SortKey::GeneId => rows.sort_by(|a, b| a.gene_id.cmp(&b.gene_id)),
            SortKey::EffectSize => rows.sort_by(|a, b| {
                cmp_missing_last(-a.log2_fold_change.abs(), -b.log2_fold_change.abs())
            }),
        }
        rows
    }

    pub fn summary(&self) -> ResultsSummary {
        let significant = self.significant(self.alpha);
        let count = |f: fn(&GeneStatus) -> bool| self.rows.iter().filter(|r| f(&r.status)).count();
        ResultsSummary {
            contrast: self.contrast.clone(),
            alpha: self.alpha,
            total_genes: self.rows.len(),
            genes_tested: self.rows.iter().filter(|r| r.pvalue.is_finite()).count(),
            significant: significant.len(),
            upregulated: significant.iter().filter(|r| r.log2_fold_change > 0.0).count(),
            downregulated: significant.iter().filter(|r| r.log2_fold_change < 0.0).count(),
            all_zero: count(|s| s.all_zero),
            cooks_outliers: count(|s| s.cooks_outlier),
            filtered: count(|s| s.filtered),
            dispersion_not_converged: count(|s| s.dispersion_not_converged),
            glm_not_converged: count(|s| s.glm_not_converged),
        }
    }
}

/// Aggregate counts over a results table
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResultsSummary {
    pub contrast: String,
    pub alpha: f64,
    pub total_genes: usize,
    pub genes_tested: usize,
    pub significant: usize,
    pub upregulated: usize,
    pub downregulated: usize,
    pub all_zero: usize,
    pub cooks_outliers: usize,
    pub filtered: usize,
    pub dispersion_not_converged: usize,
    pub glm_not_converged: usize,
}

impl fmt::Display for ResultsSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Contrast: {}", self.contrast)?;
        writeln!(f, "Genes: {} ({} tested)", self.total_genes, self.genes_tested)?;
        writeln!(f, "Significant (padj < {}): {}", self.alpha, self.significant)?;
        writeln!(f, "  up:   {}", self.upregulated)?;
        writeln!(f, "  down: {}", self.downregulated)?;
        writeln!(f, "All zero: {}", self.all_zero)?;
        writeln!(f, "Cook's outliers: {}", self.cooks_outliers)?;
        writeln!(f, "Low mean (filtered): {}", self.filtered)?;
        if self.dispersion_not_converged + self.glm_not_converged > 0 {
            writeln!(
                f,
                "Not converged: {} dispersion, {} GLM",
                self.dispersion_not_converged, self.glm_not_converged
            )?;
        }
        Ok(())
    }
}
