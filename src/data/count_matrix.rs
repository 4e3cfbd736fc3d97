//! Count matrix representation for RNA-seq data

use std::collections::HashSet;

use ndarray::{Array2, ArrayView2, Axis};

use crate::error::{NbseqError, Result};

/// Raw read counts, genes in rows and samples in columns
///
/// Counts are held as `f64` for arithmetic convenience, but construction
/// guarantees every entry is a finite non-negative integer. The matrix is
/// never mutated after construction.
#[derive(Debug, Clone)]
pub struct CountMatrix {
    counts: Array2<f64>,
    gene_ids: Vec<String>,
    sample_ids: Vec<String>,
}

fn first_duplicate(ids: &[String]) -> Option<&str> {
    let mut seen = HashSet::with_capacity(ids.len());
    ids.iter().find(|id| !seen.insert(id.as_str())).map(|s| s.as_str())
}

impl CountMatrix {
    /// Create a count matrix, validating shape, identifiers and values
    pub fn new(counts: Array2<f64>, gene_ids: Vec<String>, sample_ids: Vec<String>) -> Result<Self> {
        let (n_genes, n_samples) = counts.dim();

        if gene_ids.len() != n_genes {
            return Err(NbseqError::DimensionMismatch {
                expected: format!("{} gene IDs", n_genes),
                got: format!("{} gene IDs", gene_ids.len()),
            });
        }
        if sample_ids.len() != n_samples {
            return Err(NbseqError::DimensionMismatch {
                expected: format!("{} sample IDs", n_samples),
                got: format!("{} sample IDs", sample_ids.len()),
            });
        }
        if n_genes == 0 || n_samples == 0 {
            return Err(NbseqError::EmptyData {
                reason: format!("count matrix is {} x {}", n_genes, n_samples),
            });
        }

        if let Some(dup) = first_duplicate(&gene_ids) {
            return Err(NbseqError::InvalidCountMatrix {
                reason: format!("duplicate gene identifier '{}'", dup),
            });
        }
        if let Some(dup) = first_duplicate(&sample_ids) {
            return Err(NbseqError::InvalidCountMatrix {
                reason: format!("duplicate sample identifier '{}'", dup),
            });
        }

        for ((i, j), &x) in counts.indexed_iter() {
            if !x.is_finite() || x < 0.0 {
                return Err(NbseqError::InvalidCountMatrix {
                    reason: format!(
                        "count for gene '{}' in sample '{}' is {}, counts must be non-negative",
                        gene_ids[i], sample_ids[j], x
                    ),
                });
            }
            if x.fract() != 0.0 {
                return Err(NbseqError::InvalidCountMatrix {
                    reason: format!(
                        "count for gene '{}' in sample '{}' is {}, counts must be integers",
                        gene_ids[i], sample_ids[j], x
                    ),
                });
            }
        }

        if counts.iter().all(|&x| x == 0.0) {
            return Err(NbseqError::InvalidCountMatrix {
                reason: "all samples have zero counts for all genes".to_string(),
            });
        }

        Ok(Self {
            counts,
            gene_ids,
            sample_ids,
        })
    }

    /// Create from unsigned integer counts
    pub fn from_integers(counts: Array2<u64>, gene_ids: Vec<String>, sample_ids: Vec<String>) -> Result<Self> {
        Self::new(counts.mapv(|x| x as f64), gene_ids, sample_ids)
    }

    pub fn n_genes(&self) -> usize {
        self.counts.nrows()
    }

    pub fn n_samples(&self) -> usize {
        self.counts.ncols()
    }

    pub fn counts(&self) -> ArrayView2<'_, f64> {
        self.counts.view()
    }

    pub fn gene_ids(&self) -> &[String] {
        &self.gene_ids
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn gene_index(&self, gene_id: &str) -> Option<usize> {
        self.gene_ids.iter().position(|id| id == gene_id)
    }

    /// Column sums
    pub fn library_sizes(&self) -> Vec<f64> {
        self.counts.axis_iter(Axis(1)).map(|col| col.sum()).collect()
    }

    /// Whether every count of a gene is zero
    pub fn all_zero_genes(&self) -> Vec<bool> {
        self.counts
            .axis_iter(Axis(0))
            .map(|row| row.iter().all(|&x| x == 0.0))
            .collect()
    }
}
