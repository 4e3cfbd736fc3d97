//! Normalization of RNA-seq count data by per-sample size factors

mod size_factors;

pub use size_factors::{check_size_factors, estimate_size_factors, normalized_counts};
