//! nbseq: negative binomial differential expression for RNA-seq counts
//!
//! The analysis runs as explicit stages over an immutable count matrix:
//! size factors, dispersions (gene-wise, trend, empirical Bayes shrinkage),
//! per-gene GLM fits, then Wald testing with independent filtering and
//! Cook's distance outlier calls. A variance stabilizing transform reuses
//! the fitted dispersion trend.
//!
//! # Example
//!
//! ```ignore
//! use nbseq::prelude::*;
//!
//! let counts = read_count_matrix("counts.tsv")?;
//! let metadata = read_metadata("samples.tsv", &[])?;
//! let design = DesignSpec::parse("~ batch + condition")?;
//!
//! let state = AnalysisState::new(counts, metadata, &design, AnalysisConfig::default())?.run()?;
//! let results = state.results(&Contrast::Default)?;
//! write_results("results.tsv", &results)?;
//! ```

pub mod cli;
pub mod config;
pub mod data;
pub mod dispersion;
pub mod error;
pub mod filter;
pub mod glm;
pub mod io;
pub mod normalization;
pub mod pipeline;
pub mod shrinkage;
pub mod stats;
pub mod testing;
pub mod transform;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{AltHypothesis, AnalysisConfig, FitType, ReferencePolicy, SizeFactorMethod};
    pub use crate::data::{CountMatrix, SampleMetadata};
    pub use crate::dispersion::{estimate_dispersions, DispersionEstimates, DispersionParams, DispersionTrend};
    pub use crate::error::{NbseqError, Result};
    pub use crate::glm::{fit_genes, Contrast, DesignMatrix, DesignSpec, GeneFit, GlmFitParams};
    pub use crate::io::{
        read_count_matrix, read_metadata, write_json, write_matrix, write_results, AnalysisSummary, GeneResult,
        GeneStatus, ResultsSummary, ResultsTable, SortKey,
    };
    pub use crate::normalization::{estimate_size_factors, normalized_counts};
    pub use crate::pipeline::AnalysisState;
    pub use crate::transform::vst;
}
