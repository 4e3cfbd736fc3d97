//! Error types for nbseq

use thiserror::Error;

/// Main error type for the analysis pipeline
///
/// Every variant here is fatal for a run. Per-gene problems (non-convergence,
/// outliers) never surface as errors; they are recorded in the results table.
#[derive(Error, Debug)]
pub enum NbseqError {
    #[error("Invalid count matrix: {reason}")]
    InvalidCountMatrix { reason: String },

    #[error("Invalid metadata: {reason}")]
    InvalidMetadata { reason: String },

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: String, got: String },

    #[error("Invalid design: {reason}")]
    InvalidDesign { reason: String },

    #[error("Invalid contrast specification: {reason}")]
    InvalidContrast { reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("Size factor estimation failed: {reason}")]
    SizeFactorFailed { reason: String },

    #[error("Trend fitting failed: {reason}")]
    TrendFittingFailed { reason: String },

    #[error("Pipeline stage out of order: {reason}")]
    MissingStage { reason: String },

    #[error("Empty data: {reason}")]
    EmptyData { reason: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),
}

/// Result type alias for nbseq operations
pub type Result<T> = std::result::Result<T, NbseqError>;
