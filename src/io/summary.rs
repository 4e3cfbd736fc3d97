//! Run-level summary written next to the results table

use serde::Serialize;

use super::results::ResultsSummary;
use crate::dispersion::DispersionTrend;

/// Sample and dispersion-stage quantities of one run
#[derive(Debug, Clone, Serialize)]
pub struct AnalysisSummary {
    pub n_genes: usize,
    pub sample_ids: Vec<String>,
    pub size_factors: Vec<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trend: Option<DispersionTrend>,
    /// Prior variance of log dispersion around the trend
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prior_var: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub var_log_disp: Option<f64>,
    pub coefficient_names: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub results: Option<ResultsSummary>,
}
