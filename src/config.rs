//! Run configuration
//!
//! `AnalysisConfig` gathers every tunable of a run. It deserializes from a
//! partial JSON document, with missing fields taking their defaults.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{NbseqError, Result};

/// Functional form of the dispersion-mean trend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FitType {
    /// alpha(mean) = a1 / mean + a0, Gamma GLM with identity link
    Parametric,
    /// Local regression of log dispersion on log mean
    Local,
    /// A single trimmed mean of the gene-wise estimates
    Mean,
}

impl std::str::FromStr for FitType {
    type Err = NbseqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "parametric" => Ok(FitType::Parametric),
            "local" => Ok(FitType::Local),
            "mean" => Ok(FitType::Mean),
            other => Err(NbseqError::InvalidConfig {
                reason: format!("unknown fit type '{}' (parametric, local, mean)", other),
            }),
        }
    }
}

/// Alternative hypothesis for the Wald test against threshold `lfc_threshold`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AltHypothesis {
    /// |LFC| > threshold (two-sided; the ordinary test when threshold is 0)
    GreaterAbs,
    /// |LFC| < threshold
    LessAbs,
    /// LFC > threshold
    Greater,
    /// LFC < -threshold
    Less,
}

impl std::str::FromStr for AltHypothesis {
    type Err = NbseqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "greaterAbs" | "greater-abs" => Ok(AltHypothesis::GreaterAbs),
            "lessAbs" | "less-abs" => Ok(AltHypothesis::LessAbs),
            "greater" => Ok(AltHypothesis::Greater),
            "less" => Ok(AltHypothesis::Less),
            other => Err(NbseqError::InvalidConfig {
                reason: format!(
                    "unknown alternative hypothesis '{}' (greaterAbs, lessAbs, greater, less)",
                    other
                ),
            }),
        }
    }
}

/// How the reference level of a categorical term is picked when not overridden
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReferencePolicy {
    /// Smallest level in byte order
    Lexicographic,
    /// Level of the first sample in column order
    FirstObserved,
}

impl std::str::FromStr for ReferencePolicy {
    type Err = NbseqError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "lexicographic" => Ok(ReferencePolicy::Lexicographic),
            "firstObserved" | "first-observed" => Ok(ReferencePolicy::FirstObserved),
            other => Err(NbseqError::InvalidConfig {
                reason: format!(
                    "unknown reference policy '{}' (lexicographic, first-observed)",
                    other
                ),
            }),
        }
    }
}

/// Size factor estimation method
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SizeFactorMethod {
    /// Median of ratios to the per-gene geometric mean over genes without zeros
    Ratio,
    /// Geometric means over positive counts only, for sparse matrices
    PosCounts,
}

impl std::str::FromStr for SizeFactorMethod {
    type Err = NbseqError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ratio" => Ok(SizeFactorMethod::Ratio),
            "poscounts" => Ok(SizeFactorMethod::PosCounts),
            other => Err(NbseqError::InvalidConfig {
                reason: format!("unknown size factor method '{}' (ratio, poscounts)", other),
            }),
        }
    }
}

/// All tunables of an analysis run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Target false discovery rate for independent filtering and significance calls
    pub alpha: f64,
    /// Dispersion trend form
    pub fit_type: FitType,
    /// Replace MLE fold changes by their normal-prior posterior modes
    pub shrink_lfc: bool,
    /// Effect-size threshold (log2 scale) for the alternative hypothesis
    pub lfc_threshold: f64,
    pub alt_hypothesis: AltHypothesis,
    /// Lower bound on dispersion
    pub min_disp: f64,
    /// Upper bound on dispersion; `None` means max(10, number of samples)
    pub max_disp: Option<f64>,
    /// Iteration cap shared by the dispersion line search and IRLS
    pub maxit: usize,
    /// Relative deviance tolerance for IRLS
    pub beta_tol: f64,
    /// Log-posterior change tolerance for the dispersion line search
    pub disp_tol: f64,
    /// Dispersion outlier threshold in SDs of the log residuals
    pub outlier_sd: f64,
    /// Use Student's t with m - p degrees of freedom for Wald p-values
    pub use_t: bool,
    pub independent_filtering: bool,
    /// Flag genes whose max Cook's distance exceeds the cutoff
    pub cooks_filter: bool,
    /// Explicit Cook's cutoff; `None` uses the 0.99 quantile of F(p, m - p)
    pub cooks_cutoff: Option<f64>,
    pub reference_policy: ReferencePolicy,
    pub size_factor_method: SizeFactorMethod,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            alpha: 0.1,
            fit_type: FitType::Parametric,
            shrink_lfc: false,
            lfc_threshold: 0.0,
            alt_hypothesis: AltHypothesis::GreaterAbs,
            min_disp: 1e-8,
            max_disp: None,
            maxit: 100,
            beta_tol: 1e-8,
            disp_tol: 1e-6,
            outlier_sd: 2.0,
            use_t: false,
            independent_filtering: true,
            cooks_filter: true,
            cooks_cutoff: None,
            reference_policy: ReferencePolicy::Lexicographic,
            size_factor_method: SizeFactorMethod::Ratio,
        }
    }
}

impl AnalysisConfig {
    /// Load a (possibly partial) configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(path)?);
        let config: AnalysisConfig = serde_json::from_reader(reader)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the run meaningless
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(NbseqError::InvalidConfig { reason });

        if !(self.alpha > 0.0 && self.alpha < 1.0) {
            return invalid(format!("alpha must lie in (0, 1), got {}", self.alpha));
        }
        if !(self.lfc_threshold >= 0.0) || !self.lfc_threshold.is_finite() {
            return invalid(format!(
                "lfc_threshold must be finite and non-negative, got {}",
                self.lfc_threshold
            ));
        }
        if self.alt_hypothesis == AltHypothesis::LessAbs && self.lfc_threshold == 0.0 {
            return invalid("lessAbs requires a positive lfc_threshold".to_string());
        }
        if !(self.min_disp > 0.0) {
            return invalid(format!("min_disp must be positive, got {}", self.min_disp));
        }
        if let Some(max_disp) = self.max_disp {
            if !(max_disp > self.min_disp) {
                return invalid(format!(
                    "max_disp ({}) must exceed min_disp ({})",
                    max_disp, self.min_disp
                ));
            }
        }
        if self.maxit == 0 {
            return invalid("maxit must be at least 1".to_string());
        }
        if !(self.beta_tol > 0.0) || !(self.disp_tol > 0.0) {
            return invalid("tolerances must be positive".to_string());
        }
        if !(self.outlier_sd > 0.0) {
            return invalid(format!("outlier_sd must be positive, got {}", self.outlier_sd));
        }
        if let Some(cutoff) = self.cooks_cutoff {
            if !(cutoff > 0.0) {
                return invalid(format!("cooks_cutoff must be positive, got {}", cutoff));
            }
        }
        Ok(())
    }

    /// Effective dispersion upper bound for `n_samples` samples
    pub fn max_disp_for(&self, n_samples: usize) -> f64 {
        self.max_disp.unwrap_or_else(|| (n_samples as f64).max(10.0))
    }
}
