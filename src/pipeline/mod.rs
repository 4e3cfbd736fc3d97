//! Staged analysis state
//!
//! Every stage reads the outputs of the stages before it and returns a new
//! state; nothing is mutated in place. Stage outputs are shared read-only
//! between states, so cloning a state or branching off several contrasts is
//! cheap.
//!
//! ```ignore
//! let state = AnalysisState::new(counts, metadata, &DesignSpec::parse("~ condition")?, config)?
//!     .estimate_size_factors()?
//!     .estimate_dispersions()?
//!     .fit_glm()?;
//! let table = state.results(&Contrast::Default)?;
//! ```

use std::f64::consts::LN_2;
use std::sync::Arc;

use ndarray::{Array1, Array2, Axis};

use crate::config::AnalysisConfig;
use crate::data::{CountMatrix, SampleMetadata};
use crate::dispersion::{estimate_dispersions, DispersionEstimates, DispersionParams};
use crate::error::{NbseqError, Result};
use crate::filter::{
    cooks_distances, default_cooks_cutoff, independent_filtering, max_cooks, replicated_samples,
    robust_moments_dispersions, unfiltered,
};
use crate::glm::{default_ridge, fit_genes, Contrast, DesignMatrix, DesignSpec, GeneFit, GlmFitParams};
use crate::io::{AnalysisSummary, GeneResult, GeneStatus, ResultsTable};
use crate::normalization::{check_size_factors, estimate_size_factors, normalized_counts};
use crate::shrinkage::shrink_lfc_normal;
use crate::testing::{wald_test, WaldDistribution};
use crate::transform::vst;

/// Inputs plus whatever stages have completed so far
#[derive(Debug, Clone)]
pub struct AnalysisState {
    counts: Arc<CountMatrix>,
    metadata: Arc<SampleMetadata>,
    design: Arc<DesignMatrix>,
    config: Arc<AnalysisConfig>,
    size_factors: Option<Arc<Array1<f64>>>,
    dispersions: Option<Arc<DispersionEstimates>>,
    fits: Option<Arc<Vec<GeneFit>>>,
}

fn missing(stage: &str, needed_by: &str) -> NbseqError {
    NbseqError::MissingStage {
        reason: format!("{} must run before {}", stage, needed_by),
    }
}

impl AnalysisState {
    /// Validate the inputs and build the model matrix
    pub fn new(
        counts: CountMatrix,
        metadata: SampleMetadata,
        design: &DesignSpec,
        config: AnalysisConfig,
    ) -> Result<Self> {
        config.validate()?;
        metadata.check_alignment(counts.sample_ids())?;
        let design = DesignMatrix::build(design, &metadata, config.reference_policy)?;
        log::info!(
            "Design with {} coefficients over {} samples: {}",
            design.n_coefs(),
            design.n_samples(),
            design.coef_names().join(", ")
        );

        Ok(Self {
            counts: Arc::new(counts),
            metadata: Arc::new(metadata),
            design: Arc::new(design),
            config: Arc::new(config),
            size_factors: None,
            dispersions: None,
            fits: None,
        })
    }

    pub fn counts(&self) -> &CountMatrix {
        &self.counts
    }

    pub fn metadata(&self) -> &SampleMetadata {
        &self.metadata
    }

    pub fn design(&self) -> &DesignMatrix {
        &self.design
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    pub fn size_factors(&self) -> Option<&Array1<f64>> {
        self.size_factors.as_deref()
    }

    pub fn dispersions(&self) -> Option<&DispersionEstimates> {
        self.dispersions.as_deref()
    }

    pub fn fits(&self) -> Option<&[GeneFit]> {
        self.fits.as_deref().map(|f| f.as_slice())
    }

    fn require_size_factors(&self, needed_by: &str) -> Result<&Array1<f64>> {
        self.size_factors().ok_or_else(|| missing("size factor estimation", needed_by))
    }

    fn require_dispersions(&self, needed_by: &str) -> Result<&DispersionEstimates> {
        self.dispersions().ok_or_else(|| missing("dispersion estimation", needed_by))
    }

    fn require_fits(&self, needed_by: &str) -> Result<&[GeneFit]> {
        self.fits().ok_or_else(|| missing("the GLM fit", needed_by))
    }

    /// New state with `size_factors` and no downstream stages
    fn with_stage_reset(&self, size_factors: Array1<f64>) -> Self {
        Self {
            size_factors: Some(Arc::new(size_factors)),
            dispersions: None,
            fits: None,
            ..self.clone()
        }
    }

    pub fn estimate_size_factors(&self) -> Result<Self> {
        let sf = estimate_size_factors(self.counts.counts(), self.config.size_factor_method)?;
        Ok(self.with_stage_reset(sf))
    }

    /// Use externally computed size factors, one positive value per sample
    pub fn with_size_factors(&self, size_factors: Array1<f64>) -> Result<Self> {
        if size_factors.len() != self.counts.n_samples() {
            return Err(NbseqError::DimensionMismatch {
                expected: format!("{} size factors", self.counts.n_samples()),
                got: size_factors.len().to_string(),
            });
        }
        check_size_factors(&size_factors)?;
        Ok(self.with_stage_reset(size_factors))
    }

    pub fn normalized_counts(&self) -> Result<Array2<f64>> {
        let sf = self.require_size_factors("normalization")?;
        Ok(normalized_counts(self.counts.counts(), sf))
    }

    pub fn estimate_dispersions(&self) -> Result<Self> {
        let sf = self.require_size_factors("dispersion estimation")?;
        let params = DispersionParams::from_config(&self.config, self.counts.n_samples());
        let estimates = estimate_dispersions(self.counts.counts(), sf, &self.design, self.config.fit_type, &params)?;
        Ok(Self {
            dispersions: Some(Arc::new(estimates)),
            fits: None,
            ..self.clone()
        })
    }

    pub fn fit_glm(&self) -> Result<Self> {
        let sf = self.require_size_factors("the GLM fit")?;
        let disp = self.require_dispersions("the GLM fit")?;
        log::info!("Fitting negative binomial GLMs for {} genes", self.counts.n_genes());
        let fits = fit_genes(
            self.counts.counts(),
            self.design.matrix(),
            sf,
            &disp.dispersions.to_vec(),
            &default_ridge(self.design.n_coefs()),
            &GlmFitParams::from_config(&self.config),
        );
        Ok(Self {
            fits: Some(Arc::new(fits)),
            ..self.clone()
        })
    }

    /// Size factors, dispersions and GLM fit in sequence
    pub fn run(&self) -> Result<Self> {
        self.estimate_size_factors()?.estimate_dispersions()?.fit_glm()
    }

    /// Test `contrast` on every gene
    pub fn results(&self, contrast: &Contrast) -> Result<ResultsTable> {
        let sf = self.require_size_factors("results")?;
        let disp = self.require_dispersions("results")?;
        let fits = self.require_fits("results")?;
        let config = &self.config;
        let resolved = self.design.contrast(contrast)?;
        let n_samples = self.counts.n_samples();
        let n_coefs = self.design.n_coefs();
        let n_genes = self.counts.n_genes();

        let distribution = if config.use_t {
            WaldDistribution::StudentsT(self.design.residual_df() as f64)
        } else {
            WaldDistribution::Normal
        };
        let mut outcomes = wald_test(
            fits,
            &resolved.weights,
            config.lfc_threshold,
            config.alt_hypothesis,
            distribution,
        );

        let normalized = normalized_counts(self.counts.counts(), sf);
        let base_means = disp.base_means.to_vec();
        let base_vars: Vec<f64> = normalized
            .axis_iter(Axis(0))
            .zip(base_means.iter())
            .map(|(row, &mean)| {
                if n_samples < 2 {
                    return f64::NAN;
                }
                row.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / (n_samples - 1) as f64
            })
            .collect();

        // Cook's distances use a robust dispersion so one outlier cannot mask itself
        let cells = self.design.cells();
        let robust = robust_moments_dispersions(normalized.view(), &cells);
        let cooks = cooks_distances(self.counts.counts(), fits, &robust);
        let max_cooks = max_cooks(&cooks, &replicated_samples(&cells));
        let cooks_cutoff = config
            .cooks_cutoff
            .unwrap_or_else(|| default_cooks_cutoff(n_samples, n_coefs));
        let cooks_outlier: Vec<bool> = max_cooks
            .iter()
            .map(|&c| config.cooks_filter && c > cooks_cutoff)
            .collect();

        let pvalues: Vec<f64> = outcomes
            .iter()
            .zip(cooks_outlier.iter())
            .map(|(o, &outlier)| if outlier { f64::NAN } else { o.pvalue })
            .collect();
        let filter = if config.independent_filtering {
            independent_filtering(&base_means, &pvalues, config.alpha)
        } else {
            unfiltered(&pvalues, config.alpha)
        };
        log::debug!(
            "Independent filtering: theta {:.3}, base mean cutoff {:.4}, {} rejections",
            filter.theta,
            filter.cutoff,
            filter.rejections
        );

        if config.shrink_lfc {
            let (shrunk, _) = shrink_lfc_normal(
                self.counts.counts(),
                self.design.matrix(),
                sf,
                &disp.dispersions.to_vec(),
                fits,
                &base_means,
                &disp.trended.to_vec(),
                &GlmFitParams::from_config(config),
            );
            for (outcome, fit) in outcomes.iter_mut().zip(shrunk.iter()) {
                if fit.is_fitted() && outcome.log2_fold_change.is_finite() {
                    let (estimate, se) = fit.contrast(&resolved.weights);
                    outcome.log2_fold_change = estimate / LN_2;
                    outcome.lfc_se = se / LN_2;
                }
            }
        }

        let rows: Vec<GeneResult> = (0..n_genes)
            .map(|i| {
                let fit = &fits[i];
                let all_zero = disp.all_zero[i];
                let status = GeneStatus {
                    all_zero,
                    dispersion_not_converged: !all_zero && !disp.converged[i],
                    dispersion_outlier: disp.outlier[i],
                    glm_not_converged: glm_not_converged(fit, all_zero),
                    cooks_outlier: cooks_outlier[i],
                    filtered: filter.filtered[i] && !all_zero,
                };
                GeneResult {
                    gene_id: self.counts.gene_ids()[i].clone(),
                    base_mean: base_means[i],
                    base_var: base_vars[i],
                    log2_fold_change: outcomes[i].log2_fold_change,
                    lfc_se: outcomes[i].lfc_se,
                    stat: outcomes[i].stat,
                    pvalue: pvalues[i],
                    padj: filter.padj[i],
                    dispersion: disp.dispersions[i],
                    gene_wise_dispersion: disp.gene_wise[i],
                    trended_dispersion: disp.trended[i],
                    max_cooks: max_cooks[i],
                    status,
                }
            })
            .collect();

        let table = ResultsTable::new(resolved.name, config.alpha, rows);
        let summary = table.summary();
        log::info!(
            "{}: {} of {} tested genes significant at padj < {}",
            summary.contrast,
            summary.significant,
            summary.genes_tested,
            summary.alpha
        );
        if summary.cooks_outliers > 0 {
            log::warn!("{} genes flagged as Cook's outliers", summary.cooks_outliers);
        }
        Ok(table)
    }

    /// Variance-stabilized counts
    ///
    /// With `blind` the dispersion trend is re-estimated under an
    /// intercept-only design; otherwise the trend of the dispersion stage is
    /// used.
    pub fn vst(&self, blind: bool) -> Result<Array2<f64>> {
        let sf = self.require_size_factors("the variance stabilizing transform")?;
        if blind {
            let design = DesignMatrix::build(&DesignSpec::intercept_only(), &self.metadata, self.config.reference_policy)?;
            let params = DispersionParams::from_config(&self.config, self.counts.n_samples());
            let estimates = estimate_dispersions(self.counts.counts(), sf, &design, self.config.fit_type, &params)?;
            vst(self.counts.counts(), sf, &estimates.trend)
        } else {
            let disp = self.require_dispersions("a non-blind transform")?;
            vst(self.counts.counts(), sf, &disp.trend)
        }
    }

    /// Run-level quantities for the JSON summary
    pub fn summary(&self, results: Option<&ResultsTable>) -> AnalysisSummary {
        AnalysisSummary {
            n_genes: self.counts.n_genes(),
            sample_ids: self.counts.sample_ids().to_vec(),
            size_factors: self.size_factors().map(|s| s.to_vec()).unwrap_or_default(),
            trend: self.dispersions().map(|d| d.trend.clone()),
            prior_var: self.dispersions().map(|d| d.prior_var),
            var_log_disp: self.dispersions().map(|d| d.var_log_disp),
            coefficient_names: self.design.coef_names().to_vec(),
            results: results.map(|r| r.summary()),
        }
    }
}

/// A fit that hit the iteration cap or left a non-finite coefficient
fn glm_not_converged(fit: &GeneFit, all_zero: bool) -> bool {
    !all_zero && (!fit.is_fitted() || !fit.converged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn small_state() -> AnalysisState {
        let counts = array![
            [10.0, 20.0, 40.0, 25.0, 14.0, 35.0],
            [100.0, 60.0, 150.0, 80.0, 130.0, 70.0],
            [0.0, 0.0, 0.0, 0.0, 0.0, 0.0],
            [5.0, 12.0, 2.0, 9.0, 1.0, 6.0],
        ];
        let genes = (1..=4).map(|i| format!("g{}", i)).collect();
        let samples: Vec<String> = (1..=6).map(|i| format!("s{}", i)).collect();
        let matrix = CountMatrix::new(counts, genes, samples.clone()).unwrap();
        let mut meta = SampleMetadata::new(samples).unwrap();
        meta.add_categorical(
            "condition",
            ["a", "a", "b", "b", "a", "b"].iter().map(|s| s.to_string()).collect(),
        )
        .unwrap();
        AnalysisState::new(matrix, meta, &DesignSpec::new(["condition"]), AnalysisConfig::default()).unwrap()
    }

    #[test]
    fn test_failed_fit_flagged_unless_all_zero() {
        let unfitted = GeneFit::unfitted(6, 2);
        assert!(glm_not_converged(&unfitted, false));
        assert!(!glm_not_converged(&unfitted, true));

        let mut partial = GeneFit::unfitted(6, 2);
        partial.coefficients = vec![2.0, f64::NAN];
        partial.converged = true;
        assert!(glm_not_converged(&partial, false));

        let mut capped = GeneFit::unfitted(6, 2);
        capped.coefficients = vec![2.0, 0.5];
        assert!(glm_not_converged(&capped, false));
        capped.converged = true;
        assert!(!glm_not_converged(&capped, false));
    }

    #[test]
    fn test_stages_out_of_order() {
        let state = small_state();
        assert!(matches!(state.estimate_dispersions(), Err(NbseqError::MissingStage { .. })));
        assert!(matches!(state.fit_glm(), Err(NbseqError::MissingStage { .. })));
        assert!(matches!(state.results(&Contrast::Default), Err(NbseqError::MissingStage { .. })));
        assert!(matches!(state.vst(true), Err(NbseqError::MissingStage { .. })));
    }

    #[test]
    fn test_user_size_factors_validated_and_reset_downstream() {
        let state = small_state();
        assert!(state.with_size_factors(Array1::from_vec(vec![1.0; 5])).is_err());
        assert!(matches!(
            state.with_size_factors(Array1::from_vec(vec![1.0, 1.0, 0.0, 1.0, 1.0, 1.0])),
            Err(NbseqError::SizeFactorFailed { .. })
        ));

        let fitted = state
            .with_size_factors(Array1::from_vec(vec![1.0; 6]))
            .unwrap()
            .estimate_dispersions()
            .unwrap();
        assert!(fitted.dispersions().is_some());
        let reset = fitted.with_size_factors(Array1::from_vec(vec![2.0; 6])).unwrap();
        assert!(reset.dispersions().is_none());
        // the earlier state is untouched
        assert!(fitted.dispersions().is_some());
    }

    #[test]
    fn test_full_run_flags_all_zero_gene() {
        let state = small_state()
            .with_size_factors(Array1::from_vec(vec![1.0; 6]))
            .unwrap()
            .estimate_dispersions()
            .unwrap()
            .fit_glm()
            .unwrap();
        let table = state.results(&Contrast::Default).unwrap();
        assert_eq!(table.contrast(), "condition_b_vs_a");
        assert_eq!(table.n_genes(), 4);

        let zero = table.get("g3").unwrap();
        assert!(zero.status.all_zero);
        assert!(zero.log2_fold_change.is_nan() && zero.pvalue.is_nan() && zero.padj.is_nan());

        let changed = table.get("g1").unwrap();
        assert!(changed.log2_fold_change > 0.5);

        let summary = state.summary(Some(&table));
        assert_eq!(summary.size_factors.len(), 6);
        assert!(summary.prior_var.is_some());
    }

    #[test]
    fn test_misaligned_metadata_rejected() {
        let counts = array![[1.0, 2.0], [3.0, 4.0]];
        let matrix = CountMatrix::new(
            counts,
            vec!["g1".to_string(), "g2".to_string()],
            vec!["s1".to_string(), "s2".to_string()],
        )
        .unwrap();
        let meta = SampleMetadata::new(vec!["s2".to_string(), "s1".to_string()]).unwrap();
        assert!(matches!(
            AnalysisState::new(matrix, meta, &DesignSpec::intercept_only(), AnalysisConfig::default()),
            Err(NbseqError::InvalidMetadata { .. })
        ));
    }
}
