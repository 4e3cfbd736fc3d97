//! Design specification, model matrix construction and contrasts

use std::collections::HashMap;

use ndarray::Array2;

use super::linalg::column_rank;
use crate::config::ReferencePolicy;
use crate::data::{Covariate, SampleMetadata};
use crate::error::{NbseqError, Result};

/// Additive list of covariate terms, the last one being the tested effect
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DesignSpec {
    terms: Vec<String>,
    reference_levels: HashMap<String, String>,
}

impl DesignSpec {
    pub fn new<I, S>(terms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            terms: terms.into_iter().map(Into::into).collect(),
            reference_levels: HashMap::new(),
        }
    }

    /// `~ 1`
    pub fn intercept_only() -> Self {
        Self::default()
    }

    /// Parse a formula such as `~ batch + condition`
    pub fn parse(formula: &str) -> Result<Self> {
        let body = formula.trim().trim_start_matches('~');
        let mut terms = Vec::new();
        for raw in body.split('+') {
            let term = raw.trim();
            if term.is_empty() {
                return Err(NbseqError::InvalidDesign {
                    reason: format!("empty term in design '{}'", formula),
                });
            }
            if term == "1" {
                continue;
            }
            if term.contains(':') || term.contains('*') {
                return Err(NbseqError::InvalidDesign {
                    reason: format!("interaction term '{}' is not supported, only additive terms", term),
                });
            }
            terms.push(term.to_string());
        }
        Ok(Self::new(terms))
    }

    /// Override the reference level of a categorical term
    pub fn with_reference(mut self, term: &str, level: &str) -> Self {
        self.reference_levels.insert(term.to_string(), level.to_string());
        self
    }

    pub fn terms(&self) -> &[String] {
        &self.terms
    }

    pub fn reference_override(&self, term: &str) -> Option<&str> {
        self.reference_levels.get(term).map(|s| s.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum TermKind {
    /// Levels with the reference first
    Categorical { levels: Vec<String>, reference: String },
    Continuous,
}

/// One term of the model and the matrix columns it owns
#[derive(Debug, Clone)]
pub struct DesignTerm {
    pub name: String,
    pub kind: TermKind,
    pub columns: Vec<usize>,
}

/// Which linear combination of coefficients to test
#[derive(Debug, Clone, PartialEq)]
pub enum Contrast {
    /// Last coefficient of the last term
    Default,
    /// A coefficient by name, e.g. `condition_treated_vs_control`
    Coefficient(String),
    /// Numerator level versus denominator level of a categorical term
    Levels {
        term: String,
        numerator: String,
        denominator: String,
    },
    /// Explicit weights, one per coefficient
    Weights(Vec<f64>),
}

/// A resolved contrast
#[derive(Debug, Clone, PartialEq)]
pub struct ContrastVector {
    pub name: String,
    pub weights: Vec<f64>,
}

/// Model matrix with an intercept column and treatment coding for factors
#[derive(Debug, Clone)]
pub struct DesignMatrix {
    matrix: Array2<f64>,
    coef_names: Vec<String>,
    terms: Vec<DesignTerm>,
}

impl DesignMatrix {
    /// Build the model matrix for `spec` over `metadata`
    ///
    /// Fails on a missing term, an unknown reference level, a factor with a
    /// single level, a rank-deficient matrix, or no residual degrees of freedom.
    pub fn build(spec: &DesignSpec, metadata: &SampleMetadata, policy: ReferencePolicy) -> Result<Self> {
        let n_samples = metadata.n_samples();

        let mut columns: Vec<Vec<f64>> = vec![vec![1.0; n_samples]];
        let mut coef_names = vec!["Intercept".to_string()];
        let mut terms = Vec::with_capacity(spec.terms().len());

        for name in spec.terms() {
            if terms.iter().any(|t: &DesignTerm| &t.name == name) {
                return Err(NbseqError::InvalidDesign {
                    reason: format!("term '{}' appears more than once", name),
                });
            }

            match metadata.column(name) {
                None => {
                    return Err(NbseqError::InvalidDesign {
                        reason: format!("term '{}' is not a metadata column", name),
                    })
                }
                Some(Covariate::Continuous(values)) => {
                    if spec.reference_override(name).is_some() {
                        return Err(NbseqError::InvalidDesign {
                            reason: format!("reference level given for continuous term '{}'", name),
                        });
                    }
                    terms.push(DesignTerm {
                        name: name.clone(),
                        kind: TermKind::Continuous,
                        columns: vec![columns.len()],
                    });
                    columns.push(values.clone());
                    coef_names.push(name.clone());
                }
                Some(Covariate::Categorical(values)) => {
                    let mut levels = metadata.levels(name, policy).unwrap_or_default();
                    if levels.len() < 2 {
                        return Err(NbseqError::InvalidDesign {
                            reason: format!("factor '{}' has a single level", name),
                        });
                    }

                    if let Some(reference) = spec.reference_override(name) {
                        let pos = levels.iter().position(|l| l == reference).ok_or_else(|| {
                            NbseqError::InvalidDesign {
                                reason: format!(
                                    "reference level '{}' is not a level of '{}' (levels: {})",
                                    reference,
                                    name,
                                    levels.join(", ")
                                ),
                            }
                        })?;
                        let reference = levels.remove(pos);
                        levels.insert(0, reference);
                        log::info!("Reference level for '{}': '{}' (explicit)", name, levels[0]);
                    } else {
                        log::info!("Reference level for '{}': '{}' ({:?} policy)", name, levels[0], policy);
                    }

                    let reference = levels[0].clone();
                    let mut term_columns = Vec::with_capacity(levels.len() - 1);
                    for level in levels.iter().skip(1) {
                        term_columns.push(columns.len());
                        columns.push(values.iter().map(|v| if v == level { 1.0 } else { 0.0 }).collect());
                        coef_names.push(format!("{}_{}_vs_{}", name, level, reference));
                    }
                    terms.push(DesignTerm {
                        name: name.clone(),
                        kind: TermKind::Categorical { levels, reference },
                        columns: term_columns,
                    });
                }
            }
        }

        let n_coefs = columns.len();
        let matrix = Array2::from_shape_fn((n_samples, n_coefs), |(i, j)| columns[j][i]);

        check_full_rank(&matrix)?;
        if n_samples <= n_coefs {
            return Err(NbseqError::InvalidDesign {
                reason: format!(
                    "{} samples and {} coefficients leave no residual degrees of freedom",
                    n_samples, n_coefs
                ),
            });
        }

        log::debug!("Design coefficients: {}", coef_names.join(", "));
        Ok(Self {
            matrix,
            coef_names,
            terms,
        })
    }

    pub fn matrix(&self) -> &Array2<f64> {
        &self.matrix
    }

    pub fn n_coefs(&self) -> usize {
        self.matrix.ncols()
    }

    pub fn n_samples(&self) -> usize {
        self.matrix.nrows()
    }

    pub fn coef_names(&self) -> &[String] {
        &self.coef_names
    }

    pub fn terms(&self) -> &[DesignTerm] {
        &self.terms
    }

    pub fn term(&self, name: &str) -> Option<&DesignTerm> {
        self.terms.iter().find(|t| t.name == name)
    }

    /// m - p
    pub fn residual_df(&self) -> usize {
        self.n_samples() - self.n_coefs()
    }

    /// Cell index of every sample, cells being the distinct rows of the matrix
    /// numbered in order of first appearance
    pub fn cells(&self) -> Vec<usize> {
        let mut distinct: Vec<Vec<u64>> = Vec::new();
        self.matrix
            .rows()
            .into_iter()
            .map(|row| {
                let key: Vec<u64> = row.iter().map(|v| v.to_bits()).collect();
                match distinct.iter().position(|d| *d == key) {
                    Some(idx) => idx,
                    None => {
                        distinct.push(key);
                        distinct.len() - 1
                    }
                }
            })
            .collect()
    }

    /// Whether the model has one coefficient per distinct row, so fitted
    /// means are plain cell means
    pub fn is_group_design(&self) -> bool {
        let n_cells = self.cells().iter().max().map_or(0, |m| m + 1);
        n_cells == self.n_coefs()
    }

    /// Resolve a contrast to a weight vector over coefficients
    pub fn contrast(&self, contrast: &Contrast) -> Result<ContrastVector> {
        let p = self.n_coefs();
        let unit = |idx: usize| -> Vec<f64> {
            let mut w = vec![0.0; p];
            w[idx] = 1.0;
            w
        };

        match contrast {
            Contrast::Default => {
                let idx = self
                    .terms
                    .last()
                    .and_then(|t| t.columns.last().copied())
                    .ok_or_else(|| NbseqError::InvalidContrast {
                        reason: "an intercept-only design has no effect to test".to_string(),
                    })?;
                Ok(ContrastVector {
                    name: self.coef_names[idx].clone(),
                    weights: unit(idx),
                })
            }
            Contrast::Coefficient(name) => {
                let idx = self.coef_names.iter().position(|c| c == name).ok_or_else(|| {
                    NbseqError::InvalidContrast {
                        reason: format!(
                            "coefficient '{}' not found (available: {})",
                            name,
                            self.coef_names.join(", ")
                        ),
                    }
                })?;
                Ok(ContrastVector {
                    name: name.clone(),
                    weights: unit(idx),
                })
            }
            Contrast::Levels {
                term,
                numerator,
                denominator,
            } => self.level_contrast(term, numerator, denominator),
            Contrast::Weights(weights) => {
                if weights.len() != p {
                    return Err(NbseqError::InvalidContrast {
                        reason: format!("{} weights given for {} coefficients", weights.len(), p),
                    });
                }
                if weights.iter().any(|w| !w.is_finite()) || weights.iter().all(|&w| w == 0.0) {
                    return Err(NbseqError::InvalidContrast {
                        reason: "contrast weights must be finite and not all zero".to_string(),
                    });
                }
                Ok(ContrastVector {
                    name: "custom_contrast".to_string(),
                    weights: weights.clone(),
                })
            }
        }
    }

    fn level_contrast(&self, term: &str, numerator: &str, denominator: &str) -> Result<ContrastVector> {
        let design_term = self.term(term).ok_or_else(|| NbseqError::InvalidContrast {
            reason: format!("term '{}' is not in the design", term),
        })?;
        let levels = match &design_term.kind {
            TermKind::Categorical { levels, .. } => levels,
            TermKind::Continuous => {
                return Err(NbseqError::InvalidContrast {
                    reason: format!("term '{}' is continuous", term),
                })
            }
        };
        if numerator == denominator {
            return Err(NbseqError::InvalidContrast {
                reason: format!("numerator and denominator are both '{}'", numerator),
            });
        }

        let mut weights = vec![0.0; self.n_coefs()];
        for (level, sign) in [(numerator, 1.0), (denominator, -1.0)] {
            let pos = levels.iter().position(|l| l == level).ok_or_else(|| NbseqError::InvalidContrast {
                reason: format!("'{}' is not a level of '{}'", level, term),
            })?;
            // reference level has no column
            if pos > 0 {
                weights[design_term.columns[pos - 1]] = sign;
            }
        }

        Ok(ContrastVector {
            name: format!("{}_{}_vs_{}", term, numerator, denominator),
            weights,
        })
    }
}

/// Reject a model matrix that is not of full column rank
pub fn check_full_rank(matrix: &Array2<f64>) -> Result<()> {
    let ncol = matrix.ncols();
    if matrix.nrows() == 0 || ncol == 0 {
        return Err(NbseqError::InvalidDesign {
            reason: "design matrix has zero rows or columns".to_string(),
        });
    }
    if column_rank(matrix) < ncol {
        let has_zero_column = (0..ncol).any(|j| matrix.column(j).iter().all(|&v| v == 0.0));
        let reason = if has_zero_column {
            "the model matrix is not full rank: a level or combination of levels has no samples"
        } else {
            "the model matrix is not full rank: some terms are linear combinations of others"
        };
        return Err(NbseqError::InvalidDesign {
            reason: reason.to_string(),
        });
    }
    Ok(())
}
