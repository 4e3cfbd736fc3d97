//! Negative binomial generalized linear models

mod design;
mod fitting;
pub(crate) mod linalg;
mod negative_binomial;

pub use design::{check_full_rank, Contrast, ContrastVector, DesignMatrix, DesignSpec, DesignTerm, TermKind};
pub use fitting::{default_ridge, fit_gene, fit_genes, GeneFit, GlmFitParams};
pub use negative_binomial::{
    default_ridge_lambda, nb_deviance, nb_log_likelihood, nb_mean, nb_variance, nb_weight, MAX_ETA, MAX_LFC_BETA,
    MIN_MU,
};
