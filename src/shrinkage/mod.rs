//! Log fold change shrinkage

mod normal;

pub use normal::{estimate_beta_prior_variance, normal_prior_ridge, shrink_lfc_normal};
