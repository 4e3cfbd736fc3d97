//! Wald testing and multiple-testing adjustment

mod fdr;
mod pvalue;
mod wald;

pub use fdr::{benjamini_hochberg, count_rejections};
pub use pvalue::WaldDistribution;
pub use wald::{wald_statistic, wald_test, WaldOutcome};
