//! Outlier detection and independent filtering of results

mod cooks;
mod independent;

pub use cooks::{
    cooks_distances, default_cooks_cutoff, max_cooks, replicated_samples, robust_moments_dispersions,
    MIN_REPLICATES,
};
pub use independent::{independent_filtering, unfiltered, FilterResult};
