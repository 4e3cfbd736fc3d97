//! Count transformations sharing the dispersion trend

mod vst;

pub use vst::{vst, vst_mean, vst_parametric};
