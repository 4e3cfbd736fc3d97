//! Input data: counts and sample covariates

mod count_matrix;
mod metadata;

pub use count_matrix::CountMatrix;
pub use metadata::{Covariate, SampleMetadata};
