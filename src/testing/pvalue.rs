//! Tail probabilities of the Wald statistic

use statrs::distribution::{ContinuousCDF, Normal, StudentsT};

/// Reference distribution of the Wald statistic
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaldDistribution {
    Normal,
    /// Student's t with the given degrees of freedom
    StudentsT(f64),
}

impl WaldDistribution {
    /// P(X > x), NaN for a non-finite `x` or an invalid distribution
    pub fn upper_tail(&self, x: f64) -> f64 {
        if x.is_nan() {
            return f64::NAN;
        }
        match *self {
            WaldDistribution::Normal => Normal::new(0.0, 1.0).map_or(f64::NAN, |d| d.sf(x)),
            WaldDistribution::StudentsT(df) => StudentsT::new(0.0, 1.0, df).map_or(f64::NAN, |d| d.sf(x)),
        }
    }
}
