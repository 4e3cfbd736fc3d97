//! Per-sample covariates

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::config::ReferencePolicy;
use crate::error::{NbseqError, Result};

/// Values of one metadata column, one entry per sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Covariate {
    Categorical(Vec<String>),
    Continuous(Vec<f64>),
}

impl Covariate {
    fn len(&self) -> usize {
        match self {
            Covariate::Categorical(v) => v.len(),
            Covariate::Continuous(v) => v.len(),
        }
    }
}

/// Sample metadata aligned 1:1 and in order with count matrix columns
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleMetadata {
    sample_ids: Vec<String>,
    /// Column names in insertion order
    column_order: Vec<String>,
    columns: HashMap<String, Covariate>,
}

impl SampleMetadata {
    pub fn new(sample_ids: Vec<String>) -> Result<Self> {
        let mut seen = HashSet::new();
        if let Some(dup) = sample_ids.iter().find(|id| !seen.insert(id.as_str())) {
            return Err(NbseqError::InvalidMetadata {
                reason: format!("duplicate sample identifier '{}'", dup),
            });
        }
        Ok(Self {
            sample_ids,
            column_order: Vec::new(),
            columns: HashMap::new(),
        })
    }

    fn insert(&mut self, name: &str, column: Covariate) -> Result<()> {
        if column.len() != self.sample_ids.len() {
            return Err(NbseqError::DimensionMismatch {
                expected: format!("{} values for column '{}'", self.sample_ids.len(), name),
                got: format!("{} values", column.len()),
            });
        }
        if !self.columns.contains_key(name) {
            self.column_order.push(name.to_string());
        }
        self.columns.insert(name.to_string(), column);
        Ok(())
    }

    /// Add (or replace) a categorical column
    pub fn add_categorical(&mut self, name: &str, values: Vec<String>) -> Result<()> {
        self.insert(name, Covariate::Categorical(values))
    }

    /// Add (or replace) a continuous column
    pub fn add_continuous(&mut self, name: &str, values: Vec<f64>) -> Result<()> {
        if let Some(v) = values.iter().find(|v| !v.is_finite()) {
            return Err(NbseqError::InvalidMetadata {
                reason: format!("continuous column '{}' contains non-finite value {}", name, v),
            });
        }
        self.insert(name, Covariate::Continuous(values))
    }

    /// Reinterpret a categorical column as continuous by parsing its values
    pub fn set_continuous(&mut self, name: &str) -> Result<()> {
        let values = match self.columns.get(name) {
            Some(Covariate::Categorical(v)) => v
                .iter()
                .map(|s| {
                    s.trim().parse::<f64>().map_err(|_| NbseqError::InvalidMetadata {
                        reason: format!("column '{}' value '{}' is not numeric", name, s),
                    })
                })
                .collect::<Result<Vec<f64>>>()?,
            Some(Covariate::Continuous(_)) => return Ok(()),
            None => {
                return Err(NbseqError::InvalidMetadata {
                    reason: format!("column '{}' not found", name),
                })
            }
        };
        self.add_continuous(name, values)
    }

    pub fn sample_ids(&self) -> &[String] {
        &self.sample_ids
    }

    pub fn n_samples(&self) -> usize {
        self.sample_ids.len()
    }

    pub fn column(&self, name: &str) -> Option<&Covariate> {
        self.columns.get(name)
    }

    pub fn column_names(&self) -> &[String] {
        &self.column_order
    }

    /// Values of a categorical column
    pub fn categorical(&self, name: &str) -> Option<&[String]> {
        match self.columns.get(name) {
            Some(Covariate::Categorical(v)) => Some(v),
            _ => None,
        }
    }

    /// Distinct levels of a categorical column, ordered so the policy's
    /// reference comes first: byte order for `Lexicographic`, order of first
    /// appearance for `FirstObserved`.
    pub fn levels(&self, name: &str, policy: ReferencePolicy) -> Option<Vec<String>> {
        let values = self.categorical(name)?;
        let mut levels: Vec<String> = Vec::new();
        for v in values {
            if !levels.contains(v) {
                levels.push(v.clone());
            }
        }
        if policy == ReferencePolicy::Lexicographic {
            levels.sort();
        }
        Some(levels)
    }

    /// Check that this metadata describes exactly `sample_ids`, in order
    pub fn check_alignment(&self, sample_ids: &[String]) -> Result<()> {
        if self.sample_ids.len() != sample_ids.len() {
            return Err(NbseqError::InvalidMetadata {
                reason: format!(
                    "metadata has {} samples but the count matrix has {}",
                    self.sample_ids.len(),
                    sample_ids.len()
                ),
            });
        }
        if let Some((pos, (meta, count))) = self
            .sample_ids
            .iter()
            .zip(sample_ids.iter())
            .enumerate()
            .find(|(_, (a, b))| a != b)
        {
            return Err(NbseqError::InvalidMetadata {
                reason: format!(
                    "sample order mismatch at column {}: metadata has '{}', count matrix has '{}'",
                    pos + 1,
                    meta,
                    count
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_levels_follow_policy() {
        let mut meta = SampleMetadata::new(strings(&["a", "b", "c", "d"])).unwrap();
        meta.add_categorical("condition", strings(&["treated", "control", "treated", "control"]))
            .unwrap();

        assert_eq!(
            meta.levels("condition", ReferencePolicy::Lexicographic).unwrap(),
            strings(&["control", "treated"])
        );
        assert_eq!(
            meta.levels("condition", ReferencePolicy::FirstObserved).unwrap(),
            strings(&["treated", "control"])
        );
    }

    #[test]
    fn test_set_continuous_parses_values() {
        let mut meta = SampleMetadata::new(strings(&["a", "b"])).unwrap();
        meta.add_categorical("age", strings(&["3.5", "7"])).unwrap();
        meta.set_continuous("age").unwrap();
        assert_eq!(meta.column("age"), Some(&Covariate::Continuous(vec![3.5, 7.0])));
        assert!(meta.categorical("age").is_none());
    }

    #[test]
    fn test_set_continuous_rejects_text() {
        let mut meta = SampleMetadata::new(strings(&["a", "b"])).unwrap();
        meta.add_categorical("batch", strings(&["x", "y"])).unwrap();
        assert!(meta.set_continuous("batch").is_err());
    }

    #[test]
    fn test_alignment_detects_reordering() {
        let meta = SampleMetadata::new(strings(&["s1", "s2", "s3"])).unwrap();
        assert!(meta.check_alignment(&strings(&["s1", "s2", "s3"])).is_ok());
        let err = meta.check_alignment(&strings(&["s1", "s3", "s2"])).unwrap_err();
        assert!(err.to_string().contains("column 2"), "got: {}", err);
    }

    #[test]
    fn test_column_length_checked() {
        let mut meta = SampleMetadata::new(strings(&["s1", "s2"])).unwrap();
        assert!(meta.add_categorical("c", strings(&["x"])).is_err());
    }

    #[test]
    fn test_column_order_preserved() {
        let mut meta = SampleMetadata::new(strings(&["s1"])).unwrap();
        meta.add_categorical("batch", strings(&["b"])).unwrap();
        meta.add_continuous("depth", vec![1.0]).unwrap();
        meta.add_categorical("batch", strings(&["c"])).unwrap();
        assert_eq!(meta.column_names(), &strings(&["batch", "depth"])[..]);
    }
}
