//! Parameter registry and value store.
//!
//! Modules declare their parameters as [`ParamSpec`]s when they are built.
//! The [`ParamStore`] owns the concrete values, keyed by parameter name.

use crate::nn::init::ParamInit;
use ndarray::ArrayD;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Declaration of one parameter or buffer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamSpec {
    pub name: String,
    pub shape: Vec<usize>,
    pub init: ParamInit,
    /// Buffers (batch-norm running statistics) are not trainable.
    pub trainable: bool,
}

/// Concrete parameter values.
#[derive(Debug, Clone, Default)]
pub struct ParamStore {
    values: HashMap<String, ArrayD<f32>>,
    trainable: HashMap<String, bool>,
}

impl ParamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Draws initial values for every spec that has no value yet.
    /// Returns how many parameters were initialized.
    pub fn initialize_missing<R: Rng + ?Sized>(&mut self, specs: &[ParamSpec], rng: &mut R) -> usize {
        let mut created = 0;
        for spec in specs {
            if self.values.contains_key(&spec.name) {
                continue;
            }
            self.values
                .insert(spec.name.clone(), spec.init.sample(&spec.shape, rng));
            self.trainable.insert(spec.name.clone(), spec.trainable);
            created += 1;
        }
        created
    }

    pub fn get(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.values.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut ArrayD<f32>> {
        self.values.get_mut(name)
    }

    /// Overwrites a value, keeping its trainable flag (new names are trainable).
    pub fn set(&mut self, name: &str, value: ArrayD<f32>) {
        self.trainable.entry(name.to_string()).or_insert(true);
        self.values.insert(name.to_string(), value);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    pub fn is_trainable(&self, name: &str) -> bool {
        self.trainable.get(name).copied().unwrap_or(false)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ArrayD<f32>)> {
        self.values.iter()
    }

    /// Total number of trainable scalars.
    pub fn num_trainable_elements(&self) -> usize {
        self.values
            .iter()
            .filter(|(name, _)| self.is_trainable(name))
            .map(|(_, v)| v.len())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn spec(name: &str, shape: &[usize], trainable: bool) -> ParamSpec {
        ParamSpec {
            name: name.to_string(),
            shape: shape.to_vec(),
            init: ParamInit::Ones,
            trainable,
        }
    }

    #[test]
    fn initializes_only_missing_values() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut store = ParamStore::new();
        store.set("a", ArrayD::zeros(ndarray::IxDyn(&[2])));
        let created = store.initialize_missing(&[spec("a", &[2], true), spec("b", &[3], true)], &mut rng);
        assert_eq!(created, 1);
        assert_eq!(store.get("a").unwrap().sum(), 0.0);
        assert_eq!(store.get("b").unwrap().sum(), 3.0);
    }

    #[test]
    fn buffers_do_not_count_as_trainable() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut store = ParamStore::new();
        store.initialize_missing(&[spec("w", &[4, 4], true), spec("bn.running_mean", &[4], false)], &mut rng);
        assert_eq!(store.num_trainable_elements(), 16);
        assert!(!store.is_trainable("bn.running_mean"));
    }
}
