//! Activation functions usable as layers or as per-branch configuration.

use crate::nn::module::Module;
use crate::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Elementwise nonlinearity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    #[default]
    Relu,
    Tanh,
    Sigmoid,
    Identity,
}

impl Activation {
    pub fn apply(&self, x: &Tensor) -> Tensor {
        match self {
            Activation::Relu => x.relu(),
            Activation::Tanh => x.tanh(),
            Activation::Sigmoid => x.sigmoid(),
            Activation::Identity => x.clone(),
        }
    }
}

impl Module for Activation {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.apply(inputs)
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}
