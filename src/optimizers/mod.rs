//! Optimizers that update parameter values from computed gradients.
//!
//! Optimizers work on concrete `ndarray` data held by a [`ParamStore`];
//! they never touch the graph.

use crate::error::{Error, Result};
use crate::nn::parameters::ParamStore;
use crate::runtime::backend::RuntimeError;
use ndarray::{ArrayD, Zip};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::trace;

/// Common interface for all optimizers.
pub trait Optimizer {
    /// Performs one optimization step.
    ///
    /// * `parameters` - current values, updated in place.
    /// * `gradients` - gradients keyed by parameter name. Parameters
    ///   without a gradient are left untouched.
    fn step(&mut self, parameters: &mut ParamStore, gradients: &HashMap<String, ArrayD<f32>>) -> Result<()>;

    fn learning_rate(&self) -> f32;

    fn set_learning_rate(&mut self, lr: f32);
}

/// Hyperparameters of [`Sgd`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SgdConfig {
    pub lr: f32,
    pub momentum: f32,
    pub nesterov: bool,
    pub weight_decay: f32,
}

impl Default for SgdConfig {
    fn default() -> Self {
        Self {
            lr: 0.1,
            momentum: 0.9,
            nesterov: true,
            weight_decay: 1e-4,
        }
    }
}

/// Stochastic gradient descent with momentum, Nesterov acceleration and
/// L2 weight decay.
///
/// Per parameter `p` with gradient `g`:
///
/// ```text
/// d   = g + weight_decay * p
/// buf = momentum * buf + d        (buf = d on the first step)
/// d   = d + momentum * buf        (nesterov)
///     = buf                       (plain momentum)
/// p  -= lr * d
/// ```
#[derive(Debug, Clone)]
pub struct Sgd {
    config: SgdConfig,
    velocity: HashMap<String, ArrayD<f32>>,
}

impl Sgd {
    pub fn new(config: SgdConfig) -> Self {
        Self {
            config,
            velocity: HashMap::new(),
        }
    }

    pub fn config(&self) -> &SgdConfig {
        &self.config
    }

    /// Momentum buffer of a parameter, once it has taken a step.
    pub fn velocity(&self, name: &str) -> Option<&ArrayD<f32>> {
        self.velocity.get(name)
    }
}

impl Optimizer for Sgd {
    fn step(&mut self, parameters: &mut ParamStore, gradients: &HashMap<String, ArrayD<f32>>) -> Result<()> {
        let SgdConfig {
            lr,
            momentum,
            nesterov,
            weight_decay,
        } = self.config;

        // Validate every entry before mutating any parameter.
        for (name, grad) in gradients {
            let param = parameters.get(name).ok_or_else(|| Error::UnknownTensor(name.clone()))?;
            if param.shape() != grad.shape() {
                return Err(RuntimeError::ShapeError(format!(
                    "gradient of shape {:?} does not match parameter '{}' of shape {:?}",
                    grad.shape(),
                    name,
                    param.shape()
                ))
                .into());
            }
        }

        for (name, grad) in gradients {
            let Some(param) = parameters.get_mut(name) else {
                continue;
            };
            let mut d = grad.clone();
            if weight_decay != 0.0 {
                d.scaled_add(weight_decay, param);
            }

            if momentum != 0.0 {
                let buf = self
                    .velocity
                    .entry(name.clone())
                    .and_modify(|buf| Zip::from(buf).and(&d).for_each(|b, &d| *b = momentum * *b + d))
                    .or_insert_with(|| d.clone());
                if nesterov {
                    d.scaled_add(momentum, buf);
                } else {
                    d.assign(buf);
                }
            }

            param.scaled_add(-lr, &d);
            trace!(param = %name, lr, "sgd update");
        }
        Ok(())
    }

    fn learning_rate(&self) -> f32 {
        self.config.lr
    }

    fn set_learning_rate(&mut self, lr: f32) {
        self.config.lr = lr;
    }
}
