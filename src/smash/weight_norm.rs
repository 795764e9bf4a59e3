//! 2-D convolution with simplified weight normalization.
//!
//! The kernel is divided by the Frobenius norm of the whole weight tensor
//! before every application. Per-output-channel normalization with a
//! learned gain proved unstable for hypernetwork-generated kernels.

use crate::nn::{Conv2d, Conv2dConfig, Module};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Convolution whose effective kernel is `w / ||w||`.
///
/// Only the raw weight is stored; the normalized kernel is part of the
/// graph, so the output is invariant to positive rescaling of `w`.
pub struct WeightNormConv2d {
    pub conv: Conv2d,
}

impl WeightNormConv2d {
    pub fn new(context: &Rc<RefCell<GraphContext>>, name: &str, config: Conv2dConfig) -> Self {
        Self {
            conv: Conv2d::from_config(context, name, config),
        }
    }

    /// The kernel actually convolved with the input.
    pub fn normalized_weight(&self) -> Tensor {
        let weight = &self.conv.weight;
        weight / &weight.norm()
    }

    pub fn out_channels(&self) -> usize {
        self.conv.config.out_channels
    }
}

impl Module for WeightNormConv2d {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.conv.forward_with_weight(inputs, &self.normalized_weight())
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.conv.parameters()
    }
}
