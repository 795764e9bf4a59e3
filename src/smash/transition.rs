//! DenseNet-BC style downsampling between stages.

use crate::nn::{AvgPool2d, BatchNorm2d, Conv2d, Conv2dConfig, Module};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// `bn -> relu -> conv1x1 -> avgpool(2, stride 2)`.
///
/// Remaps the channel count and halves both spatial dimensions.
pub struct Transition {
    pub bn: BatchNorm2d,
    pub conv: Conv2d,
    pub pool: AvgPool2d,
}

impl Transition {
    pub fn new(context: &Rc<RefCell<GraphContext>>, name: &str, n_channels: usize, n_out_channels: usize) -> Self {
        Self {
            bn: BatchNorm2d::new(context, &format!("{}.bn1", name), n_channels),
            conv: Conv2d::from_config(
                context,
                &format!("{}.conv1", name),
                Conv2dConfig::new(n_channels, n_out_channels, (1, 1)).with_bias(false),
            ),
            pool: AvgPool2d::square(2),
        }
    }

    pub fn out_channels(&self) -> usize {
        self.conv.config.out_channels
    }
}

impl Module for Transition {
    fn forward(&self, x: &Tensor) -> Tensor {
        let out = self.conv.forward(&self.bn.forward(x).relu());
        self.pool.forward(&out)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.bn.parameters();
        params.extend(self.conv.parameters());
        params
    }

    fn set_training(&mut self, training: bool) {
        self.bn.set_training(training);
    }
}
