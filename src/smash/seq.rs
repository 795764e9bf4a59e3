//! Normalize-activate-convolve block.
//!
//! Inserts a nonlinearity (and optionally batch normalization) around a
//! bias-free convolution, either before it (pre-activation) or after it
//! (post-activation). Padding keeps the spatial size for any odd kernel
//! and dilation.

use crate::error::ConfigError;
use crate::nn::{Activation, BatchNorm2d, Conv2d, Conv2dConfig, Module};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NormActConvConfig {
    pub n_in: usize,
    pub n_out: usize,
    pub kernel_size: (usize, usize),
    pub dilation: (usize, usize),
    /// `(BN) -> act -> conv` when set, `conv -> (BN) -> act` otherwise.
    pub preactivation: bool,
    pub batchnorm: bool,
    pub groups: usize,
    pub activation: Activation,
}

impl NormActConvConfig {
    pub fn new(n_in: usize, n_out: usize) -> Self {
        Self {
            n_in,
            n_out,
            kernel_size: (3, 3),
            dilation: (1, 1),
            preactivation: true,
            batchnorm: false,
            groups: 1,
            activation: Activation::Relu,
        }
    }

    pub fn with_kernel_size(mut self, kernel_size: (usize, usize)) -> Self {
        self.kernel_size = kernel_size;
        self
    }

    pub fn with_dilation(mut self, dilation: (usize, usize)) -> Self {
        self.dilation = dilation;
        self
    }

    pub fn with_preactivation(mut self, preactivation: bool) -> Self {
        self.preactivation = preactivation;
        self
    }

    pub fn with_batchnorm(mut self, batchnorm: bool) -> Self {
        self.batchnorm = batchnorm;
        self
    }

    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// `(k + (k - 1) * (d - 1)) / 2` per spatial axis.
    pub fn padding(&self) -> (usize, usize) {
        let pad = |k: usize, d: usize| (k + (k.saturating_sub(1)) * d.saturating_sub(1)) / 2;
        (
            pad(self.kernel_size.0, self.dilation.0),
            pad(self.kernel_size.1, self.dilation.1),
        )
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.n_in == 0 {
            return Err(ConfigError::NonPositive { name: "n_in" });
        }
        if self.n_out == 0 {
            return Err(ConfigError::NonPositive { name: "n_out" });
        }
        for k in [self.kernel_size.0, self.kernel_size.1] {
            if k == 0 || k % 2 == 0 {
                return Err(ConfigError::InvalidKernelSize(k));
            }
        }
        if self.dilation.0 == 0 || self.dilation.1 == 0 {
            return Err(ConfigError::NonPositive { name: "dilation" });
        }
        if self.groups == 0 || self.n_in % self.groups != 0 || self.n_out % self.groups != 0 {
            return Err(ConfigError::InvalidGroups {
                groups: self.groups,
                n_in: self.n_in,
                n_out: self.n_out,
            });
        }
        Ok(())
    }
}

pub struct NormActConv {
    pub bn: Option<BatchNorm2d>,
    pub conv: Conv2d,
    pub config: NormActConvConfig,
}

impl NormActConv {
    /// Registers `{name}.conv` and, with batch norm, `{name}.bn`.
    ///
    /// Batch norm runs over `n_in` channels in pre-activation order and
    /// over `n_out` channels in post-activation order, where it follows
    /// the convolution.
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        config: NormActConvConfig,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let bn = config.batchnorm.then(|| {
            let channels = if config.preactivation { config.n_in } else { config.n_out };
            BatchNorm2d::new(context, &format!("{}.bn", name), channels)
        });
        let conv = Conv2d::from_config(
            context,
            &format!("{}.conv", name),
            Conv2dConfig::new(config.n_in, config.n_out, config.kernel_size)
                .with_padding(config.padding())
                .with_dilation(config.dilation)
                .with_groups(config.groups)
                .with_bias(false),
        );
        Ok(Self { bn, conv, config })
    }

    pub fn out_channels(&self) -> usize {
        self.config.n_out
    }

    /// Forward pass with `activation` in place of the configured one.
    /// Gates use this to run a branch through tanh or sigmoid.
    pub fn forward_with(&self, x: &Tensor, activation: Option<Activation>) -> Tensor {
        let act = activation.unwrap_or(self.config.activation);
        let normalize = |t: Tensor| match &self.bn {
            Some(bn) => bn.forward(&t),
            None => t,
        };
        if self.config.preactivation {
            self.conv.forward(&act.apply(&normalize(x.clone())))
        } else {
            act.apply(&normalize(self.conv.forward(x)))
        }
    }
}

impl Module for NormActConv {
    fn forward(&self, x: &Tensor) -> Tensor {
        self.forward_with(x, None)
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.bn.as_ref().map(|bn| bn.parameters()).unwrap_or_default();
        params.extend(self.conv.parameters());
        params
    }

    fn set_training(&mut self, training: bool) {
        if let Some(bn) = &mut self.bn {
            bn.set_training(training);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::NodeType;

    #[test]
    fn padding_preserves_size() {
        let config = NormActConvConfig::new(4, 4);
        assert_eq!(config.padding(), (1, 1));
        assert_eq!(config.with_dilation((2, 3)).padding(), (2, 3));
        assert_eq!(config.with_kernel_size((5, 1)).with_dilation((2, 2)).padding(), (4, 0));
    }

    #[test]
    fn batchnorm_width_follows_ordering() {
        let ctx = GraphContext::shared(Default::default());
        let pre = NormActConv::new(&ctx, "pre", NormActConvConfig::new(4, 8).with_batchnorm(true)).unwrap();
        assert_eq!(pre.bn.as_ref().unwrap().num_features, 4);
        let post = NormActConv::new(
            &ctx,
            "post",
            NormActConvConfig::new(4, 8).with_batchnorm(true).with_preactivation(false),
        )
        .unwrap();
        assert_eq!(post.bn.as_ref().unwrap().num_features, 8);
        assert!(post.conv.bias.is_none());
    }

    #[test]
    fn gate_overrides_activation() {
        let ctx = GraphContext::shared(Default::default());
        let x = Tensor::new_input(&ctx, "x");
        let block = NormActConv::new(&ctx, "op", NormActConvConfig::new(4, 4).with_preactivation(false)).unwrap();
        let y = block.forward_with(&x, Some(Activation::Tanh));
        let graph = ctx.borrow().main_graph().clone();
        assert!(matches!(graph.get_node(y.node_id).unwrap().node_type, NodeType::Tanh(_)));
        let z = block.forward(&x);
        let graph = ctx.borrow().main_graph().clone();
        assert!(matches!(graph.get_node(z.node_id).unwrap().node_type, NodeType::ReLU(_)));
    }

    #[test]
    fn groups_must_divide_channels() {
        let ctx = GraphContext::shared(Default::default());
        let err = NormActConv::new(&ctx, "op", NormActConvConfig::new(6, 4).with_groups(4)).err();
        assert_eq!(
            err,
            Some(ConfigError::InvalidGroups {
                groups: 4,
                n_in: 6,
                n_out: 4
            })
        );
    }
}
