//! Wrappers that combine a sub-module's output with the wrapper's own
//! input, so residual and dense connections can be expressed as plain
//! modules.

use crate::nn::Module;
use crate::tensor::Tensor;

/// `x + m(x)`. Output shape equals input shape.
pub struct ElementwiseSum<M> {
    pub module: M,
}

impl<M: Module> ElementwiseSum<M> {
    pub fn new(module: M) -> Self {
        Self { module }
    }
}

impl<M: Module> Module for ElementwiseSum<M> {
    fn forward(&self, x: &Tensor) -> Tensor {
        x + &self.module.forward(x)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.module.parameters()
    }

    fn set_training(&mut self, training: bool) {
        self.module.set_training(training);
    }
}

/// `x * m(x)`. Output shape equals input shape.
pub struct ElementwiseProduct<M> {
    pub module: M,
}

impl<M: Module> ElementwiseProduct<M> {
    pub fn new(module: M) -> Self {
        Self { module }
    }
}

impl<M: Module> Module for ElementwiseProduct<M> {
    fn forward(&self, x: &Tensor) -> Tensor {
        x * &self.module.forward(x)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.module.parameters()
    }

    fn set_training(&mut self, training: bool) {
        self.module.set_training(training);
    }
}

/// `cat(x, m(x))` along the channel axis, as in DenseNet. Batch and
/// spatial dimensions of `x` and `m(x)` must agree.
pub struct ChannelConcat<M> {
    pub module: M,
}

impl<M: Module> ChannelConcat<M> {
    pub fn new(module: M) -> Self {
        Self { module }
    }
}

impl<M: Module> Module for ChannelConcat<M> {
    fn forward(&self, x: &Tensor) -> Tensor {
        let y = self.module.forward(x);
        Tensor::concat(&[x, &y], 1)
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.module.parameters()
    }

    fn set_training(&mut self, training: bool) {
        self.module.set_training(training);
    }
}
