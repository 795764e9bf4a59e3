//! Fully connected (linear) layer in the graph paradigm.

use crate::nn::init::ParamInit;
use crate::nn::module::Module;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Fully connected layer.
///
/// Holds no data: its `weights` `[in, out]` and `bias` `[out]` are
/// `Parameter` nodes of the ASG, and `forward` appends `y = xW + b`.
pub struct Linear {
    pub weights: Tensor,
    pub bias: Tensor,
    pub in_features: usize,
    pub out_features: usize,
}

impl Linear {
    /// Creates a linear layer with fan-in uniform weights and bias.
    ///
    /// Parameters are named `"{name}.weights"` and `"{name}.bias"`.
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        in_features: usize,
        out_features: usize,
        name: &str,
    ) -> Self {
        Self::with_bias_init(
            context,
            in_features,
            out_features,
            name,
            ParamInit::fan_in_uniform(in_features),
        )
    }

    /// Creates a linear layer with a custom bias initializer.
    pub fn with_bias_init(
        context: &Rc<RefCell<GraphContext>>,
        in_features: usize,
        out_features: usize,
        name: &str,
        bias_init: ParamInit,
    ) -> Self {
        let weights = Tensor::new_parameter(
            context,
            &format!("{}.weights", name),
            &[in_features, out_features],
            ParamInit::fan_in_uniform(in_features),
        );
        let bias = Tensor::new_parameter(context, &format!("{}.bias", name), &[out_features], bias_init);

        Self {
            weights,
            bias,
            in_features,
            out_features,
        }
    }
}

impl Module for Linear {
    /// Appends `inputs.dot(weights) + bias`; `inputs` is `[N, in]`.
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.dot(&self.weights) + &self.bias
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weights.clone(), self.bias.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_weights_and_bias() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let fc = Linear::with_bias_init(&ctx, 64, 110, "fc", ParamInit::Zeros);
        let specs = ctx.borrow().parameters().to_vec();
        assert_eq!(specs[0].shape, vec![64, 110]);
        assert_eq!(specs[1].init, ParamInit::Zeros);
        assert_eq!(fc.parameters().len(), 2);
    }
}
