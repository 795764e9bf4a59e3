//! Ordered container of modules.

use crate::nn::module::Module;
use crate::tensor::Tensor;

/// Applies its layers in order, like `nn.Sequential`.
#[derive(Default)]
pub struct Sequential {
    layers: Vec<Box<dyn Module>>,
}

impl std::fmt::Debug for Sequential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sequential(num_layers={})", self.layers.len())
    }
}

impl Sequential {
    pub fn new() -> Self {
        Self { layers: Vec::new() }
    }

    /// Appends a new layer to the sequence.
    pub fn push<M>(&mut self, layer: M)
    where
        M: Module + 'static,
    {
        self.layers.push(Box::new(layer));
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

impl Module for Sequential {
    fn forward(&self, input: &Tensor) -> Tensor {
        self.layers
            .iter()
            .fold(input.clone(), |activ, layer| layer.forward(&activ))
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.layers.iter().flat_map(|layer| layer.parameters()).collect()
    }

    fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::activations::Activation;
    use crate::nn::batchnorm::BatchNorm2d;
    use crate::tensor::GraphContext;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn chains_layers_and_collects_parameters() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let mut seq = Sequential::new();
        seq.push(BatchNorm2d::new(&ctx, "bn", 4));
        seq.push(Activation::Relu);
        assert_eq!(seq.len(), 2);
        assert_eq!(seq.parameters().len(), 2);

        seq.set_training(false);
        let x = Tensor::new_input(&ctx, "x");
        let _ = seq.forward(&x);
        assert!(ctx.borrow().buffer_updates().is_empty());
    }
}
