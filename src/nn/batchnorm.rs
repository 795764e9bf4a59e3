//! Batch normalization over the channel axis of NCHW tensors.
//!
//! In training mode the layer normalizes with the statistics of the
//! current batch and registers running-statistic updates with the graph
//! context; the session folds them into the running buffers after every
//! run that evaluated them. In inference mode it normalizes with the
//! running buffers.

use crate::nn::init::ParamInit;
use crate::nn::Module;
use crate::tensor::{BufferUpdate, GraphContext, StatisticKind, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Small constant for numerical stability.
const EPS: f32 = 1e-5;

/// Momentum for the running-statistics update.
const DEFAULT_MOMENTUM: f32 = 0.1;

/// Axes reduced by the batch statistics: batch, height, width.
const REDUCE_AXES: [isize; 3] = [0, 2, 3];

/// Batch Normalization layer.
///
/// `y = gamma * (x - mean) / sqrt(var + eps) + beta`, per channel.
pub struct BatchNorm2d {
    /// Trainable scale, initialized to 1.
    pub gamma: Tensor,
    /// Trainable shift, initialized to 0.
    pub beta: Tensor,
    running_mean: Tensor,
    running_var: Tensor,
    pub num_features: usize,
    pub eps: f32,
    /// Momentum for exponential smoothing of running statistics.
    pub momentum: f32,
    /// Training mode flag.
    pub training: bool,
    /// Layer name (prefix of its parameter names).
    pub name: String,
}

impl BatchNorm2d {
    /// Creates a new BatchNorm layer over `num_features` channels.
    pub fn new(ctx: &Rc<RefCell<GraphContext>>, name: &str, num_features: usize) -> Self {
        let shape = [num_features];
        let gamma = Tensor::new_parameter(ctx, &format!("{}.gamma", name), &shape, ParamInit::Ones);
        let beta = Tensor::new_parameter(ctx, &format!("{}.beta", name), &shape, ParamInit::Zeros);
        let running_mean =
            Tensor::new_buffer(ctx, &format!("{}.running_mean", name), &shape, ParamInit::Zeros);
        let running_var =
            Tensor::new_buffer(ctx, &format!("{}.running_var", name), &shape, ParamInit::Ones);

        Self {
            gamma,
            beta,
            running_mean,
            running_var,
            num_features,
            eps: EPS,
            momentum: DEFAULT_MOMENTUM,
            training: true,
            name: name.to_string(),
        }
    }

    /// Creates a layer with the given momentum.
    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    fn channel_view(t: &Tensor) -> Tensor {
        t.reshape(vec![1, -1, 1, 1])
    }

    fn register_update(&self, x: &Tensor, statistic: &Tensor, kind: StatisticKind) {
        let buffer = match kind {
            StatisticKind::Mean => format!("{}.running_mean", self.name),
            StatisticKind::Variance => format!("{}.running_var", self.name),
        };
        x.context.borrow_mut().register_buffer_update(BufferUpdate {
            buffer,
            statistic: statistic.node_id,
            input: x.node_id,
            momentum: self.momentum,
            kind,
        });
    }
}

impl Module for BatchNorm2d {
    fn forward(&self, x: &Tensor) -> Tensor {
        let eps = Tensor::scalar(&x.context, self.eps);
        let normalized = if self.training {
            let mean = x.mean_axes(&REDUCE_AXES);
            let centered = x - &mean;
            let variance = (&centered * &centered).mean_axes(&REDUCE_AXES);
            self.register_update(x, &mean, StatisticKind::Mean);
            self.register_update(x, &variance, StatisticKind::Variance);
            centered / &(&variance + &eps).sqrt()
        } else {
            let mean = Self::channel_view(&self.running_mean);
            let variance = Self::channel_view(&self.running_var);
            (x - &mean) / &(&variance + &eps).sqrt()
        };

        normalized * &Self::channel_view(&self.gamma) + &Self::channel_view(&self.beta)
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.gamma.clone(), self.beta.clone()]
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batchnorm_creation() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let bn = BatchNorm2d::new(&ctx, "bn1", 16);

        assert_eq!(bn.name, "bn1");
        assert!(bn.training);
        assert_eq!(bn.parameters().len(), 2);
        // gamma, beta and the two running buffers
        assert_eq!(ctx.borrow().parameters().len(), 4);
    }

    #[test]
    fn test_batchnorm_train_eval() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let mut bn = BatchNorm2d::new(&ctx, "bn1", 4);

        bn.eval();
        assert!(!bn.training);

        bn.set_training(true);
        assert!(bn.training);
    }

    #[test]
    fn only_training_graph_registers_updates() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let mut bn = BatchNorm2d::new(&ctx, "bn1", 4);
        let x = Tensor::new_input(&ctx, "x");
        bn.eval();
        let _ = bn.forward(&x);
        assert!(ctx.borrow().buffer_updates().is_empty());
        bn.train();
        let _ = bn.forward(&x);
        assert_eq!(ctx.borrow().buffer_updates().len(), 2);
    }
}
