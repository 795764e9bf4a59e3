//! Wide residual network with a mixture-of-softmaxes classifier head.
//!
//! Three groups of pre-activation residual blocks widen the stem's 16
//! channels to `16k`, `32k` and `64k`; groups two and three halve the
//! spatial size. The head projects pooled features to
//! `(num_classes + 1) * n_components` logits: one class block per
//! component followed by `n_components` prior logits.

use crate::config::WideResNetConfig;
use crate::error::{ConfigError, Result};
use crate::nn::{BatchNorm2d, Conv2d, Conv2dConfig, Dropout, GlobalAvgPool2d, Linear, Module, ParamInit};
use crate::optimizers::{Optimizer, Sgd};
use crate::runtime::session::{Feeds, Session};
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::f32::consts::PI;
use std::rc::Rc;
use tracing::{debug, info};

fn conv(
    context: &Rc<RefCell<GraphContext>>,
    name: &str,
    in_planes: usize,
    out_planes: usize,
    kernel: usize,
    stride: usize,
) -> Conv2d {
    Conv2d::from_config(
        context,
        name,
        Conv2dConfig::new(in_planes, out_planes, (kernel, kernel))
            .with_stride((stride, stride))
            .with_padding((kernel / 2, kernel / 2))
            .with_bias(false)
            .with_init(ParamInit::KaimingNormalFanOut),
    )
}

/// Pre-activation residual block: `bn -> relu -> conv3x3 -> bn -> relu ->
/// [dropout] -> conv3x3`.
///
/// With equal channel counts the identity shortcut adds the block's raw
/// input. Otherwise a strided 1x1 projection of the pre-activated input
/// is added instead.
pub struct BasicBlock {
    pub bn1: BatchNorm2d,
    pub conv1: Conv2d,
    pub bn2: BatchNorm2d,
    pub dropout: Dropout,
    pub conv2: Conv2d,
    /// Present only when the channel count changes.
    pub shortcut: Option<Conv2d>,
    pub in_planes: usize,
    pub out_planes: usize,
    pub stride: usize,
}

impl BasicBlock {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_planes: usize,
        out_planes: usize,
        stride: usize,
        drop_rate: f32,
    ) -> std::result::Result<Self, ConfigError> {
        if stride == 0 {
            return Err(ConfigError::NonPositive { name: "stride" });
        }
        let shortcut = (in_planes != out_planes)
            .then(|| conv(context, &format!("{}.shortcut", name), in_planes, out_planes, 1, stride));
        Ok(Self {
            bn1: BatchNorm2d::new(context, &format!("{}.bn1", name), in_planes),
            conv1: conv(context, &format!("{}.conv1", name), in_planes, out_planes, 3, stride),
            bn2: BatchNorm2d::new(context, &format!("{}.bn2", name), out_planes),
            dropout: Dropout::new(drop_rate)?,
            conv2: conv(context, &format!("{}.conv2", name), out_planes, out_planes, 3, 1),
            shortcut,
            in_planes,
            out_planes,
            stride,
        })
    }
}

impl Module for BasicBlock {
    fn forward(&self, x: &Tensor) -> Tensor {
        let pre = self.bn1.forward(x).relu();
        let hidden = self.bn2.forward(&self.conv1.forward(&pre)).relu();
        let branch = self.conv2.forward(&self.dropout.forward(&hidden));
        match &self.shortcut {
            Some(projection) => projection.forward(&pre) + &branch,
            None => x + &branch,
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.bn1.parameters();
        params.extend(self.conv1.parameters());
        params.extend(self.bn2.parameters());
        params.extend(self.conv2.parameters());
        if let Some(projection) = &self.shortcut {
            params.extend(projection.parameters());
        }
        params
    }

    fn set_training(&mut self, training: bool) {
        self.bn1.set_training(training);
        self.bn2.set_training(training);
        self.dropout.set_training(training);
    }
}

/// Symbolic outputs of the mixture head.
pub struct MixtureOutput {
    /// `[N, num_classes]` log-probabilities.
    pub log_probs: Tensor,
    /// `[N, n_components]` mixture weights.
    pub priors: Tensor,
}

pub struct WideResNetMos {
    pub conv1: Conv2d,
    /// The three block groups, in order.
    pub groups: Vec<Vec<BasicBlock>>,
    pub bn: BatchNorm2d,
    pub pool: GlobalAvgPool2d,
    pub fc: Linear,
    config: WideResNetConfig,
    optimizer: Sgd,
    /// Schedule step, advanced by every `update_lr` call.
    iteration: usize,
}

impl WideResNetMos {
    pub fn new(context: &Rc<RefCell<GraphContext>>, config: WideResNetConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;
        let channels = config.channels();
        let n = config.blocks_per_group();

        let conv1 = conv(context, "conv1", 3, channels[0], 3, 1);
        let mut groups = Vec::with_capacity(3);
        for (g, stride) in [1usize, 2, 2].into_iter().enumerate() {
            let blocks = (0..n)
                .map(|i| {
                    let in_planes = if i == 0 { channels[g] } else { channels[g + 1] };
                    BasicBlock::new(
                        context,
                        &format!("block{}.{}", g + 1, i),
                        in_planes,
                        channels[g + 1],
                        if i == 0 { stride } else { 1 },
                        config.drop_rate,
                    )
                })
                .collect::<std::result::Result<Vec<_>, _>>()?;
            groups.push(blocks);
        }

        let bn = BatchNorm2d::new(context, "bn1", channels[3]);
        let head_width = (config.num_classes + 1) * config.n_components;
        let fc = Linear::with_bias_init(context, channels[3], head_width, "fc", ParamInit::Zeros);

        debug!(
            depth = config.depth,
            widen_factor = config.widen_factor,
            blocks = 3 * n,
            head_width,
            "built wide resnet"
        );
        Ok(Self {
            conv1,
            groups,
            bn,
            pool: GlobalAvgPool2d::new(channels[3]),
            fc,
            optimizer: Sgd::new(config.optimizer),
            config,
            iteration: 0,
        })
    }

    pub fn config(&self) -> &WideResNetConfig {
        &self.config
    }

    /// Number of residual blocks across all groups.
    pub fn block_count(&self) -> usize {
        self.groups.iter().map(Vec::len).sum()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BasicBlock> {
        self.groups.iter().flatten()
    }

    /// Head logits `[N, (num_classes + 1) * n_components]`.
    pub fn logits(&self, x: &Tensor) -> Tensor {
        let mut out = self.conv1.forward(x);
        for block in self.blocks() {
            out = block.forward(&out);
        }
        let features = self.pool.forward(&self.bn.forward(&out).relu());
        self.fc.forward(&features)
    }

    /// Mixture log-probabilities together with the priors.
    ///
    /// The mixture is summed in probability space and then logged:
    /// `ln(sum_i prior_i * softmax(logits[:, i*C..(i+1)*C]))`.
    pub fn forward_mixture(&self, x: &Tensor) -> MixtureOutput {
        let logits = self.logits(x);
        let (c, k) = (self.config.num_classes, self.config.n_components);

        let priors = logits.slice(1, c * k, None, 1).softmax();
        let mixture = (0..k).fold(Tensor::scalar(&x.context, 0.0), |acc, i| {
            let component = logits.slice(1, i * c, Some((i + 1) * c), 1).softmax();
            acc + &(priors.slice(1, i, Some(i + 1), 1) * &component)
        });

        MixtureOutput {
            log_probs: mixture.log(),
            priors,
        }
    }

    pub fn optimizer(&self) -> &Sgd {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut Sgd {
        &mut self.optimizer
    }

    pub fn learning_rate(&self) -> f32 {
        self.optimizer.learning_rate()
    }

    pub fn iteration(&self) -> usize {
        self.iteration
    }

    /// Sets the optimizer's learning rate to
    /// `0.5 * base_lr * (1 + cos(pi * j / max_iterations))` for the
    /// current step `j`, then advances `j`. Returns the new rate.
    pub fn update_lr(&mut self, max_iterations: usize) -> std::result::Result<f32, ConfigError> {
        if max_iterations == 0 {
            return Err(ConfigError::InvalidSchedule("max_iterations must be positive".to_string()));
        }
        let progress = self.iteration as f32 / max_iterations as f32;
        let lr = 0.5 * self.config.optimizer.lr * (1.0 + (PI * progress).cos());
        self.optimizer.set_learning_rate(lr);
        self.iteration += 1;
        Ok(lr)
    }

    /// Computes gradients of `loss` for every trainable parameter and
    /// applies one optimizer step. Returns the loss before the step.
    pub fn step(&mut self, session: &mut Session, feeds: &Feeds, loss: &Tensor) -> Result<f32> {
        let (value, grads) = session.gradients(feeds, loss)?;
        self.optimizer.step(session.params_mut(), &grads)?;
        info!(loss = value, lr = self.learning_rate(), iteration = self.iteration, "optimizer step");
        Ok(value)
    }
}

impl Module for WideResNetMos {
    fn forward(&self, x: &Tensor) -> Tensor {
        self.forward_mixture(x).log_probs
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.conv1.parameters();
        params.extend(self.blocks().flat_map(|block| block.parameters()));
        params.extend(self.bn.parameters());
        params.extend(self.fc.parameters());
        params
    }

    fn set_training(&mut self, training: bool) {
        for block in self.groups.iter_mut().flatten() {
            block.set_training(training);
        }
        self.bn.set_training(training);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn small() -> WideResNetConfig {
        WideResNetConfig {
            depth: 10,
            widen_factor: 1,
            num_classes: 4,
            n_components: 3,
            ..Default::default()
        }
    }

    #[test]
    fn shortcut_only_when_channels_change() {
        let ctx = GraphContext::shared(Default::default());
        let net = WideResNetMos::new(&ctx, small()).unwrap();
        let shortcuts: Vec<bool> = net.blocks().map(|b| b.shortcut.is_some()).collect();
        // 16 -> 16 is an identity, 16 -> 32 and 32 -> 64 project.
        assert_eq!(shortcuts, vec![false, true, true]);
        assert_eq!(net.block_count(), 3);
    }

    #[test]
    fn head_width_and_initializers() {
        let ctx = GraphContext::shared(Default::default());
        let _net = WideResNetMos::new(&ctx, small()).unwrap();
        let specs = ctx.borrow().parameters().to_vec();
        let find = |name: &str| specs.iter().find(|s| s.name == name).cloned().unwrap();
        assert_eq!(find("fc.weights").shape, vec![64, 15]);
        assert_eq!(find("fc.bias").init, ParamInit::Zeros);
        assert_eq!(find("conv1.weight").init, ParamInit::KaimingNormalFanOut);
        assert_eq!(find("block2.0.shortcut.weight").shape, vec![32, 16, 1, 1]);
        assert_eq!(find("bn1.gamma").init, ParamInit::Ones);
    }

    #[test]
    fn cosine_schedule() {
        let ctx = GraphContext::shared(Default::default());
        let mut net = WideResNetMos::new(&ctx, small()).unwrap();
        assert_relative_eq!(net.update_lr(4).unwrap(), 0.1);
        assert_relative_eq!(net.update_lr(4).unwrap(), 0.05 * (1.0 + (PI / 4.0).cos()), epsilon = 1e-6);
        net.update_lr(4).unwrap();
        net.update_lr(4).unwrap();
        assert_relative_eq!(net.update_lr(4).unwrap(), 0.0, epsilon = 1e-6);
        assert_eq!(net.iteration(), 5);
        assert_relative_eq!(net.learning_rate(), 0.0, epsilon = 1e-6);
        assert!(net.update_lr(0).is_err());
    }
}
