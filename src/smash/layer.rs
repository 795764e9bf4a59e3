//! Fixed-structure gated layer with up to four convolutional branches.
//!
//! ```text
//!            x
//!            |
//!      bottleneck (1x1 conv, norm per NormStyle)
//!        /        \
//!     op0          op2          stage 0: Single | Dual | Gated
//!        \        /
//!     op1          op3          stage 1: PassThrough | Single | Sum | Gated
//!        \        /
//!           out
//! ```
//!
//! The branch topology is resolved once at construction into an
//! [`ExecutionPlan`]. Branch modules are stored inside the stage variants
//! that use them, so `forward` never checks for branch presence.

use crate::config::{GateStyle, LayerConfig, NormStyle};
use crate::error::ConfigError;
use crate::nn::{Activation, BatchNorm2d, Conv2d, Conv2dConfig, Module, Sequential};
use crate::smash::seq::{NormActConv, NormActConvConfig};
use crate::smash::weight_norm::WeightNormConv2d;
use crate::tensor::{GraphContext, Tensor};
use serde::Serialize;
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

/// How stage 0 combines branches 0 and 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage0Plan {
    /// Branch 0 alone.
    Single,
    /// Branches 0 and 2 kept apart as a pair for stage 1.
    Dual,
    Gated(GateStyle),
}

/// How stage 1 combines branches 1 and 3 with stage 0's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage1Plan {
    /// No stage-1 branch; a pair is summed.
    PassThrough,
    /// Branch 1 alone; a pair becomes `op1(a) + b`.
    Single,
    /// `op1 + op3`.
    Sum,
    Gated(GateStyle),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutionPlan {
    pub stage0: Stage0Plan,
    pub stage1: Stage1Plan,
}

impl ExecutionPlan {
    /// Resolves the `ops` x `gate` flags of `config`, rejecting every
    /// combination whose data flow cannot be executed.
    pub fn resolve(config: &LayerConfig) -> Result<Self, ConfigError> {
        let [op0, op1, op2, op3] = config.ops;
        let [gate0, gate1] = config.gate;
        let reject = |reason: &str| Err(ConfigError::InvalidTopology(reason.to_string()));

        if !op0 {
            return reject("branch 0 is required");
        }
        if gate0 && !op2 {
            return reject("gate 0 needs branch 2");
        }
        if gate1 && !(op1 && op3) {
            return reject("gate 1 needs branches 1 and 3");
        }
        if op3 && !op1 {
            return reject("branch 3 needs branch 1");
        }

        let stage0 = if gate0 {
            Stage0Plan::Gated(config.gate_style)
        } else if op2 {
            Stage0Plan::Dual
        } else {
            Stage0Plan::Single
        };
        let stage1 = if gate1 {
            Stage1Plan::Gated(config.gate_style)
        } else if op3 {
            Stage1Plan::Sum
        } else if op1 {
            Stage1Plan::Single
        } else {
            Stage1Plan::PassThrough
        };

        if config.gate_style == GateStyle::AddSplit && (gate0 || gate1) && config.n_out % 2 != 0 {
            return Err(ConfigError::OddSplitChannels(config.n_out));
        }
        if stage0 == Stage0Plan::Gated(GateStyle::AddSplit) && stage1 != Stage1Plan::PassThrough {
            return reject("stage-1 branches expect n_out channels but an add-split gate yields n_out / 2");
        }

        Ok(Self { stage0, stage1 })
    }

    /// Channels produced by a layer with `n_out` branch channels.
    pub fn out_channels(&self, n_out: usize) -> usize {
        let split = match self.stage1 {
            Stage1Plan::Gated(style) => style == GateStyle::AddSplit,
            Stage1Plan::PassThrough => self.stage0 == Stage0Plan::Gated(GateStyle::AddSplit),
            Stage1Plan::Single | Stage1Plan::Sum => false,
        };
        if split {
            n_out / 2
        } else {
            n_out
        }
    }
}

/// Two branches combined by a gate.
pub struct Gate {
    pub style: GateStyle,
    pub a: NormActConv,
    pub b: NormActConv,
}

impl Gate {
    fn forward(&self, a_in: &Tensor, b_in: &Tensor) -> Tensor {
        match self.style {
            GateStyle::Mult => {
                self.a.forward_with(a_in, Some(Activation::Tanh))
                    * &self.b.forward_with(b_in, Some(Activation::Sigmoid))
            }
            GateStyle::AddSplit => split_gate(&(self.a.forward(a_in) + &self.b.forward(b_in))),
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.a.parameters();
        params.extend(self.b.parameters());
        params
    }

    fn set_training(&mut self, training: bool) {
        self.a.set_training(training);
        self.b.set_training(training);
    }
}

/// `tanh(s[:, 0::2]) * sigmoid(s[:, 1::2])`.
pub fn split_gate(pre_gate: &Tensor) -> Tensor {
    let even = pre_gate.slice(1, 0, None, 2);
    let odd = pre_gate.slice(1, 1, None, 2);
    even.tanh() * &odd.sigmoid()
}

pub enum Stage0 {
    Single(NormActConv),
    Dual(NormActConv, NormActConv),
    Gated(Gate),
}

pub enum Stage1 {
    PassThrough,
    Single(NormActConv),
    Sum(NormActConv, NormActConv),
    Gated(Gate),
}

/// Output of stage 0: one tensor, or the two ungated branch outputs.
enum Flow {
    One(Tensor),
    Pair(Tensor, Tensor),
}

pub struct GatedLayer {
    config: LayerConfig,
    plan: ExecutionPlan,
    bottleneck: Sequential,
    stage0: Stage0,
    stage1: Stage1,
}

impl GatedLayer {
    /// Validates `config` and registers the layer's parameters under
    /// `name`: `{name}.bn1`, `{name}.conv1`, `{name}.bn2` and
    /// `{name}.op{i}.*` for each branch.
    pub fn new(context: &Rc<RefCell<GraphContext>>, name: &str, config: LayerConfig) -> Result<Self, ConfigError> {
        let plan = config.validate()?;
        let bottleneck = build_bottleneck(context, name, &config);

        let branch = |index: usize| -> Result<NormActConv, ConfigError> {
            NormActConv::new(
                context,
                &format!("{}.op{}", name, index),
                NormActConvConfig::new(config.branch_in_channels(index), config.n_out)
                    .with_kernel_size(config.kernel_size[index])
                    .with_dilation(config.dilation[index])
                    .with_preactivation(config.preactivation)
                    .with_batchnorm(config.norm_style == NormStyle::Full)
                    .with_groups(config.groups[index])
                    .with_activation(config.activation[index]),
            )
        };
        let gate = |style: GateStyle, a: usize, b: usize| -> Result<Gate, ConfigError> {
            Ok(Gate {
                style,
                a: branch(a)?,
                b: branch(b)?,
            })
        };

        let stage0 = match plan.stage0 {
            Stage0Plan::Single => Stage0::Single(branch(0)?),
            Stage0Plan::Dual => Stage0::Dual(branch(0)?, branch(2)?),
            Stage0Plan::Gated(style) => Stage0::Gated(gate(style, 0, 2)?),
        };
        let stage1 = match plan.stage1 {
            Stage1Plan::PassThrough => Stage1::PassThrough,
            Stage1Plan::Single => Stage1::Single(branch(1)?),
            Stage1Plan::Sum => Stage1::Sum(branch(1)?, branch(3)?),
            Stage1Plan::Gated(style) => Stage1::Gated(gate(style, 1, 3)?),
        };

        debug!(layer = name, ?plan, out_channels = plan.out_channels(config.n_out), "built gated layer");
        Ok(Self {
            config,
            plan,
            bottleneck,
            stage0,
            stage1,
        })
    }

    pub fn plan(&self) -> ExecutionPlan {
        self.plan
    }

    pub fn config(&self) -> &LayerConfig {
        &self.config
    }

    pub fn out_channels(&self) -> usize {
        self.plan.out_channels(self.config.n_out)
    }

    fn run_stage0(&self, x: &Tensor) -> Flow {
        match &self.stage0 {
            Stage0::Single(op0) => Flow::One(op0.forward(x)),
            Stage0::Dual(op0, op2) => Flow::Pair(op0.forward(x), op2.forward(x)),
            Stage0::Gated(gate) => Flow::One(gate.forward(x, x)),
        }
    }

    fn run_stage1(&self, flow: Flow) -> Tensor {
        match (&self.stage1, flow) {
            (Stage1::PassThrough, Flow::One(t)) => t,
            (Stage1::PassThrough, Flow::Pair(a, b)) => a + &b,
            (Stage1::Single(op1), Flow::One(t)) => op1.forward(&t),
            (Stage1::Single(op1), Flow::Pair(a, b)) => op1.forward(&a) + &b,
            (Stage1::Sum(op1, op3), Flow::One(t)) => op1.forward(&t) + &op3.forward(&t),
            (Stage1::Sum(op1, op3), Flow::Pair(a, b)) => op1.forward(&a) + &op3.forward(&b),
            (Stage1::Gated(gate), Flow::One(t)) => gate.forward(&t, &t),
            (Stage1::Gated(gate), Flow::Pair(a, b)) => gate.forward(&a, &b),
        }
    }
}

/// 1x1 bottleneck from `n_in` to `n_bottle` channels.
fn build_bottleneck(context: &Rc<RefCell<GraphContext>>, name: &str, config: &LayerConfig) -> Sequential {
    let conv_config = Conv2dConfig::new(config.n_in, config.n_bottle, (1, 1)).with_bias(false);
    let conv_name = format!("{}.conv1", name);
    let mut ops = Sequential::new();

    if config.norm_style == NormStyle::WeightNorm {
        let conv = WeightNormConv2d::new(context, &conv_name, conv_config);
        if config.preactivation {
            ops.push(Activation::Relu);
            ops.push(conv);
        } else {
            ops.push(conv);
            ops.push(Activation::Relu);
        }
    } else {
        let bn_name = format!("{}.bn1", name);
        if config.preactivation {
            ops.push(BatchNorm2d::new(context, &bn_name, config.n_in));
            ops.push(Activation::Relu);
            ops.push(Conv2d::from_config(context, &conv_name, conv_config));
        } else {
            ops.push(Conv2d::from_config(context, &conv_name, conv_config));
            ops.push(BatchNorm2d::new(context, &bn_name, config.n_bottle));
            ops.push(Activation::Relu);
        }
    }

    if config.norm_style == NormStyle::Sandwich {
        ops.push(BatchNorm2d::new(context, &format!("{}.bn2", name), config.n_bottle));
    }
    ops
}

impl Module for GatedLayer {
    fn forward(&self, x: &Tensor) -> Tensor {
        let bottleneck = self.bottleneck.forward(x);
        self.run_stage1(self.run_stage0(&bottleneck))
    }

    fn parameters(&self) -> Vec<Tensor> {
        let mut params = self.bottleneck.parameters();
        match &self.stage0 {
            Stage0::Single(op) => params.extend(op.parameters()),
            Stage0::Dual(a, b) => {
                params.extend(a.parameters());
                params.extend(b.parameters());
            }
            Stage0::Gated(gate) => params.extend(gate.parameters()),
        }
        match &self.stage1 {
            Stage1::PassThrough => {}
            Stage1::Single(op) => params.extend(op.parameters()),
            Stage1::Sum(a, b) => {
                params.extend(a.parameters());
                params.extend(b.parameters());
            }
            Stage1::Gated(gate) => params.extend(gate.parameters()),
        }
        params
    }

    fn set_training(&mut self, training: bool) {
        self.bottleneck.set_training(training);
        match &mut self.stage0 {
            Stage0::Single(op) => op.set_training(training),
            Stage0::Dual(a, b) => {
                a.set_training(training);
                b.set_training(training);
            }
            Stage0::Gated(gate) => gate.set_training(training),
        }
        match &mut self.stage1 {
            Stage1::PassThrough => {}
            Stage1::Single(op) => op.set_training(training),
            Stage1::Sum(a, b) => {
                a.set_training(training);
                b.set_training(training);
            }
            Stage1::Gated(gate) => gate.set_training(training),
        }
    }
}
