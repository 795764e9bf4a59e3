//! Random draws of [`LayerConfig`]s for architecture search.
//!
//! Categorical choices are weighted by softmax-normalized scores, so a
//! search space can bias sampling toward cheaper or more promising
//! settings without excluding the rest.

use crate::config::{GateStyle, LayerConfig, NormStyle};
use crate::error::ConfigError;
use crate::nn::Activation;
use rand::distributions::{Distribution, WeightedIndex};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Normalizes `scores` into probabilities. The maximum is subtracted
/// before exponentiation.
pub fn softmax(scores: &[f32]) -> Vec<f32> {
    let max = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}

/// A categorical choice with one score per option.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice<T> {
    pub options: Vec<T>,
    /// Unnormalized log-weights; uniform when empty.
    #[serde(default)]
    pub scores: Vec<f32>,
}

impl<T: Clone> Choice<T> {
    pub fn uniform(options: Vec<T>) -> Self {
        Self {
            options,
            scores: Vec::new(),
        }
    }

    pub fn weighted(options: Vec<T>, scores: Vec<f32>) -> Self {
        Self { options, scores }
    }

    fn sample<R: Rng + ?Sized>(&self, rng: &mut R, what: &str) -> Result<T, ConfigError> {
        let invalid = |reason: &str| ConfigError::InvalidSearchSpace(format!("{}: {}", what, reason));
        if self.options.is_empty() {
            return Err(invalid("no options"));
        }
        if self.scores.is_empty() {
            return self.options.choose(rng).cloned().ok_or_else(|| invalid("no options"));
        }
        if self.scores.len() != self.options.len() {
            return Err(invalid("score count differs from option count"));
        }
        let dist = WeightedIndex::new(softmax(&self.scores)).map_err(|e| invalid(&e.to_string()))?;
        Ok(self.options[dist.sample(rng)].clone())
    }
}

/// Where [`sample_layer_config`] draws from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub n_in: usize,
    pub n_out: usize,
    pub bottleneck: Choice<usize>,
    /// Probability that each of branches 1, 2 and 3 exists.
    pub op_probability: f64,
    /// Probability that each gate is on.
    pub gate_probability: f64,
    /// `(height, width)` pairs.
    pub dilation: Choice<(usize, usize)>,
    pub kernel_size: Choice<(usize, usize)>,
    pub activation: Choice<Activation>,
    pub groups: Choice<usize>,
    pub gate_style: GateStyle,
    pub norm_style: NormStyle,
    pub preactivation: bool,
    /// Draws before giving up on finding a valid topology.
    pub max_attempts: usize,
}

impl SearchSpace {
    pub fn new(n_in: usize, n_out: usize) -> Self {
        Self {
            n_in,
            n_out,
            bottleneck: Choice::uniform(vec![n_out / 2, n_out].into_iter().filter(|&c| c > 0).collect()),
            op_probability: 0.5,
            gate_probability: 0.5,
            dilation: Choice::weighted(vec![(1, 1), (2, 2), (3, 3)], vec![1.0, 0.5, 0.0]),
            kernel_size: Choice::weighted(vec![(3, 3), (5, 5), (7, 7)], vec![1.0, 0.5, 0.0]),
            activation: Choice::uniform(vec![Activation::Relu]),
            groups: Choice::uniform(vec![1, 2, 4]),
            gate_style: GateStyle::AddSplit,
            norm_style: NormStyle::Sandwich,
            preactivation: true,
            max_attempts: 100,
        }
    }
}

/// Draws a valid layer descriptor from `space`.
///
/// Topologies that fail validation are redrawn up to `max_attempts`
/// times; the last validation error is returned when all draws fail.
pub fn sample_layer_config<R: Rng + ?Sized>(rng: &mut R, space: &SearchSpace) -> Result<LayerConfig, ConfigError> {
    for (name, p) in [("op_probability", space.op_probability), ("gate_probability", space.gate_probability)] {
        if !(0.0..=1.0).contains(&p) {
            return Err(ConfigError::InvalidSearchSpace(format!("{} {} is outside [0, 1]", name, p)));
        }
    }

    let mut last_error = ConfigError::InvalidSearchSpace("max_attempts is zero".to_string());
    for attempt in 0..space.max_attempts {
        let n_bottle = space.bottleneck.sample(rng, "bottleneck")?;
        let mut config = LayerConfig::new(space.n_in, n_bottle, space.n_out)
            .with_gate_style(space.gate_style)
            .with_norm_style(space.norm_style)
            .with_preactivation(space.preactivation);

        config.ops = [true, false, false, false];
        for op in config.ops.iter_mut().skip(1) {
            *op = rng.gen_bool(space.op_probability);
        }
        for gate in config.gate.iter_mut() {
            *gate = rng.gen_bool(space.gate_probability);
        }
        for index in 0..4 {
            config.dilation[index] = space.dilation.sample(rng, "dilation")?;
            config.kernel_size[index] = space.kernel_size.sample(rng, "kernel_size")?;
            config.activation[index] = space.activation.sample(rng, "activation")?;
            config.groups[index] = space.groups.sample(rng, "groups")?;
        }

        match config.validate() {
            Ok(plan) => {
                debug!(attempt, ?plan, "sampled layer config");
                return Ok(config);
            }
            Err(err) => last_error = err,
        }
    }
    Err(last_error)
}
