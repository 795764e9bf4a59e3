//! Serializable construction descriptors for the network and its layers.
//!
//! Both descriptors deserialize with per-field defaults, so a JSON file
//! only has to name the fields it changes.

use crate::error::{ConfigError, Result};
use crate::nn::Activation;
use crate::optimizers::SgdConfig;
use crate::smash::layer::ExecutionPlan;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Reads a JSON descriptor from `path`.
pub fn load_json<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

/// Hyperparameters of [`WideResNetMos`](crate::models::WideResNetMos).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WideResNetConfig {
    /// Total depth; `(depth - 4)` must be a positive multiple of 6.
    pub depth: usize,
    /// Channel multiplier for the three block groups.
    pub widen_factor: usize,
    pub num_classes: usize,
    /// Number of training epochs the schedule is planned for.
    pub epochs: usize,
    /// Dropout between the two convolutions of every block.
    pub drop_rate: f32,
    /// Number of softmax components in the mixture head.
    pub n_components: usize,
    pub optimizer: SgdConfig,
}

impl Default for WideResNetConfig {
    fn default() -> Self {
        Self {
            depth: 28,
            widen_factor: 10,
            num_classes: 10,
            epochs: 200,
            drop_rate: 0.0,
            n_components: 10,
            optimizer: SgdConfig::default(),
        }
    }
}

impl WideResNetConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.depth <= 4 || (self.depth - 4) % 6 != 0 {
            return Err(ConfigError::InvalidDepth(self.depth));
        }
        if self.widen_factor == 0 {
            return Err(ConfigError::NonPositive { name: "widen_factor" });
        }
        if self.num_classes == 0 {
            return Err(ConfigError::NonPositive { name: "num_classes" });
        }
        if self.n_components == 0 {
            return Err(ConfigError::NonPositive { name: "n_components" });
        }
        if !(0.0..1.0).contains(&self.drop_rate) {
            return Err(ConfigError::InvalidDropout(self.drop_rate));
        }
        Ok(())
    }

    /// Residual blocks per group.
    pub fn blocks_per_group(&self) -> usize {
        self.depth.saturating_sub(4) / 6
    }

    /// Channel widths: stem, then the three groups.
    pub fn channels(&self) -> [usize; 4] {
        let k = self.widen_factor;
        [16, 16 * k, 32 * k, 64 * k]
    }
}

/// How two gated branches are combined.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStyle {
    /// `tanh(a) * sigmoid(b)`, each nonlinearity applied inside its branch.
    Mult,
    /// `s = a + b`, then `tanh(s[even channels]) * sigmoid(s[odd channels])`.
    #[default]
    AddSplit,
}

/// Where batch normalization sits in a [`GatedLayer`](crate::smash::GatedLayer).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormStyle {
    /// Only around the 1x1 bottleneck convolution's input.
    Before,
    /// Before the 1x1 convolution and again after it.
    #[default]
    Sandwich,
    /// Inside every branch as well.
    Full,
    /// No batch norm; the 1x1 kernel is weight-normalized instead.
    WeightNorm,
}

/// Descriptor of a four-branch gated layer.
///
/// Branches 0 and 2 read the bottleneck output, branches 1 and 3 read
/// stage 0's output. Per-branch arrays are indexed by branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayerConfig {
    pub n_in: usize,
    pub n_bottle: usize,
    pub n_out: usize,
    /// Which branches exist.
    pub ops: [bool; 4],
    /// Gate flags for stage 0 (branches 0, 2) and stage 1 (branches 1, 3).
    pub gate: [bool; 2],
    /// `(height, width)` dilation per branch.
    pub dilation: [(usize, usize); 4],
    pub activation: [Activation; 4],
    /// `(height, width)` kernel size per branch; both must be odd.
    pub kernel_size: [(usize, usize); 4],
    pub groups: [usize; 4],
    pub preactivation: bool,
    pub gate_style: GateStyle,
    pub norm_style: NormStyle,
}

impl Default for LayerConfig {
    fn default() -> Self {
        Self {
            n_in: 16,
            n_bottle: 16,
            n_out: 16,
            ops: [true, false, false, false],
            gate: [false, false],
            dilation: [(1, 1); 4],
            activation: [Activation::Relu; 4],
            kernel_size: [(3, 3); 4],
            groups: [1; 4],
            preactivation: true,
            gate_style: GateStyle::AddSplit,
            norm_style: NormStyle::Sandwich,
        }
    }
}

impl LayerConfig {
    pub fn new(n_in: usize, n_bottle: usize, n_out: usize) -> Self {
        Self {
            n_in,
            n_bottle,
            n_out,
            ..Default::default()
        }
    }

    pub fn with_ops(mut self, ops: [bool; 4]) -> Self {
        self.ops = ops;
        self
    }

    pub fn with_gate(mut self, gate: [bool; 2]) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_gate_style(mut self, style: GateStyle) -> Self {
        self.gate_style = style;
        self
    }

    pub fn with_norm_style(mut self, style: NormStyle) -> Self {
        self.norm_style = style;
        self
    }

    pub fn with_preactivation(mut self, preactivation: bool) -> Self {
        self.preactivation = preactivation;
        self
    }

    /// Input channel count of branch `index`.
    pub fn branch_in_channels(&self, index: usize) -> usize {
        if index % 2 == 0 {
            self.n_bottle
        } else {
            self.n_out
        }
    }

    /// Checks widths and per-branch settings, then resolves the branch
    /// topology.
    pub fn validate(&self) -> std::result::Result<ExecutionPlan, ConfigError> {
        for (name, value) in [("n_in", self.n_in), ("n_bottle", self.n_bottle), ("n_out", self.n_out)] {
            if value == 0 {
                return Err(ConfigError::NonPositive { name });
            }
        }
        let plan = ExecutionPlan::resolve(self)?;
        for index in (0..4).filter(|&i| self.ops[i]) {
            let (dh, dw) = self.dilation[index];
            if dh == 0 || dw == 0 {
                return Err(ConfigError::NonPositive { name: "dilation" });
            }
            let (kh, kw) = self.kernel_size[index];
            for k in [kh, kw] {
                if k == 0 || k % 2 == 0 {
                    return Err(ConfigError::InvalidKernelSize(k));
                }
            }
            let (groups, n_in, n_out) = (self.groups[index], self.branch_in_channels(index), self.n_out);
            if groups == 0 || n_in % groups != 0 || n_out % groups != 0 {
                return Err(ConfigError::InvalidGroups { groups, n_in, n_out });
            }
        }
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_network_config_is_valid() {
        let config = WideResNetConfig::default();
        config.validate().unwrap();
        assert_eq!(config.blocks_per_group(), 4);
        assert_eq!(config.channels(), [16, 160, 320, 640]);
    }

    #[test]
    fn rejects_bad_depths() {
        for depth in [0, 4, 15, 29] {
            let config = WideResNetConfig {
                depth,
                ..Default::default()
            };
            assert_eq!(config.validate(), Err(ConfigError::InvalidDepth(depth)));
        }
    }

    #[test]
    fn partial_json_uses_defaults() {
        let config: WideResNetConfig = serde_json::from_str(r#"{"depth": 10, "widen_factor": 2}"#).unwrap();
        assert_eq!(config.depth, 10);
        assert_eq!(config.n_components, 10);
        assert_eq!(config.optimizer, SgdConfig::default());
    }

    #[test]
    fn branch_arrays_must_have_four_entries() {
        let err = serde_json::from_str::<LayerConfig>(r#"{"ops": [true, false, true]}"#);
        assert!(err.is_err());
        let ok: LayerConfig =
            serde_json::from_str(r#"{"ops": [true, false, true, false], "gate_style": "mult"}"#).unwrap();
        assert_eq!(ok.gate_style, GateStyle::Mult);
    }

    #[test]
    fn per_axis_geometry_reads_from_pairs() {
        let config: LayerConfig = serde_json::from_str(
            r#"{"kernel_size": [[3, 5], [3, 3], [1, 3], [3, 3]], "dilation": [[1, 2], [1, 1], [3, 1], [1, 1]]}"#,
        )
        .unwrap();
        assert_eq!(config.kernel_size[0], (3, 5));
        assert_eq!(config.dilation[2], (3, 1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_even_kernels_and_bad_groups() {
        let mut config = LayerConfig::new(8, 8, 12);
        config.kernel_size[0] = (3, 4);
        assert_eq!(config.validate(), Err(ConfigError::InvalidKernelSize(4)));

        let mut config = LayerConfig::new(8, 8, 12);
        config.dilation[0] = (2, 0);
        assert_eq!(config.validate(), Err(ConfigError::NonPositive { name: "dilation" }));

        let mut config = LayerConfig::new(8, 8, 12);
        config.groups[0] = 8;
        assert_eq!(
            config.validate(),
            Err(ConfigError::InvalidGroups {
                groups: 8,
                n_in: 8,
                n_out: 12
            })
        );
    }

    #[test]
    fn settings_of_absent_branches_are_ignored() {
        let mut config = LayerConfig::new(8, 8, 8);
        config.kernel_size[3] = (2, 2);
        config.groups[3] = 0;
        assert!(config.validate().is_ok());
    }
}
