//! # SMASH layer library
//!
//! Composable building blocks for networks sampled by one-shot
//! architecture search:
//!
//! - [`ElementwiseSum`], [`ElementwiseProduct`], [`ChannelConcat`]: wrap a
//!   module and combine its output with its input
//! - [`WeightNormConv2d`]: convolution with a globally normalized kernel
//! - [`NormActConv`]: `(BN) -> act -> conv` or `conv -> (BN) -> act`
//! - [`GatedLayer`]: bottleneck plus up to four branches in two gated stages
//! - [`Transition`]: `bn -> relu -> conv1x1 -> avgpool`
//! - [`MultiscaleDilatedConv2d`]: stencil-masked multiscale kernel
//! - [`sampling`]: random draws of valid layer descriptors

pub mod combinators;
pub mod layer;
pub mod multiscale;
pub mod sampling;
pub mod seq;
pub mod transition;
pub mod weight_norm;

pub use crate::config::{GateStyle, LayerConfig, NormStyle};
pub use combinators::{ChannelConcat, ElementwiseProduct, ElementwiseSum};
pub use layer::{ExecutionPlan, GatedLayer, Stage0Plan, Stage1Plan};
pub use multiscale::MultiscaleDilatedConv2d;
pub use sampling::{sample_layer_config, SearchSpace};
pub use seq::{NormActConv, NormActConvConfig};
pub use transition::Transition;
pub use weight_norm::WeightNormConv2d;
