//! Crate-level error types.

use crate::analysis::shape_inference::ShapeInferenceError;
use crate::asg::AsgError;
use crate::autograd::AutogradError;
use crate::runtime::backend::RuntimeError;
use thiserror::Error;

/// Invalid model or layer configuration, rejected at construction.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("depth {0} is invalid: (depth - 4) must be a positive multiple of 6")]
    InvalidDepth(usize),

    #[error("{name} must be positive")]
    NonPositive { name: &'static str },

    #[error("dropout rate {0} is outside [0, 1)")]
    InvalidDropout(f32),

    #[error("dilation {0} is not supported; expected 1, 2 or 3")]
    UnsupportedDilation(usize),

    #[error("kernel size {0} is invalid; expected an odd size of at least 1")]
    InvalidKernelSize(usize),

    #[error("groups {groups} must divide both input channels {n_in} and output channels {n_out}")]
    InvalidGroups {
        groups: usize,
        n_in: usize,
        n_out: usize,
    },

    #[error("invalid branch topology: {0}")]
    InvalidTopology(String),

    #[error("add-split gating needs an even channel count, got {0}")]
    OddSplitChannels(usize),

    #[error("invalid learning-rate schedule: {0}")]
    InvalidSchedule(String),

    #[error("invalid search space: {0}")]
    InvalidSearchSpace(String),
}

/// Any error the crate can produce.
#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("graph error: {0}")]
    Asg(#[from] AsgError),

    #[error("shape inference error: {0}")]
    Shape(#[from] ShapeInferenceError),

    #[error("autograd error: {0}")]
    Autograd(#[from] AutogradError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("no input or parameter named '{0}' in the graph")]
    UnknownTensor(String),

    #[error("loss must be a scalar, got {0} elements")]
    NonScalarLoss(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
