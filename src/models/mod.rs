//! Complete networks assembled from `nn` layers.

pub mod wide_resnet;

pub use wide_resnet::{BasicBlock, MixtureOutput, WideResNetMos};
