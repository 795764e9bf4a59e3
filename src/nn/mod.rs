//! # Neural Network Layers Module
//!
//! Building blocks for constructing convolutional networks.
//!
//! In the graph-based architecture, each "layer" is a constructor that
//! registers its parameters with the `GraphContext` and, on `forward`,
//! adds a specific pattern of nodes to the ASG.
//!
//! ## Available Layers
//!
//! - [`Conv2d`]: 2D convolution with configurable stride, padding, dilation, groups
//! - [`Linear`]: fully connected layer
//! - [`BatchNorm2d`]: batch normalization with running statistics
//! - [`Activation`]: ReLU, tanh, sigmoid, identity
//! - [`AvgPool2d`], [`GlobalAvgPool2d`]: pooling
//! - [`Dropout`]: inverted dropout
//! - [`Sequential`]: ordered container
//!
//! ## Example
//!
//! ```ignore
//! use smashnet::nn::{BatchNorm2d, Conv2d, Conv2dConfig, Module};
//! use smashnet::tensor::{GraphContext, Tensor};
//!
//! let ctx = Rc::new(RefCell::new(GraphContext::new()));
//! let conv = Conv2d::from_config(&ctx, "conv1", Conv2dConfig::new(3, 16, (3, 3)).with_padding((1, 1)));
//! let bn = BatchNorm2d::new(&ctx, "bn1", 16);
//!
//! let x = Tensor::new_input(&ctx, "input");
//! let h = bn.forward(&conv.forward(&x)).relu();
//! ```

pub mod activations;
pub mod batchnorm;
pub mod conv;
pub mod dropout;
pub mod init;
pub mod linear;
pub mod module;
pub mod parameters;
pub mod pooling;
pub mod sequential;

pub use activations::Activation;
pub use batchnorm::BatchNorm2d;
pub use conv::{Conv2d, Conv2dConfig};
pub use dropout::Dropout;
pub use init::ParamInit;
pub use linear::Linear;
pub use module::Module;
pub use parameters::{ParamSpec, ParamStore};
pub use pooling::{AvgPool2d, GlobalAvgPool2d};
pub use sequential::Sequential;
