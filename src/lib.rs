//! # smashnet
//!
//! Wide residual networks with a mixture-of-softmaxes head, and the
//! SMASH layer library, built on a graph-based autograd engine.
//!
//! Layers do not hold data. A constructor registers parameters with a
//! shared [`GraphContext`](tensor::GraphContext); `forward` appends
//! nodes to its Abstract Semantic Graph (ASG) and returns a symbolic
//! [`Tensor`](tensor::Tensor). A [`Session`](runtime::session::Session)
//! owns the parameter values and executes the graph on the CPU.
//!
//! ## Usage Example
//!
//! ```no_run
//! use smashnet::config::WideResNetConfig;
//! use smashnet::losses::nll_loss;
//! use smashnet::models::WideResNetMos;
//! use smashnet::nn::Module;
//! use smashnet::runtime::session::{Feeds, Session};
//! use smashnet::tensor::{GraphContext, Tensor};
//!
//! let ctx = GraphContext::shared(Default::default());
//! let config = WideResNetConfig { depth: 10, widen_factor: 1, ..Default::default() };
//! let mut net = WideResNetMos::new(&ctx, config).unwrap();
//!
//! let images = Tensor::new_input(&ctx, "images");
//! let labels = Tensor::new_input(&ctx, "labels");
//! let loss = nll_loss(&net.forward(&images), &labels);
//!
//! let mut session = Session::new(&ctx, 0);
//! let feeds = Feeds::new(); // fill with "images" [N, 3, H, W] and one-hot "labels"
//! net.update_lr(1000).unwrap();
//! net.step(&mut session, &feeds, &loss).unwrap();
//! ```

pub mod analysis;
pub mod asg;
pub mod autograd;
pub mod config;
pub mod error;
pub mod losses;
pub mod models;
pub mod nn;
pub mod optimizers;
pub mod runtime;
pub mod smash;
pub mod tensor;

pub use error::{ConfigError, Error, Result};
