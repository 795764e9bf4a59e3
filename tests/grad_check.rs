//! Compares analytic gradients from the autograd graph with central
//! finite differences.

use approx::assert_abs_diff_eq;
use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use smashnet::asg::ConvGeometry;
use smashnet::nn::{BatchNorm2d, Conv2d, Conv2dConfig, Module, ParamInit};
use smashnet::runtime::session::{Feeds, Session};
use smashnet::smash::{MultiscaleDilatedConv2d, WeightNormConv2d};
use smashnet::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

const EPSILON: f32 = 1e-2;
const ABS_TOLERANCE: f32 = 5e-3;
const REL_TOLERANCE: f32 = 5e-2;

fn random(rng: &mut StdRng, shape: &[usize]) -> ArrayD<f32> {
    ArrayD::random_using(IxDyn(shape), Uniform::new(-1.0f32, 1.0), rng)
}

/// A scalar loss `sum(y * r)` over a graph output `y`, where `r` is a
/// fixed random literal, together with everything needed to evaluate it.
struct Harness {
    session: Session,
    feeds: Feeds,
    loss: Tensor,
}

impl Harness {
    fn new(ctx: &Rc<RefCell<GraphContext>>, output: &Tensor, feeds: Feeds, seed: u64) -> Self {
        let mut session = Session::new(ctx, seed);
        let shape = session.run(&feeds, &[output]).unwrap()[0].shape().to_vec();
        let mut rng = StdRng::seed_from_u64(seed + 100);
        let weights = Tensor::new_literal(ctx, random(&mut rng, &shape), "loss_weights");
        let loss = (output * &weights).sum();
        Self { session, feeds, loss }
    }

    fn loss_value(&mut self) -> f32 {
        self.session.run(&self.feeds, &[&self.loss]).unwrap()[0].sum()
    }

    fn leaf(&self, name: &str) -> ArrayD<f32> {
        self.feeds
            .get(name)
            .or_else(|| self.session.params().get(name))
            .cloned()
            .unwrap_or_else(|| panic!("no leaf named {}", name))
    }

    fn set_leaf(&mut self, name: &str, value: ArrayD<f32>) {
        if self.feeds.contains_key(name) {
            self.feeds.insert(name.to_string(), value);
        } else {
            self.session.params_mut().set(name, value);
        }
    }

    fn numeric_grad(&mut self, name: &str) -> ArrayD<f32> {
        let base = self.leaf(name);
        let mut grad = ArrayD::zeros(base.raw_dim());
        for i in 0..base.len() {
            let mut plus = base.clone();
            plus.as_slice_mut().unwrap()[i] += EPSILON;
            self.set_leaf(name, plus);
            let up = self.loss_value();

            let mut minus = base.clone();
            minus.as_slice_mut().unwrap()[i] -= EPSILON;
            self.set_leaf(name, minus);
            let down = self.loss_value();

            grad.as_slice_mut().unwrap()[i] = (up - down) / (2.0 * EPSILON);
        }
        self.set_leaf(name, base);
        grad
    }

    fn check(&mut self, names: &[&str]) {
        let (_, analytic) = self.session.gradients_wrt(&self.feeds, &self.loss, names).unwrap();
        for name in names {
            let numeric = self.numeric_grad(name);
            let analytic = &analytic[*name];
            assert_eq!(analytic.shape(), numeric.shape(), "gradient shape of {}", name);
            for (a, n) in analytic.iter().zip(numeric.iter()) {
                let tolerance = ABS_TOLERANCE + REL_TOLERANCE * n.abs();
                assert_abs_diff_eq!(*a, *n, epsilon = tolerance);
            }
        }
    }
}

fn feeds(pairs: Vec<(&str, ArrayD<f32>)>) -> Feeds {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

#[test]
fn strided_padded_convolution() {
    let ctx = GraphContext::shared(Default::default());
    let mut rng = StdRng::seed_from_u64(1);
    let x = Tensor::new_input(&ctx, "x");
    let w = Tensor::new_parameter(&ctx, "w", &[3, 2, 3, 3], ParamInit::Normal { std: 0.5 });
    let y = x.conv2d(
        &w,
        ConvGeometry {
            stride: (2, 2),
            padding: (1, 1),
            ..Default::default()
        },
    );
    let mut harness = Harness::new(&ctx, &y, feeds(vec![("x", random(&mut rng, &[2, 2, 5, 5]))]), 1);
    harness.check(&["x", "w"]);
}

#[test]
fn grouped_dilated_convolution_with_bias() {
    let ctx = GraphContext::shared(Default::default());
    let mut rng = StdRng::seed_from_u64(2);
    let x = Tensor::new_input(&ctx, "x");
    let conv = Conv2d::from_config(
        &ctx,
        "conv",
        Conv2dConfig::new(4, 2, (3, 3))
            .with_groups(2)
            .with_dilation((2, 2))
            .with_padding((2, 2)),
    );
    let y = conv.forward(&x);
    let mut harness = Harness::new(&ctx, &y, feeds(vec![("x", random(&mut rng, &[1, 4, 5, 5]))]), 2);
    harness.check(&["x", "conv.weight", "conv.bias"]);
}

#[test]
fn average_pooling() {
    let ctx = GraphContext::shared(Default::default());
    let mut rng = StdRng::seed_from_u64(3);
    let x = Tensor::new_input(&ctx, "x");
    let y = x.avg_pool2d((2, 2), (2, 2));
    let mut harness = Harness::new(&ctx, &y, feeds(vec![("x", random(&mut rng, &[2, 3, 4, 6]))]), 3);
    harness.check(&["x"]);
}

#[test]
fn strided_slices_and_concat() {
    let ctx = GraphContext::shared(Default::default());
    let mut rng = StdRng::seed_from_u64(4);
    let x = Tensor::new_input(&ctx, "x");
    let even = x.slice(1, 0, None, 2);
    let odd = x.slice(1, 1, None, 2);
    let y = Tensor::concat(&[&even.tanh(), &(&odd * &odd)], 1);
    let mut harness = Harness::new(&ctx, &y, feeds(vec![("x", random(&mut rng, &[2, 6, 2, 2]))]), 4);
    harness.check(&["x"]);
}

#[test]
fn log_softmax_and_mixture() {
    let ctx = GraphContext::shared(Default::default());
    let mut rng = StdRng::seed_from_u64(5);
    let x = Tensor::new_input(&ctx, "x");
    let priors = x.slice(1, 6, None, 1).softmax();
    let first = priors.slice(1, 0, Some(1), 1) * &x.slice(1, 0, Some(3), 1).softmax();
    let second = priors.slice(1, 1, Some(2), 1) * &x.slice(1, 3, Some(6), 1).softmax();
    let y = (first + &second).log();
    let mut harness = Harness::new(&ctx, &y, feeds(vec![("x", random(&mut rng, &[3, 8]))]), 5);
    harness.check(&["x"]);
}

#[test]
fn training_mode_batch_norm() {
    let ctx = GraphContext::shared(Default::default());
    let mut rng = StdRng::seed_from_u64(6);
    let x = Tensor::new_input(&ctx, "x");
    let bn = BatchNorm2d::new(&ctx, "bn", 3);
    let y = bn.forward(&x);
    let mut harness = Harness::new(&ctx, &y, feeds(vec![("x", random(&mut rng, &[4, 3, 2, 2]))]), 6);
    harness.set_leaf("bn.gamma", random(&mut rng, &[3]));
    harness.check(&["x", "bn.gamma", "bn.beta"]);
}

#[test]
fn weight_normalized_kernel() {
    let ctx = GraphContext::shared(Default::default());
    let mut rng = StdRng::seed_from_u64(7);
    let x = Tensor::new_input(&ctx, "x");
    let wn = WeightNormConv2d::new(&ctx, "wn", Conv2dConfig::new(2, 3, (3, 3)).with_padding((1, 1)));
    let y = wn.forward(&x);
    let mut harness = Harness::new(&ctx, &y, feeds(vec![("x", random(&mut rng, &[1, 2, 4, 4]))]), 7);
    harness.check(&["x", "wn.weight", "wn.bias"]);
}

#[test]
fn masked_kernel_gets_no_gradient_off_stencil() {
    let ctx = GraphContext::shared(Default::default());
    let mut rng = StdRng::seed_from_u64(8);
    let x = Tensor::new_input(&ctx, "x");
    let mdc = MultiscaleDilatedConv2d::new(&ctx, "mdc", 1, 2, 2).unwrap();
    let y = mdc.forward(&x);
    let mut harness = Harness::new(&ctx, &y, feeds(vec![("x", random(&mut rng, &[1, 1, 6, 6]))]), 8);
    harness.check(&["x", "mdc.conv.weight"]);

    let (_, grads) = harness
        .session
        .gradients_wrt(&harness.feeds, &harness.loss, &["mdc.conv.weight"])
        .unwrap();
    let grad = &grads["mdc.conv.weight"];
    for o in 0..2 {
        // (0, 1) is off the stencil, (0, 0) and the centre are on it.
        assert_eq!(grad[[o, 0, 0, 1]], 0.0);
        assert_ne!(grad[[o, 0, 2, 2]], 0.0);
    }
}
