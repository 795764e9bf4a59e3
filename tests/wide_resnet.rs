use approx::assert_relative_eq;
use ndarray::{Array2, ArrayD, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::SeedableRng;
use smashnet::config::WideResNetConfig;
use smashnet::losses::nll_loss;
use smashnet::models::{BasicBlock, WideResNetMos};
use smashnet::nn::Module;
use smashnet::optimizers::SgdConfig;
use smashnet::runtime::session::{Feeds, Session};
use smashnet::tensor::{GraphContext, Tensor};
use smashnet::ConfigError;
use std::collections::HashMap;

fn small_config() -> WideResNetConfig {
    WideResNetConfig {
        depth: 10,
        widen_factor: 1,
        num_classes: 5,
        n_components: 3,
        ..Default::default()
    }
}

fn images(seed: u64, shape: &[usize]) -> ArrayD<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    ArrayD::random_using(IxDyn(shape), Uniform::new(-1.0f32, 1.0), &mut rng)
}

fn one_hot(labels: &[usize], classes: usize) -> ArrayD<f32> {
    let mut out = Array2::<f32>::zeros((labels.len(), classes));
    for (row, &label) in labels.iter().enumerate() {
        out[[row, label]] = 1.0;
    }
    out.into_dyn()
}

#[test]
fn block_count_follows_depth() {
    for depth in [10, 16, 22, 28, 40] {
        let ctx = GraphContext::shared(Default::default());
        let config = WideResNetConfig {
            depth,
            widen_factor: 2,
            ..Default::default()
        };
        let net = WideResNetMos::new(&ctx, config).unwrap();
        assert_eq!(net.block_count(), 3 * ((depth - 4) / 6));
    }
}

#[test]
fn invalid_depth_is_rejected() {
    let ctx = GraphContext::shared(Default::default());
    let config = WideResNetConfig {
        depth: 12,
        ..Default::default()
    };
    assert_eq!(WideResNetMos::new(&ctx, config).err(), Some(ConfigError::InvalidDepth(12)));
}

#[test]
fn outputs_are_log_probabilities_and_priors_sum_to_one() {
    let ctx = GraphContext::shared(Default::default());
    let net = WideResNetMos::new(&ctx, small_config()).unwrap();
    let x = Tensor::new_input(&ctx, "x");
    let out = net.forward_mixture(&x);

    let mut session = Session::new(&ctx, 0);
    let feeds = Feeds::from([("x".to_string(), images(1, &[3, 3, 8, 8]))]);
    let values = session.run(&feeds, &[&out.log_probs, &out.priors]).unwrap();

    assert_eq!(values[0].shape(), &[3, 5]);
    assert_eq!(values[1].shape(), &[3, 3]);
    for row in values[0].outer_iter() {
        assert!(row.iter().all(|v| *v <= 0.0));
        assert_relative_eq!(row.mapv(f32::exp).sum(), 1.0, epsilon = 1e-5);
    }
    for row in values[1].outer_iter() {
        assert_relative_eq!(row.sum(), 1.0, epsilon = 1e-5);
    }
}

#[test]
fn static_shapes_match_execution() {
    let ctx = GraphContext::shared(Default::default());
    let net = WideResNetMos::new(&ctx, small_config()).unwrap();
    let x = Tensor::new_input(&ctx, "x");
    let y = net.forward(&x);
    let session = Session::new(&ctx, 0);
    let shapes = session
        .infer_shapes(&HashMap::from([("x".to_string(), vec![2, 3, 12, 12])]), &[&y])
        .unwrap();
    assert_eq!(shapes[0], vec![2, 5]);
}

#[test]
fn basic_block_shapes() {
    let ctx = GraphContext::shared(Default::default());
    let same = BasicBlock::new(&ctx, "same", 4, 4, 1, 0.0).unwrap();
    let down = BasicBlock::new(&ctx, "down", 4, 8, 2, 0.3).unwrap();
    let x = Tensor::new_input(&ctx, "x");
    let a = same.forward(&x);
    let b = down.forward(&x);

    let mut session = Session::new(&ctx, 0);
    let feeds = Feeds::from([("x".to_string(), images(2, &[2, 4, 6, 6]))]);
    let values = session.run(&feeds, &[&a, &b]).unwrap();
    assert_eq!(values[0].shape(), &[2, 4, 6, 6]);
    assert_eq!(values[1].shape(), &[2, 8, 3, 3]);
}

#[test]
fn identity_shortcut_adds_the_raw_input() {
    let ctx = GraphContext::shared(Default::default());
    let block = BasicBlock::new(&ctx, "b", 3, 3, 1, 0.0).unwrap();
    let x = Tensor::new_input(&ctx, "x");
    let y = block.forward(&x);

    let mut session = Session::new(&ctx, 0);
    let zeros = ArrayD::zeros(IxDyn(&[3, 3, 3, 3]));
    session.params_mut().set("b.conv2.weight", zeros);
    let input = images(3, &[2, 3, 4, 4]);
    let feeds = Feeds::from([("x".to_string(), input.clone())]);
    let out = session.run(&feeds, &[&y]).unwrap();
    assert_eq!(out[0], input);
}

#[test]
fn projection_shortcut_reads_the_preactivated_input() {
    let ctx = GraphContext::shared(Default::default());
    let block = BasicBlock::new(&ctx, "b", 2, 4, 1, 0.0).unwrap();
    let x = Tensor::new_input(&ctx, "x");
    let y = block.forward(&x);

    let mut session = Session::new(&ctx, 0);
    session.params_mut().set("b.conv2.weight", ArrayD::zeros(IxDyn(&[4, 4, 3, 3])));
    session.params_mut().set("b.shortcut.weight", ArrayD::ones(IxDyn(&[4, 2, 1, 1])));
    let input = images(4, &[2, 2, 3, 3]);
    let feeds = Feeds::from([("x".to_string(), input.clone())]);
    let out = session.run(&feeds, &[&y]).unwrap().remove(0);

    // Every output channel is the channel sum of relu(batchnorm(x)).
    let mut expected = ArrayD::<f32>::zeros(IxDyn(&[2, 3, 3]));
    for c in 0..2 {
        let channel = input.index_axis(ndarray::Axis(1), c);
        let mean = channel.mean().unwrap();
        let var = channel.mapv(|v| (v - mean) * (v - mean)).mean().unwrap();
        expected = expected + channel.mapv(|v| ((v - mean) / (var + 1e-5).sqrt()).max(0.0));
    }
    for o in 0..4 {
        let got = out.index_axis(ndarray::Axis(1), o);
        for (g, e) in got.iter().zip(expected.iter()) {
            assert_relative_eq!(*g, *e, epsilon = 1e-4);
        }
    }
}

#[test]
fn learning_rate_anneals_to_zero() {
    let ctx = GraphContext::shared(Default::default());
    let mut net = WideResNetMos::new(&ctx, small_config()).unwrap();
    let rates: Vec<f32> = (0..=10).map(|_| net.update_lr(10).unwrap()).collect();
    assert_relative_eq!(rates[0], 0.1);
    assert_relative_eq!(rates[5], 0.05, epsilon = 1e-6);
    assert_relative_eq!(rates[10], 0.0, epsilon = 1e-6);
    assert!(rates.windows(2).all(|w| w[1] < w[0]));
    assert!(matches!(net.update_lr(0), Err(ConfigError::InvalidSchedule(_))));
}

#[test]
fn one_sgd_step_reduces_the_loss() {
    let ctx = GraphContext::shared(Default::default());
    let config = WideResNetConfig {
        num_classes: 3,
        n_components: 2,
        optimizer: SgdConfig {
            lr: 0.01,
            ..Default::default()
        },
        ..small_config()
    };
    let mut net = WideResNetMos::new(&ctx, config).unwrap();
    let x = Tensor::new_input(&ctx, "x");
    let targets = Tensor::new_input(&ctx, "targets");
    let loss = nll_loss(&net.forward(&x), &targets);

    let mut session = Session::new(&ctx, 7);
    let feeds = Feeds::from([
        ("x".to_string(), images(5, &[4, 3, 8, 8])),
        ("targets".to_string(), one_hot(&[0, 1, 2, 1], 3)),
    ]);
    let before = net.step(&mut session, &feeds, &loss).unwrap();
    let after = session.run(&feeds, &[&loss]).unwrap()[0].sum();
    assert!(after < before, "loss went from {} to {}", before, after);
    assert!(net.optimizer().velocity("fc.weights").is_some());
}

#[test]
fn training_forward_updates_running_statistics() {
    let ctx = GraphContext::shared(Default::default());
    let mut net = WideResNetMos::new(&ctx, small_config()).unwrap();
    let x = Tensor::new_input(&ctx, "x");
    let train_out = net.forward(&x);

    let mut session = Session::new(&ctx, 0);
    let feeds = Feeds::from([("x".to_string(), images(6, &[2, 3, 8, 8]))]);
    session.run(&feeds, &[&train_out]).unwrap();
    let running_var = session.params().get("bn1.running_var").unwrap().clone();
    assert!(running_var.iter().any(|v| (*v - 1.0).abs() > 1e-6));

    net.set_training(false);
    let eval_out = net.forward(&x);
    let values = session.run(&feeds, &[&eval_out]).unwrap();
    assert_eq!(session.params().get("bn1.running_var").unwrap(), &running_var);
    for row in values[0].outer_iter() {
        assert_relative_eq!(row.mapv(f32::exp).sum(), 1.0, epsilon = 1e-5);
    }
}

#[test]
fn head_reads_class_blocks_first_and_priors_last() {
    let ctx = GraphContext::shared(Default::default());
    let config = WideResNetConfig {
        num_classes: 2,
        n_components: 2,
        ..small_config()
    };
    let net = WideResNetMos::new(&ctx, config).unwrap();
    let x = Tensor::new_input(&ctx, "x");
    let out = net.forward_mixture(&x);

    let mut session = Session::new(&ctx, 0);
    session.params_mut().set("fc.weights", ArrayD::zeros(IxDyn(&[64, 6])));
    let bias = [1.0f32, 0.0, 0.0, 2.0, 0.5, -0.5];
    session.params_mut().set("fc.bias", ArrayD::from_shape_vec(IxDyn(&[6]), bias.to_vec()).unwrap());
    let feeds = Feeds::from([("x".to_string(), images(8, &[1, 3, 8, 8]))]);
    let values = session.run(&feeds, &[&out.log_probs, &out.priors]).unwrap();

    let softmax = |v: &[f32]| {
        let total: f32 = v.iter().map(|x| x.exp()).sum();
        v.iter().map(|x| x.exp() / total).collect::<Vec<_>>()
    };
    let priors = softmax(&bias[4..]);
    let first = softmax(&bias[0..2]);
    let second = softmax(&bias[2..4]);
    for class in 0..2 {
        let expected = (priors[0] * first[class] + priors[1] * second[class]).ln();
        assert_relative_eq!(values[0][[0, class]], expected, epsilon = 1e-5);
        assert_relative_eq!(values[1][[0, class]], priors[class], epsilon = 1e-5);
    }
    assert_relative_eq!(values[0][[0, 0]], -0.568269, epsilon = 1e-5);
    assert_relative_eq!(values[0][[0, 1]], -0.835876, epsilon = 1e-5);
}
