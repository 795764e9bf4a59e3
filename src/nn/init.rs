//! Parameter initialization schemes.

use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::{Normal, Uniform};
use ndarray_rand::RandomExt;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How a parameter's initial value is drawn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum ParamInit {
    Zeros,
    Ones,
    Constant(f32),
    /// `U(-bound, bound)`.
    Uniform { bound: f32 },
    /// `N(0, std^2)`.
    Normal { std: f32 },
    /// `N(0, 2 / (k_h * k_w * out_channels))` for a conv weight laid out
    /// as `[out, in / groups, k_h, k_w]`.
    KaimingNormalFanOut,
}

impl ParamInit {
    /// Uniform init scaled by fan-in, the default for conv and linear weights.
    pub fn fan_in_uniform(fan_in: usize) -> Self {
        ParamInit::Uniform {
            bound: 1.0 / (fan_in.max(1) as f32).sqrt(),
        }
    }

    /// Draws a tensor of `shape`.
    pub fn sample<R: Rng + ?Sized>(&self, shape: &[usize], rng: &mut R) -> ArrayD<f32> {
        let dim = IxDyn(shape);
        match *self {
            ParamInit::Zeros => ArrayD::zeros(dim),
            ParamInit::Ones => ArrayD::ones(dim),
            ParamInit::Constant(v) => ArrayD::from_elem(dim, v),
            ParamInit::Uniform { bound } => {
                if bound > 0.0 {
                    ArrayD::random_using(dim, Uniform::new(-bound, bound), rng)
                } else {
                    ArrayD::zeros(dim)
                }
            }
            ParamInit::Normal { std } => normal(dim, std, rng),
            ParamInit::KaimingNormalFanOut => {
                let fan_out = match shape {
                    [out, _, kh, kw] => out * kh * kw,
                    _ => shape.first().copied().unwrap_or(1),
                };
                let std = (2.0 / fan_out.max(1) as f32).sqrt();
                normal(dim, std, rng)
            }
        }
    }
}

fn normal<R: Rng + ?Sized>(dim: IxDyn, std: f32, rng: &mut R) -> ArrayD<f32> {
    match Normal::new(0.0f32, std) {
        Ok(dist) => ArrayD::random_using(dim, dist, rng),
        // Only a non-finite or negative std lands here.
        Err(_) => ArrayD::zeros(dim),
    }
}
