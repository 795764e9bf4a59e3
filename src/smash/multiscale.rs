//! Multiscale dilated convolution through a fixed binary stencil.
//!
//! For dilation 2 and 3 a dense 5x5 or 7x7 kernel is multiplied by a
//! stencil that keeps the centre 3x3 block, the dilated 3x3 taps and the
//! straight lines between them. A single weight tensor therefore covers
//! several dilation rates at once; the masked-out weights are still
//! registered and counted as parameters.

use crate::error::ConfigError;
use crate::nn::{Conv2d, Conv2dConfig, Module};
use crate::runtime::Device;
use crate::tensor::{GraphContext, Tensor};
use ndarray::{Array2, ArrayD};
use std::cell::RefCell;
use std::rc::Rc;
use tracing::debug;

const STENCIL_5: [[u8; 5]; 5] = [
    [1, 0, 1, 0, 1],
    [0, 1, 1, 1, 0],
    [1, 1, 1, 1, 1],
    [0, 1, 1, 1, 0],
    [1, 0, 1, 0, 1],
];

const STENCIL_7: [[u8; 7]; 7] = [
    [1, 0, 0, 1, 0, 0, 1],
    [0, 1, 0, 1, 0, 1, 0],
    [0, 0, 1, 1, 1, 0, 0],
    [1, 1, 1, 1, 1, 1, 1],
    [0, 0, 1, 1, 1, 0, 0],
    [0, 1, 0, 1, 0, 1, 0],
    [1, 0, 0, 1, 0, 0, 1],
];

/// Binary stencil for `dilation`; `None` for dilation 1, which uses a
/// plain 3x3 kernel.
pub fn stencil(dilation: usize) -> Result<Option<Array2<f32>>, ConfigError> {
    fn to_array<const N: usize>(rows: &[[u8; N]; N]) -> Array2<f32> {
        Array2::from_shape_fn((N, N), |(i, j)| f32::from(rows[i][j]))
    }
    match dilation {
        1 => Ok(None),
        2 => Ok(Some(to_array(&STENCIL_5))),
        3 => Ok(Some(to_array(&STENCIL_7))),
        other => Err(ConfigError::UnsupportedDilation(other)),
    }
}

pub struct MultiscaleDilatedConv2d {
    pub conv: Conv2d,
    /// `[1, 1, k, k]` stencil, broadcast over every (out, in) pair.
    mask: Option<Tensor>,
    dilation: usize,
    device: Device,
}

impl MultiscaleDilatedConv2d {
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        n_in: usize,
        n_out: usize,
        dilation: usize,
    ) -> Result<Self, ConfigError> {
        let stencil = stencil(dilation)?;
        let kernel = 3 + 2 * (dilation - 1);
        let device = context.borrow().device();

        let conv = Conv2d::from_config(
            context,
            &format!("{}.conv", name),
            Conv2dConfig::new(n_in, n_out, (kernel, kernel))
                .with_padding((dilation, dilation))
                .with_bias(false),
        );
        let mask = stencil.map(|s| {
            let data: ArrayD<f32> = s.insert_axis(ndarray::Axis(0)).insert_axis(ndarray::Axis(0)).into_dyn();
            Tensor::new_literal(context, data, &format!("{}.mask", name))
        });
        debug!(layer = name, dilation, kernel, %device, "built multiscale dilated conv");

        Ok(Self {
            conv,
            mask,
            dilation,
            device,
        })
    }

    pub fn dilation(&self) -> usize {
        self.dilation
    }

    /// Device the stencil literal was created for.
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn out_channels(&self) -> usize {
        self.conv.config.out_channels
    }
}

impl Module for MultiscaleDilatedConv2d {
    fn forward(&self, x: &Tensor) -> Tensor {
        match &self.mask {
            Some(mask) => self.conv.forward_with_weight(x, &(&self.conv.weight * mask)),
            None => self.conv.forward(x),
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.conv.parameters()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stencils_are_symmetric_and_keep_the_centre() {
        for (dilation, size, taps) in [(2, 5, 17.0), (3, 7, 25.0)] {
            let s = stencil(dilation).unwrap().unwrap();
            assert_eq!(s.dim(), (size, size));
            assert_eq!(s, s.t());
            assert_eq!(s[[size / 2, size / 2]], 1.0);
            assert_eq!(s.sum(), taps);
        }
        assert!(stencil(1).unwrap().is_none());
    }

    #[test]
    fn unsupported_dilation_is_rejected() {
        let ctx = GraphContext::shared(Default::default());
        assert_eq!(
            MultiscaleDilatedConv2d::new(&ctx, "mdc", 4, 4, 4).err(),
            Some(ConfigError::UnsupportedDilation(4))
        );
        assert!(MultiscaleDilatedConv2d::new(&ctx, "mdc0", 4, 4, 0).is_err());
    }

    #[test]
    fn kernel_grows_with_dilation() {
        let ctx = GraphContext::shared(Default::default());
        let mdc = MultiscaleDilatedConv2d::new(&ctx, "mdc", 2, 3, 3).unwrap();
        assert_eq!(mdc.conv.config.weight_shape(), [3, 2, 7, 7]);
        assert_eq!(mdc.conv.config.padding, (3, 3));
        assert_eq!(mdc.conv.config.dilation, (1, 1));
        assert_eq!(mdc.device(), Device::Cpu);
    }
}
