//! Module implementing 2-D convolution for image processing.

use crate::asg::ConvGeometry;
use crate::nn::init::ParamInit;
use crate::nn::module::Module;
use crate::tensor::{GraphContext, Tensor};
use std::cell::RefCell;
use std::rc::Rc;

/// Configuration for Conv2d layer.
#[derive(Debug, Clone)]
pub struct Conv2dConfig {
    /// Number of input channels.
    pub in_channels: usize,
    /// Number of output channels (filters).
    pub out_channels: usize,
    /// Convolution kernel size.
    pub kernel_size: (usize, usize),
    /// Convolution stride.
    pub stride: (usize, usize),
    /// Padding.
    pub padding: (usize, usize),
    /// Dilation (kernel expansion).
    pub dilation: (usize, usize),
    /// Number of groups for grouped/depthwise convolution.
    pub groups: usize,
    /// Use bias.
    pub bias: bool,
    /// Weight initializer; fan-in uniform when unset.
    pub init: Option<ParamInit>,
}

impl Default for Conv2dConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            kernel_size: (3, 3),
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
            bias: true,
            init: None,
        }
    }
}

impl Conv2dConfig {
    /// Creates Conv2d configuration.
    pub fn new(in_channels: usize, out_channels: usize, kernel_size: (usize, usize)) -> Self {
        Self {
            in_channels,
            out_channels,
            kernel_size,
            ..Default::default()
        }
    }

    /// Sets convolution stride.
    pub fn with_stride(mut self, stride: (usize, usize)) -> Self {
        self.stride = stride;
        self
    }

    /// Sets padding.
    pub fn with_padding(mut self, padding: (usize, usize)) -> Self {
        self.padding = padding;
        self
    }

    /// Sets dilation.
    pub fn with_dilation(mut self, dilation: (usize, usize)) -> Self {
        self.dilation = dilation;
        self
    }

    /// Sets number of groups.
    pub fn with_groups(mut self, groups: usize) -> Self {
        self.groups = groups;
        self
    }

    /// Enables/disables bias.
    pub fn with_bias(mut self, bias: bool) -> Self {
        self.bias = bias;
        self
    }

    /// Sets the weight initializer.
    pub fn with_init(mut self, init: ParamInit) -> Self {
        self.init = Some(init);
        self
    }

    /// Weight shape `[C_out, C_in / groups, kH, kW]`.
    pub fn weight_shape(&self) -> [usize; 4] {
        [
            self.out_channels,
            self.in_channels / self.groups.max(1),
            self.kernel_size.0,
            self.kernel_size.1,
        ]
    }

    pub fn geometry(&self) -> ConvGeometry {
        ConvGeometry {
            stride: self.stride,
            padding: self.padding,
            dilation: self.dilation,
            groups: self.groups,
        }
    }
}

/// 2D Convolutional layer.
///
/// Applies 2D convolution to input tensor of shape [N, C_in, H, W].
/// Output tensor has shape [N, C_out, H_out, W_out].
///
/// # Example
///
/// ```rust,ignore
/// use smashnet::nn::{Conv2d, Conv2dConfig, Module};
///
/// let config = Conv2dConfig::new(3, 16, (3, 3)).with_padding((1, 1)).with_bias(false);
/// let conv = Conv2d::from_config(&context, "conv1", config);
/// let output = conv.forward(&input);
/// ```
pub struct Conv2d {
    /// Symbolic descriptor for weight tensor [C_out, C_in/groups, kH, kW].
    pub weight: Tensor,
    /// Optional symbolic descriptor for bias [C_out].
    pub bias: Option<Tensor>,
    /// Layer configuration.
    pub config: Conv2dConfig,
}

impl Conv2d {
    /// Creates a new Conv2d layer with basic parameters.
    pub fn new(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        in_channels: usize,
        out_channels: usize,
        kernel_size: (usize, usize),
    ) -> Self {
        let config = Conv2dConfig::new(in_channels, out_channels, kernel_size);
        Self::from_config(context, name, config)
    }

    /// Creates Conv2d layer from configuration.
    pub fn from_config(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        config: Conv2dConfig,
    ) -> Self {
        let shape = config.weight_shape();
        let init = config
            .init
            .unwrap_or_else(|| ParamInit::fan_in_uniform(shape[1] * shape[2] * shape[3]));
        let weight = Tensor::new_parameter(context, &format!("{}.weight", name), &shape, init);

        let bias = if config.bias {
            Some(Tensor::new_parameter(
                context,
                &format!("{}.bias", name),
                &[config.out_channels],
                ParamInit::fan_in_uniform(shape[1] * shape[2] * shape[3]),
            ))
        } else {
            None
        };

        Self { weight, bias, config }
    }

    /// Convolves `inputs` with `weight` in place of the stored weight,
    /// keeping this layer's geometry and bias. Used by layers that
    /// reparameterize the kernel before every application.
    pub fn forward_with_weight(&self, inputs: &Tensor, weight: &Tensor) -> Tensor {
        let out = inputs.conv2d(weight, self.config.geometry());
        match &self.bias {
            Some(bias) => out + &bias.reshape(vec![1, -1, 1, 1]),
            None => out,
        }
    }
}

impl Module for Conv2d {
    /// Applies convolution to input.
    fn forward(&self, inputs: &Tensor) -> Tensor {
        self.forward_with_weight(inputs, &self.weight)
    }

    /// Returns trainable parameters of the layer.
    fn parameters(&self) -> Vec<Tensor> {
        let mut params = vec![self.weight.clone()];
        if let Some(ref bias) = self.bias {
            params.push(bias.clone());
        }
        params
    }
}
