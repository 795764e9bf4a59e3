//! Pooling layers for CNNs.

use crate::nn::module::Module;
use crate::tensor::Tensor;

/// Average pooling over `[N, C, H, W]` windows, without padding.
#[derive(Debug, Clone, Copy)]
pub struct AvgPool2d {
    pub kernel_size: (usize, usize),
    pub stride: (usize, usize),
}

impl AvgPool2d {
    pub fn new(kernel_size: (usize, usize), stride: (usize, usize)) -> Self {
        Self { kernel_size, stride }
    }

    /// Square window with stride equal to its size.
    pub fn square(size: usize) -> Self {
        Self::new((size, size), (size, size))
    }
}

impl Module for AvgPool2d {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs.avg_pool2d(self.kernel_size, self.stride)
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

/// Averages each channel over its whole spatial extent and flattens the
/// result to `[N, channels]`.
#[derive(Debug, Clone, Copy)]
pub struct GlobalAvgPool2d {
    pub channels: usize,
}

impl GlobalAvgPool2d {
    pub fn new(channels: usize) -> Self {
        Self { channels }
    }
}

impl Module for GlobalAvgPool2d {
    fn forward(&self, inputs: &Tensor) -> Tensor {
        inputs
            .mean_axes(&[2, 3])
            .reshape(vec![-1, self.channels as i64])
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::NodeType;
    use crate::tensor::GraphContext;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_avg_pool2d_square() {
        let pool = AvgPool2d::square(2);
        assert_eq!(pool.kernel_size, (2, 2));
        assert_eq!(pool.stride, (2, 2));
    }

    #[test]
    fn test_global_avg_pool_flattens() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let y = GlobalAvgPool2d::new(64).forward(&x);
        let graph = ctx.borrow().main_graph().clone();
        assert!(matches!(
            &graph.get_node(y.node_id).unwrap().node_type,
            NodeType::Reshape(_, shape) if shape == &vec![-1, 64]
        ));
    }
}
