//! Module defining `Tensor` and `GraphContext`.
//!
//! A `Tensor` is not a data container. It is a lightweight handle to a node
//! of the abstract semantic graph (ASG). Every operation on a tensor
//! (`+`, `conv2d`, `softmax`, ...) appends a node to the graph and returns
//! a handle to it; nothing is computed until a backend executes the graph.
//!
//! `GraphContext` owns the graph under construction together with the
//! parameter declarations and running-statistic updates registered by the
//! modules that built it.

use crate::asg::{Asg, ConvGeometry, NodeId, NodeType, Value};
use crate::nn::init::ParamInit;
use crate::nn::parameters::ParamSpec;
use crate::runtime::Device;
use ndarray::ArrayD;
use std::cell::RefCell;
use std::ops::{Add, Div, Mul, Neg, Sub};
use std::rc::Rc;
use tracing::{debug, warn};

/// Which batch statistic a [`BufferUpdate`] tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticKind {
    Mean,
    /// Biased batch variance; the update rescales it to the unbiased estimate.
    Variance,
}

/// Exponential moving-average update of a buffer from a batch statistic,
/// applied by the session after a training-mode forward pass:
/// `buffer = (1 - momentum) * buffer + momentum * statistic`.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferUpdate {
    pub buffer: String,
    /// Node holding the statistic, shaped `[1, C, 1, 1]`.
    pub statistic: NodeId,
    /// Node the statistic was reduced from; its size gives the sample count.
    pub input: NodeId,
    pub momentum: f32,
    pub kind: StatisticKind,
}

/// Owns and manages the construction of one ASG.
///
/// Wrapped in `Rc<RefCell<>>` so that any number of `Tensor` handles can
/// share it.
#[derive(Debug, Clone)]
pub struct GraphContext {
    main_graph: Asg,
    parameters: Vec<ParamSpec>,
    buffer_updates: Vec<BufferUpdate>,
    device: Device,
}

impl GraphContext {
    /// Creates an empty context targeting the CPU.
    pub fn new() -> Self {
        Self::with_device(Device::Cpu)
    }

    pub fn with_device(device: Device) -> Self {
        Self {
            main_graph: Asg::new(0, Some("main".to_string())),
            parameters: Vec::new(),
            buffer_updates: Vec::new(),
            device,
        }
    }

    /// Convenience constructor for the shared handle every module expects.
    pub fn shared(device: Device) -> Rc<RefCell<GraphContext>> {
        Rc::new(RefCell::new(Self::with_device(device)))
    }

    pub fn main_graph_mut(&mut self) -> &mut Asg {
        &mut self.main_graph
    }

    pub fn main_graph(&self) -> &Asg {
        &self.main_graph
    }

    pub fn device(&self) -> Device {
        self.device
    }

    /// Parameter and buffer declarations, in registration order.
    pub fn parameters(&self) -> &[ParamSpec] {
        &self.parameters
    }

    pub fn buffer_updates(&self) -> &[BufferUpdate] {
        &self.buffer_updates
    }

    pub fn register_buffer_update(&mut self, update: BufferUpdate) {
        self.buffer_updates.push(update);
    }

    /// Registers a parameter and returns its graph node.
    ///
    /// Registering an existing name returns the existing node, so modules
    /// that use the same name share one weight.
    pub fn register_parameter(&mut self, spec: ParamSpec) -> NodeId {
        if let Some(existing) = self.parameters.iter().find(|p| p.name == spec.name) {
            if existing.shape != spec.shape {
                warn!(
                    name = %spec.name,
                    registered = ?existing.shape,
                    requested = ?spec.shape,
                    "parameter re-registered with a different shape; keeping the first"
                );
            }
            if let Some(id) = self.main_graph.find_named_leaf(&spec.name) {
                return id;
            }
        }
        debug!(name = %spec.name, shape = ?spec.shape, trainable = spec.trainable, "registering parameter");
        let id = self.main_graph.add_node(
            Some(spec.name.clone()),
            NodeType::Parameter {
                name: spec.name.clone(),
            },
        );
        self.parameters.push(spec);
        id
    }
}

impl Default for GraphContext {
    fn default() -> Self {
        Self::new()
    }
}

/// Symbolic handle to a node of the computation graph.
///
/// Holds no data: just the node id and a shared reference to the
/// `GraphContext` the node lives in.
#[derive(Debug, Clone)]
pub struct Tensor {
    pub node_id: NodeId,
    pub context: Rc<RefCell<GraphContext>>,
}

impl Tensor {
    fn from_node(context: &Rc<RefCell<GraphContext>>, name: Option<String>, node_type: NodeType) -> Self {
        let node_id = context.borrow_mut().main_graph_mut().add_node(name, node_type);
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Appends a node to this tensor's graph.
    fn push(&self, node_type: NodeType) -> Self {
        Self::from_node(&self.context, None, node_type)
    }

    /// Creates an input node; values are fed at execution time by name.
    pub fn new_input(context: &Rc<RefCell<GraphContext>>, name: &str) -> Self {
        let tensor = Self::from_node(
            context,
            Some(name.to_string()),
            NodeType::Input {
                name: name.to_string(),
            },
        );
        context.borrow_mut().main_graph_mut().inputs.push(tensor.node_id);
        tensor
    }

    /// Creates a trainable parameter.
    pub fn new_parameter(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        shape: &[usize],
        init: ParamInit,
    ) -> Self {
        Self::register(context, name, shape, init, true)
    }

    /// Creates a non-trainable buffer, such as a running statistic.
    pub fn new_buffer(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        shape: &[usize],
        init: ParamInit,
    ) -> Self {
        Self::register(context, name, shape, init, false)
    }

    fn register(
        context: &Rc<RefCell<GraphContext>>,
        name: &str,
        shape: &[usize],
        init: ParamInit,
        trainable: bool,
    ) -> Self {
        let node_id = context.borrow_mut().register_parameter(ParamSpec {
            name: name.to_string(),
            shape: shape.to_vec(),
            init,
            trainable,
        });
        Self {
            node_id,
            context: Rc::clone(context),
        }
    }

    /// Embeds constant data in the graph.
    pub fn new_literal(context: &Rc<RefCell<GraphContext>>, data: ArrayD<f32>, name: &str) -> Self {
        Self::from_node(context, Some(name.to_string()), NodeType::Literal(Value::Tensor(data)))
    }

    pub fn scalar(context: &Rc<RefCell<GraphContext>>, value: f32) -> Self {
        Self::from_node(context, None, NodeType::Literal(Value::ScalarF32(value)))
    }

    /// Name of the underlying node, if it has one.
    pub fn name(&self) -> Option<String> {
        self.context
            .borrow()
            .main_graph()
            .get_node(self.node_id)
            .ok()
            .and_then(|node| node.name.clone())
    }

    // --- Math ---

    pub fn dot(&self, other: &Tensor) -> Self {
        self.push(NodeType::MatrixMultiply(self.node_id, other.node_id))
    }

    pub fn exp(&self) -> Self {
        self.push(NodeType::Exp(self.node_id))
    }

    pub fn log(&self) -> Self {
        self.push(NodeType::Log(self.node_id))
    }

    pub fn sqrt(&self) -> Self {
        self.push(NodeType::Sqrt(self.node_id))
    }

    /// Frobenius norm of the whole tensor, as a scalar.
    pub fn norm(&self) -> Self {
        (self * self).sum().sqrt()
    }

    // --- Activations ---

    pub fn relu(&self) -> Self {
        self.push(NodeType::ReLU(self.node_id))
    }

    pub fn sigmoid(&self) -> Self {
        self.push(NodeType::Sigmoid(self.node_id))
    }

    pub fn tanh(&self) -> Self {
        self.push(NodeType::Tanh(self.node_id))
    }

    /// Softmax over the last axis.
    pub fn softmax(&self) -> Self {
        self.push(NodeType::Softmax(self.node_id))
    }

    // --- Reductions ---

    pub fn sum(&self) -> Self {
        self.push(NodeType::Sum(self.node_id))
    }

    /// Sum over `axes`, keeping reduced axes with length 1.
    pub fn sum_axes(&self, axes: &[isize]) -> Self {
        self.push(NodeType::SumAxes(self.node_id, axes.to_vec()))
    }

    /// Mean over `axes`, keeping reduced axes with length 1.
    pub fn mean_axes(&self, axes: &[isize]) -> Self {
        self.push(NodeType::MeanAxes(self.node_id, axes.to_vec()))
    }

    // --- Transformations ---

    /// Reshape; a single `-1` entry is inferred from the element count.
    pub fn reshape(&self, shape: Vec<i64>) -> Self {
        self.push(NodeType::Reshape(self.node_id, shape))
    }

    pub fn transpose(&self, axis1: usize, axis2: usize) -> Self {
        self.push(NodeType::Transpose(self.node_id, axis1, axis2))
    }

    /// Strided slice `start..end` (to the end when `None`) along `axis`.
    pub fn slice(&self, axis: usize, start: usize, end: Option<usize>, step: usize) -> Self {
        self.push(NodeType::Slice {
            input: self.node_id,
            axis,
            start,
            end,
            step,
        })
    }

    /// Concatenates tensors of one graph along `axis`.
    ///
    /// # Panics
    /// Panics if `tensors` is empty.
    pub fn concat(tensors: &[&Tensor], axis: usize) -> Self {
        let first = tensors
            .first()
            .expect("concat needs at least one tensor");
        first.push(NodeType::Concat {
            inputs: tensors.iter().map(|t| t.node_id).collect(),
            axis,
        })
    }

    // --- Convolution and pooling ---

    /// 2-D convolution of an `[N, C, H, W]` input with an
    /// `[C_out, C_in / groups, kH, kW]` weight.
    pub fn conv2d(&self, weight: &Tensor, geometry: ConvGeometry) -> Self {
        self.push(NodeType::Conv2d {
            input: self.node_id,
            weight: weight.node_id,
            geometry,
        })
    }

    pub fn avg_pool2d(&self, kernel_size: (usize, usize), stride: (usize, usize)) -> Self {
        self.push(NodeType::AvgPool2d {
            input: self.node_id,
            kernel_size,
            stride,
        })
    }

    /// Inverted dropout with drop probability `p`.
    pub fn dropout(&self, p: f32) -> Self {
        let mask = self.push(NodeType::DropoutMask {
            input: self.node_id,
            p,
        });
        self * &mask
    }
}

macro_rules! impl_binary_op {
    ($trait:ident, $method:ident, $variant:ident) => {
        impl $trait<&Tensor> for &Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Tensor {
                self.push(NodeType::$variant(self.node_id, rhs.node_id))
            }
        }

        impl $trait<&Tensor> for Tensor {
            type Output = Tensor;
            fn $method(self, rhs: &Tensor) -> Tensor {
                (&self).$method(rhs)
            }
        }
    };
}

impl_binary_op!(Add, add, Add);
impl_binary_op!(Sub, sub, Subtract);
impl_binary_op!(Mul, mul, Multiply);
impl_binary_op!(Div, div, Divide);

impl Neg for &Tensor {
    type Output = Tensor;
    fn neg(self) -> Tensor {
        self.push(NodeType::Negate(self.node_id))
    }
}
