//! ASG: the abstract semantic graph that every layer builds into.
//!
//! A graph is a flat map of nodes. Each node records the operation it
//! performs and the ids of its operands; values only exist at execution
//! time inside a backend.

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Node identifier, unique inside one graph.
pub type NodeId = usize;
/// Graph identifier.
pub type AsgId = usize;
/// Tensor shape.
pub type Shape = Vec<usize>;

pub type AsgResult<T> = std::result::Result<T, AsgError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AsgError {
    #[error("Node with ID {0} not found")]
    NodeNotFound(NodeId),
    #[error("Invalid shape at node {0}")]
    InvalidShape(NodeId),
    #[error("Operation not supported: {0}")]
    UnsupportedOperation(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    /// Node id (duplicates the map key for convenience).
    pub id: NodeId,
    pub name: Option<String>,
    pub node_type: NodeType,
    /// Filled in by shape inference.
    pub shape: Option<Shape>,
}

/// 2-D geometry shared by the convolution nodes and their gradients.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvGeometry {
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
    pub groups: usize,
}

impl Default for ConvGeometry {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
        }
    }
}

impl ConvGeometry {
    /// True when `kernel`, stride and dilation are non-zero on both axes.
    pub fn admits_kernel(&self, kernel: (usize, usize)) -> bool {
        [kernel.0, kernel.1, self.stride.0, self.stride.1, self.dilation.0, self.dilation.1]
            .iter()
            .all(|&v| v > 0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum NodeType {
    // Data
    Input { name: String },
    Parameter { name: String },
    Literal(Value),
    /// Reference to a node of another graph, resolved from the execution memo.
    External { source_asg_id: AsgId, source_node_id: NodeId },

    // Binary, numpy-style broadcasting
    Add(NodeId, NodeId),
    Subtract(NodeId, NodeId),
    Multiply(NodeId, NodeId),
    Divide(NodeId, NodeId),
    MatrixMultiply(NodeId, NodeId),
    GreaterThan(NodeId, NodeId),

    // Unary
    Negate(NodeId),
    Exp(NodeId),
    Log(NodeId),
    Sqrt(NodeId),
    ReLU(NodeId),
    Sigmoid(NodeId),
    Tanh(NodeId),
    /// Softmax over the last axis.
    Softmax(NodeId),

    // Reductions
    /// Sum of every element, producing a scalar.
    Sum(NodeId),
    /// Sum over the given axes, keepdim. Negative axes count from the end.
    SumAxes(NodeId, Vec<isize>),
    /// Mean over the given axes, keepdim.
    MeanAxes(NodeId, Vec<isize>),
    MeanAxesBackward { grad_output: NodeId, input: NodeId, axes: Vec<isize> },

    // Transformations
    /// Reshape to a fixed shape; one entry may be -1.
    Reshape(NodeId, Vec<i64>),
    /// Reshape the first operand to the runtime shape of the second.
    ReshapeLike(NodeId, NodeId),
    Transpose(NodeId, usize, usize),
    /// Broadcast the first operand to the runtime shape of the second.
    Broadcast(NodeId, NodeId),
    /// Sum the first operand down to the runtime shape of the second.
    ReduceSumTo(NodeId, NodeId),
    Slice { input: NodeId, axis: usize, start: usize, end: Option<usize>, step: usize },
    SliceBackward {
        grad_output: NodeId,
        input: NodeId,
        axis: usize,
        start: usize,
        end: Option<usize>,
        step: usize,
    },
    Concat { inputs: Vec<NodeId>, axis: usize },
    ConcatBackward { grad_output: NodeId, inputs: Vec<NodeId>, index: usize, axis: usize },

    // Convolution and pooling, NCHW
    Conv2d { input: NodeId, weight: NodeId, geometry: ConvGeometry },
    Conv2dBackwardInput { grad_output: NodeId, weight: NodeId, input: NodeId, geometry: ConvGeometry },
    Conv2dBackwardWeight { grad_output: NodeId, input: NodeId, weight: NodeId, geometry: ConvGeometry },
    AvgPool2d { input: NodeId, kernel_size: (usize, usize), stride: (usize, usize) },
    AvgPool2dBackward {
        grad_output: NodeId,
        input: NodeId,
        kernel_size: (usize, usize),
        stride: (usize, usize),
    },

    /// Inverted-dropout mask shaped like `input`: 0 with probability `p`,
    /// `1/(1-p)` otherwise. Drawn once per execution.
    DropoutMask { input: NodeId, p: f32 },
}

impl NodeType {
    /// Ids of the nodes this operation reads, in evaluation order.
    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. } => vec![],

            NodeType::Add(a, b)
            | NodeType::Subtract(a, b)
            | NodeType::Multiply(a, b)
            | NodeType::Divide(a, b)
            | NodeType::MatrixMultiply(a, b)
            | NodeType::GreaterThan(a, b)
            | NodeType::ReshapeLike(a, b)
            | NodeType::Broadcast(a, b)
            | NodeType::ReduceSumTo(a, b) => vec![*a, *b],

            NodeType::Negate(a)
            | NodeType::Exp(a)
            | NodeType::Log(a)
            | NodeType::Sqrt(a)
            | NodeType::ReLU(a)
            | NodeType::Sigmoid(a)
            | NodeType::Tanh(a)
            | NodeType::Softmax(a)
            | NodeType::Sum(a)
            | NodeType::SumAxes(a, _)
            | NodeType::MeanAxes(a, _)
            | NodeType::Reshape(a, _)
            | NodeType::Transpose(a, _, _) => vec![*a],

            NodeType::MeanAxesBackward { grad_output, input, .. }
            | NodeType::SliceBackward { grad_output, input, .. }
            | NodeType::AvgPool2dBackward { grad_output, input, .. } => vec![*grad_output, *input],

            NodeType::Slice { input, .. }
            | NodeType::AvgPool2d { input, .. }
            | NodeType::DropoutMask { input, .. } => vec![*input],

            NodeType::Concat { inputs, .. } => inputs.clone(),
            NodeType::ConcatBackward { grad_output, inputs, .. } => {
                let mut deps = vec![*grad_output];
                deps.extend(inputs.iter().copied());
                deps
            }

            NodeType::Conv2d { input, weight, .. } => vec![*input, *weight],
            NodeType::Conv2dBackwardInput { grad_output, weight, input, .. } => {
                vec![*grad_output, *weight, *input]
            }
            NodeType::Conv2dBackwardWeight { grad_output, input, weight, .. } => {
                vec![*grad_output, *input, *weight]
            }
        }
    }

    /// Short operation name used in logs and error messages.
    pub fn op_name(&self) -> &'static str {
        match self {
            NodeType::Input { .. } => "Input",
            NodeType::Parameter { .. } => "Parameter",
            NodeType::Literal(_) => "Literal",
            NodeType::External { .. } => "External",
            NodeType::Add(..) => "Add",
            NodeType::Subtract(..) => "Subtract",
            NodeType::Multiply(..) => "Multiply",
            NodeType::Divide(..) => "Divide",
            NodeType::MatrixMultiply(..) => "MatrixMultiply",
            NodeType::GreaterThan(..) => "GreaterThan",
            NodeType::Negate(_) => "Negate",
            NodeType::Exp(_) => "Exp",
            NodeType::Log(_) => "Log",
            NodeType::Sqrt(_) => "Sqrt",
            NodeType::ReLU(_) => "ReLU",
            NodeType::Sigmoid(_) => "Sigmoid",
            NodeType::Tanh(_) => "Tanh",
            NodeType::Softmax(_) => "Softmax",
            NodeType::Sum(_) => "Sum",
            NodeType::SumAxes(..) => "SumAxes",
            NodeType::MeanAxes(..) => "MeanAxes",
            NodeType::MeanAxesBackward { .. } => "MeanAxesBackward",
            NodeType::Reshape(..) => "Reshape",
            NodeType::ReshapeLike(..) => "ReshapeLike",
            NodeType::Transpose(..) => "Transpose",
            NodeType::Broadcast(..) => "Broadcast",
            NodeType::ReduceSumTo(..) => "ReduceSumTo",
            NodeType::Slice { .. } => "Slice",
            NodeType::SliceBackward { .. } => "SliceBackward",
            NodeType::Concat { .. } => "Concat",
            NodeType::ConcatBackward { .. } => "ConcatBackward",
            NodeType::Conv2d { .. } => "Conv2d",
            NodeType::Conv2dBackwardInput { .. } => "Conv2dBackwardInput",
            NodeType::Conv2dBackwardWeight { .. } => "Conv2dBackwardWeight",
            NodeType::AvgPool2d { .. } => "AvgPool2d",
            NodeType::AvgPool2dBackward { .. } => "AvgPool2dBackward",
            NodeType::DropoutMask { .. } => "DropoutMask",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Tensor(ArrayD<f32>),
    ScalarF32(f32),
}

impl Value {
    /// Converts to an array; scalars become 0-d arrays.
    pub fn into_tensor(self) -> ArrayD<f32> {
        match self {
            Value::Tensor(arr) => arr,
            Value::ScalarF32(v) => ndarray::arr0(v).into_dyn(),
        }
    }

    pub fn shape(&self) -> Shape {
        match self {
            Value::Tensor(arr) => arr.shape().to_vec(),
            Value::ScalarF32(_) => vec![],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asg {
    pub id: AsgId,
    pub name: Option<String>,
    pub nodes: HashMap<NodeId, Node>,
    pub inputs: Vec<NodeId>,
    pub outputs: Vec<NodeId>,
}

impl Asg {
    pub fn new(id: AsgId, name: Option<String>) -> Self {
        Self {
            id,
            name,
            nodes: HashMap::new(),
            inputs: vec![],
            outputs: vec![],
        }
    }

    pub fn add_node(&mut self, name: Option<String>, node_type: NodeType) -> NodeId {
        let new_id = self.nodes.len();
        // Literal shapes are known up front so inference never stalls on them.
        let shape = match &node_type {
            NodeType::Literal(value) => Some(value.shape()),
            _ => None,
        };
        let node = Node {
            id: new_id,
            name,
            node_type,
            shape,
        };
        self.nodes.insert(new_id, node);
        new_id
    }

    pub fn set_outputs(&mut self, outputs: Vec<NodeId>) {
        self.outputs = outputs;
    }

    pub fn set_output(&mut self, output: NodeId) {
        self.set_outputs(vec![output]);
    }

    pub fn get_node(&self, id: NodeId) -> AsgResult<&Node> {
        self.nodes.get(&id).ok_or(AsgError::NodeNotFound(id))
    }

    pub fn get_node_mut(&mut self, id: NodeId) -> AsgResult<&mut Node> {
        self.nodes.get_mut(&id).ok_or(AsgError::NodeNotFound(id))
    }

    /// Finds the node that reads the named input or parameter.
    pub fn find_named_leaf(&self, name: &str) -> Option<NodeId> {
        self.nodes.values().find_map(|node| match &node.node_type {
            NodeType::Input { name: n } | NodeType::Parameter { name: n } if n == name => {
                Some(node.id)
            }
            _ => None,
        })
    }
}
