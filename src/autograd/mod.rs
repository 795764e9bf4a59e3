//! Autograd: builds the graph of gradients d(loss)/d(node).
//!
//! Algorithm:
//!  - walk the forward graph in reverse topological order;
//!  - for every node holding dL/dY, emit its contributions to the operands
//!    and accumulate them by summation;
//!  - emit everything into a separate `grad` ASG. Forward values are read
//!    through `External` nodes, so the grad graph must be executed with the
//!    memo of a forward run of the same source graph.
//!
//! Only nodes that lie on a path from a requested leaf to the loss receive
//! gradients; everything else (inputs, literals, running statistics) is
//! skipped.
//!
//! Shape-dependent gradients (`Broadcast`, `ReduceSumTo`, `ReshapeLike`,
//! ...) take the runtime shape of a forward value, so the grad graph needs
//! no static shape information.

use crate::analysis::topological_order;
use crate::asg::{Asg, AsgError, NodeId, NodeType, Value};
use std::collections::{HashMap, HashSet};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AutogradError {
    #[error("ASG: {0}")]
    Asg(#[from] AsgError),
    #[error("No gradient rule for operation '{0}'")]
    NotDifferentiable(String),
}

pub type AutogradResult<T> = Result<T, AutogradError>;

/// Gradient graph builder for one source graph.
pub struct Gradients<'a> {
    /// Forward graph.
    src: &'a Asg,
    /// Gradient graph under construction.
    grad: Asg,
    /// Forward node -> accumulated gradient node in `grad`.
    gmap: HashMap<NodeId, NodeId>,
    /// Forward node -> `External` node in `grad` reading its value.
    externals: HashMap<NodeId, NodeId>,
    /// Forward nodes with a path from one of the requested leaves.
    needs_grad: HashSet<NodeId>,
}

impl<'a> Gradients<'a> {
    pub fn new(src: &'a Asg) -> Self {
        Self {
            src,
            grad: Asg::new(src.id + 1, Some("grad".to_string())),
            gmap: HashMap::new(),
            externals: HashMap::new(),
            needs_grad: HashSet::new(),
        }
    }

    /// Builds the gradient graph of the scalar `loss` with respect to `wrt`.
    ///
    /// The returned graph's outputs are the gradients in `wrt` order. A leaf
    /// the loss does not depend on gets an all-zero gradient of its shape.
    pub fn build(mut self, loss: NodeId, wrt: &[NodeId]) -> AutogradResult<Asg> {
        let order = topological_order(self.src, &[loss])?;

        let targets: HashSet<NodeId> = wrt.iter().copied().collect();
        for &id in &order {
            let node = self.src.get_node(id)?;
            if targets.contains(&id)
                || node
                    .node_type
                    .operands()
                    .iter()
                    .any(|operand| self.needs_grad.contains(operand))
            {
                self.needs_grad.insert(id);
            }
        }

        if self.needs_grad.contains(&loss) {
            let seed = self.scalar(1.0);
            self.gmap.insert(loss, seed);
        }

        for &id in order.iter().rev() {
            let Some(g_out) = self.gmap.get(&id).copied() else {
                continue;
            };
            let node_type = self.src.get_node(id)?.node_type.clone();
            self.backprop(id, &node_type, g_out)?;
        }

        let mut outputs = Vec::with_capacity(wrt.len());
        for &leaf in wrt {
            let g = match self.gmap.get(&leaf).copied() {
                Some(g) => g,
                None => {
                    let value = self.ext(leaf);
                    let zero = self.scalar(0.0);
                    self.add_node(NodeType::Multiply(value, zero))
                }
            };
            outputs.push(g);
        }
        self.grad.set_outputs(outputs);
        debug!(
            forward_nodes = order.len(),
            grad_nodes = self.grad.nodes.len(),
            "built gradient graph"
        );
        Ok(self.grad)
    }

    /// Emits the operand contributions of one forward node.
    fn backprop(&mut self, id: NodeId, node_type: &NodeType, g: NodeId) -> AutogradResult<()> {
        match node_type {
            NodeType::Input { .. }
            | NodeType::Parameter { .. }
            | NodeType::Literal(_)
            | NodeType::External { .. }
            | NodeType::GreaterThan(..)
            | NodeType::DropoutMask { .. } => {}

            NodeType::Add(a, b) => {
                self.acc_reduced(*a, g);
                self.acc_reduced(*b, g);
            }
            NodeType::Subtract(a, b) => {
                self.acc_reduced(*a, g);
                if self.wants(*b) {
                    let neg = self.add_node(NodeType::Negate(g));
                    self.acc_reduced(*b, neg);
                }
            }
            NodeType::Multiply(a, b) => {
                if self.wants(*a) {
                    let b_val = self.ext(*b);
                    let ga = self.add_node(NodeType::Multiply(g, b_val));
                    self.acc_reduced(*a, ga);
                }
                if self.wants(*b) {
                    let a_val = self.ext(*a);
                    let gb = self.add_node(NodeType::Multiply(g, a_val));
                    self.acc_reduced(*b, gb);
                }
            }
            NodeType::Divide(a, b) => {
                let b_val = self.ext(*b);
                if self.wants(*a) {
                    let ga = self.add_node(NodeType::Divide(g, b_val));
                    self.acc_reduced(*a, ga);
                }
                if self.wants(*b) {
                    // d(a/b)/db = -(a/b)/b
                    let y = self.ext(id);
                    let gy = self.add_node(NodeType::Multiply(g, y));
                    let q = self.add_node(NodeType::Divide(gy, b_val));
                    let gb = self.add_node(NodeType::Negate(q));
                    self.acc_reduced(*b, gb);
                }
            }
            NodeType::MatrixMultiply(a, b) => {
                if self.wants(*a) {
                    let b_val = self.ext(*b);
                    let bt = self.add_node(NodeType::Transpose(b_val, 0, 1));
                    let ga = self.add_node(NodeType::MatrixMultiply(g, bt));
                    self.acc(*a, ga);
                }
                if self.wants(*b) {
                    let a_val = self.ext(*a);
                    let at = self.add_node(NodeType::Transpose(a_val, 0, 1));
                    let gb = self.add_node(NodeType::MatrixMultiply(at, g));
                    self.acc(*b, gb);
                }
            }

            NodeType::Negate(a) => {
                let ga = self.add_node(NodeType::Negate(g));
                self.acc(*a, ga);
            }
            NodeType::Exp(a) => {
                let y = self.ext(id);
                let ga = self.add_node(NodeType::Multiply(g, y));
                self.acc(*a, ga);
            }
            NodeType::Log(a) => {
                let x = self.ext(*a);
                let ga = self.add_node(NodeType::Divide(g, x));
                self.acc(*a, ga);
            }
            NodeType::Sqrt(a) => {
                let y = self.ext(id);
                let two = self.scalar(2.0);
                let denom = self.add_node(NodeType::Multiply(two, y));
                let ga = self.add_node(NodeType::Divide(g, denom));
                self.acc(*a, ga);
            }
            NodeType::ReLU(a) => {
                let x = self.ext(*a);
                let zero = self.scalar(0.0);
                let mask = self.add_node(NodeType::GreaterThan(x, zero));
                let ga = self.add_node(NodeType::Multiply(g, mask));
                self.acc(*a, ga);
            }
            NodeType::Sigmoid(a) => {
                // y * (1 - y)
                let y = self.ext(id);
                let one = self.scalar(1.0);
                let one_minus = self.add_node(NodeType::Subtract(one, y));
                let local = self.add_node(NodeType::Multiply(y, one_minus));
                let ga = self.add_node(NodeType::Multiply(g, local));
                self.acc(*a, ga);
            }
            NodeType::Tanh(a) => {
                // 1 - y^2
                let y = self.ext(id);
                let one = self.scalar(1.0);
                let y2 = self.add_node(NodeType::Multiply(y, y));
                let local = self.add_node(NodeType::Subtract(one, y2));
                let ga = self.add_node(NodeType::Multiply(g, local));
                self.acc(*a, ga);
            }
            NodeType::Softmax(a) => {
                // y * (g - sum(g * y, last axis))
                let y = self.ext(id);
                let gy = self.add_node(NodeType::Multiply(g, y));
                let dot = self.add_node(NodeType::SumAxes(gy, vec![-1]));
                let centered = self.add_node(NodeType::Subtract(g, dot));
                let ga = self.add_node(NodeType::Multiply(y, centered));
                self.acc(*a, ga);
            }

            NodeType::Sum(a) | NodeType::SumAxes(a, _) => {
                let x = self.ext(*a);
                let ga = self.add_node(NodeType::Broadcast(g, x));
                self.acc(*a, ga);
            }
            NodeType::MeanAxes(a, axes) => {
                let x = self.ext(*a);
                let ga = self.add_node(NodeType::MeanAxesBackward {
                    grad_output: g,
                    input: x,
                    axes: axes.clone(),
                });
                self.acc(*a, ga);
            }

            NodeType::Reshape(a, _) | NodeType::ReshapeLike(a, _) => {
                let x = self.ext(*a);
                let ga = self.add_node(NodeType::ReshapeLike(g, x));
                self.acc(*a, ga);
            }
            NodeType::Transpose(a, axis1, axis2) => {
                let ga = self.add_node(NodeType::Transpose(g, *axis1, *axis2));
                self.acc(*a, ga);
            }
            NodeType::Broadcast(a, _) => {
                self.acc_reduced(*a, g);
            }
            NodeType::ReduceSumTo(a, _) => {
                let x = self.ext(*a);
                let ga = self.add_node(NodeType::Broadcast(g, x));
                self.acc(*a, ga);
            }

            NodeType::Slice {
                input,
                axis,
                start,
                end,
                step,
            } => {
                let x = self.ext(*input);
                let ga = self.add_node(NodeType::SliceBackward {
                    grad_output: g,
                    input: x,
                    axis: *axis,
                    start: *start,
                    end: *end,
                    step: *step,
                });
                self.acc(*input, ga);
            }
            NodeType::Concat { inputs, axis } => {
                let values: Vec<NodeId> = inputs.iter().map(|&i| self.ext(i)).collect();
                for (index, &operand) in inputs.iter().enumerate() {
                    if !self.wants(operand) {
                        continue;
                    }
                    let ga = self.add_node(NodeType::ConcatBackward {
                        grad_output: g,
                        inputs: values.clone(),
                        index,
                        axis: *axis,
                    });
                    self.acc(operand, ga);
                }
            }

            NodeType::Conv2d {
                input,
                weight,
                geometry,
            } => {
                let x = self.ext(*input);
                let w = self.ext(*weight);
                if self.wants(*input) {
                    let gx = self.add_node(NodeType::Conv2dBackwardInput {
                        grad_output: g,
                        weight: w,
                        input: x,
                        geometry: *geometry,
                    });
                    self.acc(*input, gx);
                }
                if self.wants(*weight) {
                    let gw = self.add_node(NodeType::Conv2dBackwardWeight {
                        grad_output: g,
                        input: x,
                        weight: w,
                        geometry: *geometry,
                    });
                    self.acc(*weight, gw);
                }
            }
            NodeType::AvgPool2d {
                input,
                kernel_size,
                stride,
            } => {
                let x = self.ext(*input);
                let ga = self.add_node(NodeType::AvgPool2dBackward {
                    grad_output: g,
                    input: x,
                    kernel_size: *kernel_size,
                    stride: *stride,
                });
                self.acc(*input, ga);
            }

            NodeType::MeanAxesBackward { .. }
            | NodeType::SliceBackward { .. }
            | NodeType::ConcatBackward { .. }
            | NodeType::Conv2dBackwardInput { .. }
            | NodeType::Conv2dBackwardWeight { .. }
            | NodeType::AvgPool2dBackward { .. } => {
                return Err(AutogradError::NotDifferentiable(
                    node_type.op_name().to_string(),
                ));
            }
        }
        Ok(())
    }

    fn wants(&self, id: NodeId) -> bool {
        self.needs_grad.contains(&id)
    }

    /// Accumulates `g` into the gradient of `target`.
    fn acc(&mut self, target: NodeId, g: NodeId) {
        if !self.wants(target) {
            return;
        }
        let total = match self.gmap.get(&target).copied() {
            Some(existing) => self.add_node(NodeType::Add(existing, g)),
            None => g,
        };
        self.gmap.insert(target, total);
    }

    /// Sums a broadcast gradient back to the shape of `target`, then
    /// accumulates it.
    fn acc_reduced(&mut self, target: NodeId, g: NodeId) {
        if !self.wants(target) {
            return;
        }
        let like = self.ext(target);
        let reduced = self.add_node(NodeType::ReduceSumTo(g, like));
        self.acc(target, reduced);
    }

    /// `External` node reading the forward value of `src_id`.
    fn ext(&mut self, src_id: NodeId) -> NodeId {
        if let Some(&id) = self.externals.get(&src_id) {
            return id;
        }
        let id = self.grad.add_node(
            None,
            NodeType::External {
                source_asg_id: self.src.id,
                source_node_id: src_id,
            },
        );
        self.externals.insert(src_id, id);
        id
    }

    fn scalar(&mut self, value: f32) -> NodeId {
        self.grad
            .add_node(None, NodeType::Literal(Value::ScalarF32(value)))
    }

    fn add_node(&mut self, node_type: NodeType) -> NodeId {
        self.grad.add_node(None, node_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_paths_to_requested_leaves_are_differentiated() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(None, NodeType::Input { name: "x".into() });
        let w = asg.add_node(None, NodeType::Parameter { name: "w".into() });
        let y = asg.add_node(None, NodeType::Multiply(x, w));
        let loss = asg.add_node(None, NodeType::Sum(y));
        let grad = Gradients::new(&asg).build(loss, &[w]).unwrap();
        assert_eq!(grad.id, 1);
        assert_eq!(grad.outputs.len(), 1);
        // No Negate/Multiply chain is built towards the input.
        let externals: Vec<NodeId> = grad
            .nodes
            .values()
            .filter_map(|n| match n.node_type {
                NodeType::External { source_node_id, .. } => Some(source_node_id),
                _ => None,
            })
            .collect();
        assert!(externals.contains(&x));
        assert!(externals.contains(&w));
    }

    #[test]
    fn unrelated_leaf_gets_zero_gradient() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(None, NodeType::Input { name: "x".into() });
        let unused = asg.add_node(None, NodeType::Parameter { name: "u".into() });
        let loss = asg.add_node(None, NodeType::Sum(x));
        let grad = Gradients::new(&asg).build(loss, &[unused]).unwrap();
        let out = grad.get_node(grad.outputs[0]).unwrap();
        assert!(matches!(out.node_type, NodeType::Multiply(..)));
    }

    #[test]
    fn backward_nodes_are_not_differentiable() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(None, NodeType::Input { name: "x".into() });
        let g = asg.add_node(
            None,
            NodeType::MeanAxesBackward {
                grad_output: x,
                input: x,
                axes: vec![0],
            },
        );
        let loss = asg.add_node(None, NodeType::Sum(g));
        let err = Gradients::new(&asg).build(loss, &[x]).unwrap_err();
        assert_eq!(err, AutogradError::NotDifferentiable("MeanAxesBackward".into()));
    }
}
