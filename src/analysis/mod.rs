//! # Graph Analysis Module
//!
//! Passes that process the ASG before execution.
//!
//! - [`topological_order`]: the evaluation order of everything a set of
//!   roots depends on.
//! - [`ShapeInference`](shape_inference::ShapeInference): propagates
//!   tensor shapes through the graph, catching shape mismatches (channel
//!   counts, concatenation extents, convolution geometry) before any
//!   data is touched.
//!
//! ## Example
//!
//! ```ignore
//! use smashnet::analysis::shape_inference::ShapeInference;
//!
//! let mut graph = context.borrow().main_graph().clone();
//! let shapes = HashMap::from([("input".to_string(), vec![8, 3, 32, 32])]);
//! ShapeInference::run(&mut graph, &shapes)?;
//! ```

pub mod shape_inference;

use crate::asg::{Asg, AsgResult, NodeId};
use std::collections::HashSet;

/// Returns `roots` and all of their transitive operands in an order where
/// every node comes after its operands.
///
/// Node ids are assigned in creation order and a node can only read nodes
/// that already exist, so ascending id order is a valid topological order.
/// The walk uses an explicit stack; deep residual graphs would otherwise
/// overflow the call stack.
pub fn topological_order(asg: &Asg, roots: &[NodeId]) -> AsgResult<Vec<NodeId>> {
    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut stack: Vec<NodeId> = roots.to_vec();
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        let node = asg.get_node(id)?;
        stack.extend(
            node.node_type
                .operands()
                .into_iter()
                .filter(|operand| !visited.contains(operand)),
        );
    }
    let mut order: Vec<NodeId> = visited.into_iter().collect();
    order.sort_unstable();
    Ok(order)
}
