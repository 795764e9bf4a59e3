//! Shape inference.
//!
//! Traverses the computation graph and determines the output shape of
//! every node from its operand shapes and operation type.

use super::topological_order;
use crate::asg::{Asg, AsgError, ConvGeometry, Node, NodeId, NodeType, Shape};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeInferenceError {
    #[error("Graph error: {0}")]
    AsgError(#[from] AsgError),

    #[error("Incompatible shapes for operation '{op}': {shape1:?} and {shape2:?}")]
    IncompatibleShapes {
        op: String,
        shape1: Shape,
        shape2: Shape,
    },

    #[error("Shape information missing for node {0}")]
    MissingShapeInfo(NodeId),

    #[error("Initial shape not specified for '{0}'. Add it to the initial shapes passed to ShapeInference::run()")]
    MissingInitialShape(String),

    #[error("Invalid tensor rank for node {node_id}: expected {expected}D, got {actual}D")]
    InvalidRank {
        node_id: NodeId,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid axis {axis} for node {node_id} of rank {rank}")]
    InvalidAxis { node_id: NodeId, axis: isize, rank: usize },

    #[error("Cannot reshape {from:?} into {to:?} at node {node_id}")]
    InvalidReshape { node_id: NodeId, from: Shape, to: Vec<i64> },

    #[error("Shape inference not implemented for operation: {0}")]
    UnimplementedNodeType(String),
}

type Result<T> = std::result::Result<T, ShapeInferenceError>;

/// Performs shape inference for an ASG.
pub struct ShapeInference;

impl ShapeInference {
    /// Fills in the `shape` field of every node reachable from the graph
    /// outputs (or of every node, when the graph has no outputs yet).
    ///
    /// `initial_shapes` provides shapes for all `Input` and `Parameter`
    /// nodes, keyed by name.
    pub fn run(asg: &mut Asg, initial_shapes: &HashMap<String, Shape>) -> Result<()> {
        let sorted_nodes = if asg.outputs.is_empty() {
            let mut all: Vec<NodeId> = asg.nodes.keys().copied().collect();
            all.sort_unstable();
            all
        } else {
            Self::topological_sort(asg)?
        };

        for node_id in sorted_nodes {
            let node = asg.get_node(node_id)?.clone();
            let shape = Self::infer_node_shape(asg, &node, initial_shapes)?;
            asg.get_node_mut(node_id)?.shape = Some(shape);
        }
        Ok(())
    }

    /// Nodes the graph outputs depend on, operands first.
    pub fn topological_sort(asg: &Asg) -> Result<Vec<NodeId>> {
        Ok(topological_order(asg, &asg.outputs)?)
    }

    fn infer_node_shape(
        asg: &Asg,
        node: &Node,
        initial_shapes: &HashMap<String, Shape>,
    ) -> Result<Shape> {
        let id = node.id;
        match &node.node_type {
            NodeType::Input { name } | NodeType::Parameter { name } => initial_shapes
                .get(name)
                .cloned()
                .ok_or_else(|| ShapeInferenceError::MissingInitialShape(name.clone())),

            NodeType::Literal(value) => Ok(value.shape()),

            NodeType::External { .. } => Err(ShapeInferenceError::UnimplementedNodeType(
                "External".to_string(),
            )),

            NodeType::Add(l, r)
            | NodeType::Subtract(l, r)
            | NodeType::Multiply(l, r)
            | NodeType::Divide(l, r)
            | NodeType::GreaterThan(l, r) => {
                let ls = Self::get_shape(asg, *l)?;
                let rs = Self::get_shape(asg, *r)?;
                broadcast(&ls, &rs).ok_or(ShapeInferenceError::IncompatibleShapes {
                    op: node.node_type.op_name().to_string(),
                    shape1: ls,
                    shape2: rs,
                })
            }

            NodeType::MatrixMultiply(l, r) => {
                let ls = Self::get_shape(asg, *l)?;
                let rs = Self::get_shape(asg, *r)?;
                match (ls.as_slice(), rs.as_slice()) {
                    ([m, k1], [k2, n]) if k1 == k2 => Ok(vec![*m, *n]),
                    ([_, _], [_, _]) => Err(ShapeInferenceError::IncompatibleShapes {
                        op: "MatrixMultiply".to_string(),
                        shape1: ls,
                        shape2: rs,
                    }),
                    _ => Err(ShapeInferenceError::InvalidRank {
                        node_id: id,
                        expected: 2,
                        actual: if ls.len() != 2 { ls.len() } else { rs.len() },
                    }),
                }
            }

            NodeType::Negate(a)
            | NodeType::Exp(a)
            | NodeType::Log(a)
            | NodeType::Sqrt(a)
            | NodeType::ReLU(a)
            | NodeType::Sigmoid(a)
            | NodeType::Tanh(a)
            | NodeType::Softmax(a)
            | NodeType::DropoutMask { input: a, .. } => Self::get_shape(asg, *a),

            NodeType::Sum(_) => Ok(vec![]),

            NodeType::SumAxes(a, axes) | NodeType::MeanAxes(a, axes) => {
                let mut shape = Self::get_shape(asg, *a)?;
                for &axis in axes {
                    let resolved = resolve_axis(id, axis, shape.len())?;
                    shape[resolved] = 1;
                }
                Ok(shape)
            }

            NodeType::Reshape(a, target) => {
                let from = Self::get_shape(asg, *a)?;
                let len: usize = from.iter().product();
                let known: i64 = target.iter().filter(|&&d| d >= 0).product();
                let inferred = target.iter().filter(|&&d| d < 0).count();
                let resolved: Shape = target
                    .iter()
                    .map(|&d| if d < 0 && known > 0 { len / known as usize } else { d.max(0) as usize })
                    .collect();
                if inferred > 1 || resolved.iter().product::<usize>() != len {
                    return Err(ShapeInferenceError::InvalidReshape {
                        node_id: id,
                        from,
                        to: target.clone(),
                    });
                }
                Ok(resolved)
            }

            NodeType::ReshapeLike(_, like)
            | NodeType::Broadcast(_, like)
            | NodeType::ReduceSumTo(_, like) => Self::get_shape(asg, *like),

            NodeType::MeanAxesBackward { input, .. }
            | NodeType::SliceBackward { input, .. }
            | NodeType::AvgPool2dBackward { input, .. }
            | NodeType::Conv2dBackwardInput { input, .. } => Self::get_shape(asg, *input),

            NodeType::Conv2dBackwardWeight { weight, .. } => Self::get_shape(asg, *weight),

            NodeType::ConcatBackward { inputs, index, .. } => {
                let target = inputs
                    .get(*index)
                    .ok_or(ShapeInferenceError::MissingShapeInfo(id))?;
                Self::get_shape(asg, *target)
            }

            NodeType::Transpose(a, axis1, axis2) => {
                let mut shape = Self::get_shape(asg, *a)?;
                if *axis1 >= shape.len() || *axis2 >= shape.len() {
                    return Err(ShapeInferenceError::InvalidRank {
                        node_id: id,
                        expected: axis1.max(axis2) + 1,
                        actual: shape.len(),
                    });
                }
                shape.swap(*axis1, *axis2);
                Ok(shape)
            }

            NodeType::Slice {
                input,
                axis,
                start,
                end,
                step,
            } => {
                let mut shape = Self::get_shape(asg, *input)?;
                let len = *shape.get(*axis).ok_or(ShapeInferenceError::InvalidAxis {
                    node_id: id,
                    axis: *axis as isize,
                    rank: shape.len(),
                })?;
                let stop = end.unwrap_or(len);
                if *step == 0 || *start > stop || stop > len {
                    return Err(ShapeInferenceError::InvalidAxis {
                        node_id: id,
                        axis: *axis as isize,
                        rank: shape.len(),
                    });
                }
                shape[*axis] = (stop - start + step - 1) / step;
                Ok(shape)
            }

            NodeType::Concat { inputs, axis } => {
                let mut iter = inputs.iter();
                let first = iter.next().ok_or(ShapeInferenceError::MissingShapeInfo(id))?;
                let mut shape = Self::get_shape(asg, *first)?;
                if *axis >= shape.len() {
                    return Err(ShapeInferenceError::InvalidAxis {
                        node_id: id,
                        axis: *axis as isize,
                        rank: shape.len(),
                    });
                }
                for other in iter {
                    let other_shape = Self::get_shape(asg, *other)?;
                    let compatible = other_shape.len() == shape.len()
                        && other_shape
                            .iter()
                            .zip(&shape)
                            .enumerate()
                            .all(|(i, (a, b))| i == *axis || a == b);
                    if !compatible {
                        return Err(ShapeInferenceError::IncompatibleShapes {
                            op: "Concat".to_string(),
                            shape1: shape,
                            shape2: other_shape,
                        });
                    }
                    shape[*axis] += other_shape[*axis];
                }
                Ok(shape)
            }

            // [N, C_in, H, W] * [C_out, C_in / g, kH, kW] -> [N, C_out, H_out, W_out]
            NodeType::Conv2d {
                input,
                weight,
                geometry,
            } => {
                let input_shape = Self::get_shape(asg, *input)?;
                let weight_shape = Self::get_shape(asg, *weight)?;
                conv_output_shape(id, &input_shape, &weight_shape, geometry)
            }

            NodeType::AvgPool2d {
                input,
                kernel_size,
                stride,
            } => {
                let shape = Self::get_shape(asg, *input)?;
                match shape.as_slice() {
                    [n, c, h, w] if *h >= kernel_size.0 && *w >= kernel_size.1 => Ok(vec![
                        *n,
                        *c,
                        (h - kernel_size.0) / stride.0 + 1,
                        (w - kernel_size.1) / stride.1 + 1,
                    ]),
                    [_, _, _, _] => Err(ShapeInferenceError::IncompatibleShapes {
                        op: "AvgPool2d".to_string(),
                        shape1: shape.clone(),
                        shape2: vec![kernel_size.0, kernel_size.1],
                    }),
                    _ => Err(ShapeInferenceError::InvalidRank {
                        node_id: id,
                        expected: 4,
                        actual: shape.len(),
                    }),
                }
            }
        }
    }

    /// Helper to get the already inferred shape of a node.
    fn get_shape(asg: &Asg, node_id: NodeId) -> Result<Shape> {
        asg.get_node(node_id)?
            .shape
            .clone()
            .ok_or(ShapeInferenceError::MissingShapeInfo(node_id))
    }
}

fn resolve_axis(node_id: NodeId, axis: isize, rank: usize) -> Result<usize> {
    let resolved = if axis < 0 { axis + rank as isize } else { axis };
    if resolved < 0 || resolved as usize >= rank {
        return Err(ShapeInferenceError::InvalidAxis { node_id, axis, rank });
    }
    Ok(resolved as usize)
}

fn broadcast(a: &[usize], b: &[usize]) -> Option<Shape> {
    let rank = a.len().max(b.len());
    let pad = |s: &[usize], i: usize| {
        if i + s.len() >= rank {
            s[i + s.len() - rank]
        } else {
            1
        }
    };
    (0..rank)
        .map(|i| match (pad(a, i), pad(b, i)) {
            (x, y) if x == y => Some(x),
            (1, y) => Some(y),
            (x, 1) => Some(x),
            _ => None,
        })
        .collect()
}

fn conv_output_shape(
    node_id: NodeId,
    input: &[usize],
    weight: &[usize],
    geometry: &ConvGeometry,
) -> Result<Shape> {
    let (&[n, c_in, h, w], &[c_out, c_in_per_group, kh, kw]) = (input, weight) else {
        return Err(ShapeInferenceError::InvalidRank {
            node_id,
            expected: 4,
            actual: if input.len() != 4 { input.len() } else { weight.len() },
        });
    };
    if !geometry.admits_kernel((kh, kw)) {
        return Err(ShapeInferenceError::IncompatibleShapes {
            op: "Conv2d".to_string(),
            shape1: input.to_vec(),
            shape2: weight.to_vec(),
        });
    }
    let groups = geometry.groups.max(1);
    let eff_kh = (kh - 1) * geometry.dilation.0 + 1;
    let eff_kw = (kw - 1) * geometry.dilation.1 + 1;
    let padded_h = h + 2 * geometry.padding.0;
    let padded_w = w + 2 * geometry.padding.1;
    if c_in != c_in_per_group * groups || c_out % groups != 0 || padded_h < eff_kh || padded_w < eff_kw {
        return Err(ShapeInferenceError::IncompatibleShapes {
            op: "Conv2d".to_string(),
            shape1: input.to_vec(),
            shape2: weight.to_vec(),
        });
    }
    Ok(vec![
        n,
        c_out,
        (padded_h - eff_kh) / geometry.stride.0 + 1,
        (padded_w - eff_kw) / geometry.stride.1 + 1,
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shapes(entries: &[(&str, &[usize])]) -> HashMap<String, Shape> {
        entries
            .iter()
            .map(|(name, shape)| (name.to_string(), shape.to_vec()))
            .collect()
    }

    #[test]
    fn conv_output_follows_geometry() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(None, NodeType::Input { name: "x".into() });
        let w = asg.add_node(None, NodeType::Parameter { name: "w".into() });
        let geometry = ConvGeometry {
            stride: (2, 2),
            padding: (2, 2),
            dilation: (2, 2),
            groups: 1,
        };
        let y = asg.add_node(None, NodeType::Conv2d { input: x, weight: w, geometry });
        asg.set_output(y);
        ShapeInference::run(&mut asg, &shapes(&[("x", &[2, 3, 8, 8]), ("w", &[16, 3, 3, 3])])).unwrap();
        assert_eq!(asg.get_node(y).unwrap().shape, Some(vec![2, 16, 4, 4]));
    }

    #[test]
    fn channel_mismatch_is_reported() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(None, NodeType::Input { name: "x".into() });
        let w = asg.add_node(None, NodeType::Parameter { name: "w".into() });
        let y = asg.add_node(
            None,
            NodeType::Conv2d {
                input: x,
                weight: w,
                geometry: ConvGeometry::default(),
            },
        );
        asg.set_output(y);
        let err = ShapeInference::run(&mut asg, &shapes(&[("x", &[1, 4, 8, 8]), ("w", &[8, 3, 1, 1])]));
        assert!(matches!(err, Err(ShapeInferenceError::IncompatibleShapes { .. })));
    }

    #[test]
    fn concat_and_strided_slice() {
        let mut asg = Asg::new(0, None);
        let a = asg.add_node(None, NodeType::Input { name: "a".into() });
        let b = asg.add_node(None, NodeType::Input { name: "b".into() });
        let cat = asg.add_node(None, NodeType::Concat { inputs: vec![a, b], axis: 1 });
        let odd = asg.add_node(
            None,
            NodeType::Slice {
                input: cat,
                axis: 1,
                start: 1,
                end: None,
                step: 2,
            },
        );
        asg.set_output(odd);
        ShapeInference::run(&mut asg, &shapes(&[("a", &[2, 3, 4, 4]), ("b", &[2, 4, 4, 4])])).unwrap();
        assert_eq!(asg.get_node(cat).unwrap().shape, Some(vec![2, 7, 4, 4]));
        assert_eq!(asg.get_node(odd).unwrap().shape, Some(vec![2, 3, 4, 4]));
    }

    #[test]
    fn reductions_keep_rank() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(None, NodeType::Input { name: "x".into() });
        let m = asg.add_node(None, NodeType::MeanAxes(x, vec![0, 2, 3]));
        let r = asg.add_node(None, NodeType::Reshape(m, vec![-1]));
        asg.set_output(r);
        ShapeInference::run(&mut asg, &shapes(&[("x", &[4, 6, 5, 5])])).unwrap();
        assert_eq!(asg.get_node(m).unwrap().shape, Some(vec![1, 6, 1, 1]));
        assert_eq!(asg.get_node(r).unwrap().shape, Some(vec![6]));
    }
}
