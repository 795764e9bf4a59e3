//! Backend that executes the ASG on the CPU.
//!
//! Walks the graph in topological order and computes every node with
//! `ndarray`. Convolutions use direct loops over NCHW arrays.

use super::backend::{Backend, Memo, RuntimeError};
use crate::analysis::topological_order;
use crate::asg::{Asg, AsgId, ConvGeometry, NodeId, NodeType, Value};
use ndarray::{Array2, Array4, ArrayD, ArrayViewD, Axis, IxDyn, Slice, Zip};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::cell::RefCell;
use std::collections::HashMap;

type OpResult = Result<ArrayD<f32>, RuntimeError>;

/// Execution state for one graph run on the CPU.
struct ExecutionContext<'a> {
    asg: &'a Asg,
    memo: Memo<Value>,
    rng: &'a RefCell<StdRng>,
}

impl<'a> ExecutionContext<'a> {
    fn value(&self, node_id: NodeId) -> Result<ArrayViewD<'_, f32>, RuntimeError> {
        match self.memo.get(&(self.asg.id, node_id)) {
            Some(Value::Tensor(arr)) => Ok(arr.view()),
            Some(Value::ScalarF32(_)) => Err(RuntimeError::ComputationError(format!(
                "node {} holds an unconverted scalar",
                node_id
            ))),
            None => Err(RuntimeError::NodeNotFound(node_id, self.asg.id)),
        }
    }

    /// Computes one node; all of its operands are already in the memo.
    fn evaluate_node(&mut self, node_id: NodeId) -> Result<(), RuntimeError> {
        let asg_id: AsgId = self.asg.id;
        if self.memo.contains_key(&(asg_id, node_id)) {
            return Ok(());
        }
        let asg = self.asg;
        let node = asg
            .nodes
            .get(&node_id)
            .ok_or(RuntimeError::NodeNotFound(node_id, asg_id))?;

        let result = match &node.node_type {
            NodeType::Input { name } => {
                return Err(RuntimeError::MissingInput(name.clone(), node.id));
            }
            NodeType::Parameter { name } => {
                return Err(RuntimeError::MissingParameter(name.clone(), node.id));
            }
            NodeType::Literal(value) => Ok(value.clone().into_tensor()),
            NodeType::External {
                source_asg_id,
                source_node_id,
            } => self
                .memo
                .get(&(*source_asg_id, *source_node_id))
                .cloned()
                .map(Value::into_tensor)
                .ok_or(RuntimeError::NodeNotFound(*source_node_id, *source_asg_id)),

            NodeType::Add(l, r) => binary(self.value(*l)?, self.value(*r)?, |a, b| a + b),
            NodeType::Subtract(l, r) => binary(self.value(*l)?, self.value(*r)?, |a, b| a - b),
            NodeType::Multiply(l, r) => binary(self.value(*l)?, self.value(*r)?, |a, b| a * b),
            NodeType::Divide(l, r) => binary(self.value(*l)?, self.value(*r)?, |a, b| a / b),
            NodeType::GreaterThan(l, r) => binary(self.value(*l)?, self.value(*r)?, |a, b| {
                if a > b {
                    1.0
                } else {
                    0.0
                }
            }),
            NodeType::MatrixMultiply(l, r) => op_matmul(self.value(*l)?, self.value(*r)?),

            NodeType::Negate(op) => Ok(self.value(*op)?.mapv(|x| -x)),
            NodeType::Exp(op) => Ok(self.value(*op)?.mapv(f32::exp)),
            NodeType::Log(op) => Ok(self.value(*op)?.mapv(f32::ln)),
            NodeType::Sqrt(op) => Ok(self.value(*op)?.mapv(f32::sqrt)),
            NodeType::ReLU(op) => Ok(self.value(*op)?.mapv(|x| x.max(0.0))),
            NodeType::Sigmoid(op) => Ok(self.value(*op)?.mapv(|x| 1.0 / (1.0 + (-x).exp()))),
            NodeType::Tanh(op) => Ok(self.value(*op)?.mapv(f32::tanh)),
            NodeType::Softmax(op) => op_softmax(self.value(*op)?),

            NodeType::Sum(op) => Ok(ndarray::arr0(self.value(*op)?.sum()).into_dyn()),
            NodeType::SumAxes(op, axes) => op_sum_axes(self.value(*op)?, axes),
            NodeType::MeanAxes(op, axes) => {
                let input = self.value(*op)?;
                let count = reduced_count(input.shape(), axes)?;
                Ok(op_sum_axes(input, axes)? / count as f32)
            }
            NodeType::MeanAxesBackward {
                grad_output,
                input,
                axes,
            } => {
                let input = self.value(*input)?;
                let count = reduced_count(input.shape(), axes)?;
                let grad = op_broadcast(self.value(*grad_output)?, input.shape())?;
                Ok(grad / count as f32)
            }

            NodeType::Reshape(op, shape) => {
                let input = self.value(*op)?;
                let target = resolve_shape(input.len(), shape)?;
                op_reshape(input, &target)
            }
            NodeType::ReshapeLike(op, like) => {
                let target = self.value(*like)?.shape().to_vec();
                op_reshape(self.value(*op)?, &target)
            }
            NodeType::Transpose(op, axis1, axis2) => op_transpose(self.value(*op)?, *axis1, *axis2),
            NodeType::Broadcast(op, like) => {
                let target = self.value(*like)?.shape().to_vec();
                op_broadcast(self.value(*op)?, &target)
            }
            NodeType::ReduceSumTo(op, like) => {
                let target = self.value(*like)?.shape().to_vec();
                op_reduce_sum_to(self.value(*op)?, &target)
            }

            NodeType::Slice {
                input,
                axis,
                start,
                end,
                step,
            } => {
                let input = self.value(*input)?;
                let slice = axis_slice(input.shape(), *axis, *start, *end, *step)?;
                Ok(input.slice_axis(Axis(*axis), slice).to_owned())
            }
            NodeType::SliceBackward {
                grad_output,
                input,
                axis,
                start,
                end,
                step,
            } => {
                let shape = self.value(*input)?.shape().to_vec();
                let slice = axis_slice(&shape, *axis, *start, *end, *step)?;
                let grad = self.value(*grad_output)?;
                let mut out = ArrayD::zeros(IxDyn(&shape));
                {
                    let mut window = out.slice_axis_mut(Axis(*axis), slice);
                    if window.shape() != grad.shape() {
                        return Err(RuntimeError::ShapeError(format!(
                            "slice gradient {:?} does not match window {:?}",
                            grad.shape(),
                            window.shape()
                        )));
                    }
                    window.assign(&grad);
                }
                Ok(out)
            }

            NodeType::Concat { inputs, axis } => {
                let views = inputs
                    .iter()
                    .map(|id| self.value(*id))
                    .collect::<Result<Vec<_>, _>>()?;
                ndarray::concatenate(Axis(*axis), &views)
                    .map_err(|e| RuntimeError::ShapeError(format!("Concat: {}", e)))
            }
            NodeType::ConcatBackward {
                grad_output,
                inputs,
                index,
                axis,
            } => {
                let target = inputs
                    .get(*index)
                    .ok_or_else(|| RuntimeError::ShapeError(format!("concat index {} out of range", index)))?;
                let mut offset = 0;
                for id in &inputs[..*index] {
                    offset += extent(self.value(*id)?.shape(), *axis)?;
                }
                let len = extent(self.value(*target)?.shape(), *axis)?;
                let grad = self.value(*grad_output)?;
                let slice = axis_slice(grad.shape(), *axis, offset, Some(offset + len), 1)?;
                Ok(grad.slice_axis(Axis(*axis), slice).to_owned())
            }

            NodeType::Conv2d {
                input,
                weight,
                geometry,
            } => op_conv2d(self.value(*input)?, self.value(*weight)?, geometry),
            NodeType::Conv2dBackwardInput {
                grad_output,
                weight,
                input,
                geometry,
            } => op_conv2d_backward_input(
                self.value(*grad_output)?,
                self.value(*weight)?,
                self.value(*input)?.shape(),
                geometry,
            ),
            NodeType::Conv2dBackwardWeight {
                grad_output,
                input,
                weight,
                geometry,
            } => op_conv2d_backward_weight(
                self.value(*grad_output)?,
                self.value(*input)?,
                self.value(*weight)?.shape(),
                geometry,
            ),
            NodeType::AvgPool2d {
                input,
                kernel_size,
                stride,
            } => op_avg_pool2d(self.value(*input)?, *kernel_size, *stride),
            NodeType::AvgPool2dBackward {
                grad_output,
                input,
                kernel_size,
                stride,
            } => op_avg_pool2d_backward(
                self.value(*grad_output)?,
                self.value(*input)?.shape(),
                *kernel_size,
                *stride,
            ),

            NodeType::DropoutMask { input, p } => {
                let shape = self.value(*input)?.shape().to_vec();
                Ok(dropout_mask(&shape, *p, &mut self.rng.borrow_mut()))
            }
        }?;

        self.memo.insert((asg_id, node_id), Value::Tensor(result));
        Ok(())
    }
}

/// CPU execution backend.
///
/// Owns the random generator that dropout masks are drawn from, so a
/// seeded backend reproduces the same masks run after run.
pub struct CpuBackend {
    rng: RefCell<StdRng>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self {
            rng: RefCell::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(seed: u64) -> Self {
        Self {
            rng: RefCell::new(StdRng::seed_from_u64(seed)),
        }
    }
}

impl Default for CpuBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for CpuBackend {
    type DeviceData = Value;

    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError> {
        Ok(data.clone())
    }

    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError> {
        let sorted_nodes = topological_order(main_asg, &main_asg.outputs)
            .map_err(|e| RuntimeError::ComputationError(format!("topological sort failed: {}", e)))?;

        let mut context = ExecutionContext {
            asg: main_asg,
            memo: initial_memo,
            rng: &self.rng,
        };
        for node_id in sorted_nodes {
            context.evaluate_node(node_id)?;
        }

        let mut results = Vec::with_capacity(main_asg.outputs.len());
        for output_node_id in &main_asg.outputs {
            let result = context
                .memo
                .get(&(main_asg.id, *output_node_id))
                .ok_or(RuntimeError::NodeNotFound(*output_node_id, main_asg.id))?
                .clone();
            results.push(result);
        }
        Ok((results, context.memo))
    }

    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError> {
        Ok(device_data.to_vec())
    }
}

// --- Elementwise helpers ---

fn broadcast_shapes(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    let rank = a.len().max(b.len());
    let mut out = vec![0; rank];
    for i in 0..rank {
        let da = if i + a.len() >= rank { a[i + a.len() - rank] } else { 1 };
        let db = if i + b.len() >= rank { b[i + b.len() - rank] } else { 1 };
        out[i] = match (da, db) {
            (x, y) if x == y => x,
            (1, y) => y,
            (x, 1) => x,
            _ => return None,
        };
    }
    Some(out)
}

/// Elementwise binary op with numpy-style broadcasting of both operands.
fn binary(a: ArrayViewD<f32>, b: ArrayViewD<f32>, f: impl Fn(f32, f32) -> f32) -> OpResult {
    let shape = broadcast_shapes(a.shape(), b.shape()).ok_or_else(|| {
        RuntimeError::ShapeError(format!(
            "cannot broadcast {:?} with {:?}",
            a.shape(),
            b.shape()
        ))
    })?;
    let (av, bv) = match (a.broadcast(shape.as_slice()), b.broadcast(shape.as_slice())) {
        (Some(av), Some(bv)) => (av, bv),
        _ => {
            return Err(RuntimeError::ShapeError(format!(
                "cannot broadcast {:?} with {:?}",
                a.shape(),
                b.shape()
            )))
        }
    };
    Ok(Zip::from(&av).and(&bv).map_collect(|&x, &y| f(x, y)))
}

fn normalize_axis(axis: isize, rank: usize) -> Result<usize, RuntimeError> {
    let resolved = if axis < 0 { axis + rank as isize } else { axis };
    if resolved < 0 || resolved as usize >= rank {
        return Err(RuntimeError::ShapeError(format!(
            "axis {} out of range for rank {}",
            axis, rank
        )));
    }
    Ok(resolved as usize)
}

fn reduced_count(shape: &[usize], axes: &[isize]) -> Result<usize, RuntimeError> {
    let mut count = 1;
    for &axis in axes {
        count *= shape[normalize_axis(axis, shape.len())?];
    }
    Ok(count.max(1))
}

fn extent(shape: &[usize], axis: usize) -> Result<usize, RuntimeError> {
    shape.get(axis).copied().ok_or_else(|| {
        RuntimeError::ShapeError(format!("axis {} out of range for shape {:?}", axis, shape))
    })
}

fn axis_slice(
    shape: &[usize],
    axis: usize,
    start: usize,
    end: Option<usize>,
    step: usize,
) -> Result<Slice, RuntimeError> {
    let len = extent(shape, axis)?;
    let stop = end.unwrap_or(len);
    if step == 0 || start > stop || stop > len {
        return Err(RuntimeError::ShapeError(format!(
            "slice {}..{} step {} out of range for axis {} of {:?}",
            start, stop, step, axis, shape
        )));
    }
    Ok(Slice::new(start as isize, Some(stop as isize), step as isize))
}

fn op_sum_axes(input: ArrayViewD<f32>, axes: &[isize]) -> OpResult {
    let mut resolved = axes
        .iter()
        .map(|&a| normalize_axis(a, input.ndim()))
        .collect::<Result<Vec<_>, _>>()?;
    resolved.sort_unstable();
    resolved.dedup();
    let mut out = input.to_owned();
    for axis in resolved {
        out = out.sum_axis(Axis(axis)).insert_axis(Axis(axis));
    }
    Ok(out)
}

fn op_softmax(input: ArrayViewD<f32>) -> OpResult {
    if input.ndim() == 0 {
        return Err(RuntimeError::ShapeError("softmax of a scalar".to_string()));
    }
    let last_axis = Axis(input.ndim() - 1);
    let mut result = input.to_owned();
    for mut row in result.lanes_mut(last_axis) {
        let max_val = row.iter().fold(f32::NEG_INFINITY, |max, &val| max.max(val));
        row.mapv_inplace(|x| (x - max_val).exp());
        let sum = row.sum();
        row.mapv_inplace(|x| x / sum);
    }
    Ok(result)
}

fn op_matmul(a: ArrayViewD<f32>, b: ArrayViewD<f32>) -> OpResult {
    let a2 = a
        .into_dimensionality::<ndarray::Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("MatrixMultiply lhs: {}", e)))?;
    let b2 = b
        .into_dimensionality::<ndarray::Ix2>()
        .map_err(|e| RuntimeError::ShapeError(format!("MatrixMultiply rhs: {}", e)))?;
    if a2.ncols() != b2.nrows() {
        return Err(RuntimeError::ShapeError(format!(
            "incompatible matmul shapes: {:?} and {:?}",
            a2.shape(),
            b2.shape()
        )));
    }
    let out: Array2<f32> = a2.dot(&b2);
    Ok(out.into_dyn())
}

/// Resolves a reshape target with at most one `-1` entry.
fn resolve_shape(len: usize, shape: &[i64]) -> Result<Vec<usize>, RuntimeError> {
    let known: i64 = shape.iter().filter(|&&d| d >= 0).product();
    let inferred = shape.iter().filter(|&&d| d < 0).count();
    if inferred > 1 || shape.iter().any(|&d| d < -1) {
        return Err(RuntimeError::ShapeError(format!("invalid reshape target {:?}", shape)));
    }
    let resolved: Vec<usize> = shape
        .iter()
        .map(|&d| {
            if d < 0 && known > 0 {
                len / known as usize
            } else {
                d.max(0) as usize
            }
        })
        .collect();
    if resolved.iter().product::<usize>() != len {
        return Err(RuntimeError::ShapeError(format!(
            "cannot reshape {} elements into {:?}",
            len, shape
        )));
    }
    Ok(resolved)
}

fn op_reshape(input: ArrayViewD<f32>, shape: &[usize]) -> OpResult {
    input
        .to_shape(shape.to_vec())
        .map(|view| view.into_owned())
        .map_err(|e| RuntimeError::ShapeError(format!("Reshape to {:?}: {}", shape, e)))
}

fn op_transpose(input: ArrayViewD<f32>, axis1: usize, axis2: usize) -> OpResult {
    if axis1 >= input.ndim() || axis2 >= input.ndim() {
        return Err(RuntimeError::ShapeError(format!(
            "transpose axes ({}, {}) out of range for rank {}",
            axis1,
            axis2,
            input.ndim()
        )));
    }
    let mut axes: Vec<usize> = (0..input.ndim()).collect();
    axes.swap(axis1, axis2);
    Ok(input.permuted_axes(axes).as_standard_layout().into_owned())
}

fn op_broadcast(input: ArrayViewD<f32>, shape: &[usize]) -> OpResult {
    input
        .broadcast(shape)
        .map(|view| view.to_owned())
        .ok_or_else(|| {
            RuntimeError::ShapeError(format!("cannot broadcast {:?} to {:?}", input.shape(), shape))
        })
}

/// Sums `input` down to `target`, undoing a numpy-style broadcast.
fn op_reduce_sum_to(input: ArrayViewD<f32>, target: &[usize]) -> OpResult {
    let mut out = input.to_owned();
    while out.ndim() > target.len() {
        out = out.sum_axis(Axis(0));
    }
    for (axis, &dim) in target.iter().enumerate() {
        if dim == 1 && out.shape().get(axis).copied().unwrap_or(1) > 1 {
            out = out.sum_axis(Axis(axis)).insert_axis(Axis(axis));
        }
    }
    op_reshape(out.view(), target)
}

// --- Convolution ---

/// Resolved dimensions of one grouped 2-D convolution.
struct ConvDims {
    batch: usize,
    in_h: usize,
    in_w: usize,
    out_channels: usize,
    in_per_group: usize,
    out_per_group: usize,
    kernel: (usize, usize),
    out_h: usize,
    out_w: usize,
}

/// One multiply-accumulate of a convolution:
/// `out[n, oc, oh, ow] += in[n, ic_abs, ih, iw] * w[oc, ic, kh, kw]`.
#[derive(Clone, Copy)]
struct Tap {
    n: usize,
    oc: usize,
    oh: usize,
    ow: usize,
    ic: usize,
    ic_abs: usize,
    kh: usize,
    kw: usize,
    ih: usize,
    iw: usize,
}

impl ConvDims {
    fn new(input: &[usize], weight: &[usize], geometry: &ConvGeometry) -> Result<Self, RuntimeError> {
        let (&[batch, in_channels, in_h, in_w], &[out_channels, in_per_group, kh, kw]) =
            (input, weight)
        else {
            return Err(RuntimeError::ShapeError(format!(
                "Conv2d expects 4-D input and weight, got {:?} and {:?}",
                input, weight
            )));
        };
        if !geometry.admits_kernel((kh, kw)) {
            return Err(RuntimeError::ShapeError(format!(
                "Conv2d: kernel {}x{}, stride {:?} and dilation {:?} must all be positive",
                kh, kw, geometry.stride, geometry.dilation
            )));
        }
        let groups = geometry.groups.max(1);
        if in_channels != in_per_group * groups || out_channels % groups != 0 {
            return Err(RuntimeError::ShapeError(format!(
                "Conv2d: input channels {} and output channels {} do not fit weight {:?} with {} groups",
                in_channels, out_channels, weight, groups
            )));
        }
        let eff_kh = (kh - 1) * geometry.dilation.0 + 1;
        let eff_kw = (kw - 1) * geometry.dilation.1 + 1;
        let padded_h = in_h + 2 * geometry.padding.0;
        let padded_w = in_w + 2 * geometry.padding.1;
        if padded_h < eff_kh || padded_w < eff_kw {
            return Err(RuntimeError::ShapeError(format!(
                "Conv2d: kernel {}x{} larger than padded input {}x{}",
                eff_kh, eff_kw, padded_h, padded_w
            )));
        }
        Ok(Self {
            batch,
            in_h,
            in_w,
            out_channels,
            in_per_group,
            out_per_group: out_channels / groups,
            kernel: (kh, kw),
            out_h: (padded_h - eff_kh) / geometry.stride.0 + 1,
            out_w: (padded_w - eff_kw) / geometry.stride.1 + 1,
        })
    }

    /// Calls `f` for every tap that lands inside the unpadded input.
    fn for_each_tap(&self, geometry: &ConvGeometry, mut f: impl FnMut(Tap)) {
        let (stride_h, stride_w) = geometry.stride;
        let (pad_h, pad_w) = geometry.padding;
        let (dil_h, dil_w) = geometry.dilation;
        for n in 0..self.batch {
            for oc in 0..self.out_channels {
                let group = oc / self.out_per_group;
                for oh in 0..self.out_h {
                    for ow in 0..self.out_w {
                        for ic in 0..self.in_per_group {
                            let ic_abs = group * self.in_per_group + ic;
                            for kh in 0..self.kernel.0 {
                                let ih = (oh * stride_h + kh * dil_h) as isize - pad_h as isize;
                                if ih < 0 || ih >= self.in_h as isize {
                                    continue;
                                }
                                for kw in 0..self.kernel.1 {
                                    let iw = (ow * stride_w + kw * dil_w) as isize - pad_w as isize;
                                    if iw < 0 || iw >= self.in_w as isize {
                                        continue;
                                    }
                                    f(Tap {
                                        n,
                                        oc,
                                        oh,
                                        ow,
                                        ic,
                                        ic_abs,
                                        kh,
                                        kw,
                                        ih: ih as usize,
                                        iw: iw as usize,
                                    });
                                }
                            }
                        }
                    }
                }
            }
        }
    }
}

fn as_array4(value: ArrayViewD<f32>, what: &str) -> Result<Array4<f32>, RuntimeError> {
    value
        .to_owned()
        .into_dimensionality()
        .map_err(|e| RuntimeError::ShapeError(format!("{}: {}", what, e)))
}

/// Input: `[N, C_in, H, W]`, weight: `[C_out, C_in / groups, kH, kW]`.
fn op_conv2d(input: ArrayViewD<f32>, weight: ArrayViewD<f32>, geometry: &ConvGeometry) -> OpResult {
    let dims = ConvDims::new(input.shape(), weight.shape(), geometry)?;
    let input = as_array4(input, "Conv2d input")?;
    let weight = as_array4(weight, "Conv2d weight")?;
    let mut output = Array4::<f32>::zeros((dims.batch, dims.out_channels, dims.out_h, dims.out_w));
    dims.for_each_tap(geometry, |t| {
        output[[t.n, t.oc, t.oh, t.ow]] += input[[t.n, t.ic_abs, t.ih, t.iw]] * weight[[t.oc, t.ic, t.kh, t.kw]];
    });
    Ok(output.into_dyn())
}

fn op_conv2d_backward_input(
    grad_output: ArrayViewD<f32>,
    weight: ArrayViewD<f32>,
    input_shape: &[usize],
    geometry: &ConvGeometry,
) -> OpResult {
    let dims = ConvDims::new(input_shape, weight.shape(), geometry)?;
    let grad_output = as_array4(grad_output, "Conv2d grad_output")?;
    let weight = as_array4(weight, "Conv2d weight")?;
    let mut grad_input = ArrayD::<f32>::zeros(IxDyn(input_shape));
    dims.for_each_tap(geometry, |t| {
        grad_input[[t.n, t.ic_abs, t.ih, t.iw]] += grad_output[[t.n, t.oc, t.oh, t.ow]] * weight[[t.oc, t.ic, t.kh, t.kw]];
    });
    Ok(grad_input)
}

fn op_conv2d_backward_weight(
    grad_output: ArrayViewD<f32>,
    input: ArrayViewD<f32>,
    weight_shape: &[usize],
    geometry: &ConvGeometry,
) -> OpResult {
    let dims = ConvDims::new(input.shape(), weight_shape, geometry)?;
    let grad_output = as_array4(grad_output, "Conv2d grad_output")?;
    let input = as_array4(input, "Conv2d input")?;
    let mut grad_weight = ArrayD::<f32>::zeros(IxDyn(weight_shape));
    dims.for_each_tap(geometry, |t| {
        grad_weight[[t.oc, t.ic, t.kh, t.kw]] += grad_output[[t.n, t.oc, t.oh, t.ow]] * input[[t.n, t.ic_abs, t.ih, t.iw]];
    });
    Ok(grad_weight)
}

// --- Pooling ---

fn pool_output(shape: &[usize], kernel: (usize, usize), stride: (usize, usize)) -> Result<(usize, usize), RuntimeError> {
    match shape {
        [_, _, h, w] if *h >= kernel.0 && *w >= kernel.1 && stride.0 > 0 && stride.1 > 0 => {
            Ok(((h - kernel.0) / stride.0 + 1, (w - kernel.1) / stride.1 + 1))
        }
        _ => Err(RuntimeError::ShapeError(format!(
            "AvgPool2d: kernel {:?} stride {:?} do not fit input {:?}",
            kernel, stride, shape
        ))),
    }
}

fn op_avg_pool2d(input: ArrayViewD<f32>, kernel: (usize, usize), stride: (usize, usize)) -> OpResult {
    let (out_h, out_w) = pool_output(input.shape(), kernel, stride)?;
    let input = as_array4(input, "AvgPool2d input")?;
    let (n, c, _, _) = input.dim();
    let area = (kernel.0 * kernel.1) as f32;
    let mut output = Array4::<f32>::zeros((n, c, out_h, out_w));
    for ((b, ch, oh, ow), out) in output.indexed_iter_mut() {
        let (h0, w0) = (oh * stride.0, ow * stride.1);
        let window = input.slice(ndarray::s![b, ch, h0..h0 + kernel.0, w0..w0 + kernel.1]);
        *out = window.sum() / area;
    }
    Ok(output.into_dyn())
}

fn op_avg_pool2d_backward(
    grad_output: ArrayViewD<f32>,
    input_shape: &[usize],
    kernel: (usize, usize),
    stride: (usize, usize),
) -> OpResult {
    pool_output(input_shape, kernel, stride)?;
    let grad_output = as_array4(grad_output, "AvgPool2d grad_output")?;
    let area = (kernel.0 * kernel.1) as f32;
    let mut grad_input = ArrayD::<f32>::zeros(IxDyn(input_shape));
    for ((b, ch, oh, ow), &g) in grad_output.indexed_iter() {
        let (h0, w0) = (oh * stride.0, ow * stride.1);
        grad_input
            .slice_mut(ndarray::s![b, ch, h0..h0 + kernel.0, w0..w0 + kernel.1])
            .mapv_inplace(|v| v + g / area);
    }
    Ok(grad_input)
}

/// Inverted-dropout mask: 0 with probability `p`, `1 / (1 - p)` otherwise.
fn dropout_mask(shape: &[usize], p: f32, rng: &mut StdRng) -> ArrayD<f32> {
    if p <= 0.0 {
        return ArrayD::ones(IxDyn(shape));
    }
    if p >= 1.0 {
        return ArrayD::zeros(IxDyn(shape));
    }
    let keep = 1.0 / (1.0 - p);
    ArrayD::from_shape_simple_fn(IxDyn(shape), || if rng.gen::<f32>() < p { 0.0 } else { keep })
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{array, ArrayD};

    fn run_single(asg: &Asg, feeds: Vec<(NodeId, ArrayD<f32>)>) -> ArrayD<f32> {
        let memo = feeds
            .into_iter()
            .map(|(id, v)| ((asg.id, id), Value::Tensor(v)))
            .collect();
        let (outputs, _) = CpuBackend::with_seed(0).run(asg, memo).unwrap();
        outputs.into_iter().next().unwrap().into_tensor()
    }

    #[test]
    fn binary_ops_broadcast_both_sides() {
        let mut asg = Asg::new(0, None);
        let a = asg.add_node(None, NodeType::Input { name: "a".into() });
        let b = asg.add_node(None, NodeType::Input { name: "b".into() });
        let sum = asg.add_node(None, NodeType::Add(a, b));
        asg.set_output(sum);
        let out = run_single(
            &asg,
            vec![
                (a, array![[1.0f32], [2.0]].into_dyn()),
                (b, array![10.0f32, 20.0, 30.0].into_dyn()),
            ],
        );
        assert_eq!(out, array![[11.0f32, 21.0, 31.0], [12.0, 22.0, 32.0]].into_dyn());
    }

    #[test]
    fn incompatible_shapes_are_errors() {
        let mut asg = Asg::new(0, None);
        let a = asg.add_node(None, NodeType::Input { name: "a".into() });
        let b = asg.add_node(None, NodeType::Input { name: "b".into() });
        let sum = asg.add_node(None, NodeType::Add(a, b));
        asg.set_output(sum);
        let memo = [
            ((0, a), Value::Tensor(ArrayD::zeros(IxDyn(&[2, 3])))),
            ((0, b), Value::Tensor(ArrayD::zeros(IxDyn(&[4])))),
        ]
        .into_iter()
        .collect();
        let err = CpuBackend::with_seed(0).run(&asg, memo).unwrap_err();
        assert!(matches!(err, RuntimeError::ShapeError(_)));
    }

    #[test]
    fn softmax_normalizes_each_row() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(None, NodeType::Input { name: "x".into() });
        let s = asg.add_node(None, NodeType::Softmax(x));
        asg.set_output(s);
        let out = run_single(&asg, vec![(x, array![[1.0f32, 2.0, 3.0], [0.0, 0.0, 0.0]].into_dyn())]);
        for row in out.rows() {
            assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-6);
        }
        assert_abs_diff_eq!(out[[1, 0]], 1.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn conv_with_padding_sums_neighbourhood() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(None, NodeType::Input { name: "x".into() });
        let w = asg.add_node(None, NodeType::Input { name: "w".into() });
        let geometry = ConvGeometry {
            padding: (1, 1),
            ..ConvGeometry::default()
        };
        let y = asg.add_node(None, NodeType::Conv2d { input: x, weight: w, geometry });
        asg.set_output(y);
        let out = run_single(
            &asg,
            vec![
                (x, ArrayD::ones(IxDyn(&[1, 1, 3, 3]))),
                (w, ArrayD::ones(IxDyn(&[1, 1, 3, 3]))),
            ],
        );
        assert_eq!(out.shape(), &[1, 1, 3, 3]);
        assert_eq!(out[[0, 0, 1, 1]], 9.0);
        assert_eq!(out[[0, 0, 0, 0]], 4.0);
        assert_eq!(out[[0, 0, 0, 1]], 6.0);
    }

    #[test]
    fn degenerate_conv_geometry_is_an_error() {
        let cases = [
            ([1, 1, 3, 3], ConvGeometry { stride: (0, 1), ..ConvGeometry::default() }),
            ([1, 1, 3, 3], ConvGeometry { dilation: (1, 0), ..ConvGeometry::default() }),
            ([1, 1, 0, 3], ConvGeometry::default()),
        ];
        for (weight_shape, geometry) in cases {
            let mut asg = Asg::new(0, None);
            let x = asg.add_node(None, NodeType::Input { name: "x".into() });
            let w = asg.add_node(None, NodeType::Input { name: "w".into() });
            let y = asg.add_node(None, NodeType::Conv2d { input: x, weight: w, geometry });
            asg.set_output(y);
            let memo = [
                ((0, x), Value::Tensor(ArrayD::ones(IxDyn(&[1, 1, 4, 4])))),
                ((0, w), Value::Tensor(ArrayD::ones(IxDyn(&weight_shape)))),
            ]
            .into_iter()
            .collect();
            let err = CpuBackend::with_seed(0).run(&asg, memo).unwrap_err();
            assert!(matches!(err, RuntimeError::ShapeError(_)), "{:?}", geometry);
        }
    }

    #[test]
    fn grouped_conv_keeps_groups_apart() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(None, NodeType::Input { name: "x".into() });
        let w = asg.add_node(None, NodeType::Input { name: "w".into() });
        let geometry = ConvGeometry {
            groups: 2,
            ..ConvGeometry::default()
        };
        let y = asg.add_node(None, NodeType::Conv2d { input: x, weight: w, geometry });
        asg.set_output(y);
        let mut input = ArrayD::zeros(IxDyn(&[1, 2, 1, 1]));
        input[[0, 0, 0, 0]] = 1.0;
        input[[0, 1, 0, 0]] = 5.0;
        let out = run_single(&asg, vec![(x, input), (w, ArrayD::ones(IxDyn(&[2, 1, 1, 1])))]);
        assert_eq!(out.into_raw_vec_and_offset().0, vec![1.0, 5.0]);
    }

    #[test]
    fn avg_pool_halves_spatial_dims() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(None, NodeType::Input { name: "x".into() });
        let p = asg.add_node(
            None,
            NodeType::AvgPool2d {
                input: x,
                kernel_size: (2, 2),
                stride: (2, 2),
            },
        );
        asg.set_output(p);
        let input = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 4]), (0..8).map(|v| v as f32).collect()).unwrap();
        let out = run_single(&asg, vec![(x, input)]);
        assert_eq!(out.shape(), &[1, 1, 1, 2]);
        assert_abs_diff_eq!(out[[0, 0, 0, 0]], 2.5);
        assert_abs_diff_eq!(out[[0, 0, 0, 1]], 4.5);
    }

    #[test]
    fn strided_slice_takes_every_other_channel() {
        let mut asg = Asg::new(0, None);
        let x = asg.add_node(None, NodeType::Input { name: "x".into() });
        let s = asg.add_node(
            None,
            NodeType::Slice {
                input: x,
                axis: 1,
                start: 1,
                end: None,
                step: 2,
            },
        );
        asg.set_output(s);
        let input = ArrayD::from_shape_vec(IxDyn(&[1, 4]), vec![0.0, 1.0, 2.0, 3.0]).unwrap();
        let out = run_single(&asg, vec![(x, input)]);
        assert_eq!(out.into_raw_vec_and_offset().0, vec![1.0, 3.0]);
    }

    #[test]
    fn dropout_mask_is_inverted_and_seeded() {
        let mut rng = StdRng::seed_from_u64(3);
        let mask = dropout_mask(&[1000], 0.5, &mut rng);
        assert!(mask.iter().all(|&v| v == 0.0 || v == 2.0));
        let kept = mask.iter().filter(|&&v| v > 0.0).count();
        assert!(kept > 400 && kept < 600);
    }

    #[test]
    fn reshape_infers_one_dimension() {
        assert_eq!(resolve_shape(24, &[2, -1, 4]).unwrap(), vec![2, 3, 4]);
        assert!(resolve_shape(24, &[5, -1]).is_err());
        assert!(resolve_shape(24, &[-1, -1]).is_err());
    }
}
