//! Graph execution session.
//!
//! A `Session` pairs a `GraphContext` with concrete parameter values and a
//! backend. It feeds named inputs, executes any set of symbolic outputs,
//! folds batch statistics into running buffers after training-mode
//! passes, and evaluates gradients through the autograd graph.

use super::backend::{Backend, Memo, RuntimeError};
use super::cpu_backend::CpuBackend;
use crate::analysis::shape_inference::{ShapeInference, ShapeInferenceError};
use crate::analysis::topological_order;
use crate::asg::{Asg, NodeId, NodeType, Shape, Value};
use crate::autograd::Gradients;
use crate::error::{Error, Result};
use crate::nn::parameters::ParamStore;
use crate::tensor::{GraphContext, StatisticKind, Tensor};
use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use tracing::debug;

/// Named input values for one execution.
pub type Feeds = HashMap<String, ArrayD<f32>>;

pub struct Session {
    context: Rc<RefCell<GraphContext>>,
    params: ParamStore,
    backend: CpuBackend,
    rng: StdRng,
}

impl Session {
    /// Creates a session and draws every registered parameter from its
    /// initializer with an RNG seeded by `seed`.
    pub fn new(context: &Rc<RefCell<GraphContext>>, seed: u64) -> Self {
        let mut session = Self {
            context: Rc::clone(context),
            params: ParamStore::new(),
            backend: CpuBackend::with_seed(seed.wrapping_add(1)),
            rng: StdRng::seed_from_u64(seed),
        };
        session.initialize_parameters();
        session
    }

    /// Initializes parameters registered since the last call.
    pub fn initialize_parameters(&mut self) -> usize {
        let context = self.context.borrow();
        let created = self.params.initialize_missing(context.parameters(), &mut self.rng);
        if created > 0 {
            debug!(created, total = self.params.len(), "initialized parameters");
        }
        created
    }

    pub fn context(&self) -> &Rc<RefCell<GraphContext>> {
        &self.context
    }

    pub fn params(&self) -> &ParamStore {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamStore {
        &mut self.params
    }

    /// Names of every trainable parameter present in the graph.
    pub fn trainable_names(&self) -> Vec<String> {
        self.context
            .borrow()
            .parameters()
            .iter()
            .filter(|spec| spec.trainable)
            .map(|spec| spec.name.clone())
            .collect()
    }

    fn trainable_names_reaching(&self, loss: &Tensor) -> Result<Vec<String>> {
        let context = self.context.borrow();
        let graph = context.main_graph();
        let ancestors: HashSet<NodeId> = topological_order(graph, &[loss.node_id])?.into_iter().collect();
        Ok(self
            .trainable_names()
            .into_iter()
            .filter(|name| graph.find_named_leaf(name).is_some_and(|id| ancestors.contains(&id)))
            .collect())
    }

    /// Executes the graph and returns the values of `outputs`.
    pub fn run(&mut self, feeds: &Feeds, outputs: &[&Tensor]) -> std::result::Result<Vec<ArrayD<f32>>, RuntimeError> {
        let ids = outputs.iter().map(|t| t.node_id).collect();
        let (_, values, _) = self.forward(feeds, ids)?;
        Ok(values.into_iter().map(Value::into_tensor).collect())
    }

    /// Loss value and gradients for every trainable parameter the loss
    /// depends on. Parameters outside the loss's graph get no entry, so
    /// an optimizer leaves them untouched.
    pub fn gradients(&mut self, feeds: &Feeds, loss: &Tensor) -> Result<(f32, HashMap<String, ArrayD<f32>>)> {
        let names = self.trainable_names_reaching(loss)?;
        let refs: Vec<&str> = names.iter().map(String::as_str).collect();
        self.gradients_wrt(feeds, loss, &refs)
    }

    /// Loss value and gradients with respect to the named inputs or
    /// parameters.
    pub fn gradients_wrt(
        &mut self,
        feeds: &Feeds,
        loss: &Tensor,
        names: &[&str],
    ) -> Result<(f32, HashMap<String, ArrayD<f32>>)> {
        let leaves = {
            let context = self.context.borrow();
            names
                .iter()
                .map(|name| {
                    context
                        .main_graph()
                        .find_named_leaf(name)
                        .ok_or_else(|| Error::UnknownTensor(name.to_string()))
                })
                .collect::<Result<Vec<NodeId>>>()?
        };

        let (asg, values, memo) = self.forward(feeds, vec![loss.node_id])?;
        let loss_value = values
            .into_iter()
            .next()
            .map(Value::into_tensor)
            .ok_or(RuntimeError::NodeNotFound(loss.node_id, asg.id))?;
        if loss_value.len() != 1 {
            return Err(Error::NonScalarLoss(loss_value.len()));
        }

        let grad_asg = Gradients::new(&asg).build(loss.node_id, &leaves)?;
        let (grads, _) = self.backend.run(&grad_asg, memo)?;

        let grads = names
            .iter()
            .zip(grads)
            .map(|(name, g)| (name.to_string(), g.into_tensor()))
            .collect();
        Ok((loss_value.sum(), grads))
    }

    /// Static shapes of `outputs` given the shapes of the named inputs.
    /// Parameter shapes come from their registrations.
    pub fn infer_shapes(
        &self,
        input_shapes: &HashMap<String, Shape>,
        outputs: &[&Tensor],
    ) -> std::result::Result<Vec<Shape>, ShapeInferenceError> {
        let context = self.context.borrow();
        let mut shapes = input_shapes.clone();
        for spec in context.parameters() {
            shapes.insert(spec.name.clone(), spec.shape.clone());
        }
        let mut asg = context.main_graph().clone();
        asg.set_outputs(outputs.iter().map(|t| t.node_id).collect());
        ShapeInference::run(&mut asg, &shapes)?;
        outputs
            .iter()
            .map(|t| -> std::result::Result<Shape, ShapeInferenceError> {
                asg.get_node(t.node_id)?
                    .shape
                    .clone()
                    .ok_or(ShapeInferenceError::MissingShapeInfo(t.node_id))
            })
            .collect()
    }

    fn forward(
        &mut self,
        feeds: &Feeds,
        outputs: Vec<NodeId>,
    ) -> std::result::Result<(Asg, Vec<Value>, Memo<Value>), RuntimeError> {
        self.initialize_parameters();
        let mut asg = self.context.borrow().main_graph().clone();
        asg.set_outputs(outputs);

        let mut memo: Memo<Value> = Memo::new();
        for node in asg.nodes.values() {
            let value = match &node.node_type {
                NodeType::Input { name } => feeds.get(name),
                NodeType::Parameter { name } => self.params.get(name),
                _ => None,
            };
            if let Some(value) = value {
                memo.insert((asg.id, node.id), Value::Tensor(value.clone()));
            }
        }

        let (values, memo) = self.backend.run(&asg, memo)?;
        self.apply_buffer_updates(&asg, &memo)?;
        Ok((asg, values, memo))
    }

    /// Folds the batch statistics computed by this run into their running
    /// buffers. Statistics the run did not evaluate are left alone.
    fn apply_buffer_updates(&mut self, asg: &Asg, memo: &Memo<Value>) -> std::result::Result<(), RuntimeError> {
        let updates = self.context.borrow().buffer_updates().to_vec();
        for update in updates {
            let (Some(Value::Tensor(stat)), Some(Value::Tensor(input))) = (
                memo.get(&(asg.id, update.statistic)),
                memo.get(&(asg.id, update.input)),
            ) else {
                continue;
            };
            let buffer = self
                .params
                .get_mut(&update.buffer)
                .ok_or_else(|| RuntimeError::MissingParameter(update.buffer.clone(), update.statistic))?;
            if buffer.len() != stat.len() || stat.is_empty() {
                return Err(RuntimeError::ShapeError(format!(
                    "statistic of {} elements does not fit buffer '{}' of {}",
                    stat.len(),
                    update.buffer,
                    buffer.len()
                )));
            }
            let samples = input.len() / stat.len();
            let correction = match update.kind {
                StatisticKind::Mean => 1.0,
                StatisticKind::Variance if samples > 1 => samples as f32 / (samples - 1) as f32,
                StatisticKind::Variance => 1.0,
            };
            let momentum = update.momentum;
            for (running, &batch) in buffer.iter_mut().zip(stat.iter()) {
                *running = (1.0 - momentum) * *running + momentum * batch * correction;
            }
        }
        Ok(())
    }
}
