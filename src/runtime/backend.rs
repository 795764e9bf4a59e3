//! Abstract interface for execution backends.

use crate::asg::{Asg, AsgId, NodeId, Value};
use std::collections::HashMap;
use thiserror::Error;

/// Errors raised while executing a graph. Shared by all backends.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RuntimeError {
    #[error("Node {0} not found in graph {1}")]
    NodeNotFound(NodeId, AsgId),

    #[error("Tensor shape error: {0}")]
    ShapeError(String),

    #[error("No value fed for input '{0}' (node {1})")]
    MissingInput(String, NodeId),

    #[error("No value for parameter '{0}' (node {1}); initialize it before execution")]
    MissingParameter(String, NodeId),

    #[error("Operation '{0}' is not supported by this backend")]
    UnimplementedOperation(String),

    #[error("Computation error: {0}")]
    ComputationError(String),
}

/// Cache of already computed node values, keyed by `(AsgId, NodeId)`.
pub type Memo<T> = HashMap<(AsgId, NodeId), T>;

/// Common interface for an execution backend.
///
/// A backend takes an ASG plus a memo pre-filled with inputs and
/// parameters, evaluates everything the graph outputs depend on, and
/// hands back the outputs together with the full memo so a linked
/// gradient graph can read forward values through `External` nodes.
pub trait Backend {
    /// Device-specific data representation.
    type DeviceData: std::fmt::Debug;

    /// Moves host values onto the device.
    fn load_data(
        &self,
        data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Self::DeviceData>, RuntimeError>;

    /// Executes `main_asg`, reusing and extending `initial_memo`.
    ///
    /// Returns the graph outputs in order, and the final memo with every
    /// intermediate result.
    fn run(
        &self,
        main_asg: &Asg,
        initial_memo: Memo<Self::DeviceData>,
    ) -> Result<(Vec<Self::DeviceData>, Memo<Self::DeviceData>), RuntimeError>;

    /// Copies results back to the host.
    fn retrieve_data(&self, device_data: &[Self::DeviceData]) -> Result<Vec<Value>, RuntimeError>;
}
