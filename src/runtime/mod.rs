//! Execution backends for the ASG, and the session that drives them.

pub mod backend;
pub mod cpu_backend;
pub mod session;

use serde::{Deserialize, Serialize};
use std::fmt;

/// Device a graph context places its literals and parameters on.
///
/// Threaded explicitly through `GraphContext` instead of being a process
/// global, so modules that create constant tensors (such as dilation
/// masks) ask their context where to put them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Device {
    #[default]
    Cpu,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
        }
    }
}
