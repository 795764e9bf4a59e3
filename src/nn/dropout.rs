//! Dropout layer for regularization.

use crate::error::ConfigError;
use crate::nn::Module;
use crate::tensor::Tensor;

/// Dropout layer.
///
/// During training zeroes elements with probability `p` and scales the rest
/// by `1/(1-p)` to keep the expectation. The mask is drawn by the backend
/// each time the graph runs. In inference mode the input passes through.
#[derive(Debug, Clone)]
pub struct Dropout {
    /// Drop probability in `[0, 1)`.
    pub p: f32,
    pub training: bool,
}

impl Dropout {
    pub fn new(p: f32) -> Result<Self, ConfigError> {
        if !(0.0..1.0).contains(&p) {
            return Err(ConfigError::InvalidDropout(p));
        }
        Ok(Self { p, training: true })
    }

    pub fn train(&mut self) {
        self.training = true;
    }

    pub fn eval(&mut self) {
        self.training = false;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }
}

impl Module for Dropout {
    fn forward(&self, x: &Tensor) -> Tensor {
        if self.training && self.p > 0.0 {
            x.dropout(self.p)
        } else {
            x.clone()
        }
    }

    fn parameters(&self) -> Vec<Tensor> {
        Vec::new()
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tensor::GraphContext;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn test_dropout_modes() {
        let mut dropout = Dropout::new(0.3).unwrap();
        dropout.eval();
        assert!(!dropout.is_training());
        dropout.train();
        assert!(dropout.is_training());
    }

    #[test]
    fn test_dropout_invalid_p() {
        assert_eq!(Dropout::new(1.5).unwrap_err(), ConfigError::InvalidDropout(1.5));
        assert!(Dropout::new(-0.1).is_err());
    }

    #[test]
    fn eval_mode_is_identity() {
        let ctx = Rc::new(RefCell::new(GraphContext::new()));
        let x = Tensor::new_input(&ctx, "x");
        let mut dropout = Dropout::new(0.5).unwrap();
        dropout.eval();
        assert_eq!(dropout.forward(&x).node_id, x.node_id);
    }
}
