//! Loss functions in the graph paradigm.
//!
//! Loss functions here are regular Rust functions that take symbolic
//! `Tensor` descriptors and add the nodes needed to compute the error
//! value to the graph.

use crate::tensor::Tensor;

/// Negative log-likelihood averaged over the batch.
///
/// `log_probs` is `[N, C]` (for example the output of
/// `WideResNetMos::forward`), `targets` is a one-hot `[N, C]` input.
///
/// Formula: `NLL = -sum(targets * log_probs) / N`.
pub fn nll_loss(log_probs: &Tensor, targets: &Tensor) -> Tensor {
    let per_sample = (targets * log_probs).sum_axes(&[1]);
    -&per_sample.mean_axes(&[0]).sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::session::{Feeds, Session};
    use crate::tensor::GraphContext;
    use approx::assert_relative_eq;
    use ndarray::array;

    #[test]
    fn nll_averages_over_the_batch() {
        let ctx = GraphContext::shared(Default::default());
        let log_probs = Tensor::new_input(&ctx, "log_probs");
        let targets = Tensor::new_input(&ctx, "targets");
        let loss = nll_loss(&log_probs, &targets);

        let mut session = Session::new(&ctx, 0);
        let feeds = Feeds::from([
            (
                "log_probs".to_string(),
                array![[-0.5f32, -1.0], [-2.0, -0.25]].into_dyn(),
            ),
            ("targets".to_string(), array![[1.0f32, 0.0], [1.0, 0.0]].into_dyn()),
        ]);
        let out = session.run(&feeds, &[&loss]).unwrap();
        assert_relative_eq!(out[0].sum(), 1.25);
    }
}
