// Optimizers — in-place parameter updates from accumulated gradients
//
// Parameters are addressed by VarId so they outlive the per-iteration
// expression nodes that `Graph::truncate` releases. Updates write through
// the node's value buffer; every view of a parameter sees the new values.

use tensile_core::{Element, Result};
use tracing::instrument;

use crate::graph::{Graph, VarId};

/// Updates parameters from their gradients.
pub trait Optimizer<T: Element> {
    /// Apply one update to every parameter that has a gradient.
    fn step(&mut self, graph: &Graph<T>, params: &[VarId]) -> Result<()>;

    /// Reset the gradient of every parameter to zeros.
    fn zero_grad(&mut self, graph: &Graph<T>, params: &[VarId]) -> Result<()> {
        for &id in params {
            graph.var(id)?.zero_grad();
        }
        Ok(())
    }
}

/// Stochastic gradient descent: `param -= lr * grad`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sgd {
    pub lr: f64,
}

impl Sgd {
    pub fn new(lr: f64) -> Self {
        Sgd { lr }
    }
}

impl<T: Element> Optimizer<T> for Sgd {
    #[instrument(skip(self, graph, params), fields(num_params = params.len(), lr = self.lr))]
    fn step(&mut self, graph: &Graph<T>, params: &[VarId]) -> Result<()> {
        let lr = self.lr;
        for &id in params {
            let var = graph.var(id)?;
            let Some(grad) = var.grad() else {
                tracing::trace!(param = id.index(), "no gradient, skipping");
                continue;
            };
            let value = var.value();
            let step = grad.apply(move |g| T::from_f64(g.as_f64() * lr))?;
            value.assign(&value.sub(&step)?)?;
        }
        Ok(())
    }
}
