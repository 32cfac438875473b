//! # tensile-autograd
//!
//! Reverse-mode automatic differentiation on top of `tensile-core` tensors.
//!
//! - [`Graph`] / [`Var`] — arena of nodes and the handles used to build expressions
//! - [`backprop::backward`] — reverse pass with gradient accumulation
//! - [`loss`] — MSE and fused softmax cross-entropy
//! - [`Optimizer`] / [`Sgd`] — in-place parameter updates
//! - [`finite_diff`] — numeric gradients for checking the analytic ones

pub mod backprop;
pub mod finite_diff;
pub mod graph;
pub mod loss;
pub mod optim;

pub use finite_diff::{finite_diff_grad, max_grad_error, numeric_derivative, tensor_numeric_grad};
pub use graph::{Graph, Node, Op, Var, VarId};
pub use loss::{mse, softmax_cross_entropy};
pub use optim::{Optimizer, Sgd};
