//! # Tensile
//!
//! Strided n-dimensional tensors with broadcasting, parallel CPU kernels and
//! reverse-mode automatic differentiation.
//!
//! This is the facade crate that re-exports everything you need.
//!
//! ## Usage
//!
//! ```rust
//! use tensile::prelude::*;
//!
//! # fn main() -> tensile::Result<()> {
//! let device = CpuDevice::new(DeviceConfig::default())?;
//! let graph = Graph::new();
//! let a = graph.variable(Tensor::<f64>::arange(5, &device).reshape((1, 5))?);
//! let b = graph.variable(Tensor::<f64>::arange(5, &device).reshape((5, 1))?);
//! let c = a.matmul(b)?;
//! c.backward()?;
//! assert_eq!(c.value().to_vec()?, vec![30.0]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! | Crate | Purpose |
//! |-------|---------|
//! | `tensile-core` | Tensor, Shape, Layout, DType, CpuDevice, kernels, broadcasting |
//! | `tensile-autograd` | Graph, Var, backward pass, losses, SGD |
//!
//! ## Modules
//!
//! - [`serialize`] — binary records with a dtype tag

pub mod serialize;

/// Re-export core types.
pub use tensile_core::{
    AccelPreference, BinaryOp, Capabilities, Chain, CpuDevice, DType, DeviceConfig, Element, Error, Layout,
    ReduceOp, Result, Shape, Tensor, UnaryOp, VectorKernels,
};

/// Re-export the autodiff crate.
pub mod autograd {
    pub use tensile_autograd::*;
}

/// Re-export the kernel seam.
pub mod kernels {
    pub use tensile_core::kernels::*;
}

/// Commonly used items.
pub mod prelude {
    pub use tensile_autograd::{mse, softmax_cross_entropy, Graph, Optimizer, Sgd, Var, VarId};
    pub use tensile_core::{CpuDevice, DType, DeviceConfig, Element, Error, Result, Shape, Tensor};
}
