//! # tensile-core
//!
//! Strided tensors and the CPU machinery underneath them.
//!
//! This crate provides:
//! - [`Tensor`] — n-dimensional array over a shared, strided buffer
//! - [`Shape`] / [`Layout`] — extents, strides, axis order and offset
//! - [`DType`] / [`Element`] — the closed set of element types (f32, f64, i32, i64)
//! - [`CpuDevice`] / [`DeviceConfig`] — fork-join settings and vector kernels
//! - [`Chain`] — fluent pipelines with a deferred error checkpoint
// - broadcast: numpy-style replication to a larger shape
// - dispatch: fork-join kernels over flat buffers
// - ops: Tensor math methods built on dispatch

pub mod broadcast;
pub mod chain;
pub mod device;
pub mod dispatch;
pub mod dtype;
pub mod error;
pub mod kernels;
pub mod layout;
pub mod ops;
pub mod shape;
pub mod tensor;

pub use chain::Chain;
pub use device::{AccelPreference, Capabilities, CpuDevice, DeviceConfig};
pub use dtype::{DType, Element};
pub use error::{Error, Result};
pub use kernels::{BinaryOp, LaneKernels, Lanes16, Lanes8, ReduceOp, ScalarKernels, UnaryOp, VectorKernels};
pub use layout::Layout;
pub use shape::Shape;
pub use tensor::Tensor;
