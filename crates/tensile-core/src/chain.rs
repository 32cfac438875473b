// Chain — fluent tensor pipelines with a deferred error checkpoint
//
// Every Tensor method returns Result, which makes long expressions noisy:
//
//   let y = x.mul(&w)?.add(&b)?.sigmoid()?.sum_along_axis(1, false)?;
//
// A Chain carries the Result along instead. Once a step fails, every later
// step is skipped and the FIRST error is kept until `check()`:
//
//   let y = x.chain().mul(&w).add(&b).sigmoid().sum_along_axis(1, false).check()?;
//
// Only the failure is deferred; the failing step itself still stops the
// pipeline right away.

use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::kernels::{BinaryOp, UnaryOp};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// A tensor, or the first error hit while computing it.
#[derive(Debug)]
pub struct Chain<T: Element> {
    state: Result<Tensor<T>>,
}

impl<T: Element> Tensor<T> {
    /// Start a fluent pipeline from this tensor.
    pub fn chain(&self) -> Chain<T> {
        Chain {
            state: Ok(self.clone()),
        }
    }
}

impl<T: Element> From<Result<Tensor<T>>> for Chain<T> {
    fn from(state: Result<Tensor<T>>) -> Self {
        Chain { state }
    }
}

impl<T: Element> Chain<T> {
    /// Apply `f` unless an earlier step failed.
    pub fn then<F>(self, f: F) -> Chain<T>
    where
        F: FnOnce(&Tensor<T>) -> Result<Tensor<T>>,
    {
        let state = match self.state {
            Ok(t) => f(&t).map_err(|e| {
                tracing::debug!(error = %e, "tensor chain short-circuited");
                e
            }),
            Err(e) => Err(e),
        };
        Chain { state }
    }

    /// Whether a step has failed.
    pub fn is_err(&self) -> bool {
        self.state.is_err()
    }

    /// The pending error, if any, without ending the chain.
    pub fn error(&self) -> Option<&Error> {
        self.state.as_ref().err()
    }

    /// The checkpoint: the finished tensor or the first error.
    pub fn check(self) -> Result<Tensor<T>> {
        self.state
    }

    pub fn binary(self, op: BinaryOp, rhs: &Tensor<T>) -> Chain<T> {
        self.then(|t| t.binary(op, rhs))
    }

    pub fn add(self, rhs: &Tensor<T>) -> Chain<T> {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn sub(self, rhs: &Tensor<T>) -> Chain<T> {
        self.binary(BinaryOp::Sub, rhs)
    }

    pub fn mul(self, rhs: &Tensor<T>) -> Chain<T> {
        self.binary(BinaryOp::Mul, rhs)
    }

    pub fn div(self, rhs: &Tensor<T>) -> Chain<T> {
        self.binary(BinaryOp::Div, rhs)
    }

    pub fn pow(self, rhs: &Tensor<T>) -> Chain<T> {
        self.binary(BinaryOp::Pow, rhs)
    }

    pub fn add_scalar(self, value: T) -> Chain<T> {
        self.then(|t| t.add_scalar(value))
    }

    pub fn mul_scalar(self, value: T) -> Chain<T> {
        self.then(|t| t.mul_scalar(value))
    }

    pub fn unary(self, op: UnaryOp) -> Chain<T> {
        self.then(|t| t.unary(op))
    }

    pub fn neg(self) -> Chain<T> {
        self.unary(UnaryOp::Neg)
    }

    pub fn sigmoid(self) -> Chain<T> {
        self.unary(UnaryOp::Sigmoid)
    }

    pub fn relu(self) -> Chain<T> {
        self.unary(UnaryOp::Relu)
    }

    pub fn ln(self) -> Chain<T> {
        self.unary(UnaryOp::Ln)
    }

    pub fn exp(self) -> Chain<T> {
        self.unary(UnaryOp::Exp)
    }

    pub fn apply<F>(self, f: F) -> Chain<T>
    where
        F: Fn(T) -> T + Sync + Send,
    {
        self.then(|t| t.apply(f))
    }

    pub fn matmul(self, rhs: &Tensor<T>) -> Chain<T> {
        self.then(|t| t.matmul(rhs))
    }

    pub fn softmax(self) -> Chain<T> {
        self.then(|t| t.softmax())
    }

    pub fn sum(self, keep_dims: bool) -> Chain<T> {
        self.then(|t| t.sum(keep_dims))
    }

    pub fn mean(self, keep_dims: bool) -> Chain<T> {
        self.then(|t| t.mean(keep_dims))
    }

    pub fn sum_along_axis(self, axis: usize, keep_dims: bool) -> Chain<T> {
        self.then(|t| t.sum_along_axis(axis, keep_dims))
    }

    pub fn mean_along_axis(self, axis: usize, keep_dims: bool) -> Chain<T> {
        self.then(|t| t.mean_along_axis(axis, keep_dims))
    }

    pub fn reshape(self, shape: impl Into<Shape>) -> Chain<T> {
        let shape = shape.into();
        self.then(|t| t.reshape(shape))
    }

    pub fn transpose(self) -> Chain<T> {
        self.then(|t| Ok(t.transpose()))
    }

    pub fn broadcast_to(self, shape: impl Into<Shape>) -> Chain<T> {
        let shape = shape.into();
        self.then(|t| t.broadcast_to(shape))
    }

    pub fn index(self, index: &[isize]) -> Chain<T> {
        self.then(|t| t.index(index))
    }
}
