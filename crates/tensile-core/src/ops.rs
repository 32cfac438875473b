// Tensor math — shape handling in front of the kernel dispatcher
//
// These methods decide WHAT to compute (output shape, broadcasting, which
// axis to reduce); `dispatch` decides HOW (fork-join split, vector kernels).
// Inputs are read in logical order, so permuted views work everywhere.
//
// Binary ops pick one of three paths:
//   1. equal shapes           → flat elementwise kernel
//   2. one side has 1 element → scalar kernel, no replication
//   3. anything else          → replicate both sides to the broadcast shape
//                               (see broadcast.rs), then path 1

use crate::dispatch;
use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::kernels::{BinaryOp, ReduceOp, UnaryOp};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Integer `Div`, whose zero divisors are rejected before dispatch.
fn integer_div<T: Element>(op: BinaryOp) -> bool {
    op == BinaryOp::Div && !T::DTYPE.is_float()
}

impl<T: Element> Tensor<T> {
    // Binary

    /// Elementwise `self op rhs` with numpy broadcasting.
    pub fn binary(&self, op: BinaryOp, rhs: &Tensor<T>) -> Result<Tensor<T>> {
        let out_shape = Shape::broadcast_shape(self.shape(), rhs.shape())?;
        if integer_div::<T>(op) && rhs.to_vec()?.iter().any(|&v| v == T::zero()) {
            return Err(Error::DivisionByZero);
        }
        let device = self.device();
        let data = if self.shape() == rhs.shape() {
            dispatch::binary(device, op, &self.to_vec()?, &rhs.to_vec()?)
        } else if rhs.elem_count() == 1 && out_shape.elem_count() == self.elem_count() {
            dispatch::binary_scalar_rhs(device, op, &self.to_vec()?, rhs.item()?)
        } else if self.elem_count() == 1 && out_shape.elem_count() == rhs.elem_count() {
            dispatch::binary_scalar_lhs(device, op, self.item()?, &rhs.to_vec()?)
        } else {
            let lhs = self.broadcast_to(out_shape.clone())?;
            let rhs = rhs.broadcast_to(out_shape.clone())?;
            dispatch::binary(device, op, &lhs.to_vec()?, &rhs.to_vec()?)
        };
        Ok(Tensor::from_parts(data, out_shape, device))
    }

    pub fn add(&self, rhs: &Tensor<T>) -> Result<Tensor<T>> {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn sub(&self, rhs: &Tensor<T>) -> Result<Tensor<T>> {
        self.binary(BinaryOp::Sub, rhs)
    }

    pub fn mul(&self, rhs: &Tensor<T>) -> Result<Tensor<T>> {
        self.binary(BinaryOp::Mul, rhs)
    }

    pub fn div(&self, rhs: &Tensor<T>) -> Result<Tensor<T>> {
        self.binary(BinaryOp::Div, rhs)
    }

    pub fn pow(&self, rhs: &Tensor<T>) -> Result<Tensor<T>> {
        self.binary(BinaryOp::Pow, rhs)
    }

    /// `self op value` for every element.
    pub fn binary_scalar(&self, op: BinaryOp, value: T) -> Result<Tensor<T>> {
        if integer_div::<T>(op) && value == T::zero() {
            return Err(Error::DivisionByZero);
        }
        let data = dispatch::binary_scalar_rhs(self.device(), op, &self.to_vec()?, value);
        Ok(Tensor::from_parts(data, self.shape().clone(), self.device()))
    }

    pub fn add_scalar(&self, value: T) -> Result<Tensor<T>> {
        self.binary_scalar(BinaryOp::Add, value)
    }

    pub fn mul_scalar(&self, value: T) -> Result<Tensor<T>> {
        self.binary_scalar(BinaryOp::Mul, value)
    }

    // Unary

    pub fn unary(&self, op: UnaryOp) -> Result<Tensor<T>> {
        let data = dispatch::unary(self.device(), op, &self.to_vec()?);
        Ok(Tensor::from_parts(data, self.shape().clone(), self.device()))
    }

    pub fn neg(&self) -> Result<Tensor<T>> {
        self.unary(UnaryOp::Neg)
    }

    pub fn sigmoid(&self) -> Result<Tensor<T>> {
        self.unary(UnaryOp::Sigmoid)
    }

    pub fn relu(&self) -> Result<Tensor<T>> {
        self.unary(UnaryOp::Relu)
    }

    pub fn ln(&self) -> Result<Tensor<T>> {
        self.unary(UnaryOp::Ln)
    }

    pub fn exp(&self) -> Result<Tensor<T>> {
        self.unary(UnaryOp::Exp)
    }

    /// Apply a user function to every element.
    pub fn apply<F>(&self, f: F) -> Result<Tensor<T>>
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let data = dispatch::map(self.device(), &self.to_vec()?, f);
        Ok(Tensor::from_parts(data, self.shape().clone(), self.device()))
    }

    // Whole-tensor reductions

    fn reduce_all(&self, op: ReduceOp, keep_dims: bool) -> Result<Tensor<T>> {
        let value = dispatch::reduce_all(self.device(), op, &self.to_vec()?)?;
        Ok(Tensor::from_parts(vec![value], self.reduced_shape(keep_dims), self.device()))
    }

    /// `[]`, or all ones of the same rank when `keep_dims`.
    fn reduced_shape(&self, keep_dims: bool) -> Shape {
        if keep_dims {
            Shape::new(vec![1; self.rank()])
        } else {
            Shape::from(())
        }
    }

    pub fn sum(&self, keep_dims: bool) -> Result<Tensor<T>> {
        self.reduce_all(ReduceOp::Sum, keep_dims)
    }

    pub fn max(&self, keep_dims: bool) -> Result<Tensor<T>> {
        self.reduce_all(ReduceOp::Max, keep_dims)
    }

    pub fn min(&self, keep_dims: bool) -> Result<Tensor<T>> {
        self.reduce_all(ReduceOp::Min, keep_dims)
    }

    /// Arithmetic mean of every element. Empty tensors fail.
    pub fn mean(&self, keep_dims: bool) -> Result<Tensor<T>> {
        let n = self.elem_count();
        if n == 0 {
            return Err(Error::EmptyTensor { op: "mean" });
        }
        let sum = dispatch::reduce_all(self.device(), ReduceOp::Sum, &self.to_vec()?)?;
        let mean = T::from_f64(sum.as_f64() / n as f64);
        Ok(Tensor::from_parts(vec![mean], self.reduced_shape(keep_dims), self.device()))
    }

    // Axis reductions

    /// `(outer, len, inner)` split of the shape around `axis`.
    fn axis_split(&self, axis: usize) -> Result<(usize, usize, usize)> {
        let len = self.shape().dim(axis)?;
        let dims = self.dims();
        let outer = dims[..axis].iter().product();
        let inner = dims[axis + 1..].iter().product();
        Ok((outer, len, inner))
    }

    fn axis_shape(&self, axis: usize, keep_dims: bool) -> Shape {
        let mut dims = self.dims().to_vec();
        if keep_dims {
            dims[axis] = 1;
        } else {
            dims.remove(axis);
        }
        Shape::new(dims)
    }

    fn reduce_along_axis(&self, op: ReduceOp, axis: usize, keep_dims: bool) -> Result<Tensor<T>> {
        let (outer, len, inner) = self.axis_split(axis)?;
        let data = dispatch::reduce_axis(self.device(), op, &self.to_vec()?, outer, len, inner)?;
        Ok(Tensor::from_parts(data, self.axis_shape(axis, keep_dims), self.device()))
    }

    pub fn sum_along_axis(&self, axis: usize, keep_dims: bool) -> Result<Tensor<T>> {
        self.reduce_along_axis(ReduceOp::Sum, axis, keep_dims)
    }

    pub fn max_along_axis(&self, axis: usize, keep_dims: bool) -> Result<Tensor<T>> {
        self.reduce_along_axis(ReduceOp::Max, axis, keep_dims)
    }

    pub fn min_along_axis(&self, axis: usize, keep_dims: bool) -> Result<Tensor<T>> {
        self.reduce_along_axis(ReduceOp::Min, axis, keep_dims)
    }

    pub fn mean_along_axis(&self, axis: usize, keep_dims: bool) -> Result<Tensor<T>> {
        let len = self.shape().dim(axis)?;
        if len == 0 {
            return Err(Error::EmptyTensor { op: "mean" });
        }
        let sum = self.reduce_along_axis(ReduceOp::Sum, axis, keep_dims)?;
        let scale = 1.0 / len as f64;
        sum.apply(move |v| T::from_f64(v.as_f64() * scale))
    }

    /// Position of the largest element along `axis`.
    pub fn argmax_along_axis(&self, axis: usize, keep_dims: bool) -> Result<Tensor<i64>> {
        let (outer, len, inner) = self.axis_split(axis)?;
        if len == 0 {
            return Err(Error::EmptyTensor { op: "argmax" });
        }
        let data = dispatch::argmax_axis(self.device(), &self.to_vec()?, outer, len, inner);
        Ok(Tensor::from_parts(data, self.axis_shape(axis, keep_dims), self.device()))
    }

    // Softmax and matmul

    /// Row-wise softmax of a 2-D tensor over its last axis.
    pub fn softmax(&self) -> Result<Tensor<T>> {
        if self.rank() != 2 {
            return Err(Error::DimensionMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        let cols = self.dims()[1];
        let data = dispatch::softmax_rows(self.device(), &self.to_vec()?, cols);
        Ok(Tensor::from_parts(data, self.shape().clone(), self.device()))
    }

    /// `[m, k] @ [k, n] → [m, n]`.
    pub fn matmul(&self, rhs: &Tensor<T>) -> Result<Tensor<T>> {
        for t in [self, rhs] {
            if t.rank() != 2 {
                return Err(Error::DimensionMismatch {
                    expected: 2,
                    got: t.rank(),
                });
            }
        }
        let (m, k) = (self.dims()[0], self.dims()[1]);
        let (k2, n) = (rhs.dims()[0], rhs.dims()[1]);
        if k != k2 {
            return Err(Error::shape_mismatch((k, n), rhs.shape()));
        }
        // reading rhs through its transpose yields the [n, k] buffer directly
        let b_t = rhs.transpose().to_vec()?;
        let data = dispatch::matmul(self.device(), &self.to_vec()?, &b_t, m, k, n);
        Ok(Tensor::from_parts(data, Shape::from((m, n)), self.device()))
    }
}
