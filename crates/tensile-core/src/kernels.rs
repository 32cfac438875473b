use std::fmt;

use crate::dtype::Element;

// Kernels — elementwise operators and the accelerated kernel seam
//
// The dispatcher (see `dispatch.rs`) splits an output range into one chunk
// per worker. For each chunk it first offers the work to the device's
// `VectorKernels`; if the kernel set declines (wrong dtype, unsupported op,
// or no acceleration at all) the portable scalar loop runs instead.
//
// Every kernel set evaluates the very same scalar operator as the fallback
// (`binary_fn` / `unary_fn`), only in fixed-width lanes, so results never
// depend on whether acceleration fired.

/// Elementwise binary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
}

/// Elementwise unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Neg,
    Sigmoid,
    Relu,
    Ln,
    Exp,
}

/// Whole-tensor and per-axis reduction operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Max,
    Min,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
        };
        f.write_str(s)
    }
}

/// Scalar implementation of a binary operator.
pub fn binary_fn<T: Element>(op: BinaryOp) -> fn(T, T) -> T {
    match op {
        BinaryOp::Add => |a: T, b| a.wrapping_add(b),
        BinaryOp::Sub => |a: T, b| a.wrapping_sub(b),
        BinaryOp::Mul => |a: T, b| a.wrapping_mul(b),
        BinaryOp::Div => |a: T, b| a.wrapping_div(b),
        BinaryOp::Pow => |a: T, b: T| T::from_f64(a.as_f64().powf(b.as_f64())),
    }
}

/// Scalar implementation of a unary operator.
pub fn unary_fn<T: Element>(op: UnaryOp) -> fn(T) -> T {
    match op {
        UnaryOp::Neg => |a: T| a.wrapping_neg(),
        UnaryOp::Sigmoid => |a: T| T::from_f64(1.0 / (1.0 + (-a.as_f64()).exp())),
        UnaryOp::Relu => |a: T| if a > T::zero() { a } else { T::zero() },
        UnaryOp::Ln => |a: T| T::from_f64(a.as_f64().ln()),
        UnaryOp::Exp => |a: T| T::from_f64(a.as_f64().exp()),
    }
}

// VectorKernels — pluggable accelerated backend
//
// A kernel set receives equal-length flat slices and writes the result into
// `out`. Returning `false` means "not handled", and the caller falls back to
// the scalar loop. The set is chosen once when a `CpuDevice` is built.

/// Accelerated elementwise kernels for the float element types.
pub trait VectorKernels: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    fn binary_f32(&self, op: BinaryOp, a: &[f32], b: &[f32], out: &mut [f32]) -> bool;

    fn binary_f64(&self, op: BinaryOp, a: &[f64], b: &[f64], out: &mut [f64]) -> bool;

    fn unary_f32(&self, _op: UnaryOp, _a: &[f32], _out: &mut [f32]) -> bool {
        false
    }

    fn unary_f64(&self, _op: UnaryOp, _a: &[f64], _out: &mut [f64]) -> bool {
        false
    }
}

/// No acceleration: every call is declined.
#[derive(Debug, Clone, Copy, Default)]
pub struct ScalarKernels;

impl VectorKernels for ScalarKernels {
    fn name(&self) -> &'static str {
        "scalar"
    }

    fn binary_f32(&self, _: BinaryOp, _: &[f32], _: &[f32], _: &mut [f32]) -> bool {
        false
    }

    fn binary_f64(&self, _: BinaryOp, _: &[f64], _: &[f64], _: &mut [f64]) -> bool {
        false
    }
}

/// Fixed-width lane kernels. `L` elements are processed per step so the
/// compiler can keep a whole lane group in one vector register; the tail is
/// finished one element at a time.
#[derive(Debug, Clone, Copy, Default)]
pub struct LaneKernels<const L: usize>;

/// 8 lanes of f32 per step, matching 256-bit registers.
pub type Lanes8 = LaneKernels<8>;
/// 16 lanes of f32 per step, matching 512-bit registers.
pub type Lanes16 = LaneKernels<16>;

impl<const L: usize> LaneKernels<L> {
    fn binary<T: Element>(op: BinaryOp, a: &[T], b: &[T], out: &mut [T]) -> bool {
        // pow goes through f64 libm, nothing to gain from lanes
        if op == BinaryOp::Pow || a.len() != out.len() || b.len() != out.len() {
            return false;
        }
        let f = binary_fn::<T>(op);
        let split = out.len() - out.len() % L;
        let (head, tail) = out.split_at_mut(split);
        for ((o, x), y) in head
            .chunks_exact_mut(L)
            .zip(a[..split].chunks_exact(L))
            .zip(b[..split].chunks_exact(L))
        {
            for i in 0..L {
                o[i] = f(x[i], y[i]);
            }
        }
        for ((o, &x), &y) in tail.iter_mut().zip(&a[split..]).zip(&b[split..]) {
            *o = f(x, y);
        }
        true
    }

    fn unary<T: Element>(op: UnaryOp, a: &[T], out: &mut [T]) -> bool {
        if !matches!(op, UnaryOp::Neg | UnaryOp::Relu) || a.len() != out.len() {
            return false;
        }
        let f = unary_fn::<T>(op);
        let split = out.len() - out.len() % L;
        let (head, tail) = out.split_at_mut(split);
        for (o, x) in head.chunks_exact_mut(L).zip(a[..split].chunks_exact(L)) {
            for i in 0..L {
                o[i] = f(x[i]);
            }
        }
        for (o, &x) in tail.iter_mut().zip(&a[split..]) {
            *o = f(x);
        }
        true
    }
}

impl<const L: usize> VectorKernels for LaneKernels<L> {
    fn name(&self) -> &'static str {
        match L {
            8 => "lanes8",
            16 => "lanes16",
            _ => "lanes",
        }
    }

    fn binary_f32(&self, op: BinaryOp, a: &[f32], b: &[f32], out: &mut [f32]) -> bool {
        Self::binary(op, a, b, out)
    }

    fn binary_f64(&self, op: BinaryOp, a: &[f64], b: &[f64], out: &mut [f64]) -> bool {
        Self::binary(op, a, b, out)
    }

    fn unary_f32(&self, op: UnaryOp, a: &[f32], out: &mut [f32]) -> bool {
        Self::unary(op, a, out)
    }

    fn unary_f64(&self, op: UnaryOp, a: &[f64], out: &mut [f64]) -> bool {
        Self::unary(op, a, out)
    }
}
