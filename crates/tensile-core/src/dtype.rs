use std::fmt;

use num_traits::{WrappingAdd, WrappingMul, WrappingNeg, WrappingSub};

use crate::kernels::{BinaryOp, UnaryOp, VectorKernels};

// DType — the closed set of element types
//
//   F32 — 32-bit float, the default workhorse
//   F64 — 64-bit float, for gradient checks and high-precision work
//   I32 — 32-bit signed int, labels and counters
//   I64 — 64-bit signed int, labels and indices
//
// A tensor's element type is its Rust type parameter, so kernel selection is
// resolved at compile time. DType is the runtime tag of that parameter and is
// what gets written into serialized records.

/// Runtime tag of an element type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    F32,
    F64,
    I32,
    I64,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F64 | DType::I64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, DType::F32 | DType::F64)
    }

    /// Parse the tag written by `Display`.
    pub fn from_tag(tag: &str) -> Option<DType> {
        match tag {
            "f32" => Some(DType::F32),
            "f64" => Some(DType::F64),
            "i32" => Some(DType::I32),
            "i64" => Some(DType::I64),
            _ => None,
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
            DType::I32 => "i32",
            DType::I64 => "i64",
        };
        write!(f, "{}", s)
    }
}

// Element — bridge between Rust scalar types and DType
//
// Implemented for f32, f64, i32 and i64 only. Transcendental operators go
// through f64 and are cast back, so integer tensors truncate. The
// `accel_*` hooks are where the float types hand their slices to the
// device's vector kernels; integer types keep the defaults and always take
// the scalar loop.

/// Scalar type that can be stored in a tensor.
pub trait Element:
    Copy
    + Send
    + Sync
    + 'static
    + fmt::Debug
    + fmt::Display
    + PartialOrd
    + num_traits::Num
    + num_traits::NumCast
    + std::ops::Neg<Output = Self>
{
    /// The corresponding DType tag.
    const DTYPE: DType;

    fn as_f64(self) -> f64;

    fn from_f64(v: f64) -> Self;

    /// Append the little-endian bytes of `self`.
    fn write_le(self, out: &mut Vec<u8>);

    /// Decode from exactly `DTYPE.size_in_bytes()` little-endian bytes.
    fn read_le(bytes: &[u8]) -> Option<Self>;

    // Arithmetic used by the kernels. Floats keep IEEE semantics, integers
    // wrap on overflow instead of panicking.

    fn wrapping_add(self, rhs: Self) -> Self {
        self + rhs
    }

    fn wrapping_sub(self, rhs: Self) -> Self {
        self - rhs
    }

    fn wrapping_mul(self, rhs: Self) -> Self {
        self * rhs
    }

    /// Integer callers must rule out a zero divisor first.
    fn wrapping_div(self, rhs: Self) -> Self {
        self / rhs
    }

    fn wrapping_neg(self) -> Self {
        -self
    }

    fn accel_binary(
        _kernels: &dyn VectorKernels,
        _op: BinaryOp,
        _a: &[Self],
        _b: &[Self],
        _out: &mut [Self],
    ) -> bool {
        false
    }

    fn accel_unary(_kernels: &dyn VectorKernels, _op: UnaryOp, _a: &[Self], _out: &mut [Self]) -> bool {
        false
    }
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
    fn as_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as f32
    }
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(bytes: &[u8]) -> Option<Self> {
        Some(f32::from_le_bytes(bytes.try_into().ok()?))
    }
    fn accel_binary(k: &dyn VectorKernels, op: BinaryOp, a: &[f32], b: &[f32], out: &mut [f32]) -> bool {
        k.binary_f32(op, a, b, out)
    }
    fn accel_unary(k: &dyn VectorKernels, op: UnaryOp, a: &[f32], out: &mut [f32]) -> bool {
        k.unary_f32(op, a, out)
    }
}

impl Element for f64 {
    const DTYPE: DType = DType::F64;
    fn as_f64(self) -> f64 {
        self
    }
    fn from_f64(v: f64) -> Self {
        v
    }
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(bytes: &[u8]) -> Option<Self> {
        Some(f64::from_le_bytes(bytes.try_into().ok()?))
    }
    fn accel_binary(k: &dyn VectorKernels, op: BinaryOp, a: &[f64], b: &[f64], out: &mut [f64]) -> bool {
        k.binary_f64(op, a, b, out)
    }
    fn accel_unary(k: &dyn VectorKernels, op: UnaryOp, a: &[f64], out: &mut [f64]) -> bool {
        k.unary_f64(op, a, out)
    }
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;
    fn as_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i32
    }
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(bytes: &[u8]) -> Option<Self> {
        Some(i32::from_le_bytes(bytes.try_into().ok()?))
    }
    fn wrapping_add(self, rhs: Self) -> Self {
        WrappingAdd::wrapping_add(&self, &rhs)
    }
    fn wrapping_sub(self, rhs: Self) -> Self {
        WrappingSub::wrapping_sub(&self, &rhs)
    }
    fn wrapping_mul(self, rhs: Self) -> Self {
        WrappingMul::wrapping_mul(&self, &rhs)
    }
    fn wrapping_div(self, rhs: Self) -> Self {
        i32::wrapping_div(self, rhs)
    }
    fn wrapping_neg(self) -> Self {
        WrappingNeg::wrapping_neg(&self)
    }
}

impl Element for i64 {
    const DTYPE: DType = DType::I64;
    fn as_f64(self) -> f64 {
        self as f64
    }
    fn from_f64(v: f64) -> Self {
        v as i64
    }
    fn write_le(self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.to_le_bytes());
    }
    fn read_le(bytes: &[u8]) -> Option<Self> {
        Some(i64::from_le_bytes(bytes.try_into().ok()?))
    }
    fn wrapping_add(self, rhs: Self) -> Self {
        WrappingAdd::wrapping_add(&self, &rhs)
    }
    fn wrapping_sub(self, rhs: Self) -> Self {
        WrappingSub::wrapping_sub(&self, &rhs)
    }
    fn wrapping_mul(self, rhs: Self) -> Self {
        WrappingMul::wrapping_mul(&self, &rhs)
    }
    fn wrapping_div(self, rhs: Self) -> Self {
        i64::wrapping_div(self, rhs)
    }
    fn wrapping_neg(self) -> Self {
        WrappingNeg::wrapping_neg(&self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dtype_size() {
        assert_eq!(DType::F32.size_in_bytes(), 4);
        assert_eq!(DType::F64.size_in_bytes(), 8);
        assert_eq!(DType::I32.size_in_bytes(), 4);
        assert_eq!(DType::I64.size_in_bytes(), 8);
    }

    #[test]
    fn test_tag_roundtrip() {
        for dt in [DType::F32, DType::F64, DType::I32, DType::I64] {
            assert_eq!(DType::from_tag(&dt.to_string()), Some(dt));
        }
        assert_eq!(DType::from_tag("u8"), None);
    }

    #[test]
    fn test_le_bytes() {
        let mut buf = Vec::new();
        (-7i32).write_le(&mut buf);
        assert_eq!(buf.len(), 4);
        assert_eq!(i32::read_le(&buf), Some(-7));
        assert_eq!(i32::read_le(&buf[..3]), None);
    }

    #[test]
    fn test_from_f64_truncates_ints() {
        assert_eq!(i64::from_f64(2.9), 2);
        assert_eq!(f32::from_f64(0.5).as_f64(), 0.5);
    }
}
