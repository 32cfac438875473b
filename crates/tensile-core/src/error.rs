use crate::shape::Shape;

/// Every failure mode of the tensor engine.
///
/// Structural violations (incompatible shapes, bad indices, unsupported
/// gradients) are reported through this one enum so that `?` works across
/// the core, the autodiff graph and the serialization layer alike.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Two shapes that had to agree (or broadcast) do not.
    #[error("shape mismatch: expected {expected}, got {got}")]
    ShapeMismatch { expected: Shape, got: Shape },

    /// A flat buffer does not hold exactly `product(shape)` elements.
    #[error("element count mismatch: shape {shape} requires {expected} elements, got {got}")]
    ElementCountMismatch {
        shape: Shape,
        expected: usize,
        got: usize,
    },

    /// Raw or negative index outside of an axis extent.
    #[error("index {index} out of bounds for axis {axis} with size {size}")]
    IndexOutOfBounds {
        index: isize,
        axis: usize,
        size: usize,
    },

    /// Indexing or masking with more axes than the tensor has, or an op
    /// restricted to a fixed rank.
    #[error("dimension mismatch: expected {expected} dimensions, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    /// Axis argument outside the tensor's rank.
    #[error("axis out of range: axis {axis} for tensor with {rank} dimensions")]
    AxisOutOfRange { axis: usize, rank: usize },

    /// The element type stored in a serialized record differs from the one
    /// requested by the caller.
    #[error("dtype mismatch: expected {expected}, got {got}")]
    DTypeMismatch {
        expected: crate::DType,
        got: crate::DType,
    },

    /// A reduction with no identity (max/min) over zero elements.
    #[error("{op} over an empty tensor")]
    EmptyTensor { op: &'static str },

    /// Integer division with a zero divisor.
    #[error("integer division by zero")]
    DivisionByZero,

    /// Recognized but unsupported operation, e.g. a gradient with no rule.
    #[error("not implemented: {0}")]
    NotImplemented(&'static str),

    /// Malformed serialized bytes.
    #[error("serialization: {0}")]
    Serialization(String),

    /// Generic message for cases not covered above.
    #[error("{0}")]
    Msg(String),
}

impl Error {
    /// Create an error from any string message.
    pub fn msg(s: impl Into<String>) -> Self {
        Error::Msg(s.into())
    }

    pub fn shape_mismatch(expected: impl Into<Shape>, got: impl Into<Shape>) -> Self {
        Error::ShapeMismatch {
            expected: expected.into(),
            got: got.into(),
        }
    }
}

/// Convenience Result type used throughout Tensile.
pub type Result<T> = std::result::Result<T, Error>;

/// Early return with a formatted error message.
/// Usage: `bail!("something went wrong: {}", detail)`
#[macro_export]
macro_rules! bail {
    ($($arg:tt)*) => {
        return Err($crate::Error::Msg(format!($($arg)*)))
    };
}
