use std::fmt;

use crate::error::{Error, Result};

// Shape — extents of each axis
//
// A Shape is the ordered list of per-axis sizes of a tensor:
//   - Scalar: Shape([])          — 0 axes, 1 element
//   - Vector: Shape([5])         — 1 axis, 5 elements
//   - Matrix: Shape([3, 4])      — 2 axes, 12 elements
//
// Besides the element count it determines the default row-major strides and
// whether two tensors are compatible under numpy-style broadcasting. A zero
// extent is legal and yields an empty tensor.

/// N-dimensional shape of a tensor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Shape(Vec<usize>);

impl Shape {
    pub fn new(dims: Vec<usize>) -> Self {
        Shape(dims)
    }

    /// The axis sizes as a slice.
    pub fn dims(&self) -> &[usize] {
        &self.0
    }

    /// Number of axes (0 for scalar).
    pub fn rank(&self) -> usize {
        self.0.len()
    }

    /// Total number of elements. The scalar shape `[]` holds one element,
    /// any zero extent makes the count zero.
    pub fn elem_count(&self) -> usize {
        if self.0.contains(&0) {
            return 0;
        }
        self.0.iter().product()
    }

    /// [`Shape::elem_count`], or `None` when the product does not fit in a
    /// `usize`.
    pub fn checked_elem_count(&self) -> Option<usize> {
        if self.0.contains(&0) {
            return Some(0);
        }
        self.0.iter().try_fold(1usize, |acc, &d| acc.checked_mul(d))
    }

    /// Row-major strides: for `[2, 3, 4]` this is `[12, 4, 1]`.
    pub fn stride_contiguous(&self) -> Vec<usize> {
        strides_for(&self.0)
    }

    /// Size of a specific axis.
    pub fn dim(&self, axis: usize) -> Result<usize> {
        self.0.get(axis).copied().ok_or(Error::AxisOutOfRange {
            axis,
            rank: self.rank(),
        })
    }

    /// True when every axis has size 1 (including the scalar shape).
    pub fn is_scalar_like(&self) -> bool {
        self.0.iter().all(|&d| d == 1)
    }

    /// Drop every size-1 axis. Squeezing twice is the same as squeezing once.
    pub fn squeeze(&self) -> Shape {
        Shape(self.0.iter().copied().filter(|&d| d != 1).collect())
    }

    /// Insert a size-1 axis at `axis` (which may equal `rank`).
    pub fn unsqueeze(&self, axis: usize) -> Result<Shape> {
        if axis > self.rank() {
            return Err(Error::AxisOutOfRange {
                axis,
                rank: self.rank(),
            });
        }
        let mut dims = self.0.clone();
        dims.insert(axis, 1);
        Ok(Shape(dims))
    }

    /// Left-pad with size-1 axes up to `rank`.
    pub fn pad_to_rank(&self, rank: usize) -> Shape {
        let pad = rank.saturating_sub(self.rank());
        let mut dims = vec![1; pad];
        dims.extend_from_slice(&self.0);
        Shape(dims)
    }

    // Broadcasting

    /// Whether `lhs` and `rhs` broadcast together.
    ///
    /// Shapes are aligned at the trailing axis, the shorter one is padded on
    /// the left with 1s, and two axes agree when they are equal or one of
    /// them is 1.
    pub fn broadcastable(lhs: &Shape, rhs: &Shape) -> bool {
        let l = lhs.dims();
        let r = rhs.dims();
        l.iter()
            .rev()
            .zip(r.iter().rev())
            .all(|(&a, &b)| a == b || a == 1 || b == 1)
    }

    /// Broadcast result shape of `lhs` and `rhs`.
    ///
    ///   [3, 4] and [4]       → [3, 4]
    ///   [2, 1] and [1, 3]    → [2, 3]
    ///   [5, 3, 1] and [3, 4] → [5, 3, 4]
    ///   [3] and [4]          → ShapeMismatch
    pub fn broadcast_shape(lhs: &Shape, rhs: &Shape) -> Result<Shape> {
        let l = lhs.dims();
        let r = rhs.dims();
        let max_rank = l.len().max(r.len());
        let mut result = Vec::with_capacity(max_rank);

        for i in 0..max_rank {
            let ld = if i < l.len() { l[l.len() - 1 - i] } else { 1 };
            let rd = if i < r.len() { r[r.len() - 1 - i] } else { 1 };

            if ld == rd || rd == 1 {
                result.push(ld);
            } else if ld == 1 {
                result.push(rd);
            } else {
                return Err(Error::ShapeMismatch {
                    expected: lhs.clone(),
                    got: rhs.clone(),
                });
            }
        }

        result.reverse();
        Ok(Shape(result))
    }

    /// Axes of `target` along which this shape was expanded, after left
    /// padding. These are the axes a gradient must be summed over to undo
    /// the broadcast.
    pub fn broadcast_axes(&self, target: &Shape) -> Vec<usize> {
        let padded = self.pad_to_rank(target.rank());
        padded
            .dims()
            .iter()
            .zip(target.dims())
            .enumerate()
            .filter(|(_, (&s, &t))| s == 1 && t != 1)
            .map(|(i, _)| i)
            .collect()
    }
}

/// Row-major strides for the given extents.
pub fn strides_for(dims: &[usize]) -> Vec<usize> {
    let mut strides = vec![0usize; dims.len()];
    let mut acc = 1usize;
    for i in (0..dims.len()).rev() {
        strides[i] = acc;
        acc *= dims[i];
    }
    strides
}

/// Reorder `values` so that position `i` holds `values[order[i]]`.
///
/// Used for strides and extents alike: permuting both by the same order
/// yields a view of the same buffer with its axes rearranged.
pub fn permute<V: Copy>(values: &[V], order: &[usize]) -> Result<Vec<V>> {
    validate_permutation(order, values.len())?;
    Ok(order.iter().map(|&o| values[o]).collect())
}

/// Check that `order` is a permutation of `0..rank`.
pub fn validate_permutation(order: &[usize], rank: usize) -> Result<()> {
    if order.len() != rank {
        return Err(Error::DimensionMismatch {
            expected: rank,
            got: order.len(),
        });
    }
    let mut seen = vec![false; rank];
    for &o in order {
        if o >= rank {
            return Err(Error::AxisOutOfRange { axis: o, rank });
        }
        if seen[o] {
            return Err(Error::msg(format!("axis {o} repeated in permutation {order:?}")));
        }
        seen[o] = true;
    }
    Ok(())
}

/// Resolve a possibly negative index against an axis of `size`.
pub fn normalize_index(index: isize, axis: usize, size: usize) -> Result<usize> {
    let resolved = if index < 0 {
        index + size as isize
    } else {
        index
    };
    if resolved < 0 || resolved as usize >= size {
        return Err(Error::IndexOutOfBounds { index, axis, size });
    }
    Ok(resolved as usize)
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", d)?;
        }
        write!(f, "]")
    }
}

impl From<()> for Shape {
    fn from(_: ()) -> Self {
        Shape(vec![])
    }
}

impl From<usize> for Shape {
    fn from(d: usize) -> Self {
        Shape(vec![d])
    }
}

impl From<(usize, usize)> for Shape {
    fn from((d0, d1): (usize, usize)) -> Self {
        Shape(vec![d0, d1])
    }
}

impl From<(usize, usize, usize)> for Shape {
    fn from((d0, d1, d2): (usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2])
    }
}

impl From<(usize, usize, usize, usize)> for Shape {
    fn from((d0, d1, d2, d3): (usize, usize, usize, usize)) -> Self {
        Shape(vec![d0, d1, d2, d3])
    }
}

impl From<Vec<usize>> for Shape {
    fn from(v: Vec<usize>) -> Self {
        Shape(v)
    }
}

impl From<&[usize]> for Shape {
    fn from(s: &[usize]) -> Self {
        Shape(s.to_vec())
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(s: [usize; N]) -> Self {
        Shape(s.to_vec())
    }
}

impl From<&Shape> for Shape {
    fn from(s: &Shape) -> Self {
        s.clone()
    }
}
