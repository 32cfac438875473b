use std::ops::Range;

use crate::error::{Error, Result};
use crate::shape::{self, Shape};

// Layout — how a logical shape maps onto a flat buffer
//
// A layout is shape + strides + axis order + offset. Views (transpose,
// index, reshape of contiguous data) only produce a new Layout; the buffer
// is shared and never touched.
//
//   - strides[i] is the element step in the buffer for logical axis i.
//   - order[i] names the axis of the original row-major buffer that logical
//     axis i came from. A freshly allocated tensor has order [0, 1, .., n-1];
//     transpose reverses it, permute rearranges it, index drops an entry.
//   - offset is where element [0, 0, .., 0] lives in the buffer.
//
// After a permutation the strides are no longer row-major, so element access
// must go through `flat_index` / `strided_indices`, never through a raw
// buffer position.

/// Layout describes how a tensor's logical shape maps to flat storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    shape: Shape,
    strides: Vec<usize>,
    order: Vec<usize>,
    offset: usize,
}

impl Layout {
    /// Row-major layout with identity axis order.
    pub fn contiguous(shape: Shape) -> Self {
        let strides = shape.stride_contiguous();
        let order = (0..shape.rank()).collect();
        Layout {
            shape,
            strides,
            order,
            offset: 0,
        }
    }

    /// Layout with explicit metadata, as read back from a serialized record.
    pub fn new(shape: Shape, strides: Vec<usize>, order: Vec<usize>, offset: usize) -> Result<Self> {
        if strides.len() != shape.rank() {
            return Err(Error::DimensionMismatch {
                expected: shape.rank(),
                got: strides.len(),
            });
        }
        shape::validate_permutation(&order, shape.rank())?;
        let layout = Layout {
            shape,
            strides,
            order,
            offset,
        };
        if layout.shape.checked_elem_count().is_none() || layout.checked_required_len().is_none() {
            return Err(Error::msg(format!(
                "layout of shape {} with strides {:?} overflows the address space",
                layout.shape, layout.strides
            )));
        }
        Ok(layout)
    }

    pub fn shape(&self) -> &Shape {
        &self.shape
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Axis permutation relative to the buffer's row-major layout.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn rank(&self) -> usize {
        self.shape.rank()
    }

    pub fn dims(&self) -> &[usize] {
        self.shape.dims()
    }

    pub fn elem_count(&self) -> usize {
        self.shape.elem_count()
    }

    /// Row-major strides, so logical order equals buffer order starting at
    /// `offset`. Size-1 axes are ignored because their stride is never used.
    pub fn is_contiguous(&self) -> bool {
        let expected = self.shape.stride_contiguous();
        self.dims()
            .iter()
            .zip(self.strides.iter().zip(&expected))
            .all(|(&d, (&s, &e))| d <= 1 || s == e)
    }

    /// Buffer range covered by a contiguous layout.
    pub fn contiguous_range(&self) -> Option<Range<usize>> {
        if self.is_contiguous() {
            Some(self.offset..self.offset + self.elem_count())
        } else {
            None
        }
    }

    /// Rearrange axes: logical axis i of the result is axis `order[i]` of
    /// `self`. Zero-copy.
    pub fn permute(&self, order: &[usize]) -> Result<Layout> {
        let dims = shape::permute(self.dims(), order)?;
        let strides = shape::permute(&self.strides, order)?;
        let new_order = shape::permute(&self.order, order)?;
        Ok(Layout {
            shape: Shape::new(dims),
            strides,
            order: new_order,
            offset: self.offset,
        })
    }

    /// Reverse every axis, e.g. `[2, 3, 4]` → `[4, 3, 2]`.
    pub fn transpose(&self) -> Layout {
        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        let mut order = self.order.clone();
        dims.reverse();
        strides.reverse();
        order.reverse();
        Layout {
            shape: Shape::new(dims),
            strides,
            order,
            offset: self.offset,
        }
    }

    /// Swap two axes.
    pub fn swap_axes(&self, a: usize, b: usize) -> Result<Layout> {
        let rank = self.rank();
        if a >= rank || b >= rank {
            return Err(Error::AxisOutOfRange {
                axis: a.max(b),
                rank,
            });
        }
        let mut order: Vec<usize> = (0..rank).collect();
        order.swap(a, b);
        self.permute(&order)
    }

    /// Fix `axis` at `index` and drop it. The remaining axes keep their
    /// relative order.
    pub fn select(&self, axis: usize, index: isize) -> Result<Layout> {
        let rank = self.rank();
        if axis >= rank {
            return Err(Error::AxisOutOfRange { axis, rank });
        }
        let size = self.dims()[axis];
        let idx = shape::normalize_index(index, axis, size)?;

        let mut dims = self.dims().to_vec();
        let mut strides = self.strides.clone();
        let mut order = self.order.clone();
        dims.remove(axis);
        let stride = strides.remove(axis);
        let dropped = order.remove(axis);
        for o in order.iter_mut() {
            if *o > dropped {
                *o -= 1;
            }
        }
        Ok(Layout {
            shape: Shape::new(dims),
            strides,
            order,
            offset: self.offset + idx * stride,
        })
    }

    /// Drop every size-1 axis. Zero-copy.
    pub fn squeeze(&self) -> Layout {
        let mut layout = self.clone();
        for axis in (0..self.rank()).rev() {
            if self.dims()[axis] == 1 {
                if let Ok(l) = layout.select(axis, 0) {
                    layout = l;
                }
            }
        }
        layout
    }

    /// Insert a size-1 axis at `axis`. Zero-copy.
    pub fn unsqueeze(&self, axis: usize) -> Result<Layout> {
        let rank = self.rank();
        if axis > rank {
            return Err(Error::AxisOutOfRange { axis, rank });
        }
        let stride = if axis < rank {
            self.strides[axis] * self.dims()[axis]
        } else {
            1
        };
        // the new axis takes the place of its right neighbour in buffer order
        let slot = if axis < rank { self.order[axis] } else { rank };
        let mut order: Vec<usize> = self
            .order
            .iter()
            .map(|&o| if o >= slot { o + 1 } else { o })
            .collect();
        order.insert(axis, slot);
        let mut strides = self.strides.clone();
        strides.insert(axis, stride);
        Ok(Layout {
            shape: self.shape.unsqueeze(axis)?,
            strides,
            order,
            offset: self.offset,
        })
    }

    /// Reinterpret a contiguous layout under another shape with the same
    /// element count.
    pub fn reshape(&self, shape: Shape) -> Result<Layout> {
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ShapeMismatch {
                expected: self.shape.clone(),
                got: shape,
            });
        }
        if !self.is_contiguous() {
            return Err(Error::msg("reshape view requires a contiguous layout"));
        }
        let mut layout = Layout::contiguous(shape);
        layout.offset = self.offset;
        Ok(layout)
    }

    /// Storage position of a multi-dimensional index:
    /// `offset + sum(index[i] * stride[i])`.
    pub fn flat_index(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.rank() {
            return Err(Error::DimensionMismatch {
                expected: self.rank(),
                got: index.len(),
            });
        }
        let mut flat = self.offset;
        for (axis, (&i, (&d, &s))) in index
            .iter()
            .zip(self.dims().iter().zip(&self.strides))
            .enumerate()
        {
            if i >= d {
                return Err(Error::IndexOutOfBounds {
                    index: i as isize,
                    axis,
                    size: d,
                });
            }
            flat += i * s;
        }
        Ok(flat)
    }

    /// Storage positions of every element, in logical row-major order.
    pub fn strided_indices(&self) -> StridedIter {
        StridedIter::new(self)
    }

    /// One past the largest storage position this layout can address.
    pub fn required_len(&self) -> usize {
        if self.elem_count() == 0 {
            return self.offset;
        }
        self.offset
            + self
                .dims()
                .iter()
                .zip(&self.strides)
                .map(|(&d, &s)| (d - 1) * s)
                .sum::<usize>()
            + 1
    }

    fn checked_required_len(&self) -> Option<usize> {
        if self.shape.checked_elem_count()? == 0 {
            return Some(self.offset);
        }
        self.dims()
            .iter()
            .zip(&self.strides)
            .try_fold(self.offset, |acc, (&d, &s)| acc.checked_add((d - 1).checked_mul(s)?))?
            .checked_add(1)
    }
}

// StridedIter — storage positions in logical order
//
// Contiguous layouts count offset, offset+1, ...; permuted ones hop around
// the buffer following the strides.

/// Iterator that yields flat storage indices for each element of a Layout.
pub struct StridedIter {
    current: Vec<usize>,
    dims: Vec<usize>,
    strides: Vec<usize>,
    /// Storage position of `current`.
    position: usize,
    remaining: usize,
    started: bool,
}

impl StridedIter {
    fn new(layout: &Layout) -> Self {
        StridedIter {
            current: vec![0; layout.rank()],
            dims: layout.dims().to_vec(),
            strides: layout.strides().to_vec(),
            position: layout.offset(),
            remaining: layout.elem_count(),
            started: false,
        }
    }

    /// Odometer step on the innermost axis, carrying outward.
    fn advance(&mut self) {
        for i in (0..self.dims.len()).rev() {
            self.current[i] += 1;
            self.position += self.strides[i];
            if self.current[i] < self.dims[i] {
                return;
            }
            self.position -= self.current[i] * self.strides[i];
            self.current[i] = 0;
        }
    }
}

impl Iterator for StridedIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        if self.started {
            self.advance();
        }
        self.started = true;
        self.remaining -= 1;
        Some(self.position)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for StridedIter {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contiguous_layout() {
        let layout = Layout::contiguous(Shape::from((2, 3)));
        assert!(layout.is_contiguous());
        assert_eq!(layout.strides(), &[3, 1]);
        assert_eq!(layout.order(), &[0, 1]);
        let indices: Vec<usize> = layout.strided_indices().collect();
        assert_eq!(indices, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_new_rejects_overflowing_layouts() -> Result<()> {
        let huge = Shape::new(vec![1 << 32, 1 << 32, 16]);
        assert!(Layout::new(huge, vec![1 << 36, 16, 1], vec![0, 1, 2], 0).is_err());

        let far = Shape::new(vec![2, 2]);
        assert!(Layout::new(far, vec![usize::MAX, 1], vec![0, 1], 0).is_err());

        let empty = Layout::new(Shape::new(vec![1 << 40, 1 << 40, 0]), vec![0, 0, 0], vec![0, 1, 2], 3)?;
        assert_eq!(empty.elem_count(), 0);
        assert_eq!(empty.required_len(), 3);
        Ok(())
    }

    #[test]
    fn test_transpose_indices() {
        // [[0, 1, 2],
        //  [3, 4, 5]] read column-major
        let layout = Layout::contiguous(Shape::from((2, 3))).transpose();
        assert_eq!(layout.dims(), &[3, 2]);
        assert_eq!(layout.strides(), &[1, 3]);
        assert_eq!(layout.order(), &[1, 0]);
        assert!(!layout.is_contiguous());
        let indices: Vec<usize> = layout.strided_indices().collect();
        assert_eq!(indices, vec![0, 3, 1, 4, 2, 5]);
    }

    #[test]
    fn test_double_transpose_is_identity() {
        let layout = Layout::contiguous(Shape::from((2, 3, 4)));
        assert_eq!(layout.transpose().transpose(), layout);
    }

    #[test]
    fn test_permute() -> Result<()> {
        let layout = Layout::contiguous(Shape::from((2, 3, 4))).permute(&[1, 2, 0])?;
        assert_eq!(layout.dims(), &[3, 4, 2]);
        assert_eq!(layout.strides(), &[4, 1, 12]);
        assert_eq!(layout.order(), &[1, 2, 0]);
        Ok(())
    }

    #[test]
    fn test_select_after_transpose() -> Result<()> {
        // (3, 4, 2) transposed is (2, 4, 3); fixing the first axis at 0 gives
        // a (4, 3) view over every other element.
        let layout = Layout::contiguous(Shape::from((3, 4, 2)))
            .transpose()
            .select(0, 0)?;
        assert_eq!(layout.dims(), &[4, 3]);
        assert_eq!(layout.order(), &[1, 0]);
        let indices: Vec<usize> = layout.strided_indices().collect();
        assert_eq!(indices, vec![0, 8, 16, 2, 10, 18, 4, 12, 20, 6, 14, 22]);
        Ok(())
    }

    #[test]
    fn test_select_negative() -> Result<()> {
        let layout = Layout::contiguous(Shape::from((2, 2))).select(0, -1)?;
        assert_eq!(layout.offset(), 2);
        assert!(layout.is_contiguous());
        assert!(Layout::contiguous(Shape::from((2, 2))).select(0, 2).is_err());
        Ok(())
    }

    #[test]
    fn test_squeeze_unsqueeze_views() -> Result<()> {
        let layout = Layout::contiguous(Shape::from(vec![3, 1, 3, 1]));
        let squeezed = layout.squeeze();
        assert_eq!(squeezed.dims(), &[3, 3]);
        assert_eq!(squeezed.strides(), &[3, 1]);
        assert_eq!(squeezed.squeeze(), squeezed);

        let restored = squeezed.unsqueeze(1)?;
        assert_eq!(restored.dims(), &[3, 1, 3]);
        assert!(restored.is_contiguous());
        let indices: Vec<usize> = restored.strided_indices().collect();
        assert_eq!(indices, (0..9).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_reshape_keeps_offset() -> Result<()> {
        let layout = Layout::contiguous(Shape::from((2, 6))).select(0, 1)?;
        let reshaped = layout.reshape(Shape::from((3, 2)))?;
        assert_eq!(reshaped.offset(), 6);
        assert!(layout.reshape(Shape::from(5)).is_err());
        Ok(())
    }

    #[test]
    fn test_flat_index() -> Result<()> {
        let layout = Layout::contiguous(Shape::from((2, 3, 4)));
        assert_eq!(layout.flat_index(&[1, 2, 3])?, 23);
        assert!(layout.flat_index(&[2, 0, 0]).is_err());
        Ok(())
    }

    #[test]
    fn test_required_len() {
        let layout = Layout::contiguous(Shape::from((2, 3))).transpose();
        assert_eq!(layout.required_len(), 6);
    }
}
