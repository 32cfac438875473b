// Broadcast — materializing a tensor at a larger shape
//
// Replication works axis by axis from the innermost outwards. For the
// innermost expanded axis every source element is repeated N times in a
// row. For each axis further out, the block built so far (everything to
// the right of that axis) becomes the unit that is repeated. Axes that are
// not expanded are left alone, so expanded and non-expanded axes can
// interleave freely.
//
//   source [1, 2, 3] as (3, 1, 1) → target (2, 3, 2, 3)
//     axis 3 (1 → 3): 1 1 1 2 2 2 3 3 3
//     axis 2 (1 → 2): [1 1 1] [1 1 1] [2 2 2] [2 2 2] [3 3 3] [3 3 3]
//     axis 0 (1 → 2): the whole 18-element block twice

use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::shape::Shape;
use crate::tensor::Tensor;

/// Replicate a row-major buffer of shape `src` up to `target`.
///
/// `src` must already be left-padded to `target`'s rank, and every axis must
/// either match or be 1 in `src`.
pub fn replicate<T: Copy>(data: &[T], src: &[usize], target: &[usize]) -> Result<Vec<T>> {
    if src.len() != target.len() {
        return Err(Error::DimensionMismatch {
            expected: target.len(),
            got: src.len(),
        });
    }
    let mut current = data.to_vec();
    let mut dims = src.to_vec();
    for axis in (0..target.len()).rev() {
        if dims[axis] == target[axis] {
            continue;
        }
        if dims[axis] != 1 {
            return Err(Error::shape_mismatch(target, src));
        }
        let repeat = target[axis];
        let block: usize = dims[axis + 1..].iter().product();
        let outer: usize = dims[..axis].iter().product();
        let mut next = Vec::with_capacity(outer * repeat * block);
        for o in 0..outer {
            let unit = &current[o * block..(o + 1) * block];
            for _ in 0..repeat {
                next.extend_from_slice(unit);
            }
        }
        current = next;
        dims[axis] = repeat;
    }
    Ok(current)
}

impl<T: Element> Tensor<T> {
    /// Broadcast against `shape` and materialize the result.
    ///
    /// The result shape is the broadcast of both shapes, so `(3, 2)`
    /// broadcast to `(3, 1, 1)` yields `(3, 3, 2)`. Already matching tensors
    /// come back as a view.
    pub fn broadcast_to(&self, shape: impl Into<Shape>) -> Result<Tensor<T>> {
        let target = Shape::broadcast_shape(self.shape(), &shape.into())?;
        if &target == self.shape() {
            return Ok(self.clone());
        }
        let src = self.shape().pad_to_rank(target.rank());
        let data = replicate(&self.to_vec()?, src.dims(), target.dims())?;
        Ok(Tensor::from_parts(data, target, self.device()))
    }
}
