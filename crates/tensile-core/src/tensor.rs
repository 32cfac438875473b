use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, StandardNormal};

use crate::device::CpuDevice;
use crate::dtype::{DType, Element};
use crate::error::{Error, Result};
use crate::layout::Layout;
use crate::shape::{self, Shape};

/// Upper bound on element counts derived from values rather than shapes.
const MAX_GENERATED_LEN: usize = 1 << 32;

// Tensor — strided n-dimensional array over a shared buffer
//
// A Tensor is a handle: an Arc'd flat buffer plus the Layout that says how
// to read it. Cloning a tensor, transposing it, indexing into it or
// reshaping contiguous data all produce new handles onto the SAME buffer.
//
// MEMORY MODEL:
//
//   The buffer sits behind Arc<RwLock<Vec<T>>>. Every view holds an Arc, so
//   the buffer lives as long as its longest-living view. Writes through one
//   view (`set`, `fill`, `assign`, optimizer steps) are visible through all
//   of them. The lock only makes single accesses sound; ordering writes
//   against concurrent readers is up to the caller.
//
//   Element type is the type parameter: Tensor<f32>, Tensor<i64>, ... so
//   kernels are picked at compile time. The device handle decides how the
//   dispatcher splits work and which vector kernels it may use.

/// An n-dimensional array of `T` on a [`CpuDevice`].
///
/// ```ignore
/// let device = CpuDevice::default();
/// let a = Tensor::<f32>::arange(6, &device).reshape((2, 3))?;
/// let b = a.transpose();            // (3, 2) view, no copy
/// assert!(a.shares_storage(&b));
/// ```
#[derive(Clone)]
pub struct Tensor<T: Element> {
    storage: Arc<RwLock<Vec<T>>>,
    layout: Layout,
    device: CpuDevice,
}

impl<T: Element> fmt::Debug for Tensor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(shape={}, dtype={}, device={:?})",
            self.layout.shape(),
            T::DTYPE,
            self.device,
        )
    }
}

impl<T: Element> Tensor<T> {
    // Internal constructors

    /// Wrap a buffer whose length already equals `product(shape)`.
    pub(crate) fn from_parts(data: Vec<T>, shape: Shape, device: &CpuDevice) -> Self {
        debug_assert_eq!(data.len(), shape.elem_count());
        Tensor {
            storage: Arc::new(RwLock::new(data)),
            layout: Layout::contiguous(shape),
            device: device.clone(),
        }
    }

    /// Another handle onto the same buffer.
    fn view_with_layout(&self, layout: Layout) -> Self {
        Tensor {
            storage: Arc::clone(&self.storage),
            layout,
            device: self.device.clone(),
        }
    }

    /// Rebuild a tensor from raw parts, e.g. a decoded record. The layout
    /// must stay inside the buffer.
    pub fn from_raw_parts(data: Vec<T>, layout: Layout, device: &CpuDevice) -> Result<Self> {
        if layout.required_len() > data.len() {
            return Err(Error::ElementCountMismatch {
                shape: layout.shape().clone(),
                expected: layout.required_len(),
                got: data.len(),
            });
        }
        Ok(Tensor {
            storage: Arc::new(RwLock::new(data)),
            layout,
            device: device.clone(),
        })
    }

    /// The buffer prefix this view can reach, plus its layout. Feeding both
    /// back to [`Tensor::from_raw_parts`] reproduces the view exactly.
    pub fn to_raw_parts(&self) -> Result<(Vec<T>, Layout)> {
        let storage = self.read_storage()?;
        let len = self.layout.required_len().min(storage.len());
        Ok((storage[..len].to_vec(), self.layout.clone()))
    }

    // Accessors

    pub fn shape(&self) -> &Shape {
        self.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.layout.dims()
    }

    pub fn rank(&self) -> usize {
        self.layout.rank()
    }

    pub fn elem_count(&self) -> usize {
        self.layout.elem_count()
    }

    pub fn dtype(&self) -> DType {
        T::DTYPE
    }

    pub fn device(&self) -> &CpuDevice {
        &self.device
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn strides(&self) -> &[usize] {
        self.layout.strides()
    }

    pub fn is_contiguous(&self) -> bool {
        self.layout.is_contiguous()
    }

    /// Whether both handles read the same buffer.
    pub fn shares_storage(&self, other: &Tensor<T>) -> bool {
        Arc::ptr_eq(&self.storage, &other.storage)
    }

    /// Length of the underlying buffer, which may exceed `elem_count` for
    /// index views.
    pub fn storage_len(&self) -> Result<usize> {
        Ok(self.read_storage()?.len())
    }

    pub(crate) fn read_storage(&self) -> Result<RwLockReadGuard<'_, Vec<T>>> {
        self.storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn write_storage(&self) -> Result<RwLockWriteGuard<'_, Vec<T>>> {
        self.storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    // Creation

    /// Tensor from a flat row-major buffer.
    pub fn from_vec(data: Vec<T>, shape: impl Into<Shape>, device: &CpuDevice) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.elem_count() {
            return Err(Error::ElementCountMismatch {
                expected: shape.elem_count(),
                got: data.len(),
                shape,
            });
        }
        Ok(Self::from_parts(data, shape, device))
    }

    pub fn from_slice(data: &[T], shape: impl Into<Shape>, device: &CpuDevice) -> Result<Self> {
        Self::from_vec(data.to_vec(), shape, device)
    }

    /// Rank-0 tensor holding one value.
    pub fn scalar(value: T, device: &CpuDevice) -> Self {
        Self::from_parts(vec![value], Shape::from(()), device)
    }

    pub fn full(shape: impl Into<Shape>, value: T, device: &CpuDevice) -> Self {
        let shape = shape.into();
        Self::from_parts(vec![value; shape.elem_count()], shape, device)
    }

    pub fn zeros(shape: impl Into<Shape>, device: &CpuDevice) -> Self {
        Self::full(shape, T::zero(), device)
    }

    pub fn ones(shape: impl Into<Shape>, device: &CpuDevice) -> Self {
        Self::full(shape, T::one(), device)
    }

    pub fn zeros_like(other: &Self) -> Self {
        Self::zeros(other.shape().clone(), other.device())
    }

    pub fn ones_like(other: &Self) -> Self {
        Self::ones(other.shape().clone(), other.device())
    }

    pub fn full_like(other: &Self, value: T) -> Self {
        Self::full(other.shape().clone(), value, other.device())
    }

    /// `[0, 1, ..., n-1]`.
    pub fn arange(n: usize, device: &CpuDevice) -> Self {
        let data = (0..n).map(|i| T::from_f64(i as f64)).collect();
        Self::from_parts(data, Shape::from(n), device)
    }

    /// `[start, start + step, ...]` up to but excluding `end`.
    pub fn range(start: T, end: T, step: T, device: &CpuDevice) -> Result<Self> {
        let (s, e, st) = (start.as_f64(), end.as_f64(), step.as_f64());
        if st == 0.0 || !st.is_finite() {
            return Err(Error::msg(format!("range: invalid step {step}")));
        }
        let count = ((e - s) / st).ceil().max(0.0);
        if !count.is_finite() || count > MAX_GENERATED_LEN as f64 {
            return Err(Error::msg(format!(
                "range: {start}..{end} by {step} exceeds {MAX_GENERATED_LEN} elements"
            )));
        }
        let n = count as usize;
        let data = (0..n).map(|i| T::from_f64(s + i as f64 * st)).collect();
        Ok(Self::from_parts(data, Shape::from(n), device))
    }

    /// Identity matrix.
    pub fn eye(n: usize, device: &CpuDevice) -> Self {
        let mut data = vec![T::zero(); n * n];
        for i in 0..n {
            data[i * n + i] = T::one();
        }
        Self::from_parts(data, Shape::from((n, n)), device)
    }

    /// Uniform samples in `[low, high)` from a seeded generator.
    ///
    /// Bounds must be finite with `low < high`.
    pub fn rand_uniform(shape: impl Into<Shape>, low: f64, high: f64, seed: u64, device: &CpuDevice) -> Result<Self> {
        if !(low.is_finite() && high.is_finite() && low < high) {
            return Err(Error::msg(format!("rand_uniform: invalid bounds [{low}, {high})")));
        }
        let shape = shape.into();
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..shape.elem_count())
            .map(|_| T::from_f64(rng.gen_range(low..high)))
            .collect();
        Ok(Self::from_parts(data, shape, device))
    }

    /// Standard normal samples from a seeded generator.
    pub fn randn(shape: impl Into<Shape>, seed: u64, device: &CpuDevice) -> Self {
        let shape = shape.into();
        let mut rng = StdRng::seed_from_u64(seed);
        let data = (0..shape.elem_count())
            .map(|_| {
                let v: f64 = StandardNormal.sample(&mut rng);
                T::from_f64(v)
            })
            .collect();
        Self::from_parts(data, shape, device)
    }

    // Reading

    /// Elements in logical row-major order.
    pub fn to_vec(&self) -> Result<Vec<T>> {
        let storage = self.read_storage()?;
        if let Some(range) = self.layout.contiguous_range() {
            return storage
                .get(range)
                .map(|s| s.to_vec())
                .ok_or_else(|| Error::msg("view exceeds its buffer"));
        }
        self.layout
            .strided_indices()
            .map(|i| {
                storage
                    .get(i)
                    .copied()
                    .ok_or_else(|| Error::msg("view exceeds its buffer"))
            })
            .collect()
    }

    /// The single value of a one-element tensor.
    pub fn item(&self) -> Result<T> {
        if self.elem_count() != 1 {
            return Err(Error::shape_mismatch((), self.shape()));
        }
        let pos = self.layout.offset();
        self.read_storage()?
            .get(pos)
            .copied()
            .ok_or_else(|| Error::msg("view exceeds its buffer"))
    }

    /// Element at a full index; negative entries count from the end.
    pub fn get(&self, index: &[isize]) -> Result<T> {
        let pos = self.position(index)?;
        self.read_storage()?
            .get(pos)
            .copied()
            .ok_or_else(|| Error::msg("view exceeds its buffer"))
    }

    fn position(&self, index: &[isize]) -> Result<usize> {
        if index.len() != self.rank() {
            return Err(Error::DimensionMismatch {
                expected: self.rank(),
                got: index.len(),
            });
        }
        let resolved = index
            .iter()
            .zip(self.dims())
            .enumerate()
            .map(|(axis, (&i, &size))| shape::normalize_index(i, axis, size))
            .collect::<Result<Vec<_>>>()?;
        self.layout.flat_index(&resolved)
    }

    // In-place mutation

    /// Overwrite one element. Visible through every view of the buffer.
    pub fn set(&self, index: &[isize], value: T) -> Result<()> {
        let pos = self.position(index)?;
        let mut storage = self.write_storage()?;
        match storage.get_mut(pos) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(Error::msg("view exceeds its buffer")),
        }
    }

    /// Overwrite every element addressed by this view.
    pub fn fill(&self, value: T) -> Result<()> {
        let mut storage = self.write_storage()?;
        for i in self.layout.strided_indices() {
            if let Some(slot) = storage.get_mut(i) {
                *slot = value;
            }
        }
        Ok(())
    }

    /// Overwrite this view's elements with `data`, given in logical order.
    pub fn set_data(&self, data: &[T]) -> Result<()> {
        if data.len() != self.elem_count() {
            return Err(Error::ElementCountMismatch {
                shape: self.shape().clone(),
                expected: self.elem_count(),
                got: data.len(),
            });
        }
        let mut storage = self.write_storage()?;
        for (i, &v) in self.layout.strided_indices().zip(data) {
            if let Some(slot) = storage.get_mut(i) {
                *slot = v;
            }
        }
        Ok(())
    }

    /// Overwrite this view with the contents of `src` (same shape).
    pub fn assign(&self, src: &Tensor<T>) -> Result<()> {
        if src.shape() != self.shape() {
            return Err(Error::shape_mismatch(self.shape(), src.shape()));
        }
        // read first: src may alias this buffer
        let data = src.to_vec()?;
        self.set_data(&data)
    }

    // Copies

    /// Deep copy into a fresh contiguous buffer.
    pub fn copy(&self) -> Result<Self> {
        Ok(Self::from_parts(self.to_vec()?, self.shape().clone(), &self.device))
    }

    /// Contiguous version of this tensor. Shares the buffer when the layout
    /// is already row-major, copies otherwise.
    pub fn contiguous(&self) -> Result<Self> {
        if self.is_contiguous() {
            return Ok(self.clone());
        }
        self.copy()
    }

    /// Element-type conversion. Fails on values that do not fit in `U`.
    pub fn cast<U: Element>(&self) -> Result<Tensor<U>> {
        let data = self
            .to_vec()?
            .into_iter()
            .map(|v| {
                num_traits::cast::<T, U>(v)
                    .ok_or_else(|| Error::msg(format!("cast: {v} does not fit in {}", U::DTYPE)))
            })
            .collect::<Result<Vec<U>>>()?;
        Ok(Tensor::<U>::from_parts(data, self.shape().clone(), &self.device))
    }

    // Views

    /// Reverse the axis order. Zero-copy.
    pub fn transpose(&self) -> Self {
        self.view_with_layout(self.layout.transpose())
    }

    /// Rearrange axes so that axis i of the result is axis `order[i]`.
    pub fn permute(&self, order: &[usize]) -> Result<Self> {
        Ok(self.view_with_layout(self.layout.permute(order)?))
    }

    pub fn swap_axes(&self, a: usize, b: usize) -> Result<Self> {
        Ok(self.view_with_layout(self.layout.swap_axes(a, b)?))
    }

    /// Index the leading axes. `index(&[i])` on `(2, 3, 4)` is a `(3, 4)`
    /// view; indexing every axis leaves a rank-0 view of one element.
    pub fn index(&self, index: &[isize]) -> Result<Self> {
        if index.len() > self.rank() {
            return Err(Error::DimensionMismatch {
                expected: self.rank(),
                got: index.len(),
            });
        }
        let mut layout = self.layout.clone();
        for &i in index {
            layout = layout.select(0, i)?;
        }
        Ok(self.view_with_layout(layout))
    }

    /// Fix one axis at `index` and drop it.
    pub fn select(&self, axis: usize, index: isize) -> Result<Self> {
        Ok(self.view_with_layout(self.layout.select(axis, index)?))
    }

    /// Same elements under a new shape. A view when the data is contiguous,
    /// a copy otherwise.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if shape.elem_count() != self.elem_count() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: shape,
            });
        }
        let base = self.contiguous()?;
        let layout = base.layout.reshape(shape)?;
        Ok(base.view_with_layout(layout))
    }

    /// Collapse to one axis.
    pub fn flatten(&self) -> Result<Self> {
        self.reshape(self.elem_count())
    }

    /// Drop every size-1 axis. Zero-copy and idempotent.
    pub fn squeeze(&self) -> Self {
        self.view_with_layout(self.layout.squeeze())
    }

    /// Insert a size-1 axis at `axis`. Zero-copy.
    pub fn unsqueeze(&self, axis: usize) -> Result<Self> {
        Ok(self.view_with_layout(self.layout.unsqueeze(axis)?))
    }

    // Comparison and ordering

    /// Same shape and same elements in logical order, regardless of how
    /// either side is laid out.
    pub fn is_equal(&self, other: &Tensor<T>) -> Result<bool> {
        if self.shape() != other.shape() {
            return Ok(false);
        }
        Ok(self.to_vec()? == other.to_vec()?)
    }

    /// Same shape and every pair of elements within `tol`.
    pub fn all_close(&self, other: &Tensor<T>, tol: f64) -> Result<bool> {
        if self.shape() != other.shape() {
            return Ok(false);
        }
        let (a, b) = (self.to_vec()?, other.to_vec()?);
        Ok(a
            .iter()
            .zip(&b)
            .all(|(x, y)| (x.as_f64() - y.as_f64()).abs() <= tol))
    }

    /// All elements sorted ascending, laid back into this tensor's shape.
    pub fn sort(&self) -> Result<Self> {
        let mut data = self.to_vec()?;
        data.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
        Ok(Self::from_parts(data, self.shape().clone(), &self.device))
    }

    /// Join equally shaped tensors along a new leading axis.
    pub fn stack(tensors: &[Tensor<T>]) -> Result<Self> {
        let first = tensors
            .first()
            .ok_or_else(|| Error::msg("stack: empty tensor list"))?;
        let mut data = Vec::with_capacity(first.elem_count() * tensors.len());
        for t in tensors {
            if t.shape() != first.shape() {
                return Err(Error::shape_mismatch(first.shape(), t.shape()));
            }
            data.extend(t.to_vec()?);
        }
        let mut dims = vec![tensors.len()];
        dims.extend_from_slice(first.dims());
        Ok(Self::from_parts(data, Shape::new(dims), &first.device))
    }

    /// One row per label with a 1 in the label's column.
    ///
    /// `labels` holds class indices, as a vector or an `(n, 1)` column.
    pub fn one_hot(labels: &Tensor<T>, classes: usize) -> Result<Self> {
        let rows = label_indices(labels, classes)?;
        let mut data = vec![T::zero(); rows.len() * classes];
        for (r, &c) in rows.iter().enumerate() {
            data[r * classes + c] = T::one();
        }
        Ok(Self::from_parts(data, Shape::from((rows.len(), classes)), &labels.device))
    }

    /// [`Tensor::one_hot`] with the class count taken as the largest label plus one.
    pub fn one_hot_auto(labels: &Tensor<T>) -> Result<Self> {
        let max = labels
            .to_vec()?
            .into_iter()
            .map(|v| v.as_f64())
            .fold(None, |m: Option<f64>, v| Some(m.map_or(v, |m| m.max(v))))
            .ok_or(Error::EmptyTensor { op: "one_hot_auto" })?;
        let rows = labels.elem_count().max(1);
        if !max.is_finite() || max + 1.0 > (MAX_GENERATED_LEN / rows) as f64 {
            return Err(Error::msg(format!("one_hot_auto: label {max} is out of range")));
        }
        // negative labels leave zero classes and are reported by one_hot
        Self::one_hot(labels, (max + 1.0).max(0.0) as usize)
    }

    /// For a `(n, c)` tensor pick column `indices[r]` of every row `r`,
    /// giving an `(n, 1)` column.
    pub fn index_mask(&self, indices: &Tensor<T>) -> Result<Self> {
        if indices.rank() > self.rank() {
            return Err(Error::DimensionMismatch {
                expected: self.rank(),
                got: indices.rank(),
            });
        }
        if self.rank() != 2 {
            return Err(Error::DimensionMismatch {
                expected: 2,
                got: self.rank(),
            });
        }
        let (n, c) = (self.dims()[0], self.dims()[1]);
        let cols = label_indices(indices, c)?;
        if cols.len() != n {
            return Err(Error::shape_mismatch(n, indices.shape()));
        }
        let data = cols
            .iter()
            .enumerate()
            .map(|(r, &col)| self.get(&[r as isize, col as isize]))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::from_parts(data, Shape::from((n, 1)), &self.device))
    }
}

/// Validate a label tensor (vector or column) and turn it into indices
/// below `classes`.
fn label_indices<T: Element>(labels: &Tensor<T>, classes: usize) -> Result<Vec<usize>> {
    let is_column = labels.rank() == 2 && labels.dims()[1] == 1;
    if labels.rank() > 1 && !is_column {
        return Err(Error::DimensionMismatch {
            expected: 1,
            got: labels.rank(),
        });
    }
    labels
        .to_vec()?
        .into_iter()
        .map(|v| {
            let f = v.as_f64();
            if f < 0.0 || f.fract() != 0.0 || f as usize >= classes {
                Err(Error::IndexOutOfBounds {
                    index: f as isize,
                    axis: 1,
                    size: classes,
                })
            } else {
                Ok(f as usize)
            }
        })
        .collect()
}
