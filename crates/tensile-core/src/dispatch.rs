// Dispatch — fork-join execution of kernels over flat buffers
//
// Every entry point here works on contiguous slices; `Tensor` methods take
// care of shapes, broadcasting and materialization before calling in.
//
// Elementwise: the output is cut into `device.workers()` contiguous,
// disjoint chunks (ceil(n / workers) elements each). Each worker owns its
// chunk, so no locking is needed; rayon joins before returning. A worker
// first offers its chunk to the device's vector kernels and runs the
// scalar loop if they decline.
//
// Reductions: same split, each worker folds its chunk into a partial and
// merges it into one shared slot behind a Mutex, once per worker.
//
// Outputs smaller than the device's threshold run inline.

use std::sync::Mutex;

use rayon::prelude::*;

use crate::device::CpuDevice;
use crate::dtype::Element;
use crate::error::{Error, Result};
use crate::kernels::{binary_fn, unary_fn, BinaryOp, ReduceOp, UnaryOp};

/// Chunk length that splits `n` items across `workers`.
pub fn chunk_len(n: usize, workers: usize) -> usize {
    n.div_ceil(workers.max(1)).max(1)
}

/// Run `f(start, chunk)` over disjoint chunks of `out`, one per worker.
/// `start` is the chunk's position in `out`.
pub fn for_each_chunk<T, F>(device: &CpuDevice, out: &mut [T], f: F)
where
    T: Send,
    F: Fn(usize, &mut [T]) + Sync + Send,
{
    let n = out.len();
    if n < device.par_threshold() || device.workers() <= 1 {
        f(0, out);
        return;
    }
    let chunk = chunk_len(n, device.workers());
    device.install(|| {
        out.par_chunks_mut(chunk)
            .enumerate()
            .for_each(|(i, c)| f(i * chunk, c));
    });
}

/// Like [`for_each_chunk`] but the unit of work is a row of `row_len`
/// elements; chunks never split a row.
pub fn for_each_rows<T, F>(device: &CpuDevice, out: &mut [T], row_len: usize, f: F)
where
    T: Send,
    F: Fn(usize, &mut [T]) + Sync + Send,
{
    if row_len == 0 || out.is_empty() {
        return;
    }
    let rows = out.len() / row_len;
    if out.len() < device.par_threshold() || device.workers() <= 1 {
        f(0, out);
        return;
    }
    let rows_per_chunk = chunk_len(rows, device.workers());
    let chunk = rows_per_chunk * row_len;
    device.install(|| {
        out.par_chunks_mut(chunk)
            .enumerate()
            .for_each(|(i, c)| f(i * rows_per_chunk, c));
    });
}

/// Fold `data` in per-worker partials merged under a Mutex.
pub fn reduce_chunks<T, A, P, M>(device: &CpuDevice, data: &[T], init: A, partial: P, merge: M) -> Result<A>
where
    T: Sync,
    A: Send,
    P: Fn(&[T]) -> A + Sync + Send,
    M: Fn(&mut A, A) + Sync + Send,
{
    if data.len() < device.par_threshold() || device.workers() <= 1 {
        let mut acc = init;
        merge(&mut acc, partial(data));
        return Ok(acc);
    }
    let chunk = chunk_len(data.len(), device.workers());
    let slot = Mutex::new(init);
    device.install(|| {
        data.par_chunks(chunk).for_each(|c| {
            let p = partial(c);
            match slot.lock() {
                Ok(mut acc) => merge(&mut acc, p),
                Err(poisoned) => merge(&mut poisoned.into_inner(), p),
            }
        });
    });
    slot.into_inner()
        .map_err(|_| Error::msg("reduction accumulator poisoned"))
}

// Elementwise

/// `out[i] = a[i] op b[i]` for equal-length inputs.
pub fn binary<T: Element>(device: &CpuDevice, op: BinaryOp, a: &[T], b: &[T]) -> Vec<T> {
    debug_assert_eq!(a.len(), b.len());
    let mut out = vec![T::zero(); a.len()];
    let kernels = device.kernels();
    let f = binary_fn::<T>(op);
    for_each_chunk(device, &mut out, |start, chunk| {
        let end = start + chunk.len();
        let (a, b) = (&a[start..end], &b[start..end]);
        if !T::accel_binary(kernels, op, a, b, chunk) {
            for ((o, &x), &y) in chunk.iter_mut().zip(a).zip(b) {
                *o = f(x, y);
            }
        }
    });
    out
}

/// `out[i] = a[i] op s`.
pub fn binary_scalar_rhs<T: Element>(device: &CpuDevice, op: BinaryOp, a: &[T], s: T) -> Vec<T> {
    let f = binary_fn::<T>(op);
    map(device, a, move |x| f(x, s))
}

/// `out[i] = s op b[i]`.
pub fn binary_scalar_lhs<T: Element>(device: &CpuDevice, op: BinaryOp, s: T, b: &[T]) -> Vec<T> {
    let f = binary_fn::<T>(op);
    map(device, b, move |x| f(s, x))
}

pub fn unary<T: Element>(device: &CpuDevice, op: UnaryOp, a: &[T]) -> Vec<T> {
    let mut out = vec![T::zero(); a.len()];
    let kernels = device.kernels();
    let f = unary_fn::<T>(op);
    for_each_chunk(device, &mut out, |start, chunk| {
        let a = &a[start..start + chunk.len()];
        if !T::accel_unary(kernels, op, a, chunk) {
            for (o, &x) in chunk.iter_mut().zip(a) {
                *o = f(x);
            }
        }
    });
    out
}

/// Apply an arbitrary scalar function to every element.
pub fn map<T, U, F>(device: &CpuDevice, a: &[T], f: F) -> Vec<U>
where
    T: Element,
    U: Element,
    F: Fn(T) -> U + Sync + Send,
{
    let mut out = vec![U::zero(); a.len()];
    for_each_chunk(device, &mut out, |start, chunk| {
        let end = start + chunk.len();
        for (o, &x) in chunk.iter_mut().zip(&a[start..end]) {
            *o = f(x);
        }
    });
    out
}

// Reductions

/// Reduce every element to one value. `Max`/`Min` over nothing fail.
pub fn reduce_all<T: Element>(device: &CpuDevice, op: ReduceOp, data: &[T]) -> Result<T> {
    match op {
        ReduceOp::Sum => reduce_chunks(
            device,
            data,
            T::zero(),
            |c| c.iter().fold(T::zero(), |acc, &x| acc.wrapping_add(x)),
            |acc, p| *acc = (*acc).wrapping_add(p),
        ),
        ReduceOp::Max | ReduceOp::Min => {
            let pick = extremum::<T>(op);
            let best = reduce_chunks(
                device,
                data,
                None,
                |c| c.iter().copied().reduce(pick),
                |acc: &mut Option<T>, p| {
                    *acc = match (*acc, p) {
                        (Some(a), Some(b)) => Some(pick(a, b)),
                        (a, b) => a.or(b),
                    }
                },
            )?;
            best.ok_or(Error::EmptyTensor {
                op: if op == ReduceOp::Max { "max" } else { "min" },
            })
        }
    }
}

fn extremum<T: Element>(op: ReduceOp) -> fn(T, T) -> T {
    match op {
        ReduceOp::Min => |a, b| if b < a { b } else { a },
        _ => |a, b| if b > a { b } else { a },
    }
}

/// Reduce the middle axis of a contiguous `[outer, len, inner]` buffer.
///
/// Every output element `(o, i)` walks the reduced axis in its inner loop;
/// outputs are split across workers.
pub fn reduce_axis<T: Element>(
    device: &CpuDevice,
    op: ReduceOp,
    data: &[T],
    outer: usize,
    len: usize,
    inner: usize,
) -> Result<Vec<T>> {
    if len == 0 && op != ReduceOp::Sum {
        return Err(Error::EmptyTensor {
            op: if op == ReduceOp::Max { "max" } else { "min" },
        });
    }
    let mut out = vec![T::zero(); outer * inner];
    let pick = extremum::<T>(op);
    for_each_chunk(device, &mut out, |start, chunk| {
        for (k, o) in chunk.iter_mut().enumerate() {
            let flat = start + k;
            let (oi, ii) = (flat / inner, flat % inner);
            let base = oi * len * inner + ii;
            let mut values = (0..len).map(|j| data[base + j * inner]);
            *o = match op {
                ReduceOp::Sum => values.fold(T::zero(), |acc, x| acc.wrapping_add(x)),
                _ => match values.next() {
                    Some(first) => values.fold(first, pick),
                    None => T::zero(),
                },
            };
        }
    });
    Ok(out)
}

/// Index of the largest element along the middle axis of `[outer, len, inner]`.
pub fn argmax_axis<T: Element>(device: &CpuDevice, data: &[T], outer: usize, len: usize, inner: usize) -> Vec<i64> {
    let mut out = vec![0i64; outer * inner];
    for_each_chunk(device, &mut out, |start, chunk| {
        for (k, o) in chunk.iter_mut().enumerate() {
            let flat = start + k;
            let base = (flat / inner) * len * inner + flat % inner;
            let mut best = 0usize;
            for j in 1..len {
                if data[base + j * inner] > data[base + best * inner] {
                    best = j;
                }
            }
            *o = best as i64;
        }
    });
    out
}

// Softmax and matmul

/// Row-wise softmax of a contiguous `[rows, cols]` buffer. Each row
/// subtracts its own maximum before exponentiating.
pub fn softmax_rows<T: Element>(device: &CpuDevice, data: &[T], cols: usize) -> Vec<T> {
    let mut out = vec![T::zero(); data.len()];
    for_each_rows(device, &mut out, cols, |first_row, chunk| {
        let mut exps = Vec::with_capacity(cols);
        for (r, row_out) in chunk.chunks_mut(cols).enumerate() {
            let row = &data[(first_row + r) * cols..(first_row + r + 1) * cols];
            let max = row
                .iter()
                .map(|x| x.as_f64())
                .fold(f64::NEG_INFINITY, f64::max);
            exps.clear();
            exps.extend(row.iter().map(|x| (x.as_f64() - max).exp()));
            let sum: f64 = exps.iter().sum();
            for (o, &e) in row_out.iter_mut().zip(&exps) {
                *o = T::from_f64(e / sum);
            }
        }
    });
    out
}

/// `[m, k] @ [k, n]` where `b_t` holds `b` transposed as a contiguous
/// `[n, k]` buffer, so both operands of each dot product are unit-stride.
pub fn matmul<T: Element>(device: &CpuDevice, a: &[T], b_t: &[T], m: usize, k: usize, n: usize) -> Vec<T> {
    let mut out = vec![T::zero(); m * n];
    if n == 0 {
        return out;
    }
    debug_assert_eq!(a.len(), m * k);
    for_each_rows(device, &mut out, n, |first_row, chunk| {
        for (r, row_out) in chunk.chunks_mut(n).enumerate() {
            let a_row = &a[(first_row + r) * k..(first_row + r + 1) * k];
            for (j, o) in row_out.iter_mut().enumerate() {
                let b_col = &b_t[j * k..(j + 1) * k];
                *o = a_row
                    .iter()
                    .zip(b_col)
                    .fold(T::zero(), |acc, (&x, &y)| acc.wrapping_add(x.wrapping_mul(y)));
            }
        }
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{AccelPreference, DeviceConfig};

    fn parallel_device(accel: AccelPreference) -> Result<CpuDevice> {
        CpuDevice::new(
            DeviceConfig::default()
                .with_workers(4)
                .with_accel(accel)
                .with_par_threshold(1),
        )
    }

    #[test]
    fn test_chunk_len() {
        assert_eq!(chunk_len(10, 4), 3);
        assert_eq!(chunk_len(8, 4), 2);
        assert_eq!(chunk_len(0, 4), 1);
        assert_eq!(chunk_len(3, 0), 3);
    }

    #[test]
    fn test_binary_same_with_and_without_accel() -> Result<()> {
        let a: Vec<f32> = (0..1001).map(|i| i as f32 * 0.37).collect();
        let b: Vec<f32> = (0..1001).map(|i| 2.0 + i as f32 * 0.11).collect();
        let plain = parallel_device(AccelPreference::Off)?;
        let wide = parallel_device(AccelPreference::Lanes16)?;
        for op in [BinaryOp::Add, BinaryOp::Sub, BinaryOp::Mul, BinaryOp::Div, BinaryOp::Pow] {
            assert_eq!(binary(&plain, op, &a, &b), binary(&wide, op, &a, &b));
        }
        assert_eq!(
            unary(&plain, UnaryOp::Relu, &a),
            unary(&wide, UnaryOp::Relu, &a)
        );
        Ok(())
    }

    #[test]
    fn test_scalar_sides() {
        let device = CpuDevice::serial();
        assert_eq!(binary_scalar_rhs(&device, BinaryOp::Sub, &[5, 7], 2), vec![3, 5]);
        assert_eq!(binary_scalar_lhs(&device, BinaryOp::Sub, 10, &[5, 7]), vec![5, 3]);
    }

    #[test]
    fn test_map_parallel_matches_serial() -> Result<()> {
        let data: Vec<f64> = (0..1003).map(|i| i as f64 * 0.5).collect();
        let serial = map(&CpuDevice::serial(), &data, |x| x * 2.0 + 1.0);
        let parallel = map(&parallel_device(AccelPreference::Off)?, &data, |x| x * 2.0 + 1.0);
        assert_eq!(serial, parallel);
        assert_eq!(parallel[1002], 1003.0);

        let cast: Vec<i32> = map(&parallel_device(AccelPreference::Off)?, &data, |x| x as i32);
        assert_eq!(cast[3], 1);
        Ok(())
    }

    #[test]
    fn test_parallel_sum_wraps() -> Result<()> {
        let device = parallel_device(AccelPreference::Off)?;
        let data = vec![i32::MAX; 8];
        assert_eq!(reduce_all(&device, ReduceOp::Sum, &data)?, i32::MAX.wrapping_mul(8));
        Ok(())
    }

    #[test]
    fn test_reduce_all_parallel() -> Result<()> {
        let device = parallel_device(AccelPreference::Off)?;
        let data: Vec<i64> = (1..=1000).collect();
        assert_eq!(reduce_all(&device, ReduceOp::Sum, &data)?, 500_500);
        assert_eq!(reduce_all(&device, ReduceOp::Max, &data)?, 1000);
        assert_eq!(reduce_all(&device, ReduceOp::Min, &data)?, 1);
        let empty: [f32; 0] = [];
        assert_eq!(reduce_all(&device, ReduceOp::Sum, &empty)?, 0.0);
        assert!(matches!(
            reduce_all(&device, ReduceOp::Max, &empty),
            Err(Error::EmptyTensor { .. })
        ));
        Ok(())
    }

    #[test]
    fn test_reduce_axis() -> Result<()> {
        let device = parallel_device(AccelPreference::Off)?;
        // [2, 3, 4] summed over axis 0
        let data: Vec<i32> = (0..24).collect();
        let out = reduce_axis(&device, ReduceOp::Sum, &data, 1, 2, 12)?;
        assert_eq!(out, (0..12).map(|i| 2 * i + 12).collect::<Vec<_>>());
        // [2, 3] max over axis 1
        let out = reduce_axis(&device, ReduceOp::Max, &[1, 9, 3, 4, 2, 8], 2, 3, 1)?;
        assert_eq!(out, vec![9, 8]);
        Ok(())
    }

    #[test]
    fn test_softmax_rows_sum_to_one() -> Result<()> {
        let device = parallel_device(AccelPreference::Off)?;
        let data: Vec<f64> = (0..40).map(|i| (i % 7) as f64 * 100.0).collect();
        let out = softmax_rows(&device, &data, 4);
        for row in out.chunks(4) {
            let s: f64 = row.iter().sum();
            assert!((s - 1.0).abs() < 1e-12);
            assert!(row.iter().all(|v| v.is_finite()));
        }
        Ok(())
    }

    #[test]
    fn test_matmul_small() {
        let device = CpuDevice::serial();
        // [[1, 2], [3, 4]] @ [[5, 6], [7, 8]]
        let a = [1.0f32, 2.0, 3.0, 4.0];
        let b_t = [5.0f32, 7.0, 6.0, 8.0];
        assert_eq!(matmul(&device, &a, &b_t, 2, 2, 2), vec![19.0, 22.0, 43.0, 50.0]);
    }
}
