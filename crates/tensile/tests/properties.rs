// Integration tests for the tensor engine and autodiff working together
//
// Each test pins one observable property end to end, through the facade
// crate and its prelude.

use std::sync::Arc;

use tensile::kernels::{Lanes16, ScalarKernels};
use tensile::prelude::*;
use tensile::serialize;
use tensile::{autograd, AccelPreference};

fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
    (a - b).abs() < tol
}

fn device() -> CpuDevice {
    CpuDevice::serial()
}

fn grad_of(v: &Var<'_, f64>) -> tensile::Result<Vec<f64>> {
    Ok(v.grad().map(|g| g.to_vec()).transpose()?.unwrap_or_default())
}

// Shapes and strides

#[test]
fn test_row_major_strides_and_counts() -> tensile::Result<()> {
    let d = device();
    for dims in [vec![5], vec![2, 3], vec![2, 3, 4], vec![3, 1, 2, 5]] {
        let t = Tensor::<f32>::zeros(dims.clone(), &d);
        assert_eq!(t.elem_count(), dims.iter().product::<usize>());
        assert_eq!(t.to_vec()?.len(), t.elem_count());
        let mut expected = vec![1; dims.len()];
        for i in (0..dims.len().saturating_sub(1)).rev() {
            expected[i] = expected[i + 1] * dims[i + 1];
        }
        assert_eq!(t.strides(), expected.as_slice());
    }
    Ok(())
}

#[test]
fn test_broadcast_literal() -> tensile::Result<()> {
    let d = device();
    let t = Tensor::<i32>::from_vec(vec![1, 2, 3], (3, 1, 1), &d)?;
    let b = t.broadcast_to((2, 3, 2, 3))?;
    let mut half = Vec::new();
    for v in [1, 2, 3] {
        half.extend([v; 6]);
    }
    let expected: Vec<i32> = half.iter().chain(half.iter()).copied().collect();
    assert_eq!(b.to_vec()?, expected);
    Ok(())
}

#[test]
fn test_transpose_then_index_equals_materialized() -> tensile::Result<()> {
    let d = device();
    for dims in [vec![4, 2], vec![2, 3, 4], vec![3, 1, 2, 2]] {
        let n = dims.iter().product();
        let t = Tensor::<f64>::arange(n, &d).reshape(dims)?.transpose();
        let m = t.contiguous()?;
        for i in 0..t.dims()[0] as isize {
            assert!(t.index(&[i])?.is_equal(&m.index(&[i])?)?);
        }
    }
    Ok(())
}

#[test]
fn test_squeeze_idempotent() -> tensile::Result<()> {
    let d = device();
    let t = Tensor::<f32>::ones(vec![1, 4, 1, 3, 1], &d);
    let once = t.squeeze();
    assert_eq!(once.dims(), &[4, 3]);
    assert_eq!(once.squeeze().dims(), once.dims());
    Ok(())
}

// Autodiff

#[test]
fn test_numeric_derivative_of_scaled_input() {
    let d = autograd::numeric_derivative(|x| x * 5.0, 4.0, 1e-6);
    assert!(approx_eq(d, 5.0, 1e-4));
}

#[test]
fn test_add_and_mul_grads() -> tensile::Result<()> {
    let d = device();
    let g = Graph::new();
    let a = g.variable(Tensor::scalar(4.0, &d));
    let b = g.variable(Tensor::scalar(5.0, &d));
    a.add(b)?.backward()?;
    assert_eq!(grad_of(&a)?, vec![1.0]);
    assert_eq!(grad_of(&b)?, vec![1.0]);

    let g = Graph::new();
    let a = g.variable(Tensor::scalar(4.0, &d));
    let b = g.variable(Tensor::scalar(5.0, &d));
    a.mul(b)?.backward()?;
    assert_eq!(grad_of(&a)?, vec![5.0]);
    assert_eq!(grad_of(&b)?, vec![4.0]);
    Ok(())
}

#[test]
fn test_matmul_value_and_grads() -> tensile::Result<()> {
    let d = CpuDevice::new(DeviceConfig::default().with_workers(2))?;
    let g = Graph::new();
    let a = g.variable(Tensor::<f64>::range(0.0, 5.0, 1.0, &d)?.reshape((1, 5))?);
    let b = g.variable(Tensor::<f64>::range(0.0, 5.0, 1.0, &d)?.reshape((5, 1))?);
    let c = a.matmul(b)?;
    assert_eq!(c.value().to_vec()?, vec![30.0]);
    c.backward()?;
    assert_eq!(grad_of(&a)?, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    assert_eq!(grad_of(&b)?, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
    Ok(())
}

#[test]
fn test_softmax_grad_matches_finite_difference() -> tensile::Result<()> {
    let d = device();
    let x0 = Tensor::<f64>::randn((4, 3), 21, &d);
    let target = Tensor::<f64>::randn((4, 3), 22, &d);

    let g = Graph::new();
    let x = g.variable(x0.copy()?);
    let t = g.constant(target.clone());
    mse(x.softmax()?, t)?.backward()?;
    let analytic = grad_of(&x)?;

    let numeric = autograd::tensor_numeric_grad(
        |v| {
            let diff = v.softmax()?.sub(&target)?;
            diff.mul(&diff)?.mean(false)?.item()
        },
        &x0,
        1e-6,
    )?;
    assert!(autograd::max_grad_error(&analytic, &numeric)? < 1e-7);
    Ok(())
}

#[test]
fn test_classifier_trains() -> tensile::Result<()> {
    // two separable blobs, one linear layer, fused cross-entropy
    let d = device();
    let xs = Tensor::<f64>::from_vec(
        vec![2.0, 2.1, 1.8, 2.2, 2.3, 1.9, -2.0, -1.9, -2.2, -2.1, -1.8, -2.3],
        (6, 2),
        &d,
    )?;
    let labels = Tensor::<f64>::from_vec(vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0], 6, &d)?;

    let mut graph = Graph::new();
    let w = graph.variable(Tensor::rand_uniform((2, 2), -0.1, 0.1, 1, &d)?).id();
    let b = graph.variable(Tensor::zeros(2, &d)).id();
    let params = [w, b];
    let mark = graph.len();
    let mut sgd = Sgd::new(0.5);

    for _ in 0..100 {
        {
            let x = graph.constant(xs.clone());
            let logits = x.matmul(graph.var(w)?)?.add(graph.var(b)?)?;
            softmax_cross_entropy(logits, &labels)?.backward()?;
        }
        sgd.step(&graph, &params)?;
        sgd.zero_grad(&graph, &params)?;
        graph.truncate(mark);
    }

    let logits = xs
        .matmul(&graph.var(w)?.value())?
        .add(&graph.var(b)?.value())?;
    let predicted = logits.argmax_along_axis(1, false)?.to_vec()?;
    assert_eq!(predicted, vec![0, 0, 0, 1, 1, 1]);
    Ok(())
}

// Serialization

#[test]
fn test_serialization_round_trip() -> tensile::Result<()> {
    let d = device();
    let t = Tensor::<f64>::randn((4, 3, 2), 99, &d);
    let back = serialize::decode::<f64>(&serialize::encode(&t)?, &d)?;
    assert_eq!(back.dims(), t.dims());
    assert_eq!(back.strides(), t.strides());
    assert_eq!(back.to_vec()?, t.to_vec()?);
    Ok(())
}

// Error discipline

#[test]
fn test_chain_surfaces_first_error_at_checkpoint() -> tensile::Result<()> {
    let d = device();
    let x = Tensor::<f32>::ones((2, 3), &d);
    let ok = x.chain().mul_scalar(2.0).sum_along_axis(0, false).check()?;
    assert_eq!(ok.to_vec()?, vec![4.0, 4.0, 4.0]);

    let bad = x
        .chain()
        .add(&Tensor::ones((5, 7), &d))
        .reshape(4)
        .softmax()
        .check();
    assert!(matches!(bad, Err(Error::ShapeMismatch { .. })));
    Ok(())
}

#[test]
fn test_structural_errors_fail_immediately() {
    let d = device();
    let x = Tensor::<f32>::ones((2, 3), &d);
    assert!(matches!(x.reshape(5), Err(Error::ShapeMismatch { .. })));
    assert!(matches!(x.index(&[2]), Err(Error::IndexOutOfBounds { .. })));
    let idx = Tensor::<f32>::zeros((2, 1, 1), &d);
    assert!(matches!(x.index_mask(&idx), Err(Error::DimensionMismatch { .. })));
}

// Devices

#[test]
fn test_results_identical_with_and_without_acceleration() -> tensile::Result<()> {
    let plain = CpuDevice::new(
        DeviceConfig::default()
            .with_workers(3)
            .with_accel(AccelPreference::Off)
            .with_par_threshold(16),
    )?;
    let fast = CpuDevice::new(
        DeviceConfig::default()
            .with_workers(3)
            .with_kernels(Arc::new(Lanes16::default()))
            .with_par_threshold(16),
    )?;
    let scalar_only = CpuDevice::new(DeviceConfig::default().with_kernels(Arc::new(ScalarKernels)))?;

    let a: Vec<f32> = (0..257).map(|i| (i as f32 * 0.13).sin()).collect();
    let b: Vec<f32> = (0..257).map(|i| 1.5 + (i as f32 * 0.07).cos()).collect();
    let mut outputs = Vec::new();
    for dev in [&plain, &fast, &scalar_only] {
        let x = Tensor::from_slice(&a, 257, dev)?;
        let y = Tensor::from_slice(&b, 257, dev)?;
        outputs.push((
            x.add(&y)?.to_vec()?,
            x.mul(&y)?.to_vec()?,
            x.div(&y)?.to_vec()?,
            x.neg()?.relu()?.to_vec()?,
        ));
    }
    assert_eq!(outputs[0], outputs[1]);
    assert_eq!(outputs[0], outputs[2]);
    Ok(())
}
