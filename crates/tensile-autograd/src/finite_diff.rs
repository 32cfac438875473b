//! Finite difference utilities for gradient verification.
//!
//! Central differences `(f(x + eps) - f(x - eps)) / (2 * eps)`, used to
//! check the analytic gradients of the backward pass.

use tensile_core::{Error, Result, Tensor};

/// Derivative of a scalar function at `x`.
///
/// ```
/// use tensile_autograd::numeric_derivative;
///
/// let d = numeric_derivative(|x| x * 5.0, 4.0, 1e-6);
/// assert!((d - 5.0).abs() < 1e-4);
/// ```
pub fn numeric_derivative<F>(f: F, x: f64, eps: f64) -> f64
where
    F: Fn(f64) -> f64,
{
    (f(x + eps) - f(x - eps)) / (2.0 * eps)
}

/// Partial derivatives of `f` at `point`, one coordinate at a time.
pub fn finite_diff_grad<F>(f: F, point: &[f64], eps: f64) -> Vec<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let mut grads = Vec::with_capacity(point.len());
    let mut perturbed = point.to_vec();

    for i in 0..point.len() {
        perturbed[i] = point[i] + eps;
        let f_plus = f(&perturbed);

        perturbed[i] = point[i] - eps;
        let f_minus = f(&perturbed);

        perturbed[i] = point[i];
        grads.push((f_plus - f_minus) / (2.0 * eps));
    }

    grads
}

/// Gradient of a tensor-to-scalar function, in the tensor's logical order.
///
/// Each perturbed input is a fresh tensor of the same shape, so `f` may build
/// its own graph around it.
pub fn tensor_numeric_grad<F>(f: F, x: &Tensor<f64>, eps: f64) -> Result<Vec<f64>>
where
    F: Fn(&Tensor<f64>) -> Result<f64>,
{
    let base = x.to_vec()?;
    let mut grads = Vec::with_capacity(base.len());
    let mut perturbed = base.clone();

    for i in 0..base.len() {
        perturbed[i] = base[i] + eps;
        let f_plus = f(&Tensor::from_slice(&perturbed, x.shape(), x.device())?)?;

        perturbed[i] = base[i] - eps;
        let f_minus = f(&Tensor::from_slice(&perturbed, x.shape(), x.device())?)?;

        perturbed[i] = base[i];
        grads.push((f_plus - f_minus) / (2.0 * eps));
    }

    Ok(grads)
}

/// Largest absolute difference between two gradient vectors.
pub fn max_grad_error(grad1: &[f64], grad2: &[f64]) -> Result<f64> {
    if grad1.len() != grad2.len() {
        return Err(Error::shape_mismatch(grad1.len(), grad2.len()));
    }
    Ok(grad1
        .iter()
        .zip(grad2.iter())
        .map(|(a, b)| (a - b).abs())
        .fold(0.0, f64::max))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Graph;
    use tensile_core::CpuDevice;

    #[test]
    fn test_derivative_of_linear_function() {
        let d = numeric_derivative(|x| x * 5.0, 4.0, 1e-6);
        assert!((d - 5.0).abs() < 1e-4);
    }

    #[test]
    fn test_finite_diff_quadratic() {
        // f(x, y) = x^2 + 2xy + y^2, both partials are 2x + 2y
        let f = |v: &[f64]| v[0] * v[0] + 2.0 * v[0] * v[1] + v[1] * v[1];
        let grads = finite_diff_grad(f, &[1.0, 2.0], 1e-7);
        assert!((grads[0] - 6.0).abs() < 1e-5);
        assert!((grads[1] - 6.0).abs() < 1e-5);
    }

    #[test]
    fn test_max_grad_error() -> Result<()> {
        let err = max_grad_error(&[1.0, 2.0, 3.0], &[1.1, 2.0, 2.8])?;
        assert!((err - 0.2).abs() < 1e-10);
        assert!(max_grad_error(&[1.0], &[1.0, 2.0]).is_err());
        Ok(())
    }

    #[test]
    fn test_graph_gradients_match_numeric() -> Result<()> {
        // f(x) = sum(softmax(x) * w) exercises the softmax Jacobian product
        let d = CpuDevice::serial();
        let x0 = Tensor::<f64>::randn((3, 4), 5, &d);
        let w = Tensor::<f64>::randn((3, 4), 6, &d);

        let g = Graph::new();
        let x = g.variable(x0.copy()?);
        let wv = g.constant(w.clone());
        x.softmax()?.mul(wv)?.sum()?.backward()?;
        let analytic = x.grad().map(|t| t.to_vec()).transpose()?.unwrap_or_default();

        let numeric = tensor_numeric_grad(
            |t| {
                let soft = t.softmax()?.mul(&w)?;
                soft.sum(false)?.item()
            },
            &x0,
            1e-6,
        )?;
        assert!(max_grad_error(&analytic, &numeric)? < 1e-7);
        Ok(())
    }

    #[test]
    fn test_composite_expression_matches_numeric() -> Result<()> {
        // f(x) = sum(sigmoid(x) * exp(x) / (x^2 + 1)) on positive inputs
        let d = CpuDevice::serial();
        let x0 = Tensor::<f64>::rand_uniform((2, 3), 0.1, 2.0, 3, &d)?;
        let two = Tensor::<f64>::full((2, 3), 2.0, &d);

        let g = Graph::new();
        let x = g.variable(x0.copy()?);
        let c2 = g.constant(two.clone());
        let one = g.constant(Tensor::ones((2, 3), &d));
        let num = x.sigmoid()?.mul(x.exp()?)?;
        let den = x.pow(c2)?.add(one)?;
        num.div(den)?.sum()?.backward()?;
        let analytic = x.grad().map(|t| t.to_vec()).transpose()?.unwrap_or_default();

        let numeric = tensor_numeric_grad(
            |t| {
                let num = t.sigmoid()?.mul(&t.exp()?)?;
                let den = t.pow(&two)?.add_scalar(1.0)?;
                num.div(&den)?.sum(false)?.item()
            },
            &x0,
            1e-6,
        )?;
        assert!(max_grad_error(&analytic, &numeric)? < 1e-6);
        Ok(())
    }
}
