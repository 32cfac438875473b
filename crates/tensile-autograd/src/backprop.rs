// Backpropagation — reverse pass over a Graph
//
// HOW IT WORKS:
//
//   1. Depth-first post-order walk from the root over operand edges, each
//      node visited once. This yields every node the root depends on.
//
//   2. For each reachable node that requires a gradient, count how many
//      consumer edges point at it (c = a * a counts a twice).
//
//   3. Seed the root with ones of its shape and process nodes from a ready
//      list. A node becomes ready only when every consumer has delivered
//      its contribution, so its incoming gradient is complete (summed over
//      all uses) before its own rule runs.
//
//   4. Processing a node adds the pass gradient into its stored grad, then
//      applies the node's rule to hand contributions to its operands.
//
// Stored gradients accumulate across calls until zero_grad; only the
// pass-local gradient is pushed upstream.
//
// GRADIENT RULES (g = incoming gradient, out = node value):
//
//   Add:      g, g                      Sub:      g, -g
//   Mul:      g*b, g*a                  Div:      g/b, -g*a/b²
//   Pow:      g*b*a^(b-1), g*out*ln(a)
//   Matmul:   g @ Bᵗ, Aᵗ @ g
//   Sigmoid:  g*out*(1-out)             Relu:     g*[a > 0]
//   Ln:       g/a                       Exp:      g*out
//   Sum/Mean: g spread over the input (scaled by 1/N for means)
//   Softmax:  out*(g - rowsum(g*out))
//   Fused softmax cross-entropy: (probs - targets) * g / N
//
// Binary contributions are summed back down to each operand's shape
// ("unbroadcast") before delivery.

use std::collections::{HashMap, HashSet};

use tensile_core::{BinaryOp, Element, Error, Result, Shape, Tensor, UnaryOp};
use tracing::instrument;

use crate::graph::{Graph, Op, VarId};

/// Every node reachable from `root`, operands before consumers.
pub fn topo_order<T: Element>(graph: &Graph<T>, root: VarId) -> Vec<VarId> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    // explicit stack: (node, operands already expanded)
    let mut stack = vec![(root, false)];
    while let Some((id, expanded)) = stack.pop() {
        if expanded {
            order.push(id);
            continue;
        }
        if !visited.insert(id) {
            continue;
        }
        stack.push((id, true));
        for operand in graph.operands(id).into_iter().rev() {
            if !visited.contains(&operand) {
                stack.push((operand, false));
            }
        }
    }
    order
}

/// Populate gradients of every node `root` depends on.
#[instrument(skip(graph, root), fields(root = root.index()))]
pub fn backward<T: Element>(graph: &Graph<T>, root: VarId) -> Result<()> {
    if !graph.requires_grad(root) {
        tracing::debug!("root does not require a gradient, nothing to do");
        return Ok(());
    }
    let order = topo_order(graph, root);

    // consumer edges per node, counted over nodes that take part in the pass
    let mut pending: HashMap<VarId, usize> = HashMap::new();
    for &id in &order {
        if !graph.requires_grad(id) {
            continue;
        }
        for operand in graph.operands(id) {
            if graph.requires_grad(operand) {
                *pending.entry(operand).or_insert(0) += 1;
            }
        }
    }
    tracing::debug!(nodes = order.len(), "backward pass");

    let mut incoming: HashMap<VarId, Tensor<T>> = HashMap::new();
    incoming.insert(root, Tensor::ones_like(&graph.value(root)));
    let mut ready = vec![root];

    while let Some(id) = ready.pop() {
        let grad = incoming
            .remove(&id)
            .ok_or_else(|| Error::msg("backward: node became ready without a gradient"))?;
        graph.accumulate_grad(id, &grad)?;

        let operands = graph.operands(id);
        if operands.is_empty() {
            continue;
        }
        let contributions = local_grads(graph, id, &grad)?;
        for (operand, contribution) in operands.into_iter().zip(contributions) {
            if !graph.requires_grad(operand) {
                continue;
            }
            if let Some(c) = contribution {
                let total = match incoming.remove(&operand) {
                    Some(acc) => acc.add(&c)?,
                    None => c,
                };
                incoming.insert(operand, total);
            }
            if let Some(count) = pending.get_mut(&operand) {
                *count -= 1;
                if *count == 0 && incoming.contains_key(&operand) {
                    ready.push(operand);
                }
            }
        }
    }
    Ok(())
}

/// Gradient contribution for each operand of `id`, in operand order.
/// `None` means no contribution (the operand does not need one).
fn local_grads<T: Element>(graph: &Graph<T>, id: VarId, grad: &Tensor<T>) -> Result<Vec<Option<Tensor<T>>>> {
    let operands = graph.operands(id);
    let needs: Vec<bool> = operands.iter().map(|&o| graph.requires_grad(o)).collect();
    let inputs: Vec<Tensor<T>> = operands.iter().map(|&o| graph.value(o)).collect();
    let out = graph.value(id);

    match graph.op(id) {
        Op::Leaf => Ok(Vec::new()),
        Op::Binary(op) => compute_binary_grad(op, grad, &inputs[0], &inputs[1], &out, &needs),
        Op::Unary(op) => Ok(vec![Some(compute_unary_grad(op, grad, &inputs[0], &out)?)]),
        Op::Matmul => compute_matmul_grad(grad, &inputs[0], &inputs[1], &needs),
        Op::Sum => Ok(vec![Some(spread(grad, inputs[0].shape(), 1.0)?)]),
        Op::Mean => {
            let n = inputs[0].elem_count().max(1) as f64;
            Ok(vec![Some(spread(grad, inputs[0].shape(), 1.0 / n)?)])
        }
        Op::SumAxis { axis, keep_dims } => {
            Ok(vec![Some(compute_axis_grad(grad, &inputs[0], axis, keep_dims, 1.0)?)])
        }
        Op::MeanAxis { axis, keep_dims } => {
            let len = inputs[0].shape().dim(axis)?.max(1) as f64;
            Ok(vec![Some(compute_axis_grad(grad, &inputs[0], axis, keep_dims, 1.0 / len)?)])
        }
        Op::Reshape => Ok(vec![Some(grad.reshape(inputs[0].shape())?)]),
        Op::Transpose => Ok(vec![Some(grad.transpose())]),
        Op::Softmax => Ok(vec![Some(compute_softmax_grad(grad, &out)?)]),
        Op::Apply => Err(Error::NotImplemented("gradient of apply")),
        Op::SoftmaxCrossEntropy { probs, targets } => {
            let rows = probs.dims().first().copied().unwrap_or(1).max(1) as f64;
            let g = grad.item()?.as_f64() / rows;
            let delta = probs.sub(&targets)?;
            Ok(vec![Some(scale(&delta, g)?)])
        }
    }
}

// Gradient rules for binary operations

fn compute_binary_grad<T: Element>(
    op: BinaryOp,
    grad: &Tensor<T>,
    lhs: &Tensor<T>,
    rhs: &Tensor<T>,
    out: &Tensor<T>,
    needs: &[bool],
) -> Result<Vec<Option<Tensor<T>>>> {
    let (raw_lhs, raw_rhs) = match op {
        BinaryOp::Add => (grad.clone(), grad.clone()),
        BinaryOp::Sub => (grad.clone(), grad.neg()?),
        BinaryOp::Mul => (grad.mul(rhs)?, grad.mul(lhs)?),
        BinaryOp::Div => {
            // d(a/b)/db = -a / b²
            let b_sq = rhs.mul(rhs)?;
            (grad.div(rhs)?, grad.neg()?.mul(lhs)?.div(&b_sq)?)
        }
        BinaryOp::Pow => {
            let d_lhs = if needs[0] {
                let exponent = rhs.add_scalar(-T::one())?;
                grad.mul(rhs)?.mul(&lhs.pow(&exponent)?)?
            } else {
                grad.clone()
            };
            let d_rhs = if needs[1] {
                grad.mul(out)?.mul(&lhs.ln()?)?
            } else {
                grad.clone()
            };
            (d_lhs, d_rhs)
        }
    };
    let lhs_grad = if needs[0] {
        Some(unbroadcast(&raw_lhs, lhs.shape())?)
    } else {
        None
    };
    let rhs_grad = if needs[1] {
        Some(unbroadcast(&raw_rhs, rhs.shape())?)
    } else {
        None
    };
    Ok(vec![lhs_grad, rhs_grad])
}

/// Sum `grad` down to `target`, the pre-broadcast shape of an operand.
///
/// `[3, 4]` back to `[4]` sums axis 0 and drops it; `[3, 4]` back to
/// `[3, 1]` sums axis 1 and keeps it.
pub fn unbroadcast<T: Element>(grad: &Tensor<T>, target: &Shape) -> Result<Tensor<T>> {
    if grad.shape() == target {
        return Ok(grad.clone());
    }
    let padded = target.pad_to_rank(grad.rank());
    let mut result = grad.clone();
    for axis in padded.broadcast_axes(grad.shape()).into_iter().rev() {
        result = result.sum_along_axis(axis, true)?;
    }
    result.reshape(target)
}

// Gradient rules for unary operations

fn compute_unary_grad<T: Element>(op: UnaryOp, grad: &Tensor<T>, input: &Tensor<T>, out: &Tensor<T>) -> Result<Tensor<T>> {
    match op {
        UnaryOp::Neg => grad.neg(),
        UnaryOp::Sigmoid => {
            // out * (1 - out)
            let one_minus = out.neg()?.add_scalar(T::one())?;
            grad.mul(&out.mul(&one_minus)?)
        }
        UnaryOp::Relu => {
            let mask = input.apply(|x| if x > T::zero() { T::one() } else { T::zero() })?;
            grad.mul(&mask)
        }
        UnaryOp::Ln => grad.div(input),
        UnaryOp::Exp => grad.mul(out),
    }
}

// Gradient rules for matmul

/// C = A @ B where A:[m,k], B:[k,n]
///   grad_A = grad_C @ Bᵗ  →  [m,n] @ [n,k]
///   grad_B = Aᵗ @ grad_C  →  [k,m] @ [m,n]
fn compute_matmul_grad<T: Element>(
    grad: &Tensor<T>,
    lhs: &Tensor<T>,
    rhs: &Tensor<T>,
    needs: &[bool],
) -> Result<Vec<Option<Tensor<T>>>> {
    let grad_lhs = if needs[0] {
        Some(grad.matmul(&rhs.transpose())?)
    } else {
        None
    };
    let grad_rhs = if needs[1] {
        Some(lhs.transpose().matmul(grad)?)
    } else {
        None
    };
    Ok(vec![grad_lhs, grad_rhs])
}

// Gradient rules for reductions

/// Gradient of a full reduction: the single incoming value, scaled, over
/// every input position.
fn spread<T: Element>(grad: &Tensor<T>, shape: &Shape, factor: f64) -> Result<Tensor<T>> {
    let value = T::from_f64(grad.item()?.as_f64() * factor);
    Ok(Tensor::full(shape.clone(), value, grad.device()))
}

/// Gradient of an axis reduction: put the reduced axis back as size 1,
/// broadcast over it and scale.
fn compute_axis_grad<T: Element>(
    grad: &Tensor<T>,
    input: &Tensor<T>,
    axis: usize,
    keep_dims: bool,
    factor: f64,
) -> Result<Tensor<T>> {
    let kept = if keep_dims {
        grad.clone()
    } else {
        grad.unsqueeze(axis)?
    };
    let spread = kept.broadcast_to(input.shape())?;
    if factor == 1.0 {
        Ok(spread)
    } else {
        scale(&spread, factor)
    }
}

fn scale<T: Element>(t: &Tensor<T>, factor: f64) -> Result<Tensor<T>> {
    t.apply(move |x| T::from_f64(x.as_f64() * factor))
}

// Gradient rule for softmax

/// Row-wise Jacobian-vector product of softmax.
///
/// For one row with output s and incoming g, `J = diag(s) - s sᵗ`, so
/// `Jᵗ g = s ⊙ (g - Σ g_j s_j)`. Each row only needs its own dot product,
/// which `sum_along_axis(1, keep_dims)` provides for all rows at once.
fn compute_softmax_grad<T: Element>(grad: &Tensor<T>, out: &Tensor<T>) -> Result<Tensor<T>> {
    let dot = grad.mul(out)?.sum_along_axis(1, true)?;
    grad.sub(&dot)?.mul(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensile_core::CpuDevice;

    fn approx_eq(a: f64, b: f64, tol: f64) -> bool {
        (a - b).abs() < tol
    }

    fn assert_vec_approx(a: &[f64], b: &[f64], tol: f64) {
        assert_eq!(a.len(), b.len(), "length mismatch: {} vs {}", a.len(), b.len());
        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            assert!(approx_eq(*x, *y, tol), "index {}: {} vs {} (tol={})", i, x, y, tol);
        }
    }

    fn grad_vec(v: &crate::Var<'_, f64>) -> Vec<f64> {
        v.grad().map(|g| g.to_vec().unwrap_or_default()).unwrap_or_default()
    }

    fn scalar(g: &Graph<f64>, v: f64) -> crate::Var<'_, f64> {
        g.variable(Tensor::scalar(v, &CpuDevice::serial()))
    }

    #[test]
    fn test_add_and_mul() -> Result<()> {
        let g = Graph::new();
        let a = scalar(&g, 4.0);
        let b = scalar(&g, 5.0);
        a.add(b)?.backward()?;
        assert_eq!(grad_vec(&a), vec![1.0]);
        assert_eq!(grad_vec(&b), vec![1.0]);

        let g = Graph::new();
        let a = scalar(&g, 4.0);
        let b = scalar(&g, 5.0);
        a.mul(b)?.backward()?;
        assert_eq!(grad_vec(&a), vec![5.0]);
        assert_eq!(grad_vec(&b), vec![4.0]);
        Ok(())
    }

    #[test]
    fn test_sub_div_pow() -> Result<()> {
        let g = Graph::new();
        let a = scalar(&g, 4.0);
        let b = scalar(&g, 2.0);
        a.sub(b)?.backward()?;
        assert_eq!(grad_vec(&b), vec![-1.0]);

        let g = Graph::new();
        let a = scalar(&g, 4.0);
        let b = scalar(&g, 2.0);
        a.div(b)?.backward()?;
        assert_vec_approx(&grad_vec(&a), &[0.5], 1e-12);
        assert_vec_approx(&grad_vec(&b), &[-1.0], 1e-12);

        let g = Graph::new();
        let a = scalar(&g, 3.0);
        let b = scalar(&g, 2.0);
        a.pow(b)?.backward()?;
        assert_vec_approx(&grad_vec(&a), &[6.0], 1e-12);
        assert_vec_approx(&grad_vec(&b), &[9.0 * 3f64.ln()], 1e-12);
        Ok(())
    }

    #[test]
    fn test_shared_operand_accumulates() -> Result<()> {
        let g = Graph::new();
        let a = scalar(&g, 3.0);
        a.mul(a)?.backward()?;
        assert_eq!(grad_vec(&a), vec![6.0]);

        // diamond: y = (a*2) + (a*3), both branches must land before a runs
        let g = Graph::new();
        let d = CpuDevice::serial();
        let a = g.variable(Tensor::from_vec(vec![1.0, 2.0], 2, &d)?);
        let two = g.constant(Tensor::full(2, 2.0, &d));
        let three = g.constant(Tensor::full(2, 3.0, &d));
        let left = a.mul(two)?.exp()?.ln()?;
        let right = a.mul(three)?;
        left.add(right)?.sum()?.backward()?;
        assert_vec_approx(&grad_vec(&a), &[5.0, 5.0], 1e-12);
        assert!(two.grad().is_none());
        Ok(())
    }

    #[test]
    fn test_matmul() -> Result<()> {
        let d = CpuDevice::serial();
        let g = Graph::new();
        let a = g.variable(Tensor::<f64>::arange(5, &d).reshape((1, 5))?);
        let b = g.variable(Tensor::<f64>::arange(5, &d).reshape((5, 1))?);
        let c = a.matmul(b)?;
        assert_eq!(c.value().to_vec()?, vec![30.0]);
        c.backward()?;
        assert_eq!(grad_vec(&a), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(grad_vec(&b), vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(a.grad().map(|t| t.dims().to_vec()), Some(vec![1, 5]));
        Ok(())
    }

    #[test]
    fn test_unbroadcast() -> Result<()> {
        let d = CpuDevice::serial();
        let grad = Tensor::<f64>::arange(6, &d).reshape((2, 3))?;
        assert_eq!(unbroadcast(&grad, &Shape::from(3))?.to_vec()?, vec![3.0, 5.0, 7.0]);
        let col = unbroadcast(&grad, &Shape::from((2, 1)))?;
        assert_eq!(col.dims(), &[2, 1]);
        assert_eq!(col.to_vec()?, vec![3.0, 12.0]);
        assert_eq!(unbroadcast(&grad, &Shape::from(()))?.to_vec()?, vec![15.0]);
        Ok(())
    }

    #[test]
    fn test_broadcast_operand_grad() -> Result<()> {
        let d = CpuDevice::serial();
        let g = Graph::new();
        let x = g.variable(Tensor::<f64>::arange(6, &d).reshape((2, 3))?);
        let bias = g.variable(Tensor::from_vec(vec![1.0, 1.0, 1.0], 3, &d)?);
        x.mul(bias)?.sum()?.backward()?;
        assert_eq!(grad_vec(&bias), vec![3.0, 5.0, 7.0]);
        assert_eq!(grad_vec(&x), vec![1.0; 6]);
        Ok(())
    }

    #[test]
    fn test_unary_rules() -> Result<()> {
        let d = CpuDevice::serial();
        let g = Graph::new();
        let x = g.variable(Tensor::from_vec(vec![-1.0, 0.5, 2.0], 3, &d)?);
        x.relu()?.sum()?.backward()?;
        assert_eq!(grad_vec(&x), vec![0.0, 1.0, 1.0]);

        let g = Graph::new();
        let x = g.variable(Tensor::from_vec(vec![0.0, 1.0], 2, &d)?);
        x.sigmoid()?.sum()?.backward()?;
        let s1 = 1.0 / (1.0 + (-1.0f64).exp());
        assert_vec_approx(&grad_vec(&x), &[0.25, s1 * (1.0 - s1)], 1e-12);

        let g = Graph::new();
        let x = g.variable(Tensor::from_vec(vec![0.5, 2.0], 2, &d)?);
        x.ln()?.neg()?.sum()?.backward()?;
        assert_vec_approx(&grad_vec(&x), &[-2.0, -0.5], 1e-12);
        Ok(())
    }

    #[test]
    fn test_mean_and_axis_reductions() -> Result<()> {
        let d = CpuDevice::serial();
        let g = Graph::new();
        let x = g.variable(Tensor::<f64>::arange(6, &d).reshape((2, 3))?);
        x.mean()?.backward()?;
        assert_vec_approx(&grad_vec(&x), &[1.0 / 6.0; 6], 1e-12);

        let g = Graph::new();
        let x = g.variable(Tensor::<f64>::arange(6, &d).reshape((2, 3))?);
        let w = g.constant(Tensor::from_vec(vec![1.0, 10.0], 2, &d)?);
        x.mean_along_axis(1, false)?.mul(w)?.sum()?.backward()?;
        let third = 1.0 / 3.0;
        assert_vec_approx(
            &grad_vec(&x),
            &[third, third, third, 10.0 * third, 10.0 * third, 10.0 * third],
            1e-12,
        );

        let g = Graph::new();
        let x = g.variable(Tensor::<f64>::arange(6, &d).reshape((2, 3))?);
        x.sum_along_axis(0, true)?.sum()?.backward()?;
        assert_eq!(grad_vec(&x), vec![1.0; 6]);
        Ok(())
    }

    #[test]
    fn test_shape_ops() -> Result<()> {
        let d = CpuDevice::serial();
        let g = Graph::new();
        let x = g.variable(Tensor::<f64>::arange(6, &d).reshape((2, 3))?);
        let w = g.constant(Tensor::<f64>::arange(6, &d).reshape((3, 2))?);
        x.transpose()?.mul(w)?.reshape(6)?.sum()?.backward()?;
        // d/dx[i][j] = w[j][i]
        assert_eq!(grad_vec(&x), vec![0.0, 2.0, 4.0, 1.0, 3.0, 5.0]);
        assert_eq!(x.grad().map(|t| t.dims().to_vec()), Some(vec![2, 3]));
        Ok(())
    }

    #[test]
    fn test_softmax_rows_sum_has_zero_grad() -> Result<()> {
        // each softmax row sums to one, so the gradient of the total is 0
        let d = CpuDevice::serial();
        let g = Graph::new();
        let x = g.variable(Tensor::<f64>::randn((3, 4), 9, &d));
        x.softmax()?.sum()?.backward()?;
        assert_vec_approx(&grad_vec(&x), &[0.0; 12], 1e-12);
        Ok(())
    }

    #[test]
    fn test_apply_backward_not_implemented() -> Result<()> {
        let g = Graph::new();
        let x = scalar(&g, 1.0);
        let y = x.apply(|v| v * 2.0)?;
        assert_eq!(y.value().item()?, 2.0);
        assert!(matches!(y.backward(), Err(Error::NotImplemented(_))));
        Ok(())
    }

    #[test]
    fn test_constant_root_is_noop() -> Result<()> {
        let g = Graph::new();
        let c = g.constant(Tensor::scalar(2.0, &CpuDevice::serial()));
        c.exp()?.backward()?;
        assert!(c.grad().is_none());
        Ok(())
    }

    #[test]
    fn test_topo_order_operands_first() -> Result<()> {
        let g = Graph::new();
        let a = scalar(&g, 1.0);
        let b = scalar(&g, 2.0);
        let c = a.add(b)?;
        let e = c.mul(a)?;
        let order = topo_order(&g, e.id());
        assert_eq!(order.len(), 4);
        let pos = |v: VarId| order.iter().position(|&x| x == v);
        assert!(pos(a.id()) < pos(c.id()));
        assert!(pos(b.id()) < pos(c.id()));
        assert_eq!(order.last(), Some(&e.id()));
        Ok(())
    }
}
