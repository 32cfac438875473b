// Loss Functions
//
// Both losses return a rank-0 Var so backward() can start from them.
//
// 1. MSE: mean((prediction - target)²), built from graph ops so its
//    gradient comes from the ordinary rules.
//
// 2. Softmax cross-entropy: -mean_rows(sum_classes(target * log(softmax(x)))).
//    Computed as one fused node. The forward pass uses log-sum-exp with the
//    row maximum subtracted; the gradient is (softmax - target) / N.

use tensile_core::{Element, Error, Result, Tensor};

use crate::graph::{Op, Var};

/// Mean squared error. Shapes must broadcast.
pub fn mse<'g, T: Element>(prediction: Var<'g, T>, target: Var<'g, T>) -> Result<Var<'g, T>> {
    let diff = prediction.sub(target)?;
    diff.mul(diff)?.mean()
}

/// Cross-entropy of row-wise softmax over `[n, c]` logits.
///
/// `labels` is either class indices (`[n]` or `[n, 1]`) or a target
/// distribution of the same shape as the logits (e.g. one-hot rows).
pub fn softmax_cross_entropy<'g, T: Element>(logits: Var<'g, T>, labels: &Tensor<T>) -> Result<Var<'g, T>> {
    let x = logits.value();
    if x.rank() != 2 {
        return Err(Error::DimensionMismatch {
            expected: 2,
            got: x.rank(),
        });
    }
    let (n, c) = (x.dims()[0], x.dims()[1]);
    if n == 0 {
        return Err(Error::EmptyTensor { op: "softmax_cross_entropy" });
    }
    let targets = if labels.shape() == x.shape() {
        labels.clone()
    } else {
        let one_hot = Tensor::one_hot(labels, c)?;
        if one_hot.dims()[0] != n {
            return Err(Error::shape_mismatch(n, labels.shape()));
        }
        one_hot
    };

    let logits_data = x.to_vec()?;
    let target_data = targets.to_vec()?;
    let mut total = 0.0;
    for (row, t) in logits_data.chunks(c).zip(target_data.chunks(c)) {
        let max = row.iter().map(|v| v.as_f64()).fold(f64::NEG_INFINITY, f64::max);
        let lse = max + row.iter().map(|v| (v.as_f64() - max).exp()).sum::<f64>().ln();
        total += row
            .iter()
            .zip(t)
            .map(|(v, w)| w.as_f64() * (lse - v.as_f64()))
            .sum::<f64>();
    }
    let loss = Tensor::scalar(T::from_f64(total / n as f64), x.device());
    let probs = x.softmax()?;

    Ok(logits
        .graph()
        .push(loss, Op::SoftmaxCrossEntropy { probs, targets }, vec![logits.id()]))
}
