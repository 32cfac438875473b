// Graph — arena of autodiff nodes
//
// Every differentiable value lives in a Graph as a Node: its forward value,
// its accumulated gradient, the Op that produced it and the ids of its
// operands. Edges only point from a node to its operands, by index, so the
// structure has no reference cycles and is freed in one piece.
//
// Example: c = a * b
//   node 0  a   Op::Leaf
//   node 1  b   Op::Leaf
//   node 2  c   Op::Binary(Mul)   operands [0, 1]
//
// User code holds Var handles: a graph reference plus a VarId. A Var is
// Copy, so building expressions never fights the borrow checker. Because
// every Var borrows the Graph, `truncate` (which needs `&mut Graph`) can
// only run once all handles are gone; VarIds kept across iterations (e.g.
// parameters) are turned back into Vars with `Graph::var`.

use std::cell::RefCell;
use std::fmt;

use tensile_core::{BinaryOp, Element, Error, Result, Shape, Tensor, UnaryOp};

use crate::backprop;

/// Index of a node inside its [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VarId(pub(crate) usize);

impl VarId {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// How a node's value was computed. `backprop` matches on this to pick the
/// local gradient rule.
#[derive(Debug, Clone)]
pub enum Op<T: Element> {
    /// Created from data: a variable or a constant.
    Leaf,
    Binary(BinaryOp),
    Unary(UnaryOp),
    Matmul,
    /// Sum of every element, shape `[]`.
    Sum,
    /// Mean of every element, shape `[]`.
    Mean,
    SumAxis { axis: usize, keep_dims: bool },
    MeanAxis { axis: usize, keep_dims: bool },
    Reshape,
    Transpose,
    /// Row-wise softmax of a 2-D tensor.
    Softmax,
    /// User function; forward only.
    Apply,
    /// Fused softmax + cross-entropy over `[n, c]` logits.
    SoftmaxCrossEntropy { probs: Tensor<T>, targets: Tensor<T> },
}

impl<T: Element> Op<T> {
    pub fn name(&self) -> &'static str {
        match self {
            Op::Leaf => "leaf",
            Op::Binary(BinaryOp::Add) => "add",
            Op::Binary(BinaryOp::Sub) => "sub",
            Op::Binary(BinaryOp::Mul) => "mul",
            Op::Binary(BinaryOp::Div) => "div",
            Op::Binary(BinaryOp::Pow) => "pow",
            Op::Unary(UnaryOp::Neg) => "neg",
            Op::Unary(UnaryOp::Sigmoid) => "sigmoid",
            Op::Unary(UnaryOp::Relu) => "relu",
            Op::Unary(UnaryOp::Ln) => "ln",
            Op::Unary(UnaryOp::Exp) => "exp",
            Op::Matmul => "matmul",
            Op::Sum => "sum",
            Op::Mean => "mean",
            Op::SumAxis { .. } => "sum_along_axis",
            Op::MeanAxis { .. } => "mean_along_axis",
            Op::Reshape => "reshape",
            Op::Transpose => "transpose",
            Op::Softmax => "softmax",
            Op::Apply => "apply",
            Op::SoftmaxCrossEntropy { .. } => "softmax_cross_entropy",
        }
    }
}

/// One vertex of the graph.
#[derive(Debug, Clone)]
pub struct Node<T: Element> {
    pub(crate) value: Tensor<T>,
    pub(crate) grad: Option<Tensor<T>>,
    pub(crate) requires_grad: bool,
    pub(crate) op: Op<T>,
    pub(crate) operands: Vec<VarId>,
    pub(crate) alias: Option<String>,
}

/// Arena owning every node of one computation.
///
/// ```ignore
/// let graph = Graph::new();
/// let a = graph.variable(Tensor::scalar(4.0, &device));
/// let b = graph.variable(Tensor::scalar(5.0, &device));
/// a.mul(b)?.backward()?;
/// assert_eq!(a.grad().unwrap().item()?, 5.0);
/// ```
pub struct Graph<T: Element> {
    nodes: RefCell<Vec<Node<T>>>,
}

impl<T: Element> Default for Graph<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Element> fmt::Debug for Graph<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Graph(nodes={})", self.len())
    }
}

impl<T: Element> Graph<T> {
    pub fn new() -> Self {
        Graph {
            nodes: RefCell::new(Vec::new()),
        }
    }

    /// Leaf that receives a gradient.
    pub fn variable(&self, value: Tensor<T>) -> Var<'_, T> {
        self.leaf(value, true)
    }

    /// Leaf that never receives a gradient.
    pub fn constant(&self, value: Tensor<T>) -> Var<'_, T> {
        self.leaf(value, false)
    }

    fn leaf(&self, value: Tensor<T>, requires_grad: bool) -> Var<'_, T> {
        let id = self.insert(Node {
            value,
            grad: None,
            requires_grad,
            op: Op::Leaf,
            operands: Vec::new(),
            alias: None,
        });
        Var { graph: self, id }
    }

    /// Record the result of an operation. It requires a gradient when any
    /// operand does.
    pub(crate) fn push(&self, value: Tensor<T>, op: Op<T>, operands: Vec<VarId>) -> Var<'_, T> {
        let requires_grad = operands.iter().any(|&id| self.requires_grad(id));
        let id = self.insert(Node {
            value,
            grad: None,
            requires_grad,
            op,
            operands,
            alias: None,
        });
        Var { graph: self, id }
    }

    fn insert(&self, node: Node<T>) -> VarId {
        let mut nodes = self.nodes.borrow_mut();
        nodes.push(node);
        VarId(nodes.len() - 1)
    }

    /// Handle for a node created earlier.
    pub fn var(&self, id: VarId) -> Result<Var<'_, T>> {
        if id.0 >= self.len() {
            return Err(Error::msg(format!(
                "no node {} in a graph of {} nodes",
                id.0,
                self.len()
            )));
        }
        Ok(Var { graph: self, id })
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every node created after `mark` (a previous `len()`).
    ///
    /// Nodes below the mark keep their values and gradients, so parameters
    /// created first survive while per-iteration expressions are released.
    pub fn truncate(&mut self, mark: usize) {
        let nodes = self.nodes.get_mut();
        if mark < nodes.len() {
            tracing::trace!(from = nodes.len(), to = mark, "truncating graph");
            nodes.truncate(mark);
        }
    }

    /// Reset the gradient of every node to zeros.
    pub fn zero_grad(&self) {
        for node in self.nodes.borrow_mut().iter_mut() {
            node.grad = Some(Tensor::zeros_like(&node.value));
        }
    }

    // Node access for the backward pass and Var

    pub(crate) fn with_node<R>(&self, id: VarId, f: impl FnOnce(&Node<T>) -> R) -> R {
        f(&self.nodes.borrow()[id.0])
    }

    pub(crate) fn with_node_mut<R>(&self, id: VarId, f: impl FnOnce(&mut Node<T>) -> R) -> R {
        f(&mut self.nodes.borrow_mut()[id.0])
    }

    pub(crate) fn value(&self, id: VarId) -> Tensor<T> {
        self.with_node(id, |n| n.value.clone())
    }

    pub(crate) fn requires_grad(&self, id: VarId) -> bool {
        self.with_node(id, |n| n.requires_grad)
    }

    pub(crate) fn operands(&self, id: VarId) -> Vec<VarId> {
        self.with_node(id, |n| n.operands.clone())
    }

    pub(crate) fn op(&self, id: VarId) -> Op<T> {
        self.with_node(id, |n| n.op.clone())
    }

    /// Add `delta` into the stored gradient of `id`.
    pub(crate) fn accumulate_grad(&self, id: VarId, delta: &Tensor<T>) -> Result<()> {
        let existing = self.with_node(id, |n| n.grad.clone());
        let total = match existing {
            Some(g) => g.add(delta)?,
            None => delta.copy()?,
        };
        self.with_node_mut(id, |n| n.grad = Some(total));
        Ok(())
    }
}

/// Handle to a node of a [`Graph`].
#[derive(Clone, Copy)]
pub struct Var<'g, T: Element> {
    graph: &'g Graph<T>,
    id: VarId,
}

impl<T: Element> fmt::Debug for Var<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (op, shape, alias) = self
            .graph
            .with_node(self.id, |n| (n.op.name(), n.value.shape().clone(), n.alias.clone()));
        write!(f, "Var(id={}, op={}, shape={}", self.id.0, op, shape)?;
        if let Some(alias) = alias {
            write!(f, ", alias={alias}")?;
        }
        write!(f, ")")
    }
}

impl<'g, T: Element> Var<'g, T> {
    pub fn id(&self) -> VarId {
        self.id
    }

    pub fn graph(&self) -> &'g Graph<T> {
        self.graph
    }

    /// The forward value. Shares its buffer with the node, so in-place
    /// writes (optimizer steps) are seen by later reads.
    pub fn value(&self) -> Tensor<T> {
        self.graph.value(self.id)
    }

    /// Accumulated gradient, or `None` before the first backward pass.
    pub fn grad(&self) -> Option<Tensor<T>> {
        self.graph.with_node(self.id, |n| n.grad.clone())
    }

    pub fn requires_grad(&self) -> bool {
        self.graph.requires_grad(self.id)
    }

    pub fn op_name(&self) -> &'static str {
        self.graph.with_node(self.id, |n| n.op.name())
    }

    /// Attach a human-readable name, shown in Debug output and logs.
    pub fn with_alias(self, alias: impl Into<String>) -> Self {
        let alias = alias.into();
        self.graph.with_node_mut(self.id, |n| n.alias = Some(alias));
        self
    }

    pub fn alias(&self) -> Option<String> {
        self.graph.with_node(self.id, |n| n.alias.clone())
    }

    pub fn zero_grad(&self) {
        self.graph.with_node_mut(self.id, |n| {
            n.grad = Some(Tensor::zeros_like(&n.value));
        });
    }

    /// Reverse pass from this node; see [`backprop::backward`].
    pub fn backward(&self) -> Result<()> {
        backprop::backward(self.graph, self.id)
    }

    fn check_graph(&self, rhs: &Var<'g, T>) -> Result<()> {
        if std::ptr::eq(self.graph, rhs.graph) {
            Ok(())
        } else {
            Err(Error::msg("operands belong to different graphs"))
        }
    }

    fn record(&self, value: Tensor<T>, op: Op<T>) -> Var<'g, T> {
        self.graph.push(value, op, vec![self.id])
    }

    // Binary

    pub fn binary(&self, op: BinaryOp, rhs: Var<'g, T>) -> Result<Var<'g, T>> {
        self.check_graph(&rhs)?;
        let value = self.value().binary(op, &rhs.value())?;
        Ok(self.graph.push(value, Op::Binary(op), vec![self.id, rhs.id]))
    }

    pub fn add(&self, rhs: Var<'g, T>) -> Result<Var<'g, T>> {
        self.binary(BinaryOp::Add, rhs)
    }

    pub fn sub(&self, rhs: Var<'g, T>) -> Result<Var<'g, T>> {
        self.binary(BinaryOp::Sub, rhs)
    }

    pub fn mul(&self, rhs: Var<'g, T>) -> Result<Var<'g, T>> {
        self.binary(BinaryOp::Mul, rhs)
    }

    pub fn div(&self, rhs: Var<'g, T>) -> Result<Var<'g, T>> {
        self.binary(BinaryOp::Div, rhs)
    }

    pub fn pow(&self, rhs: Var<'g, T>) -> Result<Var<'g, T>> {
        self.binary(BinaryOp::Pow, rhs)
    }

    pub fn matmul(&self, rhs: Var<'g, T>) -> Result<Var<'g, T>> {
        self.check_graph(&rhs)?;
        let value = self.value().matmul(&rhs.value())?;
        Ok(self.graph.push(value, Op::Matmul, vec![self.id, rhs.id]))
    }

    // Unary

    pub fn unary(&self, op: UnaryOp) -> Result<Var<'g, T>> {
        let value = self.value().unary(op)?;
        Ok(self.record(value, Op::Unary(op)))
    }

    pub fn neg(&self) -> Result<Var<'g, T>> {
        self.unary(UnaryOp::Neg)
    }

    pub fn sigmoid(&self) -> Result<Var<'g, T>> {
        self.unary(UnaryOp::Sigmoid)
    }

    pub fn relu(&self) -> Result<Var<'g, T>> {
        self.unary(UnaryOp::Relu)
    }

    pub fn ln(&self) -> Result<Var<'g, T>> {
        self.unary(UnaryOp::Ln)
    }

    pub fn exp(&self) -> Result<Var<'g, T>> {
        self.unary(UnaryOp::Exp)
    }

    /// Elementwise user function. Differentiating through it fails with
    /// `NotImplemented`.
    pub fn apply<F>(&self, f: F) -> Result<Var<'g, T>>
    where
        F: Fn(T) -> T + Sync + Send,
    {
        let value = self.value().apply(f)?;
        Ok(self.record(value, Op::Apply))
    }

    // Reductions and shape

    pub fn sum(&self) -> Result<Var<'g, T>> {
        let value = self.value().sum(false)?;
        Ok(self.record(value, Op::Sum))
    }

    pub fn mean(&self) -> Result<Var<'g, T>> {
        let value = self.value().mean(false)?;
        Ok(self.record(value, Op::Mean))
    }

    pub fn sum_along_axis(&self, axis: usize, keep_dims: bool) -> Result<Var<'g, T>> {
        let value = self.value().sum_along_axis(axis, keep_dims)?;
        Ok(self.record(value, Op::SumAxis { axis, keep_dims }))
    }

    pub fn mean_along_axis(&self, axis: usize, keep_dims: bool) -> Result<Var<'g, T>> {
        let value = self.value().mean_along_axis(axis, keep_dims)?;
        Ok(self.record(value, Op::MeanAxis { axis, keep_dims }))
    }

    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Var<'g, T>> {
        let value = self.value().reshape(shape)?;
        Ok(self.record(value, Op::Reshape))
    }

    pub fn transpose(&self) -> Result<Var<'g, T>> {
        let value = self.value().transpose();
        Ok(self.record(value, Op::Transpose))
    }

    pub fn softmax(&self) -> Result<Var<'g, T>> {
        let value = self.value().softmax()?;
        Ok(self.record(value, Op::Softmax))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensile_core::CpuDevice;

    #[test]
    fn test_requires_grad_propagates() -> Result<()> {
        let d = CpuDevice::serial();
        let g = Graph::<f64>::new();
        let x = g.variable(Tensor::ones(3, &d));
        let c = g.constant(Tensor::ones(3, &d));
        let k = g.constant(Tensor::ones(3, &d));
        assert!(x.add(c)?.requires_grad());
        assert!(!c.mul(k)?.requires_grad());
        assert_eq!(g.len(), 5);
        Ok(())
    }

    #[test]
    fn test_alias_and_debug() -> Result<()> {
        let d = CpuDevice::serial();
        let g = Graph::<f32>::new();
        let w = g.variable(Tensor::zeros((2, 3), &d)).with_alias("w");
        assert_eq!(w.alias().as_deref(), Some("w"));
        let s = format!("{:?}", w.relu()?);
        assert!(s.contains("op=relu"), "{s}");
        assert!(format!("{w:?}").contains("alias=w"));
        Ok(())
    }

    #[test]
    fn test_value_shares_buffer() -> Result<()> {
        let d = CpuDevice::serial();
        let g = Graph::<i64>::new();
        let x = g.variable(Tensor::zeros(2, &d));
        x.value().fill(3)?;
        assert_eq!(x.value().to_vec()?, vec![3, 3]);
        Ok(())
    }

    #[test]
    fn test_var_lookup_and_truncate() -> Result<()> {
        let d = CpuDevice::serial();
        let mut g = Graph::<f64>::new();
        let w_id = g.variable(Tensor::ones(2, &d)).id();
        let mark = g.len();
        {
            let w = g.var(w_id)?;
            w.exp()?.sum()?;
        }
        assert_eq!(g.len(), 3);
        g.truncate(mark);
        assert_eq!(g.len(), 1);
        assert!(g.var(w_id).is_ok());
        assert!(g.var(VarId(1)).is_err());
        Ok(())
    }

    #[test]
    fn test_operands_from_other_graph_rejected() {
        let d = CpuDevice::serial();
        let g1 = Graph::<f32>::new();
        let g2 = Graph::<f32>::new();
        let a = g1.variable(Tensor::ones(1, &d));
        let b = g2.variable(Tensor::ones(1, &d));
        assert!(a.add(b).is_err());
    }
}
