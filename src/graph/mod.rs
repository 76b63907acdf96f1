// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the “License”);
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an “AS IS” BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Lazy tensor graphs.
//!
//! A [`Graph`] is an append-only arena of [`GraphNode`]s addressed by
//! [`NodeId`]. Nodes are immutable once created and reference their operands
//! by index, so operands always have a smaller id than their consumers and
//! ascending id order is a valid topological order. Shapes are inferred and
//! validated when a node is created; a rejected operation leaves the graph
//! untouched.

mod data;

use std::fmt;

use crate::shapes::{self, Shape, ShapeError};

pub use data::{DataSlot, LeafHandle, TensorData};
pub(crate) use data::Storage;

/// Stable index of a node inside its [`Graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnaryOp {
    Exp,
    Log,
    Sin,
    Sqrt,
    Cast,
    Nop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    /// Equality test producing 1.0 or 0.0.
    Cmp,
    Max,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Sum,
    Max,
}

impl UnaryOp {
    pub fn name(self) -> &'static str {
        match self {
            UnaryOp::Exp => "exp",
            UnaryOp::Log => "log",
            UnaryOp::Sin => "sin",
            UnaryOp::Sqrt => "sqrt",
            UnaryOp::Cast => "cast",
            UnaryOp::Nop => "nop",
        }
    }
}

impl BinaryOp {
    pub fn name(self) -> &'static str {
        match self {
            BinaryOp::Add => "add",
            BinaryOp::Sub => "sub",
            BinaryOp::Mul => "mul",
            BinaryOp::Div => "div",
            BinaryOp::Pow => "pow",
            BinaryOp::Cmp => "cmp",
            BinaryOp::Max => "max",
        }
    }
}

impl ReduceOp {
    pub fn name(self) -> &'static str {
        match self {
            ReduceOp::Sum => "reduce_sum",
            ReduceOp::Max => "reduce_max",
        }
    }
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    /// Caller-supplied data that is never updated.
    Input(DataSlot),
    /// Caller-supplied data that training updates in place.
    Weight(DataSlot),
    /// Every element equals the value.
    Constant(f64),
    Unary {
        op: UnaryOp,
        x: NodeId,
    },
    Binary {
        op: BinaryOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    Reduce {
        op: ReduceOp,
        x: NodeId,
        axes: Vec<usize>,
        keep_dims: bool,
    },
    Reshape {
        x: NodeId,
    },
    Permute {
        x: NodeId,
        perm: Vec<usize>,
    },
    Matmul {
        lhs: NodeId,
        rhs: NodeId,
    },
}

impl NodeKind {
    pub fn operands(&self) -> Vec<NodeId> {
        match self {
            NodeKind::Input(_) | NodeKind::Weight(_) | NodeKind::Constant(_) => Vec::new(),
            NodeKind::Unary { x, .. }
            | NodeKind::Reduce { x, .. }
            | NodeKind::Reshape { x }
            | NodeKind::Permute { x, .. } => vec![*x],
            NodeKind::Binary { lhs, rhs, .. } | NodeKind::Matmul { lhs, rhs } => vec![*lhs, *rhs],
        }
    }

    pub fn is_leaf(&self) -> bool {
        matches!(self, NodeKind::Input(_) | NodeKind::Weight(_))
    }

    /// Data slot of an input or weight leaf.
    pub fn slot(&self) -> Option<&DataSlot> {
        match self {
            NodeKind::Input(slot) | NodeKind::Weight(slot) => Some(slot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GraphNode {
    pub kind: NodeKind,
    pub shape: Shape,
}

impl GraphNode {
    pub fn element_count(&self) -> usize {
        shapes::element_count(&self.shape)
    }
}

/// Construction errors. Raised synchronously while the graph is built.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("invalid shape for {op}: {source}")]
    Shape {
        op: &'static str,
        #[source]
        source: ShapeError,
    },
    #[error("node {0} does not exist in this graph")]
    UnknownNode(NodeId),
    #[error("node {0} is not an input or weight leaf")]
    NotALeaf(NodeId),
    #[error("storage for {node} holds {found} elements, expected {expected}")]
    SizeMismatch {
        node: NodeId,
        expected: usize,
        found: usize,
    },
}

fn shape_err(op: &'static str) -> impl FnOnce(ShapeError) -> GraphError {
    move |source| GraphError::Shape { op, source }
}

#[derive(Debug, Clone, Default)]
pub struct Graph {
    nodes: Vec<GraphNode>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> Result<&GraphNode, GraphError> {
        self.nodes.get(id.0).ok_or(GraphError::UnknownNode(id))
    }

    pub fn shape(&self, id: NodeId) -> Result<&[usize], GraphError> {
        Ok(&self.node(id)?.shape)
    }

    /// Node lookup for ids already validated by this crate.
    pub(crate) fn at(&self, id: NodeId) -> &GraphNode {
        &self.nodes[id.0]
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &GraphNode)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(idx, node)| (NodeId(idx), node))
    }

    /// Recover the handle of an input or weight leaf.
    pub fn leaf_handle(&self, id: NodeId) -> Result<LeafHandle, GraphError> {
        let node = self.node(id)?;
        let slot = node.kind.slot().ok_or(GraphError::NotALeaf(id))?;
        Ok(LeafHandle::new(id, slot.clone(), node.element_count()))
    }

    /// Flags every node the value of `root` depends on (including `root`).
    pub fn reachable_from(&self, root: NodeId) -> Result<Vec<bool>, GraphError> {
        self.node(root)?;
        let mut seen = vec![false; root.0 + 1];
        seen[root.0] = true;
        for idx in (0..=root.0).rev() {
            if !seen[idx] {
                continue;
            }
            for operand in self.nodes[idx].kind.operands() {
                seen[operand.0] = true;
            }
        }
        Ok(seen)
    }

    /// Weight leaves `root` depends on, in ascending id order.
    pub fn weights_of(&self, root: NodeId) -> Result<Vec<NodeId>, GraphError> {
        let seen = self.reachable_from(root)?;
        Ok(seen
            .iter()
            .enumerate()
            .filter(|(idx, hit)| **hit && matches!(self.nodes[*idx].kind, NodeKind::Weight(_)))
            .map(|(idx, _)| NodeId(idx))
            .collect())
    }

    fn push(&mut self, kind: NodeKind, shape: Shape) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(GraphNode { kind, shape });
        id
    }

    fn leaf(&mut self, shape: &[usize], weight: bool) -> Result<LeafHandle, GraphError> {
        let op = if weight { "weight" } else { "input" };
        shapes::validate_shape(shape).map_err(shape_err(op))?;
        let slot = DataSlot::default();
        let kind = if weight {
            NodeKind::Weight(slot.clone())
        } else {
            NodeKind::Input(slot.clone())
        };
        let id = self.push(kind, shape.to_vec());
        Ok(LeafHandle::new(id, slot, shapes::element_count(shape)))
    }

    pub fn input(&mut self, shape: &[usize]) -> Result<LeafHandle, GraphError> {
        self.leaf(shape, false)
    }

    pub fn weight(&mut self, shape: &[usize]) -> Result<LeafHandle, GraphError> {
        self.leaf(shape, true)
    }

    /// A rank-0 constant; broadcasts against any shape.
    pub fn constant(&mut self, value: f64) -> NodeId {
        self.push(NodeKind::Constant(value), Vec::new())
    }

    pub fn full(&mut self, shape: &[usize], value: f64) -> Result<NodeId, GraphError> {
        shapes::validate_shape(shape).map_err(shape_err("full"))?;
        Ok(self.push(NodeKind::Constant(value), shape.to_vec()))
    }

    pub fn unary(&mut self, op: UnaryOp, x: NodeId) -> Result<NodeId, GraphError> {
        let shape = self.shape(x)?.to_vec();
        Ok(self.push(NodeKind::Unary { op, x }, shape))
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: NodeId, rhs: NodeId) -> Result<NodeId, GraphError> {
        let shape = shapes::broadcast_shapes(self.shape(lhs)?, self.shape(rhs)?)
            .map_err(shape_err(op.name()))?;
        Ok(self.push(NodeKind::Binary { op, lhs, rhs }, shape))
    }

    pub fn reduce(
        &mut self,
        op: ReduceOp,
        x: NodeId,
        axes: &[usize],
        keep_dims: bool,
    ) -> Result<NodeId, GraphError> {
        let input = self.shape(x)?;
        let shape = shapes::reduce_shape(input, axes, keep_dims).map_err(shape_err(op.name()))?;
        let axes = shapes::normalize_axes(axes, input.len()).map_err(shape_err(op.name()))?;
        Ok(self.push(
            NodeKind::Reduce {
                op,
                x,
                axes,
                keep_dims,
            },
            shape,
        ))
    }

    pub fn matmul(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, GraphError> {
        let shape =
            shapes::matmul_shape(self.shape(lhs)?, self.shape(rhs)?).map_err(shape_err("matmul"))?;
        Ok(self.push(NodeKind::Matmul { lhs, rhs }, shape))
    }

    pub fn reshape(&mut self, x: NodeId, shape: &[usize]) -> Result<NodeId, GraphError> {
        let shape = shapes::reshape_shape(self.shape(x)?, shape).map_err(shape_err("reshape"))?;
        Ok(self.push(NodeKind::Reshape { x }, shape))
    }

    pub fn permute(&mut self, x: NodeId, perm: &[usize]) -> Result<NodeId, GraphError> {
        let shape = shapes::permute_shape(self.shape(x)?, perm).map_err(shape_err("permute"))?;
        Ok(self.push(
            NodeKind::Permute {
                x,
                perm: perm.to_vec(),
            },
            shape,
        ))
    }

    /// Swap the two axes of a matrix.
    pub fn transpose(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        let rank = self.shape(x)?.len();
        if rank != 2 {
            return Err(GraphError::Shape {
                op: "transpose",
                source: ShapeError::RankMismatch {
                    expected: "a rank-2 tensor".to_string(),
                    found: self.shape(x)?.to_vec(),
                },
            });
        }
        self.permute(x, &[1, 0])
    }

    pub fn exp(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        self.unary(UnaryOp::Exp, x)
    }

    pub fn log(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        self.unary(UnaryOp::Log, x)
    }

    pub fn sin(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        self.unary(UnaryOp::Sin, x)
    }

    pub fn sqrt(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        self.unary(UnaryOp::Sqrt, x)
    }

    pub fn cast(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        self.unary(UnaryOp::Cast, x)
    }

    pub fn nop(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        self.unary(UnaryOp::Nop, x)
    }

    pub fn add(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, GraphError> {
        self.binary(BinaryOp::Add, lhs, rhs)
    }

    pub fn sub(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, GraphError> {
        self.binary(BinaryOp::Sub, lhs, rhs)
    }

    pub fn mul(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, GraphError> {
        self.binary(BinaryOp::Mul, lhs, rhs)
    }

    pub fn div(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, GraphError> {
        self.binary(BinaryOp::Div, lhs, rhs)
    }

    pub fn pow(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, GraphError> {
        self.binary(BinaryOp::Pow, lhs, rhs)
    }

    pub fn cmp(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, GraphError> {
        self.binary(BinaryOp::Cmp, lhs, rhs)
    }

    pub fn max(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, GraphError> {
        self.binary(BinaryOp::Max, lhs, rhs)
    }

    /// Sum over `axes`, keeping reduced axes with extent 1.
    pub fn sum(&mut self, x: NodeId, axes: &[usize]) -> Result<NodeId, GraphError> {
        self.reduce(ReduceOp::Sum, x, axes, true)
    }

    /// Maximum over `axes`, keeping reduced axes with extent 1.
    pub fn max_reduce(&mut self, x: NodeId, axes: &[usize]) -> Result<NodeId, GraphError> {
        self.reduce(ReduceOp::Max, x, axes, true)
    }

    /// Sum of every element as a rank-0 tensor.
    pub fn sum_all(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        let rank = self.shape(x)?.len();
        if rank == 0 {
            return Ok(x);
        }
        let axes: Vec<usize> = (0..rank).collect();
        self.reduce(ReduceOp::Sum, x, &axes, false)
    }

    pub fn neg(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        let minus_one = self.constant(-1.0);
        self.mul(x, minus_one)
    }

    pub fn square(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        self.mul(x, x)
    }

    /// 1.0 where `lhs > rhs`, 0.0 elsewhere.
    pub fn gt(&mut self, lhs: NodeId, rhs: NodeId) -> Result<NodeId, GraphError> {
        // lhs > rhs  <=>  max(rhs, lhs) != rhs
        let larger = self.max(rhs, lhs)?;
        let not_greater = self.cmp(larger, rhs)?;
        let one = self.constant(1.0);
        self.sub(one, not_greater)
    }

    pub fn relu(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        let zero = self.constant(0.0);
        self.max(x, zero)
    }

    pub fn sigmoid(&mut self, x: NodeId) -> Result<NodeId, GraphError> {
        let one = self.constant(1.0);
        let neg = self.neg(x)?;
        let exp = self.exp(neg)?;
        let denom = self.add(one, exp)?;
        self.div(one, denom)
    }
}
