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

use std::collections::{HashMap, HashSet};

use crate::graph::{BinaryOp, DataSlot, Graph, GraphError, GraphNode, NodeId, NodeKind, ReduceOp};
use crate::ir::{verify_program, BufferId, FunctionBuilder, IrVerifyError, Program, ValueId};
use crate::shapes;

use super::index::{broadcast_index, linear_offset, permute_index, reshape_index, Index};

/// Errors raised while lowering a graph to a [`Program`].
#[derive(Debug, thiserror::Error)]
pub enum LowerError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// An in-place update whose value does not match the leaf's shape.
    #[error("cannot update {leaf} of shape {expected:?} with {value} of shape {found:?}")]
    UpdateShape {
        leaf: NodeId,
        value: NodeId,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
    #[error("lowered program is invalid: {0}")]
    Verify(#[from] IrVerifyError),
}

/// Lower the value of `root` into a fresh program whose output buffer holds
/// that value.
#[tracing::instrument(skip(graph, root), fields(root = %root))]
pub fn lower(graph: &Graph, root: NodeId) -> Result<Program, LowerError> {
    let mut builder = ProgramBuilder::new(graph);
    builder.output(root)?;
    let program = builder.finish()?;
    tracing::debug!(
        functions = program.functions.len(),
        buffers = program.buffers.len(),
        "graph lowered"
    );
    Ok(program)
}

/// Incrementally lowers graph nodes into one [`Program`].
///
/// Functions are appended in the order they are requested; any function a
/// request depends on is emitted first. Reductions and matmuls always get a
/// function of their own and are computed once per program, however many
/// consumers they have. Every other node is recomputed inline by each
/// function that reads it, unless it was explicitly materialized.
pub struct ProgramBuilder<'g> {
    graph: &'g Graph,
    program: Program,
    materialized: HashMap<NodeId, BufferId>,
}

struct FunctionContext {
    fb: FunctionBuilder,
    // Values computed in the currently open scopes, keyed by node and index.
    cache: HashMap<(NodeId, Vec<Index>), ValueId>,
}

impl FunctionContext {
    fn new(output_len: usize) -> Self {
        Self {
            fb: FunctionBuilder::new(output_len),
            cache: HashMap::new(),
        }
    }

    fn begin_loop(&mut self, range: usize, stride: usize) -> Index {
        Index::Var(self.fb.begin_loop(range, stride))
    }

    fn end_loop(&mut self) {
        self.fb.end_loop();
        self.cache.clear();
    }

    fn load(&mut self, buffer: BufferId, shape: &[usize], idx: &[Index]) -> ValueId {
        let input = self.fb.input(buffer);
        let offset = linear_offset(&mut self.fb, idx, shape);
        self.fb.load(input, offset)
    }
}

impl<'g> ProgramBuilder<'g> {
    pub fn new(graph: &'g Graph) -> Self {
        Self {
            graph,
            program: Program::new(),
            materialized: HashMap::new(),
        }
    }

    pub fn graph(&self) -> &'g Graph {
        self.graph
    }

    /// The program built so far.
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Buffer holding the value of `node`, emitting a function for it on
    /// first request. Leaves resolve to their external storage.
    pub fn materialize(&mut self, node: NodeId) -> Result<BufferId, LowerError> {
        let graph = self.graph;
        let entry = graph.node(node)?;
        if let Some(&buffer) = self.materialized.get(&node) {
            return Ok(buffer);
        }
        let buffer = match &entry.kind {
            NodeKind::Input(slot) | NodeKind::Weight(slot) => {
                self.leaf_buffer(node, slot, entry.element_count())
            }
            _ => self.emit_function(node)?,
        };
        self.materialized.insert(node, buffer);
        Ok(buffer)
    }

    /// Marks `node` as the program output. The output always lives in a
    /// scratch buffer, so a leaf output is copied.
    pub fn output(&mut self, node: NodeId) -> Result<BufferId, LowerError> {
        let graph = self.graph;
        let buffer = if graph.node(node)?.kind.is_leaf() {
            self.emit_function(node)?
        } else {
            self.materialize(node)?
        };
        self.program.output = Some(buffer);
        Ok(buffer)
    }

    /// Appends a function that overwrites the storage of `leaf` with the
    /// value of `value`.
    ///
    /// `value` may depend on `leaf`. Reads of `leaf` at the element being
    /// written come straight from its storage; when `value` reads any other
    /// element of `leaf` (through a reshape, permute or broadcast), the leaf
    /// is first copied into a scratch buffer and the update reads that copy.
    pub fn update_in_place(&mut self, leaf: NodeId, value: NodeId) -> Result<BufferId, LowerError> {
        let graph = self.graph;
        let target = graph.node(leaf)?;
        let slot = target.kind.slot().ok_or(GraphError::NotALeaf(leaf))?;
        let source = graph.node(value)?;
        if source.shape != target.shape {
            return Err(LowerError::UpdateShape {
                leaf,
                value,
                expected: target.shape.clone(),
                found: source.shape.clone(),
            });
        }
        let buffer = self.leaf_buffer(leaf, slot, target.element_count());
        let snapshot = if self.reads_other_elements(value, leaf) {
            Some(self.emit_function(leaf)?)
        } else {
            None
        };
        let previous = snapshot.and_then(|copy| self.materialized.insert(leaf, copy));

        let mut ctx = FunctionContext::new(target.element_count());
        let lowered = self.elementwise_body(&mut ctx, value, &target.shape, false);
        if snapshot.is_some() {
            match previous {
                Some(original) => self.materialized.insert(leaf, original),
                None => self.materialized.remove(&leaf),
            };
        }
        lowered?;

        self.program.push_function_into(ctx.fb, buffer);
        tracing::trace!(
            leaf = %leaf,
            value = %value,
            snapshot = snapshot.is_some(),
            "emitted in-place update"
        );
        Ok(buffer)
    }

    /// Verifies and returns the program.
    pub fn finish(self) -> Result<Program, LowerError> {
        verify_program(&self.program)?;
        Ok(self.program)
    }

    /// Whether lowering `value` inline reads `leaf` at an index other than
    /// the one the enclosing elementwise loop writes. Reductions, matmuls and
    /// materialized nodes are computed by earlier functions and stop the walk.
    fn reads_other_elements(&self, value: NodeId, leaf: NodeId) -> bool {
        let graph = self.graph;
        let mut seen = HashSet::new();
        let mut stack = vec![(value, true)];
        while let Some((id, aligned)) = stack.pop() {
            if !seen.insert((id, aligned)) {
                continue;
            }
            if id == leaf {
                if aligned {
                    continue;
                }
                return true;
            }
            if self.materialized.contains_key(&id) {
                continue;
            }
            let node = graph.at(id);
            match &node.kind {
                NodeKind::Unary { x, .. } => stack.push((*x, aligned)),
                NodeKind::Binary { lhs, rhs, .. } => {
                    for operand in [*lhs, *rhs] {
                        let same = graph.at(operand).shape == node.shape;
                        stack.push((operand, aligned && same));
                    }
                }
                NodeKind::Reshape { x } | NodeKind::Permute { x, .. } => stack.push((*x, false)),
                NodeKind::Input(_)
                | NodeKind::Weight(_)
                | NodeKind::Constant(_)
                | NodeKind::Reduce { .. }
                | NodeKind::Matmul { .. } => {}
            }
        }
        false
    }

    fn leaf_buffer(&mut self, node: NodeId, slot: &DataSlot, len: usize) -> BufferId {
        self.program.add_tensor_buffer(node, slot.clone(), len)
    }

    fn emit_function(&mut self, id: NodeId) -> Result<BufferId, LowerError> {
        let graph = self.graph;
        let node = graph.at(id);
        let mut ctx = FunctionContext::new(node.element_count());
        match &node.kind {
            NodeKind::Reduce {
                op,
                x,
                axes,
                keep_dims,
            } => self.reduce_body(&mut ctx, node, *op, *x, axes, *keep_dims)?,
            NodeKind::Matmul { lhs, rhs } => self.matmul_body(&mut ctx, node, *lhs, *rhs)?,
            _ => self.elementwise_body(&mut ctx, id, &node.shape, true)?,
        }
        let instructions = ctx.fb.instructions().len();
        let buffer = self.program.push_function(ctx.fb);
        tracing::trace!(
            node = %id,
            function = self.program.functions.len() - 1,
            instructions,
            "emitted function"
        );
        Ok(buffer)
    }

    fn elementwise_body(
        &mut self,
        ctx: &mut FunctionContext,
        id: NodeId,
        shape: &[usize],
        top: bool,
    ) -> Result<(), LowerError> {
        let strides = shapes::row_major_strides(shape);
        let idx: Vec<Index> = shape
            .iter()
            .zip(&strides)
            .map(|(&extent, &stride)| ctx.begin_loop(extent, stride))
            .collect();
        let value = self.value(ctx, id, &idx, top)?;
        let offset = linear_offset(&mut ctx.fb, &idx, shape);
        ctx.fb.store(offset, value);
        for _ in shape {
            ctx.end_loop();
        }
        Ok(())
    }

    fn reduce_body(
        &mut self,
        ctx: &mut FunctionContext,
        node: &GraphNode,
        op: ReduceOp,
        x: NodeId,
        axes: &[usize],
        keep_dims: bool,
    ) -> Result<(), LowerError> {
        let graph = self.graph;
        let input = &graph.at(x).shape;
        let out_strides = shapes::row_major_strides(&node.shape);

        let mut in_idx = vec![Index::Zero; input.len()];
        let mut out_idx = Vec::with_capacity(node.shape.len());
        let mut outer = 0;
        for (axis, &extent) in input.iter().enumerate() {
            if axes.contains(&axis) {
                if keep_dims {
                    out_idx.push(Index::Zero);
                }
                continue;
            }
            let var = ctx.begin_loop(extent, out_strides[out_idx.len()]);
            in_idx[axis] = var;
            out_idx.push(var);
            outer += 1;
        }

        let init = match op {
            ReduceOp::Sum => 0.0,
            ReduceOp::Max => f64::NEG_INFINITY,
        };
        let acc = ctx.fb.immediate(init);
        for &axis in axes {
            in_idx[axis] = ctx.begin_loop(input[axis], 0);
        }
        let value = self.value(ctx, x, &in_idx, false)?;
        ctx.fb.accumulate(op, acc, value);
        for _ in axes {
            ctx.end_loop();
        }

        let offset = linear_offset(&mut ctx.fb, &out_idx, &node.shape);
        ctx.fb.store(offset, acc);
        for _ in 0..outer {
            ctx.end_loop();
        }
        Ok(())
    }

    fn matmul_body(
        &mut self,
        ctx: &mut FunctionContext,
        node: &GraphNode,
        lhs: NodeId,
        rhs: NodeId,
    ) -> Result<(), LowerError> {
        let graph = self.graph;
        let lhs_shape = &graph.at(lhs).shape;
        let rhs_shape = &graph.at(rhs).shape;
        let (a, b) = shapes::promote_matmul_operands(lhs_shape, rhs_shape).map_err(|source| {
            GraphError::Shape {
                op: "matmul",
                source,
            }
        })?;
        let (m, k, n) = (a[0], a[1], b[1]);

        let i = ctx.begin_loop(m, n);
        let j = ctx.begin_loop(n, 1);
        let acc = ctx.fb.immediate(0.0);
        let p = ctx.begin_loop(k, 0);
        let a_idx = if lhs_shape.len() == 2 { vec![i, p] } else { vec![p] };
        let b_idx = if rhs_shape.len() == 2 { vec![p, j] } else { vec![p] };
        let av = self.value(ctx, lhs, &a_idx, false)?;
        let bv = self.value(ctx, rhs, &b_idx, false)?;
        let product = ctx.fb.binary(BinaryOp::Mul, av, bv);
        ctx.fb.accumulate(ReduceOp::Sum, acc, product);
        ctx.end_loop();

        let offset = linear_offset(&mut ctx.fb, &[i, j], &node.shape);
        ctx.fb.store(offset, acc);
        ctx.end_loop();
        ctx.end_loop();
        Ok(())
    }

    /// Emits the scalar value of `id` at `idx`. With `top` set, `id` is the
    /// node the current function computes and is never loaded from a buffer.
    fn value(
        &mut self,
        ctx: &mut FunctionContext,
        id: NodeId,
        idx: &[Index],
        top: bool,
    ) -> Result<ValueId, LowerError> {
        let key = (id, idx.to_vec());
        if let Some(&value) = ctx.cache.get(&key) {
            return Ok(value);
        }

        let graph = self.graph;
        let node = graph.at(id);
        let boundary = matches!(node.kind, NodeKind::Reduce { .. } | NodeKind::Matmul { .. })
            || (!top && self.materialized.contains_key(&id));

        let value = if boundary {
            let buffer = self.materialize(id)?;
            ctx.load(buffer, &node.shape, idx)
        } else {
            match &node.kind {
                NodeKind::Input(slot) | NodeKind::Weight(slot) => {
                    let buffer = self.leaf_buffer(id, slot, node.element_count());
                    ctx.load(buffer, &node.shape, idx)
                }
                NodeKind::Constant(value) => ctx.fb.immediate(*value),
                NodeKind::Unary { op, x } => {
                    let x = self.value(ctx, *x, idx, false)?;
                    ctx.fb.unary(*op, x)
                }
                NodeKind::Binary { op, lhs, rhs } => {
                    let lhs_idx = broadcast_index(idx, &graph.at(*lhs).shape);
                    let rhs_idx = broadcast_index(idx, &graph.at(*rhs).shape);
                    let lhs = self.value(ctx, *lhs, &lhs_idx, false)?;
                    let rhs = self.value(ctx, *rhs, &rhs_idx, false)?;
                    ctx.fb.binary(*op, lhs, rhs)
                }
                NodeKind::Reshape { x } => {
                    let x_idx = reshape_index(&mut ctx.fb, idx, &node.shape, &graph.at(*x).shape);
                    self.value(ctx, *x, &x_idx, false)?
                }
                NodeKind::Permute { x, perm } => {
                    let x_idx = permute_index(idx, perm);
                    self.value(ctx, *x, &x_idx, false)?
                }
                NodeKind::Reduce { .. } | NodeKind::Matmul { .. } => {
                    let buffer = self.materialize(id)?;
                    ctx.load(buffer, &node.shape, idx)
                }
            }
        };
        ctx.cache.insert(key, value);
        Ok(value)
    }
}
