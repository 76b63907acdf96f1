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

use std::f64::consts::FRAC_PI_2;

use crate::graph::{BinaryOp, GraphError, GraphNode, NodeId, NodeKind, ReduceOp, UnaryOp};
use crate::shapes;

use super::engine::{AutodiffError, GradientOps};

pub(super) fn apply_rule(
    ops: &mut impl GradientOps,
    id: NodeId,
    node: &GraphNode,
    upstream: NodeId,
) -> Result<(), AutodiffError> {
    match &node.kind {
        NodeKind::Input(_) | NodeKind::Weight(_) | NodeKind::Constant(_) => Ok(()),
        NodeKind::Unary { op, x } => unary_rule(ops, id, *op, *x, upstream),
        NodeKind::Binary { op, lhs, rhs } => binary_rule(ops, id, *op, *lhs, *rhs, upstream),
        NodeKind::Reduce {
            op,
            x,
            axes,
            keep_dims,
        } => reduce_rule(ops, id, *op, *x, axes, *keep_dims, upstream),
        NodeKind::Reshape { x } => {
            let shape = ops.graph().at(*x).shape.clone();
            let dx = ops.graph().reshape(upstream, &shape)?;
            ops.add_grad(*x, dx)
        }
        NodeKind::Permute { x, perm } => {
            let inverse = shapes::inverse_permutation(perm);
            let dx = ops.graph().permute(upstream, &inverse)?;
            ops.add_grad(*x, dx)
        }
        NodeKind::Matmul { lhs, rhs } => matmul_rule(ops, *lhs, *rhs, upstream),
    }
}

fn unary_rule(
    ops: &mut impl GradientOps,
    id: NodeId,
    op: UnaryOp,
    x: NodeId,
    upstream: NodeId,
) -> Result<(), AutodiffError> {
    if !ops.needs_grad(x) {
        return Ok(());
    }
    let graph = ops.graph();
    let dx = match op {
        UnaryOp::Exp => graph.mul(upstream, id)?,
        UnaryOp::Log => graph.div(upstream, x)?,
        UnaryOp::Sin => {
            // cos(x) = sin(x + pi/2)
            let shift = graph.constant(FRAC_PI_2);
            let shifted = graph.add(x, shift)?;
            let cos = graph.sin(shifted)?;
            graph.mul(upstream, cos)?
        }
        UnaryOp::Sqrt => {
            let half = graph.constant(0.5);
            let scale = graph.div(half, id)?;
            graph.mul(upstream, scale)?
        }
        UnaryOp::Cast | UnaryOp::Nop => upstream,
    };
    ops.add_grad(x, dx)
}

fn binary_rule(
    ops: &mut impl GradientOps,
    id: NodeId,
    op: BinaryOp,
    lhs: NodeId,
    rhs: NodeId,
    upstream: NodeId,
) -> Result<(), AutodiffError> {
    let want_lhs = ops.needs_grad(lhs);
    let want_rhs = ops.needs_grad(rhs);
    match op {
        BinaryOp::Add => {
            ops.add_grad(lhs, upstream)?;
            ops.add_grad(rhs, upstream)?;
        }
        BinaryOp::Sub => {
            ops.add_grad(lhs, upstream)?;
            if want_rhs {
                let drhs = ops.graph().neg(upstream)?;
                ops.add_grad(rhs, drhs)?;
            }
        }
        BinaryOp::Mul => {
            if want_lhs {
                let dlhs = ops.graph().mul(upstream, rhs)?;
                ops.add_grad(lhs, dlhs)?;
            }
            if want_rhs {
                let drhs = ops.graph().mul(upstream, lhs)?;
                ops.add_grad(rhs, drhs)?;
            }
        }
        BinaryOp::Div => {
            if want_lhs {
                let dlhs = ops.graph().div(upstream, rhs)?;
                ops.add_grad(lhs, dlhs)?;
            }
            if want_rhs {
                let graph = ops.graph();
                let num = graph.mul(upstream, lhs)?;
                let den = graph.mul(rhs, rhs)?;
                let quot = graph.div(num, den)?;
                let drhs = graph.neg(quot)?;
                ops.add_grad(rhs, drhs)?;
            }
        }
        BinaryOp::Pow => {
            if want_lhs {
                let graph = ops.graph();
                let one = graph.constant(1.0);
                let exponent = graph.sub(rhs, one)?;
                let lowered = graph.pow(lhs, exponent)?;
                let scale = graph.mul(rhs, lowered)?;
                let dlhs = graph.mul(upstream, scale)?;
                ops.add_grad(lhs, dlhs)?;
            }
            if want_rhs {
                let graph = ops.graph();
                let ln = graph.log(lhs)?;
                let scale = graph.mul(ln, id)?;
                let drhs = graph.mul(upstream, scale)?;
                ops.add_grad(rhs, drhs)?;
            }
        }
        BinaryOp::Cmp => {}
        BinaryOp::Max => {
            // Ties go to the first operand.
            let graph = ops.graph();
            let mask = graph.cmp(id, lhs)?;
            if want_lhs {
                let dlhs = ops.graph().mul(upstream, mask)?;
                ops.add_grad(lhs, dlhs)?;
            }
            if want_rhs {
                let graph = ops.graph();
                let one = graph.constant(1.0);
                let rest = graph.sub(one, mask)?;
                let drhs = graph.mul(upstream, rest)?;
                ops.add_grad(rhs, drhs)?;
            }
        }
    }
    Ok(())
}

fn reduce_rule(
    ops: &mut impl GradientOps,
    id: NodeId,
    op: ReduceOp,
    x: NodeId,
    axes: &[usize],
    keep_dims: bool,
    upstream: NodeId,
) -> Result<(), AutodiffError> {
    if !ops.needs_grad(x) {
        return Ok(());
    }
    let graph = ops.graph();
    let input = graph.at(x).shape.clone();
    let kept = shapes::reduce_shape(&input, axes, true).map_err(|source| GraphError::Shape {
        op: op.name(),
        source,
    })?;
    let up = if keep_dims {
        upstream
    } else {
        graph.reshape(upstream, &kept)?
    };
    let dx = match op {
        ReduceOp::Sum => {
            let ones = graph.full(&input, 1.0)?;
            graph.mul(up, ones)?
        }
        ReduceOp::Max => {
            let reduced = if keep_dims {
                id
            } else {
                graph.reshape(id, &kept)?
            };
            // Tied maxima share the upstream value equally.
            let mask = graph.cmp(x, reduced)?;
            let ties = graph.reduce(ReduceOp::Sum, mask, axes, true)?;
            let share = graph.div(mask, ties)?;
            graph.mul(up, share)?
        }
    };
    ops.add_grad(x, dx)
}

fn matmul_rule(
    ops: &mut impl GradientOps,
    lhs: NodeId,
    rhs: NodeId,
    upstream: NodeId,
) -> Result<(), AutodiffError> {
    let want_lhs = ops.needs_grad(lhs);
    let want_rhs = ops.needs_grad(rhs);
    if !want_lhs && !want_rhs {
        return Ok(());
    }
    let graph = ops.graph();
    let lhs_shape = graph.at(lhs).shape.clone();
    let rhs_shape = graph.at(rhs).shape.clone();
    let (a_dims, b_dims) = shapes::promote_matmul_operands(&lhs_shape, &rhs_shape)
        .map_err(|source| GraphError::Shape {
            op: "matmul",
            source,
        })?;
    let a = if lhs_shape.len() == 2 {
        lhs
    } else {
        graph.reshape(lhs, &a_dims)?
    };
    let b = if rhs_shape.len() == 2 {
        rhs
    } else {
        graph.reshape(rhs, &b_dims)?
    };

    if want_lhs {
        let graph = ops.graph();
        let bt = graph.transpose(b)?;
        let mut da = graph.matmul(upstream, bt)?;
        if lhs_shape.len() != 2 {
            da = graph.reshape(da, &lhs_shape)?;
        }
        ops.add_grad(lhs, da)?;
    }
    if want_rhs {
        let graph = ops.graph();
        let at = graph.transpose(a)?;
        let mut db = graph.matmul(at, upstream)?;
        if rhs_shape.len() != 2 {
            db = graph.reshape(db, &rhs_shape)?;
        }
        ops.add_grad(rhs, db)?;
    }
    Ok(())
}
