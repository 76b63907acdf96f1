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

//! Multi-dimensional index arithmetic emitted as integer instructions.

use crate::ir::{FunctionBuilder, IntOp, ValueId};
use crate::shapes;

/// One coordinate of a tensor index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Index {
    /// The coordinate is always 0 (broadcast or unit dimension).
    Zero,
    Var(ValueId),
}

/// Row-major element offset of `idx` into a tensor of `shape`.
pub(crate) fn linear_offset(fb: &mut FunctionBuilder, idx: &[Index], shape: &[usize]) -> ValueId {
    let strides = shapes::row_major_strides(shape);
    let mut offset: Option<ValueId> = None;
    for ((index, &extent), &stride) in idx.iter().zip(shape).zip(&strides) {
        let Index::Var(var) = *index else {
            continue;
        };
        if extent == 1 {
            continue;
        }
        let term = if stride == 1 {
            var
        } else {
            let scale = fb.int_immediate(stride as i64);
            fb.int_arith(IntOp::Mul, var, scale)
        };
        offset = Some(match offset {
            None => term,
            Some(acc) => fb.int_arith(IntOp::Add, acc, term),
        });
    }
    match offset {
        Some(offset) => offset,
        None => fb.int_immediate(0),
    }
}

/// Index into an operand that was broadcast to the shape `idx` addresses.
pub(crate) fn broadcast_index(idx: &[Index], operand: &[usize]) -> Vec<Index> {
    let lead = idx.len() - operand.len();
    operand
        .iter()
        .enumerate()
        .map(|(axis, &extent)| {
            if extent == 1 {
                Index::Zero
            } else {
                idx[lead + axis]
            }
        })
        .collect()
}

/// Index into the source of a reshape: flatten against the output shape and
/// split again against the input shape.
pub(crate) fn reshape_index(
    fb: &mut FunctionBuilder,
    idx: &[Index],
    output: &[usize],
    input: &[usize],
) -> Vec<Index> {
    if output == input {
        return idx.to_vec();
    }
    let flat = linear_offset(fb, idx, output);
    let strides = shapes::row_major_strides(input);
    let mut outermost = true;
    input
        .iter()
        .zip(&strides)
        .map(|(&extent, &stride)| {
            if extent == 1 {
                return Index::Zero;
            }
            let quotient = if stride == 1 {
                flat
            } else {
                let divisor = fb.int_immediate(stride as i64);
                fb.int_arith(IntOp::Div, flat, divisor)
            };
            if outermost {
                outermost = false;
                return Index::Var(quotient);
            }
            let modulus = fb.int_immediate(extent as i64);
            Index::Var(fb.int_arith(IntOp::Mod, quotient, modulus))
        })
        .collect()
}

/// Index into the source of a permute. Output axis `d` is input axis
/// `perm[d]`.
pub(crate) fn permute_index(idx: &[Index], perm: &[usize]) -> Vec<Index> {
    let mut source = vec![Index::Zero; perm.len()];
    for (axis, &from) in perm.iter().enumerate() {
        source[from] = idx[axis];
    }
    source
}
