// Copyright 2025 STARGA Inc.
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at:
//     http://www.apache.org/licenses/LICENSE-2.0
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Static shape rules for graph construction.
//!
//! Shapes are ordered lists of positive extents. A rank-0 shape (`[]`) is a
//! scalar holding one element. Every rule here is checked eagerly while the
//! graph is built, so a node with an inconsistent shape never exists.

use std::collections::BTreeSet;

/// A rank-N tensor shape represented as a list of extents.
pub type Shape = Vec<usize>;

/// Error type returned by the shape helpers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShapeError {
    /// A dimension of extent zero was requested.
    ZeroExtent { shape: Vec<usize> },
    RankMismatch {
        expected: String,
        found: Vec<usize>,
    },
    AxisOutOfRange {
        axis: usize,
        rank: usize,
    },
    DuplicateAxis {
        axis: usize,
    },
    EmptyAxes,
    BroadcastIncompatible {
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    InnerDimMismatch {
        lhs: Vec<usize>,
        rhs: Vec<usize>,
    },
    ElementCountMismatch {
        lhs: usize,
        rhs: usize,
    },
    InvalidPermutation {
        rank: usize,
        perm: Vec<usize>,
    },
}

impl std::fmt::Display for ShapeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ShapeError::ZeroExtent { shape } => {
                write!(f, "shape {:?} contains a zero extent", shape)
            }
            ShapeError::RankMismatch { expected, found } => {
                write!(f, "expected {} but found shape {:?}", expected, found)
            }
            ShapeError::AxisOutOfRange { axis, rank } => {
                write!(f, "axis {axis} out of range for rank {rank}")
            }
            ShapeError::DuplicateAxis { axis } => {
                write!(f, "duplicate axis {axis}")
            }
            ShapeError::EmptyAxes => write!(f, "reduction requires at least one axis"),
            ShapeError::BroadcastIncompatible { lhs, rhs } => {
                write!(f, "cannot broadcast shapes {:?} and {:?}", lhs, rhs)
            }
            ShapeError::InnerDimMismatch { lhs, rhs } => {
                write!(f, "matmul inner dimensions differ: {:?} x {:?}", lhs, rhs)
            }
            ShapeError::ElementCountMismatch { lhs, rhs } => {
                write!(f, "element count mismatch: {lhs} vs {rhs}")
            }
            ShapeError::InvalidPermutation { rank, perm } => {
                write!(f, "{:?} is not a permutation of 0..{}", perm, rank)
            }
        }
    }
}

impl std::error::Error for ShapeError {}

/// Number of elements held by a tensor of the given shape.
pub fn element_count(shape: &[usize]) -> usize {
    shape.iter().product()
}

/// Row-major strides: the last axis is contiguous.
pub fn row_major_strides(shape: &[usize]) -> Vec<usize> {
    let mut strides = vec![0; shape.len()];
    let mut acc = 1usize;
    for (axis, &extent) in shape.iter().enumerate().rev() {
        strides[axis] = acc;
        acc *= extent;
    }
    strides
}

/// Rejects shapes containing a zero extent.
pub fn validate_shape(shape: &[usize]) -> Result<(), ShapeError> {
    if shape.iter().any(|&d| d == 0) {
        return Err(ShapeError::ZeroExtent {
            shape: shape.to_vec(),
        });
    }
    Ok(())
}

/// Compute the broadcasted shape for two input shapes following the
/// standard "numpy-style" broadcasting rules.
///
/// Shapes are aligned from the right; dimensions must be equal or 1,
/// otherwise broadcasting fails.
pub fn broadcast_shapes(lhs: &[usize], rhs: &[usize]) -> Result<Shape, ShapeError> {
    let mut result = Vec::new();

    let max_rank = lhs.len().max(rhs.len());
    for i in 0..max_rank {
        let a = lhs
            .len()
            .checked_sub(i + 1)
            .map(|axis| lhs[axis])
            .unwrap_or(1);
        let b = rhs
            .len()
            .checked_sub(i + 1)
            .map(|axis| rhs[axis])
            .unwrap_or(1);

        let dim = if a == b || a == 1 {
            b
        } else if b == 1 {
            a
        } else {
            return Err(ShapeError::BroadcastIncompatible {
                lhs: lhs.to_vec(),
                rhs: rhs.to_vec(),
            });
        };

        result.push(dim);
    }

    result.reverse();
    Ok(result)
}

/// Axes of `output` along which an operand of shape `operand` was broadcast.
///
/// Leading axes that the operand does not have are included, as are axes
/// where the operand has extent 1 and the output does not.
pub fn broadcast_axes(operand: &[usize], output: &[usize]) -> Vec<usize> {
    let offset = output.len() - operand.len();
    (0..output.len())
        .filter(|&axis| axis < offset || (operand[axis - offset] == 1 && output[axis] != 1))
        .collect()
}

/// Operand shapes of a matmul after promoting vectors to matrices.
///
/// A rank-1 lhs is treated as a row vector `[1, k]` and a rank-1 rhs as a
/// column vector `[k, 1]`.
pub fn promote_matmul_operands(
    lhs: &[usize],
    rhs: &[usize],
) -> Result<([usize; 2], [usize; 2]), ShapeError> {
    let a = match lhs {
        [k] => [1, *k],
        [m, k] => [*m, *k],
        _ => {
            return Err(ShapeError::RankMismatch {
                expected: "a rank-1 or rank-2 lhs".to_string(),
                found: lhs.to_vec(),
            })
        }
    };
    let b = match rhs {
        [k] => [*k, 1],
        [k, n] => [*k, *n],
        _ => {
            return Err(ShapeError::RankMismatch {
                expected: "a rank-1 or rank-2 rhs".to_string(),
                found: rhs.to_vec(),
            })
        }
    };
    Ok((a, b))
}

/// Result shape of `lhs x rhs`; always rank 2.
pub fn matmul_shape(lhs: &[usize], rhs: &[usize]) -> Result<Shape, ShapeError> {
    let (a, b) = promote_matmul_operands(lhs, rhs)?;
    if a[1] != b[0] {
        return Err(ShapeError::InnerDimMismatch {
            lhs: lhs.to_vec(),
            rhs: rhs.to_vec(),
        });
    }
    Ok(vec![a[0], b[1]])
}

/// Validates a list of reduction axes and returns it sorted.
pub fn normalize_axes(axes: &[usize], rank: usize) -> Result<Vec<usize>, ShapeError> {
    if axes.is_empty() {
        return Err(ShapeError::EmptyAxes);
    }
    let mut seen = BTreeSet::new();
    for &axis in axes {
        if axis >= rank {
            return Err(ShapeError::AxisOutOfRange { axis, rank });
        }
        if !seen.insert(axis) {
            return Err(ShapeError::DuplicateAxis { axis });
        }
    }
    Ok(seen.into_iter().collect())
}

/// Output shape of a reduction. With `keep_dims` every reduced axis becomes
/// extent 1; otherwise reduced axes are dropped.
pub fn reduce_shape(input: &[usize], axes: &[usize], keep_dims: bool) -> Result<Shape, ShapeError> {
    let normalized = normalize_axes(axes, input.len())?;
    if keep_dims {
        let mut out = input.to_vec();
        for &axis in &normalized {
            out[axis] = 1;
        }
        Ok(out)
    } else {
        Ok(input
            .iter()
            .enumerate()
            .filter(|(axis, _)| !normalized.contains(axis))
            .map(|(_, &dim)| dim)
            .collect())
    }
}

pub fn reshape_shape(input: &[usize], new_dims: &[usize]) -> Result<Shape, ShapeError> {
    validate_shape(new_dims)?;
    let old = element_count(input);
    let new = element_count(new_dims);
    if old != new {
        return Err(ShapeError::ElementCountMismatch { lhs: old, rhs: new });
    }
    Ok(new_dims.to_vec())
}

/// Output shape of a permutation: output axis `d` is input axis `perm[d]`.
pub fn permute_shape(input: &[usize], perm: &[usize]) -> Result<Shape, ShapeError> {
    let invalid = || ShapeError::InvalidPermutation {
        rank: input.len(),
        perm: perm.to_vec(),
    };
    if perm.len() != input.len() {
        return Err(invalid());
    }
    let mut seen = BTreeSet::new();
    for &axis in perm {
        if axis >= input.len() || !seen.insert(axis) {
            return Err(invalid());
        }
    }
    Ok(perm.iter().map(|&axis| input[axis]).collect())
}

/// Inverse of a permutation produced by [`permute_shape`].
pub fn inverse_permutation(perm: &[usize]) -> Vec<usize> {
    let mut inverse = vec![0; perm.len()];
    for (idx, &p) in perm.iter().enumerate() {
        inverse[p] = idx;
    }
    inverse
}
