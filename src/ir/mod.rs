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

//! Scalar loop IR.
//!
//! A [`Program`] is an ordered list of [`Function`]s over a table of
//! [`BufferDescriptor`]s. Each function writes exactly one buffer through
//! loop nests of scalar [`Instruction`]s. An instruction's result is named by
//! its position in the function ([`ValueId`]).

use std::fmt;

pub mod verify;

pub use crate::graph::{BinaryOp, ReduceOp, UnaryOp};
use crate::graph::{DataSlot, NodeId};
pub use verify::{verify_program, IrVerifyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ValueId(pub usize);

impl fmt::Display for ValueId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.0)
    }
}

/// Index into [`Program::buffers`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BufferId(pub usize);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "b{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IntOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
}

impl IntOp {
    pub fn symbol(self) -> char {
        match self {
            IntOp::Add => '+',
            IntOp::Sub => '-',
            IntOp::Mul => '*',
            IntOp::Div => '/',
            IntOp::Mod => '%',
        }
    }
}

/// Type of the value an instruction produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// 64-bit signed index arithmetic.
    Int,
    /// One tensor element.
    Float,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValueKind::Int => f.write_str("int"),
            ValueKind::Float => f.write_str("float"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Instruction {
    IntImmediate(i64),
    IntArith {
        op: IntOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    /// Opens a loop whose index runs over `0..range`. `stride` is the step of
    /// the output offset per iteration; it is 0 for reduction loops.
    BeginLoop {
        range: usize,
        stride: usize,
    },
    EndLoop,
    /// Reads element `offset` of the function-local input `input`.
    Load {
        input: usize,
        offset: ValueId,
    },
    /// Writes element `offset` of the function's output buffer.
    Store {
        offset: ValueId,
        value: ValueId,
    },
    Immediate(f64),
    Unary {
        op: UnaryOp,
        x: ValueId,
    },
    Binary {
        op: BinaryOp,
        lhs: ValueId,
        rhs: ValueId,
    },
    /// Folds `x` into the accumulator value `acc` in place.
    Accumulate {
        op: ReduceOp,
        acc: ValueId,
        x: ValueId,
    },
}

impl Instruction {
    /// Kind of the value this instruction defines, if any.
    pub fn result_kind(&self) -> Option<ValueKind> {
        match self {
            Instruction::IntImmediate(_)
            | Instruction::IntArith { .. }
            | Instruction::BeginLoop { .. } => Some(ValueKind::Int),
            Instruction::Load { .. }
            | Instruction::Immediate(_)
            | Instruction::Unary { .. }
            | Instruction::Binary { .. } => Some(ValueKind::Float),
            Instruction::EndLoop | Instruction::Store { .. } | Instruction::Accumulate { .. } => {
                None
            }
        }
    }

    /// Operands together with the kind each must have.
    pub fn operands(&self) -> Vec<(ValueId, ValueKind)> {
        match self {
            Instruction::IntArith { lhs, rhs, .. } => {
                vec![(*lhs, ValueKind::Int), (*rhs, ValueKind::Int)]
            }
            Instruction::Load { offset, .. } => vec![(*offset, ValueKind::Int)],
            Instruction::Store { offset, value } => {
                vec![(*offset, ValueKind::Int), (*value, ValueKind::Float)]
            }
            Instruction::Unary { x, .. } => vec![(*x, ValueKind::Float)],
            Instruction::Binary { lhs, rhs, .. } => {
                vec![(*lhs, ValueKind::Float), (*rhs, ValueKind::Float)]
            }
            Instruction::Accumulate { acc, x, .. } => {
                vec![(*acc, ValueKind::Float), (*x, ValueKind::Float)]
            }
            Instruction::IntImmediate(_)
            | Instruction::BeginLoop { .. }
            | Instruction::EndLoop
            | Instruction::Immediate(_) => Vec::new(),
        }
    }
}

/// Appends instructions for a single function.
///
/// Every method returns the [`ValueId`] of the instruction it appended, so
/// results can be referenced by later instructions.
#[derive(Debug, Clone, Default)]
pub struct FunctionBuilder {
    instructions: Vec<Instruction>,
    inputs: Vec<BufferId>,
    output_len: usize,
}

impl FunctionBuilder {
    /// A builder for a function writing `output_len` elements.
    pub fn new(output_len: usize) -> Self {
        Self {
            instructions: Vec::new(),
            inputs: Vec::new(),
            output_len,
        }
    }

    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    pub fn output_len(&self) -> usize {
        self.output_len
    }

    /// Registers `buffer` as an input and returns its local index. Registering
    /// the same buffer twice returns the same index.
    pub fn input(&mut self, buffer: BufferId) -> usize {
        if let Some(pos) = self.inputs.iter().position(|b| *b == buffer) {
            return pos;
        }
        self.inputs.push(buffer);
        self.inputs.len() - 1
    }

    pub fn push(&mut self, instruction: Instruction) -> ValueId {
        self.instructions.push(instruction);
        ValueId(self.instructions.len() - 1)
    }

    pub fn int_immediate(&mut self, value: i64) -> ValueId {
        self.push(Instruction::IntImmediate(value))
    }

    pub fn int_arith(&mut self, op: IntOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push(Instruction::IntArith { op, lhs, rhs })
    }

    pub fn begin_loop(&mut self, range: usize, stride: usize) -> ValueId {
        self.push(Instruction::BeginLoop { range, stride })
    }

    pub fn end_loop(&mut self) -> ValueId {
        self.push(Instruction::EndLoop)
    }

    pub fn load(&mut self, input: usize, offset: ValueId) -> ValueId {
        self.push(Instruction::Load { input, offset })
    }

    pub fn store(&mut self, offset: ValueId, value: ValueId) -> ValueId {
        self.push(Instruction::Store { offset, value })
    }

    pub fn immediate(&mut self, value: f64) -> ValueId {
        self.push(Instruction::Immediate(value))
    }

    pub fn unary(&mut self, op: UnaryOp, x: ValueId) -> ValueId {
        self.push(Instruction::Unary { op, x })
    }

    pub fn binary(&mut self, op: BinaryOp, lhs: ValueId, rhs: ValueId) -> ValueId {
        self.push(Instruction::Binary { op, lhs, rhs })
    }

    pub fn accumulate(&mut self, op: ReduceOp, acc: ValueId, x: ValueId) -> ValueId {
        self.push(Instruction::Accumulate { op, acc, x })
    }
}

/// A finished function of a [`Program`].
#[derive(Debug, Clone, PartialEq)]
pub struct Function {
    pub instructions: Vec<Instruction>,
    /// Program buffers read by the function, in local input order.
    pub inputs: Vec<BufferId>,
    pub output: BufferId,
}

/// External storage referenced by a program buffer. Two tensors are the
/// same buffer when they belong to the same graph node.
#[derive(Debug, Clone)]
pub struct ExternalTensor {
    pub node: NodeId,
    pub slot: DataSlot,
}

impl PartialEq for ExternalTensor {
    fn eq(&self, other: &Self) -> bool {
        self.node == other.node
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BufferSource {
    /// Caller-owned leaf storage, bound at execution time.
    Tensor(ExternalTensor),
    /// Scratch storage written by the function with this index.
    Function(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BufferDescriptor {
    pub source: BufferSource,
    pub len: usize,
}

impl BufferDescriptor {
    pub fn is_tensor(&self) -> bool {
        matches!(self.source, BufferSource::Tensor(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    pub functions: Vec<Function>,
    pub buffers: Vec<BufferDescriptor>,
    /// Buffer holding the primary output.
    pub output: Option<BufferId>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_buffer(&mut self, source: BufferSource, len: usize) -> BufferId {
        if let Some(pos) = self.buffers.iter().position(|b| b.source == source) {
            return BufferId(pos);
        }
        self.buffers.push(BufferDescriptor { source, len });
        BufferId(self.buffers.len() - 1)
    }

    /// Buffer for the storage of a leaf node; deduplicated by node.
    pub fn add_tensor_buffer(&mut self, node: NodeId, slot: DataSlot, len: usize) -> BufferId {
        self.add_buffer(BufferSource::Tensor(ExternalTensor { node, slot }), len)
    }

    /// Appends a function writing a fresh scratch buffer and returns that
    /// buffer.
    pub fn push_function(&mut self, builder: FunctionBuilder) -> BufferId {
        let index = self.functions.len();
        let output = self.add_buffer(BufferSource::Function(index), builder.output_len);
        self.push_function_into(builder, output);
        output
    }

    /// Appends a function writing an existing buffer.
    pub fn push_function_into(&mut self, builder: FunctionBuilder, output: BufferId) {
        let FunctionBuilder {
            instructions,
            inputs,
            ..
        } = builder;
        self.functions.push(Function {
            instructions,
            inputs,
            output,
        });
    }

    pub fn buffer(&self, id: BufferId) -> Option<&BufferDescriptor> {
        self.buffers.get(id.0)
    }

    /// Buffer bound to the storage of `node`, if the program reads or
    /// writes it.
    pub fn tensor_buffer(&self, node: NodeId) -> Option<BufferId> {
        self.buffers
            .iter()
            .position(|b| matches!(&b.source, BufferSource::Tensor(t) if t.node == node))
            .map(BufferId)
    }
}
