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

use crate::ir::{
    BufferDescriptor, BufferId, BufferSource, Function, Instruction, Program, ValueId, ValueKind,
};

/// Structured errors returned by the IR verifier.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum IrVerifyError {
    /// The program does not name an output buffer.
    #[error("program has no output buffer")]
    MissingOutput,
    #[error("output buffer {0} does not exist")]
    OutputOutOfRange(BufferId),
    /// A function reads or writes a buffer missing from the table.
    #[error("function {function} references missing buffer {buffer}")]
    BufferOutOfRange { function: usize, buffer: BufferId },
    /// A scratch buffer is not written by the function it names.
    #[error("buffer {buffer} is not the output of function {producer}")]
    OrphanBuffer { buffer: BufferId, producer: usize },
    /// A function writes a scratch buffer that belongs to another function.
    #[error("function {function} writes buffer {buffer} owned by another function")]
    OutputMismatch { function: usize, buffer: BufferId },
    /// A function reads a buffer that no earlier function produced.
    #[error("function {function} reads {buffer} before function {producer} writes it")]
    DependencyOrder {
        function: usize,
        buffer: BufferId,
        producer: usize,
    },
    /// A tensor updated in place is touched by a later function.
    #[error("function {function} uses {buffer} after function {updated_by} updated it")]
    UseAfterUpdate {
        function: usize,
        buffer: BufferId,
        updated_by: usize,
    },
    #[error("function {function}, instruction {instr_index}: input {input} out of range")]
    InputOutOfRange {
        function: usize,
        instr_index: usize,
        input: usize,
    },
    /// A value was referenced before it had been defined.
    #[error("function {function}, instruction {instr_index}: use of undefined value {value}")]
    UseBeforeDefinition {
        function: usize,
        instr_index: usize,
        value: ValueId,
    },
    /// A value defined inside a loop was referenced after the loop closed.
    #[error("function {function}, instruction {instr_index}: {value} is out of scope")]
    OutOfScope {
        function: usize,
        instr_index: usize,
        value: ValueId,
    },
    #[error("function {function}, instruction {instr_index}: {value} is not a {expected} value")]
    TypeMismatch {
        function: usize,
        instr_index: usize,
        value: ValueId,
        expected: ValueKind,
    },
    #[error("function {function}, instruction {instr_index}: loop has zero iterations")]
    EmptyLoop { function: usize, instr_index: usize },
    /// EndLoop without a matching BeginLoop, or loops left open.
    #[error("function {function} has unbalanced loops")]
    UnbalancedLoops { function: usize },
}

/// Verify that a [`Program`] is well-formed.
///
/// Checks every function body (loop nesting, scoping, operand kinds, input
/// indices) and the buffer table: functions run in dependency order and a
/// tensor written in place is not touched by any later function.
pub fn verify_program(program: &Program) -> Result<(), IrVerifyError> {
    let output = program.output.ok_or(IrVerifyError::MissingOutput)?;
    if output.0 >= program.buffers.len() {
        return Err(IrVerifyError::OutputOutOfRange(output));
    }

    for (idx, desc) in program.buffers.iter().enumerate() {
        if let BufferSource::Function(producer) = desc.source {
            let owned = program
                .functions
                .get(producer)
                .is_some_and(|f| f.output == BufferId(idx));
            if !owned {
                return Err(IrVerifyError::OrphanBuffer {
                    buffer: BufferId(idx),
                    producer,
                });
            }
        }
    }

    let mut updated_by: Vec<Option<usize>> = vec![None; program.buffers.len()];
    for (index, function) in program.functions.iter().enumerate() {
        verify_buffers(program, index, function, &updated_by)?;
        if program.buffers[function.output.0].is_tensor() {
            updated_by[function.output.0] = Some(index);
        }
        verify_body(index, function)?;
    }
    Ok(())
}

fn verify_buffers(
    program: &Program,
    index: usize,
    function: &Function,
    updated_by: &[Option<usize>],
) -> Result<(), IrVerifyError> {
    for &buffer in &function.inputs {
        let desc = lookup(program, index, updated_by, buffer)?;
        if let BufferSource::Function(producer) = desc.source {
            if producer >= index {
                return Err(IrVerifyError::DependencyOrder {
                    function: index,
                    buffer,
                    producer,
                });
            }
        }
    }

    let desc = lookup(program, index, updated_by, function.output)?;
    if let BufferSource::Function(producer) = desc.source {
        if producer != index {
            return Err(IrVerifyError::OutputMismatch {
                function: index,
                buffer: function.output,
            });
        }
    }
    Ok(())
}

fn lookup<'p>(
    program: &'p Program,
    index: usize,
    updated_by: &[Option<usize>],
    buffer: BufferId,
) -> Result<&'p BufferDescriptor, IrVerifyError> {
    let desc = program
        .buffers
        .get(buffer.0)
        .ok_or(IrVerifyError::BufferOutOfRange {
            function: index,
            buffer,
        })?;
    if let Some(updater) = updated_by[buffer.0] {
        return Err(IrVerifyError::UseAfterUpdate {
            function: index,
            buffer,
            updated_by: updater,
        });
    }
    Ok(desc)
}

fn verify_body(function_index: usize, function: &Function) -> Result<(), IrVerifyError> {
    let count = function.instructions.len();
    let mut kinds: Vec<Option<ValueKind>> = vec![None; count];
    let mut visible = vec![false; count];
    let mut loops: Vec<usize> = Vec::new();

    for (instr_index, instr) in function.instructions.iter().enumerate() {
        for (value, expected) in instr.operands() {
            if value.0 >= instr_index {
                return Err(IrVerifyError::UseBeforeDefinition {
                    function: function_index,
                    instr_index,
                    value,
                });
            }
            if kinds[value.0] != Some(expected) {
                return Err(IrVerifyError::TypeMismatch {
                    function: function_index,
                    instr_index,
                    value,
                    expected,
                });
            }
            if !visible[value.0] {
                return Err(IrVerifyError::OutOfScope {
                    function: function_index,
                    instr_index,
                    value,
                });
            }
        }

        match instr {
            Instruction::BeginLoop { range, .. } => {
                if *range == 0 {
                    return Err(IrVerifyError::EmptyLoop {
                        function: function_index,
                        instr_index,
                    });
                }
                loops.push(instr_index);
            }
            Instruction::EndLoop => {
                let start = loops.pop().ok_or(IrVerifyError::UnbalancedLoops {
                    function: function_index,
                })?;
                for slot in &mut visible[start..instr_index] {
                    *slot = false;
                }
            }
            Instruction::Load { input, .. } if *input >= function.inputs.len() => {
                return Err(IrVerifyError::InputOutOfRange {
                    function: function_index,
                    instr_index,
                    input: *input,
                });
            }
            _ => {}
        }

        if let Some(kind) = instr.result_kind() {
            kinds[instr_index] = Some(kind);
            visible[instr_index] = true;
        }
    }

    if !loops.is_empty() {
        return Err(IrVerifyError::UnbalancedLoops {
            function: function_index,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BinaryOp, DataSlot, NodeId, ReduceOp};
    use crate::ir::FunctionBuilder;

    fn single(builder: FunctionBuilder) -> Program {
        let mut program = Program::new();
        let out = program.push_function(builder);
        program.output = Some(out);
        program
    }

    #[test]
    fn accepts_reduction_loop() {
        let mut fb = FunctionBuilder::new(1);
        let acc = fb.immediate(0.0);
        fb.begin_loop(4, 0);
        let one = fb.immediate(1.0);
        fb.accumulate(ReduceOp::Sum, acc, one);
        fb.end_loop();
        let zero = fb.int_immediate(0);
        fb.store(zero, acc);
        assert_eq!(verify_program(&single(fb)), Ok(()));
    }

    #[test]
    fn rejects_value_used_after_its_loop() {
        let mut fb = FunctionBuilder::new(1);
        fb.begin_loop(2, 1);
        let inner = fb.immediate(3.0);
        fb.end_loop();
        let zero = fb.int_immediate(0);
        fb.store(zero, inner);
        let err = verify_program(&single(fb)).unwrap_err();
        assert!(matches!(err, IrVerifyError::OutOfScope { value, .. } if value == inner));
    }

    #[test]
    fn rejects_float_offset() {
        let mut fb = FunctionBuilder::new(1);
        let x = fb.immediate(1.0);
        fb.store(x, x);
        let err = verify_program(&single(fb)).unwrap_err();
        assert!(matches!(
            err,
            IrVerifyError::TypeMismatch {
                expected: ValueKind::Int,
                ..
            }
        ));
    }

    #[test]
    fn rejects_unclosed_loop() {
        let mut fb = FunctionBuilder::new(2);
        let i = fb.begin_loop(2, 1);
        let x = fb.immediate(1.0);
        let y = fb.binary(BinaryOp::Add, x, x);
        fb.store(i, y);
        let err = verify_program(&single(fb)).unwrap_err();
        assert_eq!(err, IrVerifyError::UnbalancedLoops { function: 0 });
    }

    #[test]
    fn rejects_read_after_in_place_update() {
        let mut program = Program::new();
        let weight = program.add_tensor_buffer(NodeId(0), DataSlot::default(), 1);

        let mut update = FunctionBuilder::new(1);
        let local = update.input(weight);
        let zero = update.int_immediate(0);
        let w = update.load(local, zero);
        update.store(zero, w);
        program.push_function_into(update, weight);

        let mut reader = FunctionBuilder::new(1);
        let local = reader.input(weight);
        let zero = reader.int_immediate(0);
        let w = reader.load(local, zero);
        reader.store(zero, w);
        let out = program.push_function(reader);
        program.output = Some(out);

        let err = verify_program(&program).unwrap_err();
        assert_eq!(
            err,
            IrVerifyError::UseAfterUpdate {
                function: 1,
                buffer: weight,
                updated_by: 0,
            }
        );
    }
}
