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

//! Scalar C emission.
//!
//! Each program function becomes a `static void` C function taking its
//! inputs as `const double *` followed by the output pointer. The exported
//! entry point calls them in program order with pointers taken from the
//! buffer table. Floating-point division by zero, invalid operations and
//! overflow trap while the entry point runs (glibc targets only).

use std::fmt::{self, Write};

use crate::ir::{BinaryOp, Function, Instruction, Program, ReduceOp, UnaryOp};

/// Name of the exported entry point: `void gradforge_main(void **buffers)`.
pub const ENTRY_SYMBOL: &str = "gradforge_main";

const FUNCTION_PREFIX: &str = "gf_fn";
const TRAP_GUARD: &str = "#if defined(__linux__) && defined(__GLIBC__)";

/// Render `program` as a C translation unit.
pub fn emit_program(program: &Program) -> Result<String, fmt::Error> {
    let mut out = String::new();
    out.push_str("#define _GNU_SOURCE\n");
    out.push_str("#include <fenv.h>\n");
    out.push_str("#include <math.h>\n");
    out.push_str("#include <stdint.h>\n\n");

    for (index, function) in program.functions.iter().enumerate() {
        emit_function(&mut out, index, function)?;
    }
    emit_entry(&mut out, program)?;
    Ok(out)
}

fn emit_function(out: &mut String, index: usize, function: &Function) -> fmt::Result {
    writeln!(out, "static void {FUNCTION_PREFIX}_{index}(")?;
    for input in 0..function.inputs.len() {
        writeln!(out, "    const double *i{input},")?;
    }
    writeln!(out, "    double *output)")?;
    writeln!(out, "{{")?;

    let mut depth = 1;
    for (id, instr) in function.instructions.iter().enumerate() {
        if matches!(instr, Instruction::EndLoop) {
            depth -= 1;
        }
        let pad = "    ".repeat(depth);
        match instr {
            Instruction::IntImmediate(value) => writeln!(out, "{pad}int64_t v{id} = {value};")?,
            Instruction::IntArith { op, lhs, rhs } => writeln!(
                out,
                "{pad}int64_t v{id} = v{} {} v{};",
                lhs.0,
                op.symbol(),
                rhs.0
            )?,
            Instruction::BeginLoop { range, stride } => {
                writeln!(
                    out,
                    "{pad}for (int64_t v{id} = 0; v{id} < {range}; v{id}++) /* stride {stride} */"
                )?;
                writeln!(out, "{pad}{{")?;
                depth += 1;
            }
            Instruction::EndLoop => writeln!(out, "{pad}}}")?,
            Instruction::Load { input, offset } => {
                writeln!(out, "{pad}double v{id} = i{input}[v{}];", offset.0)?
            }
            Instruction::Store { offset, value } => {
                writeln!(out, "{pad}output[v{}] = v{};", offset.0, value.0)?
            }
            Instruction::Immediate(value) => {
                writeln!(out, "{pad}double v{id} = {};", float_literal(*value))?
            }
            Instruction::Unary { op, x } => {
                let x = x.0;
                match op {
                    UnaryOp::Exp => writeln!(out, "{pad}double v{id} = exp(v{x});")?,
                    UnaryOp::Log => writeln!(out, "{pad}double v{id} = log(v{x});")?,
                    UnaryOp::Sin => writeln!(out, "{pad}double v{id} = sin(v{x});")?,
                    UnaryOp::Sqrt => writeln!(out, "{pad}double v{id} = sqrt(v{x});")?,
                    UnaryOp::Cast | UnaryOp::Nop => writeln!(out, "{pad}double v{id} = v{x};")?,
                }
            }
            Instruction::Binary { op, lhs, rhs } => {
                let (a, b) = (lhs.0, rhs.0);
                match op {
                    BinaryOp::Add => writeln!(out, "{pad}double v{id} = v{a} + v{b};")?,
                    BinaryOp::Sub => writeln!(out, "{pad}double v{id} = v{a} - v{b};")?,
                    BinaryOp::Mul => writeln!(out, "{pad}double v{id} = v{a} * v{b};")?,
                    BinaryOp::Div => writeln!(out, "{pad}double v{id} = v{a} / v{b};")?,
                    BinaryOp::Pow => writeln!(out, "{pad}double v{id} = pow(v{a}, v{b});")?,
                    BinaryOp::Cmp => writeln!(out, "{pad}double v{id} = (double)(v{a} == v{b});")?,
                    BinaryOp::Max => {
                        writeln!(out, "{pad}double v{id} = v{a} >= v{b} ? v{a} : v{b};")?
                    }
                }
            }
            Instruction::Accumulate { op, acc, x } => {
                let (acc, x) = (acc.0, x.0);
                match op {
                    ReduceOp::Sum => writeln!(out, "{pad}v{acc} += v{x};")?,
                    ReduceOp::Max => writeln!(out, "{pad}v{acc} = v{acc} >= v{x} ? v{acc} : v{x};")?,
                }
            }
        }
    }
    writeln!(out, "}}\n")
}

fn emit_entry(out: &mut String, program: &Program) -> fmt::Result {
    writeln!(out, "void {ENTRY_SYMBOL}(void **buffers)")?;
    writeln!(out, "{{")?;
    writeln!(out, "{TRAP_GUARD}")?;
    writeln!(out, "    feclearexcept(FE_ALL_EXCEPT);")?;
    writeln!(out, "    int saved_traps = fegetexcept();")?;
    writeln!(out, "    feenableexcept(FE_DIVBYZERO | FE_INVALID | FE_OVERFLOW);")?;
    writeln!(out, "#endif")?;
    for (index, function) in program.functions.iter().enumerate() {
        write!(out, "    {FUNCTION_PREFIX}_{index}(")?;
        for input in &function.inputs {
            write!(out, "buffers[{}], ", input.0)?;
        }
        writeln!(out, "buffers[{}]);", function.output.0)?;
    }
    writeln!(out, "{TRAP_GUARD}")?;
    writeln!(out, "    fedisableexcept(FE_ALL_EXCEPT);")?;
    writeln!(out, "    feenableexcept(saved_traps);")?;
    writeln!(out, "#endif")?;
    writeln!(out, "}}")
}

fn float_literal(value: f64) -> String {
    if value.is_nan() {
        "NAN".to_string()
    } else if value.is_infinite() {
        let literal = if value > 0.0 { "INFINITY" } else { "-INFINITY" };
        literal.to_string()
    } else {
        // Debug formatting is the shortest exact representation and always
        // carries a decimal point or exponent.
        format!("{value:?}")
    }
}
