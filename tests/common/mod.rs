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

//! Reference interpreter for lowered programs, used as a [`Backend`] in
//! tests that should not depend on a C compiler.

#![allow(dead_code)]

use std::ffi::c_void;

use gradforge::backend::{Backend, CompileError, Kernel};
use gradforge::ir::{BinaryOp, Function, Instruction, IntOp, Program, ReduceOp, UnaryOp};
use gradforge::{Graph, LeafHandle, NodeId};

pub struct Interpreter;

impl Backend for Interpreter {
    fn name(&self) -> &'static str {
        "interpreter"
    }

    fn lower(&self, program: &Program) -> Result<Box<dyn Kernel>, CompileError> {
        Ok(Box::new(InterpretedKernel {
            program: program.clone(),
        }))
    }
}

struct InterpretedKernel {
    program: Program,
}

impl Kernel for InterpretedKernel {
    unsafe fn run(&self, buffers: &mut [*mut c_void]) {
        for function in &self.program.functions {
            let inputs: Vec<*const f64> = function
                .inputs
                .iter()
                .map(|id| buffers[id.0] as *const f64)
                .collect();
            let output = buffers[function.output.0] as *mut f64;
            let mut frame = Frame {
                function,
                ints: vec![0; function.instructions.len()],
                floats: vec![0.0; function.instructions.len()],
                inputs,
                output,
            };
            frame.run(0, function.instructions.len());
        }
    }
}

struct Frame<'f> {
    function: &'f Function,
    ints: Vec<i64>,
    floats: Vec<f64>,
    inputs: Vec<*const f64>,
    output: *mut f64,
}

impl Frame<'_> {
    unsafe fn run(&mut self, start: usize, end: usize) {
        let mut pc = start;
        while pc < end {
            match &self.function.instructions[pc] {
                Instruction::BeginLoop { range, .. } => {
                    let close = self.matching_end(pc);
                    for v in 0..*range {
                        self.ints[pc] = v as i64;
                        self.run(pc + 1, close);
                    }
                    pc = close + 1;
                    continue;
                }
                Instruction::EndLoop => {}
                Instruction::IntImmediate(value) => self.ints[pc] = *value,
                Instruction::IntArith { op, lhs, rhs } => {
                    let (a, b) = (self.ints[lhs.0], self.ints[rhs.0]);
                    self.ints[pc] = match op {
                        IntOp::Add => a + b,
                        IntOp::Sub => a - b,
                        IntOp::Mul => a * b,
                        IntOp::Div => a / b,
                        IntOp::Mod => a % b,
                    };
                }
                Instruction::Load { input, offset } => {
                    let ptr = self.inputs[*input];
                    self.floats[pc] = *ptr.add(self.ints[offset.0] as usize);
                }
                Instruction::Store { offset, value } => {
                    *self.output.add(self.ints[offset.0] as usize) = self.floats[value.0];
                }
                Instruction::Immediate(value) => self.floats[pc] = *value,
                Instruction::Unary { op, x } => {
                    let x = self.floats[x.0];
                    self.floats[pc] = match op {
                        UnaryOp::Exp => x.exp(),
                        UnaryOp::Log => x.ln(),
                        UnaryOp::Sin => x.sin(),
                        UnaryOp::Sqrt => x.sqrt(),
                        UnaryOp::Cast | UnaryOp::Nop => x,
                    };
                }
                Instruction::Binary { op, lhs, rhs } => {
                    let (a, b) = (self.floats[lhs.0], self.floats[rhs.0]);
                    self.floats[pc] = match op {
                        BinaryOp::Add => a + b,
                        BinaryOp::Sub => a - b,
                        BinaryOp::Mul => a * b,
                        BinaryOp::Div => a / b,
                        BinaryOp::Pow => a.powf(b),
                        BinaryOp::Cmp => f64::from(u8::from(a == b)),
                        BinaryOp::Max => {
                            if a >= b {
                                a
                            } else {
                                b
                            }
                        }
                    };
                }
                Instruction::Accumulate { op, acc, x } => {
                    let (current, x) = (self.floats[acc.0], self.floats[x.0]);
                    self.floats[acc.0] = match op {
                        ReduceOp::Sum => current + x,
                        ReduceOp::Max => {
                            if current >= x {
                                current
                            } else {
                                x
                            }
                        }
                    };
                }
            }
            pc += 1;
        }
    }

    fn matching_end(&self, begin: usize) -> usize {
        let mut depth = 0usize;
        for (pc, instr) in self.function.instructions.iter().enumerate().skip(begin) {
            match instr {
                Instruction::BeginLoop { .. } => depth += 1,
                Instruction::EndLoop => {
                    depth -= 1;
                    if depth == 0 {
                        return pc;
                    }
                }
                _ => {}
            }
        }
        panic!("loop opened at {begin} is never closed");
    }
}

/// Element-wise relative comparison. An expected value of exactly zero must
/// be matched to within machine epsilon.
pub fn assert_close(actual: &[f64], expected: &[f64], rel: f64) {
    assert_eq!(actual.len(), expected.len(), "length mismatch");
    for (idx, (a, e)) in actual.iter().zip(expected).enumerate() {
        let tol = if *e == 0.0 { f64::EPSILON } else { rel * e.abs() };
        assert!(
            (a - e).abs() <= tol,
            "element {idx}: got {a}, expected {e} (tolerance {tol})"
        );
    }
}

/// Row-major `[m, k] x [k, n]`.
pub fn naive_matmul(a: &[f64], b: &[f64], m: usize, k: usize, n: usize) -> Vec<f64> {
    let mut out = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            out[i * n + j] = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
        }
    }
    out
}

/// Handles of the two-layer threshold network that computes XOR.
pub struct Xor {
    pub x: LeafHandle,
    pub w1: LeafHandle,
    pub b1: LeafHandle,
    pub w2: LeafHandle,
    pub root: NodeId,
}

pub fn xor_network(g: &mut Graph) -> Xor {
    let x = g.input(&[2]).unwrap();
    let w1 = g.weight(&[2, 2]).unwrap();
    let b1 = g.weight(&[2, 1]).unwrap();
    let w2 = g.weight(&[1, 2]).unwrap();
    let h = g.matmul(w1.id(), x.id()).unwrap();
    let l1 = g.gt(h, b1.id()).unwrap();
    let o = g.matmul(w2.id(), l1).unwrap();
    let threshold = g.constant(1.5);
    let root = g.gt(o, threshold).unwrap();
    Xor {
        x,
        w1,
        b1,
        w2,
        root,
    }
}
