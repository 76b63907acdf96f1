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

use std::cell::RefMut;
use std::ffi::c_void;
use std::ptr;
use std::rc::Rc;

use crate::graph::{NodeId, Storage};
use crate::ir::{BufferId, BufferSource, Program};

use super::Kernel;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExecuteError {
    /// No storage is bound to the leaf, or the bound storage was dropped.
    #[error("no live storage is bound to {node}")]
    Unbound { node: NodeId },
    #[error("storage bound to {node} holds {found} elements, expected {expected}")]
    SizeMismatch {
        node: NodeId,
        expected: usize,
        found: usize,
    },
    /// The storage is borrowed elsewhere for the duration of the call.
    #[error("storage bound to {node} is already borrowed")]
    Busy { node: NodeId },
}

/// A compiled program together with its scratch buffers.
///
/// Scratch buffers (one per function output) are allocated once and live as
/// long as the module. Leaf storage is looked up through the leaves' data
/// slots on every [`execute`](Self::execute), so rebinding a leaf between
/// calls is picked up without recompiling.
pub struct ExecutableModule {
    program: Program,
    kernel: Box<dyn Kernel>,
    scratch: Vec<Option<Box<[f64]>>>,
    pointers: Vec<*mut c_void>,
}

impl ExecutableModule {
    pub fn new(program: Program, kernel: Box<dyn Kernel>) -> Self {
        let mut scratch: Vec<Option<Box<[f64]>>> = program
            .buffers
            .iter()
            .map(|desc| match desc.source {
                BufferSource::Tensor(_) => None,
                BufferSource::Function(_) => Some(vec![0.0; desc.len].into_boxed_slice()),
            })
            .collect();
        let pointers = scratch
            .iter_mut()
            .map(|buffer| match buffer {
                Some(data) => data.as_mut_ptr().cast::<c_void>(),
                None => ptr::null_mut(),
            })
            .collect();
        Self {
            program,
            kernel,
            scratch,
            pointers,
        }
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    /// Run the program once.
    ///
    /// Every leaf buffer must be bound to live storage of the right length.
    /// Storage shared by several leaves is passed to the kernel once. Nothing
    /// runs if any check fails.
    #[tracing::instrument(level = "debug", skip_all)]
    pub fn execute(&mut self) -> Result<(), ExecuteError> {
        let mut bound: Vec<(usize, NodeId, usize, Storage)> = Vec::new();
        for (idx, desc) in self.program.buffers.iter().enumerate() {
            if let BufferSource::Tensor(tensor) = &desc.source {
                let storage = tensor
                    .slot
                    .upgrade()
                    .ok_or(ExecuteError::Unbound { node: tensor.node })?;
                bound.push((idx, tensor.node, desc.len, storage));
            }
        }

        let mut unique: Vec<&Storage> = Vec::with_capacity(bound.len());
        let mut guards: Vec<RefMut<'_, Vec<f64>>> = Vec::with_capacity(bound.len());
        for (idx, node, len, storage) in &bound {
            let pos = match unique.iter().position(|seen| Rc::ptr_eq(seen, storage)) {
                Some(pos) => pos,
                None => {
                    let guard = storage
                        .try_borrow_mut()
                        .map_err(|_| ExecuteError::Busy { node: *node })?;
                    unique.push(storage);
                    guards.push(guard);
                    guards.len() - 1
                }
            };
            let data = &mut guards[pos];
            if data.len() != *len {
                return Err(ExecuteError::SizeMismatch {
                    node: *node,
                    expected: *len,
                    found: data.len(),
                });
            }
            self.pointers[*idx] = data.as_mut_ptr().cast::<c_void>();
        }

        // SAFETY: every scratch pointer addresses a live allocation of its
        // declared length owned by `self`; every tensor pointer comes from a
        // storage whose length was checked and which stays mutably borrowed
        // until after the call.
        unsafe { self.kernel.run(&mut self.pointers) };

        for (idx, _, _, _) in &bound {
            self.pointers[*idx] = ptr::null_mut();
        }
        drop(guards);
        Ok(())
    }

    /// Contents of a scratch buffer after the last execution. `None` for
    /// leaf buffers and unknown ids.
    pub fn buffer(&self, id: BufferId) -> Option<&[f64]> {
        self.scratch.get(id.0)?.as_deref()
    }

    pub fn output_buffer(&self) -> Option<BufferId> {
        self.program.output
    }

    /// The program's primary output after the last execution.
    pub fn output(&self) -> &[f64] {
        self.program
            .output
            .and_then(|id| self.buffer(id))
            .unwrap_or(&[])
    }
}
