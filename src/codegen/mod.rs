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

//! Lowering from tensor graphs to the scalar loop IR.
//!
//! Element-wise nodes are fused into the loop nest of the function that
//! consumes them. Broadcast operands are addressed with a zero coordinate
//! along their unit axes, reshapes re-derive the source index with integer
//! division and remainder, and permutes reorder the index vector.

mod index;
mod lower;

pub use lower::{lower, LowerError, ProgramBuilder};
