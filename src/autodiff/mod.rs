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

//! Reverse-mode automatic differentiation over tensor graphs.
//!
//! Differentiation is symbolic: [`differentiate`] appends the gradient
//! expressions to the same [`Graph`](crate::graph::Graph) as ordinary nodes,
//! so gradients are lowered and compiled exactly like any other value. There
//! is no runtime tape.

mod engine;
mod rules;

pub use engine::{differentiate, AutodiffError, Gradients};
