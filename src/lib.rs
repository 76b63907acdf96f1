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

//! gradforge: lazy tensor graphs compiled to native code.
//!
//! A [`Graph`] records tensor operations without evaluating them. The graph
//! is differentiated by [`autodiff`], lowered by [`codegen`] into a scalar
//! [`ir::Program`], emitted as C by [`backend`] and run through an
//! [`ExecutableModule`]. [`pipeline`] and [`train`] tie the stages together.
pub mod shapes;

pub mod graph;
pub mod ir;

#[cfg(feature = "autodiff")]
pub mod autodiff;

pub mod backend;
pub mod codegen;
pub mod pipeline;

#[cfg(feature = "autodiff")]
pub mod train;

pub use backend::{BackendConfig, CompileError, ExecutableModule, ExecuteError};
pub use graph::{Graph, GraphError, LeafHandle, NodeId, TensorData};
pub use pipeline::{CompileOptions, CompiledGraph, PipelineError};

#[cfg(feature = "native")]
pub use backend::ScalarCBackend;
#[cfg(feature = "native")]
pub use pipeline::compile_graph;
#[cfg(all(feature = "autodiff", feature = "native"))]
pub use train::compile_training_step;
#[cfg(feature = "autodiff")]
pub use train::{TrainError, TrainingContext, DEFAULT_LEARNING_RATE};
