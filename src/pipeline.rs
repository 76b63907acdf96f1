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

//! One-call compilation of a graph into an executable module.
//!
//! [`compile_graph_with`] differentiates (optionally), lowers, verifies and
//! compiles in one step. The returned [`CompiledGraph`] exposes the root's
//! value and the value of every requested gradient after each execution.

use std::collections::BTreeMap;

use crate::backend::{self, Backend, CompileError, ExecutableModule, ExecuteError};
use crate::codegen::{LowerError, ProgramBuilder};
use crate::graph::{Graph, GraphError, NodeId};
use crate::ir::BufferId;

#[cfg(feature = "autodiff")]
use crate::autodiff;
#[cfg(feature = "native")]
use crate::backend::{BackendConfig, ScalarCBackend};

/// Options controlling [`compile_graph`].
#[derive(Debug, Default, Clone)]
pub struct CompileOptions {
    /// Leaves to differentiate the root against. The gradient of a
    /// non-scalar root is that of the sum of its elements.
    pub gradients: Vec<NodeId>,
    /// Toolchain settings for the native backend.
    #[cfg(feature = "native")]
    pub backend: BackendConfig,
}

/// Errors surfaced by the high-level compilation pipeline.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    /// Autodiff failed with a structured error.
    #[cfg(feature = "autodiff")]
    #[error("autodiff failed: {0}")]
    Autodiff(#[from] autodiff::AutodiffError),
    /// Gradients were requested but the feature is not enabled.
    #[cfg(not(feature = "autodiff"))]
    #[error("gradients requested but the 'autodiff' feature is not enabled")]
    AutodiffDisabled,
    #[error("lowering failed: {0}")]
    Lower(#[from] LowerError),
    #[error("compilation failed: {0}")]
    Compile(#[from] CompileError),
}

/// A compiled graph with accessors for its outputs.
pub struct CompiledGraph {
    module: ExecutableModule,
    root: NodeId,
    gradients: BTreeMap<NodeId, BufferId>,
}

impl CompiledGraph {
    pub fn execute(&mut self) -> Result<(), ExecuteError> {
        self.module.execute()
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    /// Value of the root after the last execution, in row-major order.
    pub fn output(&self) -> &[f64] {
        self.module.output()
    }

    /// Gradient with respect to `leaf` after the last execution, if it was
    /// requested.
    pub fn gradient(&self, leaf: NodeId) -> Option<&[f64]> {
        let buffer = *self.gradients.get(&leaf)?;
        self.module.buffer(buffer)
    }

    pub fn module(&self) -> &ExecutableModule {
        &self.module
    }

    pub fn into_module(self) -> ExecutableModule {
        self.module
    }
}

/// Compile `root` with the scalar C backend configured by `opts`.
#[cfg(feature = "native")]
pub fn compile_graph(
    graph: &mut Graph,
    root: NodeId,
    opts: &CompileOptions,
) -> Result<CompiledGraph, PipelineError> {
    let backend = ScalarCBackend::new(opts.backend.clone());
    compile_graph_with(graph, root, opts, &backend)
}

/// Compile `root` with an explicit backend.
#[tracing::instrument(skip_all, fields(root = %root, gradients = opts.gradients.len()))]
pub fn compile_graph_with(
    graph: &mut Graph,
    root: NodeId,
    opts: &CompileOptions,
    backend: &dyn Backend,
) -> Result<CompiledGraph, PipelineError> {
    graph.node(root)?;

    #[cfg(feature = "autodiff")]
    let grads = if opts.gradients.is_empty() {
        autodiff::Gradients::new()
    } else {
        autodiff::differentiate(graph, root, &opts.gradients)?
    };

    #[cfg(not(feature = "autodiff"))]
    let grads: BTreeMap<NodeId, NodeId> = if opts.gradients.is_empty() {
        BTreeMap::new()
    } else {
        return Err(PipelineError::AutodiffDisabled);
    };

    let mut builder = ProgramBuilder::new(graph);
    builder.output(root)?;
    let mut gradients = BTreeMap::new();
    for (&leaf, &grad) in &grads {
        gradients.insert(leaf, builder.materialize(grad)?);
    }
    let program = builder.finish()?;
    let module = backend::compile(program, backend)?;

    Ok(CompiledGraph {
        module,
        root,
        gradients,
    })
}
