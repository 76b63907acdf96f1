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

//! Gradient-descent training steps.
//!
//! [`compile_training_step`] extends a graph with a target input and the
//! element-wise squared error against it, differentiates that loss with
//! respect to every weight it depends on, and compiles one module that
//! evaluates the loss, evaluates every gradient, and then overwrites each
//! weight with `w - lr * g`. Executing the module once is one step.

use crate::autodiff::{self, AutodiffError};
use crate::backend::{self, Backend, CompileError, ExecutableModule, ExecuteError};
use crate::codegen::{LowerError, ProgramBuilder};
use crate::graph::{Graph, GraphError, LeafHandle, NodeId, TensorData};
use crate::ir::BufferId;

#[cfg(feature = "native")]
use crate::backend::ScalarCBackend;

pub const DEFAULT_LEARNING_RATE: f64 = 0.1;

#[derive(Debug, thiserror::Error)]
pub enum TrainError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("autodiff failed: {0}")]
    Autodiff(#[from] AutodiffError),
    #[error("lowering failed: {0}")]
    Lower(#[from] LowerError),
    #[error("compilation failed: {0}")]
    Compile(#[from] CompileError),
    #[error(transparent)]
    Execute(#[from] ExecuteError),
    #[error("learning rate must be finite, got {0}")]
    InvalidLearningRate(f64),
}

/// A compiled training step.
pub struct TrainingContext {
    target: LeafHandle,
    weights: Vec<LeafHandle>,
    loss: NodeId,
    loss_buffer: BufferId,
    module: ExecutableModule,
}

impl std::fmt::Debug for TrainingContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainingContext")
            .field("target", &self.target)
            .field("weights", &self.weights)
            .field("loss", &self.loss)
            .field("loss_buffer", &self.loss_buffer)
            .finish_non_exhaustive()
    }
}

impl TrainingContext {
    /// Run one step: evaluate the loss and gradients against the current
    /// weights, then update every weight in place.
    pub fn execute(&mut self) -> Result<(), TrainError> {
        self.module.execute()?;
        Ok(())
    }

    /// Summed loss from the last step, measured before the update.
    pub fn loss(&self) -> f64 {
        self.loss_values().iter().sum()
    }

    pub fn loss_values(&self) -> &[f64] {
        self.module.buffer(self.loss_buffer).unwrap_or(&[])
    }

    /// Node holding the element-wise squared error.
    pub fn loss_node(&self) -> NodeId {
        self.loss
    }

    /// The input leaf the root is compared against.
    pub fn target(&self) -> &LeafHandle {
        &self.target
    }

    pub fn bind_target(&self, data: &TensorData) -> Result<(), TrainError> {
        self.target.bind(data)?;
        Ok(())
    }

    /// Weights updated by each step, in ascending node order.
    pub fn weights(&self) -> &[LeafHandle] {
        &self.weights
    }

    pub fn module(&self) -> &ExecutableModule {
        &self.module
    }
}

/// Compile a training step for `root` with the scalar C backend.
#[cfg(feature = "native")]
pub fn compile_training_step(
    graph: &mut Graph,
    root: NodeId,
    learning_rate: f64,
) -> Result<TrainingContext, TrainError> {
    compile_training_step_with(graph, root, learning_rate, &ScalarCBackend::from_env())
}

#[tracing::instrument(skip(graph, root, backend), fields(root = %root, backend = backend.name()))]
pub fn compile_training_step_with(
    graph: &mut Graph,
    root: NodeId,
    learning_rate: f64,
    backend: &dyn Backend,
) -> Result<TrainingContext, TrainError> {
    if !learning_rate.is_finite() {
        return Err(TrainError::InvalidLearningRate(learning_rate));
    }
    let shape = graph.shape(root)?.to_vec();

    let target = graph.input(&shape)?;
    let diff = graph.sub(target.id(), root)?;
    let loss = graph.square(diff)?;

    let weights = graph.weights_of(loss)?;
    let grads = autodiff::differentiate(graph, loss, &weights)?;

    let lr = graph.constant(learning_rate);
    let mut updates = Vec::with_capacity(grads.len());
    for (&weight, &grad) in &grads {
        let step = graph.mul(grad, lr)?;
        let next = graph.sub(weight, step)?;
        updates.push((weight, grad, next));
    }

    let graph: &Graph = graph;
    let mut builder = ProgramBuilder::new(graph);
    let loss_buffer = builder.output(loss)?;
    // Every gradient reads the weights as they were before the step.
    for &(_, grad, _) in &updates {
        builder.materialize(grad)?;
    }
    for &(weight, _, next) in &updates {
        builder.update_in_place(weight, next)?;
    }
    let program = builder.finish()?;
    let module = backend::compile(program, backend)?;

    let weights = weights
        .into_iter()
        .map(|id| graph.leaf_handle(id))
        .collect::<Result<Vec<_>, _>>()?;
    tracing::debug!(weights = weights.len(), learning_rate, "training step compiled");

    Ok(TrainingContext {
        target,
        weights,
        loss,
        loss_buffer,
        module,
    })
}
