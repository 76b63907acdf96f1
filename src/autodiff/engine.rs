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

use std::collections::BTreeMap;

use crate::graph::{Graph, GraphError, NodeId, ReduceOp};
use crate::shapes;

use super::rules;

/// Gradient nodes keyed by the leaf they differentiate.
pub type Gradients = BTreeMap<NodeId, NodeId>;

/// Errors returned by the autodiff engine.
#[derive(Debug, thiserror::Error)]
pub enum AutodiffError {
    /// Gradients can only be requested for input or weight leaves.
    #[error("gradient target {0} is not an input or weight leaf")]
    InvalidTarget(NodeId),
    /// Building a gradient node failed; this indicates an inconsistent graph.
    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Differentiate `root` with respect to every node in `targets`.
///
/// The gradient of a non-scalar root is the gradient of the sum of its
/// elements. New nodes are appended to `graph`; existing nodes are reused by
/// id whenever a rule needs a primal value. A target that `root` does not
/// depend on receives a zero-filled gradient.
#[tracing::instrument(skip(graph, root, targets), fields(root = %root, targets = targets.len()))]
pub fn differentiate(
    graph: &mut Graph,
    root: NodeId,
    targets: &[NodeId],
) -> Result<Gradients, AutodiffError> {
    graph.node(root)?;
    for &target in targets {
        if !graph.node(target)?.kind.is_leaf() {
            return Err(AutodiffError::InvalidTarget(target));
        }
    }

    let primal_len = graph.len();
    let mut builder = GradientBuilder::new(graph, root, targets);
    builder.seed(root)?;
    builder.propagate(root)?;
    let gradients = builder.finish(targets)?;

    tracing::debug!(
        primal_nodes = primal_len,
        gradient_nodes = graph.len() - primal_len,
        "gradients built"
    );
    Ok(gradients)
}

struct GradientBuilder<'g> {
    graph: &'g mut Graph,
    grads: BTreeMap<NodeId, NodeId>,
    needs_grad: Vec<bool>,
}

impl<'g> GradientBuilder<'g> {
    fn new(graph: &'g mut Graph, root: NodeId, targets: &[NodeId]) -> Self {
        let mut needs_grad = vec![false; root.0 + 1];
        for idx in 0..=root.0 {
            let id = NodeId(idx);
            let hit = targets.contains(&id)
                || graph
                    .at(id)
                    .kind
                    .operands()
                    .iter()
                    .any(|operand| needs_grad[operand.0]);
            needs_grad[idx] = hit;
        }
        Self {
            graph,
            grads: BTreeMap::new(),
            needs_grad,
        }
    }

    fn seed(&mut self, root: NodeId) -> Result<(), AutodiffError> {
        let shape = self.graph.at(root).shape.clone();
        let ones = self.graph.full(&shape, 1.0)?;
        self.grads.insert(root, ones);
        Ok(())
    }

    fn propagate(&mut self, root: NodeId) -> Result<(), AutodiffError> {
        for idx in (0..=root.0).rev() {
            if !self.needs_grad[idx] {
                continue;
            }
            let id = NodeId(idx);
            let Some(&upstream) = self.grads.get(&id) else {
                continue;
            };
            let node = self.graph.at(id).clone();
            rules::apply_rule(self, id, &node, upstream)?;
        }
        Ok(())
    }

    fn finish(self, targets: &[NodeId]) -> Result<Gradients, AutodiffError> {
        let mut gradients = BTreeMap::new();
        for &target in targets {
            let grad = match self.grads.get(&target) {
                Some(&grad) => grad,
                None => {
                    let shape = self.graph.at(target).shape.clone();
                    self.graph.full(&shape, 0.0)?
                }
            };
            gradients.insert(target, grad);
        }
        Ok(gradients)
    }

    /// Sum a contribution over the axes its operand was broadcast along.
    fn unbroadcast(&mut self, operand: NodeId, contribution: NodeId) -> Result<NodeId, AutodiffError> {
        let target = self.graph.at(operand).shape.clone();
        let produced = self.graph.at(contribution).shape.clone();
        if target == produced {
            return Ok(contribution);
        }
        let axes = shapes::broadcast_axes(&target, &produced);
        let summed = if axes.is_empty() {
            contribution
        } else {
            self.graph.reduce(ReduceOp::Sum, contribution, &axes, true)?
        };
        if self.graph.at(summed).shape == target {
            Ok(summed)
        } else {
            Ok(self.graph.reshape(summed, &target)?)
        }
    }

    fn add_grad(&mut self, target: NodeId, contribution: NodeId) -> Result<(), AutodiffError> {
        if !self.needs_grad(target) {
            return Ok(());
        }
        let contribution = self.unbroadcast(target, contribution)?;
        match self.grads.get(&target).copied() {
            None => {
                self.grads.insert(target, contribution);
            }
            Some(existing) => {
                let summed = self.graph.add(existing, contribution)?;
                self.grads.insert(target, summed);
            }
        }
        Ok(())
    }

    fn needs_grad(&self, id: NodeId) -> bool {
        self.needs_grad.get(id.0).copied().unwrap_or(false)
    }
}

// Helper API used by derivative rules.
pub(super) trait GradientOps {
    fn graph(&mut self) -> &mut Graph;
    fn needs_grad(&self, id: NodeId) -> bool;
    fn add_grad(&mut self, target: NodeId, contribution: NodeId) -> Result<(), AutodiffError>;
}

impl<'g> GradientOps for GradientBuilder<'g> {
    fn graph(&mut self) -> &mut Graph {
        &mut *self.graph
    }

    fn needs_grad(&self, id: NodeId) -> bool {
        self.needs_grad(id)
    }

    fn add_grad(&mut self, target: NodeId, contribution: NodeId) -> Result<(), AutodiffError> {
        self.add_grad(target, contribution)
    }
}
