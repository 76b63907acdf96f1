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

#![cfg(feature = "autodiff")]

use gradforge::autodiff::{differentiate, AutodiffError};
use gradforge::graph::NodeKind;
use gradforge::Graph;

#[test]
fn gradients_match_target_shapes() {
    let mut g = Graph::new();
    let x = g.input(&[3]).unwrap();
    let w = g.weight(&[2, 3]).unwrap();
    let b = g.weight(&[2, 1]).unwrap();
    let y = g.matmul(w.id(), x.id()).unwrap();
    let z = g.add(y, b.id()).unwrap();
    let root = g.sigmoid(z).unwrap();

    let grads = differentiate(&mut g, root, &[x.id(), w.id(), b.id()]).unwrap();
    assert_eq!(grads.len(), 3);
    assert_eq!(g.shape(grads[&x.id()]).unwrap(), &[3]);
    assert_eq!(g.shape(grads[&w.id()]).unwrap(), &[2, 3]);
    assert_eq!(g.shape(grads[&b.id()]).unwrap(), &[2, 1]);
}

#[test]
fn broadcast_operands_are_reduced_back() {
    let mut g = Graph::new();
    let x = g.input(&[4, 3]).unwrap();
    let bias = g.weight(&[3]).unwrap();
    let scale = g.weight(&[]).unwrap();
    let shifted = g.add(x.id(), bias.id()).unwrap();
    let root = g.mul(shifted, scale.id()).unwrap();

    let grads = differentiate(&mut g, root, &[bias.id(), scale.id()]).unwrap();
    assert_eq!(g.shape(grads[&bias.id()]).unwrap(), &[3]);
    assert!(g.shape(grads[&scale.id()]).unwrap().is_empty());
}

#[test]
fn reductions_and_layout_ops_differentiate() {
    let mut g = Graph::new();
    let w = g.weight(&[2, 3]).unwrap();
    let t = g.transpose(w.id()).unwrap();
    let r = g.reshape(t, &[6]).unwrap();
    let m = g.max_reduce(r, &[0]).unwrap();
    let s = g.sum_all(w.id()).unwrap();
    let root = g.add(m, s).unwrap();

    let grads = differentiate(&mut g, root, &[w.id()]).unwrap();
    assert_eq!(g.shape(grads[&w.id()]).unwrap(), &[2, 3]);
}

#[test]
fn unreachable_target_gets_zero_gradient() {
    let mut g = Graph::new();
    let x = g.input(&[2]).unwrap();
    let unused = g.weight(&[5]).unwrap();
    let root = g.exp(x.id()).unwrap();

    let grads = differentiate(&mut g, root, &[unused.id()]).unwrap();
    let grad = g.node(grads[&unused.id()]).unwrap();
    assert!(matches!(grad.kind, NodeKind::Constant(v) if v == 0.0));
    assert_eq!(grad.shape, vec![5]);
}

#[test]
fn non_leaf_targets_are_rejected() {
    let mut g = Graph::new();
    let x = g.input(&[2]).unwrap();
    let y = g.exp(x.id()).unwrap();
    let root = g.sum_all(y).unwrap();

    let err = differentiate(&mut g, root, &[y]).unwrap_err();
    assert!(matches!(err, AutodiffError::InvalidTarget(id) if id == y));
}

#[test]
fn primal_nodes_are_left_untouched() {
    let mut g = Graph::new();
    let x = g.input(&[2]).unwrap();
    let w = g.weight(&[2]).unwrap();
    let prod = g.mul(x.id(), w.id()).unwrap();
    let root = g.sin(prod).unwrap();
    let before: Vec<Vec<usize>> = g.nodes().map(|(_, node)| node.shape.clone()).collect();

    let grads = differentiate(&mut g, root, &[w.id()]).unwrap();
    assert!(g.len() > before.len());
    assert!(grads[&w.id()].0 >= before.len());
    let after: Vec<Vec<usize>> = g
        .nodes()
        .take(before.len())
        .map(|(_, node)| node.shape.clone())
        .collect();
    assert_eq!(before, after);
}
