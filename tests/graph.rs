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

use gradforge::graph::{BinaryOp, NodeKind, ReduceOp};
use gradforge::shapes::ShapeError;
use gradforge::{Graph, GraphError, NodeId, TensorData};

#[test]
fn elementwise_ops_broadcast() {
    let mut g = Graph::new();
    let x = g.input(&[3, 1]).unwrap();
    let w = g.weight(&[4]).unwrap();
    let sum = g.add(x.id(), w.id()).unwrap();
    assert_eq!(g.shape(sum).unwrap(), &[3, 4]);

    let c = g.constant(2.0);
    let scaled = g.mul(sum, c).unwrap();
    assert_eq!(g.shape(scaled).unwrap(), &[3, 4]);
    assert!(matches!(
        g.node(scaled).unwrap().kind,
        NodeKind::Binary {
            op: BinaryOp::Mul,
            ..
        }
    ));
}

#[test]
fn incompatible_shapes_append_nothing() {
    let mut g = Graph::new();
    let a = g.input(&[3]).unwrap();
    let b = g.input(&[4]).unwrap();
    let before = g.len();

    let err = g.add(a.id(), b.id()).unwrap_err();
    assert!(matches!(
        err,
        GraphError::Shape {
            op: "add",
            source: ShapeError::BroadcastIncompatible { .. }
        }
    ));
    assert!(g.matmul(a.id(), b.id()).is_err());
    assert!(g.reshape(a.id(), &[2, 2]).is_err());
    assert_eq!(g.len(), before);
}

#[test]
fn zero_extent_leaves_are_rejected() {
    let mut g = Graph::new();
    let err = g.input(&[2, 0]).unwrap_err();
    assert!(matches!(
        err,
        GraphError::Shape {
            op: "input",
            source: ShapeError::ZeroExtent { .. }
        }
    ));
    assert!(g.is_empty());
}

#[test]
fn reductions_keep_or_drop_axes() {
    let mut g = Graph::new();
    let x = g.input(&[2, 3, 4]).unwrap();
    let kept = g.sum(x.id(), &[1]).unwrap();
    assert_eq!(g.shape(kept).unwrap(), &[2, 1, 4]);

    let dropped = g.reduce(ReduceOp::Max, x.id(), &[0, 2], false).unwrap();
    assert_eq!(g.shape(dropped).unwrap(), &[3]);

    let total = g.sum_all(x.id()).unwrap();
    assert!(g.shape(total).unwrap().is_empty());

    assert!(g.sum(x.id(), &[3]).is_err());
}

#[test]
fn matmul_and_transpose_shapes() {
    let mut g = Graph::new();
    let w = g.weight(&[2, 3]).unwrap();
    let x = g.input(&[3]).unwrap();
    let y = g.matmul(w.id(), x.id()).unwrap();
    assert_eq!(g.shape(y).unwrap(), &[2, 1]);

    let t = g.transpose(w.id()).unwrap();
    assert_eq!(g.shape(t).unwrap(), &[3, 2]);
    assert!(g.transpose(x.id()).is_err());
}

#[test]
fn unknown_nodes_are_reported() {
    let mut g = Graph::new();
    let x = g.input(&[2]).unwrap();
    let missing = NodeId(42);
    assert_eq!(
        g.add(x.id(), missing).unwrap_err(),
        GraphError::UnknownNode(missing)
    );
}

#[test]
fn weights_of_follows_dependencies() {
    let mut g = Graph::new();
    let x = g.input(&[2]).unwrap();
    let w1 = g.weight(&[2]).unwrap();
    let unused = g.weight(&[2]).unwrap();
    let w2 = g.weight(&[2]).unwrap();
    let a = g.mul(x.id(), w1.id()).unwrap();
    let b = g.add(a, w2.id()).unwrap();

    let weights = g.weights_of(b).unwrap();
    assert_eq!(weights, vec![w1.id(), w2.id()]);
    assert!(!weights.contains(&unused.id()));
}

#[test]
fn binding_checks_length() {
    let mut g = Graph::new();
    let x = g.input(&[2, 2]).unwrap();
    let short = TensorData::new(vec![1.0, 2.0]);
    assert_eq!(
        x.bind(&short).unwrap_err(),
        GraphError::SizeMismatch {
            node: x.id(),
            expected: 4,
            found: 2
        }
    );
    assert!(!x.slot().is_bound());

    let data = TensorData::zeros(4);
    x.bind(&data).unwrap();
    assert!(x.slot().is_bound());
    drop(data);
    assert!(!x.slot().is_bound());
}

#[test]
fn leaf_handles_share_the_slot() {
    let mut g = Graph::new();
    let x = g.input(&[3]).unwrap();
    let again = g.leaf_handle(x.id()).unwrap();
    let data = TensorData::new(vec![1.0, 2.0, 3.0]);
    again.bind(&data).unwrap();
    assert!(x.slot().is_bound());

    let c = g.constant(1.0);
    assert_eq!(g.leaf_handle(c).unwrap_err(), GraphError::NotALeaf(c));
}
