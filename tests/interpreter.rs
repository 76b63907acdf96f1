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

// Execution semantics of lowered programs, checked through the reference
// interpreter so no C toolchain is required.

mod common;

use common::{assert_close, naive_matmul, xor_network, Interpreter};
use gradforge::backend::compile;
use gradforge::codegen::ProgramBuilder;
use gradforge::graph::ReduceOp;
use gradforge::pipeline::{compile_graph_with, CompileOptions};
use gradforge::{ExecuteError, Graph, TensorData};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

fn no_gradients() -> CompileOptions {
    CompileOptions::default()
}

#[test]
fn broadcast_then_reduce() {
    let mut g = Graph::new();
    let x = g.input(&[2, 3]).unwrap();
    let b = g.weight(&[3]).unwrap();
    let shifted = g.add(x.id(), b.id()).unwrap();
    let root = g.sum(shifted, &[1]).unwrap();

    let xd = TensorData::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let bd = TensorData::new(vec![10.0, 20.0, 30.0]);
    x.bind(&xd).unwrap();
    b.bind(&bd).unwrap();

    let mut compiled = compile_graph_with(&mut g, root, &no_gradients(), &Interpreter).unwrap();
    compiled.execute().unwrap();
    assert_eq!(compiled.output(), &[66.0, 75.0]);
}

#[test]
fn max_reduction_drops_axes() {
    let mut g = Graph::new();
    let x = g.input(&[2, 3]).unwrap();
    let root = g.reduce(ReduceOp::Max, x.id(), &[0], false).unwrap();
    let xd = TensorData::new(vec![1.0, -5.0, 3.0, -4.0, 5.0, 0.5]);
    x.bind(&xd).unwrap();

    let mut compiled = compile_graph_with(&mut g, root, &no_gradients(), &Interpreter).unwrap();
    compiled.execute().unwrap();
    assert_eq!(compiled.output(), &[1.0, 5.0, 3.0]);
}

#[test]
fn transpose_then_reshape_reorders() {
    let mut g = Graph::new();
    let x = g.input(&[2, 3]).unwrap();
    let t = g.transpose(x.id()).unwrap();
    let root = g.reshape(t, &[6]).unwrap();
    let xd = TensorData::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    x.bind(&xd).unwrap();

    let mut compiled = compile_graph_with(&mut g, root, &no_gradients(), &Interpreter).unwrap();
    compiled.execute().unwrap();
    assert_eq!(compiled.output(), &[1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
}

#[test]
fn reshape_round_trip_is_identity() {
    let mut g = Graph::new();
    let x = g.input(&[2, 3, 2]).unwrap();
    let flat = g.reshape(x.id(), &[3, 4]).unwrap();
    let root = g.reshape(flat, &[2, 3, 2]).unwrap();
    let values: Vec<f64> = (0..12).map(f64::from).collect();
    let xd = TensorData::new(values.clone());
    x.bind(&xd).unwrap();

    let mut compiled = compile_graph_with(&mut g, root, &no_gradients(), &Interpreter).unwrap();
    compiled.execute().unwrap();
    assert_eq!(compiled.output(), values.as_slice());
}

#[test]
fn random_matmuls_match_naive_product() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..5 {
        let (m, k, n) = (
            rng.gen_range(1..16),
            rng.gen_range(1..16),
            rng.gen_range(1..16),
        );
        let a: Vec<f64> = (0..m * k).map(|_| rng.gen_range(-2.0..2.0)).collect();
        let b: Vec<f64> = (0..k * n).map(|_| rng.gen_range(-2.0..2.0)).collect();

        let mut g = Graph::new();
        let x = g.input(&[m, k]).unwrap();
        let y = g.input(&[k, n]).unwrap();
        let root = g.matmul(x.id(), y.id()).unwrap();
        let ad = TensorData::new(a.clone());
        let bd = TensorData::new(b.clone());
        x.bind(&ad).unwrap();
        y.bind(&bd).unwrap();

        let mut compiled = compile_graph_with(&mut g, root, &no_gradients(), &Interpreter).unwrap();
        compiled.execute().unwrap();
        assert_close(compiled.output(), &naive_matmul(&a, &b, m, k, n), 1e-12);
    }
}

#[test]
fn xor_network_thresholds() {
    let mut g = Graph::new();
    let net = xor_network(&mut g);
    let w1 = TensorData::new(vec![1.0, 1.0, -1.0, -1.0]);
    let b1 = TensorData::new(vec![0.5, -1.5]);
    let w2 = TensorData::new(vec![1.0, 1.0]);
    let x = TensorData::zeros(2);
    net.w1.bind(&w1).unwrap();
    net.b1.bind(&b1).unwrap();
    net.w2.bind(&w2).unwrap();
    net.x.bind(&x).unwrap();

    let mut compiled = compile_graph_with(&mut g, net.root, &no_gradients(), &Interpreter).unwrap();
    for (a, b) in [(0.0, 0.0), (0.0, 1.0), (1.0, 0.0), (1.0, 1.0)] {
        x.copy_from(&[a, b]);
        compiled.execute().unwrap();
        let expected = if a != b { 1.0 } else { 0.0 };
        assert_eq!(compiled.output(), &[expected], "xor({a}, {b})");
    }
}

#[test]
fn rebinding_between_executions() {
    let mut g = Graph::new();
    let x = g.input(&[2]).unwrap();
    let root = g.square(x.id()).unwrap();
    let mut compiled = compile_graph_with(&mut g, root, &no_gradients(), &Interpreter).unwrap();

    let first = TensorData::new(vec![1.0, 2.0]);
    x.bind(&first).unwrap();
    compiled.execute().unwrap();
    assert_eq!(compiled.output(), &[1.0, 4.0]);

    let second = TensorData::new(vec![3.0, -4.0]);
    x.bind(&second).unwrap();
    compiled.execute().unwrap();
    assert_eq!(compiled.output(), &[9.0, 16.0]);

    drop(second);
    assert_eq!(
        compiled.execute().unwrap_err(),
        ExecuteError::Unbound { node: x.id() }
    );
}

#[test]
fn shared_storage_is_passed_once() {
    let mut g = Graph::new();
    let a = g.input(&[3]).unwrap();
    let b = g.input(&[3]).unwrap();
    let root = g.sub(a.id(), b.id()).unwrap();
    let data = TensorData::new(vec![1.0, 2.0, 3.0]);
    a.bind(&data).unwrap();
    b.bind(&data).unwrap();

    let mut compiled = compile_graph_with(&mut g, root, &no_gradients(), &Interpreter).unwrap();
    compiled.execute().unwrap();
    assert_eq!(compiled.output(), &[0.0, 0.0, 0.0]);
}

/// Applies `w := value(w)` once through a hand-built program whose output is
/// the pre-update copy of `w`.
fn update_once(
    rows: usize,
    cols: usize,
    initial: Vec<f64>,
    build: impl FnOnce(&mut Graph, gradforge::NodeId) -> gradforge::NodeId,
) -> (Vec<f64>, Vec<f64>) {
    let mut g = Graph::new();
    let w = g.weight(&[rows, cols]).unwrap();
    let value = build(&mut g, w.id());
    let wd = TensorData::new(initial);
    w.bind(&wd).unwrap();

    let mut builder = ProgramBuilder::new(&g);
    builder.output(w.id()).unwrap();
    builder.update_in_place(w.id(), value).unwrap();
    let program = builder.finish().unwrap();

    let mut module = compile(program, &Interpreter).unwrap();
    module.execute().unwrap();
    (module.output().to_vec(), wd.to_vec())
}

#[test]
fn in_place_transpose_reads_the_old_values() {
    let (before, after) = update_once(2, 2, vec![1.0, 2.0, 3.0, 4.0], |g, w| {
        g.transpose(w).unwrap()
    });
    assert_eq!(before, vec![1.0, 2.0, 3.0, 4.0]);
    assert_eq!(after, vec![1.0, 3.0, 2.0, 4.0]);
}

#[test]
fn in_place_update_mixing_aligned_and_transposed_reads() {
    let (_, after) = update_once(2, 3, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], |g, w| {
        let flat = g.reshape(w, &[3, 2]).unwrap();
        let t = g.transpose(flat).unwrap();
        g.add(w, t).unwrap()
    });
    // [[1,2,3],[4,5,6]] + [[1,3,5],[2,4,6]]
    assert_eq!(after, vec![2.0, 5.0, 8.0, 6.0, 9.0, 12.0]);
}

#[test]
fn in_place_update_with_same_index_reads() {
    let (_, after) = update_once(1, 3, vec![1.0, 2.0, 3.0], |g, w| {
        let two = g.constant(2.0);
        let scaled = g.mul(w, two).unwrap();
        g.sub(scaled, w).unwrap()
    });
    assert_eq!(after, vec![1.0, 2.0, 3.0]);
}

#[cfg(feature = "autodiff")]
mod gradients {
    use super::*;

    fn with_gradients(targets: &[gradforge::NodeId]) -> CompileOptions {
        CompileOptions {
            gradients: targets.to_vec(),
            ..CompileOptions::default()
        }
    }

    #[test]
    fn linear_gradient_is_the_input() {
        let mut g = Graph::new();
        let x = g.input(&[3]).unwrap();
        let w = g.weight(&[3]).unwrap();
        let prod = g.mul(w.id(), x.id()).unwrap();
        let root = g.sum_all(prod).unwrap();
        let xd = TensorData::new(vec![2.0, -1.0, 0.5]);
        let wd = TensorData::new(vec![1.0, 1.0, 1.0]);
        x.bind(&xd).unwrap();
        w.bind(&wd).unwrap();

        let opts = with_gradients(&[w.id()]);
        let mut compiled = compile_graph_with(&mut g, root, &opts, &Interpreter).unwrap();
        compiled.execute().unwrap();
        assert_eq!(compiled.output(), &[1.5]);
        assert_eq!(compiled.gradient(w.id()).unwrap(), &[2.0, -1.0, 0.5]);
        assert!(compiled.gradient(x.id()).is_none());
    }

    #[test]
    fn sin_gradient_is_cosine() {
        let mut g = Graph::new();
        let w = g.weight(&[4]).unwrap();
        let root = g.sin(w.id()).unwrap();
        let points = vec![0.0, 0.5, 1.0, 2.5];
        let wd = TensorData::new(points.clone());
        w.bind(&wd).unwrap();

        let opts = with_gradients(&[w.id()]);
        let mut compiled = compile_graph_with(&mut g, root, &opts, &Interpreter).unwrap();
        compiled.execute().unwrap();
        let expected: Vec<f64> = points.iter().map(|p| p.cos()).collect();
        assert_close(compiled.gradient(w.id()).unwrap(), &expected, 1e-12);
    }

    #[test]
    fn elementwise_max_routes_ties_to_first_operand() {
        let mut g = Graph::new();
        let a = g.weight(&[3]).unwrap();
        let b = g.weight(&[3]).unwrap();
        let m = g.max(a.id(), b.id()).unwrap();
        let root = g.sum_all(m).unwrap();
        let ad = TensorData::new(vec![1.0, 3.0, 2.0]);
        let bd = TensorData::new(vec![1.0, 2.0, 5.0]);
        a.bind(&ad).unwrap();
        b.bind(&bd).unwrap();

        let opts = with_gradients(&[a.id(), b.id()]);
        let mut compiled = compile_graph_with(&mut g, root, &opts, &Interpreter).unwrap();
        compiled.execute().unwrap();
        assert_eq!(compiled.gradient(a.id()).unwrap(), &[1.0, 1.0, 0.0]);
        assert_eq!(compiled.gradient(b.id()).unwrap(), &[0.0, 0.0, 1.0]);
    }

    #[test]
    fn reduce_max_gradient_is_shared_between_ties() {
        let mut g = Graph::new();
        let w = g.weight(&[4]).unwrap();
        let root = g.max_reduce(w.id(), &[0]).unwrap();
        let wd = TensorData::new(vec![1.0, 4.0, 4.0, 2.0]);
        w.bind(&wd).unwrap();

        let opts = with_gradients(&[w.id()]);
        let mut compiled = compile_graph_with(&mut g, root, &opts, &Interpreter).unwrap();
        compiled.execute().unwrap();
        assert_eq!(compiled.output(), &[4.0]);
        assert_eq!(compiled.gradient(w.id()).unwrap(), &[0.0, 0.5, 0.5, 0.0]);

        wd.copy_from(&[2.0, 2.0, 1.0, 2.0]);
        compiled.execute().unwrap();
        let grad = compiled.gradient(w.id()).unwrap();
        assert_close(grad, &[1.0 / 3.0, 1.0 / 3.0, 0.0, 1.0 / 3.0], 1e-15);
        let total: f64 = grad.iter().sum();
        assert_close(&[total], &[1.0], 1e-15);
    }

    #[test]
    fn reduce_max_gradient_per_row() {
        let mut g = Graph::new();
        let w = g.weight(&[2, 3]).unwrap();
        let m = g.max_reduce(w.id(), &[1]).unwrap();
        let root = g.sum_all(m).unwrap();
        let wd = TensorData::new(vec![3.0, 1.0, 3.0, 0.0, 2.0, 1.0]);
        w.bind(&wd).unwrap();

        let opts = with_gradients(&[w.id()]);
        let mut compiled = compile_graph_with(&mut g, root, &opts, &Interpreter).unwrap();
        compiled.execute().unwrap();
        assert_eq!(compiled.output(), &[5.0]);
        assert_eq!(
            compiled.gradient(w.id()).unwrap(),
            &[0.5, 0.0, 0.5, 0.0, 1.0, 0.0]
        );
    }

    /// Centered differences of the summed output with respect to every
    /// element bound through `data`.
    fn finite_difference(compiled: &mut gradforge::CompiledGraph, data: &TensorData) -> Vec<f64> {
        const H: f64 = 1e-5;
        (0..data.len())
            .map(|i| {
                let original = data.get(i);
                data.set(i, original + H);
                compiled.execute().unwrap();
                let plus: f64 = compiled.output().iter().sum();
                data.set(i, original - H);
                compiled.execute().unwrap();
                let minus: f64 = compiled.output().iter().sum();
                data.set(i, original);
                (plus - minus) / (2.0 * H)
            })
            .collect()
    }

    /// Compiles `combine(a, b)` with gradients for both operands and checks
    /// each against finite differences.
    fn check_binary_rule(
        lhs: Vec<f64>,
        rhs: Vec<f64>,
        combine: fn(&mut Graph, gradforge::NodeId, gradforge::NodeId) -> gradforge::NodeId,
    ) {
        let mut g = Graph::new();
        let a = g.weight(&[lhs.len()]).unwrap();
        let b = g.weight(&[rhs.len()]).unwrap();
        let root = combine(&mut g, a.id(), b.id());
        let ad = TensorData::new(lhs);
        let bd = TensorData::new(rhs);
        a.bind(&ad).unwrap();
        b.bind(&bd).unwrap();

        let opts = with_gradients(&[a.id(), b.id()]);
        let mut compiled = compile_graph_with(&mut g, root, &opts, &Interpreter).unwrap();
        compiled.execute().unwrap();
        let da = compiled.gradient(a.id()).unwrap().to_vec();
        let db = compiled.gradient(b.id()).unwrap().to_vec();

        assert_close(&da, &finite_difference(&mut compiled, &ad), 1e-6);
        assert_close(&db, &finite_difference(&mut compiled, &bd), 1e-6);
    }

    #[test]
    fn quotient_rule_matches_finite_differences() {
        check_binary_rule(vec![1.5, -2.0, 0.7], vec![0.8, 1.3, -2.5], |g, a, b| {
            g.div(a, b).unwrap()
        });
    }

    #[test]
    fn power_rule_matches_finite_differences() {
        check_binary_rule(vec![1.5, 0.7, 2.0], vec![2.0, -1.5, 0.5], |g, x, y| {
            g.pow(x, y).unwrap()
        });
    }

    #[test]
    fn log_gradient_is_the_reciprocal() {
        let mut g = Graph::new();
        let w = g.weight(&[3]).unwrap();
        let root = g.log(w.id()).unwrap();
        let wd = TensorData::new(vec![0.5, 2.0, 3.0]);
        w.bind(&wd).unwrap();

        let opts = with_gradients(&[w.id()]);
        let mut compiled = compile_graph_with(&mut g, root, &opts, &Interpreter).unwrap();
        compiled.execute().unwrap();
        let grad = compiled.gradient(w.id()).unwrap().to_vec();
        assert_close(&grad, &[2.0, 0.5, 1.0 / 3.0], 1e-15);
        assert_close(&grad, &finite_difference(&mut compiled, &wd), 1e-6);
    }

    #[test]
    fn matmul_gradients_are_transposed_products() {
        let mut g = Graph::new();
        let a = g.weight(&[2, 3]).unwrap();
        let b = g.weight(&[3]).unwrap();
        let y = g.matmul(a.id(), b.id()).unwrap();
        let root = g.sum_all(y).unwrap();
        let ad = TensorData::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let bd = TensorData::new(vec![1.0, 0.0, -1.0]);
        a.bind(&ad).unwrap();
        b.bind(&bd).unwrap();

        let opts = with_gradients(&[a.id(), b.id()]);
        let mut compiled = compile_graph_with(&mut g, root, &opts, &Interpreter).unwrap();
        compiled.execute().unwrap();
        assert_eq!(compiled.output(), &[-4.0]);
        // d/dA = 1 * b^T for every row; d/db = column sums of A.
        assert_eq!(
            compiled.gradient(a.id()).unwrap(),
            &[1.0, 0.0, -1.0, 1.0, 0.0, -1.0]
        );
        assert_eq!(compiled.gradient(b.id()).unwrap(), &[5.0, 7.0, 9.0]);
    }

    #[test]
    fn broadcast_gradient_sums_over_batch() {
        let mut g = Graph::new();
        let x = g.input(&[3, 2]).unwrap();
        let bias = g.weight(&[2]).unwrap();
        let shifted = g.add(x.id(), bias.id()).unwrap();
        let root = g.square(shifted).unwrap();
        let xd = TensorData::new(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let bd = TensorData::new(vec![0.0, 1.0]);
        x.bind(&xd).unwrap();
        bias.bind(&bd).unwrap();

        let opts = with_gradients(&[bias.id()]);
        let mut compiled = compile_graph_with(&mut g, root, &opts, &Interpreter).unwrap();
        compiled.execute().unwrap();
        // 2 * sum over rows of (x + bias)
        assert_eq!(compiled.gradient(bias.id()).unwrap(), &[18.0, 30.0]);
    }
}
