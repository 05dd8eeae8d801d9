//! Forward sensitivity and Hessian-vector products against finite differences.

use hebbnet_core::cell::{Cell, CellStack};
use hebbnet_core::dense::{DenseLayer, TraceRunner};
use hebbnet_core::gradient::{compute_gradients, hessian_vector_product, Batch};
use hebbnet_core::model::{DenseConfig, DenseTensor, RateMode};
use hebbnet_core::pool::StartState;
use hebbnet_core::sequence::SequenceGraph;

const EPS: f64 = 1e-6;

fn make_seq(steps: usize, width: usize, seed: usize) -> Vec<Vec<f64>> {
    (0..steps)
        .map(|t| {
            (0..width)
                .map(|c| (((seed * 13 + t * 7 + c * 5) as f64) * 0.57).sin() * 0.9)
                .collect()
        })
        .collect()
}

fn make_layer(use_activation: bool, rate_mode: RateMode, seed: u64) -> DenseLayer {
    let cfg = DenseConfig { use_activation, rate_mode, ..DenseConfig::test_config() };
    let mut layer = DenseLayer::new(cfg, seed).unwrap();
    let p = layer.params_mut();
    for (i, v) in p.plasticities.iter_mut().enumerate() {
        *v = 0.3 * ((i as f64) * 0.9 + 0.4).sin();
    }
    for (i, v) in p.init_trace.iter_mut().enumerate() {
        *v = 0.15 * ((i as f64) * 1.7).cos();
    }
    layer
}

fn make_direction(cell: &dyn Cell, seed: usize) -> Vec<Vec<f64>> {
    cell.tensors()
        .iter()
        .enumerate()
        .map(|(k, t)| (0..t.len()).map(|i| (((seed + k * 3 + i) as f64) * 0.77).cos()).collect())
        .collect()
}

fn perturbed<C: Cell + Clone>(cell: &C, dir: &[Vec<f64>], scale: f64) -> C {
    let mut c = cell.clone();
    c.apply_update(dir, scale).unwrap();
    c
}

fn assert_close(a: &[f64], b: &[f64], tol: f64, msg: &str) {
    assert_eq!(a.len(), b.len(), "{msg}: length");
    for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
        assert!((x - y).abs() <= tol * (1.0 + y.abs()), "{msg}[{i}]: {x} vs {y}");
    }
}

#[test]
fn test_output_and_state_sensitivity_match_fd() {
    for (use_activation, rate_mode) in [
        (true, RateMode::Shared),
        (false, RateMode::Shared),
        (true, RateMode::PerConnection),
        (false, RateMode::PerConnection),
    ] {
        let layer = make_layer(use_activation, rate_mode, 21);
        let dir = make_direction(&layer, 1);
        let xs = make_seq(5, 3, 2);
        let graph = SequenceGraph::run_r(&layer, &[StartState::Learned], &[xs.clone()], &dir).unwrap();
        assert!(graph.has_sensitivity());

        let plus = perturbed(&layer, &dir, EPS);
        let minus = perturbed(&layer, &dir, -EPS);
        let mut rp = TraceRunner::new(&plus);
        let mut rm = TraceRunner::new(&minus);
        for (t, x) in xs.iter().enumerate() {
            let yp = rp.step_time(x).unwrap();
            let ym = rm.step_time(x).unwrap();
            let fd_y: Vec<f64> = yp.iter().zip(ym.iter()).map(|(a, b)| (a - b) / (2.0 * EPS)).collect();
            let fd_t: Vec<f64> = rp.trace().iter().zip(rm.trace().iter()).map(|(a, b)| (a - b) / (2.0 * EPS)).collect();
            let label = format!("{use_activation}/{rate_mode:?} t={t}");
            assert_close(graph.output_r(0, t).unwrap(), &fd_y, 1e-6, &format!("R y {label}"));
            assert_close(graph.state_r(0, t).unwrap()[0], &fd_t, 1e-6, &format!("R T {label}"));
        }
    }
}

#[test]
fn test_hessian_vector_product_matches_gradient_difference() {
    for (use_activation, rate_mode) in [(true, RateMode::Shared), (false, RateMode::PerConnection)] {
        let layer = make_layer(use_activation, rate_mode, 22);
        let dir = make_direction(&layer, 4);
        let batch = Batch::learned(
            vec![make_seq(4, 3, 1), make_seq(2, 3, 2), make_seq(3, 3, 3)],
            vec![make_seq(4, 2, 11), make_seq(2, 2, 12), make_seq(3, 2, 13)],
        );

        let (loss, hv) = hessian_vector_product(&layer, &batch, &dir).unwrap();
        let r_params = hv.r_params.clone().unwrap();

        let (_, gp) = compute_gradients(&perturbed(&layer, &dir, EPS), &batch).unwrap();
        let (_, gm) = compute_gradients(&perturbed(&layer, &dir, -EPS), &batch).unwrap();
        for t in DenseTensor::ALL {
            let fd: Vec<f64> = gp.params[t.index()]
                .iter()
                .zip(gm.params[t.index()].iter())
                .map(|(a, b)| (a - b) / (2.0 * EPS))
                .collect();
            assert_close(&r_params[t.index()], &fd, 1e-5, &format!("Hv {} ({use_activation}, {rate_mode:?})", t.name()));
        }

        // The first-order half of the mirrored sweep is the ordinary sweep.
        let (loss_plain, plain) = compute_gradients(&layer, &batch).unwrap();
        assert_eq!(loss, loss_plain);
        assert_eq!(hv.params, plain.params);
        // Pooled start state carries the init_trace row of Hv.
        let start_r = hv.start_states[0].r_grads.as_ref().unwrap();
        assert_eq!(start_r[0], r_params[DenseTensor::InitTrace.index()]);
    }
}

#[test]
fn test_zero_direction_gives_zero_sensitivity() {
    let layer = make_layer(true, RateMode::PerConnection, 23);
    let zero: Vec<Vec<f64>> = layer.tensors().iter().map(|t| vec![0.0; t.len()]).collect();
    let batch = Batch::learned(vec![make_seq(4, 3, 5)], vec![make_seq(4, 2, 6)]);
    let graph = SequenceGraph::run_r(&layer, &batch.starts, &batch.inputs, &zero).unwrap();
    for t in 0..4 {
        assert!(graph.output_r(0, t).unwrap().iter().all(|&v| v == 0.0));
    }
    let (_, hv) = hessian_vector_product(&layer, &batch, &zero).unwrap();
    assert!(hv.r_params.unwrap().iter().flatten().all(|&v| v == 0.0));
}

#[test]
fn test_given_start_has_zero_sensitivity() {
    // Moving only init_trace cannot move a member that starts elsewhere.
    let layer = make_layer(true, RateMode::Shared, 24);
    let mut dir: Vec<Vec<f64>> = layer.tensors().iter().map(|t| vec![0.0; t.len()]).collect();
    dir[DenseTensor::InitTrace.index()] = vec![1.0; 6];
    let xs = make_seq(3, 3, 7);
    let starts = [StartState::Learned, StartState::Given(vec![vec![0.1; 6]])];
    let graph = SequenceGraph::run_r(&layer, &starts, &[xs.clone(), xs], &dir).unwrap();
    for t in 0..3 {
        assert!(graph.output_r(0, t).unwrap().iter().any(|&v| v != 0.0), "learned member t={t}");
        assert!(graph.output_r(1, t).unwrap().iter().all(|&v| v == 0.0), "given member t={t}");
    }
}

#[test]
fn test_stack_hessian_vector_product() {
    let lower = DenseLayer::new(DenseConfig { input_count: 3, output_count: 3, ..DenseConfig::test_config() }, 30).unwrap();
    let upper = DenseLayer::new(DenseConfig { input_count: 3, output_count: 2, ..DenseConfig::per_connection_test_config() }, 31).unwrap();
    let build = |l: &DenseLayer, u: &DenseLayer| {
        let layers: Vec<Box<dyn Cell>> = vec![Box::new(l.clone()), Box::new(u.clone())];
        CellStack::new(layers).unwrap()
    };
    let stack = build(&lower, &upper);
    let dir = make_direction(&stack, 9);
    let batch = Batch::learned(vec![make_seq(3, 3, 8), make_seq(2, 3, 9)], vec![make_seq(3, 2, 18), make_seq(2, 2, 19)]);
    let (_, hv) = hessian_vector_product(&stack, &batch, &dir).unwrap();
    let r_params = hv.r_params.unwrap();

    let grads_at = |scale: f64| {
        let mut s = build(&lower, &upper);
        s.apply_update(&dir, scale).unwrap();
        compute_gradients(&s, &batch).unwrap().1
    };
    let gp = grads_at(EPS);
    let gm = grads_at(-EPS);
    for k in 0..stack.tensor_count() {
        let fd: Vec<f64> = gp.params[k].iter().zip(gm.params[k].iter()).map(|(a, b)| (a - b) / (2.0 * EPS)).collect();
        assert_close(&r_params[k], &fd, 1e-5, &format!("stack Hv tensor {k}"));
    }
}
