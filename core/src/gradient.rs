/// Gradient orchestration and verification.
///
/// Provides:
/// - `compute_gradients`: loss and gradients of a cell over a batch
/// - `hessian_vector_product`: the same sweep on a sensitivity tape
/// - `finite_diff_gradient`: central finite differences for verification
/// - `check_tensor_gradient`: sampled analytic-vs-numeric comparison
///
/// The loss throughout is Σ_members Σ_steps ½‖y - target‖², unnormalized.

use tracing::warn;

use crate::cell::Cell;
use crate::error::{expect_len, HebbError};
use crate::loss::{half_squared_error, half_squared_error_r};
use crate::pool::StartState;
use crate::reverse::{Gradients, Seed, Upstream};
use crate::sequence::SequenceGraph;

/// Inputs and per-step targets for a batch of sequences.
#[derive(Clone, Debug)]
pub struct Batch {
    pub starts: Vec<StartState>,
    pub inputs: Vec<Vec<Vec<f64>>>,
    pub targets: Vec<Vec<Vec<f64>>>,
}

impl Batch {
    /// Every member starts from the learned start state.
    pub fn learned(inputs: Vec<Vec<Vec<f64>>>, targets: Vec<Vec<Vec<f64>>>) -> Self {
        Batch { starts: vec![StartState::Learned; inputs.len()], inputs, targets }
    }

    pub fn validate(&self) -> Result<(), HebbError> {
        expect_len("start states", self.inputs.len(), self.starts.len())?;
        expect_len("target sequences", self.inputs.len(), self.targets.len())?;
        for (x, t) in self.inputs.iter().zip(self.targets.iter()) {
            expect_len("target steps", x.len(), t.len())?;
        }
        Ok(())
    }

    fn run(&self, cell: &dyn Cell) -> Result<SequenceGraph, HebbError> {
        self.validate()?;
        SequenceGraph::run_from(cell, &self.starts, &self.inputs)
    }
}

/// Total loss over the batch.
pub fn batch_loss(cell: &dyn Cell, batch: &Batch) -> Result<f64, HebbError> {
    let graph = batch.run(cell)?;
    let mut total = 0.0;
    for (m, targets) in batch.targets.iter().enumerate() {
        for (t, target) in targets.iter().enumerate() {
            total += half_squared_error(graph.output(m, t)?, target)?.0;
        }
    }
    Ok(total)
}

/// Loss and gradients with respect to every cell tensor and start state.
pub fn compute_gradients(cell: &dyn Cell, batch: &Batch) -> Result<(f64, Gradients), HebbError> {
    let graph = batch.run(cell)?;
    let mut upstream = Upstream::new();
    let mut total = 0.0;
    for (m, targets) in batch.targets.iter().enumerate() {
        for (t, target) in targets.iter().enumerate() {
            let (loss, grad) = half_squared_error(graph.output(m, t)?, target)?;
            total += loss;
            upstream.set_output(m, t, Seed::new(grad));
        }
    }
    let grads = graph.backward(&upstream)?;
    Ok((total, grads))
}

/// Loss, gradients and H·direction. The product is in `Gradients::r_params`.
pub fn hessian_vector_product(cell: &dyn Cell, batch: &Batch, direction: &[Vec<f64>]) -> Result<(f64, Gradients), HebbError> {
    batch.validate()?;
    let graph = SequenceGraph::run_r(cell, &batch.starts, &batch.inputs, direction)?;
    let mut upstream = Upstream::new();
    let mut total = 0.0;
    for (m, targets) in batch.targets.iter().enumerate() {
        for (t, target) in targets.iter().enumerate() {
            let (loss, grad, r_grad) = half_squared_error_r(graph.output(m, t)?, graph.output_r(m, t)?, target)?;
            total += loss;
            upstream.set_output(m, t, Seed::with_r(grad, r_grad));
        }
    }
    let grads = graph.backward(&upstream)?;
    Ok((total, grads))
}

/// Central difference of the batch loss in one parameter element. The
/// element is restored exactly afterwards.
pub fn finite_diff_gradient(
    cell: &mut dyn Cell,
    batch: &Batch,
    tensor: usize,
    idx: usize,
    eps: f64,
) -> Result<f64, HebbError> {
    let orig = cell.tensors()[tensor][idx];

    cell.tensors_mut()[tensor][idx] = orig + eps;
    let loss_plus = batch_loss(cell, batch);
    cell.tensors_mut()[tensor][idx] = orig - eps;
    let loss_minus = batch_loss(cell, batch);
    cell.tensors_mut()[tensor][idx] = orig;

    Ok((loss_plus? - loss_minus?) / (2.0 * eps))
}

/// Outcome of a sampled gradient check.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GradCheck {
    pub checked: usize,
    pub passed: usize,
    pub max_rel_err: f64,
}

impl GradCheck {
    pub fn all_passed(&self) -> bool {
        self.passed == self.checked
    }
}

/// Below this magnitude both gradients count as zero.
const ABS_THRESHOLD: f64 = 1e-8;

/// Compare `grads.params[tensor]` against central differences on up to
/// `num_samples` evenly spaced elements.
#[allow(clippy::too_many_arguments)]
pub fn check_tensor_gradient(
    cell: &mut dyn Cell,
    batch: &Batch,
    grads: &Gradients,
    tensor: usize,
    name: &str,
    num_samples: usize,
    eps: f64,
    tol: f64,
) -> Result<GradCheck, HebbError> {
    let n = grads.params[tensor].len();
    let step = if num_samples > 0 && n > num_samples { n / num_samples } else { 1 };
    let mut check = GradCheck { checked: 0, passed: 0, max_rel_err: 0.0 };

    for idx in (0..n).step_by(step).take(num_samples) {
        let analytical = grads.params[tensor][idx];
        let numerical = finite_diff_gradient(cell, batch, tensor, idx, eps)?;

        let abs_diff = (analytical - numerical).abs();
        let denom = analytical.abs().max(numerical.abs());
        check.checked += 1;

        if denom < ABS_THRESHOLD {
            check.passed += 1;
            continue;
        }

        let rel_err = abs_diff / denom;
        if rel_err > check.max_rel_err {
            check.max_rel_err = rel_err;
        }
        if rel_err < tol || abs_diff < ABS_THRESHOLD {
            check.passed += 1;
        } else {
            warn!(tensor = name, idx, analytical, numerical, rel_err, "gradient check failed");
        }
    }
    Ok(check)
}
