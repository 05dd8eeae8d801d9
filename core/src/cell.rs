/// Uniform recurrent-cell interface and vertical stacking.
///
/// A `Cell` owns parameters. Binding it to a tape registers those parameters
/// once and yields a `BoundCell`, which records one timestep at a time:
///
///   step(states, input) -> (new_states, output)
///
/// The sequence graph only speaks this interface, so a single dense layer
/// and a stack of layers are interchangeable.

use crate::error::HebbError;
use crate::tape::{BufId, Tape};
use crate::tensor;

/// A recurrent cell with learnable tensors.
///
/// Object safe; cells are passed around as `&dyn Cell` and `Box<dyn Cell>`.
pub trait Cell: Send + Sync {
    fn input_count(&self) -> usize;

    fn output_count(&self) -> usize;

    /// Learnable tensors in canonical order. Gradients and directions use the
    /// same order and shapes.
    fn tensors(&self) -> Vec<&[f64]>;

    fn tensors_mut(&mut self) -> Vec<&mut Vec<f64>>;

    fn tensor_count(&self) -> usize {
        self.tensors().len()
    }

    /// Register parameters on `tape` and record anything shared by every step
    /// of the sweep. `direction` supplies R{θ} for a sensitivity tape; it must
    /// match `tensors()` in count and shape.
    fn bind(&self, tape: &mut Tape, direction: Option<&[Vec<f64>]>) -> Result<Box<dyn BoundCell>, HebbError>;

    /// θ += scale * delta. The hook an external optimizer uses between sweeps.
    fn apply_update(&mut self, delta: &[Vec<f64>], scale: f64) -> Result<(), HebbError> {
        check_direction(&self.tensors(), delta)?;
        for (param, d) in self.tensors_mut().into_iter().zip(delta.iter()) {
            tensor::axpy_f64(scale, d, param);
        }
        Ok(())
    }
}

/// A cell whose parameters live on a tape.
pub trait BoundCell {
    /// Parameter handles, in `Cell::tensors` order.
    fn params(&self) -> &[BufId];

    /// Handles of the learned start states, one per state tensor.
    fn start_states(&self) -> Vec<BufId>;

    /// Length of each state tensor.
    fn state_sizes(&self) -> Vec<usize>;

    /// Record one timestep. Returns (new states, output).
    fn step(&self, tape: &mut Tape, states: &[BufId], input: BufId) -> (Vec<BufId>, BufId);
}

/// Check a per-tensor list (direction or update) against a cell's tensors.
pub fn check_direction(tensors: &[&[f64]], direction: &[Vec<f64>]) -> Result<(), HebbError> {
    if tensors.len() != direction.len() {
        return Err(HebbError::DirectionMismatch(format!(
            "{} tensors given, cell has {}", direction.len(), tensors.len()
        )));
    }
    for (i, (t, d)) in tensors.iter().zip(direction.iter()).enumerate() {
        if t.len() != d.len() {
            return Err(HebbError::DirectionMismatch(format!(
                "tensor {i} has {} values, cell tensor has {}", d.len(), t.len()
            )));
        }
    }
    Ok(())
}

// ── Stacking ─────────────────────────────────────────────────────────

/// Layers applied bottom to top within one timestep. The output of layer k is
/// the input of layer k+1; the stack's state is every layer's state in order.
pub struct CellStack {
    layers: Vec<Box<dyn Cell>>,
}

impl CellStack {
    pub fn new(layers: Vec<Box<dyn Cell>>) -> Result<Self, HebbError> {
        if layers.is_empty() {
            return Err(HebbError::EmptyStack);
        }
        for pair in layers.windows(2) {
            if pair[0].output_count() != pair[1].input_count() {
                return Err(HebbError::shape(
                    "stacked layer input", pair[0].output_count(), pair[1].input_count(),
                ));
            }
        }
        Ok(CellStack { layers })
    }

    pub fn layers(&self) -> &[Box<dyn Cell>] {
        &self.layers
    }

    pub fn depth(&self) -> usize {
        self.layers.len()
    }
}

impl Cell for CellStack {
    fn input_count(&self) -> usize {
        self.layers[0].input_count()
    }

    fn output_count(&self) -> usize {
        self.layers[self.layers.len() - 1].output_count()
    }

    fn tensors(&self) -> Vec<&[f64]> {
        self.layers.iter().flat_map(|l| l.tensors()).collect()
    }

    fn tensors_mut(&mut self) -> Vec<&mut Vec<f64>> {
        self.layers.iter_mut().flat_map(|l| l.tensors_mut()).collect()
    }

    fn bind(&self, tape: &mut Tape, direction: Option<&[Vec<f64>]>) -> Result<Box<dyn BoundCell>, HebbError> {
        if let Some(dir) = direction {
            check_direction(&self.tensors(), dir)?;
        }
        let mut bound = Vec::with_capacity(self.layers.len());
        let mut params = Vec::new();
        let mut state_split = Vec::with_capacity(self.layers.len());
        let mut offset = 0;
        for layer in &self.layers {
            let n = layer.tensor_count();
            let dir = direction.map(|d| &d[offset..offset + n]);
            offset += n;
            let b = layer.bind(tape, dir)?;
            params.extend_from_slice(b.params());
            state_split.push(b.state_sizes().len());
            bound.push(b);
        }
        Ok(Box::new(BoundStack { layers: bound, params, state_split }))
    }
}

struct BoundStack {
    layers: Vec<Box<dyn BoundCell>>,
    params: Vec<BufId>,
    /// Number of state tensors owned by each layer.
    state_split: Vec<usize>,
}

impl BoundCell for BoundStack {
    fn params(&self) -> &[BufId] {
        &self.params
    }

    fn start_states(&self) -> Vec<BufId> {
        self.layers.iter().flat_map(|l| l.start_states()).collect()
    }

    fn state_sizes(&self) -> Vec<usize> {
        self.layers.iter().flat_map(|l| l.state_sizes()).collect()
    }

    fn step(&self, tape: &mut Tape, states: &[BufId], input: BufId) -> (Vec<BufId>, BufId) {
        let mut new_states = Vec::with_capacity(states.len());
        let mut x = input;
        let mut offset = 0;
        for (layer, &n) in self.layers.iter().zip(self.state_split.iter()) {
            let (s, y) = layer.step(tape, &states[offset..offset + n], x);
            offset += n;
            new_states.extend(s);
            x = y;
        }
        (new_states, x)
    }
}
