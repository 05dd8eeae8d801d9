/// Forward sensitivity: the R-operator mirror of the sequence graph.
///
/// Given a direction v in parameter space, every buffer also carries
///   R{z} = d/dε z(θ + ε v) at ε = 0.
/// Outputs and states thus expose their directional derivatives, and the
/// mirrored reverse sweep returns the Hessian-vector product H v in
/// `Gradients::r_params` next to the ordinary gradient.
///
/// Caller-supplied start states and inputs are constants along v: their
/// sensitivity is zero.

use crate::cell::Cell;
use crate::error::HebbError;
use crate::pool::StartState;
use crate::sequence::SequenceGraph;
use crate::tape::Tape;

impl SequenceGraph {
    /// Empty graph whose parameters move along `direction` (one vector per
    /// cell tensor, in `Cell::tensors` order).
    pub fn with_direction(cell: &dyn Cell, starts: &[StartState], direction: &[Vec<f64>]) -> Result<Self, HebbError> {
        Self::build(cell, starts, Tape::with_sensitivity(), Some(direction))
    }

    /// `run_from` on a sensitivity tape.
    pub fn run_r(
        cell: &dyn Cell,
        starts: &[StartState],
        sequences: &[Vec<Vec<f64>>],
        direction: &[Vec<f64>],
    ) -> Result<Self, HebbError> {
        let mut graph = Self::with_direction(cell, starts, direction)?;
        graph.forward_all(sequences)?;
        Ok(graph)
    }

    pub fn has_sensitivity(&self) -> bool {
        self.tape.has_sensitivity()
    }

    /// R{output} emitted by `step` of `member`.
    pub fn output_r(&self, member: usize, step: usize) -> Result<&[f64], HebbError> {
        let id = self.output_id(member, step)?;
        self.tape.buf_r(id).ok_or(HebbError::NoSensitivity)
    }

    pub fn outputs_r(&self, member: usize) -> Result<Vec<Vec<f64>>, HebbError> {
        let len = self.len(member)?;
        (0..len).map(|k| self.output_r(member, k).map(<[f64]>::to_vec)).collect()
    }

    /// R{state} emitted by `step` of `member`, one slice per state tensor.
    pub fn state_r(&self, member: usize, step: usize) -> Result<Vec<&[f64]>, HebbError> {
        let ids = self.state_ids(member, step)?;
        ids.iter().map(|&id| self.tape.buf_r(id).ok_or(HebbError::NoSensitivity)).collect()
    }
}
