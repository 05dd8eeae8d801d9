/// Reverse sweep over a sequence graph.
///
/// Ticks are replayed strictly last to first. Before a tick's segment runs,
/// caller-supplied upstream gradients are written into the outputs and states
/// that tick emitted. An upstream value REPLACES whatever gradient is pending
/// at that node; nodes without one keep the value carried back from later
/// steps. The bind-time prelude (the gate) is replayed last, after every tick
/// has deposited into it.
///
/// No normalization by batch size: every member contributes at full weight.

use std::collections::HashMap;

use tracing::{debug, trace};

use crate::error::{expect_len, HebbError};
use crate::pool::StateKey;
use crate::sequence::SequenceGraph;
use crate::tape::BufId;
use crate::tensor;

/// Gradient seed for one node, with its R-operator image on a sensitivity
/// graph. A missing `r_grad` seeds zero.
#[derive(Clone, Debug, PartialEq)]
pub struct Seed {
    pub grad: Vec<f64>,
    pub r_grad: Option<Vec<f64>>,
}

impl Seed {
    pub fn new(grad: Vec<f64>) -> Self {
        Seed { grad, r_grad: None }
    }

    pub fn with_r(grad: Vec<f64>, r_grad: Vec<f64>) -> Self {
        Seed { grad, r_grad: Some(r_grad) }
    }
}

/// Upstream gradients keyed by (member, step).
#[derive(Clone, Debug, Default)]
pub struct Upstream {
    outputs: HashMap<(usize, usize), Seed>,
    states: HashMap<(usize, usize), Vec<Seed>>,
}

impl Upstream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Gradient for the output emitted by `step` of `member`.
    pub fn output(mut self, member: usize, step: usize, grad: Vec<f64>) -> Self {
        self.outputs.insert((member, step), Seed::new(grad));
        self
    }

    pub fn output_r(mut self, member: usize, step: usize, grad: Vec<f64>, r_grad: Vec<f64>) -> Self {
        self.outputs.insert((member, step), Seed::with_r(grad, r_grad));
        self
    }

    /// Gradient for the state emitted by `step`, one vector per state tensor.
    pub fn state(mut self, member: usize, step: usize, grads: Vec<Vec<f64>>) -> Self {
        self.states.insert((member, step), grads.into_iter().map(Seed::new).collect());
        self
    }

    pub fn state_r(mut self, member: usize, step: usize, grads: Vec<Vec<f64>>, r_grads: Vec<Vec<f64>>) -> Self {
        let seeds = grads.into_iter().zip(r_grads).map(|(g, r)| Seed::with_r(g, r)).collect();
        self.states.insert((member, step), seeds);
        self
    }

    /// In-place counterpart of `output`, for building seeds in a loop.
    pub fn set_output(&mut self, member: usize, step: usize, seed: Seed) {
        self.outputs.insert((member, step), seed);
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty() && self.states.is_empty()
    }
}

/// Gradient with respect to one pooled start state.
#[derive(Clone, Debug, PartialEq)]
pub struct StartGradient {
    pub key: StateKey,
    /// Members that started from this state.
    pub members: Vec<usize>,
    /// One vector per state tensor.
    pub grads: Vec<Vec<f64>>,
    pub r_grads: Option<Vec<Vec<f64>>>,
}

/// Result of a reverse sweep.
///
/// `params` follows `Cell::tensors` order. For the learned start state the
/// corresponding `start_states` entry repeats the init-state parameter
/// gradient, since that parameter is the start state.
#[derive(Clone, Debug, PartialEq)]
pub struct Gradients {
    pub params: Vec<Vec<f64>>,
    /// Hessian-vector products along the graph's direction.
    pub r_params: Option<Vec<Vec<f64>>>,
    pub start_states: Vec<StartGradient>,
}

fn add_into(dst: &mut [Vec<f64>], src: &[Vec<f64>]) {
    for (d, s) in dst.iter_mut().zip(src.iter()) {
        tensor::axpy_f64(1.0, s, d);
    }
}

impl Gradients {
    /// Merge the gradients of another sweep over the same cell. Start-state
    /// entries with equal keys are summed; others are appended.
    pub fn accumulate(&mut self, other: &Gradients) -> Result<(), HebbError> {
        expect_len("parameter gradient list", self.params.len(), other.params.len())?;
        for (a, b) in self.params.iter().zip(other.params.iter()) {
            expect_len("parameter gradient", a.len(), b.len())?;
        }
        add_into(&mut self.params, &other.params);
        self.r_params = match (self.r_params.take(), &other.r_params) {
            (Some(mut mine), Some(theirs)) => {
                add_into(&mut mine, theirs);
                Some(mine)
            }
            _ => None,
        };
        for theirs in &other.start_states {
            match self.start_states.iter_mut().find(|s| s.key == theirs.key) {
                Some(mine) => {
                    add_into(&mut mine.grads, &theirs.grads);
                    mine.members.extend_from_slice(&theirs.members);
                    mine.r_grads = match (mine.r_grads.take(), &theirs.r_grads) {
                        (Some(mut m), Some(t)) => {
                            add_into(&mut m, t);
                            Some(m)
                        }
                        _ => None,
                    };
                }
                None => self.start_states.push(theirs.clone()),
            }
        }
        Ok(())
    }

    /// Start-state gradient that `member` contributed to.
    pub fn start_state(&self, member: usize) -> Option<&StartGradient> {
        self.start_states.iter().find(|s| s.members.contains(&member))
    }

    pub fn param(&self, index: usize) -> &[f64] {
        &self.params[index]
    }

    /// Sum of squares over every parameter gradient.
    pub fn norm_sq(&self) -> f64 {
        self.params.iter().map(|g| tensor::dot_f64(g, g)).sum()
    }
}

impl SequenceGraph {
    fn check_upstream(&self, upstream: &Upstream) -> Result<(), HebbError> {
        let out_n = self.output_count();
        for (&(m, step), seed) in &upstream.outputs {
            self.output_id(m, step)?;
            expect_len("output gradient", out_n, seed.grad.len())?;
            if let Some(r) = &seed.r_grad {
                expect_len("output R-gradient", out_n, r.len())?;
            }
        }
        let sizes = self.cell.state_sizes();
        for (&(m, step), seeds) in &upstream.states {
            self.state_ids(m, step)?;
            expect_len("state gradient tensors", sizes.len(), seeds.len())?;
            for (seed, &n) in seeds.iter().zip(sizes.iter()) {
                expect_len("state gradient", n, seed.grad.len())?;
                if let Some(r) = &seed.r_grad {
                    expect_len("state R-gradient", n, r.len())?;
                }
            }
        }
        Ok(())
    }

    fn seed(&mut self, id: BufId, seed: &Seed) {
        if self.tape.has_sensitivity() {
            let r = seed.r_grad.clone().unwrap_or_else(|| vec![0.0; seed.grad.len()]);
            self.tape.set_grad_r(id, seed.grad.clone(), r);
        } else {
            self.tape.set_grad(id, seed.grad.clone());
        }
    }

    /// Consume the graph and sweep it backward.
    pub fn backward(mut self, upstream: &Upstream) -> Result<Gradients, HebbError> {
        self.check_upstream(upstream)?;

        let ticks = std::mem::take(&mut self.ticks);
        for (t, tick) in ticks.iter().enumerate().rev() {
            for &(m, step) in &tick.members {
                if let Some(seed) = upstream.outputs.get(&(m, step)) {
                    let id = self.members[m].outputs[step];
                    self.seed(id, seed);
                }
                if let Some(seeds) = upstream.states.get(&(m, step)) {
                    let ids = self.members[m].states[step + 1].clone();
                    for (&id, seed) in ids.iter().zip(seeds.iter()) {
                        self.seed(id, seed);
                    }
                }
            }
            trace!(tick = t, members = tick.members.len(), ops = tick.ops.len(), "replaying tick");
            self.tape.backward_ops(tick.ops.clone());
        }
        self.tape.backward_ops(self.prelude.clone());

        let sensitivity = self.tape.has_sensitivity();
        let params: Vec<Vec<f64>> = self.cell.params().iter().map(|&id| self.tape.get_param_grad(id)).collect();
        let r_params = if sensitivity {
            Some(self.cell.params().iter().map(|&id| self.tape.get_param_grad_r(id)).collect())
        } else {
            None
        };
        let start_states = self
            .pool
            .slots()
            .iter()
            .map(|slot| StartGradient {
                key: slot.key,
                members: slot.members.clone(),
                grads: slot.states.iter().map(|&id| self.tape.grad_or_zeros(id)).collect(),
                r_grads: if sensitivity {
                    Some(slot.states.iter().map(|&id| self.tape.grad_r_or_zeros(id)).collect())
                } else {
                    None
                },
            })
            .collect();

        debug!(
            ticks = ticks.len(),
            members = self.members.len(),
            slots = self.pool.len(),
            seeds = upstream.outputs.len() + upstream.states.len(),
            "backward complete"
        );
        Ok(Gradients { params, r_params, start_states })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense::DenseLayer;
    use crate::model::{DenseConfig, DenseParams};
    use crate::pool::StartState;

    fn scenario_layer() -> DenseLayer {
        let params = DenseParams {
            trace_rate: vec![0.0],
            weights: vec![2.0],
            biases: vec![0.0],
            plasticities: vec![1.0],
            init_trace: vec![0.0],
        };
        DenseLayer::from_parts(DenseConfig::scenario_config(), params).unwrap()
    }

    #[test]
    fn test_scenario_output_gradients_by_hand() {
        // y0 = W x0 + b, T1 = k T0 + r y0 x0, y1 = W x1 + b + P T1 x1
        // with x = 1, T0 = 0, r = k = 0.5:
        //   dy1/dW = 1 + P r = 1.5, dy0/dW = 1  → d(y0 + y1)/dW = 2.5
        //   dy1/db = 1 + 0.5                     → 2.5
        //   dy1/dP = T1 = 1                      → 1
        //   dy0/dT0 = P x0 = 1, dT1/dT0 = k + r P = 1, dy1/dT1 = 1
        //                                        → init_trace grad 2
        let layer = scenario_layer();
        let graph = SequenceGraph::run(&layer, &[vec![vec![1.0], vec![1.0]]]).unwrap();
        let up = Upstream::new().output(0, 0, vec![1.0]).output(0, 1, vec![1.0]);
        let grads = graph.backward(&up).unwrap();
        assert_eq!(grads.params[1], vec![2.5]);
        assert_eq!(grads.params[2], vec![2.5]);
        assert_eq!(grads.params[3], vec![1.0]);
        assert_eq!(grads.params[4], vec![2.0]);
        assert_eq!(grads.start_state(0).unwrap().grads, vec![vec![2.0]]);
        // drate: dT1/draw = (y0 x0 - T0) * s'(0) = 2 * 0.25; dy1/dT1 = 1
        assert_eq!(grads.params[0], vec![0.5]);
        assert!(grads.r_params.is_none());
    }

    #[test]
    fn test_upstream_validation() {
        let layer = scenario_layer();
        let graph = SequenceGraph::run(&layer, &[vec![vec![1.0]]]).unwrap();
        let err = graph.backward(&Upstream::new().output(0, 1, vec![1.0])).err().unwrap();
        assert!(matches!(err, HebbError::UnknownStep { member: 0, step: 1, len: 1 }));

        let graph = SequenceGraph::run(&layer, &[vec![vec![1.0]]]).unwrap();
        let err = graph.backward(&Upstream::new().output(3, 0, vec![1.0])).err().unwrap();
        assert!(matches!(err, HebbError::UnknownMember { member: 3, .. }));

        let graph = SequenceGraph::run(&layer, &[vec![vec![1.0]]]).unwrap();
        let err = graph.backward(&Upstream::new().state(0, 0, vec![vec![1.0, 2.0]])).err().unwrap();
        assert!(matches!(err, HebbError::ShapeMismatch { expected: 1, got: 2, .. }));
    }

    #[test]
    fn test_empty_upstream_gives_zero_gradients() {
        let layer = DenseLayer::new(DenseConfig::test_config(), 5).unwrap();
        let graph = SequenceGraph::run(&layer, &[vec![vec![0.1, 0.2, 0.3]; 3]]).unwrap();
        let grads = graph.backward(&Upstream::new()).unwrap();
        assert_eq!(grads.norm_sq(), 0.0);
    }

    #[test]
    fn test_accumulate_merges_matching_slots() {
        let layer = scenario_layer();
        let run = |x: f64| {
            let g = SequenceGraph::run(&layer, &[vec![vec![x]]]).unwrap();
            g.backward(&Upstream::new().output(0, 0, vec![1.0])).unwrap()
        };
        let mut total = run(1.0);
        total.accumulate(&run(2.0)).unwrap();
        // dy/dW = x
        assert_eq!(total.params[1], vec![3.0]);
        assert_eq!(total.start_states.len(), 1);
        assert_eq!(total.start_states[0].members, vec![0, 0]);

        let given = SequenceGraph::run_from(&layer, &[StartState::Given(vec![vec![0.0]])], &[vec![vec![1.0]]])
            .unwrap()
            .backward(&Upstream::new())
            .unwrap();
        total.accumulate(&given).unwrap();
        assert_eq!(total.start_states.len(), 2);
    }
}
