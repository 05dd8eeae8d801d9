/// Hebbian-plastic dense recurrent layer.
///
/// Two coupled recurrences per timestep, for input x (length I):
///   y_raw = b + (W @ x + (P * T) @ x)
///   y     = tanh(y_raw) if use_activation, else y_raw
///   T'    = keep * T + rate * outer(y, x)
///
/// W, P, T are [O, I]. rate/keep come from the trace-rate gate and are either
/// one shared pair or one pair per connection. The visible output y is the
/// cell's output; the trace T is its state, starting from the learned
/// init_trace unless the caller supplies another start state.

use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::cell::{check_direction, BoundCell, Cell};
use crate::error::{expect_len, HebbError};
use crate::gate::{traced_gate, TraceGate};
use crate::model::{self, DenseConfig, DenseParams, DenseTensor, LayerCheckpoint, RateMode};
use crate::tape::{BufId, Tape};
use crate::tensor;
use crate::traced::{traced_add, traced_matvec, traced_mul, traced_outer, traced_scale_by, traced_tanh};

/// One dense Hebbian layer: configuration plus its five learnable tensors.
#[derive(Clone, Debug, PartialEq)]
pub struct DenseLayer {
    cfg: DenseConfig,
    params: DenseParams,
}

impl DenseLayer {
    /// Fresh layer; see `DenseParams::init` for the initialization.
    pub fn new(cfg: DenseConfig, seed: u64) -> Result<Self, HebbError> {
        let params = DenseParams::init(&cfg, seed)?;
        Ok(DenseLayer { cfg, params })
    }

    pub fn from_parts(cfg: DenseConfig, params: DenseParams) -> Result<Self, HebbError> {
        params.validate(&cfg)?;
        Ok(DenseLayer { cfg, params })
    }

    pub fn config(&self) -> &DenseConfig {
        &self.cfg
    }

    pub fn params(&self) -> &DenseParams {
        &self.params
    }

    /// Mutable parameter access for optimizers. Tensor lengths must not
    /// change; `bind` rejects a layer whose shapes were broken.
    pub fn params_mut(&mut self) -> &mut DenseParams {
        &mut self.params
    }

    pub fn rate_mode(&self) -> RateMode {
        self.cfg.rate_mode
    }

    /// Re-draw the raw trace rates so the decoded rates fall in [min, max].
    pub fn init_rates(&mut self, min: f64, max: f64, seed: u64) -> Result<(), HebbError> {
        model::check_rate_range(min, max)?;
        let mut rng = StdRng::seed_from_u64(seed);
        model::draw_raw_rates(&mut self.params.trace_rate, min, max, &mut rng);
        Ok(())
    }

    /// Decoded trace-rate gate for the tape-free path.
    pub fn gate(&self) -> TraceGate {
        TraceGate::from_raw(&self.params.trace_rate, self.cfg.rate_mode)
    }

    /// One tape-free timestep. Returns (new trace, output).
    ///
    /// Evaluates in the same order and with the same kernels as the traced
    /// step, so the two agree bit for bit.
    pub fn forward_step(&self, gate: &TraceGate, trace: &[f64], x: &[f64]) -> Result<(Vec<f64>, Vec<f64>), HebbError> {
        let (o, i) = (self.cfg.output_count, self.cfg.input_count);
        if x.len() != i {
            return Err(HebbError::InputSize { expected: i, got: x.len() });
        }
        expect_len("trace", o * i, trace.len())?;
        let p = &self.params;

        let mut wx = vec![0.0f64; o];
        tensor::matvec_f64(&p.weights, x, &mut wx, o, i);
        let hebb: Vec<f64> = p.plasticities.iter().zip(trace.iter()).map(|(a, t)| a * t).collect();
        let mut hx = vec![0.0f64; o];
        tensor::matvec_f64(&hebb, x, &mut hx, o, i);

        let y: Vec<f64> = (0..o)
            .map(|r| {
                let raw = p.biases[r] + (wx[r] + hx[r]);
                if self.cfg.use_activation { raw.tanh() } else { raw }
            })
            .collect();

        let mut next = vec![0.0f64; o * i];
        for r in 0..o {
            for c in 0..i {
                let k = r * i + c;
                next[k] = gate.keep_at(k) * trace[k] + gate.rate_at(k) * (y[r] * x[c]);
            }
        }
        Ok((next, y))
    }

    // ── Persistence ──────────────────────────────────────────────

    pub fn to_checkpoint(&self) -> LayerCheckpoint {
        LayerCheckpoint::new(&self.cfg, &self.params)
    }

    pub fn from_checkpoint(checkpoint: LayerCheckpoint) -> Result<Self, HebbError> {
        let (params, cfg) = checkpoint.into_parts()?;
        Ok(DenseLayer { cfg, params })
    }

    pub fn to_json(&self) -> Result<String, HebbError> {
        self.to_checkpoint().to_json()
    }

    pub fn from_json(json: &str) -> Result<Self, HebbError> {
        let checkpoint: LayerCheckpoint = serde_json::from_str(json)?;
        Self::from_checkpoint(checkpoint)
    }

    pub fn save(&self, path: &Path) -> Result<(), HebbError> {
        model::save_checkpoint(path, &self.params, &self.cfg)
    }

    pub fn load(path: &Path) -> Result<Self, HebbError> {
        let (params, cfg) = model::load_checkpoint(path)?;
        Ok(DenseLayer { cfg, params })
    }
}

impl Cell for DenseLayer {
    fn input_count(&self) -> usize {
        self.cfg.input_count
    }

    fn output_count(&self) -> usize {
        self.cfg.output_count
    }

    fn tensors(&self) -> Vec<&[f64]> {
        self.params.to_tensors()
    }

    fn tensors_mut(&mut self) -> Vec<&mut Vec<f64>> {
        let p = &mut self.params;
        vec![&mut p.trace_rate, &mut p.weights, &mut p.biases, &mut p.plasticities, &mut p.init_trace]
    }

    fn tensor_count(&self) -> usize {
        DenseTensor::ALL.len()
    }

    fn bind(&self, tape: &mut Tape, direction: Option<&[Vec<f64>]>) -> Result<Box<dyn BoundCell>, HebbError> {
        self.params.validate(&self.cfg)?;
        if let Some(dir) = direction {
            check_direction(&self.tensors(), dir)?;
        }
        let (o, i) = (self.cfg.output_count, self.cfg.input_count);
        let rate_shape = match self.cfg.rate_mode {
            RateMode::Shared => vec![1],
            RateMode::PerConnection => vec![o, i],
        };
        let shapes = [rate_shape, vec![o, i], vec![o], vec![o, i], vec![o, i]];

        let mut ids = [0 as BufId; 5];
        for t in DenseTensor::ALL {
            let data = self.params.tensor(t);
            let shape = shapes[t.index()].clone();
            ids[t.index()] = match direction {
                Some(dir) => tape.register_param_r(data, &dir[t.index()], shape),
                None => tape.register_param(data, shape),
            };
        }
        let (rate, keep) = traced_gate(tape, ids[DenseTensor::TraceRate.index()]);

        Ok(Box::new(BoundDense {
            params: ids,
            rate,
            keep,
            output_count: o,
            input_count: i,
            use_activation: self.cfg.use_activation,
            rate_mode: self.cfg.rate_mode,
        }))
    }
}

/// A dense layer whose tensors and gate live on a tape.
struct BoundDense {
    /// Param handles in `DenseTensor` order.
    params: [BufId; 5],
    rate: BufId,
    keep: BufId,
    output_count: usize,
    input_count: usize,
    use_activation: bool,
    rate_mode: RateMode,
}

impl BoundDense {
    fn param(&self, t: DenseTensor) -> BufId {
        self.params[t.index()]
    }
}

impl BoundCell for BoundDense {
    fn params(&self) -> &[BufId] {
        &self.params
    }

    fn start_states(&self) -> Vec<BufId> {
        vec![self.param(DenseTensor::InitTrace)]
    }

    fn state_sizes(&self) -> Vec<usize> {
        vec![self.output_count * self.input_count]
    }

    fn step(&self, tape: &mut Tape, states: &[BufId], input: BufId) -> (Vec<BufId>, BufId) {
        assert_eq!(states.len(), 1, "dense cell carries one state tensor, got {}", states.len());
        let trace = states[0];
        let (o, i) = (self.output_count, self.input_count);

        let wx = traced_matvec(tape, self.param(DenseTensor::Weights), input, o, i);
        let hebb = traced_mul(tape, self.param(DenseTensor::Plasticities), trace);
        let hx = traced_matvec(tape, hebb, input, o, i);
        let sum = traced_add(tape, wx, hx);
        let mut out = traced_add(tape, self.param(DenseTensor::Biases), sum);
        if self.use_activation {
            out = traced_tanh(tape, out);
        }

        let write = traced_outer(tape, out, input);
        let (kept, written) = match self.rate_mode {
            RateMode::Shared => (
                traced_scale_by(tape, trace, self.keep),
                traced_scale_by(tape, write, self.rate),
            ),
            RateMode::PerConnection => (
                traced_mul(tape, self.keep, trace),
                traced_mul(tape, self.rate, write),
            ),
        };
        let next = traced_add(tape, kept, written);
        (vec![next], out)
    }
}

// ── Tape-free runner ─────────────────────────────────────────────────

/// Stateful inference without a tape: holds the current trace and advances
/// it one timestep per call.
pub struct TraceRunner<'a> {
    layer: &'a DenseLayer,
    gate: TraceGate,
    trace: Vec<f64>,
}

impl<'a> TraceRunner<'a> {
    /// Start from the layer's learned init_trace.
    pub fn new(layer: &'a DenseLayer) -> Self {
        TraceRunner {
            layer,
            gate: layer.gate(),
            trace: layer.params.init_trace.clone(),
        }
    }

    /// Start from an explicit trace.
    pub fn with_trace(layer: &'a DenseLayer, trace: Vec<f64>) -> Result<Self, HebbError> {
        expect_len("trace", layer.cfg.matrix_len(), trace.len())?;
        Ok(TraceRunner { layer, gate: layer.gate(), trace })
    }

    /// Advance one timestep and return the output.
    pub fn step_time(&mut self, x: &[f64]) -> Result<Vec<f64>, HebbError> {
        let (next, y) = self.layer.forward_step(&self.gate, &self.trace, x)?;
        self.trace = next;
        Ok(y)
    }

    /// Run a whole sequence, returning one output per timestep.
    pub fn run_all(&mut self, xs: &[Vec<f64>]) -> Result<Vec<Vec<f64>>, HebbError> {
        xs.iter().map(|x| self.step_time(x)).collect()
    }

    /// Back to the learned init_trace.
    pub fn reset(&mut self) {
        self.trace.clone_from(&self.layer.params.init_trace);
    }

    pub fn trace(&self) -> &[f64] {
        &self.trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_layer() -> DenseLayer {
        let cfg = DenseConfig::scenario_config();
        let params = DenseParams {
            trace_rate: vec![0.0],
            weights: vec![2.0],
            biases: vec![0.0],
            plasticities: vec![1.0],
            init_trace: vec![0.0],
        };
        DenseLayer::from_parts(cfg, params).unwrap()
    }

    #[test]
    fn test_scenario_by_hand() {
        // rate = keep = 0.5
        // t=0: y = 2*1 + 1*0*1 = 2, T = 0.5*0 + 0.5*2 = 1
        // t=1: y = 2*1 + 1*1*1 = 3, T = 0.5*1 + 0.5*3 = 2
        let layer = scenario_layer();
        let mut runner = TraceRunner::new(&layer);
        assert_eq!(runner.step_time(&[1.0]).unwrap(), vec![2.0]);
        assert_eq!(runner.trace(), &[1.0]);
        assert_eq!(runner.step_time(&[1.0]).unwrap(), vec![3.0]);
        assert_eq!(runner.trace(), &[2.0]);
    }

    #[test]
    fn test_runner_reset() {
        let layer = scenario_layer();
        let mut runner = TraceRunner::new(&layer);
        let first = runner.run_all(&[vec![1.0], vec![1.0]]).unwrap();
        runner.reset();
        assert_eq!(runner.trace(), &[0.0]);
        let second = runner.run_all(&[vec![1.0], vec![1.0]]).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_forward_step_rejects_bad_input() {
        let layer = DenseLayer::new(DenseConfig::test_config(), 1).unwrap();
        let mut runner = TraceRunner::new(&layer);
        assert!(matches!(
            runner.step_time(&[1.0, 2.0]),
            Err(HebbError::InputSize { expected: 3, got: 2 })
        ));
        assert!(matches!(
            TraceRunner::with_trace(&layer, vec![0.0; 5]),
            Err(HebbError::ShapeMismatch { expected: 6, got: 5, .. })
        ));
    }

    #[test]
    fn test_activation_bounds_output() {
        let mut layer = DenseLayer::new(DenseConfig::test_config(), 4).unwrap();
        for w in layer.params_mut().weights.iter_mut() {
            *w *= 50.0;
        }
        let mut runner = TraceRunner::new(&layer);
        for y in runner.step_time(&[1.0, -2.0, 3.0]).unwrap() {
            assert!(y.abs() <= 1.0, "tanh output out of range: {y}");
        }
    }

    #[test]
    fn test_init_rates() {
        let mut layer = DenseLayer::new(DenseConfig::per_connection_test_config(), 2).unwrap();
        layer.init_rates(0.4, 0.6, 9).unwrap();
        let gate = layer.gate();
        assert!(gate.rate.iter().all(|r| (0.4 - 1e-12..=0.6 + 1e-12).contains(r)));
        assert!(matches!(layer.init_rates(0.6, 0.4, 9), Err(HebbError::RateRange { .. })));
    }

    #[test]
    fn test_bind_rejects_broken_shapes() {
        let mut layer = DenseLayer::new(DenseConfig::test_config(), 1).unwrap();
        layer.params_mut().biases.push(0.0);
        let mut tape = Tape::new();
        assert!(layer.bind(&mut tape, None).is_err());
    }

    #[test]
    fn test_layer_is_sync() {
        fn assert_sync<T: Sync + Send>() {}
        assert_sync::<DenseLayer>();
    }
}
