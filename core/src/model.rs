/// Dense Hebbian layer configuration and parameters.
///
/// All matrices are flat Vec<f64> in row-major layout, O rows by I columns.
/// The trace rate is stored raw (pre-sigmoid); its length selects the mode.

use std::path::Path;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::error::{expect_len, HebbError};
use crate::tensor;

/// How many raw trace-rate values the layer carries.
///
/// - Shared: one coefficient mixes every connection's trace.
/// - PerConnection: one coefficient per (output, input) pair.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RateMode {
    Shared,
    PerConnection,
}

impl RateMode {
    /// Length of the raw rate tensor for an O×I layer.
    pub fn len(self, output_count: usize, input_count: usize) -> usize {
        match self {
            RateMode::Shared => 1,
            RateMode::PerConnection => output_count * input_count,
        }
    }

    /// Recover the mode from a stored rate length. A 1×1 layer reads as shared.
    pub fn infer(len: usize, output_count: usize, input_count: usize) -> Result<Self, HebbError> {
        let per_connection = output_count * input_count;
        if len == 1 {
            Ok(RateMode::Shared)
        } else if len == per_connection {
            Ok(RateMode::PerConnection)
        } else {
            Err(HebbError::TraceRateLength { len, per_connection })
        }
    }
}

/// Layer configuration. Immutable after construction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseConfig {
    pub input_count: usize,
    pub output_count: usize,
    /// Apply tanh to the raw output.
    pub use_activation: bool,
    pub rate_mode: RateMode,
    /// When set, raw rates start at logit(u) with u drawn uniformly from
    /// [min, max]. Otherwise they start at zero (rate 0.5).
    #[serde(default)]
    pub rate_init: Option<(f64, f64)>,
}

impl DenseConfig {
    /// Small shared-rate layer with activation, used across the test suite.
    pub fn test_config() -> Self {
        DenseConfig {
            input_count: 3,
            output_count: 2,
            use_activation: true,
            rate_mode: RateMode::Shared,
            rate_init: Some((0.1, 0.3)),
        }
    }

    /// Same shape as `test_config`, one rate per connection.
    pub fn per_connection_test_config() -> Self {
        DenseConfig {
            rate_mode: RateMode::PerConnection,
            ..Self::test_config()
        }
    }

    /// 1×1 linear layer for hand-checked traces.
    pub fn scenario_config() -> Self {
        DenseConfig {
            input_count: 1,
            output_count: 1,
            use_activation: false,
            rate_mode: RateMode::Shared,
            rate_init: None,
        }
    }

    pub fn validate(&self) -> Result<(), HebbError> {
        if self.input_count == 0 || self.output_count == 0 {
            return Err(HebbError::ZeroDimension {
                input_count: self.input_count,
                output_count: self.output_count,
            });
        }
        if let Some((min, max)) = self.rate_init {
            check_rate_range(min, max)?;
        }
        Ok(())
    }

    /// Elements in each O×I matrix.
    pub fn matrix_len(&self) -> usize {
        self.output_count * self.input_count
    }

    pub fn rate_len(&self) -> usize {
        self.rate_mode.len(self.output_count, self.input_count)
    }
}

pub(crate) fn check_rate_range(min: f64, max: f64) -> Result<(), HebbError> {
    if min > 0.0 && min <= max && max < 1.0 {
        Ok(())
    } else {
        Err(HebbError::RateRange { min, max })
    }
}

/// Draw raw rates as logit(u), u uniform in [min, max].
pub(crate) fn draw_raw_rates(buf: &mut [f64], min: f64, max: f64, rng: &mut StdRng) {
    let mid = 0.5 * (min + max);
    tensor::fill_uniform(rng, buf, 0.5 * (max - min));
    for v in buf.iter_mut() {
        *v = tensor::logit_f64(mid + *v);
    }
}

/// The five learnable tensors, in canonical order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DenseTensor {
    TraceRate,
    Weights,
    Biases,
    Plasticities,
    InitTrace,
}

impl DenseTensor {
    pub const ALL: [DenseTensor; 5] = [
        DenseTensor::TraceRate,
        DenseTensor::Weights,
        DenseTensor::Biases,
        DenseTensor::Plasticities,
        DenseTensor::InitTrace,
    ];

    pub fn index(self) -> usize {
        match self {
            DenseTensor::TraceRate => 0,
            DenseTensor::Weights => 1,
            DenseTensor::Biases => 2,
            DenseTensor::Plasticities => 3,
            DenseTensor::InitTrace => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            DenseTensor::TraceRate => "trace_rate",
            DenseTensor::Weights => "weights",
            DenseTensor::Biases => "biases",
            DenseTensor::Plasticities => "plasticities",
            DenseTensor::InitTrace => "init_trace",
        }
    }
}

/// All learnable parameters of one dense layer.
///
/// Layout (row-major):
///   trace_rate:   [1] or [O * I], raw
///   weights:      [O, I]
///   biases:       [O]
///   plasticities: [O, I]
///   init_trace:   [O, I]
///
/// Also used as the gradient container and as a parameter-space direction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DenseParams {
    pub trace_rate: Vec<f64>,
    pub weights: Vec<f64>,
    pub biases: Vec<f64>,
    pub plasticities: Vec<f64>,
    pub init_trace: Vec<f64>,
}

impl DenseParams {
    /// Weights ~ N(0, 1/√I); everything else zero, except raw rates when
    /// `cfg.rate_init` asks for a draw.
    pub fn init(cfg: &DenseConfig, seed: u64) -> Result<Self, HebbError> {
        cfg.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let mut params = Self::zeros_like(cfg);

        let std = 1.0 / (cfg.input_count as f64).sqrt();
        tensor::fill_normal(&mut rng, &mut params.weights, std);

        if let Some((min, max)) = cfg.rate_init {
            draw_raw_rates(&mut params.trace_rate, min, max, &mut rng);
        }
        Ok(params)
    }

    pub fn zeros_like(cfg: &DenseConfig) -> Self {
        let n = cfg.matrix_len();
        DenseParams {
            trace_rate: vec![0.0; cfg.rate_len()],
            weights: vec![0.0; n],
            biases: vec![0.0; cfg.output_count],
            plasticities: vec![0.0; n],
            init_trace: vec![0.0; n],
        }
    }

    /// Total number of parameters.
    pub fn num_params(&self) -> usize {
        self.trace_rate.len() + self.weights.len() + self.biases.len()
            + self.plasticities.len() + self.init_trace.len()
    }

    pub fn tensor(&self, which: DenseTensor) -> &[f64] {
        match which {
            DenseTensor::TraceRate => &self.trace_rate,
            DenseTensor::Weights => &self.weights,
            DenseTensor::Biases => &self.biases,
            DenseTensor::Plasticities => &self.plasticities,
            DenseTensor::InitTrace => &self.init_trace,
        }
    }

    pub fn tensor_mut(&mut self, which: DenseTensor) -> &mut Vec<f64> {
        match which {
            DenseTensor::TraceRate => &mut self.trace_rate,
            DenseTensor::Weights => &mut self.weights,
            DenseTensor::Biases => &mut self.biases,
            DenseTensor::Plasticities => &mut self.plasticities,
            DenseTensor::InitTrace => &mut self.init_trace,
        }
    }

    /// Tensors in canonical order.
    pub fn to_tensors(&self) -> Vec<&[f64]> {
        DenseTensor::ALL.iter().map(|&t| self.tensor(t)).collect()
    }

    /// Check every tensor length against the configuration.
    pub fn validate(&self, cfg: &DenseConfig) -> Result<(), HebbError> {
        cfg.validate()?;
        if self.trace_rate.len() != cfg.rate_len() {
            return Err(HebbError::TraceRateLength {
                len: self.trace_rate.len(),
                per_connection: cfg.matrix_len(),
            });
        }
        let n = cfg.matrix_len();
        expect_len("weights", n, self.weights.len())?;
        expect_len("biases", cfg.output_count, self.biases.len())?;
        expect_len("plasticities", n, self.plasticities.len())?;
        expect_len("init_trace", n, self.init_trace.len())?;
        Ok(())
    }

    /// self += other, tensor by tensor. Merges gradients from separate sweeps.
    pub fn accumulate(&mut self, other: &DenseParams) {
        self.add_scaled(other, 1.0);
    }

    /// self += alpha * other.
    pub fn add_scaled(&mut self, other: &DenseParams, alpha: f64) {
        for t in DenseTensor::ALL {
            tensor::axpy_f64(alpha, other.tensor(t), self.tensor_mut(t));
        }
    }
}

// ── Checkpointing ────────────────────────────────────────────────────

/// Flat on-disk record of one layer. Every field round-trips verbatim;
/// the rate mode is recovered from the length of `trace_rate`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LayerCheckpoint {
    pub input_count: usize,
    pub output_count: usize,
    pub use_activation: bool,
    pub trace_rate: Vec<f64>,
    pub weights: Vec<f64>,
    pub biases: Vec<f64>,
    pub plasticities: Vec<f64>,
    pub init_trace: Vec<f64>,
}

impl LayerCheckpoint {
    pub fn new(cfg: &DenseConfig, params: &DenseParams) -> Self {
        LayerCheckpoint {
            input_count: cfg.input_count,
            output_count: cfg.output_count,
            use_activation: cfg.use_activation,
            trace_rate: params.trace_rate.clone(),
            weights: params.weights.clone(),
            biases: params.biases.clone(),
            plasticities: params.plasticities.clone(),
            init_trace: params.init_trace.clone(),
        }
    }

    /// Fail with `NonFinite` on the first NaN or infinite value. JSON has no
    /// encoding for them, so they would come back as `null` and fail to load.
    pub fn check_finite(&self) -> Result<(), HebbError> {
        let tensors: [(&'static str, &[f64]); 5] = [
            (DenseTensor::TraceRate.name(), &self.trace_rate[..]),
            (DenseTensor::Weights.name(), &self.weights[..]),
            (DenseTensor::Biases.name(), &self.biases[..]),
            (DenseTensor::Plasticities.name(), &self.plasticities[..]),
            (DenseTensor::InitTrace.name(), &self.init_trace[..]),
        ];
        for (tensor, values) in tensors {
            if let Some((index, &value)) = values.iter().enumerate().find(|(_, v)| !v.is_finite()) {
                return Err(HebbError::NonFinite { tensor, index, value });
            }
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, HebbError> {
        self.check_finite()?;
        Ok(serde_json::to_string(self)?)
    }

    /// Split into config and params, inferring the rate mode and checking shapes.
    pub fn into_parts(self) -> Result<(DenseParams, DenseConfig), HebbError> {
        let rate_mode = RateMode::infer(self.trace_rate.len(), self.output_count, self.input_count)?;
        let cfg = DenseConfig {
            input_count: self.input_count,
            output_count: self.output_count,
            use_activation: self.use_activation,
            rate_mode,
            rate_init: None,
        };
        let params = DenseParams {
            trace_rate: self.trace_rate,
            weights: self.weights,
            biases: self.biases,
            plasticities: self.plasticities,
            init_trace: self.init_trace,
        };
        params.validate(&cfg)?;
        Ok((params, cfg))
    }
}

/// Save params + config to a JSON file.
pub fn save_checkpoint(path: &Path, params: &DenseParams, config: &DenseConfig) -> Result<(), HebbError> {
    let json = LayerCheckpoint::new(config, params).to_json()?;
    std::fs::write(path, json)?;
    Ok(())
}

/// Load params + config from a JSON file.
pub fn load_checkpoint(path: &Path) -> Result<(DenseParams, DenseConfig), HebbError> {
    let json = std::fs::read_to_string(path)?;
    let checkpoint: LayerCheckpoint = serde_json::from_str(&json)?;
    checkpoint.into_parts()
}
