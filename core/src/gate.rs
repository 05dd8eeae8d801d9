/// Trace-rate gate: raw parameters → (rate, keep) mixing coefficients.
///
/// rate = sigmoid(raw), keep = 1 - rate, elementwise. A shared gate holds one
/// pair broadcast over every connection; a per-connection gate holds O·I pairs.

use crate::model::RateMode;
use crate::tape::{BufId, Tape};
use crate::tensor;
use crate::traced::{traced_one_minus, traced_sigmoid};

/// Decoded gate values for the tape-free path.
#[derive(Clone, Debug, PartialEq)]
pub struct TraceGate {
    pub mode: RateMode,
    pub rate: Vec<f64>,
    pub keep: Vec<f64>,
}

impl TraceGate {
    pub fn from_raw(raw: &[f64], mode: RateMode) -> Self {
        let rate: Vec<f64> = raw.iter().map(|&x| tensor::sigmoid_f64(x)).collect();
        let keep = rate.iter().map(|&r| 1.0 - r).collect();
        TraceGate { mode, rate, keep }
    }

    /// Rate applied to flat connection index `k`.
    #[inline]
    pub fn rate_at(&self, k: usize) -> f64 {
        match self.mode {
            RateMode::Shared => self.rate[0],
            RateMode::PerConnection => self.rate[k],
        }
    }

    #[inline]
    pub fn keep_at(&self, k: usize) -> f64 {
        match self.mode {
            RateMode::Shared => self.keep[0],
            RateMode::PerConnection => self.keep[k],
        }
    }
}

/// Record the gate on the tape. Returns (rate, keep) buffers.
///
/// Recorded once per sweep; every step of every member reads the same pair,
/// so the raw rate's gradient sums over all of them through one slot.
pub fn traced_gate(tape: &mut Tape, raw: BufId) -> (BufId, BufId) {
    let rate = traced_sigmoid(tape, raw);
    let keep = traced_one_minus(tape, rate);
    (rate, keep)
}
