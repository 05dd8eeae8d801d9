// Wengert tape: reverse-mode AD via operation recording.
//
// Records operations during the forward pass into a linear tape, then replays
// them in reverse, accumulating vector-Jacobian products into gradient slots
// keyed by BufId. A parameter registered once and read by many consumers
// therefore owns exactly one accumulation slot.
//
// Sensitivity mode adds Pearlmutter's R-operator: every buffer carries
// R{value}, its directional derivative along a parameter direction, and the
// reverse replay accumulates R{grad} next to grad. R{grad} at a parameter is
// the Hessian-vector product for that direction.
//
// Parameters are snapshotted at registration, so later mutation of the
// owning tensors cannot leak into a sweep in flight.

use std::ops::Range;

use crate::tensor;

// ── Buffer management ────────────────────────────────────────────────

/// Arena index for tensor buffers. Immutable after creation.
pub type BufId = usize;

/// A flat tensor buffer in the tape arena.
#[derive(Clone, Debug)]
pub struct TapeBuf {
    /// Flat storage (row-major).
    pub data: Vec<f64>,
    /// R{data}. Present exactly when the tape runs in sensitivity mode.
    pub r: Option<Vec<f64>>,
    /// Shape metadata, e.g. [output_count, input_count].
    pub shape: Vec<usize>,
    /// True for learnable tensors; these get gradient output.
    pub is_param: bool,
}

impl TapeBuf {
    pub fn numel(&self) -> usize {
        self.data.len()
    }
}

// ── Tape operations ──────────────────────────────────────────────────

/// A single recorded operation on the tape.
#[derive(Debug, Clone)]
pub enum TapeOp {
    /// out = M @ x where M: [rows, cols], x: [cols], out: [rows]
    MatVec { mat: BufId, vec: BufId, out: BufId, rows: usize, cols: usize },
    /// out = a ⊗ b where a: [d1], b: [d2], out: [d1, d2]
    OuterProduct { a: BufId, b: BufId, out: BufId },
    /// out = A + B
    Add { a: BufId, b: BufId, out: BufId },
    /// out = A * B  (element-wise)
    Mul { a: BufId, b: BufId, out: BufId },
    /// out = s * A where `scalar` is a one-element buffer
    ScaleBy { input: BufId, scalar: BufId, out: BufId },
    /// out = 1 - A
    OneMinus { input: BufId, out: BufId },
    /// out = sigmoid(x); backward reads the saved output
    Sigmoid { input: BufId, out: BufId },
    /// out = tanh(x); backward reads the saved output
    Tanh { input: BufId, out: BufId },
}

// ── The Tape ─────────────────────────────────────────────────────────

/// Wengert tape for reverse-mode AD, optionally carrying R-operator values.
pub struct Tape {
    /// Operations in forward order. Replayed in reverse during backward.
    ops: Vec<TapeOp>,
    /// Arena of tensor buffers. Indexed by BufId.
    bufs: Vec<TapeBuf>,
    /// Gradient accumulators, indexed by BufId. None until something flows in.
    grad_accum: Vec<Option<Vec<f64>>>,
    /// R{grad} accumulators; only populated in sensitivity mode.
    r_grad_accum: Vec<Option<Vec<f64>>>,
    sensitivity: bool,
    /// True until the first backward replay.
    recording: bool,
}

impl Default for Tape {
    fn default() -> Self {
        Tape::new()
    }
}

impl Tape {
    /// First-order tape.
    pub fn new() -> Self {
        Tape {
            ops: Vec::new(),
            bufs: Vec::new(),
            grad_accum: Vec::new(),
            r_grad_accum: Vec::new(),
            sensitivity: false,
            recording: true,
        }
    }

    /// Tape whose buffers carry R-operator sensitivities.
    pub fn with_sensitivity() -> Self {
        Tape { sensitivity: true, ..Tape::new() }
    }

    pub fn has_sensitivity(&self) -> bool {
        self.sensitivity
    }

    // ── Buffer management ────────────────────────────────────────

    fn push_buf(&mut self, data: Vec<f64>, r: Option<Vec<f64>>, shape: Vec<usize>, is_param: bool) -> BufId {
        let r = if self.sensitivity {
            let r = r.unwrap_or_else(|| vec![0.0; data.len()]);
            assert_eq!(r.len(), data.len(), "sensitivity size mismatch: r={} data={}", r.len(), data.len());
            Some(r)
        } else {
            None
        };
        let id = self.bufs.len();
        self.bufs.push(TapeBuf { data, r, shape, is_param });
        self.grad_accum.push(None);
        self.r_grad_accum.push(None);
        id
    }

    /// Allocate a new non-parameter buffer. In sensitivity mode its R value is zero.
    pub fn alloc(&mut self, data: Vec<f64>, shape: Vec<usize>) -> BufId {
        self.push_buf(data, None, shape, false)
    }

    /// Register a learnable tensor. CLONES the data.
    pub fn register_param(&mut self, data: &[f64], shape: Vec<usize>) -> BufId {
        self.push_buf(data.to_vec(), None, shape, true)
    }

    /// Register a learnable tensor together with its direction component.
    /// On a first-order tape the direction is ignored.
    pub fn register_param_r(&mut self, data: &[f64], r: &[f64], shape: Vec<usize>) -> BufId {
        self.push_buf(data.to_vec(), Some(r.to_vec()), shape, true)
    }

    /// Register an input (non-parameter) buffer. Clones the data.
    pub fn register_input(&mut self, data: &[f64], shape: Vec<usize>) -> BufId {
        self.push_buf(data.to_vec(), None, shape, false)
    }

    /// Register a non-parameter buffer with a caller-supplied sensitivity.
    /// Sequence graphs feed inputs through `register_input` (zero sensitivity);
    /// this entry point is for building op chains on a bare tape.
    pub fn register_input_r(&mut self, data: &[f64], r: &[f64], shape: Vec<usize>) -> BufId {
        self.push_buf(data.to_vec(), Some(r.to_vec()), shape, false)
    }

    /// Get the data for a buffer.
    pub fn buf_data(&self, id: BufId) -> &[f64] {
        &self.bufs[id].data
    }

    /// Get R{data} for a buffer; None on a first-order tape.
    pub fn buf_r(&self, id: BufId) -> Option<&[f64]> {
        self.bufs[id].r.as_deref()
    }

    /// R{data} for a buffer on a sensitivity tape.
    pub fn sensitivity_of(&self, id: BufId) -> &[f64] {
        match &self.bufs[id].r {
            Some(r) => r,
            None => panic!("buffer {id} carries no sensitivity (first-order tape)"),
        }
    }

    pub fn buf_shape(&self, id: BufId) -> &[usize] {
        &self.bufs[id].shape
    }

    pub fn buf_numel(&self, id: BufId) -> usize {
        self.bufs[id].numel()
    }

    pub fn is_param(&self, id: BufId) -> bool {
        self.bufs[id].is_param
    }

    pub fn num_ops(&self) -> usize {
        self.ops.len()
    }

    // ── Recording ────────────────────────────────────────────────

    /// Position of the next op; pairs of marks delimit replayable segments.
    pub fn mark(&self) -> usize {
        self.ops.len()
    }

    /// Record an operation on the tape.
    pub fn record(&mut self, op: TapeOp) {
        assert!(self.recording, "Tape::record called after backward started");
        self.ops.push(op);
    }

    /// Allocate an output buffer and record the op that produced it.
    /// `r` is the output's sensitivity and is dropped on a first-order tape.
    pub fn record_with_output(
        &mut self,
        data: Vec<f64>,
        r: Option<Vec<f64>>,
        shape: Vec<usize>,
        op_fn: impl FnOnce(BufId) -> TapeOp,
    ) -> BufId {
        let out_id = self.push_buf(data, r, shape, false);
        let op = op_fn(out_id);
        self.record(op);
        out_id
    }

    // ── Gradient seeding and access ──────────────────────────────

    /// Replace the pending gradient of a buffer.
    pub fn set_grad(&mut self, id: BufId, grad: Vec<f64>) {
        assert_eq!(grad.len(), self.bufs[id].numel(),
                   "Gradient size mismatch: grad={} buf={}", grad.len(), self.bufs[id].numel());
        self.grad_accum[id] = Some(grad);
    }

    /// Replace the pending gradient and its R{grad}. On a first-order tape
    /// `r_grad` is ignored.
    pub fn set_grad_r(&mut self, id: BufId, grad: Vec<f64>, r_grad: Vec<f64>) {
        assert_eq!(r_grad.len(), self.bufs[id].numel(),
                   "R-gradient size mismatch: r_grad={} buf={}", r_grad.len(), self.bufs[id].numel());
        self.set_grad(id, grad);
        if self.sensitivity {
            self.r_grad_accum[id] = Some(r_grad);
        }
    }

    fn accumulate_into(slot: &mut Option<Vec<f64>>, grad: &[f64]) {
        match slot {
            Some(existing) => {
                for (e, g) in existing.iter_mut().zip(grad.iter()) {
                    *e += g;
                }
            }
            None => *slot = Some(grad.to_vec()),
        }
    }

    fn accumulate_grad(&mut self, id: BufId, grad: &[f64]) {
        let n = self.bufs[id].numel();
        assert_eq!(grad.len(), n, "accumulate_grad size mismatch: grad={} buf={}", grad.len(), n);
        Self::accumulate_into(&mut self.grad_accum[id], grad);
    }

    fn accumulate_grad_r(&mut self, id: BufId, r_grad: &[f64]) {
        let n = self.bufs[id].numel();
        assert_eq!(r_grad.len(), n, "accumulate_grad_r size mismatch: r_grad={} buf={}", r_grad.len(), n);
        Self::accumulate_into(&mut self.r_grad_accum[id], r_grad);
    }

    /// Accumulated gradient for a buffer, or None if nothing flowed to it.
    pub fn get_grad(&self, id: BufId) -> Option<&[f64]> {
        self.grad_accum[id].as_deref()
    }

    /// Gradient for a parameter buffer, zeros if no gradient flowed.
    pub fn get_param_grad(&self, id: BufId) -> Vec<f64> {
        assert!(self.bufs[id].is_param, "get_param_grad called on non-param buffer {}", id);
        self.grad_or_zeros(id)
    }

    /// R{grad} for a parameter buffer, zeros if nothing flowed.
    pub fn get_param_grad_r(&self, id: BufId) -> Vec<f64> {
        assert!(self.bufs[id].is_param, "get_param_grad_r called on non-param buffer {}", id);
        self.grad_r_or_zeros(id)
    }

    pub fn grad_or_zeros(&self, id: BufId) -> Vec<f64> {
        match &self.grad_accum[id] {
            Some(g) => g.clone(),
            None => vec![0.0; self.bufs[id].numel()],
        }
    }

    pub fn grad_r_or_zeros(&self, id: BufId) -> Vec<f64> {
        match &self.r_grad_accum[id] {
            Some(g) => g.clone(),
            None => vec![0.0; self.bufs[id].numel()],
        }
    }

    // ── Backward pass ────────────────────────────────────────────

    /// Full reverse replay seeded at a scalar loss. Seeds 1.0 unless the
    /// caller already seeded the loss.
    pub fn backward(&mut self, loss_id: BufId) {
        if self.grad_accum[loss_id].is_none() {
            assert_eq!(self.bufs[loss_id].numel(), 1,
                       "Auto-seeding only works for scalar loss (got {} elements)",
                       self.bufs[loss_id].numel());
            self.grad_accum[loss_id] = Some(vec![1.0]);
        }
        let all = 0..self.ops.len();
        self.backward_ops(all);
    }

    /// Replay the ops in `range` in reverse. Segments must be replayed from
    /// the latest to the earliest so every consumer precedes its producer.
    pub fn backward_ops(&mut self, range: Range<usize>) {
        assert!(range.end <= self.ops.len(), "backward_ops range {:?} past {} ops", range, self.ops.len());
        self.recording = false;
        for op_idx in range.rev() {
            // Clone the op to avoid borrow conflict with self.
            let op = self.ops[op_idx].clone();
            self.backward_op(&op);
        }
    }

    /// Upstream (grad, R{grad}) of an op output. None when neither flowed,
    /// in which case the op contributes nothing.
    fn upstream(&self, out: BufId) -> Option<(Vec<f64>, Option<Vec<f64>>)> {
        let g = self.grad_accum[out].as_ref();
        let rg = self.r_grad_accum[out].as_ref();
        if g.is_none() && rg.is_none() {
            return None;
        }
        let g = self.grad_or_zeros(out);
        let rg = if self.sensitivity { Some(self.grad_r_or_zeros(out)) } else { None };
        Some((g, rg))
    }

    fn r_data(&self, id: BufId) -> Vec<f64> {
        self.sensitivity_of(id).to_vec()
    }

    /// VJP (and its R-operator image) for a single operation.
    fn backward_op(&mut self, op: &TapeOp) {
        match op {
            // ── MatVec: out = M @ x ──────────────────────────────
            TapeOp::MatVec { mat, vec, out, rows, cols } => {
                let (rows, cols) = (*rows, *cols);
                if let Some((d_out, rd_out)) = self.upstream(*out) {
                    let m = self.bufs[*mat].data.clone();
                    let x = self.bufs[*vec].data.clone();

                    // d_M = outer(d_out, x)
                    let mut d_m = vec![0.0f64; rows * cols];
                    tensor::outer_product_f64(&d_out, &x, &mut d_m);
                    // d_x = M^T @ d_out
                    let mut d_x = vec![0.0f64; cols];
                    tensor::matvec_t_acc_f64(&m, &d_out, &mut d_x, rows, cols);

                    if let Some(rd_out) = rd_out {
                        let rm = self.r_data(*mat);
                        let rx = self.r_data(*vec);
                        // R{d_M} = outer(R{d_out}, x) + outer(d_out, R{x})
                        let mut rd_m = vec![0.0f64; rows * cols];
                        tensor::outer_product_f64(&rd_out, &x, &mut rd_m);
                        tensor::outer_acc_f64(&d_out, &rx, &mut rd_m);
                        // R{d_x} = R{M}^T @ d_out + M^T @ R{d_out}
                        let mut rd_x = vec![0.0f64; cols];
                        tensor::matvec_t_acc_f64(&rm, &d_out, &mut rd_x, rows, cols);
                        tensor::matvec_t_acc_f64(&m, &rd_out, &mut rd_x, rows, cols);
                        self.accumulate_grad_r(*mat, &rd_m);
                        self.accumulate_grad_r(*vec, &rd_x);
                    }
                    self.accumulate_grad(*mat, &d_m);
                    self.accumulate_grad(*vec, &d_x);
                }
            }

            // ── OuterProduct: out = a ⊗ b ────────────────────────
            TapeOp::OuterProduct { a, b, out } => {
                if let Some((d_out, rd_out)) = self.upstream(*out) {
                    let a_data = self.bufs[*a].data.clone();
                    let b_data = self.bufs[*b].data.clone();
                    let d1 = a_data.len();
                    let d2 = b_data.len();

                    // d_a = d_out @ b, d_b = d_out^T @ a
                    let mut d_a = vec![0.0f64; d1];
                    let mut d_b = vec![0.0f64; d2];
                    tensor::matvec_f64(&d_out, &b_data, &mut d_a, d1, d2);
                    tensor::matvec_t_acc_f64(&d_out, &a_data, &mut d_b, d1, d2);

                    if let Some(rd_out) = rd_out {
                        let ra = self.r_data(*a);
                        let rb = self.r_data(*b);
                        // R{d_a} = R{d_out} @ b + d_out @ R{b}
                        let mut rd_a = vec![0.0f64; d1];
                        let mut tmp = vec![0.0f64; d1];
                        tensor::matvec_f64(&rd_out, &b_data, &mut rd_a, d1, d2);
                        tensor::matvec_f64(&d_out, &rb, &mut tmp, d1, d2);
                        for (r, t) in rd_a.iter_mut().zip(tmp.iter()) {
                            *r += t;
                        }
                        // R{d_b} = R{d_out}^T @ a + d_out^T @ R{a}
                        let mut rd_b = vec![0.0f64; d2];
                        tensor::matvec_t_acc_f64(&rd_out, &a_data, &mut rd_b, d1, d2);
                        tensor::matvec_t_acc_f64(&d_out, &ra, &mut rd_b, d1, d2);
                        self.accumulate_grad_r(*a, &rd_a);
                        self.accumulate_grad_r(*b, &rd_b);
                    }
                    self.accumulate_grad(*a, &d_a);
                    self.accumulate_grad(*b, &d_b);
                }
            }

            // ── Add: out = A + B ─────────────────────────────────
            TapeOp::Add { a, b, out } => {
                if let Some((d_out, rd_out)) = self.upstream(*out) {
                    if let Some(rd_out) = rd_out {
                        self.accumulate_grad_r(*a, &rd_out);
                        self.accumulate_grad_r(*b, &rd_out);
                    }
                    self.accumulate_grad(*a, &d_out);
                    self.accumulate_grad(*b, &d_out);
                }
            }

            // ── Mul: out = A * B (element-wise) ──────────────────
            TapeOp::Mul { a, b, out } => {
                if let Some((d_out, rd_out)) = self.upstream(*out) {
                    let a_data = self.bufs[*a].data.clone();
                    let b_data = self.bufs[*b].data.clone();
                    let d_a: Vec<f64> = d_out.iter().zip(b_data.iter()).map(|(d, b)| d * b).collect();
                    let d_b: Vec<f64> = d_out.iter().zip(a_data.iter()).map(|(d, a)| d * a).collect();

                    if let Some(rd_out) = rd_out {
                        let ra = self.r_data(*a);
                        let rb = self.r_data(*b);
                        // R{d_a} = R{d_out} * b + d_out * R{b}
                        let rd_a: Vec<f64> = (0..d_out.len())
                            .map(|i| rd_out[i] * b_data[i] + d_out[i] * rb[i]).collect();
                        let rd_b: Vec<f64> = (0..d_out.len())
                            .map(|i| rd_out[i] * a_data[i] + d_out[i] * ra[i]).collect();
                        self.accumulate_grad_r(*a, &rd_a);
                        self.accumulate_grad_r(*b, &rd_b);
                    }
                    self.accumulate_grad(*a, &d_a);
                    self.accumulate_grad(*b, &d_b);
                }
            }

            // ── ScaleBy: out = s * A ─────────────────────────────
            TapeOp::ScaleBy { input, scalar, out } => {
                if let Some((d_out, rd_out)) = self.upstream(*out) {
                    let a_data = self.bufs[*input].data.clone();
                    let s = self.bufs[*scalar].data[0];
                    let d_a: Vec<f64> = d_out.iter().map(|d| s * d).collect();
                    let d_s = tensor::dot_f64(&d_out, &a_data);

                    if let Some(rd_out) = rd_out {
                        let rs = self.r_data(*scalar)[0];
                        let ra = self.r_data(*input);
                        // R{d_A} = R{s} * d_out + s * R{d_out}
                        let rd_a: Vec<f64> = (0..d_out.len())
                            .map(|i| rs * d_out[i] + s * rd_out[i]).collect();
                        // R{d_s} = <R{d_out}, A> + <d_out, R{A}>
                        let rd_s = tensor::dot_f64(&rd_out, &a_data) + tensor::dot_f64(&d_out, &ra);
                        self.accumulate_grad_r(*input, &rd_a);
                        self.accumulate_grad_r(*scalar, &[rd_s]);
                    }
                    self.accumulate_grad(*input, &d_a);
                    self.accumulate_grad(*scalar, &[d_s]);
                }
            }

            // ── OneMinus: out = 1 - A ────────────────────────────
            TapeOp::OneMinus { input, out } => {
                if let Some((d_out, rd_out)) = self.upstream(*out) {
                    if let Some(rd_out) = rd_out {
                        let neg: Vec<f64> = rd_out.iter().map(|x| -x).collect();
                        self.accumulate_grad_r(*input, &neg);
                    }
                    let neg: Vec<f64> = d_out.iter().map(|x| -x).collect();
                    self.accumulate_grad(*input, &neg);
                }
            }

            // ── Sigmoid: out = σ(x) ──────────────────────────────
            TapeOp::Sigmoid { input, out } => {
                if let Some((d_out, rd_out)) = self.upstream(*out) {
                    let s = self.bufs[*out].data.clone();
                    // d_x = d_out * s * (1 - s)
                    let d_x: Vec<f64> = d_out.iter().zip(s.iter())
                        .map(|(d, s)| d * s * (1.0 - s)).collect();

                    if let Some(rd_out) = rd_out {
                        let rs = self.r_data(*out);
                        // R{d_x} = R{d_out} * s(1-s) + d_out * (1 - 2s) * R{s}
                        let rd_x: Vec<f64> = (0..s.len())
                            .map(|i| rd_out[i] * s[i] * (1.0 - s[i]) + d_out[i] * (1.0 - 2.0 * s[i]) * rs[i])
                            .collect();
                        self.accumulate_grad_r(*input, &rd_x);
                    }
                    self.accumulate_grad(*input, &d_x);
                }
            }

            // ── Tanh: out = tanh(x) ──────────────────────────────
            TapeOp::Tanh { input, out } => {
                if let Some((d_out, rd_out)) = self.upstream(*out) {
                    let y = self.bufs[*out].data.clone();
                    // d_x = d_out * (1 - y²)
                    let d_x: Vec<f64> = d_out.iter().zip(y.iter())
                        .map(|(d, y)| d * (1.0 - y * y)).collect();

                    if let Some(rd_out) = rd_out {
                        let ry = self.r_data(*out);
                        // R{d_x} = R{d_out} * (1 - y²) - 2 * d_out * y * R{y}
                        let rd_x: Vec<f64> = (0..y.len())
                            .map(|i| rd_out[i] * (1.0 - y[i] * y[i]) - 2.0 * d_out[i] * y[i] * ry[i])
                            .collect();
                        self.accumulate_grad_r(*input, &rd_x);
                    }
                    self.accumulate_grad(*input, &d_x);
                }
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(actual: &[f64], expected: &[f64], tol: f64, msg: &str) {
        assert_eq!(actual.len(), expected.len(), "{msg}: length mismatch");
        for (i, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
            assert!((a - e).abs() < tol, "{msg}[{i}]: actual={a}, expected={e}");
        }
    }

    #[test]
    fn test_tape_alloc_and_access() {
        let mut tape = Tape::new();
        let data = vec![1.0, 2.0, 3.0, 4.0];
        let id = tape.alloc(data.clone(), vec![2, 2]);
        assert_eq!(tape.buf_data(id), &data[..]);
        assert_eq!(tape.buf_shape(id), &[2, 2]);
        assert_eq!(tape.buf_numel(id), 4);
        assert!(!tape.is_param(id));
        assert!(tape.buf_r(id).is_none());
    }

    #[test]
    fn test_register_param_clones() {
        let mut tape = Tape::new();
        let mut original = vec![1.0, 2.0, 3.0];
        let id = tape.register_param(&original, vec![3]);
        original[0] = 999.0;
        assert_eq!(tape.buf_data(id)[0], 1.0);
        assert!(tape.is_param(id));
    }

    #[test]
    fn test_sensitivity_tape_defaults_to_zero_r() {
        let mut tape = Tape::with_sensitivity();
        let x = tape.register_input(&[1.0, 2.0], vec![2]);
        let p = tape.register_param_r(&[3.0], &[0.5], vec![1]);
        assert_eq!(tape.sensitivity_of(x), &[0.0, 0.0]);
        assert_eq!(tape.sensitivity_of(p), &[0.5]);
    }

    #[test]
    fn test_backward_add() {
        let mut tape = Tape::new();
        let a = tape.alloc(vec![1.0, 2.0], vec![2]);
        let b = tape.alloc(vec![3.0, 4.0], vec![2]);
        let out = tape.alloc(vec![4.0, 6.0], vec![2]);
        tape.record(TapeOp::Add { a, b, out });
        tape.set_grad(out, vec![1.0, 1.0]);
        tape.backward(out);
        assert_eq!(tape.get_grad(a).unwrap(), &[1.0, 1.0]);
        assert_eq!(tape.get_grad(b).unwrap(), &[1.0, 1.0]);
    }

    #[test]
    fn test_backward_mul() {
        let mut tape = Tape::new();
        let a = tape.alloc(vec![2.0, 3.0], vec![2]);
        let b = tape.alloc(vec![4.0, 5.0], vec![2]);
        let out = tape.alloc(vec![8.0, 15.0], vec![2]);
        tape.record(TapeOp::Mul { a, b, out });
        tape.set_grad(out, vec![1.0, 1.0]);
        tape.backward(out);
        assert_eq!(tape.get_grad(a).unwrap(), &[4.0, 5.0]);
        assert_eq!(tape.get_grad(b).unwrap(), &[2.0, 3.0]);
    }

    #[test]
    fn test_backward_matvec() {
        // out = M @ x, M: [2,2], x: [2]
        let mut tape = Tape::new();
        let m = tape.alloc(vec![1.0, 2.0, 3.0, 4.0], vec![2, 2]);
        let x = tape.alloc(vec![5.0, 6.0], vec![2]);
        let out = tape.alloc(vec![17.0, 39.0], vec![2]);
        tape.record(TapeOp::MatVec { mat: m, vec: x, out, rows: 2, cols: 2 });
        tape.set_grad(out, vec![1.0, 2.0]);
        tape.backward(out);
        // d_M = outer(g, x), d_x = M^T g
        assert_eq!(tape.get_grad(m).unwrap(), &[5.0, 6.0, 10.0, 12.0]);
        assert_eq!(tape.get_grad(x).unwrap(), &[7.0, 10.0]);
    }

    #[test]
    fn test_backward_outer_product() {
        let mut tape = Tape::new();
        let a = tape.alloc(vec![1.0, 2.0], vec![2]);
        let b = tape.alloc(vec![3.0, 4.0, 5.0], vec![3]);
        let out = tape.alloc(vec![3.0, 4.0, 5.0, 6.0, 8.0, 10.0], vec![2, 3]);
        tape.record(TapeOp::OuterProduct { a, b, out });
        tape.set_grad(out, vec![1.0; 6]);
        tape.backward(out);
        // d_a[i] = sum_j b[j]; d_b[j] = sum_i a[i]
        assert_eq!(tape.get_grad(a).unwrap(), &[12.0, 12.0]);
        assert_eq!(tape.get_grad(b).unwrap(), &[3.0, 3.0, 3.0]);
    }

    #[test]
    fn test_backward_scale_by() {
        let mut tape = Tape::new();
        let a = tape.alloc(vec![1.0, 2.0, 3.0], vec![3]);
        let s = tape.alloc(vec![0.5], vec![1]);
        let out = tape.alloc(vec![0.5, 1.0, 1.5], vec![3]);
        tape.record(TapeOp::ScaleBy { input: a, scalar: s, out });
        tape.set_grad(out, vec![1.0, 1.0, 2.0]);
        tape.backward(out);
        assert_eq!(tape.get_grad(a).unwrap(), &[0.5, 0.5, 1.0]);
        // d_s = <g, A> = 1 + 2 + 6
        assert_eq!(tape.get_grad(s).unwrap(), &[9.0]);
    }

    #[test]
    fn test_backward_one_minus_and_sigmoid() {
        // keep = 1 - sigmoid(raw) at raw = 0: d keep / d raw = -0.25
        let mut tape = Tape::new();
        let raw = tape.register_param(&[0.0], vec![1]);
        let rate = tape.record_with_output(vec![0.5], None, vec![1], |out| TapeOp::Sigmoid { input: raw, out });
        let keep = tape.record_with_output(vec![0.5], None, vec![1], |out| TapeOp::OneMinus { input: rate, out });
        tape.set_grad(keep, vec![1.0]);
        tape.backward(keep);
        assert_close(&tape.get_param_grad(raw), &[-0.25], 1e-15, "d_raw");
    }

    #[test]
    fn test_backward_tanh() {
        let mut tape = Tape::new();
        let x = tape.alloc(vec![0.3], vec![1]);
        let y = tape.record_with_output(vec![0.3f64.tanh()], None, vec![1], |out| TapeOp::Tanh { input: x, out });
        tape.backward(y);
        let expected = 1.0 - 0.3f64.tanh().powi(2);
        assert_close(tape.get_grad(x).unwrap(), &[expected], 1e-15, "d_x");
    }

    #[test]
    fn test_gradient_accumulation_multiple_consumers() {
        // One parameter read twice: out = p * p → d_p = 2p, one slot.
        let mut tape = Tape::new();
        let p = tape.register_param(&[3.0], vec![1]);
        let out = tape.record_with_output(vec![9.0], None, vec![1], |out| TapeOp::Mul { a: p, b: p, out });
        tape.backward(out);
        assert_eq!(tape.get_param_grad(p), vec![6.0]);
    }

    #[test]
    fn test_param_grad_returns_zeros_if_no_gradient() {
        let mut tape = Tape::new();
        let p = tape.register_param(&[1.0, 2.0], vec![2]);
        let x = tape.alloc(vec![1.0], vec![1]);
        tape.backward(x);
        assert_eq!(tape.get_param_grad(p), vec![0.0, 0.0]);
    }

    #[test]
    fn test_set_grad_replaces_pending_value() {
        let mut tape = Tape::new();
        let a = tape.alloc(vec![1.0], vec![1]);
        let b = tape.alloc(vec![2.0], vec![1]);
        let mid = tape.record_with_output(vec![3.0], None, vec![1], |out| TapeOp::Add { a, b, out });
        let split = tape.mark();
        let out = tape.record_with_output(vec![3.0], None, vec![1], |out| TapeOp::Mul { a: mid, b: a, out });
        tape.set_grad(out, vec![1.0]);
        tape.backward_ops(split..tape.num_ops());
        assert_eq!(tape.get_grad(mid).unwrap(), &[1.0]);
        // Override mid's pending gradient before replaying its producer.
        tape.set_grad(mid, vec![10.0]);
        tape.backward_ops(0..split);
        assert_eq!(tape.get_grad(b).unwrap(), &[10.0]);
        // a: 3 (from mul, d_out * mid) + 10 (from add)
        assert_eq!(tape.get_grad(a).unwrap(), &[13.0]);
    }

    #[test]
    #[should_panic(expected = "after backward started")]
    fn test_record_after_backward_panics() {
        let mut tape = Tape::new();
        let a = tape.alloc(vec![1.0], vec![1]);
        tape.backward(a);
        tape.record(TapeOp::OneMinus { input: a, out: a });
    }

    // ── R-operator rules ─────────────────────────────────────────

    /// f(p) = sum(tanh(M p)) with M fixed; check R{grad} = H v against
    /// central differences of the analytic gradient.
    #[test]
    fn test_r_backward_matches_gradient_difference() {
        let m = [0.4, -0.3, 0.2, 0.9, 0.1, -0.5];
        let p0 = [0.7, -0.2];
        let v = [0.3, 1.1];

        let grad_at = |p: &[f64]| -> (Vec<f64>, Vec<f64>) {
            let mut tape = Tape::with_sensitivity();
            let mid = tape.register_input(&m, vec![3, 2]);
            let pid = tape.register_param_r(p, &v, vec![2]);
            let mut h = vec![0.0; 3];
            tensor::matvec_f64(&m, p, &mut h, 3, 2);
            let mut rh = vec![0.0; 3];
            tensor::matvec_f64(&m, &v, &mut rh, 3, 2);
            let hid = tape.record_with_output(h.clone(), Some(rh.clone()), vec![3],
                |out| TapeOp::MatVec { mat: mid, vec: pid, out, rows: 3, cols: 2 });
            let y: Vec<f64> = h.iter().map(|x| x.tanh()).collect();
            let ry: Vec<f64> = (0..3).map(|i| (1.0 - y[i] * y[i]) * rh[i]).collect();
            let yid = tape.record_with_output(y, Some(ry), vec![3], |out| TapeOp::Tanh { input: hid, out });
            tape.set_grad_r(yid, vec![1.0; 3], vec![0.0; 3]);
            tape.backward_ops(0..tape.num_ops());
            (tape.get_param_grad(pid), tape.get_param_grad_r(pid))
        };

        let (_, hv) = grad_at(&p0[..]);
        let eps = 1e-6;
        let plus: Vec<f64> = p0.iter().zip(v.iter()).map(|(p, d)| p + eps * d).collect();
        let minus: Vec<f64> = p0.iter().zip(v.iter()).map(|(p, d)| p - eps * d).collect();
        let (gp, _) = grad_at(&plus[..]);
        let (gm, _) = grad_at(&minus[..]);
        let fd: Vec<f64> = gp.iter().zip(gm.iter()).map(|(a, b)| (a - b) / (2.0 * eps)).collect();
        assert_close(&hv, &fd, 1e-7, "Hv");
    }

    #[test]
    fn test_r_backward_scale_by_and_mul() {
        // out = s * (a * b), loss = sum(out); R along (Ra, Rb, Rs)
        let mut tape = Tape::with_sensitivity();
        let a = tape.register_param_r(&[1.0, 2.0], &[1.0, 0.0], vec![2]);
        let b = tape.register_param_r(&[3.0, 4.0], &[0.0, 1.0], vec![2]);
        let s = tape.register_param_r(&[2.0], &[1.0], vec![1]);
        let ab = tape.record_with_output(vec![3.0, 8.0], Some(vec![3.0, 2.0]), vec![2],
            |out| TapeOp::Mul { a, b, out });
        let out = tape.record_with_output(vec![6.0, 16.0], Some(vec![9.0, 12.0]), vec![2],
            |out| TapeOp::ScaleBy { input: ab, scalar: s, out });
        tape.set_grad_r(out, vec![1.0, 1.0], vec![0.0, 0.0]);
        tape.backward_ops(0..tape.num_ops());
        // L = s Σ a_i b_i. d_a = s b, d_b = s a, d_s = Σ a b
        assert_eq!(tape.get_param_grad(a), vec![6.0, 8.0]);
        assert_eq!(tape.get_param_grad(b), vec![2.0, 4.0]);
        assert_eq!(tape.get_param_grad(s), vec![11.0]);
        // R{d_a} = Rs b + s Rb = [3, 4] + [0, 2]
        assert_eq!(tape.get_param_grad_r(a), vec![3.0, 6.0]);
        // R{d_b} = Rs a + s Ra = [1, 2] + [2, 0]
        assert_eq!(tape.get_param_grad_r(b), vec![3.0, 2.0]);
        // R{d_s} = Σ (Ra b + a Rb) = 3 + 2
        assert_eq!(tape.get_param_grad_r(s), vec![5.0]);
    }
}
