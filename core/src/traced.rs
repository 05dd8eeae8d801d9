/// Traced wrappers: tape-aware computation that records ops for backward.
///
/// Each wrapper:
///   1. Reads inputs from the tape arena (clones to release the borrow)
///   2. Computes the value with the same tensor kernels the tape-free path uses
///   3. On a sensitivity tape, computes R{out} from R{inputs}
///   4. Allocates the output, records the TapeOp, returns its BufId
///
/// Step 2 keeps the traced forward bitwise identical to `dense::forward_step`.

use crate::tape::{BufId, Tape, TapeOp};
use crate::tensor;

fn r_of(tape: &Tape, id: BufId) -> Vec<f64> {
    tape.sensitivity_of(id).to_vec()
}

fn zip_map(a: &[f64], b: &[f64], f: impl Fn(f64, f64) -> f64) -> Vec<f64> {
    assert_eq!(a.len(), b.len(), "element-wise op on lengths {} and {}", a.len(), b.len());
    a.iter().zip(b.iter()).map(|(&x, &y)| f(x, y)).collect()
}

/// out = M @ x, M: [rows, cols].
pub fn traced_matvec(tape: &mut Tape, mat: BufId, vec: BufId, rows: usize, cols: usize) -> BufId {
    let m = tape.buf_data(mat).to_vec();
    let x = tape.buf_data(vec).to_vec();
    assert_eq!(m.len(), rows * cols, "traced_matvec: matrix has {} values, expected {rows}x{cols}", m.len());
    assert_eq!(x.len(), cols, "traced_matvec: vector has {} values, expected {cols}", x.len());
    let mut out = vec![0.0f64; rows];
    tensor::matvec_f64(&m, &x, &mut out, rows, cols);

    let r = if tape.has_sensitivity() {
        // R{out} = R{M} @ x + M @ R{x}
        let mut r_out = vec![0.0f64; rows];
        let mut tmp = vec![0.0f64; rows];
        tensor::matvec_f64(&r_of(tape, mat), &x, &mut r_out, rows, cols);
        tensor::matvec_f64(&m, &r_of(tape, vec), &mut tmp, rows, cols);
        tensor::axpy_f64(1.0, &tmp, &mut r_out);
        Some(r_out)
    } else {
        None
    };
    tape.record_with_output(out, r, vec![rows], |out| {
        TapeOp::MatVec { mat, vec, out, rows, cols }
    })
}

/// Element-wise add: out = a + b.
pub fn traced_add(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let out = zip_map(tape.buf_data(a), tape.buf_data(b), |x, y| x + y);
    let r = if tape.has_sensitivity() {
        Some(zip_map(tape.sensitivity_of(a), tape.sensitivity_of(b), |x, y| x + y))
    } else {
        None
    };
    let shape = tape.buf_shape(a).to_vec();
    tape.record_with_output(out, r, shape, |out| TapeOp::Add { a, b, out })
}

/// Element-wise product: out = a * b.
pub fn traced_mul(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let a_data = tape.buf_data(a).to_vec();
    let b_data = tape.buf_data(b).to_vec();
    let out = zip_map(&a_data, &b_data, |x, y| x * y);
    let r = if tape.has_sensitivity() {
        // R{out} = R{a} * b + a * R{b}
        let ra = r_of(tape, a);
        let rb = r_of(tape, b);
        Some((0..out.len()).map(|i| ra[i] * b_data[i] + a_data[i] * rb[i]).collect())
    } else {
        None
    };
    let shape = tape.buf_shape(a).to_vec();
    tape.record_with_output(out, r, shape, |out| TapeOp::Mul { a, b, out })
}

/// Broadcast a one-element buffer over a tensor: out = s * input.
pub fn traced_scale_by(tape: &mut Tape, input: BufId, scalar: BufId) -> BufId {
    assert_eq!(tape.buf_numel(scalar), 1, "traced_scale_by: scalar buffer has {} values", tape.buf_numel(scalar));
    let a = tape.buf_data(input).to_vec();
    let s = tape.buf_data(scalar)[0];
    let out: Vec<f64> = a.iter().map(|&x| s * x).collect();
    let r = if tape.has_sensitivity() {
        // R{out} = R{s} * input + s * R{input}
        let rs = tape.sensitivity_of(scalar)[0];
        let ra = r_of(tape, input);
        Some((0..a.len()).map(|i| rs * a[i] + s * ra[i]).collect())
    } else {
        None
    };
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, r, shape, |out| TapeOp::ScaleBy { input, scalar, out })
}

/// Outer product: out[d1, d2] = a[d1] * b[d2].
pub fn traced_outer(tape: &mut Tape, a: BufId, b: BufId) -> BufId {
    let a_data = tape.buf_data(a).to_vec();
    let b_data = tape.buf_data(b).to_vec();
    let (d1, d2) = (a_data.len(), b_data.len());
    let mut out = vec![0.0f64; d1 * d2];
    tensor::outer_product_f64(&a_data, &b_data, &mut out);
    let r = if tape.has_sensitivity() {
        // R{out} = R{a} ⊗ b + a ⊗ R{b}
        let mut r_out = vec![0.0f64; d1 * d2];
        tensor::outer_product_f64(&r_of(tape, a), &b_data, &mut r_out);
        tensor::outer_acc_f64(&a_data, &r_of(tape, b), &mut r_out);
        Some(r_out)
    } else {
        None
    };
    tape.record_with_output(out, r, vec![d1, d2], |out| TapeOp::OuterProduct { a, b, out })
}

/// out = 1 - input.
pub fn traced_one_minus(tape: &mut Tape, input: BufId) -> BufId {
    let out: Vec<f64> = tape.buf_data(input).iter().map(|&x| 1.0 - x).collect();
    let r = if tape.has_sensitivity() {
        Some(tape.sensitivity_of(input).iter().map(|&x| -x).collect())
    } else {
        None
    };
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, r, shape, |out| TapeOp::OneMinus { input, out })
}

/// Element-wise sigmoid.
pub fn traced_sigmoid(tape: &mut Tape, input: BufId) -> BufId {
    let out: Vec<f64> = tape.buf_data(input).iter().map(|&x| tensor::sigmoid_f64(x)).collect();
    let r = if tape.has_sensitivity() {
        let rx = tape.sensitivity_of(input);
        Some(out.iter().zip(rx.iter()).map(|(&s, &r)| s * (1.0 - s) * r).collect())
    } else {
        None
    };
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, r, shape, |out| TapeOp::Sigmoid { input, out })
}

/// Element-wise tanh.
pub fn traced_tanh(tape: &mut Tape, input: BufId) -> BufId {
    let out: Vec<f64> = tape.buf_data(input).iter().map(|&x| x.tanh()).collect();
    let r = if tape.has_sensitivity() {
        let rx = tape.sensitivity_of(input);
        Some(out.iter().zip(rx.iter()).map(|(&y, &r)| (1.0 - y * y) * r).collect())
    } else {
        None
    };
    let shape = tape.buf_shape(input).to_vec();
    tape.record_with_output(out, r, shape, |out| TapeOp::Tanh { input, out })
}
