/// Flat tensor kernels for the dense Hebbian layer.
///
/// All operations are free functions on f64 slices with explicit dimensions.
/// Row-major layout throughout: an O×I matrix stores row `r` at `r*I..(r+1)*I`.

use rand::Rng;
use rand_distr::{Distribution, StandardNormal};

/// Matrix-vector product: out[R] = M[R,C] @ x[C].
/// `out` must be pre-allocated with R elements (will be overwritten).
pub fn matvec_f64(m: &[f64], x: &[f64], out: &mut [f64], rows: usize, cols: usize) {
    debug_assert_eq!(m.len(), rows * cols);
    debug_assert_eq!(x.len(), cols);
    debug_assert_eq!(out.len(), rows);

    for r in 0..rows {
        let mut sum = 0.0f64;
        for c in 0..cols {
            sum += m[r * cols + c] * x[c];
        }
        out[r] = sum;
    }
}

/// Transposed matrix-vector product with accumulation: out[C] += M[R,C]^T @ g[R].
pub fn matvec_t_acc_f64(m: &[f64], g: &[f64], out: &mut [f64], rows: usize, cols: usize) {
    debug_assert_eq!(m.len(), rows * cols);
    debug_assert_eq!(g.len(), rows);
    debug_assert_eq!(out.len(), cols);

    for r in 0..rows {
        let gr = g[r];
        for c in 0..cols {
            out[c] += m[r * cols + c] * gr;
        }
    }
}

/// Outer product: out[d1, d2] = a[d1] * b[d2]. Row-major.
pub fn outer_product_f64(a: &[f64], b: &[f64], out: &mut [f64]) {
    let d1 = a.len();
    let d2 = b.len();
    debug_assert_eq!(out.len(), d1 * d2);
    for i in 0..d1 {
        for j in 0..d2 {
            out[i * d2 + j] = a[i] * b[j];
        }
    }
}

/// Outer product with accumulation: out[d1, d2] += a[d1] * b[d2].
pub fn outer_acc_f64(a: &[f64], b: &[f64], out: &mut [f64]) {
    let d1 = a.len();
    let d2 = b.len();
    debug_assert_eq!(out.len(), d1 * d2);
    for i in 0..d1 {
        for j in 0..d2 {
            out[i * d2 + j] += a[i] * b[j];
        }
    }
}

/// Dot product of two equal-length slices.
pub fn dot_f64(a: &[f64], b: &[f64]) -> f64 {
    debug_assert_eq!(a.len(), b.len());
    let mut sum = 0.0f64;
    for i in 0..a.len() {
        sum += a[i] * b[i];
    }
    sum
}

/// y += alpha * x.
pub fn axpy_f64(alpha: f64, x: &[f64], y: &mut [f64]) {
    debug_assert_eq!(x.len(), y.len());
    for (yi, xi) in y.iter_mut().zip(x.iter()) {
        *yi += alpha * xi;
    }
}

/// Logistic sigmoid, evaluated on the branch that cannot overflow.
#[inline]
pub fn sigmoid_f64(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// Inverse of the sigmoid for p in (0, 1).
#[inline]
pub fn logit_f64(p: f64) -> f64 {
    (p / (1.0 - p)).ln()
}

/// Fill with uniform values in [-scale, scale].
pub fn fill_uniform<R: Rng>(rng: &mut R, buf: &mut [f64], scale: f64) {
    for v in buf.iter_mut() {
        *v = rng.gen_range(-scale..=scale);
    }
}

/// Fill with N(0, std²) samples.
pub fn fill_normal<R: Rng>(rng: &mut R, buf: &mut [f64], std: f64) {
    for v in buf.iter_mut() {
        let z: f64 = StandardNormal.sample(rng);
        *v = z * std;
    }
}
