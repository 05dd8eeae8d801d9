/// Per-step loss helpers producing upstream seeds for the reverse sweep.

use crate::error::{expect_len, HebbError};

/// L = ½ Σ (y - t)². Returns (L, dL/dy).
pub fn half_squared_error(y: &[f64], target: &[f64]) -> Result<(f64, Vec<f64>), HebbError> {
    expect_len("target", y.len(), target.len())?;
    let grad: Vec<f64> = y.iter().zip(target.iter()).map(|(a, b)| a - b).collect();
    let loss = 0.5 * grad.iter().map(|d| d * d).sum::<f64>();
    Ok((loss, grad))
}

/// Same loss along a direction: also returns R{dL/dy} = R{y}, since the
/// Hessian of L in y is the identity and the target is constant.
pub fn half_squared_error_r(y: &[f64], r_y: &[f64], target: &[f64]) -> Result<(f64, Vec<f64>, Vec<f64>), HebbError> {
    expect_len("output sensitivity", y.len(), r_y.len())?;
    let (loss, grad) = half_squared_error(y, target)?;
    Ok((loss, grad, r_y.to_vec()))
}
