//! Small dense helpers for correlated draws. Matrices are tiny (one row per
//! asset), so a hand-rolled factorization beats pulling in a BLAS stack.

use crate::error::{PlanError, PlanResult};

const SYMMETRY_TOL: f64 = 1e-8;
const PIVOT_TOL: f64 = 1e-10;

/// Check shape, symmetry, unit diagonal and the [-1, 1] range.
pub fn validate_correlation(matrix: &[Vec<f64>], n: usize, label: &str) -> PlanResult<()> {
    if matrix.len() != n || matrix.iter().any(|row| row.len() != n) {
        return Err(PlanError::config(format!(
            "{label}: correlation matrix must be {n}x{n}"
        )));
    }
    for i in 0..n {
        if (matrix[i][i] - 1.0).abs() > SYMMETRY_TOL {
            return Err(PlanError::config(format!(
                "{label}: correlation diagonal [{i}][{i}] = {} (expected 1)",
                matrix[i][i]
            )));
        }
        for j in 0..n {
            let v = matrix[i][j];
            if !v.is_finite() || !(-1.0 - SYMMETRY_TOL..=1.0 + SYMMETRY_TOL).contains(&v) {
                return Err(PlanError::config(format!(
                    "{label}: correlation [{i}][{j}] = {v} outside [-1, 1]"
                )));
            }
            if (v - matrix[j][i]).abs() > SYMMETRY_TOL {
                return Err(PlanError::config(format!(
                    "{label}: correlation not symmetric at [{i}][{j}]"
                )));
            }
        }
    }
    Ok(())
}

/// Row-major lower-triangular factor `L` with `L Lᵀ = A`.
#[derive(Debug, Clone, PartialEq)]
pub struct LowerTriangular {
    n: usize,
    data: Vec<f64>,
}

impl LowerTriangular {
    pub fn identity(n: usize) -> Self {
        let mut data = vec![0.0; n * n];
        for i in 0..n {
            data[i * n + i] = 1.0;
        }
        Self { n, data }
    }

    pub fn dim(&self) -> usize {
        self.n
    }

    pub fn get(&self, i: usize, j: usize) -> f64 {
        self.data[i * self.n + j]
    }

    /// `out = L z`. Both slices have length `dim()`.
    pub fn apply(&self, z: &[f64], out: &mut [f64]) {
        let n = self.n;
        for i in 0..n {
            let row = &self.data[i * n..i * n + i + 1];
            out[i] = row.iter().zip(&z[..=i]).map(|(l, z)| l * z).sum();
        }
    }
}

/// Cholesky factorization that tolerates positive semi-definite input.
///
/// A zero pivot is accepted when the rest of its column is also zero (e.g.
/// two perfectly correlated assets); the factor then carries a zero column.
/// Anything else that fails to factor is reported against `label`.
pub fn cholesky_psd(matrix: &[Vec<f64>], label: &str) -> PlanResult<LowerTriangular> {
    let n = matrix.len();
    let mut l = vec![0.0; n * n];
    for j in 0..n {
        let d = matrix[j][j] - (0..j).map(|k| l[j * n + k] * l[j * n + k]).sum::<f64>();
        if d < -PIVOT_TOL {
            return Err(PlanError::numerical(
                label,
                format!("matrix is not positive semi-definite (pivot {j} = {d:.3e})"),
            ));
        }
        if d <= PIVOT_TOL {
            for i in (j + 1)..n {
                let v = matrix[i][j] - (0..j).map(|k| l[i * n + k] * l[j * n + k]).sum::<f64>();
                if v.abs() > 1e-8 {
                    return Err(PlanError::numerical(
                        label,
                        format!("matrix is not positive semi-definite (zero pivot {j}, residual {v:.3e} at row {i})"),
                    ));
                }
            }
            continue;
        }
        let pivot = d.sqrt();
        l[j * n + j] = pivot;
        for i in (j + 1)..n {
            let v = matrix[i][j] - (0..j).map(|k| l[i * n + k] * l[j * n + k]).sum::<f64>();
            l[i * n + j] = v / pivot;
        }
    }
    Ok(LowerTriangular { n, data: l })
}
