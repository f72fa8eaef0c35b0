//! Dense LU factorization with partial pivoting.
//!
//! Singular or nearly singular matrices are not detected: a zero pivot shows
//! up as infinite or NaN entries in the solution, and callers are expected to
//! check for non-finite output.

use nalgebra::{DMatrix, DVector};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinalgError {
    #[error("LU factorization needs a square matrix, got {rows}x{cols}")]
    NotSquare { rows: usize, cols: usize },
    #[error("Right-hand side has length {found}, expected {expected}")]
    DimensionMismatch { expected: usize, found: usize },
}

/// Packed `L` (unit lower, below the diagonal) and `U` (on and above it),
/// plus the row swapped into place at each elimination step.
#[derive(Debug, Clone, PartialEq)]
pub struct LuFactors {
    pub lu: DMatrix<f64>,
    pub pivots: Vec<usize>,
}

impl LuFactors {
    pub fn dimension(&self) -> usize {
        self.pivots.len()
    }
}

/// Factors `matrix` in place: at step `k` the row with the largest
/// `|a[j][k]|` (j >= k) is swapped up and recorded in `pivots[k]`.
pub fn factorize(mut matrix: DMatrix<f64>) -> Result<LuFactors, LinalgError> {
    let n = matrix.nrows();
    if matrix.ncols() != n {
        return Err(LinalgError::NotSquare {
            rows: n,
            cols: matrix.ncols(),
        });
    }

    let mut pivots = vec![0; n];
    for k in 0..n {
        let mut pivot_row = k;
        let mut max = matrix[(k, k)].abs();
        for j in (k + 1)..n {
            let candidate = matrix[(j, k)].abs();
            if max < candidate {
                max = candidate;
                pivot_row = j;
            }
        }
        pivots[k] = pivot_row;

        if pivot_row != k {
            matrix.swap_rows(k, pivot_row);
        }

        let pivot = matrix[(k, k)];
        for i in (k + 1)..n {
            matrix[(i, k)] /= pivot;
        }

        for i in (k + 1)..n {
            let factor = matrix[(i, k)];
            for j in (k + 1)..n {
                let upper = matrix[(k, j)];
                matrix[(i, j)] -= factor * upper;
            }
        }
    }

    Ok(LuFactors { lu: matrix, pivots })
}

/// Solves `A x = b` given the factors of `A`: applies the recorded swaps
/// to `b`, then forward and back substitution.
pub fn solve(factors: &LuFactors, rhs: &DVector<f64>) -> Result<DVector<f64>, LinalgError> {
    let n = factors.dimension();
    if rhs.len() != n {
        return Err(LinalgError::DimensionMismatch {
            expected: n,
            found: rhs.len(),
        });
    }

    let lu = &factors.lu;
    let mut x = rhs.clone();

    for i in 0..n {
        let p = factors.pivots[i];
        if p != i {
            x.swap_rows(i, p);
        }
        for j in 0..i {
            x[i] -= x[j] * lu[(i, j)];
        }
    }

    for i in (0..n).rev() {
        for j in (i + 1)..n {
            x[i] -= x[j] * lu[(i, j)];
        }
        x[i] /= lu[(i, i)];
    }

    Ok(x)
}

/// Factor and solve in one call.
pub fn lu_solve(matrix: DMatrix<f64>, rhs: &DVector<f64>) -> Result<DVector<f64>, LinalgError> {
    let factors = factorize(matrix)?;
    solve(&factors, rhs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn solves_system_requiring_pivoting() {
        // Zero in the top-left forces a row swap.
        let a = DMatrix::from_row_slice(3, 3, &[0.0, 2.0, 1.0, 1.0, 1.0, 1.0, 2.0, 1.0, 3.0]);
        let expected = DVector::from_vec(vec![1.0, -2.0, 3.0]);
        let b = &a * &expected;

        let x = lu_solve(a, &b).expect("solve");
        for (got, want) in x.iter().zip(expected.iter()) {
            assert!((got - want).abs() < 1e-12, "got {got}, want {want}");
        }
    }

    #[test]
    fn pivots_record_largest_column_entry() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 4.0, 3.0]);
        let factors = factorize(a).expect("factorize");
        assert_eq!(factors.pivots, vec![1, 1]);
        // L = [[1, 0], [0.25, 1]], U = [[4, 3], [0, 1.25]]
        assert!((factors.lu[(1, 0)] - 0.25).abs() < 1e-15);
        assert!((factors.lu[(0, 0)] - 4.0).abs() < 1e-15);
        assert!((factors.lu[(1, 1)] - 1.25).abs() < 1e-15);
    }

    #[test]
    fn factors_can_be_reused_for_several_right_hand_sides() {
        let a = DMatrix::from_row_slice(2, 2, &[4.0, 1.0, 1.0, 3.0]);
        let factors = factorize(a.clone()).expect("factorize");
        for rhs in [vec![1.0, 2.0], vec![-3.0, 0.5]] {
            let b = DVector::from_vec(rhs);
            let x = solve(&factors, &b).expect("solve");
            let residual = &a * &x - &b;
            assert!(residual.norm() < 1e-12);
        }
    }

    #[test]
    fn singular_matrix_yields_non_finite_solution() {
        let a = DMatrix::from_row_slice(2, 2, &[1.0, 2.0, 2.0, 4.0]);
        let b = DVector::from_vec(vec![1.0, 1.0]);
        let x = lu_solve(a, &b).expect("no explicit singularity check");
        assert!(x.iter().any(|v| !v.is_finite()));
    }

    #[test]
    fn shape_errors_are_reported() {
        let err = factorize(DMatrix::zeros(2, 3)).expect_err("not square");
        assert_eq!(err, LinalgError::NotSquare { rows: 2, cols: 3 });

        let factors = factorize(DMatrix::identity(2, 2)).expect("factorize");
        let err = solve(&factors, &DVector::zeros(3)).expect_err("wrong rhs length");
        assert_eq!(err, LinalgError::DimensionMismatch { expected: 2, found: 3 });
    }

    #[test]
    fn empty_system_is_trivial() {
        let x = lu_solve(DMatrix::zeros(0, 0), &DVector::zeros(0)).expect("empty");
        assert_eq!(x.len(), 0);
    }
}
