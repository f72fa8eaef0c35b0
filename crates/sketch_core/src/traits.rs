use crate::equation_engine::EvalError;
use nalgebra::{DMatrix, DVector};

/// A system of residual equations over a fixed variable ordering.
pub trait ResidualSystem {
    /// Number of variables (Jacobian columns).
    fn variable_count(&self) -> usize;

    /// Number of residual equations (Jacobian rows).
    fn residual_count(&self) -> usize;

    /// Evaluates every residual at `x`.
    /// residuals: buffer of length `residual_count()`
    /// jacobian: `residual_count() x variable_count()` buffer, one row per equation
    fn linearize(
        &self,
        x: &[f64],
        residuals: &mut DVector<f64>,
        jacobian: &mut DMatrix<f64>,
    ) -> Result<(), EvalError>;
}
