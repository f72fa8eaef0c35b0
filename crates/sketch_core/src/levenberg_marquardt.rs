use crate::equation_engine::{CompileError, EquationError, EvalError, SyntaxError};
use crate::linalg;
use crate::traits::ResidualSystem;
use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LmSettings {
    pub initial_lambda: f64,
    pub lambda_up: f64,
    pub lambda_down: f64,
    pub epsilon: f64,
    /// `None` runs until one of the convergence tests fires.
    pub max_steps: Option<usize>,
}

impl Default for LmSettings {
    fn default() -> Self {
        Self {
            initial_lambda: 10.0,
            lambda_up: 10.0,
            lambda_down: 10.0,
            epsilon: 1e-5,
            max_steps: None,
        }
    }
}

impl LmSettings {
    pub fn validate(&self) -> Result<(), SolveError> {
        if !(self.epsilon > 0.0) {
            return Err(SolveError::InvalidSettings("epsilon must be positive.".into()));
        }
        if !(self.initial_lambda > 0.0) {
            return Err(SolveError::InvalidSettings("initial_lambda must be positive.".into()));
        }
        if !(self.lambda_up > 1.0) || !(self.lambda_down > 1.0) {
            return Err(SolveError::InvalidSettings(
                "lambda_up and lambda_down must be greater than one.".into(),
            ));
        }
        if self.max_steps == Some(0) {
            return Err(SolveError::InvalidSettings("max_steps must be greater than zero.".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SolveError {
    #[error(transparent)]
    Equation(#[from] EquationError),
    #[error("Levenberg-Marquardt diverged at step {step}: {reason}")]
    NonConvergent { step: usize, reason: String },
    #[error("Invalid solver settings: {0}")]
    InvalidSettings(String),
}

impl From<SyntaxError> for SolveError {
    fn from(err: SyntaxError) -> Self {
        Self::Equation(err.into())
    }
}

impl From<CompileError> for SolveError {
    fn from(err: CompileError) -> Self {
        Self::Equation(err.into())
    }
}

impl From<EvalError> for SolveError {
    fn from(err: EvalError) -> Self {
        Self::Equation(err.into())
    }
}

/// Why the iteration stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Termination {
    /// Total error fell below epsilon.
    ErrorBelowEpsilon,
    /// Every Jacobian entry fell below epsilon.
    FlatJacobian,
    /// Consecutive errors differ by less than epsilon.
    Stalled,
    /// The step budget ran out.
    MaxSteps,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LmResult {
    /// Last accepted assignment, in the system's variable order.
    pub state: Vec<f64>,
    pub error: f64,
    pub iterations: usize,
    pub lambda: f64,
    pub termination: Termination,
}

/// `0.5 * sum(r_i^2)`.
pub fn total_error(residuals: &DVector<f64>) -> f64 {
    0.5 * residuals.norm_squared()
}

/// Damped Gauss-Newton iteration on `system` starting from `initial_guess`.
///
/// Each step solves `(JᵗJ + λI) Δ = Jᵗr` and tries `x - Δ`. An improvement
/// is accepted (λ shrinks, the Jacobian is rebuilt); otherwise λ grows and
/// the same Jacobian is reused. A non-finite step or starting error is
/// reported as `NonConvergent`.
pub fn solve<S>(
    system: &S,
    initial_guess: &[f64],
    settings: LmSettings,
) -> Result<LmResult, SolveError>
where
    S: ResidualSystem + ?Sized,
{
    settings.validate()?;

    let n = system.variable_count();
    let m = system.residual_count();
    if initial_guess.len() != n {
        return Err(EvalError::ArgumentCount {
            expected: n,
            found: initial_guess.len(),
        }
        .into());
    }

    let mut state = initial_guess.to_vec();
    let mut residuals = DVector::zeros(m);
    let mut jacobian = DMatrix::zeros(m, n);
    system.linearize(&state, &mut residuals, &mut jacobian)?;
    let mut error = total_error(&residuals);
    if !error.is_finite() {
        return Err(SolveError::NonConvergent {
            step: 0,
            reason: "residual at the initial guess is not finite".into(),
        });
    }

    let mut trial_residuals = DVector::zeros(m);
    let mut trial_jacobian = DMatrix::zeros(m, n);
    let mut hessian = DMatrix::<f64>::zeros(n, n);
    let mut gradient = DVector::<f64>::zeros(n);
    let mut lambda = settings.initial_lambda;
    let mut stale = true;
    let mut iterations = 0usize;

    let termination = loop {
        if settings.max_steps.is_some_and(|max| iterations >= max) {
            break Termination::MaxSteps;
        }
        iterations += 1;

        if stale {
            let transposed = jacobian.transpose();
            hessian = &transposed * &jacobian;
            gradient = &transposed * &residuals;
            stale = false;
        }

        let mut damped = hessian.clone();
        for i in 0..n {
            damped[(i, i)] += lambda;
        }
        let delta = linalg::lu_solve(damped, &gradient).map_err(|e| SolveError::NonConvergent {
            step: iterations,
            reason: e.to_string(),
        })?;
        if delta.iter().any(|d| !d.is_finite()) {
            return Err(SolveError::NonConvergent {
                step: iterations,
                reason: "linear solve produced a non-finite step".into(),
            });
        }

        let trial: Vec<f64> = state.iter().zip(delta.iter()).map(|(x, d)| x - d).collect();
        system.linearize(&trial, &mut trial_residuals, &mut trial_jacobian)?;
        let trial_error = total_error(&trial_residuals);

        if trial_error < error {
            let previous = error;
            state = trial;
            std::mem::swap(&mut residuals, &mut trial_residuals);
            std::mem::swap(&mut jacobian, &mut trial_jacobian);
            error = trial_error;
            lambda /= settings.lambda_down;
            stale = true;
            debug!(step = iterations, error, lambda, "accepted step");

            if error < settings.epsilon {
                break Termination::ErrorBelowEpsilon;
            }
            if jacobian.iter().all(|d| d.abs() < settings.epsilon) {
                break Termination::FlatJacobian;
            }
            if (previous - error).abs() < settings.epsilon {
                break Termination::Stalled;
            }
        } else {
            lambda *= settings.lambda_up;
            debug!(step = iterations, error, trial_error, lambda, "rejected step");

            // Once λ dwarfs the curvature the step vanishes and the trial
            // error cannot move any more.
            if (error - trial_error).abs() < settings.epsilon || !lambda.is_finite() {
                break Termination::Stalled;
            }
        }
    };

    debug!(?termination, iterations, error, "levenberg-marquardt finished");

    Ok(LmResult {
        state,
        error,
        iterations,
        lambda,
        termination,
    })
}
