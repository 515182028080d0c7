//! shared error types and status codes used throughout the crate
use std::error::Error;
use std::fmt;

/// Outcome of a linear solve requested by the time integrator.
///
/// `Recoverable` corresponds to the +1 return convention of the solve
/// callback: a diagonal block failed to factorize or the Schur iteration did
/// not converge, and the integrator may retry with a smaller step. `Fatal`
/// (-1) aborts the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinearSolveStatus {
    Ok,
    Recoverable,
    Fatal,
}

impl LinearSolveStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, LinearSolveStatus::Ok)
    }
}

#[derive(Debug)]
pub enum SimulatorError {
    /// Configuration missing or malformed; fatal to the run.
    InvalidParameter(String),
    /// The BDF integrator reported an unrecoverable error after retries.
    /// Carries the last (real) time reached.
    IntegrationFailure { message: String, t_reached: f64 },
    /// The binding algebraic solver did not reach the requested tolerance.
    AlgebraicSolveFailure { cell: usize, shell: usize, residual: f64 },
    /// Structural error, e.g. an invariant of the block solver was violated.
    Internal(String),
}

impl SimulatorError {
    /// Exit-code category for an enclosing command line front-end:
    /// configuration errors map to 2, solver failures to 3, everything
    /// else to 1 (0 is reserved for normal completion).
    pub fn exit_code(&self) -> i32 {
        match self {
            SimulatorError::InvalidParameter(_) => 2,
            SimulatorError::IntegrationFailure { .. } => 3,
            SimulatorError::AlgebraicSolveFailure { .. } => 3,
            SimulatorError::Internal(_) => 1,
        }
    }
}

impl fmt::Display for SimulatorError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SimulatorError::InvalidParameter(msg) => {
                write!(f, "invalid parameter: {}", msg)
            }
            SimulatorError::IntegrationFailure { message, t_reached } => {
                write!(
                    f,
                    "time integration failed at t = {}: {}",
                    t_reached, message
                )
            }
            SimulatorError::AlgebraicSolveFailure {
                cell,
                shell,
                residual,
            } => {
                write!(
                    f,
                    "algebraic consistent initialization failed in cell {} shell {} (residual {})",
                    cell, shell, residual
                )
            }
            SimulatorError::Internal(msg) => write!(f, "internal error: {}", msg),
        }
    }
}

impl Error for SimulatorError {}
