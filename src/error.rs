//! Error types for the balance controller.

use thiserror::Error;

use crate::robot::LegId;

/// Errors raised by one control tick.
///
/// `InvalidInput` and `NotRunning` are contract violations made by the caller.
/// The remaining variants are recoverable: the control loop answers them with a
/// safe fallback command.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ControlError {
    /// Malformed input, e.g. a non-positive tick duration.
    #[error("invalid input: {reason}")]
    InvalidInput { reason: String },

    /// No force set satisfies the contact constraints.
    #[error("infeasible force allocation: {reason}")]
    Infeasible { reason: String },

    /// The numerical solve did not converge within its budget.
    #[error("force allocation unsolvable: {reason}")]
    Unsolvable { reason: String },

    /// Stance legs whose Jacobian is singular at the current configuration.
    #[error("degenerate geometry for legs {legs:?}")]
    DegenerateGeometry { legs: Vec<LegId> },

    /// The control loop was asked to tick outside of `Running`.
    #[error("control loop is {mode}, not running")]
    NotRunning { mode: String },
}

impl ControlError {
    pub fn invalid_input(reason: impl Into<String>) -> Self {
        ControlError::InvalidInput {
            reason: reason.into(),
        }
    }

    /// Whether the control loop should catch this error and emit a fallback
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            ControlError::Infeasible { .. }
                | ControlError::Unsolvable { .. }
                | ControlError::DegenerateGeometry { .. }
        )
    }
}

/// Errors at the QP solve boundary.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum QpError {
    #[error("primal infeasible ({status})")]
    Infeasible { status: String },

    #[error("solver did not converge ({status})")]
    Unsolvable { status: String },

    #[error("malformed problem: {reason}")]
    BadProblem { reason: String },
}

impl From<QpError> for ControlError {
    fn from(err: QpError) -> Self {
        match &err {
            QpError::Infeasible { .. } => ControlError::Infeasible {
                reason: err.to_string(),
            },
            QpError::Unsolvable { .. } | QpError::BadProblem { .. } => ControlError::Unsolvable {
                reason: err.to_string(),
            },
        }
    }
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },
}

impl ConfigError {
    pub fn invalid(field: &str, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn recoverable_variants() {
        assert!(ControlError::Infeasible {
            reason: "no stance".into()
        }
        .is_recoverable());
        assert!(ControlError::Unsolvable {
            reason: "max iter".into()
        }
        .is_recoverable());
        assert!(ControlError::DegenerateGeometry {
            legs: vec![LegId::FrontLeft]
        }
        .is_recoverable());
        assert!(!ControlError::invalid_input("dt = 0").is_recoverable());
        assert!(!ControlError::NotRunning {
            mode: "Idle".into()
        }
        .is_recoverable());
    }

    #[test]
    fn qp_error_maps_onto_control_taxonomy() {
        let infeasible: ControlError = QpError::Infeasible {
            status: "PrimalInfeasible".into(),
        }
        .into();
        assert!(matches!(infeasible, ControlError::Infeasible { .. }));

        let timeout: ControlError = QpError::Unsolvable {
            status: "MaxTime".into(),
        }
        .into();
        assert!(matches!(timeout, ControlError::Unsolvable { .. }));
    }
}
