//! Error types for the execution engine.

use labflow_config::ConfigError;
use labflow_types::DeviceError;
use thiserror::Error;

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors raised while building a lab or running workflows.
///
/// None of these are retried inside the engine. An action that hits one
/// moves to `ERRORED` and hands the error back to its thread.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A resource was used in a state that does not allow the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A device driver failed. Propagated unchanged.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// No transporter chain connects the two locations.
    #[error("No route found from '{from}' to '{to}'")]
    NoRouteFound { from: String, to: String },

    /// Every member of the pool is uninitialized or unreachable.
    #[error("No available member in resource pool '{pool}'")]
    NoAvailableMember { pool: String },

    /// A transporter was asked to reach a position it was never taught.
    #[error("Position '{position}' is not taught for transporter '{transporter}'")]
    PositionNotTaught {
        transporter: String,
        position: String,
    },

    /// Registry lookup found nothing.
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// Registry lookup by name found more than one match.
    #[error("{kind} '{name}' is ambiguous ({count} matches)")]
    Ambiguous {
        kind: &'static str,
        name: String,
        count: usize,
    },

    /// The reservation manager refused the claim.
    #[error("Reservation rejected for '{resource}'")]
    ReservationRejected { resource: String },

    /// The claim was chosen to break a wait cycle.
    #[error("Reservation for '{resource}' deadlocked")]
    Deadlocked { resource: String },

    /// The target is held by labware that will never leave.
    #[error("Location '{location}' is occupied by '{labware}'")]
    TargetOccupied { location: String, labware: String },

    /// The thread was asked to stop.
    #[error("Stopped")]
    Stopped,

    /// Catalog or settings problem.
    #[error("Config error: {0}")]
    Config(String),
}

impl EngineError {
    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn not_found(kind: &'static str, key: impl ToString) -> Self {
        Self::NotFound {
            kind,
            key: key.to_string(),
        }
    }

    /// True for the cooperative stop signal.
    pub fn is_stop(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        EngineError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_error_is_transparent() {
        let err: EngineError = DeviceError::not_initialized("reader_1").into();
        assert_eq!(err.to_string(), DeviceError::not_initialized("reader_1").to_string());
    }

    #[test]
    fn test_config_error_conversion() {
        let err: EngineError = ConfigError::Invalid("bad".into()).into();
        assert!(matches!(err, EngineError::Config(ref m) if m.contains("bad")));
    }

    #[test]
    fn test_is_stop() {
        assert!(EngineError::Stopped.is_stop());
        assert!(!EngineError::invalid_state("x").is_stop());
    }
}
