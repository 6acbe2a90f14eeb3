//! Custom error types for the application.
//!
//! This module defines the primary error type, `OpoError`, shared by the OPO link,
//! the wavemeter sampler, and the energy targeting controller. Using the `thiserror`
//! crate, it keeps every failure path explicit so callers can decide whether an error
//! is fatal for a single targeting attempt or for the whole session.
//!
//! ## Error Hierarchy
//!
//! - **`Validation`**: A local bounds check failed. No bytes were written to the
//!   controller.
//! - **`OutOfRange`**: A requested photon energy lies outside all four IR bands.
//!   Like `Validation`, this is rejected before any hardware interaction.
//! - **`Protocol`**: The OPO controller answered with one of its fault codes (1-7).
//!   The link remains usable for subsequent commands.
//! - **`Connection`**: Socket-level failure. Reconnection must be requested explicitly.
//! - **`TooManyFailures`**: Too many failed wavemeter polls during a sampling burst.
//!   Aborts only the current targeting attempt.
//! - **`Timeout`** / **`Cancelled`**: A bounded wait expired or was cancelled by the caller.
//!
//! By using `#[from]`, `OpoError` can be created directly from I/O and configuration
//! errors, so the `?` operator works across the crate.

use crate::opo::protocol::ErrorCode;
use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, OpoError>;

/// Primary error type for OPO control.
#[derive(Error, Debug)]
pub enum OpoError {
    /// Local bounds check failed before any network I/O.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Requested wavenumber is outside every defined band.
    #[error("Wavenumber {0} cm-1 is outside all IR bands")]
    OutOfRange(f64),

    /// Controller returned a fault code.
    #[error("OPO controller error {}: {code}", .code.code())]
    Protocol {
        /// Decoded fault code
        code: ErrorCode,
    },

    /// Socket-level failure or link not connected.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Wavemeter sampling aborted.
    #[error("Measurement error: {failures} failed polls exceeded the limit of {limit}")]
    TooManyFailures {
        /// Failed polls counted so far
        failures: usize,
        /// Maximum tolerated failed polls
        limit: usize,
    },

    /// Statistics requested on an empty sample set.
    #[error("Cannot reduce an empty sample set")]
    EmptySet,

    /// Operation rejected because the OPO is busy.
    #[error("OPO is busy: {0}")]
    Busy(String),

    /// A bounded wait expired.
    #[error("Timed out after {0:?} waiting for {1}")]
    Timeout(std::time::Duration, &'static str),

    /// A polling loop was cancelled by the caller.
    #[error("Operation cancelled: {0}")]
    Cancelled(&'static str),

    /// Wavemeter collaborator failure.
    #[error("Wavemeter error: {0}")]
    Wavemeter(String),

    /// Configuration could not be loaded.
    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    /// Configuration loaded but is semantically invalid.
    #[error("Configuration validation error: {0}")]
    Configuration(String),

    /// File or network I/O.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Measurement record (de)serialization.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<figment::Error> for OpoError {
    fn from(err: figment::Error) -> Self {
        OpoError::Config(Box::new(err))
    }
}

impl OpoError {
    /// Short machine-friendly label used in structured log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            OpoError::Validation(_) => "validation",
            OpoError::OutOfRange(_) => "out_of_range",
            OpoError::Protocol { .. } => "protocol",
            OpoError::Connection(_) | OpoError::Io(_) => "connection",
            OpoError::TooManyFailures { .. } | OpoError::EmptySet | OpoError::Wavemeter(_) => {
                "measurement"
            }
            OpoError::Busy(_) => "busy",
            OpoError::Timeout(..) => "timeout",
            OpoError::Cancelled(_) => "cancelled",
            OpoError::Config(_) | OpoError::Configuration(_) => "configuration",
            OpoError::Serialization(_) => "serialization",
        }
    }

    /// Whether the error was raised locally without touching the hardware.
    pub fn is_local_rejection(&self) -> bool {
        matches!(self, OpoError::Validation(_) | OpoError::OutOfRange(_))
    }

    /// Whether the link itself is gone and must be reconnected.
    pub fn is_connection_loss(&self) -> bool {
        matches!(self, OpoError::Connection(_) | OpoError::Io(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OpoError::Validation("wavelength 900 nm outside 710-880 nm".to_string());
        assert_eq!(
            err.to_string(),
            "Validation error: wavelength 900 nm outside 710-880 nm"
        );
    }

    #[test]
    fn test_protocol_error_names_code() {
        let err = OpoError::Protocol {
            code: ErrorCode::GotoAlreadyActive,
        };
        let msg = err.to_string();
        assert!(msg.contains("error 5"));
        assert!(msg.contains("A GoTo Operation Is Already Active"));
        assert_eq!(err.kind(), "protocol");
    }

    #[test]
    fn test_error_classification() {
        assert!(OpoError::OutOfRange(100.0).is_local_rejection());
        assert!(!OpoError::EmptySet.is_local_rejection());
        assert!(OpoError::Connection("reset".into()).is_connection_loss());
        assert_eq!(
            OpoError::TooManyFailures {
                failures: 6,
                limit: 5
            }
            .kind(),
            "measurement"
        );
    }
}
