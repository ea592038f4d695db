//! CLI error types.

use std::fmt;

use wg_manager::{DriverError, ReconcileError, ValidationError, WireGuardError};

/// CLI-specific errors.
#[derive(Debug)]
pub enum CliError {
    /// The configuration file could not be read or parsed.
    Config(String),
    /// The configuration is structurally invalid.
    Invalid(ValidationError),
    /// A key given on the command line or stdin is malformed.
    Key(WireGuardError),
    /// The reconcile could not run to the end.
    Reconcile(ReconcileError),
    /// Talking to the device failed.
    Driver(DriverError),
    /// The reconcile ran but left work undone.
    Unconverged(String),
    /// Output formatting error.
    Format(String),
    /// IO error.
    Io(std::io::Error),
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {msg}"),
            Self::Invalid(e) => write!(f, "{e}"),
            Self::Key(e) => write!(f, "{e}"),
            Self::Reconcile(e) => write!(f, "{e}"),
            Self::Driver(e) => write!(f, "{e}"),
            Self::Unconverged(msg) => write!(f, "not converged: {msg}"),
            Self::Format(msg) => write!(f, "format error: {msg}"),
            Self::Io(e) => write!(f, "IO error: {e}"),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Invalid(e) => Some(e),
            Self::Key(e) => Some(e),
            Self::Reconcile(e) => Some(e),
            Self::Driver(e) => Some(e),
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for CliError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

impl From<ValidationError> for CliError {
    fn from(err: ValidationError) -> Self {
        Self::Invalid(err)
    }
}

impl From<WireGuardError> for CliError {
    fn from(err: WireGuardError) -> Self {
        match err {
            WireGuardError::Validation(e) => Self::Invalid(e),
            WireGuardError::ParseError { .. } => Self::Config(err.to_string()),
            other => Self::Key(other),
        }
    }
}

impl From<ReconcileError> for CliError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::Validation(e) => Self::Invalid(e),
            other => Self::Reconcile(other),
        }
    }
}

impl From<DriverError> for CliError {
    fn from(err: DriverError) -> Self {
        Self::Driver(err)
    }
}
