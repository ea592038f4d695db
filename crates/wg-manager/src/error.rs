//! Error types for WireGuard configuration management.

use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

use crate::driver::DriverOperation;
use crate::reconciler::ReconcileResult;

/// Result alias for key, parsing and model errors.
pub type Result<T> = std::result::Result<T, WireGuardError>;

/// Errors raised while decoding keys or parsing configuration text.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireGuardError {
    /// Key text is not a 44-character Base64 encoding of 32 bytes.
    #[error("invalid key encoding: {0}")]
    InvalidKeyEncoding(String),

    /// Invalid CIDR notation.
    #[error("invalid CIDR: {0}")]
    InvalidCidr(String),

    /// Invalid endpoint (host and port).
    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// Configuration file parse error.
    #[error("parse error at line {line}: {message}")]
    ParseError {
        /// Line number (1-based, 0 when not tied to a line).
        line: usize,
        /// Error message.
        message: String,
    },

    /// The parsed configuration is structurally invalid.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Bad input shape. Caller's fault, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    /// Path of the offending field, e.g. `mtu` or `peers[1].allowed_ips`.
    pub field: String,
    /// Human-readable reason.
    pub reason: String,
}

impl ValidationError {
    /// Creates a validation error for `field`.
    #[must_use]
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

/// The OS control surface rejected an operation.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("{operation} failed: {cause}")]
pub struct DriverError {
    /// Operation that failed.
    pub operation: DriverOperation,
    /// Underlying cause as reported by the driver.
    pub cause: String,
}

impl DriverError {
    /// Creates a driver error for `operation`.
    #[must_use]
    pub fn new(operation: DriverOperation, cause: impl Into<String>) -> Self {
        Self {
            operation,
            cause: cause.into(),
        }
    }
}

/// A peer endpoint hostname could not be resolved within the retry bound.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("unable to resolve {host} after {attempts} attempt(s): {reason}")]
pub struct UnresolvedEndpoint {
    /// Hostname that failed to resolve.
    pub host: String,
    /// Number of lookups performed.
    pub attempts: u32,
    /// Last failure reason.
    pub reason: String,
}

/// Failure to obtain key material from a file reference.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum KeyStoreError {
    /// The reference escapes the key root directory.
    #[error("key file {path:?} is outside {root:?}")]
    OutsideRoot {
        /// Requested path.
        path: PathBuf,
        /// Configured root directory.
        root: PathBuf,
    },

    /// The key file could not be read.
    #[error("failed to read key file {path:?}: {message}")]
    Read {
        /// Resolved path.
        path: PathBuf,
        /// I/O error message.
        message: String,
    },

    /// The key file content is not a valid key.
    #[error("key file {path:?} does not hold a valid key: {message}")]
    Decode {
        /// Resolved path.
        path: PathBuf,
        /// Decoding error message.
        message: String,
    },
}

/// Failure isolated to a single peer. Reported in the result, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum PeerError {
    /// A driver call for this peer failed (after one retry).
    #[error(transparent)]
    Driver(#[from] DriverError),

    /// The peer is installed without an endpoint.
    #[error(transparent)]
    UnresolvedEndpoint(#[from] UnresolvedEndpoint),

    /// The peer's preshared key file could not be loaded.
    #[error(transparent)]
    KeyStore(#[from] KeyStoreError),

    /// The deadline expired or the reconcile was cancelled first.
    #[error("reconcile stopped before this peer was applied")]
    Incomplete,
}

/// Errors that abort a whole reconciliation.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The desired configuration is invalid.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// Another reconcile for the same interface is in flight. Retry later.
    #[error("reconcile already in progress for interface {interface}")]
    Busy {
        /// Interface name.
        interface: String,
    },

    /// The interface private key could not be loaded.
    #[error("private key unavailable: {0}")]
    KeyStore(#[from] KeyStoreError),

    /// Device-level setup failed; peers cannot exist without the device.
    #[error("device setup for {interface} failed: {error}")]
    Device {
        /// Interface name.
        interface: String,
        /// The failing driver call.
        error: DriverError,
        /// Work done before the failure.
        result: Box<ReconcileResult>,
    },
}

impl ReconcileError {
    /// Returns whether the caller should simply retry later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy { .. } | Self::Device { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_display_names_field() {
        let err = ValidationError::new("mtu", "must be between 1280 and 1420");
        assert_eq!(err.to_string(), "invalid mtu: must be between 1280 and 1420");
    }

    #[test]
    fn driver_error_display_names_operation() {
        let err = DriverError::new(DriverOperation::AddPeer, "no such device");
        assert_eq!(err.to_string(), "add_peer failed: no such device");
    }

    #[test]
    fn peer_error_serializes_with_kind_tag() {
        let err = PeerError::Incomplete;
        let json = serde_json::to_value(&err).expect("serialize");
        assert_eq!(json["kind"], "incomplete");
    }

    #[test]
    fn busy_is_retryable_validation_is_not() {
        let busy = ReconcileError::Busy {
            interface: "wg0".into(),
        };
        assert!(busy.is_retryable());

        let invalid = ReconcileError::from(ValidationError::new("mtu", "too large"));
        assert!(!invalid.is_retryable());
    }
}
