//! Error types for safewatch.
//!
//! This module defines the crate-wide error type. Component-local errors
//! (location, share, store, guard, armer) live next to the component and are
//! folded in here so every failure surfaces with enough context for the caller
//! to decide between "retry", "stay active with a warning" and "refuse".

use std::path::PathBuf;
use thiserror::Error;

use crate::alert::{AlertId, AlertStatus};
use crate::armer::ArmError;
use crate::guard::GuardError;
use crate::services::{LocationError, StoreError};

/// The main error type for safewatch operations.
#[derive(Error, Debug)]
pub enum Error {
    // === Storage Errors ===
    /// Failed to open or create the database.
    #[error("failed to open database at {path}: {source}")]
    DatabaseOpen {
        /// Path to the database file.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: rusqlite::Error,
    },

    /// A database query failed.
    #[error("database query failed: {0}")]
    DatabaseQuery(#[from] rusqlite::Error),

    /// Failed to run database migrations.
    #[error("database migration failed: {message}")]
    DatabaseMigration {
        /// Description of what went wrong.
        message: String,
    },

    // === Configuration Errors ===
    /// Failed to load configuration.
    #[error("failed to load configuration: {0}")]
    ConfigLoad(Box<figment::Error>),

    /// Configuration validation failed, or a setting the flow depends on is
    /// missing (for example no trusted contacts).
    #[error("invalid configuration: {message}")]
    ConfigValidation {
        /// Description of the validation failure.
        message: String,
    },

    // === Alert Lifecycle Errors ===
    /// No location could be resolved, so no alert was created.
    #[error("no location available: {0}")]
    LocationUnavailable(#[source] LocationError),

    /// The originator already has an arming or active alert.
    #[error("an alert is already arming or active for '{originator}'")]
    AlertAlreadyActive {
        /// The originator whose slot is taken.
        originator: String,
    },

    /// The requested transition is not allowed from the current status.
    #[error("cannot {action} an alert that is {from}")]
    InvalidTransition {
        /// The status the alert is in.
        from: AlertStatus,
        /// The attempted action.
        action: &'static str,
    },

    /// The alert is not known to this controller.
    #[error("unknown alert {0}")]
    UnknownAlert(AlertId),

    /// The countdown could not be armed.
    #[error(transparent)]
    Arm(#[from] ArmError),

    /// The cancellation credential was rejected or could not be changed.
    #[error("credential check failed: {0}")]
    Auth(#[from] GuardError),

    // === Delivery Errors ===
    /// The alert store rejected or could not receive a write.
    #[error("alert store error: {0}")]
    Store(#[from] StoreError),

    /// Required platform permission is missing.
    #[error("missing permission: {permission}. {instructions}")]
    PermissionMissing {
        /// Name of the required permission.
        permission: String,
        /// Instructions for granting the permission.
        instructions: String,
    },

    /// The service registry has been shut down.
    #[error("services have been shut down")]
    ShutDown,

    // === I/O Errors ===
    /// File system operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to create a required directory.
    #[error("failed to create directory {path}: {source}")]
    DirectoryCreate {
        /// Path that couldn't be created.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    // === Serialization Errors ===
    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // === Generic Errors ===
    /// An operation timed out.
    #[error("operation timed out: {operation}")]
    Timeout {
        /// Description of the operation that timed out.
        operation: String,
    },

    /// An internal error occurred (bug).
    #[error("internal error: {0}")]
    Internal(String),
}

/// A specialized Result type for safewatch operations.
pub type Result<T> = std::result::Result<T, Error>;

impl From<figment::Error> for Error {
    fn from(err: figment::Error) -> Self {
        Self::ConfigLoad(Box::new(err))
    }
}

impl Error {
    /// Create a new internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(message: impl Into<String>) -> Self {
        Self::ConfigValidation {
            message: message.into(),
        }
    }

    /// Create a permission missing error with instructions.
    #[must_use]
    pub fn permission_missing(
        permission: impl Into<String>,
        instructions: impl Into<String>,
    ) -> Self {
        Self::PermissionMissing {
            permission: permission.into(),
            instructions: instructions.into(),
        }
    }

    /// Check if this error is a permission issue (location or clipboard denied).
    ///
    /// Permission errors are recoverable: the caller should offer a retry.
    #[must_use]
    pub fn is_permission_error(&self) -> bool {
        matches!(
            self,
            Self::PermissionMissing { .. }
                | Self::LocationUnavailable(LocationError::PermissionDenied)
        )
    }

    /// Check if this error is transient and worth retrying later.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(err) => err.is_transient(),
            Self::LocationUnavailable(LocationError::Timeout) | Self::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Check if this error is a rejected cancellation credential.
    #[must_use]
    pub fn is_auth_error(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = Error::ShutDown;
        assert_eq!(err.to_string(), "services have been shut down");

        let err = Error::internal("test error");
        assert_eq!(err.to_string(), "internal error: test error");
    }

    #[test]
    fn test_location_permission_is_permission_error() {
        let err = Error::LocationUnavailable(LocationError::PermissionDenied);
        assert!(err.is_permission_error());
        assert!(!err.is_retryable());

        let err = Error::LocationUnavailable(LocationError::Timeout);
        assert!(!err.is_permission_error());
        assert!(err.is_retryable());
    }

    #[test]
    fn test_permission_error_display() {
        let err = Error::permission_missing(
            "Clipboard",
            "Run from a desktop session with clipboard access",
        );
        let msg = err.to_string();
        assert!(msg.contains("Clipboard"));
        assert!(msg.contains("desktop session"));
        assert!(err.is_permission_error());
    }

    #[test]
    fn test_store_unreachable_is_retryable() {
        let err: Error = StoreError::Unreachable("connection reset".to_string()).into();
        assert!(err.is_retryable());
        assert!(err.to_string().contains("connection reset"));
    }

    #[test]
    fn test_auth_error() {
        let err: Error = GuardError::WrongCredential.into();
        assert!(err.is_auth_error());
        assert!(err.to_string().starts_with("credential check failed"));
        assert!(!Error::ShutDown.is_auth_error());
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = Error::InvalidTransition {
            from: AlertStatus::Resolved,
            action: "cancel",
        };
        assert_eq!(err.to_string(), "cannot cancel an alert that is resolved");
    }

    #[test]
    fn test_already_active_display() {
        let err = Error::AlertAlreadyActive {
            originator: "user-1".to_string(),
        };
        assert!(err.to_string().contains("user-1"));
    }

    #[test]
    fn test_config_error() {
        let err = Error::config("no trusted contacts configured");
        assert!(err.to_string().contains("no trusted contacts"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: Error = io_err.into();
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_json_error() {
        let json_result: std::result::Result<i32, serde_json::Error> =
            serde_json::from_str("not valid json");
        if let Err(json_err) = json_result {
            let err: Error = json_err.into();
            assert!(matches!(err, Error::Json(_)));
        }
    }

    #[test]
    fn test_database_migration_error_display() {
        let err = Error::DatabaseMigration {
            message: "version mismatch".to_string(),
        };
        assert!(err.to_string().contains("version mismatch"));
    }

    #[test]
    fn test_directory_create_error_display() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let err = Error::DirectoryCreate {
            path: PathBuf::from("/root/forbidden"),
            source: io_err,
        };
        assert!(err.to_string().contains("/root/forbidden"));
    }

    #[test]
    fn test_timeout_error_display() {
        let err = Error::Timeout {
            operation: "reverse geocode".to_string(),
        };
        assert!(err.to_string().contains("reverse geocode"));
        assert!(err.is_retryable());
    }
}
