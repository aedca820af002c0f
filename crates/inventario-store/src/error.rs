//! Error types for the Inventario store
//!
//! [`StoreError`] is what the library returns. [`AppError`] is the
//! serializable shape handed to collaborators (CLI, IPC layer): a stable
//! code, a message that keeps the operator-actionable reason (disk full,
//! permission denied, missing file), optional detail and a retry hint.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Errors produced by the storage engine
#[derive(Debug, Error)]
pub enum StoreError {
    /// The gateway has no live connection (never opened, or reopen failed)
    #[error("Database not initialized")]
    NotInitialized,
    /// Malformed SQL or a constraint violation other than a foreign key
    #[error("Statement failed: {0}")]
    Statement(#[source] rusqlite::Error),
    /// The operation points at a row that does not exist
    #[error("Referenced row does not exist: {0}")]
    Reference(String),
    #[error("Failed to open database at {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    /// Copy/stat/rename failure during backup or restore
    #[error("{operation} failed for {}: {source}", .path.display())]
    FileOperation {
        operation: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid backup file {}: {reason}", .path.display())]
    InvalidBackup { path: PathBuf, reason: String },
    /// A single additive migration step failed; never fatal on its own
    #[error("Migration step '{step}' failed: {source}")]
    MigrationStep {
        step: String,
        #[source]
        source: rusqlite::Error,
    },
    #[error("Invalid input: {0}")]
    InvalidInput(String),
    #[error("Database executor channel closed")]
    ChannelClosed,
}

impl StoreError {
    pub(crate) fn file(operation: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::FileOperation {
            operation,
            path: path.into(),
            source,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match &err {
            rusqlite::Error::SqliteFailure(code, _)
                if code.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY =>
            {
                Self::Reference(err.to_string())
            }
            _ => Self::Statement(err),
        }
    }
}

/// Coarse grouping of error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Input validation errors (bad quantities, unconfirmed restore)
    Validation,
    /// File I/O errors (copy, permissions, disk space)
    Io,
    /// Database errors
    Database,
    /// Missing related rows
    NotFound,
    /// Internal errors (executor gone)
    Internal,
}

impl ErrorCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Io => "io",
            Self::Database => "database",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stable codes, `CATEGORY_SPECIFIC_ERROR`. Collaborators match on these.
pub struct ErrorCode;

impl ErrorCode {
    pub const VALIDATION_INVALID_INPUT: &'static str = "VALIDATION_INVALID_INPUT";
    pub const VALIDATION_INVALID_BACKUP: &'static str = "VALIDATION_INVALID_BACKUP";

    pub const IO_FILE_NOT_FOUND: &'static str = "IO_FILE_NOT_FOUND";
    pub const IO_PERMISSION_DENIED: &'static str = "IO_PERMISSION_DENIED";
    pub const IO_WRITE_ERROR: &'static str = "IO_WRITE_ERROR";

    pub const DB_NOT_INITIALIZED: &'static str = "DB_NOT_INITIALIZED";
    pub const DB_OPEN_FAILED: &'static str = "DB_OPEN_FAILED";
    pub const DB_QUERY_FAILED: &'static str = "DB_QUERY_FAILED";
    pub const DB_MIGRATION_STEP_FAILED: &'static str = "DB_MIGRATION_STEP_FAILED";
    pub const DB_REFERENCE_MISSING: &'static str = "DB_REFERENCE_MISSING";

    pub const INTERNAL_ERROR: &'static str = "INTERNAL_ERROR";
}

/// Error shape returned across the collaborator boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppError {
    /// One of the [`ErrorCode`] constants
    pub code: String,
    /// Operator-facing message
    pub message: String,
    /// Underlying error text, for logs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    /// Retrying the same call may succeed (store reopening, executor restart)
    pub retryable: bool,
    pub category: ErrorCategory,
}

impl AppError {
    pub fn new(code: impl Into<String>, message: impl Into<String>, category: ErrorCategory) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            detail: None,
            retryable: false,
            category,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::VALIDATION_INVALID_INPUT,
            message,
            ErrorCategory::Validation,
        )
    }

    /// No live connection; retryable once the store is open again
    pub fn db_not_initialized() -> Self {
        Self::new(
            ErrorCode::DB_NOT_INITIALIZED,
            "Store is not open",
            ErrorCategory::Database,
        )
        .retryable()
    }

    pub fn db_query_failed(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::new(
            ErrorCode::DB_QUERY_FAILED,
            format!("Statement failed: {detail}"),
            ErrorCategory::Database,
        )
        .with_detail(detail)
    }

    pub fn internal(detail: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::INTERNAL_ERROR,
            "Internal store error",
            ErrorCategory::Internal,
        )
        .with_detail(detail)
    }

    fn from_io(operation: &str, path: &str, err: &std::io::Error) -> Self {
        let code = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorCode::IO_FILE_NOT_FOUND,
            std::io::ErrorKind::PermissionDenied => ErrorCode::IO_PERMISSION_DENIED,
            _ => ErrorCode::IO_WRITE_ERROR,
        };
        Self::new(
            code,
            format!("{operation} failed for {path}: {err}"),
            ErrorCategory::Io,
        )
        .with_detail(format!("{:?}", err.kind()))
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.category, self.message)
    }
}

impl std::error::Error for AppError {}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotInitialized => Self::db_not_initialized(),
            StoreError::Statement(err) => Self::db_query_failed(err.to_string()),
            StoreError::Reference(detail) => Self::new(
                ErrorCode::DB_REFERENCE_MISSING,
                "Referenced record does not exist",
                ErrorCategory::NotFound,
            )
            .with_detail(detail),
            StoreError::Open { path, source } => Self::new(
                ErrorCode::DB_OPEN_FAILED,
                format!("Failed to open database at {}", path.display()),
                ErrorCategory::Database,
            )
            .with_detail(source.to_string()),
            StoreError::FileOperation {
                operation,
                path,
                source,
            } => Self::from_io(operation, &path.display().to_string(), &source),
            StoreError::InvalidBackup { path, reason } => Self::new(
                ErrorCode::VALIDATION_INVALID_BACKUP,
                format!("Invalid backup file {}: {reason}", path.display()),
                ErrorCategory::Validation,
            ),
            StoreError::MigrationStep { step, source } => Self::new(
                ErrorCode::DB_MIGRATION_STEP_FAILED,
                format!("Migration step '{step}' failed"),
                ErrorCategory::Database,
            )
            .with_detail(source.to_string()),
            StoreError::InvalidInput(message) => Self::invalid_input(message),
            StoreError::ChannelClosed => {
                Self::internal("Database executor channel closed").retryable()
            }
        }
    }
}
