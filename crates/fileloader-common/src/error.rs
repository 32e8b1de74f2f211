//! Error types for FileLoader
//!
//! Every failure a pipeline can produce is a `LoadError`. Each variant maps
//! to a stable kind string (persisted in `file_load_log.error_kind`), an
//! audience that decides who gets notified, and a transience flag that
//! drives retry behaviour.

use thiserror::Error;

/// Result type alias for FileLoader operations
pub type LoadResult<T> = std::result::Result<T, LoadError>;

/// Who should be told about an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Audience {
    /// Business stakeholders, via the source's notification policy (email).
    Stakeholder,
    /// The data team, via webhook.
    Internal,
    /// Nobody; logged only.
    None,
}

/// Stable error kind, persisted and used by notification policies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    MissingHeader,
    MissingColumns,
    NoDataInFile,
    MalformedFile,
    GrainValidation,
    AuditFailed,
    ValidationThresholdExceeded,
    DuplicateFile,
    ArchiveFailed,
    StageCreateFailed,
    BulkInsertFailed,
    PublishFailed,
    DbUnavailable,
    StoreUnavailable,
    ListingFailed,
    Config,
    WorkerPanic,
    Cancelled,
    Io,
    Serialization,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::MissingHeader => "MissingHeader",
            ErrorKind::MissingColumns => "MissingColumns",
            ErrorKind::NoDataInFile => "NoDataInFile",
            ErrorKind::MalformedFile => "MalformedFile",
            ErrorKind::GrainValidation => "GrainValidationError",
            ErrorKind::AuditFailed => "AuditFailedError",
            ErrorKind::ValidationThresholdExceeded => "ValidationThresholdExceeded",
            ErrorKind::DuplicateFile => "DuplicateFile",
            ErrorKind::ArchiveFailed => "ArchiveFailed",
            ErrorKind::StageCreateFailed => "StageCreateFailed",
            ErrorKind::BulkInsertFailed => "BulkInsertFailed",
            ErrorKind::PublishFailed => "PublishFailed",
            ErrorKind::DbUnavailable => "DBUnavailable",
            ErrorKind::StoreUnavailable => "StoreUnavailable",
            ErrorKind::ListingFailed => "ListingFailed",
            ErrorKind::Config => "ConfigError",
            ErrorKind::WorkerPanic => "WorkerPanic",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Io => "IoError",
            ErrorKind::Serialization => "SerializationError",
        }
    }
}

impl ErrorKind {
    /// Who gets notified when a pipeline terminates with this kind.
    pub fn audience(&self) -> Audience {
        match self {
            ErrorKind::MissingHeader
            | ErrorKind::MissingColumns
            | ErrorKind::NoDataInFile
            | ErrorKind::MalformedFile
            | ErrorKind::GrainValidation
            | ErrorKind::AuditFailed
            | ErrorKind::ValidationThresholdExceeded
            | ErrorKind::DuplicateFile => Audience::Stakeholder,
            ErrorKind::Cancelled => Audience::None,
            _ => Audience::Internal,
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Main error type for FileLoader
#[derive(Error, Debug)]
pub enum LoadError {
    /// File has no header row, or the header is blank
    #[error("No usable header row found in '{file}'")]
    MissingHeader { file: String },

    /// Required source columns are absent from the file header
    #[error("Missing required columns in '{file}': {}", missing.join(", "))]
    MissingColumns { file: String, missing: Vec<String> },

    /// File contains zero data rows after the header
    #[error("No data rows found in '{file}'")]
    NoDataInFile { file: String },

    /// File cannot be parsed as its declared format
    #[error("Failed to parse '{file}': {reason}")]
    MalformedFile { file: String, reason: String },

    /// The file repeats grain tuples that must be unique
    #[error("Duplicate grain tuples in '{file}'; examples: {}", examples.join("; "))]
    GrainValidation { file: String, examples: Vec<String> },

    /// A user-declared audit query did not satisfy its predicate
    #[error("Audit '{name}' failed for '{file}': observed {observed}, expected {expected}")]
    AuditFailed {
        file: String,
        name: String,
        observed: String,
        expected: String,
    },

    /// More rows failed validation than the source tolerates
    #[error(
        "Validation threshold exceeded for '{file}': {invalid} invalid rows > allowed {threshold}"
    )]
    ValidationThresholdExceeded {
        file: String,
        invalid: u64,
        threshold: u64,
    },

    /// Same (filename, content hash) was already loaded successfully
    #[error("File '{file}' was already processed successfully (file_load_id {prior_load_id})")]
    DuplicateFile { file: String, prior_load_id: i64 },

    /// Copy to the archive directory failed after retries
    #[error("Failed to archive '{file}': {reason}")]
    ArchiveFailed {
        file: String,
        reason: String,
        transient: bool,
    },

    /// Stage table DDL failed
    #[error("Failed to create stage table '{table}': {reason}")]
    StageCreateFailed { table: String, reason: String },

    /// Bulk insert into stage or DLQ failed
    #[error("Bulk insert into '{table}' failed: {reason}")]
    BulkInsertFailed {
        table: String,
        reason: String,
        transient: bool,
    },

    /// Merge from stage into target failed
    #[error("Publish from '{stage}' into '{target}' failed: {reason}")]
    PublishFailed {
        stage: String,
        target: String,
        reason: String,
    },

    /// Database connection or statement failure outside a specific stage
    #[error("Database operation failed: {operation} - {reason}")]
    DbUnavailable {
        operation: String,
        reason: String,
        transient: bool,
    },

    /// File store operation failure
    #[error("File store operation failed: {operation} - {reason}")]
    StoreUnavailable {
        operation: String,
        reason: String,
        transient: bool,
    },

    /// Drop directory could not be listed; fatal for the whole run
    #[error("Failed to list drop directory '{directory}': {reason}")]
    ListingFailed { directory: String, reason: String },

    /// Configuration is missing or invalid; fatal at startup
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// A worker task panicked while processing a file
    #[error("Worker panicked while processing '{file}': {detail}")]
    WorkerPanic { file: String, detail: String },

    /// Cooperative cancellation; not an error in itself
    #[error("Cancelled")]
    Cancelled,

    /// File system operations failed (read, write, create directory, etc.)
    #[error("File operation failed: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("Failed to process JSON data: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl LoadError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LoadError::MissingHeader { .. } => ErrorKind::MissingHeader,
            LoadError::MissingColumns { .. } => ErrorKind::MissingColumns,
            LoadError::NoDataInFile { .. } => ErrorKind::NoDataInFile,
            LoadError::MalformedFile { .. } => ErrorKind::MalformedFile,
            LoadError::GrainValidation { .. } => ErrorKind::GrainValidation,
            LoadError::AuditFailed { .. } => ErrorKind::AuditFailed,
            LoadError::ValidationThresholdExceeded { .. } => {
                ErrorKind::ValidationThresholdExceeded
            },
            LoadError::DuplicateFile { .. } => ErrorKind::DuplicateFile,
            LoadError::ArchiveFailed { .. } => ErrorKind::ArchiveFailed,
            LoadError::StageCreateFailed { .. } => ErrorKind::StageCreateFailed,
            LoadError::BulkInsertFailed { .. } => ErrorKind::BulkInsertFailed,
            LoadError::PublishFailed { .. } => ErrorKind::PublishFailed,
            LoadError::DbUnavailable { .. } => ErrorKind::DbUnavailable,
            LoadError::StoreUnavailable { .. } => ErrorKind::StoreUnavailable,
            LoadError::ListingFailed { .. } => ErrorKind::ListingFailed,
            LoadError::Config { .. } => ErrorKind::Config,
            LoadError::WorkerPanic { .. } => ErrorKind::WorkerPanic,
            LoadError::Cancelled => ErrorKind::Cancelled,
            LoadError::Io(_) => ErrorKind::Io,
            LoadError::Serialization(_) => ErrorKind::Serialization,
        }
    }

    /// Who gets notified when a pipeline terminates with this error.
    pub fn audience(&self) -> Audience {
        self.kind().audience()
    }

    /// Whether a retry inside the same stage may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            LoadError::ArchiveFailed { transient, .. }
            | LoadError::BulkInsertFailed { transient, .. }
            | LoadError::DbUnavailable { transient, .. }
            | LoadError::StoreUnavailable { transient, .. } => *transient,
            LoadError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
            ),
            _ => false,
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a non-transient database error
    pub fn database(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DbUnavailable {
            operation: operation.into(),
            reason: reason.into(),
            transient: false,
        }
    }

    /// Create a transient database error (deadlock, timeout, reset)
    pub fn database_transient(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DbUnavailable {
            operation: operation.into(),
            reason: reason.into(),
            transient: true,
        }
    }

    /// Create a non-transient file store error
    pub fn store(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            operation: operation.into(),
            reason: reason.into(),
            transient: false,
        }
    }

    /// Create a parse error for a structurally broken file
    pub fn malformed(file: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::MalformedFile {
            file: file.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_level_errors_notify_stakeholders() {
        let err = LoadError::NoDataInFile {
            file: "orders.csv".into(),
        };
        assert_eq!(err.audience(), Audience::Stakeholder);
        assert_eq!(err.kind().as_str(), "NoDataInFile");
    }

    #[test]
    fn internal_errors_notify_webhook() {
        let err = LoadError::StageCreateFailed {
            table: "stg_orders_4".into(),
            reason: "permission denied".into(),
        };
        assert_eq!(err.audience(), Audience::Internal);
        assert!(!err.is_transient());
    }

    #[test]
    fn cancelled_notifies_nobody() {
        assert_eq!(LoadError::Cancelled.audience(), Audience::None);
    }

    #[test]
    fn transience_follows_the_flag() {
        let transient = LoadError::database_transient("merge", "deadlock detected");
        let permanent = LoadError::database("merge", "relation does not exist");
        assert!(transient.is_transient());
        assert!(!permanent.is_transient());
    }

    #[test]
    fn io_timeouts_are_transient() {
        let err = LoadError::from(std::io::Error::new(std::io::ErrorKind::TimedOut, "slow"));
        assert!(err.is_transient());
        let err = LoadError::from(std::io::Error::new(std::io::ErrorKind::NotFound, "gone"));
        assert!(!err.is_transient());
    }

    #[test]
    fn threshold_error_is_never_transient() {
        let err = LoadError::ValidationThresholdExceeded {
            file: "x.csv".into(),
            invalid: 3,
            threshold: 0,
        };
        assert!(!err.is_transient());
        assert_eq!(err.audience(), Audience::Stakeholder);
    }
}
