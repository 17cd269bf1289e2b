//! Error types for the backup/restore library.

use std::path::PathBuf;

use thiserror::Error;

use crate::orchestrator::{Phase, Variant};

/// Exit code for configuration errors.
pub const EXIT_CONFIG_ERROR: u8 = 1;
/// Exit code for unusable database sessions.
pub const EXIT_CONNECTION_ERROR: u8 = 2;
/// Exit code for failed SQL statements.
pub const EXIT_SQL_ERROR: u8 = 3;
/// Exit code for missing or stale table files.
pub const EXIT_FILE_ERROR: u8 = 4;
/// Exit code for unrecoverable index files.
pub const EXIT_REPAIR_ERROR: u8 = 5;
/// Exit code for dump utility failures.
pub const EXIT_SCHEMA_EXPORT_ERROR: u8 = 6;
/// Exit code for IO errors.
pub const EXIT_IO_ERROR: u8 = 7;
/// Exit code for anything else.
pub const EXIT_OTHER_ERROR: u8 = 10;
/// Exit code when the snapshot confirmation timed out.
pub const EXIT_TIMEOUT: u8 = 124;
/// Exit code when the run was cancelled by a signal.
pub const EXIT_CANCELLED: u8 = 130;

/// Main error type for backup and restore operations.
#[derive(Error, Debug)]
pub enum BackupError {
    /// Configuration error (invalid YAML, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Session could not be opened or is no longer usable
    #[error("Connection error ({target}): {message}")]
    Connection { target: String, message: String },

    /// A statement failed on the server
    #[error("SQL failed: {message}\n  Statement: {statement}")]
    Sql { statement: String, message: String },

    /// The dump utility exited with a non-zero status
    #[error("Schema export failed for database {database}: {diagnostic}")]
    SchemaExport { database: String, diagnostic: String },

    /// A required table file is missing
    #[error("Required file {table}.{extension} not found in {}", directory.display())]
    FileNotFound {
        table: String,
        extension: String,
        directory: PathBuf,
    },

    /// A data file is present where none may exist before import
    #[error("Stale data file found before import: {}", path.display())]
    StaleFile { path: PathBuf },

    /// A flat-file index could not be recovered
    #[error("Index file {} could not be repaired: {diagnostic}", file.display())]
    RepairFailure { file: PathBuf, diagnostic: String },

    /// A table uses an engine whose files cannot be transported
    #[error("Table {table} uses unsupported engine {engine}")]
    UnsupportedEngine { table: String, engine: String },

    /// Illegal lock transition for a database
    #[error("Lock state error: {0}")]
    LockState(String),

    /// Illegal tablespace transition for a table
    #[error("Tablespace state error for table {table}: {message}")]
    TablespaceState { table: String, message: String },

    /// A workflow step ran out of order or was repeated
    #[error("Workflow error: {0}")]
    Workflow(String),

    /// Archive container could not be read or written
    #[error("Archive error: {0}")]
    Archive(String),

    /// Handoff record could not be read, written or verified
    #[error("Handoff record error: {0}")]
    Handoff(String),

    /// The operator did not confirm the snapshot in time
    #[error("Snapshot confirmation not received within {0}s")]
    SnapshotTimeout(u64),

    /// Run was cancelled (SIGINT, SIGTERM)
    #[error("Run cancelled")]
    Cancelled,

    /// A workflow phase failed; carries the step and a recovery hint
    #[error("{variant} failed during {phase}: {source}\n  Recovery: {hint}")]
    PhaseFailed {
        variant: Variant,
        phase: Phase,
        hint: &'static str,
        #[source]
        source: Box<BackupError>,
    },

    /// IO error (file operations)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML serialization/deserialization error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl BackupError {
    /// Create a Connection error for a named database.
    pub fn connection(target: impl Into<String>, message: impl ToString) -> Self {
        BackupError::Connection {
            target: target.into(),
            message: message.to_string(),
        }
    }

    /// Create a Sql error for the statement that failed.
    ///
    /// Long statements (CREATE TABLE from a dump) are cut to keep the
    /// message readable.
    pub fn sql(statement: &str, message: impl ToString) -> Self {
        BackupError::Sql {
            statement: abbreviate(statement.trim(), MAX_STATEMENT_IN_ERROR),
            message: message.to_string(),
        }
    }

    /// Create a FileNotFound error.
    pub fn file_not_found(
        table: impl Into<String>,
        extension: impl Into<String>,
        directory: impl Into<PathBuf>,
    ) -> Self {
        BackupError::FileNotFound {
            table: table.into(),
            extension: extension.into(),
            directory: directory.into(),
        }
    }

    /// The innermost error, looking through `PhaseFailed` wrappers.
    pub fn root(&self) -> &BackupError {
        match self {
            BackupError::PhaseFailed { source, .. } => source.root(),
            other => other,
        }
    }

    /// Process exit code for this error class.
    pub fn exit_code(&self) -> u8 {
        match self.root() {
            BackupError::Config(_) | BackupError::Yaml(_) => EXIT_CONFIG_ERROR,
            BackupError::Connection { .. } => EXIT_CONNECTION_ERROR,
            BackupError::Sql { .. } => EXIT_SQL_ERROR,
            BackupError::FileNotFound { .. } | BackupError::StaleFile { .. } => EXIT_FILE_ERROR,
            BackupError::RepairFailure { .. } => EXIT_REPAIR_ERROR,
            BackupError::SchemaExport { .. } => EXIT_SCHEMA_EXPORT_ERROR,
            BackupError::Io(_) => EXIT_IO_ERROR,
            BackupError::SnapshotTimeout(_) => EXIT_TIMEOUT,
            BackupError::Cancelled => EXIT_CANCELLED,
            _ => EXIT_OTHER_ERROR,
        }
    }

    /// Format error with full details including error chain
    pub fn format_detailed(&self) -> String {
        let mut output = format!("Error: {}\n", self);

        let mut source = std::error::Error::source(self);
        let mut depth = 1;
        while let Some(err) = source {
            output.push_str(&format!("\nCaused by:\n  {}: {}", depth, err));
            source = err.source();
            depth += 1;
        }

        output
    }
}

/// Longest statement prefix kept in a Sql error.
const MAX_STATEMENT_IN_ERROR: usize = 240;

fn abbreviate(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}...", cut)
}

/// Outcome of an operation whose failure is expected and may be ignored.
///
/// Skipped outcomes carry the reason so callers can log and count them.
#[derive(Debug)]
pub enum BestEffort {
    Applied,
    Skipped { reason: BackupError },
}

impl BestEffort {
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => BestEffort::Applied,
            Err(reason) => BestEffort::Skipped { reason },
        }
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, BestEffort::Skipped { .. })
    }
}

/// Result type alias for backup operations.
pub type Result<T> = std::result::Result<T, BackupError>;
