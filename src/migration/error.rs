//! Migration-specific error types

use crate::error::LedgerError;

/// Migration-specific errors
#[derive(Debug)]
pub enum MigrationError {
    /// Database execution error
    Database(LedgerError),
    /// An applied migration's statements changed after it ran
    ChecksumMismatch {
        version: i64,
        name: String,
        stored: String,
        current: String,
    },
    /// The database records a migration this build does not know about
    UnknownApplied { version: i64, name: String },
    /// Two registered migrations share a version, or a version is not positive
    InvalidVersion(i64),
    /// Migration failed during execution
    ExecutionFailed {
        version: i64,
        name: String,
        error: String,
    },
}

impl std::fmt::Display for MigrationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MigrationError::Database(e) => write!(f, "Database error: {e}"),
            MigrationError::ChecksumMismatch {
                version,
                name,
                stored,
                current,
            } => write!(
                f,
                "Migration '{name}' (version {version}) has been modified after being applied.\n\
                 Stored checksum: {stored}\n\
                 Current checksum: {current}"
            ),
            MigrationError::UnknownApplied { version, name } => write!(
                f,
                "Database has migration '{name}' (version {version}) applied, \
                 but it is not registered in this build"
            ),
            MigrationError::InvalidVersion(version) => {
                write!(f, "Invalid or duplicate migration version: {version}")
            }
            MigrationError::ExecutionFailed {
                version,
                name,
                error,
            } => write!(
                f,
                "Migration '{name}' (version {version}) failed during execution: {error}"
            ),
        }
    }
}

impl std::error::Error for MigrationError {}

impl From<LedgerError> for MigrationError {
    fn from(error: LedgerError) -> Self {
        MigrationError::Database(error)
    }
}

impl From<crate::transaction::TransactionError> for MigrationError {
    fn from(error: crate::transaction::TransactionError) -> Self {
        MigrationError::Database(error.into())
    }
}

impl From<MigrationError> for LedgerError {
    fn from(error: MigrationError) -> Self {
        match error {
            MigrationError::Database(e) => e,
            other => LedgerError::Storage(other.to_string()),
        }
    }
}
