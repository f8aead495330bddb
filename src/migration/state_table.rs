//! Migration state table management

use crate::error::LedgerError;
use crate::executor::{column, SqlExecutor};
use chrono::{DateTime, Utc};

/// Name of the table recording applied migrations
pub const STATE_TABLE: &str = "stockledger_migrations";

/// One row of the state table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationRecord {
    pub version: i64,
    pub name: String,
    /// SHA-256 of the migration's statements
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    pub execution_time_ms: Option<i64>,
}

impl MigrationRecord {
    pub fn from_row(row: &may_postgres::Row) -> Result<Self, LedgerError> {
        Ok(Self {
            version: column(row, "version")?,
            name: column(row, "name")?,
            checksum: column(row, "checksum")?,
            applied_at: column(row, "applied_at")?,
            execution_time_ms: column(row, "execution_time_ms")?,
        })
    }
}

/// Create the state table if it does not exist yet
pub fn initialize_state_table(executor: &dyn SqlExecutor) -> Result<(), LedgerError> {
    executor.execute(
        r#"
        CREATE TABLE IF NOT EXISTS stockledger_migrations (
            version BIGINT PRIMARY KEY,
            name VARCHAR(255) NOT NULL,
            checksum VARCHAR(64) NOT NULL,
            applied_at TIMESTAMPTZ NOT NULL DEFAULT now(),
            execution_time_ms BIGINT
        )
        "#,
        &[],
    )?;
    Ok(())
}

/// Applied migrations, ordered by version
pub fn applied_migrations(executor: &dyn SqlExecutor) -> Result<Vec<MigrationRecord>, LedgerError> {
    executor
        .query_all(
            "SELECT version, name, checksum, applied_at, execution_time_ms \
             FROM stockledger_migrations ORDER BY version",
            &[],
        )?
        .iter()
        .map(MigrationRecord::from_row)
        .collect()
}

pub fn record_migration(
    executor: &dyn SqlExecutor,
    version: i64,
    name: &str,
    checksum: &str,
    execution_time_ms: i64,
) -> Result<(), LedgerError> {
    executor.execute(
        "INSERT INTO stockledger_migrations (version, name, checksum, execution_time_ms) \
         VALUES ($1, $2, $3, $4)",
        &[&version, &name, &checksum, &execution_time_ms],
    )?;
    Ok(())
}
