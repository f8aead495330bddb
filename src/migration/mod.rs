//! Schema migrations.
//!
//! A migration is a versioned list of SQL statements. The [`Migrator`]
//! applies pending ones in version order and records each in the
//! `stockledger_migrations` table together with a SHA-256 checksum of its
//! statements; editing a migration after it was applied makes the next run
//! fail with [`MigrationError::ChecksumMismatch`].

pub mod checksum;
pub mod error;
pub mod ledger_schema;
pub mod migrator;
pub mod state_table;

pub use error::MigrationError;
pub use ledger_schema::ledger_migrations;
pub use migrator::{MigrationStatus, Migrator};
pub use state_table::MigrationRecord;

/// One versioned schema change
pub trait Migration: Send + Sync {
    /// Human-readable identifier
    fn name(&self) -> &str;

    /// Version (timestamp: YYYYMMDDHHMMSS)
    fn version(&self) -> i64;

    /// Statements applied, in order, when the migration runs
    fn statements(&self) -> &[&str];
}

/// A migration defined by static SQL
#[derive(Debug, Clone, Copy)]
pub struct SqlMigration {
    version: i64,
    name: &'static str,
    statements: &'static [&'static str],
}

impl SqlMigration {
    pub const fn new(version: i64, name: &'static str, statements: &'static [&'static str]) -> Self {
        Self {
            version,
            name,
            statements,
        }
    }
}

impl Migration for SqlMigration {
    fn name(&self) -> &str {
        self.name
    }

    fn version(&self) -> i64 {
        self.version
    }

    fn statements(&self) -> &[&str] {
        self.statements
    }
}
