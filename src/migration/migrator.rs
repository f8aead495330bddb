//! Migrator - applies registered migrations in version order

use crate::executor::SqlExecutor;
use crate::migration::checksum::statements_checksum;
use crate::migration::state_table::{
    applied_migrations, initialize_state_table, record_migration, MigrationRecord,
};
use crate::migration::{Migration, MigrationError};
use crate::transaction::Transaction;
use may_postgres::Client;
use std::collections::BTreeSet;
use std::time::Instant;

/// Advisory lock key serializing concurrent migration runs ("stockldg")
const MIGRATION_LOCK_KEY: i64 = 0x73746f636b6c6467;

/// Applied vs pending migrations
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    pub applied: Vec<MigrationRecord>,
    /// `(version, name)` of registered migrations not yet applied
    pub pending: Vec<(i64, String)>,
}

impl MigrationStatus {
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn latest_applied_version(&self) -> Option<i64> {
        self.applied.iter().map(|m| m.version).max()
    }
}

/// Ordered set of migrations
pub struct Migrator {
    migrations: Vec<Box<dyn Migration>>,
}

impl Migrator {
    /// Register migrations; they are sorted by version
    ///
    /// # Errors
    ///
    /// Returns `MigrationError::InvalidVersion` for duplicate or non-positive versions.
    pub fn new(mut migrations: Vec<Box<dyn Migration>>) -> Result<Self, MigrationError> {
        migrations.sort_by_key(|m| m.version());
        let mut seen = BTreeSet::new();
        for migration in &migrations {
            if migration.version() <= 0 || !seen.insert(migration.version()) {
                return Err(MigrationError::InvalidVersion(migration.version()));
            }
        }
        Ok(Self { migrations })
    }

    pub fn migrations(&self) -> &[Box<dyn Migration>] {
        &self.migrations
    }

    /// Compare registered migrations with the state table
    ///
    /// # Errors
    ///
    /// Fails with `ChecksumMismatch` when an applied migration was edited and
    /// with `UnknownApplied` when the database is ahead of this build.
    pub fn status(&self, executor: &dyn SqlExecutor) -> Result<MigrationStatus, MigrationError> {
        initialize_state_table(executor)?;
        let applied = applied_migrations(executor)?;

        for record in &applied {
            let Some(migration) = self.migrations.iter().find(|m| m.version() == record.version)
            else {
                return Err(MigrationError::UnknownApplied {
                    version: record.version,
                    name: record.name.clone(),
                });
            };
            let current = statements_checksum(migration.statements());
            if current != record.checksum {
                return Err(MigrationError::ChecksumMismatch {
                    version: record.version,
                    name: record.name.clone(),
                    stored: record.checksum.clone(),
                    current,
                });
            }
        }

        let pending = self
            .migrations
            .iter()
            .filter(|m| !applied.iter().any(|r| r.version == m.version()))
            .map(|m| (m.version(), m.name().to_string()))
            .collect();

        Ok(MigrationStatus { applied, pending })
    }

    /// Apply every pending migration
    ///
    /// The whole run happens in one transaction holding a Postgres advisory
    /// lock, so concurrent starters apply each migration once and a failing
    /// migration leaves the schema untouched.
    ///
    /// Returns the number of migrations applied.
    pub fn up(&self, client: &Client) -> Result<usize, MigrationError> {
        let tx = Transaction::begin(client)?;
        tx.execute("SELECT pg_advisory_xact_lock($1)", &[&MIGRATION_LOCK_KEY])?;

        let status = self.status(&tx)?;
        let mut applied = 0;
        for (version, name) in &status.pending {
            let Some(migration) = self.migrations.iter().find(|m| m.version() == *version) else {
                continue;
            };
            let start = Instant::now();
            for statement in migration.statements() {
                tx.execute(statement, &[])
                    .map_err(|e| MigrationError::ExecutionFailed {
                        version: *version,
                        name: name.clone(),
                        error: e.to_string(),
                    })?;
            }
            let elapsed_ms = i64::try_from(start.elapsed().as_millis()).unwrap_or(i64::MAX);
            record_migration(
                &tx,
                *version,
                name,
                &statements_checksum(migration.statements()),
                elapsed_ms,
            )?;
            log::info!("applied migration {version} ({name}) in {elapsed_ms} ms");
            applied += 1;
        }

        tx.commit()?;
        Ok(applied)
    }
}
