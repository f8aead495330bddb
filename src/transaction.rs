//! Database transactions over a borrowed `may_postgres` client.
//!
//! A [`Transaction`] implements [`SqlExecutor`], so store code runs the same
//! statements inside and outside a transaction. Dropping an open transaction
//! rolls it back; this is how every early `?` return in the store discards a
//! half-done commit.

use crate::error::LedgerError;
use crate::executor::{run_execute, run_query, SqlExecutor};
use may_postgres::types::ToSql;
use may_postgres::{Client, Error as PostgresError, Row};
use std::fmt;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    /// Read committed (default)
    ReadCommitted,
    /// Repeatable read; used for consistent audit reads
    RepeatableRead,
}

impl IsolationLevel {
    /// Convert to PostgreSQL SQL syntax
    fn to_sql(self) -> &'static str {
        match self {
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
        }
    }
}

/// Transaction error type
#[derive(Debug)]
pub enum TransactionError {
    /// PostgreSQL error from may_postgres
    PostgresError(PostgresError),
    /// Transaction already committed or rolled back
    TransactionClosed,
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionError::PostgresError(e) => write!(f, "PostgreSQL error: {e}"),
            TransactionError::TransactionClosed => {
                write!(f, "Transaction has already been committed or rolled back")
            }
        }
    }
}

impl std::error::Error for TransactionError {}

impl From<PostgresError> for TransactionError {
    fn from(err: PostgresError) -> Self {
        TransactionError::PostgresError(err)
    }
}

impl From<TransactionError> for LedgerError {
    fn from(err: TransactionError) -> Self {
        match err {
            TransactionError::PostgresError(e) => LedgerError::Postgres(e),
            TransactionError::TransactionClosed => {
                LedgerError::Storage("Transaction closed".to_string())
            }
        }
    }
}

/// An open database transaction
pub struct Transaction<'a> {
    client: &'a Client,
    closed: bool,
}

impl<'a> Transaction<'a> {
    /// Begin a transaction at the default isolation level (`ReadCommitted`)
    pub fn begin(client: &'a Client) -> Result<Self, TransactionError> {
        Self::begin_with_isolation(client, IsolationLevel::ReadCommitted)
    }

    /// Begin a transaction at a specific isolation level
    pub fn begin_with_isolation(
        client: &'a Client,
        isolation_level: IsolationLevel,
    ) -> Result<Self, TransactionError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::begin_transaction_span().entered();

        let begin = format!("BEGIN ISOLATION LEVEL {}", isolation_level.to_sql());
        client.execute(begin.as_str(), &[])?;

        Ok(Self {
            client,
            closed: false,
        })
    }

    /// Commit the transaction
    ///
    /// # Errors
    ///
    /// Returns an error if the transaction is closed or `COMMIT` fails.
    pub fn commit(mut self) -> Result<(), TransactionError> {
        if self.closed {
            return Err(TransactionError::TransactionClosed);
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::commit_transaction_span().entered();

        self.closed = true;
        self.client.execute("COMMIT", &[])?;
        Ok(())
    }

    fn rollback_in_place(&mut self) -> Result<(), TransactionError> {
        if self.closed {
            return Err(TransactionError::TransactionClosed);
        }

        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::rollback_transaction_span().entered();

        self.closed = true;
        self.client.execute("ROLLBACK", &[])?;
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.rollback_in_place() {
                log::warn!("rollback of abandoned transaction failed: {e}");
            }
        }
    }
}

impl SqlExecutor for Transaction<'_> {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, LedgerError> {
        if self.closed {
            return Err(TransactionError::TransactionClosed.into());
        }
        run_execute(self.client, query, params)
    }

    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, LedgerError> {
        if self.closed {
            return Err(TransactionError::TransactionClosed.into());
        }
        run_query(self.client, query, params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_isolation_level_to_sql() {
        assert_eq!(IsolationLevel::ReadCommitted.to_sql(), "READ COMMITTED");
        assert_eq!(IsolationLevel::RepeatableRead.to_sql(), "REPEATABLE READ");
    }

    #[test]
    fn test_transaction_error_display() {
        let err = TransactionError::TransactionClosed;
        assert!(err
            .to_string()
            .contains("Transaction has already been committed"));
    }

    #[test]
    fn test_transaction_error_conversion() {
        let err = TransactionError::TransactionClosed;
        let ledger_err: LedgerError = err.into();
        assert!(ledger_err.to_string().contains("Transaction closed"));
    }
}
