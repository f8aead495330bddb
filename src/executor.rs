//! SQL execution over `may_postgres`.
//!
//! [`SqlExecutor`] abstracts statement execution so the Postgres store and
//! the migration runner work the same way against a bare connection or an
//! open [`crate::transaction::Transaction`].

use crate::error::LedgerError;
use may_postgres::types::ToSql;
use may_postgres::{Client, Row};

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Trait for executing database operations
pub trait SqlExecutor {
    /// Execute a statement and return the number of rows affected
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Postgres` if the statement fails.
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, LedgerError>;

    /// Execute a query and return all rows
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Postgres` if the query fails.
    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, LedgerError>;

    /// Execute a query expected to return at most one row
    fn query_opt(&self, query: &str, params: &[&dyn ToSql]) -> Result<Option<Row>, LedgerError> {
        let mut rows = self.query_all(query, params)?;
        if rows.len() > 1 {
            return Err(LedgerError::Storage(format!(
                "expected at most one row, got {}",
                rows.len()
            )));
        }
        Ok(rows.pop())
    }
}

/// Executor over a `may_postgres::Client` reference
pub struct PgExecutor<'a> {
    client: &'a Client,
}

impl<'a> PgExecutor<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &'a Client {
        self.client
    }
}

impl SqlExecutor for PgExecutor<'_> {
    fn execute(&self, query: &str, params: &[&dyn ToSql]) -> Result<u64, LedgerError> {
        run_execute(self.client, query, params)
    }

    fn query_all(&self, query: &str, params: &[&dyn ToSql]) -> Result<Vec<Row>, LedgerError> {
        run_query(self.client, query, params)
    }
}

pub(crate) fn run_execute(
    client: &Client,
    query: &str,
    params: &[&dyn ToSql],
) -> Result<u64, LedgerError> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::execute_query_span(query).entered();

    client.execute(query, params).map_err(LedgerError::Postgres)
}

pub(crate) fn run_query(
    client: &Client,
    query: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<Row>, LedgerError> {
    #[cfg(feature = "tracing")]
    let _span = tracing_helpers::execute_query_span(query).entered();

    client.query(query, params).map_err(LedgerError::Postgres)
}

/// Read a typed column, turning decode failures into ledger errors
pub(crate) fn column<'r, T>(row: &'r Row, name: &str) -> Result<T, LedgerError>
where
    T: may_postgres::types::FromSql<'r>,
{
    row.try_get(name).map_err(LedgerError::Postgres)
}
