//! Ledger error taxonomy.
//!
//! Every public ledger operation returns [`LedgerError`]. The variants map
//! one-to-one onto the outcomes a caller has to tell apart: bad input, unknown
//! product, double initialization, a movement that would drive stock below
//! zero, and an exhausted retry budget. `ConcurrentModification` is raised by
//! the projector's version check and is consumed by the adjustment retry loop;
//! it never reaches callers of [`crate::AdjustmentService::adjust`].

use crate::model::ProductId;
use may_postgres::Error as PostgresError;
use std::fmt;

/// Errors produced by the ledger and its storage backends
#[derive(Debug)]
pub enum LedgerError {
    /// Malformed or missing input (zero delta, missing reason, bad cursor, ...)
    Validation(String),
    /// The product was never initialized into the ledger
    NotFound { product_id: ProductId },
    /// `initialize` was called twice for the same product
    AlreadyExists { product_id: ProductId },
    /// The movement would drive the quantity on hand below zero
    InsufficientStock {
        product_id: ProductId,
        on_hand: i64,
        requested: i64,
    },
    /// The stored version moved since the caller read it
    ConcurrentModification {
        product_id: ProductId,
        expected_version: i64,
        actual_version: i64,
    },
    /// The retry budget for an adjustment was exhausted
    Conflict { product_id: ProductId, attempts: u32 },
    /// `PostgreSQL` error from `may_postgres`
    Postgres(PostgresError),
    /// Storage-level failure that is not a database error (poisoned lock, pool timeout, ...)
    Storage(String),
}

impl LedgerError {
    pub(crate) fn validation(message: impl Into<String>) -> Self {
        LedgerError::Validation(message.into())
    }

    pub(crate) fn not_found(product_id: &ProductId) -> Self {
        LedgerError::NotFound {
            product_id: product_id.clone(),
        }
    }

    /// Short, stable label used for metrics and logs
    pub fn kind(&self) -> &'static str {
        match self {
            LedgerError::Validation(_) => "validation",
            LedgerError::NotFound { .. } => "not_found",
            LedgerError::AlreadyExists { .. } => "already_exists",
            LedgerError::InsufficientStock { .. } => "insufficient_stock",
            LedgerError::ConcurrentModification { .. } => "concurrent_modification",
            LedgerError::Conflict { .. } => "conflict",
            LedgerError::Postgres(_) => "postgres",
            LedgerError::Storage(_) => "storage",
        }
    }

    /// Whether re-submitting the same intent later could succeed without any
    /// change to the request itself
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::ConcurrentModification { .. } | LedgerError::Conflict { .. }
        )
    }
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Validation(msg) => write!(f, "Validation error: {msg}"),
            LedgerError::NotFound { product_id } => {
                write!(f, "Product '{product_id}' is not tracked by the ledger")
            }
            LedgerError::AlreadyExists { product_id } => {
                write!(f, "Product '{product_id}' is already tracked by the ledger")
            }
            LedgerError::InsufficientStock {
                product_id,
                on_hand,
                requested,
            } => write!(
                f,
                "Insufficient stock for '{product_id}': requested {requested}, on hand {on_hand}"
            ),
            LedgerError::ConcurrentModification {
                product_id,
                expected_version,
                actual_version,
            } => write!(
                f,
                "Concurrent modification of '{product_id}': expected version {expected_version}, found {actual_version}"
            ),
            LedgerError::Conflict {
                product_id,
                attempts,
            } => write!(
                f,
                "Adjustment of '{product_id}' gave up after {attempts} conflicting attempts; re-read and retry"
            ),
            LedgerError::Postgres(e) => write!(f, "PostgreSQL error: {e}"),
            LedgerError::Storage(msg) => write!(f, "Storage error: {msg}"),
        }
    }
}

impl std::error::Error for LedgerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LedgerError::Postgres(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PostgresError> for LedgerError {
    fn from(err: PostgresError) -> Self {
        LedgerError::Postgres(err)
    }
}
