//! Storage backends.
//!
//! A [`LedgerStore`] is one backend that serves both the movement log and the
//! quantity projection, which is what lets it commit the pair atomically.
//! [`MemoryStore`] keeps everything in process; [`PgStore`] persists to
//! PostgreSQL through `may_postgres`.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

use crate::error::LedgerError;
use crate::model::{MovementRecord, NewMovement, ProductId, ProductStockRecord};
use crate::movement_log::MovementLog;
use crate::projector::QuantityProjector;
use serde::{Deserialize, Serialize};

/// Outcome of one atomic (projection update, log append) pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Committed {
    pub movement: MovementRecord,
    pub state: ProductStockRecord,
}

/// A backend serving both halves of the ledger
pub trait LedgerStore: MovementLog + QuantityProjector {
    /// Apply `movement` to the projection and append it to the log as one unit
    ///
    /// The projection is advanced with a compare-and-set on
    /// `expected_version`; the movement is appended only once that succeeded,
    /// and neither change is visible unless both are.
    ///
    /// # Errors
    ///
    /// - `LedgerError::ConcurrentModification` if the version moved
    /// - `LedgerError::Validation` / `LedgerError::InsufficientStock` if the
    ///   movement is malformed or would go negative
    /// - `LedgerError::NotFound` for unknown products
    ///
    /// On error nothing is persisted.
    fn commit(&self, movement: NewMovement, expected_version: i64)
        -> Result<Committed, LedgerError>;

    /// A mutually consistent (projection, oldest-first history) pair
    fn audit_view(
        &self,
        product_id: &ProductId,
    ) -> Result<(ProductStockRecord, Vec<MovementRecord>), LedgerError>;
}

/// Check that a planned movement lines up with the projection it is applied to
pub(crate) fn check_commit(
    current: &ProductStockRecord,
    movement: &NewMovement,
    expected_version: i64,
) -> Result<(), LedgerError> {
    if current.version != expected_version {
        return Err(LedgerError::ConcurrentModification {
            product_id: current.product_id.clone(),
            expected_version,
            actual_version: current.version,
        });
    }
    if movement.product_id != current.product_id {
        return Err(LedgerError::validation(format!(
            "movement for '{}' committed against '{}'",
            movement.product_id, current.product_id
        )));
    }
    if movement.version != expected_version + 1 {
        return Err(LedgerError::validation(format!(
            "movement version {} does not follow expected version {}",
            movement.version, expected_version
        )));
    }
    if movement.previous_qty != current.quantity_on_hand {
        return Err(LedgerError::validation(format!(
            "'{}' holds {} at version {} but the movement was planned from {}",
            current.product_id, current.quantity_on_hand, current.version, movement.previous_qty
        )));
    }
    Ok(())
}
