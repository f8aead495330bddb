//! Quantity Projector: the versioned current-state view of each product.
//!
//! The projected quantity is a cache of the movement fold. [`reconcile`]
//! replays a product's history and reports every way in which the cache and
//! the log disagree; a correct ledger always produces an empty report.

use crate::error::LedgerError;
use crate::model::{MovementRecord, OpenStock, ProductId, ProductStockRecord};
use serde::{Deserialize, Serialize};

/// Versioned current-state storage
///
/// Quantity changes go through [`LedgerStore::commit`](crate::store::LedgerStore::commit),
/// which applies the delta and appends its movement as one unit.
pub trait QuantityProjector: Send + Sync {
    /// Current projected state of a product
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::NotFound` if the product was never initialized.
    fn get_current(&self, product_id: &ProductId) -> Result<ProductStockRecord, LedgerError>;

    /// Bring a product under tracking
    ///
    /// A positive opening quantity is logged as a `STOCK_IN` movement in the
    /// same atomic unit, so the returned record is at version 1 in that case
    /// and at version 0 otherwise.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::AlreadyExists` when the product is already tracked.
    fn initialize(&self, request: &OpenStock) -> Result<ProductStockRecord, LedgerError>;

    /// Change the per-product low-stock threshold; quantity and version are untouched
    fn set_low_stock_threshold(
        &self,
        product_id: &ProductId,
        threshold: i64,
    ) -> Result<ProductStockRecord, LedgerError>;

    /// Every tracked product, ordered by product id
    fn snapshot(&self) -> Result<Vec<ProductStockRecord>, LedgerError>;
}

/// One way in which the projection and the movement history disagree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum Discrepancy {
    /// Sum of deltas differs from the projected quantity
    #[serde(rename_all = "camelCase")]
    QuantityMismatch { projected: i64, replayed: i64 },
    /// Projected version differs from the number of movements
    #[serde(rename_all = "camelCase")]
    VersionMismatch { projected: i64, movements: i64 },
    /// A movement's `previous_qty` does not continue the running total
    #[serde(rename_all = "camelCase")]
    BrokenChain {
        movement_id: i64,
        expected_previous: i64,
        recorded_previous: i64,
    },
    /// A movement's version does not follow its predecessor's
    #[serde(rename_all = "camelCase")]
    VersionGap {
        movement_id: i64,
        expected_version: i64,
        recorded_version: i64,
    },
    /// A snapshot below zero was recorded
    #[serde(rename_all = "camelCase")]
    NegativeQuantity { movement_id: i64, quantity: i64 },
    /// A movement whose snapshots do not add up
    #[serde(rename_all = "camelCase")]
    InconsistentMovement { movement_id: i64 },
}

/// Result of replaying one product's history against its projection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationReport {
    pub product_id: ProductId,
    pub projected_quantity: i64,
    pub replayed_quantity: i64,
    pub projected_version: i64,
    pub movement_count: usize,
    pub discrepancies: Vec<Discrepancy>,
}

impl ReconciliationReport {
    pub fn is_clean(&self) -> bool {
        self.discrepancies.is_empty()
    }
}

/// Replay `history` (oldest first) and compare it with `record`
pub fn reconcile(record: &ProductStockRecord, history: &[MovementRecord]) -> ReconciliationReport {
    let mut discrepancies = Vec::new();
    let mut running: i64 = 0;
    let mut expected_version: i64 = 1;

    for movement in history {
        if movement.previous_qty != running {
            discrepancies.push(Discrepancy::BrokenChain {
                movement_id: movement.id,
                expected_previous: running,
                recorded_previous: movement.previous_qty,
            });
        }
        if movement.previous_qty.checked_add(movement.quantity_delta) != Some(movement.new_qty) {
            discrepancies.push(Discrepancy::InconsistentMovement {
                movement_id: movement.id,
            });
        }
        if movement.version != expected_version {
            discrepancies.push(Discrepancy::VersionGap {
                movement_id: movement.id,
                expected_version,
                recorded_version: movement.version,
            });
        }
        running = running.saturating_add(movement.quantity_delta);
        if running < 0 || movement.new_qty < 0 {
            discrepancies.push(Discrepancy::NegativeQuantity {
                movement_id: movement.id,
                quantity: running.min(movement.new_qty),
            });
        }
        expected_version = movement.version.saturating_add(1);
    }

    if running != record.quantity_on_hand {
        discrepancies.push(Discrepancy::QuantityMismatch {
            projected: record.quantity_on_hand,
            replayed: running,
        });
    }
    let movements = history.len() as i64;
    if movements != record.version {
        discrepancies.push(Discrepancy::VersionMismatch {
            projected: record.version,
            movements,
        });
    }

    ReconciliationReport {
        product_id: record.product_id.clone(),
        projected_quantity: record.quantity_on_hand,
        replayed_quantity: running,
        projected_version: record.version,
        movement_count: history.len(),
        discrepancies,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{MovementType, NewMovement};
    use chrono::Utc;

    fn build(deltas: &[i64]) -> (ProductStockRecord, Vec<MovementRecord>) {
        let mut current = ProductStockRecord::opening(ProductId::from("p"), 5);
        let mut history = Vec::new();
        for (i, delta) in deltas.iter().enumerate() {
            let movement_type = if *delta > 0 {
                MovementType::StockIn
            } else {
                MovementType::StockOut
            };
            let planned = NewMovement::against(&current, movement_type, *delta, None, Some("op".into()));
            current.quantity_on_hand = planned.new_qty;
            current.version = planned.version;
            history.push(planned.into_record(i as i64 + 1, Utc::now()));
        }
        (current, history)
    }

    #[test]
    fn test_reconcile_clean_history() {
        let (record, history) = build(&[10, -3, 5, -12]);
        let report = reconcile(&record, &history);
        assert!(report.is_clean(), "{:?}", report.discrepancies);
        assert_eq!(report.replayed_quantity, 0);
        assert_eq!(report.movement_count, 4);
    }

    #[test]
    fn test_reconcile_empty_history() {
        let record = ProductStockRecord::opening(ProductId::from("p"), 5);
        assert!(reconcile(&record, &[]).is_clean());
    }

    #[test]
    fn test_reconcile_detects_projection_drift() {
        let (mut record, history) = build(&[10, -3]);
        record.quantity_on_hand = 9;
        let report = reconcile(&record, &history);
        assert_eq!(
            report.discrepancies,
            vec![Discrepancy::QuantityMismatch {
                projected: 9,
                replayed: 7
            }]
        );
    }

    #[test]
    fn test_reconcile_detects_missing_movement() {
        let (record, mut history) = build(&[10, -3, 2]);
        history.remove(1);
        let report = reconcile(&record, &history);
        assert!(report
            .discrepancies
            .iter()
            .any(|d| matches!(d, Discrepancy::BrokenChain { movement_id: 3, .. })));
        assert!(report
            .discrepancies
            .iter()
            .any(|d| matches!(d, Discrepancy::VersionGap { movement_id: 3, .. })));
        assert!(report
            .discrepancies
            .iter()
            .any(|d| matches!(d, Discrepancy::VersionMismatch { projected: 3, movements: 2 })));
    }

    #[test]
    fn test_reconcile_survives_extreme_corrupted_rows() {
        let (record, mut history) = build(&[10, -3]);
        history[1].quantity_delta = i64::MAX;
        history[1].version = i64::MAX;
        let report = reconcile(&record, &history);
        assert!(!report.is_clean());
        assert_eq!(report.replayed_quantity, i64::MAX);
    }
}
