//! Checkout integration: multi-line sales.
//!
//! Lines are committed one by one as `SALE` movements. If a line fails, the
//! lines already committed are reversed with compensating `ADJUSTMENT`
//! movements, newest first, so an aborted sale never leaves stock partially
//! decremented and the log still shows exactly what happened.

use crate::adjustment::{AdjustRequest, AdjustmentService};
use crate::error::LedgerError;
use crate::model::{MovementRecord, MovementType, ProductId, CHECKOUT_ACTOR};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One order line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleLine {
    pub product_id: ProductId,
    pub quantity: i64,
}

impl SaleLine {
    pub fn new(product_id: impl Into<ProductId>, quantity: i64) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

/// Movements of a fully committed sale, in line order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleReceipt {
    pub order_ref: String,
    pub movements: Vec<MovementRecord>,
}

/// A sale that was aborted
#[derive(Debug)]
pub struct SaleError {
    pub order_ref: String,
    /// Index of the line that failed, `None` when the order was rejected up front
    pub failed_line: Option<usize>,
    pub cause: LedgerError,
    /// Compensating movements appended for lines committed before the failure
    pub compensations: Vec<MovementRecord>,
    /// Lines whose compensation could not be recorded; stock for these is
    /// still decremented and needs an operator
    pub uncompensated: Vec<(SaleLine, LedgerError)>,
}

impl SaleError {
    fn rejected(order_ref: &str, cause: LedgerError) -> Self {
        Self {
            order_ref: order_ref.to_string(),
            failed_line: None,
            cause,
            compensations: Vec::new(),
            uncompensated: Vec::new(),
        }
    }

    /// Whether every committed line was reversed
    pub fn is_fully_compensated(&self) -> bool {
        self.uncompensated.is_empty()
    }
}

impl fmt::Display for SaleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.failed_line {
            Some(line) => write!(
                f,
                "Sale {} aborted at line {}: {}",
                self.order_ref, line, self.cause
            )?,
            None => write!(f, "Sale {} rejected: {}", self.order_ref, self.cause)?,
        }
        if !self.uncompensated.is_empty() {
            write!(
                f,
                " ({} line(s) could not be compensated)",
                self.uncompensated.len()
            )?;
        }
        Ok(())
    }
}

impl std::error::Error for SaleError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.cause)
    }
}

/// Records checkout sales through the adjustment service
pub struct SaleRecorder {
    adjustments: Arc<AdjustmentService>,
}

impl SaleRecorder {
    pub fn new(adjustments: Arc<AdjustmentService>) -> Self {
        Self { adjustments }
    }

    /// Commit every line of an order, or none of them
    ///
    /// # Errors
    ///
    /// Returns `SaleError` when the order is empty or any line fails; see
    /// [`SaleError::compensations`] for what was reversed.
    pub fn commit_sale(&self, order_ref: &str, lines: &[SaleLine]) -> Result<SaleReceipt, SaleError> {
        let order_ref = order_ref.trim();
        if order_ref.is_empty() {
            return Err(SaleError::rejected(
                order_ref,
                LedgerError::validation("order reference must not be empty"),
            ));
        }
        if lines.is_empty() {
            return Err(SaleError::rejected(
                order_ref,
                LedgerError::validation("an order needs at least one line"),
            ));
        }

        let mut committed: Vec<(&SaleLine, MovementRecord)> = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            let request = AdjustRequest::new(line.product_id.clone(), MovementType::Sale, line.quantity)
                .reason(format!("order {order_ref}"))
                .actor(CHECKOUT_ACTOR);
            match self.adjustments.adjust(request) {
                Ok(outcome) => committed.push((line, outcome.movement)),
                Err(cause) => {
                    log::warn!("sale {order_ref} failed at line {index} ({}): {cause}", line.product_id);
                    let (compensations, uncompensated) = self.compensate(order_ref, &committed);
                    return Err(SaleError {
                        order_ref: order_ref.to_string(),
                        failed_line: Some(index),
                        cause,
                        compensations,
                        uncompensated,
                    });
                }
            }
        }

        log::info!("sale {order_ref} committed ({} line(s))", committed.len());
        Ok(SaleReceipt {
            order_ref: order_ref.to_string(),
            movements: committed.into_iter().map(|(_, movement)| movement).collect(),
        })
    }

    fn compensate(
        &self,
        order_ref: &str,
        committed: &[(&SaleLine, MovementRecord)],
    ) -> (Vec<MovementRecord>, Vec<(SaleLine, LedgerError)>) {
        let mut compensations = Vec::new();
        let mut uncompensated = Vec::new();
        for (line, sale) in committed.iter().rev() {
            let request = AdjustRequest::new(
                line.product_id.clone(),
                MovementType::Adjustment,
                -sale.quantity_delta,
            )
            .reason(format!("order {order_ref} aborted; reverses movement {}", sale.id))
            .actor(CHECKOUT_ACTOR);
            match self.adjustments.adjust(request) {
                Ok(outcome) => compensations.push(outcome.movement),
                Err(e) => {
                    log::error!(
                        "could not compensate sale movement {} of order {order_ref}: {e}",
                        sale.id
                    );
                    uncompensated.push(((*line).clone(), e));
                }
            }
        }
        (compensations, uncompensated)
    }
}
