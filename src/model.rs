//! Ledger records and their serialized shapes.
//!
//! Two records make up the ledger: the [`ProductStockRecord`] (the projected,
//! versioned quantity of one product) and the immutable [`MovementRecord`]
//! (one committed stock change). Both serialize with camelCase field names so
//! collaborators can pass them straight through to their own wire formats.

use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Actor recorded on sales committed by the checkout collaborator
pub const CHECKOUT_ACTOR: &str = "system:checkout";

/// Actor recorded on movements the ledger creates on its own behalf
pub const LEDGER_ACTOR: &str = "system:ledger";

/// Opaque product identifier, unique within a store
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProductId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ProductId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Kind of stock change
///
/// The type only decides how a requested quantity is turned into a signed
/// delta; the log and its invariants treat every type the same way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    /// Goods received
    StockIn,
    /// Goods removed manually (damage write-off, internal use, ...)
    StockOut,
    /// Signed correction of a miscount; requires a reason
    Adjustment,
    /// Goods sold through checkout
    Sale,
}

impl MovementType {
    pub const ALL: [MovementType; 4] = [
        MovementType::StockIn,
        MovementType::StockOut,
        MovementType::Adjustment,
        MovementType::Sale,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::StockIn => "STOCK_IN",
            MovementType::StockOut => "STOCK_OUT",
            MovementType::Adjustment => "ADJUSTMENT",
            MovementType::Sale => "SALE",
        }
    }

    /// Types whose requested quantity removes stock and is floored at zero
    pub fn is_outbound(&self) -> bool {
        matches!(self, MovementType::StockOut | MovementType::Sale)
    }
}

impl fmt::Display for MovementType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MovementType {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MovementType::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| LedgerError::validation(format!("unknown movement type '{s}'")))
    }
}

/// Projected stock state of one product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductStockRecord {
    pub product_id: ProductId,
    pub quantity_on_hand: i64,
    pub low_stock_threshold: i64,
    /// Incremented by exactly one per committed movement
    pub version: i64,
}

impl ProductStockRecord {
    /// Record at version 0: a product that has just entered tracking
    pub fn opening(product_id: ProductId, low_stock_threshold: i64) -> Self {
        Self {
            product_id,
            quantity_on_hand: 0,
            low_stock_threshold,
            version: 0,
        }
    }

    pub fn is_out_of_stock(&self) -> bool {
        self.quantity_on_hand == 0
    }
}

/// One committed, immutable stock change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MovementRecord {
    pub id: i64,
    pub product_id: ProductId,
    #[serde(rename = "type")]
    pub movement_type: MovementType,
    pub quantity_delta: i64,
    pub previous_qty: i64,
    pub new_qty: i64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub actor: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Product version this movement produced
    pub version: i64,
}

/// A movement that has been planned but not yet committed
///
/// The store assigns `id` and `created_at` when it appends the movement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMovement {
    pub product_id: ProductId,
    pub movement_type: MovementType,
    pub quantity_delta: i64,
    pub previous_qty: i64,
    pub new_qty: i64,
    pub reason: Option<String>,
    pub actor: Option<String>,
    pub version: i64,
}

impl NewMovement {
    /// Plan a movement of `delta` against the given projected state
    ///
    /// `new_qty` saturates when the sum leaves `i64`; [`NewMovement::validate`]
    /// rejects such a plan before anything is stored.
    pub fn against(
        current: &ProductStockRecord,
        movement_type: MovementType,
        delta: i64,
        reason: Option<String>,
        actor: Option<String>,
    ) -> Self {
        Self {
            product_id: current.product_id.clone(),
            movement_type,
            quantity_delta: delta,
            previous_qty: current.quantity_on_hand,
            new_qty: current.quantity_on_hand.saturating_add(delta),
            reason,
            actor,
            version: current.version + 1,
        }
    }

    /// Check the structural invariants every logged movement must satisfy
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Validation` when the delta is zero, the snapshot
    /// arithmetic does not add up, a snapshot is negative, an `ADJUSTMENT`
    /// carries no reason, or a non-sale movement carries no actor. Returns
    /// `LedgerError::InsufficientStock` when `new_qty` would be negative.
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.quantity_delta == 0 {
            return Err(LedgerError::validation(
                "quantity delta must not be zero; no-op movements are not logged",
            ));
        }
        if self.previous_qty < 0 {
            return Err(LedgerError::validation(format!(
                "previous quantity {} is negative",
                self.previous_qty
            )));
        }
        match self.previous_qty.checked_add(self.quantity_delta) {
            None => {
                return Err(LedgerError::validation(format!(
                    "quantity overflow: {} + {} does not fit in i64",
                    self.previous_qty, self.quantity_delta
                )));
            }
            Some(sum) if sum != self.new_qty => {
                return Err(LedgerError::validation(format!(
                    "new quantity {} != previous quantity {} + delta {}",
                    self.new_qty, self.previous_qty, self.quantity_delta
                )));
            }
            Some(_) => {}
        }
        if self.new_qty < 0 {
            return Err(LedgerError::InsufficientStock {
                product_id: self.product_id.clone(),
                on_hand: self.previous_qty,
                requested: self.quantity_delta.saturating_neg(),
            });
        }
        if self.version < 1 {
            return Err(LedgerError::validation(format!(
                "movement version must be at least 1, got {}",
                self.version
            )));
        }
        if self.movement_type == MovementType::Adjustment && self.reason.is_none() {
            return Err(LedgerError::validation(
                "a reason is required for ADJUSTMENT movements",
            ));
        }
        if self.movement_type != MovementType::Sale && self.actor.is_none() {
            return Err(LedgerError::validation(format!(
                "an actor is required for {} movements",
                self.movement_type
            )));
        }
        Ok(())
    }

    /// Attach the store-assigned identity, producing the immutable record
    pub fn into_record(self, id: i64, created_at: DateTime<Utc>) -> MovementRecord {
        MovementRecord {
            id,
            product_id: self.product_id,
            movement_type: self.movement_type,
            quantity_delta: self.quantity_delta,
            previous_qty: self.previous_qty,
            new_qty: self.new_qty,
            reason: self.reason,
            actor: self.actor,
            created_at,
            version: self.version,
        }
    }
}

/// Request to bring a product under ledger tracking
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenStock {
    pub product_id: ProductId,
    /// Opening count; logged as a `STOCK_IN` movement when positive
    pub starting_qty: i64,
    pub low_stock_threshold: i64,
    pub actor: Option<String>,
}

impl OpenStock {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.product_id.as_str().trim().is_empty() {
            return Err(LedgerError::validation("product id must not be empty"));
        }
        if self.starting_qty < 0 {
            return Err(LedgerError::validation(format!(
                "starting quantity must not be negative, got {}",
                self.starting_qty
            )));
        }
        if self.low_stock_threshold < 0 {
            return Err(LedgerError::validation(format!(
                "low stock threshold must not be negative, got {}",
                self.low_stock_threshold
            )));
        }
        Ok(())
    }

    /// The opening receipt movement, if the product starts with stock
    pub fn opening_movement(&self) -> Option<NewMovement> {
        if self.starting_qty == 0 {
            return None;
        }
        let opening = ProductStockRecord::opening(self.product_id.clone(), self.low_stock_threshold);
        Some(NewMovement::against(
            &opening,
            MovementType::StockIn,
            self.starting_qty,
            Some("opening balance".to_string()),
            Some(
                self.actor
                    .clone()
                    .unwrap_or_else(|| LEDGER_ACTOR.to_string()),
            ),
        ))
    }
}

/// Trim free-text input, treating blank strings as absent
pub(crate) fn normalize_text(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}
