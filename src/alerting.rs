//! Alerting & summary engine.
//!
//! The queries here ([`low_stock`], [`out_of_stock`], [`summarize`]) are pure
//! functions over a projector snapshot. [`AlertingEngine`] additionally
//! remembers each product's last [`StockLevel`] and turns committed states
//! into [`StockTransition`]s, which it hands to the [`AlertDispatcher`].

use crate::dispatch::AlertDispatcher;
use crate::model::{ProductId, ProductStockRecord};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

/// Coarse classification of a product's stock
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StockLevel {
    InStock,
    /// `0 < quantity <= threshold`
    Low,
    OutOfStock,
}

impl StockLevel {
    pub fn classify(record: &ProductStockRecord) -> Self {
        if record.quantity_on_hand <= 0 {
            StockLevel::OutOfStock
        } else if record.quantity_on_hand <= record.low_stock_threshold {
            StockLevel::Low
        } else {
            StockLevel::InStock
        }
    }
}

/// A product moved from one stock level to another
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockTransition {
    pub product_id: ProductId,
    /// `None` the first time the engine sees the product
    pub from: Option<StockLevel>,
    pub to: StockLevel,
    pub quantity_on_hand: i64,
    pub low_stock_threshold: i64,
    pub version: i64,
}

impl StockTransition {
    /// The product was out of stock and now has stock again
    pub fn is_restock(&self) -> bool {
        self.from == Some(StockLevel::OutOfStock) && self.to != StockLevel::OutOfStock
    }
}

/// Source of unit prices for inventory valuation
pub trait PriceCatalog: Send + Sync {
    fn unit_price(&self, product_id: &ProductId) -> Option<Decimal>;
}

/// In-memory price list
#[derive(Debug, Default)]
pub struct StaticPriceCatalog {
    prices: RwLock<HashMap<ProductId, Decimal>>,
}

impl StaticPriceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(self, product_id: impl Into<ProductId>, price: Decimal) -> Self {
        self.set_price(product_id, price);
        self
    }

    pub fn set_price(&self, product_id: impl Into<ProductId>, price: Decimal) {
        let mut prices = match self.prices.write() {
            Ok(prices) => prices,
            Err(poisoned) => poisoned.into_inner(),
        };
        prices.insert(product_id.into(), price);
    }
}

impl PriceCatalog for StaticPriceCatalog {
    fn unit_price(&self, product_id: &ProductId) -> Option<Decimal> {
        let prices = match self.prices.read() {
            Ok(prices) => prices,
            Err(poisoned) => poisoned.into_inner(),
        };
        prices.get(product_id).copied()
    }
}

/// Store-wide inventory figures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InventorySummary {
    pub total_products: usize,
    pub total_units: i64,
    pub low_stock_count: usize,
    pub out_of_stock_count: usize,
    /// `sum(quantity * unit price)` over priced products
    pub inventory_value: Decimal,
    /// Products without a known price; they add nothing to `inventory_value`
    pub unpriced_products: usize,
}

fn is_low(record: &ProductStockRecord, threshold: Option<i64>) -> bool {
    let threshold = threshold.unwrap_or(record.low_stock_threshold);
    record.quantity_on_hand > 0 && record.quantity_on_hand <= threshold
}

/// Products with `0 < quantity <= threshold`, lowest quantity first
///
/// `threshold` overrides every product's own threshold when given.
pub fn low_stock(records: &[ProductStockRecord], threshold: Option<i64>) -> Vec<ProductStockRecord> {
    let mut low: Vec<ProductStockRecord> = records
        .iter()
        .filter(|r| is_low(r, threshold))
        .cloned()
        .collect();
    low.sort_by(|a, b| {
        a.quantity_on_hand
            .cmp(&b.quantity_on_hand)
            .then_with(|| a.product_id.cmp(&b.product_id))
    });
    low
}

/// Products with nothing on hand, ordered by product id
pub fn out_of_stock(records: &[ProductStockRecord]) -> Vec<ProductStockRecord> {
    let mut out: Vec<ProductStockRecord> = records
        .iter()
        .filter(|r| r.is_out_of_stock())
        .cloned()
        .collect();
    out.sort_by(|a, b| a.product_id.cmp(&b.product_id));
    out
}

/// Totals saturate at the numeric bounds instead of overflowing
pub fn summarize(records: &[ProductStockRecord], catalog: &dyn PriceCatalog) -> InventorySummary {
    let mut summary = InventorySummary {
        total_products: records.len(),
        total_units: 0,
        low_stock_count: 0,
        out_of_stock_count: 0,
        inventory_value: Decimal::ZERO,
        unpriced_products: 0,
    };
    for record in records {
        summary.total_units = summary.total_units.saturating_add(record.quantity_on_hand);
        if record.is_out_of_stock() {
            summary.out_of_stock_count += 1;
        } else if is_low(record, None) {
            summary.low_stock_count += 1;
        }
        match catalog.unit_price(&record.product_id) {
            Some(price) => {
                let value = Decimal::from(record.quantity_on_hand).saturating_mul(price);
                summary.inventory_value = summary.inventory_value.saturating_add(value);
            }
            None => summary.unpriced_products += 1,
        }
    }
    summary
}

/// Tracks stock levels and emits transitions
pub struct AlertingEngine {
    /// Last classification and the version it was computed from
    levels: Mutex<HashMap<ProductId, (StockLevel, i64)>>,
    dispatcher: Option<AlertDispatcher>,
}

impl AlertingEngine {
    pub fn new(dispatcher: Option<AlertDispatcher>) -> Self {
        Self {
            levels: Mutex::new(HashMap::new()),
            dispatcher,
        }
    }

    pub fn dispatcher(&self) -> Option<&AlertDispatcher> {
        self.dispatcher.as_ref()
    }

    /// Seed known levels without emitting transitions (startup)
    pub fn prime(&self, records: &[ProductStockRecord]) {
        let mut levels = self.lock_levels();
        for record in records {
            levels.insert(
                record.product_id.clone(),
                (StockLevel::classify(record), record.version),
            );
        }
    }

    /// Reclassify a product after a committed change
    ///
    /// States older than the last one seen are ignored, so concurrent
    /// adjusters reporting out of order cannot produce a backwards
    /// transition. A changed threshold re-reports the same version and is
    /// reclassified. The transition, if any, is queued on the dispatcher.
    pub fn observe(&self, record: &ProductStockRecord) -> Option<StockTransition> {
        let to = StockLevel::classify(record);
        let from = {
            let mut levels = self.lock_levels();
            let previous = levels.get(&record.product_id).copied();
            if let Some((_, seen_version)) = previous {
                if seen_version > record.version {
                    return None;
                }
            }
            levels.insert(record.product_id.clone(), (to, record.version));
            previous.map(|(level, _)| level)
        };

        let changed = match from {
            Some(level) => level != to,
            None => to != StockLevel::InStock,
        };
        if !changed {
            return None;
        }

        let transition = StockTransition {
            product_id: record.product_id.clone(),
            from,
            to,
            quantity_on_hand: record.quantity_on_hand,
            low_stock_threshold: record.low_stock_threshold,
            version: record.version,
        };
        log::debug!(
            "stock level of {} changed: {:?} -> {:?}",
            transition.product_id,
            transition.from,
            transition.to
        );
        if let Some(dispatcher) = &self.dispatcher {
            dispatcher.dispatch(transition.clone());
        }
        Some(transition)
    }

    pub fn level_of(&self, product_id: &ProductId) -> Option<StockLevel> {
        self.lock_levels().get(product_id).map(|(level, _)| *level)
    }

    fn lock_levels(&self) -> std::sync::MutexGuard<'_, HashMap<ProductId, (StockLevel, i64)>> {
        match self.levels.lock() {
            Ok(levels) => levels,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
