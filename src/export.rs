//! CSV export of stock levels and movement history.

use crate::alerting::{PriceCatalog, StockLevel};
use crate::error::LedgerError;
use crate::model::{MovementRecord, ProductStockRecord};
use rust_decimal::Decimal;
use serde::Serialize;
use std::fmt;
use std::io::Write;

#[derive(Debug)]
pub enum ExportError {
    Csv(csv::Error),
    Io(std::io::Error),
    Ledger(LedgerError),
}

impl fmt::Display for ExportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportError::Csv(e) => write!(f, "CSV error: {e}"),
            ExportError::Io(e) => write!(f, "I/O error: {e}"),
            ExportError::Ledger(e) => write!(f, "Ledger error: {e}"),
        }
    }
}

impl std::error::Error for ExportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ExportError::Csv(e) => Some(e),
            ExportError::Io(e) => Some(e),
            ExportError::Ledger(e) => Some(e),
        }
    }
}

impl From<csv::Error> for ExportError {
    fn from(err: csv::Error) -> Self {
        ExportError::Csv(err)
    }
}

impl From<std::io::Error> for ExportError {
    fn from(err: std::io::Error) -> Self {
        ExportError::Io(err)
    }
}

impl From<LedgerError> for ExportError {
    fn from(err: LedgerError) -> Self {
        ExportError::Ledger(err)
    }
}

#[derive(Serialize)]
struct StockRow<'a> {
    product_id: &'a str,
    quantity_on_hand: i64,
    low_stock_threshold: i64,
    level: StockLevel,
    version: i64,
    unit_price: Option<Decimal>,
    stock_value: Option<Decimal>,
}

#[derive(Serialize)]
struct MovementRow<'a> {
    id: i64,
    product_id: &'a str,
    #[serde(rename = "type")]
    movement_type: &'static str,
    quantity_delta: i64,
    previous_qty: i64,
    new_qty: i64,
    version: i64,
    reason: Option<&'a str>,
    actor: Option<&'a str>,
    created_at: String,
}

/// Write one row per product; returns the number of rows written
///
/// With `low_stock_only`, products that are low or out of stock are kept.
pub fn write_stock_csv<W: Write>(
    writer: W,
    records: &[ProductStockRecord],
    low_stock_only: bool,
    catalog: &dyn PriceCatalog,
) -> Result<usize, ExportError> {
    let mut csv = csv::Writer::from_writer(writer);
    let mut rows = 0;
    for record in records {
        let level = StockLevel::classify(record);
        if low_stock_only && level == StockLevel::InStock {
            continue;
        }
        let unit_price = catalog.unit_price(&record.product_id);
        csv.serialize(StockRow {
            product_id: record.product_id.as_str(),
            quantity_on_hand: record.quantity_on_hand,
            low_stock_threshold: record.low_stock_threshold,
            level,
            version: record.version,
            unit_price,
            stock_value: unit_price.map(|p| p.saturating_mul(Decimal::from(record.quantity_on_hand))),
        })?;
        rows += 1;
    }
    if rows == 0 {
        csv.write_record([
            "product_id",
            "quantity_on_hand",
            "low_stock_threshold",
            "level",
            "version",
            "unit_price",
            "stock_value",
        ])?;
    }
    csv.flush()?;
    Ok(rows)
}

/// Write movements in the order given; returns the number of rows written
pub fn write_movements_csv<W: Write>(writer: W, movements: &[MovementRecord]) -> Result<usize, ExportError> {
    let mut csv = csv::Writer::from_writer(writer);
    for movement in movements {
        csv.serialize(MovementRow {
            id: movement.id,
            product_id: movement.product_id.as_str(),
            movement_type: movement.movement_type.as_str(),
            quantity_delta: movement.quantity_delta,
            previous_qty: movement.previous_qty,
            new_qty: movement.new_qty,
            version: movement.version,
            reason: movement.reason.as_deref(),
            actor: movement.actor.as_deref(),
            created_at: movement.created_at.to_rfc3339(),
        })?;
    }
    if movements.is_empty() {
        csv.write_record([
            "id",
            "product_id",
            "type",
            "quantity_delta",
            "previous_qty",
            "new_qty",
            "version",
            "reason",
            "actor",
            "created_at",
        ])?;
    }
    csv.flush()?;
    Ok(movements.len())
}
