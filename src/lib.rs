//! # stockledger
//!
//! Event-sourced inventory ledger for the `may` coroutine runtime.
//!
//! Every stock change is an immutable movement in an append-only log; the
//! current quantity of each product is a versioned projection of that log.
//! Writes go through [`AdjustmentService`], which commits the projection
//! update and the log append as one unit using an optimistic version check,
//! retrying lost races. Backends: [`MemoryStore`] and [`PgStore`]
//! (`may_postgres`).
//!
//! ```rust,no_run
//! use stockledger::{AdjustRequest, Ledger, LedgerSettings, MovementType};
//!
//! let ledger = Ledger::in_memory(LedgerSettings::default())?;
//! ledger.initialize("sku-1", 10, None, Some("operator:7"))?;
//! let outcome = ledger.adjust(AdjustRequest::new("sku-1", MovementType::Sale, 3))?;
//! assert_eq!(outcome.new_state.quantity_on_hand, 7);
//! # Ok::<(), stockledger::LedgerError>(())
//! ```

pub mod adjustment;
pub mod alerting;
pub mod checkout;
pub mod config;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod executor;
pub mod export;
pub mod ledger;
pub mod logging;
pub mod metrics;
pub mod migration;
pub mod model;
pub mod movement_log;
pub mod pool;
pub mod projector;
pub mod store;
pub mod transaction;
pub mod waitlist;

pub use adjustment::{resolve_delta, AdjustOutcome, AdjustRequest, AdjustmentService, RetryPolicy};
pub use alerting::{
    AlertingEngine, InventorySummary, PriceCatalog, StaticPriceCatalog, StockLevel, StockTransition,
};
pub use checkout::{SaleError, SaleLine, SaleReceipt, SaleRecorder};
pub use config::{DatabaseConfig, LedgerSettings, StockLedgerConfig};
pub use dispatch::{AlertDispatcher, AlertSink};
pub use error::LedgerError;
pub use export::ExportError;
pub use ledger::{Ledger, LedgerBuilder};
pub use model::{
    MovementRecord, MovementType, NewMovement, OpenStock, ProductId, ProductStockRecord,
    CHECKOUT_ACTOR, LEDGER_ACTOR,
};
pub use movement_log::{Cursor, MovementFilter, MovementLog, MovementPage, PageRequest};
pub use projector::{reconcile, Discrepancy, QuantityProjector, ReconciliationReport};
pub use store::{Committed, LedgerStore, MemoryStore, PgStore};
pub use waitlist::{RestockNotifier, RestockWaitlist, Subscription};
