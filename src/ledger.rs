//! The assembled ledger.
//!
//! [`Ledger`] wires a [`LedgerStore`] to the adjustment service, the alerting
//! engine with its dispatcher, the checkout recorder and the optional
//! restock waitlist. It is the surface the operator console, checkout and
//! reporting collaborators call.

use crate::adjustment::{AdjustOutcome, AdjustRequest, AdjustmentService, RetryPolicy};
use crate::alerting::{
    low_stock, out_of_stock, summarize, AlertingEngine, InventorySummary, PriceCatalog,
    StaticPriceCatalog, StockLevel,
};
use crate::checkout::{SaleError, SaleLine, SaleReceipt, SaleRecorder};
use crate::config::{LedgerSettings, StockLedgerConfig};
use crate::dispatch::{AlertDispatcher, AlertSink};
use crate::error::LedgerError;
use crate::export::{write_movements_csv, write_stock_csv, ExportError};
use crate::model::{MovementRecord, OpenStock, ProductId, ProductStockRecord};
use crate::movement_log::{Cursor, MovementFilter, MovementLog, MovementPage, PageRequest};
use crate::projector::{reconcile, QuantityProjector, ReconciliationReport};
use crate::store::{LedgerStore, MemoryStore, PgStore};
use crate::waitlist::{RestockNotifier, RestockWaitlist, Subscription};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// Collects optional collaborators before the ledger starts
pub struct LedgerBuilder {
    settings: LedgerSettings,
    catalog: Arc<dyn PriceCatalog>,
    notifier: Option<Arc<dyn RestockNotifier>>,
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl LedgerBuilder {
    pub fn new(settings: LedgerSettings) -> Self {
        Self {
            settings,
            catalog: Arc::new(StaticPriceCatalog::new()),
            notifier: None,
            sinks: Vec::new(),
        }
    }

    /// Unit prices used by [`Ledger::summary`] and the stock export
    pub fn price_catalog(mut self, catalog: Arc<dyn PriceCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Enable the back-in-stock waitlist, delivering through `notifier`
    pub fn restock_notifier(mut self, notifier: Arc<dyn RestockNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn alert_sink(mut self, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Start the alert worker and attach everything to `store`
    ///
    /// Known stock levels are primed from the store, so products that were
    /// already out of stock before a restart still raise a restock
    /// transition when they are replenished.
    pub fn build(self, store: Arc<dyn LedgerStore>) -> Result<Ledger, LedgerError> {
        self.settings
            .validate()
            .map_err(|e| LedgerError::validation(e.to_string()))?;

        let dispatcher = AlertDispatcher::start(self.settings.alert_queue_capacity)?;
        for sink in self.sinks {
            dispatcher.register(sink);
        }
        let waitlist = self.notifier.map(|notifier| {
            let waitlist = Arc::new(RestockWaitlist::new(notifier));
            dispatcher.register(waitlist.clone());
            waitlist
        });

        let alerts = Arc::new(AlertingEngine::new(Some(dispatcher)));
        alerts.prime(&store.snapshot()?);

        let adjustments = Arc::new(AdjustmentService::new(
            Arc::clone(&store),
            Arc::clone(&alerts),
            RetryPolicy::from(&self.settings),
        ));
        let sales = SaleRecorder::new(Arc::clone(&adjustments));

        Ok(Ledger {
            store,
            alerts,
            adjustments,
            sales,
            waitlist,
            catalog: self.catalog,
            settings: self.settings,
        })
    }
}

/// Inventory ledger bound to one store
pub struct Ledger {
    store: Arc<dyn LedgerStore>,
    alerts: Arc<AlertingEngine>,
    adjustments: Arc<AdjustmentService>,
    sales: SaleRecorder,
    waitlist: Option<Arc<RestockWaitlist>>,
    catalog: Arc<dyn PriceCatalog>,
    settings: LedgerSettings,
}

impl Ledger {
    pub fn builder(settings: LedgerSettings) -> LedgerBuilder {
        LedgerBuilder::new(settings)
    }

    /// Ledger over a fresh [`MemoryStore`]
    pub fn in_memory(settings: LedgerSettings) -> Result<Self, LedgerError> {
        LedgerBuilder::new(settings).build(Arc::new(MemoryStore::new()))
    }

    /// Ledger over PostgreSQL, migrating the schema first
    pub fn connect(config: &StockLedgerConfig) -> Result<Self, LedgerError> {
        let store = PgStore::connect(&config.database, config.ledger.store_id.clone())?;
        log::info!("ledger for store '{}' connected", config.ledger.store_id);
        LedgerBuilder::new(config.ledger.clone()).build(Arc::new(store))
    }

    pub fn settings(&self) -> &LedgerSettings {
        &self.settings
    }

    /// Backend handle
    ///
    /// Its only write path for quantities is [`LedgerStore::commit`], which
    /// rejects movements that do not continue the stored chain. Commits made
    /// here skip alert classification.
    pub fn store(&self) -> &Arc<dyn LedgerStore> {
        &self.store
    }

    pub fn adjustments(&self) -> &Arc<AdjustmentService> {
        &self.adjustments
    }

    // Projection

    /// Bring a product under tracking
    ///
    /// `low_stock_threshold` defaults to the configured threshold.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` for tracked products, `Validation` for negative inputs.
    pub fn initialize(
        &self,
        product_id: impl Into<ProductId>,
        starting_qty: i64,
        low_stock_threshold: Option<i64>,
        actor: Option<&str>,
    ) -> Result<ProductStockRecord, LedgerError> {
        let request = OpenStock {
            product_id: product_id.into(),
            starting_qty,
            low_stock_threshold: low_stock_threshold
                .unwrap_or(self.settings.default_low_stock_threshold),
            actor: crate::model::normalize_text(actor),
        };
        let record = self.store.initialize(&request)?;
        log::info!(
            "tracking {} with {} on hand (threshold {})",
            record.product_id,
            record.quantity_on_hand,
            record.low_stock_threshold
        );
        self.alerts.observe(&record);
        Ok(record)
    }

    pub fn get_current(&self, product_id: &ProductId) -> Result<ProductStockRecord, LedgerError> {
        self.store.get_current(product_id)
    }

    pub fn set_low_stock_threshold(
        &self,
        product_id: &ProductId,
        threshold: i64,
    ) -> Result<ProductStockRecord, LedgerError> {
        let record = self.store.set_low_stock_threshold(product_id, threshold)?;
        self.alerts.observe(&record);
        Ok(record)
    }

    /// Every tracked product, ordered by product id
    pub fn snapshot(&self) -> Result<Vec<ProductStockRecord>, LedgerError> {
        self.store.snapshot()
    }

    pub fn stock_level(&self, product_id: &ProductId) -> Result<StockLevel, LedgerError> {
        Ok(StockLevel::classify(&self.store.get_current(product_id)?))
    }

    // Writes

    pub fn adjust(&self, request: AdjustRequest) -> Result<AdjustOutcome, LedgerError> {
        self.adjustments.adjust(request)
    }

    pub fn set_quantity(
        &self,
        product_id: &ProductId,
        target: i64,
        reason: &str,
        actor: &str,
    ) -> Result<AdjustOutcome, LedgerError> {
        self.adjustments.set_quantity(product_id, target, reason, actor)
    }

    pub fn commit_sale(&self, order_ref: &str, lines: &[SaleLine]) -> Result<SaleReceipt, SaleError> {
        self.sales.commit_sale(order_ref, lines)
    }

    // History

    /// Newest-first page of one product's movements
    ///
    /// `limit` defaults to and is clamped by the configured page sizes;
    /// `cursor` is the `next_cursor` of the previous page.
    pub fn list_by_product(
        &self,
        product_id: &ProductId,
        limit: Option<usize>,
        cursor: Option<&str>,
    ) -> Result<MovementPage, LedgerError> {
        let limit = self.settings.page_size(limit);
        let page = match cursor {
            Some(cursor) => PageRequest::after(limit, cursor.parse::<Cursor>()?),
            None => PageRequest::first(limit),
        };
        self.store.list_by_product(product_id, &page)
    }

    pub fn list_recent(
        &self,
        limit: Option<usize>,
        filter: &MovementFilter,
    ) -> Result<Vec<MovementRecord>, LedgerError> {
        self.store
            .list_recent(self.settings.page_size(limit), filter)
    }

    pub fn replay(&self, product_id: &ProductId) -> Result<Vec<MovementRecord>, LedgerError> {
        self.store.replay(product_id)
    }

    // Audit

    /// Replay one product's log against its projection; never corrects anything
    pub fn reconcile(&self, product_id: &ProductId) -> Result<ReconciliationReport, LedgerError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::reconcile_span(product_id.as_str()).entered();

        let (record, history) = self.store.audit_view(product_id)?;
        let report = reconcile(&record, &history);
        if !report.is_clean() {
            log::warn!(
                "reconciliation of {} found {} discrepancy(ies): {:?}",
                product_id,
                report.discrepancies.len(),
                report.discrepancies
            );
        }
        Ok(report)
    }

    /// Reconcile every tracked product, in product id order
    pub fn reconcile_all(&self) -> Result<Vec<ReconciliationReport>, LedgerError> {
        let reports = self
            .store
            .snapshot()?
            .iter()
            .map(|record| self.reconcile(&record.product_id))
            .collect::<Result<Vec<_>, _>>()?;
        let dirty = reports.iter().filter(|r| !r.is_clean()).count();
        log::info!(
            "reconciled {} product(s), {} with discrepancies",
            reports.len(),
            dirty
        );
        Ok(reports)
    }

    // Reporting

    /// Products with `0 < quantity <= threshold`, lowest quantity first
    ///
    /// `threshold` overrides each product's own threshold.
    pub fn low_stock(&self, threshold: Option<i64>) -> Result<Vec<ProductStockRecord>, LedgerError> {
        if let Some(threshold) = threshold {
            if threshold < 0 {
                return Err(LedgerError::validation(format!(
                    "low stock threshold must not be negative, got {threshold}"
                )));
            }
        }
        Ok(low_stock(&self.store.snapshot()?, threshold))
    }

    pub fn out_of_stock(&self) -> Result<Vec<ProductStockRecord>, LedgerError> {
        Ok(out_of_stock(&self.store.snapshot()?))
    }

    pub fn summary(&self) -> Result<InventorySummary, LedgerError> {
        Ok(summarize(&self.store.snapshot()?, self.catalog.as_ref()))
    }

    pub fn export_stock_csv<W: Write>(&self, writer: W, low_stock_only: bool) -> Result<usize, ExportError> {
        let records = self.store.snapshot()?;
        write_stock_csv(writer, &records, low_stock_only, self.catalog.as_ref())
    }

    /// Export history oldest first, for one product or for all in product id order
    pub fn export_movements_csv<W: Write>(
        &self,
        writer: W,
        product_id: Option<&ProductId>,
    ) -> Result<usize, ExportError> {
        let movements = match product_id {
            Some(product_id) => self.store.replay(product_id)?,
            None => {
                let mut all = Vec::new();
                for record in self.store.snapshot()? {
                    all.extend(self.store.replay(&record.product_id)?);
                }
                all
            }
        };
        write_movements_csv(writer, &movements)
    }

    // Alerts and the waitlist

    /// Register another sink for stock transitions
    pub fn register_sink(&self, sink: Arc<dyn AlertSink>) {
        if let Some(dispatcher) = self.alerts.dispatcher() {
            dispatcher.register(sink);
        }
    }

    /// Block until queued alerts have been delivered
    pub fn flush_alerts(&self, timeout: Duration) -> bool {
        self.alerts
            .dispatcher()
            .map_or(true, |dispatcher| dispatcher.flush(timeout))
    }

    pub fn waitlist(&self) -> Option<&RestockWaitlist> {
        self.waitlist.as_deref()
    }

    fn require_waitlist(&self) -> Result<&RestockWaitlist, LedgerError> {
        self.waitlist()
            .ok_or_else(|| LedgerError::validation("restock notifications are not enabled"))
    }

    /// Ask to be told when an out-of-stock product is replenished
    pub fn subscribe_restock(&self, product_id: &ProductId, contact: &str) -> Result<Subscription, LedgerError> {
        let waitlist = self.require_waitlist()?;
        waitlist.subscribe_with(product_id, contact, || self.store.get_current(product_id))
    }

    pub fn unsubscribe_restock(&self, product_id: &ProductId, contact: &str) -> Result<bool, LedgerError> {
        Ok(self.require_waitlist()?.unsubscribe(product_id, contact))
    }

    pub fn is_subscribed(&self, product_id: &ProductId, contact: &str) -> Result<bool, LedgerError> {
        Ok(self.require_waitlist()?.is_subscribed(product_id, contact))
    }

    pub fn waiting_counts(&self) -> Result<BTreeMap<ProductId, usize>, LedgerError> {
        Ok(self.require_waitlist()?.waiting_counts())
    }

    /// Prometheus text exposition of the ledger metrics
    #[cfg(feature = "metrics")]
    pub fn metrics_text(&self) -> String {
        crate::metrics::METRICS.render()
    }
}
