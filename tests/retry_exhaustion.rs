//! A backend that loses every race: adjustments give up after the configured
//! number of attempts and leave no trace.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use stockledger::{
    AdjustRequest, Committed, Ledger, LedgerError, LedgerSettings, LedgerStore, MemoryStore,
    MovementFilter, MovementLog, MovementPage, MovementRecord, MovementType, NewMovement, OpenStock,
    PageRequest, ProductId, ProductStockRecord, QuantityProjector,
};

/// Delegates to a `MemoryStore` but reports a concurrent writer on every commit
struct AlwaysRaced {
    inner: MemoryStore,
    commits: AtomicU32,
}

impl AlwaysRaced {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            commits: AtomicU32::new(0),
        }
    }
}

impl MovementLog for AlwaysRaced {
    fn list_by_product(
        &self,
        product_id: &ProductId,
        page: &PageRequest,
    ) -> Result<MovementPage, LedgerError> {
        self.inner.list_by_product(product_id, page)
    }

    fn list_recent(
        &self,
        limit: usize,
        filter: &MovementFilter,
    ) -> Result<Vec<MovementRecord>, LedgerError> {
        self.inner.list_recent(limit, filter)
    }

    fn replay(&self, product_id: &ProductId) -> Result<Vec<MovementRecord>, LedgerError> {
        self.inner.replay(product_id)
    }
}

impl QuantityProjector for AlwaysRaced {
    fn get_current(&self, product_id: &ProductId) -> Result<ProductStockRecord, LedgerError> {
        self.inner.get_current(product_id)
    }

    fn initialize(&self, request: &OpenStock) -> Result<ProductStockRecord, LedgerError> {
        self.inner.initialize(request)
    }

    fn set_low_stock_threshold(
        &self,
        product_id: &ProductId,
        threshold: i64,
    ) -> Result<ProductStockRecord, LedgerError> {
        self.inner.set_low_stock_threshold(product_id, threshold)
    }

    fn snapshot(&self) -> Result<Vec<ProductStockRecord>, LedgerError> {
        self.inner.snapshot()
    }
}

impl LedgerStore for AlwaysRaced {
    fn commit(
        &self,
        movement: NewMovement,
        expected_version: i64,
    ) -> Result<Committed, LedgerError> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Err(LedgerError::ConcurrentModification {
            product_id: movement.product_id,
            expected_version,
            actual_version: expected_version + 1,
        })
    }

    fn audit_view(
        &self,
        product_id: &ProductId,
    ) -> Result<(ProductStockRecord, Vec<MovementRecord>), LedgerError> {
        self.inner.audit_view(product_id)
    }
}

fn raced_ledger(max_adjust_attempts: u32) -> (Ledger, Arc<AlwaysRaced>) {
    let store = Arc::new(AlwaysRaced::new());
    let settings = LedgerSettings {
        max_adjust_attempts,
        retry_backoff_ms: 0,
        ..LedgerSettings::default()
    };
    let ledger = Ledger::builder(settings).build(store.clone()).unwrap();
    ledger.initialize("p", 10, Some(3), Some("operator:1")).unwrap();
    (ledger, store)
}

#[test]
fn test_exhausted_retries_surface_conflict() {
    let (ledger, store) = raced_ledger(3);
    let p = ProductId::from("p");

    let err = ledger
        .adjust(AdjustRequest::new(p.clone(), MovementType::StockOut, 2).actor("operator:1"))
        .unwrap_err();
    match err {
        LedgerError::Conflict {
            product_id,
            attempts,
        } => {
            assert_eq!(product_id, p);
            assert_eq!(attempts, 3);
        }
        other => panic!("expected a conflict, got {other:?}"),
    }
    assert_eq!(store.commits.load(Ordering::SeqCst), 3);

    let current = ledger.get_current(&p).unwrap();
    assert_eq!((current.quantity_on_hand, current.version), (10, 1));
    assert_eq!(ledger.replay(&p).unwrap().len(), 1);
    assert!(ledger.reconcile(&p).unwrap().is_clean());
}

#[test]
fn test_set_quantity_conflict_uses_same_budget() {
    let (ledger, store) = raced_ledger(2);
    let p = ProductId::from("p");

    let err = ledger
        .set_quantity(&p, 4, "cycle count", "operator:1")
        .unwrap_err();
    assert!(matches!(err, LedgerError::Conflict { attempts: 2, .. }));
    assert_eq!(store.commits.load(Ordering::SeqCst), 2);
    assert_eq!(ledger.get_current(&p).unwrap().quantity_on_hand, 10);
}

#[test]
fn test_reads_are_idempotent() {
    let ledger = Ledger::in_memory(LedgerSettings::default()).unwrap();
    ledger.initialize("a", 2, Some(5), Some("operator:1")).unwrap();
    ledger.initialize("b", 0, Some(5), Some("operator:1")).unwrap();
    ledger.initialize("c", 40, Some(5), Some("operator:1")).unwrap();

    let summary = ledger.summary().unwrap();
    assert_eq!(ledger.summary().unwrap(), summary);

    let low = ledger.low_stock(None).unwrap();
    assert_eq!(ledger.low_stock(None).unwrap(), low);
    assert_eq!(low.len(), 1);

    let out = ledger.out_of_stock().unwrap();
    assert_eq!(ledger.out_of_stock().unwrap(), out);

    for id in ["a", "b", "c"] {
        assert_eq!(ledger.get_current(&ProductId::from(id)).unwrap().version, i64::from(id != "b"));
    }
}
