//! In-process ledger backend.
//!
//! Each product lives in its own slot behind a `Mutex`; the slot holds both
//! the projected record and that product's movements, so a commit updates
//! the pair under one lock and readers never observe half of it. The delta
//! and the append are slot-level steps with no public entry point of their
//! own. Adjustments to different products touch different slots and never
//! contend. Movement ids come from one ledger-wide atomic sequence.

use crate::error::LedgerError;
use crate::model::{MovementRecord, NewMovement, OpenStock, ProductId, ProductStockRecord};
use crate::movement_log::{paginate, MovementFilter, MovementLog, MovementPage, PageRequest};
use crate::projector::QuantityProjector;
use crate::store::{check_commit, Committed, LedgerStore};
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

struct ProductSlot {
    record: ProductStockRecord,
    /// Oldest first
    movements: Vec<MovementRecord>,
}

impl ProductSlot {
    /// Compare-and-set `quantity_on_hand += delta`, `version += 1`
    ///
    /// Only called by [`LedgerStore::commit`] with the slot lock held, right
    /// before the matching movement is appended.
    fn apply_delta(
        &mut self,
        delta: i64,
        expected_version: i64,
    ) -> Result<ProductStockRecord, LedgerError> {
        let record = &mut self.record;
        if record.version != expected_version {
            return Err(LedgerError::ConcurrentModification {
                product_id: record.product_id.clone(),
                expected_version,
                actual_version: record.version,
            });
        }
        let next = record
            .quantity_on_hand
            .checked_add(delta)
            .ok_or_else(|| LedgerError::validation("quantity overflow"))?;
        if next < 0 {
            return Err(LedgerError::InsufficientStock {
                product_id: record.product_id.clone(),
                on_hand: record.quantity_on_hand,
                requested: delta.saturating_neg(),
            });
        }
        record.quantity_on_hand = next;
        record.version += 1;
        Ok(record.clone())
    }
}

/// Ledger backend held entirely in memory
pub struct MemoryStore {
    slots: RwLock<BTreeMap<ProductId, Arc<Mutex<ProductSlot>>>>,
    sequence: AtomicI64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
            sequence: AtomicI64::new(0),
        }
    }

    /// Number of movements across all products
    pub fn movement_count(&self) -> Result<usize, LedgerError> {
        let mut total = 0;
        for slot in self.all_slots()? {
            total += lock(&slot)?.movements.len();
        }
        Ok(total)
    }

    fn next_id(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn slot(&self, product_id: &ProductId) -> Result<Arc<Mutex<ProductSlot>>, LedgerError> {
        let slots = self
            .slots
            .read()
            .map_err(|_| poisoned("product index"))?;
        slots
            .get(product_id)
            .cloned()
            .ok_or_else(|| LedgerError::not_found(product_id))
    }

    fn all_slots(&self) -> Result<Vec<Arc<Mutex<ProductSlot>>>, LedgerError> {
        let slots = self
            .slots
            .read()
            .map_err(|_| poisoned("product index"))?;
        Ok(slots.values().cloned().collect())
    }

    fn append_locked(&self, slot: &mut ProductSlot, movement: NewMovement) -> MovementRecord {
        let record = movement.into_record(self.next_id(), Utc::now());
        slot.movements.push(record.clone());
        record
    }
}

fn poisoned(what: &str) -> LedgerError {
    LedgerError::Storage(format!("{what} lock poisoned"))
}

fn lock(slot: &Mutex<ProductSlot>) -> Result<MutexGuard<'_, ProductSlot>, LedgerError> {
    slot.lock().map_err(|_| poisoned("product slot"))
}

impl MovementLog for MemoryStore {
    fn list_by_product(
        &self,
        product_id: &ProductId,
        page: &PageRequest,
    ) -> Result<MovementPage, LedgerError> {
        let slot = self.slot(product_id)?;
        let guard = lock(&slot)?;
        Ok(paginate(guard.movements.iter().rev(), page))
    }

    fn list_recent(
        &self,
        limit: usize,
        filter: &MovementFilter,
    ) -> Result<Vec<MovementRecord>, LedgerError> {
        let slots = match &filter.product_id {
            Some(product_id) => vec![self.slot(product_id)?],
            None => self.all_slots()?,
        };
        let mut merged = Vec::new();
        for slot in slots {
            let guard = lock(&slot)?;
            merged.extend(
                guard
                    .movements
                    .iter()
                    .rev()
                    .filter(|m| filter.matches(m))
                    .take(limit)
                    .cloned(),
            );
        }
        merged.sort_by(|a, b| b.id.cmp(&a.id));
        merged.truncate(limit);
        Ok(merged)
    }

    fn replay(&self, product_id: &ProductId) -> Result<Vec<MovementRecord>, LedgerError> {
        let slot = self.slot(product_id)?;
        let guard = lock(&slot)?;
        Ok(guard.movements.clone())
    }
}

impl QuantityProjector for MemoryStore {
    fn get_current(&self, product_id: &ProductId) -> Result<ProductStockRecord, LedgerError> {
        let slot = self.slot(product_id)?;
        let guard = lock(&slot)?;
        Ok(guard.record.clone())
    }

    fn initialize(&self, request: &OpenStock) -> Result<ProductStockRecord, LedgerError> {
        request.validate()?;
        let opening = request.opening_movement();
        if let Some(movement) = &opening {
            movement.validate()?;
        }

        let mut slots = self
            .slots
            .write()
            .map_err(|_| poisoned("product index"))?;
        if slots.contains_key(&request.product_id) {
            return Err(LedgerError::AlreadyExists {
                product_id: request.product_id.clone(),
            });
        }

        let mut slot = ProductSlot {
            record: ProductStockRecord::opening(
                request.product_id.clone(),
                request.low_stock_threshold,
            ),
            movements: Vec::new(),
        };
        if let Some(movement) = opening {
            slot.record.quantity_on_hand = movement.new_qty;
            slot.record.version = movement.version;
            self.append_locked(&mut slot, movement);
        }
        let record = slot.record.clone();
        slots.insert(request.product_id.clone(), Arc::new(Mutex::new(slot)));
        Ok(record)
    }

    fn set_low_stock_threshold(
        &self,
        product_id: &ProductId,
        threshold: i64,
    ) -> Result<ProductStockRecord, LedgerError> {
        if threshold < 0 {
            return Err(LedgerError::validation(format!(
                "low stock threshold must not be negative, got {threshold}"
            )));
        }
        let slot = self.slot(product_id)?;
        let mut guard = lock(&slot)?;
        guard.record.low_stock_threshold = threshold;
        Ok(guard.record.clone())
    }

    fn snapshot(&self) -> Result<Vec<ProductStockRecord>, LedgerError> {
        self.all_slots()?
            .iter()
            .map(|slot| lock(slot).map(|guard| guard.record.clone()))
            .collect()
    }
}

impl LedgerStore for MemoryStore {
    fn commit(
        &self,
        movement: NewMovement,
        expected_version: i64,
    ) -> Result<Committed, LedgerError> {
        movement.validate()?;
        let slot = self.slot(&movement.product_id)?;
        let mut guard = lock(&slot)?;
        check_commit(&guard.record, &movement, expected_version)?;

        let state = guard.apply_delta(movement.quantity_delta, expected_version)?;
        let movement = self.append_locked(&mut guard, movement);
        Ok(Committed { movement, state })
    }

    fn audit_view(
        &self,
        product_id: &ProductId,
    ) -> Result<(ProductStockRecord, Vec<MovementRecord>), LedgerError> {
        let slot = self.slot(product_id)?;
        let guard = lock(&slot)?;
        Ok((guard.record.clone(), guard.movements.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::MovementType;
    use crate::projector::reconcile;

    fn open(store: &MemoryStore, id: &str, qty: i64) -> ProductStockRecord {
        store
            .initialize(&OpenStock {
                product_id: ProductId::from(id),
                starting_qty: qty,
                low_stock_threshold: 5,
                actor: Some("operator:1".into()),
            })
            .unwrap()
    }

    #[test]
    fn test_initialize_logs_opening_receipt() {
        let store = MemoryStore::new();
        let record = open(&store, "p", 10);
        assert_eq!(record.quantity_on_hand, 10);
        assert_eq!(record.version, 1);

        let history = store.replay(&ProductId::from("p")).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].movement_type, MovementType::StockIn);
        assert_eq!(history[0].quantity_delta, 10);
    }

    #[test]
    fn test_initialize_twice_fails() {
        let store = MemoryStore::new();
        open(&store, "p", 0);
        let err = store
            .initialize(&OpenStock {
                product_id: ProductId::from("p"),
                starting_qty: 3,
                low_stock_threshold: 5,
                actor: None,
            })
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyExists { .. }));
        assert_eq!(store.get_current(&ProductId::from("p")).unwrap().quantity_on_hand, 0);
    }

    #[test]
    fn test_get_current_unknown_product() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.get_current(&ProductId::from("missing")),
            Err(LedgerError::NotFound { .. })
        ));
    }

    #[test]
    fn test_commit_advances_pair() {
        let store = MemoryStore::new();
        let current = open(&store, "p", 10);
        let planned = NewMovement::against(&current, MovementType::StockOut, -3, None, Some("op".into()));
        let committed = store.commit(planned, current.version).unwrap();
        assert_eq!(committed.state.quantity_on_hand, 7);
        assert_eq!(committed.state.version, 2);
        assert_eq!(committed.movement.previous_qty, 10);
        assert_eq!(committed.movement.new_qty, 7);

        let (record, history) = store.audit_view(&ProductId::from("p")).unwrap();
        assert!(reconcile(&record, &history).is_clean());
    }

    #[test]
    fn test_commit_with_stale_version_changes_nothing() {
        let store = MemoryStore::new();
        let stale = open(&store, "p", 10);
        let first = NewMovement::against(&stale, MovementType::StockIn, 1, None, Some("op".into()));
        store.commit(first, stale.version).unwrap();

        let second = NewMovement::against(&stale, MovementType::StockIn, 1, None, Some("op".into()));
        let err = store.commit(second, stale.version).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::ConcurrentModification {
                expected_version: 1,
                actual_version: 2,
                ..
            }
        ));
        assert_eq!(store.replay(&ProductId::from("p")).unwrap().len(), 2);
        assert_eq!(store.get_current(&ProductId::from("p")).unwrap().quantity_on_hand, 11);
    }

    #[test]
    fn test_slot_apply_delta_checks_version_and_floor() {
        let store = MemoryStore::new();
        open(&store, "p", 2);
        let slot = store.slot(&ProductId::from("p")).unwrap();
        let mut guard = lock(&slot).unwrap();
        assert!(matches!(
            guard.apply_delta(-1, 0),
            Err(LedgerError::ConcurrentModification { .. })
        ));
        assert!(matches!(
            guard.apply_delta(-3, 1),
            Err(LedgerError::InsufficientStock { on_hand: 2, requested: 3, .. })
        ));
        assert!(matches!(
            guard.apply_delta(i64::MIN, 1),
            Err(LedgerError::InsufficientStock { requested: i64::MAX, .. })
        ));
        let record = guard.apply_delta(-2, 1).unwrap();
        assert_eq!(record.quantity_on_hand, 0);
        assert_eq!(record.version, 2);
    }

    #[test]
    fn test_commit_rejects_invalid_movement() {
        let store = MemoryStore::new();
        let current = open(&store, "p", 1);
        let mut planned = NewMovement::against(&current, MovementType::StockIn, 1, None, Some("op".into()));
        planned.new_qty = 5;
        assert!(matches!(
            store.commit(planned, current.version),
            Err(LedgerError::Validation(_))
        ));
        assert_eq!(store.movement_count().unwrap(), 1);
    }

    #[test]
    fn test_min_delta_commit_leaves_slot_usable() {
        let store = MemoryStore::new();
        let p = ProductId::from("p");
        let current = open(&store, "p", 3);
        let hostile = NewMovement {
            product_id: p.clone(),
            movement_type: MovementType::Adjustment,
            quantity_delta: i64::MIN,
            previous_qty: 3,
            new_qty: i64::MIN + 3,
            reason: Some("bad scan".into()),
            actor: Some("op".into()),
            version: current.version + 1,
        };
        assert!(matches!(
            store.commit(hostile, current.version),
            Err(LedgerError::InsufficientStock { requested: i64::MAX, .. })
        ));

        let again = store.get_current(&p).unwrap();
        assert_eq!((again.quantity_on_hand, again.version), (3, 1));
        let planned = NewMovement::against(&again, MovementType::Sale, -1, None, None);
        assert_eq!(store.commit(planned, again.version).unwrap().state.quantity_on_hand, 2);
        let (record, history) = store.audit_view(&p).unwrap();
        assert!(reconcile(&record, &history).is_clean());
    }

    #[test]
    fn test_list_recent_merges_products_newest_first() {
        let store = MemoryStore::new();
        open(&store, "a", 1);
        open(&store, "b", 2);
        open(&store, "c", 0);
        let a = store.get_current(&ProductId::from("a")).unwrap();
        store
            .commit(
                NewMovement::against(&a, MovementType::Sale, -1, None, None),
                a.version,
            )
            .unwrap();

        let recent = store.list_recent(10, &MovementFilter::default()).unwrap();
        let ids: Vec<i64> = recent.iter().map(|m| m.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        let sales = store
            .list_recent(10, &MovementFilter::of_type(MovementType::Sale))
            .unwrap();
        assert_eq!(sales.len(), 1);
        assert_eq!(sales[0].product_id, ProductId::from("a"));

        assert_eq!(store.list_recent(1, &MovementFilter::default()).unwrap().len(), 1);
    }

    #[test]
    fn test_snapshot_is_ordered_by_product() {
        let store = MemoryStore::new();
        open(&store, "b", 1);
        open(&store, "a", 1);
        let ids: Vec<String> = store
            .snapshot()
            .unwrap()
            .into_iter()
            .map(|r| r.product_id.to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }
}
