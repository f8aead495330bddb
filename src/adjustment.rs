//! Adjustment Service: the only write path for stock changes.
//!
//! Every call runs read → plan → compare-and-set commit. When another writer
//! got there first, the service re-reads and plans again, with a short
//! jittered backoff between attempts; no lock is held across attempts.
//! After `max_attempts` lost races it gives up with
//! [`LedgerError::Conflict`], so `ConcurrentModification` never reaches
//! callers.

use crate::alerting::AlertingEngine;
use crate::config::LedgerSettings;
use crate::error::LedgerError;
use crate::model::{normalize_text, MovementRecord, MovementType, NewMovement, ProductId, ProductStockRecord};
use crate::projector::QuantityProjector;
use crate::store::{Committed, LedgerStore};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;
#[cfg(feature = "tracing")]
use crate::metrics::tracing_helpers;

/// A requested stock change, before sign resolution
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdjustRequest {
    pub product_id: ProductId,
    pub movement_type: MovementType,
    /// Positive count for `STOCK_IN`, `STOCK_OUT` and `SALE`; signed for `ADJUSTMENT`
    pub quantity: i64,
    pub reason: Option<String>,
    pub actor: Option<String>,
}

impl AdjustRequest {
    pub fn new(product_id: impl Into<ProductId>, movement_type: MovementType, quantity: i64) -> Self {
        Self {
            product_id: product_id.into(),
            movement_type,
            quantity,
            reason: None,
            actor: None,
        }
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = Some(actor.into());
        self
    }
}

/// Result of a committed adjustment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdjustOutcome {
    pub movement: MovementRecord,
    pub new_state: ProductStockRecord,
}

impl From<Committed> for AdjustOutcome {
    fn from(committed: Committed) -> Self {
        Self {
            movement: committed.movement,
            new_state: committed.state,
        }
    }
}

/// How hard to retry lost compare-and-set races
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&LedgerSettings::default())
    }
}

impl From<&LedgerSettings> for RetryPolicy {
    fn from(settings: &LedgerSettings) -> Self {
        Self {
            max_attempts: settings.max_adjust_attempts.max(1),
            backoff: settings.retry_backoff(),
        }
    }
}

impl RetryPolicy {
    /// Delay before attempt `attempt + 1`: linear in the attempt, plus up to one backoff of jitter
    fn delay(&self, attempt: u32) -> Duration {
        let base = self.backoff.saturating_mul(attempt);
        let jitter_us = u64::try_from(self.backoff.as_micros()).unwrap_or(u64::MAX);
        if jitter_us == 0 {
            return base;
        }
        base + Duration::from_micros(rand::thread_rng().gen_range(0..=jitter_us))
    }
}

/// Turn a requested quantity into the signed delta its movement type implies
///
/// # Errors
///
/// Returns `LedgerError::Validation` for non-positive counts on `STOCK_IN`,
/// `STOCK_OUT` and `SALE`, and for a zero `ADJUSTMENT`.
pub fn resolve_delta(movement_type: MovementType, quantity: i64) -> Result<i64, LedgerError> {
    match movement_type {
        MovementType::Adjustment => {
            if quantity == 0 {
                return Err(LedgerError::validation("adjustment quantity must not be zero"));
            }
            if quantity == i64::MIN {
                return Err(LedgerError::validation(format!(
                    "adjustment quantity {quantity} is out of range"
                )));
            }
            Ok(quantity)
        }
        _ if quantity <= 0 => Err(LedgerError::validation(format!(
            "{movement_type} quantity must be positive, got {quantity}"
        ))),
        MovementType::StockIn => Ok(quantity),
        MovementType::StockOut | MovementType::Sale => Ok(-quantity),
    }
}

/// Applies stock changes to a [`LedgerStore`]
pub struct AdjustmentService {
    store: Arc<dyn LedgerStore>,
    alerts: Arc<AlertingEngine>,
    retry: RetryPolicy,
}

impl AdjustmentService {
    pub fn new(store: Arc<dyn LedgerStore>, alerts: Arc<AlertingEngine>, retry: RetryPolicy) -> Self {
        Self {
            store,
            alerts,
            retry,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Apply one stock change
    ///
    /// # Errors
    ///
    /// - `LedgerError::Validation` for malformed requests (bad count, missing
    ///   reason on `ADJUSTMENT`, missing actor on non-sale movements)
    /// - `LedgerError::NotFound` for untracked products
    /// - `LedgerError::InsufficientStock` when the change would go below zero
    /// - `LedgerError::Conflict` when every attempt lost a concurrent race
    ///
    /// A failed call changes nothing.
    pub fn adjust(&self, request: AdjustRequest) -> Result<AdjustOutcome, LedgerError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::adjust_span(
            request.product_id.as_str(),
            request.movement_type.as_str(),
        )
        .entered();

        let start = Instant::now();
        let movement_type = request.movement_type;
        let result = self.try_adjust(request);
        self.finish(movement_type, start, result)
    }

    fn try_adjust(&self, request: AdjustRequest) -> Result<AdjustOutcome, LedgerError> {
        let delta = resolve_delta(request.movement_type, request.quantity)?;
        let reason = normalize_text(request.reason.as_deref());
        let actor = normalize_text(request.actor.as_deref());

        self.commit_with_retry(&request.product_id, |current| {
            let planned = NewMovement::against(
                current,
                request.movement_type,
                delta,
                reason.clone(),
                actor.clone(),
            );
            Ok(planned)
        })
    }

    /// Record an `ADJUSTMENT` that brings the product to exactly `target`
    ///
    /// The delta is computed against the quantity read on each attempt, so a
    /// concurrent change never makes the final count miss the target.
    ///
    /// # Errors
    ///
    /// Same as [`adjust`](Self::adjust); additionally `Validation` when the
    /// target is negative or already equals the current quantity.
    pub fn set_quantity(
        &self,
        product_id: &ProductId,
        target: i64,
        reason: &str,
        actor: &str,
    ) -> Result<AdjustOutcome, LedgerError> {
        #[cfg(feature = "tracing")]
        let _span = tracing_helpers::adjust_span(product_id.as_str(), "SET_QUANTITY").entered();

        let start = Instant::now();
        let result = self.try_set_quantity(product_id, target, reason, actor);
        self.finish(MovementType::Adjustment, start, result)
    }

    fn try_set_quantity(
        &self,
        product_id: &ProductId,
        target: i64,
        reason: &str,
        actor: &str,
    ) -> Result<AdjustOutcome, LedgerError> {
        if target < 0 {
            return Err(LedgerError::validation(format!(
                "target quantity must not be negative, got {target}"
            )));
        }
        let reason = normalize_text(Some(reason));
        let actor = normalize_text(Some(actor));

        self.commit_with_retry(product_id, |current| {
            let delta = target - current.quantity_on_hand;
            if delta == 0 {
                return Err(LedgerError::validation(format!(
                    "{product_id} already holds {target}; nothing to record"
                )));
            }
            Ok(NewMovement::against(
                current,
                MovementType::Adjustment,
                delta,
                reason.clone(),
                actor.clone(),
            ))
        })
    }

    fn commit_with_retry<F>(&self, product_id: &ProductId, plan: F) -> Result<AdjustOutcome, LedgerError>
    where
        F: Fn(&ProductStockRecord) -> Result<NewMovement, LedgerError>,
    {
        let max_attempts = self.retry.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            let current = self.store.get_current(product_id)?;
            let planned = plan(&current)?;
            match self.store.commit(planned, current.version) {
                Ok(committed) => {
                    self.alerts.observe(&committed.state);
                    return Ok(committed.into());
                }
                Err(LedgerError::ConcurrentModification {
                    expected_version,
                    actual_version,
                    ..
                }) => {
                    #[cfg(feature = "metrics")]
                    METRICS.record_retry();
                    log::debug!(
                        "version race on {product_id} (attempt {attempt}/{max_attempts}, \
                         expected {expected_version}, found {actual_version})"
                    );
                    if attempt < max_attempts {
                        may::coroutine::sleep(self.retry.delay(attempt));
                    }
                }
                Err(e) => return Err(e),
            }
        }

        log::warn!("giving up on {product_id} after {max_attempts} conflicting attempts");
        Err(LedgerError::Conflict {
            product_id: product_id.clone(),
            attempts: max_attempts,
        })
    }

    fn finish(
        &self,
        movement_type: MovementType,
        start: Instant,
        result: Result<AdjustOutcome, LedgerError>,
    ) -> Result<AdjustOutcome, LedgerError> {
        match &result {
            Ok(outcome) => {
                #[cfg(feature = "metrics")]
                METRICS.record_adjustment(movement_type, start.elapsed());
                let movement = &outcome.movement;
                if movement_type == MovementType::Sale {
                    log::info!(
                        "sale of {} x{} recorded ({} -> {})",
                        movement.product_id,
                        -movement.quantity_delta,
                        movement.previous_qty,
                        movement.new_qty
                    );
                } else {
                    log::debug!(
                        "{} on {} recorded ({} -> {}) in {:?}",
                        movement_type,
                        movement.product_id,
                        movement.previous_qty,
                        movement.new_qty,
                        start.elapsed()
                    );
                }
            }
            Err(e) => {
                #[cfg(feature = "metrics")]
                METRICS.record_failure(e.kind());
                log::debug!("{movement_type} rejected: {e}");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OpenStock;
    use crate::store::MemoryStore;

    fn service_with(qty: i64) -> (AdjustmentService, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        store
            .initialize(&OpenStock {
                product_id: ProductId::from("p"),
                starting_qty: qty,
                low_stock_threshold: 5,
                actor: None,
            })
            .unwrap();
        let service = AdjustmentService::new(
            store.clone(),
            Arc::new(AlertingEngine::new(None)),
            RetryPolicy::default(),
        );
        (service, store)
    }

    #[test]
    fn test_resolve_delta() {
        assert_eq!(resolve_delta(MovementType::StockIn, 4).unwrap(), 4);
        assert_eq!(resolve_delta(MovementType::StockOut, 4).unwrap(), -4);
        assert_eq!(resolve_delta(MovementType::Sale, 1).unwrap(), -1);
        assert_eq!(resolve_delta(MovementType::Adjustment, -2).unwrap(), -2);
        assert!(resolve_delta(MovementType::StockIn, 0).is_err());
        assert!(resolve_delta(MovementType::Sale, -1).is_err());
        assert!(resolve_delta(MovementType::Adjustment, 0).is_err());
        assert!(matches!(
            resolve_delta(MovementType::Adjustment, i64::MIN),
            Err(LedgerError::Validation(_))
        ));
        assert_eq!(
            resolve_delta(MovementType::Adjustment, i64::MIN + 1).unwrap(),
            i64::MIN + 1
        );
    }

    #[test]
    fn test_adjust_sale_records_snapshots() {
        let (service, _) = service_with(10);
        let outcome = service
            .adjust(AdjustRequest::new("p", MovementType::Sale, 3))
            .unwrap();
        assert_eq!(outcome.movement.quantity_delta, -3);
        assert_eq!(outcome.movement.previous_qty, 10);
        assert_eq!(outcome.movement.new_qty, 7);
        assert_eq!(outcome.new_state.quantity_on_hand, 7);
        assert_eq!(outcome.new_state.version, 2);
    }

    #[test]
    fn test_stock_out_floor_leaves_no_trace() {
        let (service, store) = service_with(2);
        let err = service
            .adjust(AdjustRequest::new("p", MovementType::StockOut, 3).actor("op"))
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientStock {
                on_hand: 2,
                requested: 3,
                ..
            }
        ));
        assert_eq!(store.movement_count().unwrap(), 1);
        assert_eq!(store.get_current(&ProductId::from("p")).unwrap().version, 1);
    }

    #[test]
    fn test_extreme_quantities_are_rejected_and_product_stays_usable() {
        let (service, store) = service_with(10);
        let err = service
            .adjust(
                AdjustRequest::new("p", MovementType::Adjustment, i64::MIN)
                    .reason("bad scan")
                    .actor("op"),
            )
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let err = service
            .adjust(AdjustRequest::new("p", MovementType::StockIn, i64::MAX).actor("op"))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));

        let current = store.get_current(&ProductId::from("p")).unwrap();
        assert_eq!((current.quantity_on_hand, current.version), (10, 1));
        assert_eq!(store.movement_count().unwrap(), 1);

        let outcome = service
            .adjust(AdjustRequest::new("p", MovementType::StockOut, 4).actor("op"))
            .unwrap();
        assert_eq!(outcome.new_state.quantity_on_hand, 6);
    }

    #[test]
    fn test_adjustment_requires_reason() {
        let (service, _) = service_with(5);
        let err = service
            .adjust(AdjustRequest::new("p", MovementType::Adjustment, -1).actor("op").reason("   "))
            .unwrap_err();
        assert!(matches!(err, LedgerError::Validation(_)));
    }

    #[test]
    fn test_set_quantity_computes_delta() {
        let (service, _) = service_with(12);
        let outcome = service
            .set_quantity(&ProductId::from("p"), 9, "cycle count", "op")
            .unwrap();
        assert_eq!(outcome.movement.movement_type, MovementType::Adjustment);
        assert_eq!(outcome.movement.quantity_delta, -3);
        assert_eq!(outcome.new_state.quantity_on_hand, 9);

        assert!(matches!(
            service.set_quantity(&ProductId::from("p"), 9, "cycle count", "op"),
            Err(LedgerError::Validation(_))
        ));
    }

    #[test]
    fn test_retry_delay_grows_and_stays_bounded() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(2),
        };
        for attempt in 1..=3 {
            let delay = policy.delay(attempt);
            assert!(delay >= Duration::from_millis(2 * attempt as u64));
            assert!(delay <= Duration::from_millis(2 * attempt as u64 + 2));
        }
        let none = RetryPolicy {
            max_attempts: 1,
            backoff: Duration::ZERO,
        };
        assert_eq!(none.delay(1), Duration::ZERO);
    }
}
