//! Back-in-stock waitlist.
//!
//! Customers subscribe to an out-of-stock product with a contact address.
//! The waitlist is an [`AlertSink`]: when a product goes from out of stock
//! to having stock, every pending subscriber is handed to the
//! [`RestockNotifier`]; subscriptions whose delivery succeeded are marked
//! notified, failed ones stay pending for the next restock.

use crate::alerting::StockTransition;
use crate::dispatch::AlertSink;
use crate::error::LedgerError;
use crate::model::{ProductId, ProductStockRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use may::sync::{Mutex, MutexGuard};
use std::sync::Arc;

/// Delivers back-in-stock messages (email, push, ...)
pub trait RestockNotifier: Send + Sync {
    /// # Errors
    ///
    /// Returns a description of the delivery failure; the subscription
    /// stays pending.
    fn notify(&self, contact: &str, transition: &StockTransition) -> Result<(), String>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub product_id: ProductId,
    pub contact: String,
    pub subscribed_at: DateTime<Utc>,
    /// Set once a restock message was delivered
    pub notified_at: Option<DateTime<Utc>>,
}

impl Subscription {
    pub fn is_pending(&self) -> bool {
        self.notified_at.is_none()
    }
}

/// Subscriptions keyed by product, then by normalized contact
pub struct RestockWaitlist {
    /// Coroutine-aware; held across the store read in `subscribe_with`
    entries: Mutex<BTreeMap<ProductId, BTreeMap<String, Subscription>>>,
    notifier: Arc<dyn RestockNotifier>,
}

fn normalize_contact(contact: &str) -> Result<String, LedgerError> {
    let contact = contact.trim().to_lowercase();
    if contact.is_empty() {
        return Err(LedgerError::validation("contact must not be empty"));
    }
    Ok(contact)
}

impl RestockWaitlist {
    pub fn new(notifier: Arc<dyn RestockNotifier>) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            notifier,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ProductId, BTreeMap<String, Subscription>>> {
        match self.entries.lock() {
            Ok(entries) => entries,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Subscribe `contact` to the product described by `current`
    ///
    /// A contact that was already notified is re-armed.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Validation` if the product has stock, the
    /// contact is blank, or a pending subscription already exists.
    pub fn subscribe(
        &self,
        current: &ProductStockRecord,
        contact: &str,
    ) -> Result<Subscription, LedgerError> {
        self.subscribe_with(&current.product_id, contact, || Ok(current.clone()))
    }

    /// Subscribe `contact`, reading the product's state with `read_current`
    /// while the waitlist is locked
    ///
    /// A restock notice takes the same lock, so a restock committed after the
    /// read always finds the new subscriber.
    ///
    /// # Errors
    ///
    /// Same as [`RestockWaitlist::subscribe`], plus whatever `read_current`
    /// returns.
    pub fn subscribe_with<F>(
        &self,
        product_id: &ProductId,
        contact: &str,
        read_current: F,
    ) -> Result<Subscription, LedgerError>
    where
        F: FnOnce() -> Result<ProductStockRecord, LedgerError>,
    {
        let contact = normalize_contact(contact)?;

        let mut entries = self.lock();
        let current = read_current()?;
        if current.product_id != *product_id {
            return Err(LedgerError::validation(format!(
                "read {} while subscribing to {product_id}",
                current.product_id
            )));
        }
        if !current.is_out_of_stock() {
            return Err(LedgerError::validation(format!(
                "{product_id} is in stock ({} on hand)",
                current.quantity_on_hand
            )));
        }

        let product = entries.entry(product_id.clone()).or_default();
        if let Some(existing) = product.get_mut(&contact) {
            if existing.is_pending() {
                return Err(LedgerError::validation(format!(
                    "{contact} is already waiting for {product_id}"
                )));
            }
            existing.notified_at = None;
            existing.subscribed_at = Utc::now();
            log::info!("re-subscribed {contact} to {product_id}");
            return Ok(existing.clone());
        }

        let subscription = Subscription {
            product_id: product_id.clone(),
            contact: contact.clone(),
            subscribed_at: Utc::now(),
            notified_at: None,
        };
        product.insert(contact.clone(), subscription.clone());
        log::info!("subscribed {contact} to restock of {product_id}");
        Ok(subscription)
    }

    /// Remove a subscription; `false` if there was none
    pub fn unsubscribe(&self, product_id: &ProductId, contact: &str) -> bool {
        let Ok(contact) = normalize_contact(contact) else {
            return false;
        };
        let mut entries = self.lock();
        let Some(product) = entries.get_mut(product_id) else {
            return false;
        };
        let removed = product.remove(&contact).is_some();
        if product.is_empty() {
            entries.remove(product_id);
        }
        removed
    }

    /// Whether `contact` is still waiting (subscribed and not yet notified)
    pub fn is_subscribed(&self, product_id: &ProductId, contact: &str) -> bool {
        let Ok(contact) = normalize_contact(contact) else {
            return false;
        };
        self.lock()
            .get(product_id)
            .and_then(|p| p.get(&contact))
            .is_some_and(Subscription::is_pending)
    }

    /// Pending subscribers per product; products with none are omitted
    pub fn waiting_counts(&self) -> BTreeMap<ProductId, usize> {
        self.lock()
            .iter()
            .map(|(product_id, subs)| (product_id.clone(), subs.values().filter(|s| s.is_pending()).count()))
            .filter(|(_, count)| *count > 0)
            .collect()
    }

    /// Subscriptions, optionally narrowed to one product and/or notification state
    pub fn subscriptions(&self, product_id: Option<&ProductId>, notified: Option<bool>) -> Vec<Subscription> {
        self.lock()
            .iter()
            .filter(|(p, _)| product_id.map_or(true, |wanted| *p == wanted))
            .flat_map(|(_, subs)| subs.values())
            .filter(|s| notified.map_or(true, |n| n != s.is_pending()))
            .cloned()
            .collect()
    }

    /// Notify pending subscribers of a restocked product; returns how many were reached
    pub fn notify_restock(&self, transition: &StockTransition) -> usize {
        let pending: Vec<String> = match self.lock().get(&transition.product_id) {
            Some(subs) => subs
                .values()
                .filter(|s| s.is_pending())
                .map(|s| s.contact.clone())
                .collect(),
            None => return 0,
        };

        // Delivery happens outside the lock; subscribe/unsubscribe stay responsive.
        let mut delivered = Vec::new();
        for contact in pending {
            match self.notifier.notify(&contact, transition) {
                Ok(()) => delivered.push(contact),
                Err(e) => log::warn!(
                    "restock notice for {} to {contact} failed: {e}",
                    transition.product_id
                ),
            }
        }

        let now = Utc::now();
        let mut entries = self.lock();
        if let Some(subs) = entries.get_mut(&transition.product_id) {
            for contact in &delivered {
                if let Some(sub) = subs.get_mut(contact) {
                    sub.notified_at = Some(now);
                }
            }
        }
        log::info!(
            "sent {} back-in-stock notice(s) for {}",
            delivered.len(),
            transition.product_id
        );
        delivered.len()
    }
}

impl AlertSink for RestockWaitlist {
    fn name(&self) -> &str {
        "restock-waitlist"
    }

    fn deliver(&self, transition: &StockTransition) {
        if transition.is_restock() {
            self.notify_restock(transition);
        }
    }
}
