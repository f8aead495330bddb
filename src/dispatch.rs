//! Asynchronous alert fan-out.
//!
//! Stock transitions are queued on a bounded crossbeam channel and delivered
//! to every registered [`AlertSink`] by one background worker, so a slow sink
//! never delays an adjustment. When the queue is full the alert is dropped
//! and counted; the ledger itself is unaffected.

use crate::alerting::StockTransition;
use crate::error::LedgerError;
use crossbeam_channel::{bounded, Sender, TrySendError};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

#[cfg(feature = "metrics")]
use crate::metrics::METRICS;

/// Receiver of stock transitions (notification service, webhook, ...)
pub trait AlertSink: Send + Sync {
    /// Label used in logs
    fn name(&self) -> &str {
        "alert-sink"
    }

    fn deliver(&self, transition: &StockTransition);
}

enum Command {
    Deliver(StockTransition),
    Flush(Sender<()>),
}

type Sinks = Arc<RwLock<Vec<Arc<dyn AlertSink>>>>;

/// Bounded queue plus worker thread delivering transitions to sinks
pub struct AlertDispatcher {
    tx: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    sinks: Sinks,
    dropped: AtomicU64,
}

impl AlertDispatcher {
    /// Start the worker with a queue of `capacity` pending alerts
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::Storage` if the worker thread cannot be spawned.
    pub fn start(capacity: usize) -> Result<Self, LedgerError> {
        let (tx, rx) = bounded::<Command>(capacity.max(1));
        let sinks: Sinks = Arc::new(RwLock::new(Vec::new()));
        let worker_sinks = Arc::clone(&sinks);

        let worker = std::thread::Builder::new()
            .name("stockledger-alerts".into())
            .spawn(move || {
                while let Ok(command) = rx.recv() {
                    match command {
                        Command::Deliver(transition) => deliver_all(&worker_sinks, &transition),
                        Command::Flush(ack) => {
                            let _ = ack.send(());
                        }
                    }
                }
            })
            .map_err(|e| LedgerError::Storage(format!("failed to start alert worker: {e}")))?;

        Ok(Self {
            tx: Some(tx),
            worker: Some(worker),
            sinks,
            dropped: AtomicU64::new(0),
        })
    }

    /// Add a sink; it receives every transition queued from now on
    pub fn register(&self, sink: Arc<dyn AlertSink>) {
        match self.sinks.write() {
            Ok(mut sinks) => sinks.push(sink),
            Err(poisoned) => poisoned.into_inner().push(sink),
        }
    }

    /// Queue a transition without blocking; returns `false` if it was dropped
    pub fn dispatch(&self, transition: StockTransition) -> bool {
        let Some(tx) = &self.tx else {
            return false;
        };
        match tx.try_send(Command::Deliver(transition)) {
            Ok(()) => {
                #[cfg(feature = "metrics")]
                METRICS.record_alert("queued");
                true
            }
            Err(TrySendError::Full(Command::Deliver(transition))) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "metrics")]
                METRICS.record_alert("dropped");
                log::warn!(
                    "alert queue full, dropping {:?} -> {:?} for {}",
                    transition.from,
                    transition.to,
                    transition.product_id
                );
                false
            }
            Err(_) => {
                log::warn!("alert worker has stopped; transition not delivered");
                false
            }
        }
    }

    /// Wait until every transition queued before this call has been delivered
    pub fn flush(&self, timeout: Duration) -> bool {
        let Some(tx) = &self.tx else {
            return true;
        };
        let (ack_tx, ack_rx) = bounded(1);
        if tx.send_timeout(Command::Flush(ack_tx), timeout).is_err() {
            return false;
        }
        ack_rx.recv_timeout(timeout).is_ok()
    }

    /// Alerts dropped because the queue was full
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn deliver_all(sinks: &Sinks, transition: &StockTransition) {
    let sinks: Vec<Arc<dyn AlertSink>> = match sinks.read() {
        Ok(sinks) => sinks.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    };
    for sink in sinks {
        let outcome = catch_unwind(AssertUnwindSafe(|| sink.deliver(transition)));
        if outcome.is_err() {
            log::warn!(
                "alert sink '{}' panicked on transition for {}",
                sink.name(),
                transition.product_id
            );
        }
    }
    #[cfg(feature = "metrics")]
    METRICS.record_alert("delivered");
}

impl Drop for AlertDispatcher {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop after it drains the queue.
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("alert worker exited abnormally");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::StockLevel;
    use crate::model::ProductId;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<StockTransition>>,
    }

    impl AlertSink for Recorder {
        fn deliver(&self, transition: &StockTransition) {
            self.seen.lock().unwrap().push(transition.clone());
        }
    }

    struct Gate {
        open: Mutex<bool>,
        cond: std::sync::Condvar,
    }

    impl AlertSink for Gate {
        fn deliver(&self, _transition: &StockTransition) {
            let mut open = self.open.lock().unwrap();
            while !*open {
                open = self.cond.wait(open).unwrap();
            }
        }
    }

    fn transition(product: &str, version: i64) -> StockTransition {
        StockTransition {
            product_id: ProductId::from(product),
            from: Some(StockLevel::InStock),
            to: StockLevel::Low,
            quantity_on_hand: 1,
            low_stock_threshold: 5,
            version,
        }
    }

    #[test]
    fn test_dispatcher_delivers_in_order() {
        let dispatcher = AlertDispatcher::start(16).unwrap();
        let recorder = Arc::new(Recorder::default());
        dispatcher.register(recorder.clone());

        for v in 1..=3 {
            assert!(dispatcher.dispatch(transition("p", v)));
        }
        assert!(dispatcher.flush(Duration::from_secs(5)));

        let versions: Vec<i64> = recorder.seen.lock().unwrap().iter().map(|t| t.version).collect();
        assert_eq!(versions, vec![1, 2, 3]);
    }

    #[test]
    fn test_full_queue_drops_instead_of_blocking() {
        let dispatcher = AlertDispatcher::start(1).unwrap();
        let gate = Arc::new(Gate {
            open: Mutex::new(false),
            cond: std::sync::Condvar::new(),
        });
        dispatcher.register(gate.clone());

        // The worker takes the first alert and blocks in the sink, the second
        // fills the queue, and from then on alerts are dropped.
        assert!(dispatcher.dispatch(transition("p", 1)));
        let mut accepted = 0;
        for v in 2..=10 {
            if dispatcher.dispatch(transition("p", v)) {
                accepted += 1;
            }
        }
        assert!(accepted <= 2);
        assert!(dispatcher.dropped_count() >= 7);

        *gate.open.lock().unwrap() = true;
        gate.cond.notify_all();
        assert!(dispatcher.flush(Duration::from_secs(5)));
    }

    #[test]
    fn test_panicking_sink_does_not_stop_worker() {
        struct Panics;
        impl AlertSink for Panics {
            fn deliver(&self, _transition: &StockTransition) {
                panic!("sink failure");
            }
        }

        let dispatcher = AlertDispatcher::start(4).unwrap();
        let recorder = Arc::new(Recorder::default());
        dispatcher.register(Arc::new(Panics));
        dispatcher.register(recorder.clone());

        dispatcher.dispatch(transition("p", 1));
        dispatcher.dispatch(transition("p", 2));
        assert!(dispatcher.flush(Duration::from_secs(5)));
        assert_eq!(recorder.seen.lock().unwrap().len(), 2);
    }
}
