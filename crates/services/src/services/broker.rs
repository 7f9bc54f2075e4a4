//! In-process fan-out of persisted run events to live subscribers.
//!
//! One broker per active run. The execution engine publishes every event
//! *after* it is durably appended to the log, so subscriber delivery order
//! always equals persistence order equals `seq` order.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use dashmap::DashMap;
use db::models::run_event::RunEvent;
use tokio::sync::broadcast;
use uuid::Uuid;

pub struct RunBroker {
    tx: broadcast::Sender<Arc<RunEvent>>,
    finished: AtomicBool,
    created_at: Instant,
}

impl RunBroker {
    fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            finished: AtomicBool::new(false),
            created_at: Instant::now(),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<RunEvent>> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: Arc<RunEvent>) {
        // A send error only means there are no live subscribers right now;
        // reconnecting clients replay from the event log.
        let _ = self.tx.send(event);
    }

    pub fn mark_finished(&self) {
        self.finished.store(true, Ordering::SeqCst);
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

pub struct BrokerManager {
    brokers: DashMap<Uuid, Arc<RunBroker>>,
    capacity: usize,
}

impl BrokerManager {
    pub fn new(capacity: usize) -> Self {
        Self {
            brokers: DashMap::new(),
            capacity,
        }
    }

    pub fn get_or_create(&self, run_id: Uuid) -> Arc<RunBroker> {
        self.brokers
            .entry(run_id)
            .or_insert_with(|| Arc::new(RunBroker::new(self.capacity)))
            .clone()
    }

    pub fn get(&self, run_id: Uuid) -> Option<Arc<RunBroker>> {
        self.brokers.get(&run_id).map(|b| b.clone())
    }

    pub fn mark_finished(&self, run_id: Uuid) {
        if let Some(broker) = self.brokers.get(&run_id) {
            broker.mark_finished();
        }
    }

    pub fn remove(&self, run_id: Uuid) {
        self.brokers.remove(&run_id);
    }

    /// Drop finished brokers older than `max_age`. Called by the retention
    /// sweep; late subscribers fall back to log replay.
    pub fn sweep_finished(&self, max_age: Duration) -> usize {
        let stale: Vec<Uuid> = self
            .brokers
            .iter()
            .filter(|entry| entry.is_finished() && entry.age() > max_age)
            .map(|entry| *entry.key())
            .collect();

        for run_id in &stale {
            self.brokers.remove(run_id);
            tracing::debug!("removed stale broker for run {run_id}");
        }
        stale.len()
    }

    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }
}
