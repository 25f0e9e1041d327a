//! Progress events and subscriptions
//!
//! Each session gets its own broadcast channel; any number of receivers may
//! attach. Observers registered on the hub see every event of every session
//! synchronously, before broadcast subscribers do.

use crate::session::UpgradeState;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tuo_snapshot::{SessionId, UserId};

/// Progress event delivered to subscribers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Session
    pub session_id: SessionId,
    /// User
    pub user_id: UserId,
    /// State entered
    pub state: UpgradeState,
    /// Human-readable message
    pub message: String,
    /// Progress at this point
    pub progress_percent: u8,
    /// Emission time
    pub at: DateTime<Utc>,
}

/// Synchronous event sink (audit log, metrics bridges)
pub trait ProgressObserver: Send + Sync {
    /// Called once per event, in emission order
    fn on_event(&self, event: &ProgressEvent);
}

/// Fan-out point for progress events
pub struct ProgressHub {
    capacity: usize,
    channels: DashMap<SessionId, broadcast::Sender<ProgressEvent>>,
    observers: RwLock<Vec<Arc<dyn ProgressObserver>>>,
}

impl std::fmt::Debug for ProgressHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressHub")
            .field("capacity", &self.capacity)
            .field("sessions", &self.channels.len())
            .field("observers", &self.observers.read().len())
            .finish()
    }
}

impl ProgressHub {
    /// Create a hub with `capacity` buffered events per session
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: DashMap::new(),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register an observer for all sessions
    pub fn add_observer(&self, observer: Arc<dyn ProgressObserver>) {
        self.observers.write().push(observer);
    }

    /// Open a session channel and return its first receiver
    pub fn open(&self, session_id: SessionId) -> broadcast::Receiver<ProgressEvent> {
        self.channels
            .entry(session_id)
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Attach another receiver to an open session channel
    #[must_use]
    pub fn subscribe(&self, session_id: SessionId) -> Option<broadcast::Receiver<ProgressEvent>> {
        self.channels.get(&session_id).map(|tx| tx.subscribe())
    }

    /// Receiver whose first `recv` reports `Closed`
    #[must_use]
    pub fn closed_receiver(&self) -> broadcast::Receiver<ProgressEvent> {
        broadcast::channel(1).1
    }

    /// Deliver an event to observers, then to subscribers
    pub fn publish(&self, event: ProgressEvent) {
        for observer in self.observers.read().iter() {
            observer.on_event(&event);
        }
        if let Some(tx) = self.channels.get(&event.session_id) {
            // No receivers is fine; the session keeps running unobserved.
            let _ = tx.send(event);
        }
    }

    /// Drop the session channel; receivers drain buffered events then see `Closed`
    pub fn close(&self, session_id: SessionId) {
        self.channels.remove(&session_id);
    }
}
