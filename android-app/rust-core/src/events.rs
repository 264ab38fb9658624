//! Connection and transfer events.
//!
//! Events fan out to any number of subscribers: closures registered with
//! [`EventHub::observe`] run inline, and [`EventHub::subscribe`] hands out a
//! broadcast receiver for async consumers.

use std::sync::{Arc, Mutex, PoisonError};

use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of each broadcast channel before slow receivers start lagging
const CHANNEL_CAPACITY: usize = 64;

/// Why a connected session stopped being connected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DisconnectReason {
    /// Local teardown (transfer finished, cancel, user disconnect)
    Graceful,
    /// Nothing heard from the band within the liveness window
    Timeout,
    /// The vendor link reported the band as gone
    LinkLost,
}

/// Session lifecycle events
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SessionEvent {
    Connected,
    Disconnected { reason: DisconnectReason },
    #[serde(rename_all = "camelCase")]
    VersionIncompatible { current: u32, required: u32 },
    #[serde(rename_all = "camelCase")]
    BandVersionReceived { version: u32 },
}

/// Transfer progress and outcome events
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum TransferEvent {
    #[serde(rename_all = "camelCase")]
    Progress {
        fraction: f64,
        chunk_preview: String,
        status: String,
    },
    #[serde(rename_all = "camelCase")]
    Success { message: String, total_chunks: usize },
    #[serde(rename_all = "camelCase")]
    Error {
        message: String,
        chunk_index: Option<u32>,
    },
    Cancelled { message: String },
}

/// Any event, as queued for the app
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Event {
    Session(SessionEvent),
    Transfer(TransferEvent),
}

type Observer<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Multi-subscriber event fan-out
pub struct EventHub<E> {
    tx: broadcast::Sender<E>,
    observers: Mutex<Vec<Observer<E>>>,
}

impl<E: Clone + Send + 'static> EventHub<E> {
    /// Hub with no subscribers or observers yet
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            tx,
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Receive every event emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<E> {
        self.tx.subscribe()
    }

    /// Run `observer` for every event emitted from now on
    pub fn observe(&self, observer: impl Fn(&E) + Send + Sync + 'static) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    /// Deliver `event` to observers, then to subscribers
    pub fn emit(&self, event: E) {
        // Observers may register more observers, so call them unlocked
        let observers = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for observer in observers {
            observer(&event);
        }
        // No receivers is fine
        let _ = self.tx.send(event);
    }
}

impl<E: Clone + Send + 'static> Default for EventHub<E> {
    fn default() -> Self {
        Self::new()
    }
}
