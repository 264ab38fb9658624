//! Connection context: one session, its file sender and the event queue the
//! app drains.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{info, warn};
use shared::Transport;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::events::Event;
use crate::session::Session;
use crate::transfer::{Book, FileSender, TransferOutcome};

/// Events kept for the app before the oldest are dropped
const EVENT_QUEUE_LIMIT: usize = 256;

type EventQueue = Arc<Mutex<VecDeque<Event>>>;

/// Everything one band connection needs, owned in one place
pub struct ConnectionContext<T: Transport> {
    config: SyncConfig,
    session: Session<T>,
    sender: FileSender<T>,
    queue: EventQueue,
}

impl<T: Transport> ConnectionContext<T> {
    /// Build the session and sender over `transport` and wire their events into the queue
    pub fn new(transport: Arc<T>, config: SyncConfig) -> Self {
        let session = Session::new(transport, config.handshake_timeout());
        let sender = FileSender::new(session.clone(), config.clone());
        let queue: EventQueue = Arc::new(Mutex::new(VecDeque::new()));

        let sink = queue.clone();
        session.on_event(move |e| push(&sink, Event::Session(e.clone())));
        let sink = queue.clone();
        sender.on_event(move |e| push(&sink, Event::Transfer(e.clone())));

        Self {
            config,
            session,
            sender,
            queue,
        }
    }

    /// Bring the link up and complete the handshake
    pub async fn connect(&self) -> Result<()> {
        self.session.init().await?;
        self.session.handshake().await
    }

    /// Drop the link, cancelling any transfer in flight
    pub async fn disconnect(&self) {
        if !self.sender.cancel().await {
            self.session.teardown().await;
        }
    }

    /// Push one book; see [`FileSender::send_file`]
    pub async fn push_book(&self, book: Book) -> Result<TransferOutcome> {
        self.sender.send_file(book).await
    }

    /// Cancel the transfer in flight, if any
    pub async fn cancel(&self) -> bool {
        self.sender.cancel().await
    }

    /// Whether a transfer is running
    pub fn is_busy(&self) -> bool {
        self.sender.is_busy()
    }

    /// Whether the handshake has completed
    pub fn is_connected(&self) -> bool {
        self.session.is_connected()
    }

    /// Oldest queued event, if any
    pub fn poll_event(&self) -> Option<Event> {
        lock(&self.queue).pop_front()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    /// Underlying link, used by the bridge to deliver inbound events
    pub fn transport(&self) -> &Arc<T> {
        self.session.transport()
    }
}

fn lock(queue: &EventQueue) -> MutexGuard<'_, VecDeque<Event>> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

fn push(queue: &EventQueue, event: Event) {
    let mut queue = lock(queue);
    if queue.len() >= EVENT_QUEUE_LIMIT {
        warn!("Event queue full, dropping the oldest event");
        queue.pop_front();
    }
    if let Event::Session(e) = &event {
        info!("Session event: {:?}", e);
    }
    queue.push_back(event);
}
