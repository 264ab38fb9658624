//! # Chunked File Transfer
//!
//! Pushes one book to the band as a stop-and-wait exchange on the `file` tag:
//!
//! ```text
//! phone                                   band
//!   │── usage ───────────────────────────►│
//!   │◄─────────────────── ready{usage} ───│   storage check only
//!   │        (launch delay)               │
//!   │── start{filename,total,chunkSize} ─►│
//!   │◄──────────── ready{found,length} ───│   resume point
//!   │── data{count:i} ───────────────────►│
//!   │◄──────────────────────── next{i} ───│   or error{i}: resend i
//!   │           ...                       │
//!   │◄───────────── next{last}/success ───│
//! ```
//!
//! At most one transfer runs per [`FileSender`]. The exchange is an explicit
//! state machine ([`ChunkState`]); a rejected chunk is a state transition, not
//! a nested call.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use shared::protocol::FILE_TAG;
use shared::{
    decode_text, resume_chunk, split_text, FileCommand, FileReply, Transport, MIN_REMOTE_VERSION,
};

use crate::config::SyncConfig;
use crate::error::{CoreError, Result};
use crate::events::{EventHub, SessionEvent, TransferEvent};
use crate::session::{AppMessage, Session};

/// A book file handed over by the app
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Book {
    pub name: String,
    pub path: PathBuf,
    pub size: u64,
}

/// Who stopped a cancelled transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelSource {
    User,
    Band,
}

/// How a transfer ended when it did not fail
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed { message: String, total_chunks: usize },
    Cancelled { by: CancelSource },
}

/// Where the exchange stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    /// Reading the book, bringing the session up, usage query
    Preparing,
    /// `start` sent, waiting for the band's `ready`
    AwaitingReady,
    /// Chunk sent, waiting for `next`, `error` or `success`
    Sending(usize),
}

struct Transfer {
    chunks: Vec<String>,
    state: ChunkState,
    last_sent: Option<Instant>,
    /// Consecutive `error` replies since the last `next`
    rejections: u32,
    /// `usage` sent and its `ready` not seen yet
    usage_pending: bool,
}

impl Transfer {
    fn new() -> Self {
        Self {
            chunks: Vec::new(),
            state: ChunkState::Preparing,
            last_sent: None,
            rejections: 0,
            usage_pending: false,
        }
    }

    fn chunk_in_flight(&self) -> Option<u32> {
        match self.state {
            ChunkState::Sending(index) => u32::try_from(index).ok(),
            _ => None,
        }
    }
}

struct Active {
    id: u64,
    cancel: Option<oneshot::Sender<()>>,
}

/// Single-flight book sender on top of a [`Session`]
pub struct FileSender<T: Transport> {
    session: Session<T>,
    config: SyncConfig,
    active: Mutex<Option<Active>>,
    next_id: AtomicU64,
    events: EventHub<TransferEvent>,
}

impl<T: Transport> FileSender<T> {
    /// Sender driving transfers over `session`
    pub fn new(session: Session<T>, config: SyncConfig) -> Self {
        Self {
            session,
            config,
            active: Mutex::new(None),
            next_id: AtomicU64::new(1),
            events: EventHub::new(),
        }
    }

    /// Push `book` to the band.
    ///
    /// Returns [`CoreError::Busy`] without touching the running transfer if
    /// one is in flight. The session is torn down once the transfer ends,
    /// whatever the outcome.
    pub async fn send_file(&self, book: Book) -> Result<TransferOutcome> {
        let (id, cancelled) = self.begin()?;
        info!("Pushing {} ({} bytes)", book.name, book.size);

        let mut transfer = Transfer::new();
        let result = tokio::select! {
            biased;
            _ = cancelled => Ok(TransferOutcome::Cancelled { by: CancelSource::User }),
            result = self.drive(&book, &mut transfer) => result,
        };

        // A user cancel tears down and clears the flag itself
        if result != Ok(TransferOutcome::Cancelled { by: CancelSource::User }) {
            self.session.teardown().await;
            self.finish(id);
        }
        self.report(&book, &result, &transfer);
        result
    }

    /// Abort the transfer in flight. Returns `false` if there was none.
    pub async fn cancel(&self) -> bool {
        let taken = self
            .lock_active()
            .as_mut()
            .map(|active| (active.id, active.cancel.take()));
        let Some((id, signal)) = taken else {
            debug!("Cancel requested with no transfer in flight");
            return false;
        };
        // No receiver: the transfer already ended and is tearing down on its own
        if !signal.is_some_and(|signal| signal.send(()).is_ok()) {
            debug!("Cancel requested after transfer {} ended", id);
            return false;
        }
        info!("Cancelling transfer");

        // Best effort: the band may already be gone
        match FileCommand::Cancel.encode() {
            Ok(frame) => {
                let sent = tokio::time::timeout(
                    self.config.cancel_send_timeout(),
                    self.session.send_connected(&frame),
                )
                .await;
                match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => debug!("Cancel not delivered: {}", e),
                    Err(_) => debug!("Cancel not acknowledged in time"),
                }
            }
            Err(e) => warn!("Failed to encode cancel: {}", e),
        }

        self.session.teardown().await;
        self.finish(id);
        true
    }

    /// Whether a transfer is in flight
    pub fn is_busy(&self) -> bool {
        self.lock_active().is_some()
    }

    /// Stream of transfer events
    pub fn subscribe(&self) -> broadcast::Receiver<TransferEvent> {
        self.events.subscribe()
    }

    /// Run `cb` for every transfer event
    pub fn on_event(&self, cb: impl Fn(&TransferEvent) + Send + Sync + 'static) {
        self.events.observe(cb);
    }

    /// Run `cb` with (fraction, chunk preview, status) on every progress update
    pub fn on_progress(&self, cb: impl Fn(f64, &str, &str) + Send + Sync + 'static) {
        self.events.observe(move |e| {
            if let TransferEvent::Progress {
                fraction,
                chunk_preview,
                status,
            } = e
            {
                cb(*fraction, chunk_preview, status)
            }
        });
    }

    /// Run `cb` with (message, total chunks) when a transfer completes
    pub fn on_success(&self, cb: impl Fn(&str, usize) + Send + Sync + 'static) {
        self.events.observe(move |e| {
            if let TransferEvent::Success {
                message,
                total_chunks,
            } = e
            {
                cb(message, *total_chunks)
            }
        });
    }

    /// Run `cb` with (message, chunk index in flight) when a transfer fails
    pub fn on_error(&self, cb: impl Fn(&str, Option<u32>) + Send + Sync + 'static) {
        self.events.observe(move |e| {
            if let TransferEvent::Error {
                message,
                chunk_index,
            } = e
            {
                cb(message, *chunk_index)
            }
        });
    }

    pub fn session(&self) -> &Session<T> {
        &self.session
    }

    fn lock_active(&self) -> MutexGuard<'_, Option<Active>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin(&self) -> Result<(u64, oneshot::Receiver<()>)> {
        let mut active = self.lock_active();
        if active.is_some() {
            warn!("Transfer requested while another is in flight");
            return Err(CoreError::Busy);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        *active = Some(Active {
            id,
            cancel: Some(tx),
        });
        Ok((id, rx))
    }

    fn finish(&self, id: u64) {
        let mut active = self.lock_active();
        if active.as_ref().is_some_and(|a| a.id == id) {
            *active = None;
        }
    }

    async fn drive(&self, book: &Book, transfer: &mut Transfer) -> Result<TransferOutcome> {
        let mut replies = self.session.route_messages();
        let mut session_events = self.session.subscribe();

        let bytes = tokio::fs::read(&book.path).await?;
        let decoded = decode_text(&bytes);
        if decoded.had_errors {
            warn!("{} is not valid {}, replaced bad sequences", book.name, decoded.encoding.name());
        }
        debug!("Decoded {} bytes of {} as {}", bytes.len(), book.name, decoded.encoding.name());

        transfer.chunks = split_text(&decoded.text, self.config.chunk_size);
        let Some(last) = transfer.chunks.len().checked_sub(1) else {
            return Err(CoreError::Protocol(format!("{} has no text to send", book.name)));
        };
        let chunk_size = u32::try_from(self.config.chunk_size)
            .map_err(|_| CoreError::Config("chunk_size does not fit the wire format".into()))?;

        self.session.init().await?;
        self.session.handshake().await?;
        if let Some(current) = self.session.remote_version() {
            if current < MIN_REMOTE_VERSION {
                return Err(CoreError::VersionIncompatible {
                    current,
                    required: MIN_REMOTE_VERSION,
                });
            }
        }

        self.emit_progress(transfer, 0, 0.0, "Waiting for band".into());
        self.session.send_message(&FileCommand::Usage.encode()?).await?;
        transfer.usage_pending = true;

        // Wait for the usage reply while the band app comes up. The launch
        // delay is a floor, the reply timeout a ceiling.
        let sent = Instant::now();
        let launched = sent + self.config.launch_delay();
        let give_up = launched.max(sent + self.config.usage_reply_timeout());
        loop {
            let wake = if transfer.usage_pending { give_up } else { launched };
            tokio::select! {
                _ = tokio::time::sleep_until(wake) => break,
                reply = next_reply(&mut replies, &mut session_events) => match reply? {
                    FileReply::Ready { usage, .. } => {
                        self.check_storage(usage)?;
                        transfer.usage_pending = false;
                    }
                    FileReply::Cancel => return Ok(TransferOutcome::Cancelled { by: CancelSource::Band }),
                    other => debug!("Ignoring {:?} before start", other),
                },
            }
        }
        if transfer.usage_pending {
            warn!(
                "No usage reply within {:?}, starting anyway",
                self.config.usage_reply_timeout()
            );
        }

        let start = FileCommand::Start {
            filename: book.name.clone(),
            total: wire_index(last)?,
            chunk_size,
        };
        transfer.state = ChunkState::AwaitingReady;
        self.session.send_message(&start.encode()?).await?;
        info!("Started {}: {} chunks", book.name, transfer.chunks.len());

        loop {
            match next_reply(&mut replies, &mut session_events).await? {
                FileReply::Ready {
                    found,
                    usage,
                    length,
                } => {
                    self.check_storage(usage)?;
                    // Replies come back in order: a late usage answer precedes the start one
                    if transfer.usage_pending {
                        debug!("Late usage reply");
                        transfer.usage_pending = false;
                        continue;
                    }
                    if let ChunkState::Sending(index) = transfer.state {
                        warn!("Band reported ready while chunk {} was in flight", index);
                    }
                    let (index, set_count) = self.resume_point(transfer, found, length)?;
                    transfer.rejections = 0;
                    self.send_chunk(transfer, index, set_count).await?;
                }
                FileReply::Next { message, count } => {
                    let index = count as usize;
                    if transfer.state != ChunkState::Sending(index) {
                        debug!("Ignoring stale next {}", count);
                        continue;
                    }
                    transfer.rejections = 0;
                    if index >= last {
                        return Ok(Self::completed(transfer, message));
                    }
                    self.send_chunk(transfer, index + 1, None).await?;
                }
                FileReply::Error { message, count } => {
                    let index = count as usize;
                    if index > last {
                        return Err(CoreError::Protocol(format!(
                            "band asked for chunk {} of {}",
                            count,
                            transfer.chunks.len()
                        )));
                    }
                    transfer.rejections += 1;
                    warn!("Band rejected chunk {}: {}", count, message);
                    if let Some(max) = self.config.max_consecutive_rejections {
                        if transfer.rejections > max {
                            return Err(CoreError::ChunkRejected {
                                count,
                                attempts: transfer.rejections,
                            });
                        }
                    }
                    self.send_chunk(transfer, index, Some(count)).await?;
                }
                FileReply::Success { message, .. } => {
                    return Ok(Self::completed(transfer, message));
                }
                FileReply::Cancel => {
                    info!("Band cancelled the transfer");
                    return Ok(TransferOutcome::Cancelled {
                        by: CancelSource::Band,
                    });
                }
                FileReply::Unknown => debug!("Ignoring unknown file reply"),
            }
        }
    }

    async fn send_chunk(
        &self,
        transfer: &mut Transfer,
        index: usize,
        set_count: Option<u32>,
    ) -> Result<()> {
        let Some(chunk) = transfer.chunks.get(index) else {
            return Err(CoreError::Protocol(format!("no chunk {}", index)));
        };
        let frame = FileCommand::Data {
            count: wire_index(index)?,
            data: chunk.clone(),
            set_count,
        }
        .encode()?;

        transfer.state = ChunkState::Sending(index);
        debug!("Sending chunk {} (setCount {:?})", index, set_count);
        self.session.send_message(&frame).await?;

        let now = Instant::now();
        let remaining = transfer.chunks.len() - index - 1;
        let status = match transfer.last_sent.replace(now) {
            Some(previous) => progress_status(self.config.chunk_size, remaining, now - previous),
            None => format!("{} chunks left", remaining),
        };
        let fraction = index as f64 / transfer.chunks.len() as f64;
        self.emit_progress(transfer, index, fraction, status);
        Ok(())
    }

    /// First chunk to send after a `ready`, with the `setCount` to attach
    fn resume_point(
        &self,
        transfer: &Transfer,
        found: bool,
        length: Option<u64>,
    ) -> Result<(usize, Option<u32>)> {
        let last = transfer.chunks.len().saturating_sub(1);
        match (found, length) {
            (true, Some(length)) => {
                let resume = resume_chunk(length, self.config.chunk_size, transfer.chunks.len());
                // Everything is on the band already: resend the last chunk for its `next`
                let index = resume.min(last);
                info!("Band holds {} bytes, resuming at chunk {}", length, index);
                Ok((index, Some(wire_index(index)?)))
            }
            _ if transfer.state == ChunkState::AwaitingReady => Ok((0, None)),
            _ => {
                info!("Band lost the partial file, restarting");
                Ok((0, Some(0)))
            }
        }
    }

    fn emit_progress(&self, transfer: &Transfer, index: usize, fraction: f64, status: String) {
        let chunk_preview = transfer
            .chunks
            .get(index)
            .map(|c| c.chars().take(self.config.preview_chars).collect())
            .unwrap_or_default();
        self.events.emit(TransferEvent::Progress {
            fraction,
            chunk_preview,
            status,
        });
    }

    fn check_storage(&self, usage: u64) -> Result<()> {
        if usage > self.config.storage_ceiling {
            return Err(CoreError::StorageExceeded {
                usage,
                ceiling: self.config.storage_ceiling,
            });
        }
        Ok(())
    }

    fn completed(transfer: &Transfer, message: String) -> TransferOutcome {
        TransferOutcome::Completed {
            message,
            total_chunks: transfer.chunks.len(),
        }
    }

    fn report(&self, book: &Book, result: &Result<TransferOutcome>, transfer: &Transfer) {
        match result {
            Ok(TransferOutcome::Completed {
                message,
                total_chunks,
            }) => {
                info!("Pushed {} in {} chunks", book.name, total_chunks);
                let last = total_chunks.saturating_sub(1);
                self.emit_progress(transfer, last, 1.0, "Done".into());
                self.events.emit(TransferEvent::Success {
                    message: message.clone(),
                    total_chunks: *total_chunks,
                });
            }
            Ok(TransferOutcome::Cancelled { by }) => {
                let message = match by {
                    CancelSource::User => "Transfer cancelled",
                    CancelSource::Band => "Transfer cancelled on the band",
                };
                self.events.emit(TransferEvent::Cancelled {
                    message: message.into(),
                });
            }
            Err(e) => {
                let chunk_index = transfer.chunk_in_flight();
                error!("Pushing {} failed at chunk {:?}: {}", book.name, chunk_index, e);
                self.events.emit(TransferEvent::Error {
                    message: e.to_string(),
                    chunk_index,
                });
            }
        }
    }
}

/// Wait for the next `file` reply, failing if the session drops
async fn next_reply(
    replies: &mut mpsc::UnboundedReceiver<AppMessage>,
    session_events: &mut broadcast::Receiver<SessionEvent>,
) -> Result<FileReply> {
    loop {
        tokio::select! {
            message = replies.recv() => {
                let Some(AppMessage { tag, body }) = message else {
                    return Err(CoreError::Disconnected);
                };
                if tag != FILE_TAG {
                    debug!("Ignoring {} frame during transfer", tag);
                    continue;
                }
                match FileReply::from_value(body) {
                    Ok(reply) => return Ok(reply),
                    Err(e) => warn!("Dropping malformed file reply: {}", e),
                }
            }
            event = session_events.recv() => match event {
                Ok(SessionEvent::Disconnected { reason }) => {
                    warn!("Session dropped mid-transfer ({:?})", reason);
                    return Err(CoreError::Disconnected);
                }
                Ok(_) => {}
                Err(RecvError::Lagged(missed)) => debug!("Missed {} session events", missed),
                Err(RecvError::Closed) => return Err(CoreError::Disconnected),
            },
        }
    }
}

fn wire_index(index: usize) -> Result<u32> {
    u32::try_from(index).map_err(|_| CoreError::Protocol(format!("chunk index {} out of range", index)))
}

/// Progress line for the chunk just sent: instantaneous speed and remaining time
pub fn progress_status(chunk_size: usize, remaining: usize, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    if secs <= 0.0 {
        return format!("{} chunks left", remaining);
    }
    let speed = chunk_size as f64 / 1024.0 / secs;
    let eta = remaining as f64 * secs;
    format!("{:.1} KB/s, {:.0}s left", speed, eta)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{handshake, reply, send_failed, wait_until, MockTransport};
    use shared::{LinkEvent, STORAGE_CEILING};
    use std::sync::Arc;

    // 45 KiB of UTF-16
    fn text_45k() -> String {
        "a".repeat(45 * 1024 / 2)
    }

    fn book(text: &str) -> (tempfile::TempDir, Book) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("novel.txt");
        std::fs::write(&path, text).unwrap();
        let book = Book {
            name: "novel.txt".into(),
            path,
            size: text.len() as u64,
        };
        (dir, book)
    }

    fn sender_with(transport: &MockTransport, config: SyncConfig) -> FileSender<MockTransport> {
        let session = Session::new(Arc::new(transport.clone()), config.handshake_timeout());
        FileSender::new(session, config)
    }

    fn sender(transport: &MockTransport) -> FileSender<MockTransport> {
        sender_with(
            transport,
            SyncConfig {
                launch_delay_ms: 500,
                ..SyncConfig::default()
            },
        )
    }

    fn ready(found: bool, usage: u64, length: Option<u64>) -> LinkEvent {
        reply(FileReply::Ready {
            found,
            usage,
            length,
        })
    }

    fn next(count: u32) -> LinkEvent {
        reply(FileReply::Next {
            message: "ok".into(),
            count,
        })
    }

    /// A band that accepts every chunk and reports `length` bytes on start
    fn band(length: Option<u64>) -> MockTransport {
        MockTransport::band(move |cmd| {
            Ok(match cmd {
                FileCommand::Usage => vec![ready(false, 1024, None)],
                FileCommand::Start { .. } => vec![ready(length.is_some(), 1024, length)],
                FileCommand::Data { count, .. } => vec![next(*count)],
                _ => vec![],
            })
        })
    }

    fn drain(rx: &mut broadcast::Receiver<TransferEvent>) -> Vec<TransferEvent> {
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_45k_payload_in_order() {
        let transport = band(None);
        let sender = sender(&transport);
        let mut events = sender.subscribe();
        let (_dir, book) = book(&text_45k());

        let outcome = sender.send_file(book).await.unwrap();

        assert_eq!(
            outcome,
            TransferOutcome::Completed {
                message: "ok".into(),
                total_chunks: 3
            }
        );
        let commands = transport.file_commands();
        assert_eq!(commands[0], FileCommand::Usage);
        assert_eq!(
            commands[1],
            FileCommand::Start {
                filename: "novel.txt".into(),
                total: 2,
                chunk_size: 20 * 1024,
            }
        );
        assert_eq!(transport.data_counts(), vec![(0, None), (1, None), (2, None)]);

        let events = drain(&mut events);
        assert_eq!(
            events.last(),
            Some(&TransferEvent::Success {
                message: "ok".into(),
                total_chunks: 3
            })
        );
        let fractions: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                TransferEvent::Progress { fraction, .. } => Some(*fraction),
                _ => None,
            })
            .collect();
        assert_eq!(fractions.first(), Some(&0.0));
        assert_eq!(fractions.last(), Some(&1.0));
        assert!(fractions.windows(2).all(|w| w[0] <= w[1]));

        assert!(!sender.is_busy());
        assert!(!transport.has_listener());
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_full_aborts_before_start() {
        let transport = MockTransport::band(|cmd| {
            Ok(match cmd {
                FileCommand::Usage => vec![ready(true, 26 * 1024 * 1024, None)],
                _ => vec![],
            })
        });
        let sender = sender(&transport);
        let mut events = sender.subscribe();
        let (_dir, book) = book(&text_45k());

        let result = sender.send_file(book).await;

        assert_eq!(
            result,
            Err(CoreError::StorageExceeded {
                usage: 26 * 1024 * 1024,
                ceiling: STORAGE_CEILING
            })
        );
        assert_eq!(transport.file_commands(), vec![FileCommand::Usage]);
        assert!(matches!(
            drain(&mut events).last(),
            Some(TransferEvent::Error {
                chunk_index: None,
                ..
            })
        ));
        assert_eq!(transport.teardowns(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_from_band_length() {
        let transport = band(Some(2 * 20 * 1024 + 100));
        let sender = sender(&transport);
        let (_dir, book) = book(&text_45k());

        let outcome = sender.send_file(book).await.unwrap();

        assert!(matches!(outcome, TransferOutcome::Completed { total_chunks: 3, .. }));
        assert_eq!(transport.data_counts(), vec![(2, Some(2))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_past_end_restarts() {
        let transport = band(Some(10 * 1024 * 1024));
        let sender = sender(&transport);
        let (_dir, book) = book(&text_45k());

        sender.send_file(book).await.unwrap();

        assert_eq!(
            transport.data_counts(),
            vec![(0, Some(0)), (1, None), (2, None)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_band_holding_whole_book_only_confirms_last_chunk() {
        let transport = band(Some(3 * 20 * 1024));
        let sender = sender(&transport);
        // Exactly three full chunks
        let (_dir, book) = book(&"a".repeat(3 * 20 * 1024 / 2));

        let outcome = sender.send_file(book).await.unwrap();

        assert!(matches!(outcome, TransferOutcome::Completed { total_chunks: 3, .. }));
        assert_eq!(transport.data_counts(), vec![(2, Some(2))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_usage_reply_is_not_taken_for_start() {
        // The band answers usage only once start is out, replies still in order
        let transport = MockTransport::band(|cmd| {
            Ok(match cmd {
                FileCommand::Usage => vec![],
                FileCommand::Start { .. } => vec![
                    ready(false, 1024, None),
                    ready(true, 1024, Some(2 * 20 * 1024 + 10)),
                ],
                FileCommand::Data { count, .. } => vec![next(*count)],
                _ => vec![],
            })
        });
        let sender = sender_with(
            &transport,
            SyncConfig {
                launch_delay_ms: 0,
                ..SyncConfig::default()
            },
        );
        let (_dir, book) = book(&text_45k());

        let outcome = sender.send_file(book).await.unwrap();

        assert!(matches!(outcome, TransferOutcome::Completed { total_chunks: 3, .. }));
        assert_eq!(transport.data_counts(), vec![(2, Some(2))]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_usage_reply_still_guards_storage() {
        let transport = MockTransport::band(|cmd| {
            Ok(match cmd {
                FileCommand::Usage => vec![],
                FileCommand::Start { .. } => vec![ready(false, 26 * 1024 * 1024, None)],
                _ => vec![],
            })
        });
        let sender = sender(&transport);
        let (_dir, book) = book(&text_45k());

        let result = sender.send_file(book).await;

        assert!(matches!(result, Err(CoreError::StorageExceeded { .. })));
        assert!(transport.data_counts().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_band_restart_mid_transfer_resumes() {
        let mut restarted = false;
        let transport = MockTransport::band(move |cmd| {
            Ok(match cmd {
                FileCommand::Usage | FileCommand::Start { .. } => vec![ready(false, 0, None)],
                FileCommand::Data { count: 2, .. } if !restarted => {
                    restarted = true;
                    vec![ready(true, 0, Some(20 * 1024))]
                }
                FileCommand::Data { count, .. } => vec![next(*count)],
                _ => vec![],
            })
        });
        let sender = sender(&transport);
        let (_dir, book) = book(&text_45k());

        let outcome = sender.send_file(book).await.unwrap();

        assert!(matches!(outcome, TransferOutcome::Completed { total_chunks: 3, .. }));
        assert_eq!(
            transport.data_counts(),
            vec![(0, None), (1, None), (2, None), (1, Some(1)), (2, None)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_chunk_is_resent_with_set_count() {
        let mut rejected = false;
        let transport = MockTransport::band(move |cmd| {
            Ok(match cmd {
                FileCommand::Usage | FileCommand::Start { .. } => vec![ready(false, 0, None)],
                FileCommand::Data { count: 1, .. } if !rejected => {
                    rejected = true;
                    vec![reply(FileReply::Error {
                        message: "crc".into(),
                        count: 1,
                    })]
                }
                FileCommand::Data { count, .. } => vec![next(*count)],
                _ => vec![],
            })
        });
        let sender = sender(&transport);
        let (_dir, book) = book(&text_45k());

        sender.send_file(book).await.unwrap();

        assert_eq!(
            transport.data_counts(),
            vec![(0, None), (1, None), (1, Some(1)), (2, None)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejection_storm_is_capped() {
        let transport = MockTransport::band(|cmd| {
            Ok(match cmd {
                FileCommand::Usage | FileCommand::Start { .. } => vec![ready(false, 0, None)],
                FileCommand::Data { count, .. } => vec![reply(FileReply::Error {
                    message: "busy".into(),
                    count: *count,
                })],
                _ => vec![],
            })
        });
        let sender = sender_with(
            &transport,
            SyncConfig {
                launch_delay_ms: 0,
                max_consecutive_rejections: Some(2),
                ..SyncConfig::default()
            },
        );
        let (_dir, book) = book(&text_45k());

        let result = sender.send_file(book).await;

        assert_eq!(
            result,
            Err(CoreError::ChunkRejected {
                count: 0,
                attempts: 3
            })
        );
        assert_eq!(
            transport.data_counts(),
            vec![(0, None), (0, Some(0)), (0, Some(0))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_failure_reports_chunk_index() {
        let transport = MockTransport::band(|cmd| match cmd {
            FileCommand::Data { count: 1, .. } => Err(send_failed()),
            FileCommand::Data { count, .. } => Ok(vec![next(*count)]),
            FileCommand::Usage | FileCommand::Start { .. } => Ok(vec![ready(false, 0, None)]),
            _ => Ok(vec![]),
        });
        let sender = sender(&transport);
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = errors.clone();
        sender.on_error(move |_, index| sink.lock().unwrap().push(index));
        let (_dir, book) = book(&text_45k());

        let result = sender.send_file(book).await;

        assert_eq!(result, Err(CoreError::Transport(send_failed())));
        assert_eq!(*errors.lock().unwrap(), vec![Some(1)]);
        // No automatic retry
        assert_eq!(transport.data_counts(), vec![(0, None), (1, None)]);
        assert!(!sender.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_band_cancel_is_not_a_failure() {
        let transport = MockTransport::band(|cmd| {
            Ok(match cmd {
                FileCommand::Usage | FileCommand::Start { .. } => vec![ready(false, 0, None)],
                FileCommand::Data { .. } => vec![reply(FileReply::Cancel)],
                _ => vec![],
            })
        });
        let sender = sender(&transport);
        let mut events = sender.subscribe();
        let (_dir, book) = book(&text_45k());

        let outcome = sender.send_file(book).await;

        assert_eq!(
            outcome,
            Ok(TransferOutcome::Cancelled {
                by: CancelSource::Band
            })
        );
        assert!(matches!(
            drain(&mut events).last(),
            Some(TransferEvent::Cancelled { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_loss_fails_transfer() {
        let transport = MockTransport::band(|cmd| {
            Ok(match cmd {
                FileCommand::Usage | FileCommand::Start { .. } => vec![ready(false, 0, None)],
                FileCommand::Data { count: 1, .. } => vec![LinkEvent::Lost],
                FileCommand::Data { count, .. } => vec![next(*count)],
                _ => vec![],
            })
        });
        let sender = sender(&transport);
        let mut events = sender.subscribe();
        let (_dir, book) = book(&text_45k());

        let result = sender.send_file(book).await;

        assert_eq!(result, Err(CoreError::Disconnected));
        assert_eq!(
            drain(&mut events).last(),
            Some(&TransferEvent::Error {
                message: "Band disconnected".into(),
                chunk_index: Some(1)
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_user_cancel_and_single_flight() {
        // Band never answers start
        let transport = MockTransport::band(|cmd| {
            Ok(match cmd {
                FileCommand::Usage => vec![ready(false, 0, None)],
                _ => vec![],
            })
        });
        let sender = Arc::new(sender(&transport));
        let (dir, book) = book(&text_45k());

        let task = tokio::spawn({
            let sender = sender.clone();
            let book = book.clone();
            async move { sender.send_file(book).await }
        });
        wait_until(|| {
            transport
                .file_commands()
                .iter()
                .any(|c| matches!(c, FileCommand::Start { .. }))
        })
        .await;

        assert!(sender.is_busy());
        assert_eq!(sender.send_file(book).await, Err(CoreError::Busy));
        assert!(sender.is_busy());

        assert!(sender.cancel().await);
        assert!(!sender.is_busy());
        assert_eq!(
            task.await.unwrap(),
            Ok(TransferOutcome::Cancelled {
                by: CancelSource::User
            })
        );
        assert_eq!(transport.file_commands().last(), Some(&FileCommand::Cancel));
        assert_eq!(transport.teardowns(), 1);
        assert!(!sender.cancel().await);
        drop(dir);
    }

    #[tokio::test(start_paused = true)]
    async fn test_incompatible_band_is_refused() {
        let transport = MockTransport::silent();
        let sender = Arc::new(sender(&transport));
        let (_dir, book) = book(&text_45k());

        let task = tokio::spawn({
            let sender = sender.clone();
            async move { sender.send_file(book).await }
        });
        wait_until(|| !transport.handshake_counts().is_empty()).await;
        transport.inject(handshake(1, MIN_REMOTE_VERSION - 1));

        assert_eq!(
            task.await.unwrap(),
            Err(CoreError::VersionIncompatible {
                current: MIN_REMOTE_VERSION - 1,
                required: MIN_REMOTE_VERSION
            })
        );
        assert!(transport.file_commands().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_transfer_ended_sends_nothing() {
        let transport = band(None);
        let sender = sender(&transport);
        // The transfer finished; only the busy flag is left
        let (id, finished) = sender.begin().unwrap();
        drop(finished);

        assert!(!sender.cancel().await);
        assert!(transport.file_commands().is_empty());
        assert_eq!(transport.teardowns(), 0);

        sender.finish(id);
        assert!(!sender.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_book_is_refused() {
        let transport = band(None);
        let sender = sender(&transport);
        let (_dir, book) = book("");

        let result = sender.send_file(book).await;

        assert!(matches!(result, Err(CoreError::Protocol(_))));
        assert_eq!(transport.connects(), 0);
    }

    #[test]
    fn test_progress_status() {
        assert_eq!(
            progress_status(20 * 1024, 4, Duration::from_secs(2)),
            "10.0 KB/s, 8s left"
        );
        assert_eq!(progress_status(20 * 1024, 4, Duration::ZERO), "4 chunks left");
    }
}
