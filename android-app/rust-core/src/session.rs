//! # Handshake / Session Layer
//!
//! Makes "send a frame to the band" safe to call at any time. The first send
//! brings the link up (connect, auth, launch the band app, register the
//! listener) and runs the handshake; concurrent senders share the handshake
//! already in flight.
//!
//! ## State Machine
//!
//! ```text
//!            send_message                 echo (count > 0)
//!   Idle ───────────────────► Handshaking ─────────────────► Connected
//!    ▲                            │                              │
//!    │      timer (HandshakeTimeout)                              │ timer (no frame
//!    ├────────────────────────────┘                              │ within window)
//!    ├───────────────────────────────────────────────────────────┘
//!    └─────── teardown / link lost (from any state)
//! ```
//!
//! One timer serves both the handshake timeout and the liveness window. Every
//! arm or cancel bumps a generation counter under the state lock; a timer that
//! fires with a stale generation does nothing, so a late reply can never be
//! followed by a false disconnect.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use log::{debug, info, warn};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use shared::{
    parse_frame, DeviceId, Frame, Handshake, LinkEvent, LinkSink, Transport, TransportError,
};

use crate::error::{CoreError, Result};
use crate::events::{DisconnectReason, EventHub, SessionEvent};

/// Session phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// No handshake in flight, not connected
    Idle,
    /// Probe sent, waiting for the band's echo
    Handshaking,
    /// Handshake complete, liveness timer running
    Connected,
}

/// A non-handshake frame routed to the application layer
#[derive(Debug, Clone, PartialEq)]
pub struct AppMessage {
    pub tag: String,
    pub body: Value,
}

type Pending = watch::Sender<Option<Result<()>>>;

struct State {
    phase: Phase,
    node: Option<DeviceId>,
    pending: Option<Pending>,
    remote_version: Option<u32>,
    /// Handshake probes started since the link came up
    retry_count: u32,
    timer: Option<JoinHandle<()>>,
    generation: u64,
    pump: Option<JoinHandle<()>>,
    app_sink: Option<mpsc::UnboundedSender<AppMessage>>,
}

struct Inner<T> {
    transport: Arc<T>,
    timeout: Duration,
    state: Mutex<State>,
    /// Serializes link setup and teardown
    link_lock: tokio::sync::Mutex<()>,
    events: EventHub<SessionEvent>,
}

/// Handshake-gated session over a [`Transport`]
pub struct Session<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Transport> Session<T> {
    /// Session over `transport`; `timeout` bounds both the handshake and link silence
    pub fn new(transport: Arc<T>, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                timeout,
                state: Mutex::new(State {
                    phase: Phase::Idle,
                    node: None,
                    pending: None,
                    remote_version: None,
                    retry_count: 0,
                    timer: None,
                    generation: 0,
                    pump: None,
                    app_sink: None,
                }),
                link_lock: tokio::sync::Mutex::new(()),
                events: EventHub::new(),
            }),
        }
    }

    /// Bring the link up if it is not: connect, auth, launch the band app,
    /// register the listener. Returns the bound band node.
    pub async fn init(&self) -> Result<DeviceId> {
        let _link = self.inner.link_lock.lock().await;
        let bound = self.inner.lock_state().node.clone();
        if let Some(node) = bound {
            return Ok(node);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let node = match self.open_link(tx).await {
            Ok(node) => node,
            Err(e) => {
                warn!("Link setup failed: {}", e);
                self.inner.transport.remove_listener();
                self.inner.transport.teardown().await;
                return Err(e);
            }
        };
        let pump = tokio::spawn(pump(Arc::downgrade(&self.inner), rx));

        let mut state = self.inner.lock_state();
        if let Some(old) = state.pump.replace(pump) {
            old.abort();
        }
        state.node = Some(node.clone());
        state.retry_count = 0;
        info!("Link up, band node {}", node);
        Ok(node)
    }

    async fn open_link(&self, sink: LinkSink) -> Result<DeviceId> {
        let transport = &self.inner.transport;
        let node = transport.connect().await?;
        debug!("Band found: {}", node);
        transport.auth().await?;
        if !transport.query_remote_app_installed().await? {
            return Err(TransportError::AppNotInstalled.into());
        }
        transport.open_remote_app().await?;
        transport.register_listener(sink)?;
        Ok(node)
    }

    /// Send one frame, bringing the link up and handshaking first if needed
    pub async fn send_message(&self, frame: &[u8]) -> Result<()> {
        self.init().await?;
        self.handshake().await?;
        self.inner.transport.send(frame).await?;
        Ok(())
    }

    /// Send one frame only if the session is already connected
    pub async fn send_connected(&self, frame: &[u8]) -> Result<()> {
        if !self.is_connected() {
            return Err(CoreError::Disconnected);
        }
        self.inner.transport.send(frame).await?;
        Ok(())
    }

    /// Run the handshake, or join the one in flight
    pub async fn handshake(&self) -> Result<()> {
        let (mut rx, probe) = {
            let mut state = self.inner.lock_state();
            let joined = match state.phase {
                Phase::Connected => return Ok(()),
                Phase::Handshaking => state.pending.as_ref().map(watch::Sender::subscribe),
                Phase::Idle => None,
            };
            match joined {
                Some(rx) => (rx, false),
                None => {
                    let (tx, rx) = watch::channel(None);
                    state.pending = Some(tx);
                    state.phase = Phase::Handshaking;
                    state.retry_count += 1;
                    self.inner.arm_timer(&mut state);
                    (rx, true)
                }
            }
        };

        if probe {
            debug!("Sending handshake probe");
            let sent = match Handshake::probe().encode() {
                Ok(frame) => self.inner.transport.send(&frame).await.map_err(CoreError::from),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = sent {
                self.inner.fail_handshake(e.clone());
                return Err(e);
            }
        }

        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => (*outcome).clone().unwrap_or(Err(CoreError::Disconnected)),
            Err(_) => Err(CoreError::Disconnected),
        };
        outcome
    }

    /// Tear the link down and make one fresh attempt (link and handshake)
    pub async fn reconnect(&self) -> Result<()> {
        self.teardown().await;
        self.init().await?;
        self.handshake().await
    }

    /// Release the link. Waiters on a pending handshake fail with
    /// [`CoreError::Disconnected`]; a connected session reports a graceful
    /// disconnect.
    pub async fn teardown(&self) {
        let _link = self.inner.link_lock.lock().await;
        let was_connected = {
            let mut state = self.inner.lock_state();
            Inner::<T>::cancel_timer(&mut state);
            if let Some(pending) = state.pending.take() {
                pending.send_replace(Some(Err(CoreError::Disconnected)));
            }
            if let Some(pump) = state.pump.take() {
                pump.abort();
            }
            state.app_sink = None;
            state.node = None;
            state.remote_version = None;
            let was_connected = state.phase == Phase::Connected;
            state.phase = Phase::Idle;
            was_connected
        };

        self.inner.transport.remove_listener();
        self.inner.transport.teardown().await;
        info!("Link torn down");
        if was_connected {
            self.inner.events.emit(SessionEvent::Disconnected {
                reason: DisconnectReason::Graceful,
            });
        }
    }

    /// Route application frames to a fresh receiver, closing the previous one
    pub fn route_messages(&self) -> mpsc::UnboundedReceiver<AppMessage> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock_state().app_sink = Some(tx);
        rx
    }

    /// Stream of session events, for consumers that prefer a receiver over callbacks
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe()
    }

    /// Run `cb` for every session event
    pub fn on_event(&self, cb: impl Fn(&SessionEvent) + Send + Sync + 'static) {
        self.inner.events.observe(cb);
    }

    /// Run `cb` each time the handshake completes
    pub fn on_connected(&self, cb: impl Fn() + Send + Sync + 'static) {
        self.inner.events.observe(move |e| {
            if let SessionEvent::Connected = e {
                cb()
            }
        });
    }

    /// Run `cb` each time a connected session drops
    pub fn on_disconnected(&self, cb: impl Fn(DisconnectReason) + Send + Sync + 'static) {
        self.inner.events.observe(move |e| {
            if let SessionEvent::Disconnected { reason } = e {
                cb(*reason)
            }
        });
    }

    /// Run `cb` with (current, required) when the band speaks an older protocol
    pub fn on_version_incompatible(&self, cb: impl Fn(u32, u32) + Send + Sync + 'static) {
        self.inner.events.observe(move |e| {
            if let SessionEvent::VersionIncompatible { current, required } = e {
                cb(*current, *required)
            }
        });
    }

    /// Run `cb` with the band's protocol version on every handshake frame
    pub fn on_band_version_received(&self, cb: impl Fn(u32) + Send + Sync + 'static) {
        self.inner.events.observe(move |e| {
            if let SessionEvent::BandVersionReceived { version } = e {
                cb(*version)
            }
        });
    }

    /// Current handshake phase
    pub fn phase(&self) -> Phase {
        self.inner.lock_state().phase
    }

    /// Whether the handshake has completed and the band is still heard from
    pub fn is_connected(&self) -> bool {
        self.phase() == Phase::Connected
    }

    /// Version the band advertised in its last handshake frame
    pub fn remote_version(&self) -> Option<u32> {
        self.inner.lock_state().remote_version
    }

    /// Handshake probes sent since the link came up
    pub fn retry_count(&self) -> u32 {
        self.inner.lock_state().retry_count
    }

    /// Band node the link is bound to, if any
    pub fn node(&self) -> Option<DeviceId> {
        self.inner.lock_state().node.clone()
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.inner.transport
    }
}

/// Drain link events on a single task so inbound handling is serialized
async fn pump<T: Transport>(inner: Weak<Inner<T>>, mut rx: mpsc::UnboundedReceiver<LinkEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match event {
            LinkEvent::Message(bytes) => inner.on_message(&bytes).await,
            LinkEvent::Lost => inner.on_link_lost(),
        }
    }
    debug!("Link listener closed");
}

impl<T: Transport> Inner<T> {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn on_message(self: &Arc<Self>, bytes: &[u8]) {
        self.touch();

        let frame = match parse_frame(bytes) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping malformed frame ({} bytes): {}", bytes.len(), e);
                return;
            }
        };

        match frame {
            Frame::Handshake(hs) => self.on_handshake(hs).await,
            Frame::Application { tag, body } => {
                let mut state = self.lock_state();
                let delivered = match &state.app_sink {
                    Some(sink) => sink.send(AppMessage { tag, body }).is_ok(),
                    None => false,
                };
                if !delivered {
                    debug!("No route for application frame, dropped");
                    state.app_sink = None;
                }
            }
        }
    }

    async fn on_handshake(self: &Arc<Self>, hs: Handshake) {
        debug!("Handshake frame count={} version={}", hs.count, hs.version);
        self.lock_state().remote_version = Some(hs.version);
        self.events
            .emit(SessionEvent::BandVersionReceived { version: hs.version });

        if !hs.is_compatible() {
            warn!(
                "Band protocol version {} is below the supported minimum {}",
                hs.version,
                shared::MIN_REMOTE_VERSION
            );
            self.events.emit(SessionEvent::VersionIncompatible {
                current: hs.version,
                required: shared::MIN_REMOTE_VERSION,
            });
        }

        if let Some(reply) = hs.reply() {
            let sent = match reply.encode() {
                Ok(frame) => self.transport.send(&frame).await.map_err(CoreError::from),
                Err(e) => Err(e.into()),
            };
            if let Err(e) = sent {
                warn!("Handshake reply {} not delivered: {}", reply.count, e);
            }
        }

        if hs.is_echo() {
            let connected = {
                let mut state = self.lock_state();
                if state.phase == Phase::Connected {
                    false
                } else {
                    state.phase = Phase::Connected;
                    if let Some(pending) = state.pending.take() {
                        pending.send_replace(Some(Ok(())));
                    }
                    self.arm_timer(&mut state);
                    true
                }
            };
            if connected {
                info!("Handshake complete, band protocol version {}", hs.version);
                self.events.emit(SessionEvent::Connected);
            }
        }
    }

    fn on_link_lost(&self) {
        let was_connected = {
            let mut state = self.lock_state();
            Self::cancel_timer(&mut state);
            if let Some(pending) = state.pending.take() {
                pending.send_replace(Some(Err(CoreError::Disconnected)));
            }
            state.node = None;
            let was_connected = state.phase == Phase::Connected;
            state.phase = Phase::Idle;
            was_connected
        };
        warn!("Link reported the band as lost");
        if was_connected {
            self.events.emit(SessionEvent::Disconnected {
                reason: DisconnectReason::LinkLost,
            });
        }
    }

    /// Any inbound frame proves the band is alive
    fn touch(self: &Arc<Self>) {
        let mut state = self.lock_state();
        if state.phase == Phase::Connected {
            self.arm_timer(&mut state);
        }
    }

    fn arm_timer(self: &Arc<Self>, state: &mut State) {
        Self::cancel_timer(state);
        let generation = state.generation;
        let inner = Arc::downgrade(self);
        let timeout = self.timeout;
        state.timer = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                inner.on_timeout(generation);
            }
        }));
    }

    fn cancel_timer(state: &mut State) {
        state.generation = state.generation.wrapping_add(1);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    fn on_timeout(&self, generation: u64) {
        let event = {
            let mut state = self.lock_state();
            if state.generation != generation {
                return;
            }
            state.timer = None;
            let phase = std::mem::replace(&mut state.phase, Phase::Idle);
            match phase {
                Phase::Handshaking => {
                    warn!("No handshake reply within {:?}", self.timeout);
                    if let Some(pending) = state.pending.take() {
                        pending.send_replace(Some(Err(CoreError::HandshakeTimeout)));
                    }
                    None
                }
                Phase::Connected => {
                    warn!("Nothing heard from the band for {:?}", self.timeout);
                    Some(SessionEvent::Disconnected {
                        reason: DisconnectReason::Timeout,
                    })
                }
                Phase::Idle => None,
            }
        };
        if let Some(event) = event {
            self.events.emit(event);
        }
    }

    fn fail_handshake(&self, error: CoreError) {
        let mut state = self.lock_state();
        if state.phase != Phase::Handshaking {
            return;
        }
        warn!("Handshake probe failed: {}", error);
        Self::cancel_timer(&mut state);
        state.phase = Phase::Idle;
        if let Some(pending) = state.pending.take() {
            pending.send_replace(Some(Err(error)));
        }
    }
}
