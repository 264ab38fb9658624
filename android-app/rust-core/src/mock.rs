//! Scripted band for tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use shared::{
    parse_frame, DeviceId, FileCommand, FileReply, Frame, Handshake, LinkEvent, LinkSink,
    Transport, TransportError, TransportResult, PROTOCOL_VERSION,
};

/// A frame the phone sent, decoded
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Handshake(Handshake),
    File(FileCommand),
    Other(Vec<u8>),
}

type Script = Box<dyn FnMut(&FileCommand) -> TransportResult<Vec<LinkEvent>> + Send>;

struct MockInner {
    sent: Mutex<Vec<Outbound>>,
    sink: Mutex<Option<LinkSink>>,
    script: Mutex<Script>,
    echo_handshake: bool,
    connects: AtomicUsize,
    teardowns: AtomicUsize,
    app_installed: AtomicBool,
}

/// In-memory [`Transport`] that records outbound frames and answers them
/// from a script
#[derive(Clone)]
pub struct MockTransport {
    inner: Arc<MockInner>,
}

impl MockTransport {
    fn build(echo_handshake: bool, script: Script) -> Self {
        Self {
            inner: Arc::new(MockInner {
                sent: Mutex::new(Vec::new()),
                sink: Mutex::new(None),
                script: Mutex::new(script),
                echo_handshake,
                connects: AtomicUsize::new(0),
                teardowns: AtomicUsize::new(0),
                app_installed: AtomicBool::new(true),
            }),
        }
    }

    /// A band that never answers anything
    pub fn silent() -> Self {
        Self::build(false, Box::new(|_| Ok(Vec::new())))
    }

    /// A band that echoes handshake probes and ignores file commands
    pub fn responsive() -> Self {
        Self::band(|_| Ok(Vec::new()))
    }

    /// A band that echoes handshake probes and answers file commands with `script`
    pub fn band(
        script: impl FnMut(&FileCommand) -> TransportResult<Vec<LinkEvent>> + Send + 'static,
    ) -> Self {
        Self::build(true, Box::new(script))
    }

    pub fn set_app_installed(&self, installed: bool) {
        self.inner.app_installed.store(installed, Ordering::SeqCst);
    }

    /// Deliver a raw frame as if the band sent it
    pub fn inject(&self, frame: Vec<u8>) {
        self.deliver(LinkEvent::Message(frame));
    }

    pub fn lose_link(&self) {
        self.deliver(LinkEvent::Lost);
    }

    fn deliver(&self, event: LinkEvent) {
        if let Some(sink) = self.inner.sink.lock().unwrap().as_ref() {
            let _ = sink.send(event);
        }
    }

    pub fn sent(&self) -> Vec<Outbound> {
        self.inner.sent.lock().unwrap().clone()
    }

    pub fn handshake_counts(&self) -> Vec<u32> {
        self.sent()
            .into_iter()
            .filter_map(|o| match o {
                Outbound::Handshake(hs) => Some(hs.count),
                _ => None,
            })
            .collect()
    }

    pub fn file_commands(&self) -> Vec<FileCommand> {
        self.sent()
            .into_iter()
            .filter_map(|o| match o {
                Outbound::File(cmd) => Some(cmd),
                _ => None,
            })
            .collect()
    }

    /// `(count, setCount)` of every data frame, in send order
    pub fn data_counts(&self) -> Vec<(u32, Option<u32>)> {
        self.file_commands()
            .into_iter()
            .filter_map(|cmd| match cmd {
                FileCommand::Data {
                    count, set_count, ..
                } => Some((count, set_count)),
                _ => None,
            })
            .collect()
    }

    pub fn connects(&self) -> usize {
        self.inner.connects.load(Ordering::SeqCst)
    }

    pub fn teardowns(&self) -> usize {
        self.inner.teardowns.load(Ordering::SeqCst)
    }

    pub fn has_listener(&self) -> bool {
        self.inner.sink.lock().unwrap().is_some()
    }

    fn record(&self, frame: &[u8]) -> TransportResult<Vec<LinkEvent>> {
        let outbound = match parse_frame(frame) {
            Ok(Frame::Handshake(hs)) => Outbound::Handshake(hs),
            Ok(Frame::Application { .. }) => match FileCommand::decode(frame) {
                Ok(cmd) => Outbound::File(cmd),
                Err(_) => Outbound::Other(frame.to_vec()),
            },
            Err(_) => Outbound::Other(frame.to_vec()),
        };
        self.inner.sent.lock().unwrap().push(outbound.clone());

        match outbound {
            Outbound::Handshake(hs) if self.inner.echo_handshake && hs.count == 0 => {
                Ok(vec![LinkEvent::Message(handshake(1, PROTOCOL_VERSION))])
            }
            Outbound::File(cmd) => {
                let mut script = self.inner.script.lock().unwrap();
                (*script)(&cmd)
            }
            _ => Ok(Vec::new()),
        }
    }
}

impl Transport for MockTransport {
    async fn connect(&self) -> TransportResult<DeviceId> {
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(DeviceId("band-1".into()))
    }

    async fn auth(&self) -> TransportResult<()> {
        Ok(())
    }

    async fn query_remote_app_installed(&self) -> TransportResult<bool> {
        Ok(self.inner.app_installed.load(Ordering::SeqCst))
    }

    async fn open_remote_app(&self) -> TransportResult<()> {
        Ok(())
    }

    fn register_listener(&self, sink: LinkSink) -> TransportResult<()> {
        *self.inner.sink.lock().unwrap() = Some(sink);
        Ok(())
    }

    fn remove_listener(&self) {
        self.inner.sink.lock().unwrap().take();
    }

    async fn send(&self, frame: &[u8]) -> TransportResult<()> {
        for event in self.record(frame)? {
            self.deliver(event);
        }
        Ok(())
    }

    async fn teardown(&self) {
        self.inner.teardowns.fetch_add(1, Ordering::SeqCst);
    }
}

/// Encoded handshake frame
pub fn handshake(count: u32, version: u32) -> Vec<u8> {
    Handshake { count, version }.encode().unwrap()
}

/// Link event carrying an encoded file reply
pub fn reply(reply: FileReply) -> LinkEvent {
    LinkEvent::Message(reply.encode().unwrap())
}

pub fn send_failed() -> TransportError {
    TransportError::SendFailed("link busy".into())
}

/// Let spawned tasks drain their queues
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Poll `condition` on virtual time until it holds
pub async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..100_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("condition never held");
}
