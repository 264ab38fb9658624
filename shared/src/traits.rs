//! # Transport Trait & Link Abstractions
//!
//! This module defines the trait that abstracts the vendor wearable-messaging
//! link. The vendor SDK lives on the Kotlin side of the app; the Rust core only
//! sees these primitives:
//!
//! - **Link setup**: discover the band, authenticate, launch the band app
//! - **Inbound**: a listener sink that receives raw frames and link loss
//! - **Outbound**: send one raw frame and wait for the link's acknowledgment
//!
//! ## Design Rationale
//!
//! The `Transport` trait enables:
//! 1. **Testability**: A scripted band can stand in for the real device
//! 2. **Flexibility**: The JNI transport and host-side simulators share one session
//! 3. **Async Support**: Every vendor call is a suspension point for the session

use core::fmt;
use core::future::Future;

use tokio::sync::mpsc;

/// Identifier of the band node the link is bound to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceId(pub String);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Events delivered by the link to the registered listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// One raw frame from the band
    Message(Vec<u8>),
    /// The link reported the band as gone
    Lost,
}

/// Listener handed to [`Transport::register_listener`]
pub type LinkSink = mpsc::UnboundedSender<LinkEvent>;

/// Errors reported by the vendor link
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No band is paired or reachable
    #[error("no band connected")]
    NoDevice,
    /// Authorization was refused
    #[error("authorization failed: {0}")]
    AuthFailed(String),
    /// The band app is not installed
    #[error("band app is not installed")]
    AppNotInstalled,
    /// The band app could not be launched
    #[error("failed to launch band app: {0}")]
    LaunchFailed(String),
    /// The link refused or lost an outbound frame
    #[error("send failed: {0}")]
    SendFailed(String),
    /// The link was torn down or never set up
    #[error("link not connected")]
    NotConnected,
    /// Any other vendor failure
    #[error("{0}")]
    Other(String),
}

/// Result type alias for link operations
pub type TransportResult<T> = Result<T, TransportError>;

/// The vendor wearable-messaging link.
///
/// Implementations must tolerate calls racing with [`Transport::teardown`]:
/// a send against a torn-down link returns [`TransportError::NotConnected`]
/// rather than panicking.
///
/// # Example
///
/// ```ignore
/// async fn open<T: Transport>(link: &T, sink: LinkSink) -> TransportResult<DeviceId> {
///     let node = link.connect().await?;
///     link.auth().await?;
///     if !link.query_remote_app_installed().await? {
///         return Err(TransportError::AppNotInstalled);
///     }
///     link.open_remote_app().await?;
///     link.register_listener(sink)?;
///     Ok(node)
/// }
/// ```
pub trait Transport: Send + Sync + 'static {
    /// Discover the band and bind the link to it
    fn connect(&self) -> impl Future<Output = TransportResult<DeviceId>> + Send;

    /// Request the permissions the link needs
    fn auth(&self) -> impl Future<Output = TransportResult<()>> + Send;

    /// Whether the band app is installed on the bound band
    fn query_remote_app_installed(&self) -> impl Future<Output = TransportResult<bool>> + Send;

    /// Launch the band app
    fn open_remote_app(&self) -> impl Future<Output = TransportResult<()>> + Send;

    /// Route inbound frames to `sink`, replacing any previous listener
    fn register_listener(&self, sink: LinkSink) -> TransportResult<()>;

    /// Stop routing inbound frames
    fn remove_listener(&self);

    /// Send one raw frame and wait for the link's acknowledgment
    fn send(&self, frame: &[u8]) -> impl Future<Output = TransportResult<()>> + Send;

    /// Release the link. Safe to call repeatedly.
    fn teardown(&self) -> impl Future<Output = ()> + Send;
}
