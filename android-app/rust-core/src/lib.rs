//! # BandBook Android Rust Core
//!
//! Native backend of the BandBook companion app. It keeps a logical session
//! with the band over the vendor wearable link and pushes book text to it in
//! resumable chunks.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Android App (Kotlin)                       │
//! │                                                                 │
//! │  ┌─────────────────┐     ┌──────────────────────────────────┐  │
//! │  │  BookshelfView  │────►│   BandLink (vendor SDK wrapper)  │  │
//! │  └─────────────────┘     └──────────────────────────────────┘  │
//! │          │ RustBridge.*              ▲ calls      │ onMessage   │
//! │          ▼                           │            ▼             │
//! │  ┌──────────────────────────────────────────────────────────┐  │
//! │  │                 bandbook_core (this lib)                  │  │
//! │  │                                                           │  │
//! │  │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────┐   │  │
//! │  │  │ FileSender  │─►│   Session   │─►│  JniTransport   │   │  │
//! │  │  │ (transfer)  │  │ (handshake) │  │  (BandLink)     │   │  │
//! │  │  └─────────────┘  └─────────────┘  └─────────────────┘   │  │
//! │  └──────────────────────────────────────────────────────────┘  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## JNI Functions Exported
//!
//! - `Java_com_bandbook_sync_RustBridge_init`: Create a context, returns a handle
//! - `Java_com_bandbook_sync_RustBridge_connect` / `disconnect`: Session control
//! - `Java_com_bandbook_sync_RustBridge_pushBook` / `cancel`: Transfers
//! - `Java_com_bandbook_sync_RustBridge_onMessage` / `onLinkLost`: Inbound link events
//! - `Java_com_bandbook_sync_RustBridge_pollEvent`: Drain events as JSON

pub mod bridge;
pub mod config;
pub mod context;
pub mod error;
pub mod events;
pub mod jni_transport;
pub mod logging;
pub mod session;
pub mod transfer;

#[cfg(test)]
mod mock;

pub use config::SyncConfig;
pub use context::ConnectionContext;
pub use error::{CoreError, Result};
pub use events::{DisconnectReason, Event, EventHub, SessionEvent, TransferEvent};
pub use jni_transport::JniTransport;
pub use session::{AppMessage, Phase, Session};
pub use transfer::{progress_status, Book, CancelSource, FileSender, TransferOutcome};
