//! # Shared Protocol Library
//!
//! This crate provides the core abstractions for talking to the band over the
//! vendor wearable-messaging link:
//!
//! - **Protocol Messages**: Tagged JSON frames for the handshake and file transfer
//! - **Transport Trait**: Abstraction over the vendor link primitives
//! - **Text Chunker**: Charset detection and surrogate-safe UTF-16 windows
//!
//! ## Architecture
//!
//! ```text
//! Book bytes ──► decode_text ──► split_text ──► DataChunk frames ──► Transport::send
//!                                                                        │
//!                                                              (size-limited link)
//!                                                                        │
//! Session / FileSender ◄──── parse_frame ◄──── LinkEvent::Message ◄──────┘
//! ```
//!
//! ## Wire Constants
//!
//! Every constant in this module must match the band application exactly.
//! Changing one of them is a protocol version bump.

pub mod chunk;
pub mod protocol;
pub mod traits;

// Re-export main types for convenience
pub use chunk::{decode_text, resume_chunk, split_text, DecodedText};
pub use protocol::{parse_frame, FileCommand, FileReply, Frame, FrameError, Handshake};
pub use traits::{DeviceId, LinkEvent, LinkSink, Transport, TransportError, TransportResult};

/// Library version, reported in logs by the host bridge
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol version advertised in every handshake probe
pub const PROTOCOL_VERSION: u32 = 2;

/// Oldest band protocol version this phone side can talk to
pub const MIN_REMOTE_VERSION: u32 = 2;

/// Handshake reply window and liveness timeout, in milliseconds
pub const HANDSHAKE_TIMEOUT_MS: u64 = 10_000;

/// Handshake frames stop being answered once the echoed count reaches this value
pub const HANDSHAKE_COUNT_LIMIT: u32 = 3;

/// Size of one transfer chunk in transport-encoded (UTF-16) bytes
pub const CHUNK_SIZE: usize = 20 * 1024;

/// Band storage usage above which transfers are refused
pub const STORAGE_CEILING: u64 = 25 * 1024 * 1024;
