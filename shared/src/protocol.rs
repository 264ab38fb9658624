//! # Protocol Message Definitions
//!
//! This module defines the frames exchanged with the band application.
//! Frames are UTF-8 JSON objects sent through the vendor link's byte-message
//! primitive. Every frame carries a `tag` used for demultiplexing.
//!
//! ## Frame Format
//!
//! ```text
//! {"tag":"__hs__","count":0,"version":2}                        handshake
//! {"tag":"file","type":"data","count":4,"data":"...","setCount":4}   file transfer
//! ```
//!
//! ## Message Families
//!
//! - **Handshake** (`__hs__`): version exchange, at most three frames per round
//! - **File** (`file`): transfer commands (phone → band) and replies (band → phone)
//!
//! Unknown fields are ignored on decode so that newer band builds can extend
//! frames without breaking older phones.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{HANDSHAKE_COUNT_LIMIT, MIN_REMOTE_VERSION, PROTOCOL_VERSION};

/// Tag carried by handshake frames
pub const HANDSHAKE_TAG: &str = "__hs__";

/// Tag carried by file transfer frames
pub const FILE_TAG: &str = "file";

/// Largest frame accepted by the link, in bytes
pub const MAX_FRAME_LEN: usize = 128 * 1024;

/// Handshake frame body
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handshake {
    /// Position in the exchange (0 for the initial probe)
    pub count: u32,
    /// Protocol version of the sender
    pub version: u32,
}

impl Handshake {
    /// The initial probe sent by the phone
    pub const fn probe() -> Self {
        Self {
            count: 0,
            version: PROTOCOL_VERSION,
        }
    }

    /// The frame to answer with, or `None` once the exchange is complete
    pub fn reply(&self) -> Option<Self> {
        let count = self.count.saturating_add(1);
        (count < HANDSHAKE_COUNT_LIMIT).then_some(Self {
            count,
            version: PROTOCOL_VERSION,
        })
    }

    /// Whether the sender has already seen one of our frames
    pub fn is_echo(&self) -> bool {
        self.count > 0
    }

    /// Whether the sender's version is one we support
    pub fn is_compatible(&self) -> bool {
        self.version >= MIN_REMOTE_VERSION
    }

    /// Serialize to a tagged wire frame
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode_tagged(HANDSHAKE_TAG, self)
    }
}

/// Commands sent from the phone to the band
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileCommand {
    /// Begin a new or resumed transfer
    Start {
        filename: String,
        /// Index of the last chunk
        total: u32,
        #[serde(rename = "chunkSize")]
        chunk_size: u32,
    },
    /// Deliver chunk `count`
    Data {
        count: u32,
        data: String,
        /// Present on resends: reset the band's cursor to this index
        #[serde(rename = "setCount", default, skip_serializing_if = "Option::is_none")]
        set_count: Option<u32>,
    },
    /// Abort the transfer in flight
    Cancel,
    /// Ask the band for its storage usage
    Usage,
}

impl FileCommand {
    /// Serialize to a tagged wire frame
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode_tagged(FILE_TAG, self)
    }

    /// Parse a command frame (band side)
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        decode_tagged(bytes, FILE_TAG)
    }
}

/// Replies sent from the band to the phone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum FileReply {
    /// Band is ready. `found` with a `length` means a partial file of that many bytes exists.
    Ready {
        #[serde(default)]
        found: bool,
        #[serde(default)]
        usage: u64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        length: Option<u64>,
    },
    /// Band rejected a chunk; resend starting at `count`
    Error {
        #[serde(default)]
        message: String,
        count: u32,
    },
    /// Band accepted chunk `count`
    Next {
        #[serde(default)]
        message: String,
        count: u32,
    },
    /// Transfer complete
    Success {
        #[serde(default)]
        message: String,
        #[serde(default)]
        count: u32,
    },
    /// Band aborted the transfer
    Cancel,
    /// Any reply type this build does not know about
    #[serde(other)]
    Unknown,
}

impl FileReply {
    /// Serialize to a tagged wire frame (band side)
    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        encode_tagged(FILE_TAG, self)
    }

    /// Parse a reply frame
    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        decode_tagged(bytes, FILE_TAG)
    }

    /// Interpret the body of an already demultiplexed frame
    pub fn from_value(body: Value) -> Result<Self, FrameError> {
        Ok(serde_json::from_value(body)?)
    }
}

/// An inbound frame after demultiplexing on its tag
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Handshake frame, consumed by the session layer
    Handshake(Handshake),
    /// Any other tag, routed to the application layer
    Application {
        tag: String,
        body: Value,
    },
}

impl Frame {
    /// The frame's tag
    pub fn tag(&self) -> &str {
        match self {
            Frame::Handshake(_) => HANDSHAKE_TAG,
            Frame::Application { tag, .. } => tag,
        }
    }
}

/// Parse raw link bytes into a demultiplexed frame
pub fn parse_frame(bytes: &[u8]) -> Result<Frame, FrameError> {
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len: bytes.len(),
            max: MAX_FRAME_LEN,
        });
    }
    let body: Value = serde_json::from_slice(bytes)?;
    let tag = body
        .get("tag")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingTag)?
        .to_owned();

    if tag == HANDSHAKE_TAG {
        return Ok(Frame::Handshake(serde_json::from_value(body)?));
    }
    Ok(Frame::Application { tag, body })
}

/// Wrapper adding the `tag` field next to a flattened body
#[derive(Serialize)]
struct Tagged<'a, T: Serialize> {
    tag: &'a str,
    #[serde(flatten)]
    body: &'a T,
}

fn encode_tagged<T: Serialize>(tag: &str, body: &T) -> Result<Vec<u8>, FrameError> {
    let bytes = serde_json::to_vec(&Tagged { tag, body })?;
    if bytes.len() > MAX_FRAME_LEN {
        return Err(FrameError::TooLarge {
            len: bytes.len(),
            max: MAX_FRAME_LEN,
        });
    }
    Ok(bytes)
}

fn decode_tagged<T: DeserializeOwned>(bytes: &[u8], expected: &'static str) -> Result<T, FrameError> {
    match parse_frame(bytes)? {
        Frame::Application { tag, body } if tag == expected => Ok(serde_json::from_value(body)?),
        other => Err(FrameError::UnexpectedTag {
            expected,
            found: other.tag().to_owned(),
        }),
    }
}

/// Errors during frame encoding/decoding
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// Bytes were not a JSON object of the expected shape
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    /// Frame carried no `tag` field
    #[error("frame has no tag")]
    MissingTag,
    /// Frame belongs to another message family
    #[error("expected tag {expected:?}, found {found:?}")]
    UnexpectedTag { expected: &'static str, found: String },
    /// Frame exceeds the link's message size ceiling
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    TooLarge { len: usize, max: usize },
}
