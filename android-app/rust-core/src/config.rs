//! Sync configuration handed over by the app as JSON.
//!
//! Every field is optional in the JSON; missing fields take the protocol
//! defaults from the shared crate.

use std::str::FromStr;
use std::time::Duration;

use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Configuration for one connection context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Handshake reply window and liveness timeout
    pub handshake_timeout_ms: u64,
    /// Chunk size in UTF-16 bytes
    pub chunk_size: usize,
    /// Band storage usage above which transfers are refused
    pub storage_ceiling: u64,
    /// Time given to the band app to finish launching before `start`
    pub launch_delay_ms: u64,
    /// How long to wait for the band's answer to `usage` before starting anyway
    pub usage_reply_timeout_ms: u64,
    /// Consecutive `error` replies tolerated before giving up (`None` = never)
    pub max_consecutive_rejections: Option<u32>,
    /// Characters of the current chunk shown in progress updates
    pub preview_chars: usize,
    /// Upper bound on the best-effort `cancel` send
    pub cancel_send_timeout_ms: u64,
    /// Logcat level: off, error, warn, info, debug or trace
    pub log_level: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: shared::HANDSHAKE_TIMEOUT_MS,
            chunk_size: shared::CHUNK_SIZE,
            storage_ceiling: shared::STORAGE_CEILING,
            launch_delay_ms: 1_000,
            usage_reply_timeout_ms: 5_000,
            max_consecutive_rejections: Some(16),
            preview_chars: 40,
            cancel_send_timeout_ms: 2_000,
            log_level: "debug".into(),
        }
    }
}

impl SyncConfig {
    /// Parse and validate a JSON config. An empty string yields the defaults.
    pub fn from_json(json: &str) -> Result<Self> {
        if json.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self =
            serde_json::from_str(json).map_err(|e| CoreError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the protocol cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.chunk_size < 4 || self.chunk_size % 2 != 0 {
            return Err(CoreError::Config(format!(
                "chunk_size must be an even number of bytes >= 4, got {}",
                self.chunk_size
            )));
        }
        if self.handshake_timeout_ms == 0 {
            return Err(CoreError::Config("handshake_timeout_ms must be positive".into()));
        }
        self.log_filter()?;
        Ok(())
    }

    /// Handshake reply window, also the liveness timeout once connected
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Pause before `start` while the band app launches
    pub fn launch_delay(&self) -> Duration {
        Duration::from_millis(self.launch_delay_ms)
    }

    pub fn usage_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.usage_reply_timeout_ms)
    }

    pub fn cancel_send_timeout(&self) -> Duration {
        Duration::from_millis(self.cancel_send_timeout_ms)
    }

    /// Parsed `log_level`
    pub fn log_filter(&self) -> Result<LevelFilter> {
        LevelFilter::from_str(&self.log_level)
            .map_err(|_| CoreError::Config(format!("unknown log level {:?}", self.log_level)))
    }
}
