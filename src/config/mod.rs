//! Engine configuration — `config.toml` plus CLI/env overrides.
//!
//! Every section tolerates being absent: `#[serde(default)]` everywhere, so
//! an empty file (or none at all) yields a fully working default config.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryConfig;

const DEFAULT_STREAM_URL: &str = "wss://api.taskdeck.io/events/ws";
const DEFAULT_API_BASE_URL: &str = "https://api.taskdeck.io";
const DEFAULT_INITIAL_DELAY_MS: u64 = 2_000;
const DEFAULT_MAX_DELAY_MS: u64 = 60_000;
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;
const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_QUEUE_CAPACITY: usize = 256;

// ─── ChannelConfig ───────────────────────────────────────────────────────────

/// Sync channel tuning (`[channel]` in config.toml).
///
/// The reconnect curve: sleep `initial_delay_ms`, multiply by `multiplier`
/// per failure, cap at `max_delay_ms`. After `max_attempts` consecutive
/// failures the channel reports `offline` and keeps probing at the cap.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// Delay before the first reconnect attempt (default: 2000 ms).
    pub initial_delay_ms: u64,
    /// Upper bound on the reconnect delay (default: 60000 ms).
    pub max_delay_ms: u64,
    /// Backoff multiplier per consecutive failure (default: 2.0).
    pub multiplier: f64,
    /// Consecutive failures before the channel reports `offline`
    /// (default: 10).
    pub max_attempts: u32,
    /// Capacity of each in-order delivery queue (default: 256).
    pub queue_capacity: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ChannelConfig {
    /// The channel's backoff curve as a [`RetryConfig`].
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            multiplier: self.multiplier,
        }
    }
}

// ─── LogConfig ───────────────────────────────────────────────────────────────

/// Logging configuration (`[log]` in config.toml).
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log filter (default: "info"). Overridden by `DECKD_LOG`.
    pub level: Option<String>,
    /// Write logs to this file (rotated daily) in addition to stderr.
    pub file: Option<PathBuf>,
    /// Emit JSON log lines instead of human-readable ones (default: false).
    pub json: bool,
}

// ─── SyncConfig ──────────────────────────────────────────────────────────────

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SyncConfig {
    /// WebSocket push stream URL.
    pub stream_url: String,
    /// Base URL of the TaskDeck REST API (full-refresh fetches).
    pub api_base_url: String,
    pub channel: ChannelConfig,
    pub log: LogConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            stream_url: DEFAULT_STREAM_URL.to_string(),
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            channel: ChannelConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Load from a TOML file; `None` (or a missing file) means defaults.
    ///
    /// Runs before tracing is initialized, so it stays silent — the caller
    /// logs what was loaded.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&raw)?)
    }
}
