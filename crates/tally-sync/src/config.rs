//! Session tuning knobs.
//!
//! Every blocking point in the engine — connection establishment, the
//! hello exchange, asset requests, flush acknowledgement — carries an
//! explicit timeout on the order of seconds, never an indefinite wait.

use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Tuning knobs for a [`crate::session::Session`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Wait for the peer's hello during the handshake.
    #[serde(default = "default_hello_timeout_ms")]
    pub hello_timeout_ms: u64,
    /// Dial attempts before surfacing a connection failure.
    #[serde(default = "default_connect_attempts")]
    pub connect_attempts: u32,
    /// Base backoff between dial attempts; doubles per attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Per-peer wait for an asset response.
    #[serde(default = "default_asset_timeout_ms")]
    pub asset_timeout_ms: u64,
    /// Debounce between coalesced store flushes.
    #[serde(default = "default_flush_debounce_ms")]
    pub flush_debounce_ms: u64,
    /// Wait for a forced flush to be acknowledged.
    #[serde(default = "default_flush_timeout_ms")]
    pub flush_timeout_ms: u64,
    /// Receive poll interval on an idle link.
    #[serde(default = "default_idle_recv_ms")]
    pub idle_recv_ms: u64,
}

fn default_hello_timeout_ms() -> u64 {
    5_000
}

fn default_connect_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    500
}

fn default_asset_timeout_ms() -> u64 {
    5_000
}

fn default_flush_debounce_ms() -> u64 {
    250
}

fn default_flush_timeout_ms() -> u64 {
    5_000
}

fn default_idle_recv_ms() -> u64 {
    1_000
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            hello_timeout_ms: default_hello_timeout_ms(),
            connect_attempts: default_connect_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            asset_timeout_ms: default_asset_timeout_ms(),
            flush_debounce_ms: default_flush_debounce_ms(),
            flush_timeout_ms: default_flush_timeout_ms(),
            idle_recv_ms: default_idle_recv_ms(),
        }
    }
}

impl SessionConfig {
    /// Parse from a TOML string; missing keys fall back to defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML does not parse.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).context("parse session config")
    }

    /// A config with near-zero waits, for tests.
    #[must_use]
    pub fn fast() -> Self {
        Self {
            hello_timeout_ms: 500,
            connect_attempts: 2,
            backoff_base_ms: 10,
            asset_timeout_ms: 300,
            flush_debounce_ms: 10,
            flush_timeout_ms: 2_000,
            idle_recv_ms: 50,
        }
    }

    /// Hello-exchange timeout.
    #[must_use]
    pub const fn hello_timeout(&self) -> Duration {
        Duration::from_millis(self.hello_timeout_ms)
    }

    /// Backoff before dial attempt `attempt` (0-based), doubling per try.
    #[must_use]
    pub const fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms << attempt.saturating_sub(1))
    }

    /// Per-peer asset-response timeout.
    #[must_use]
    pub const fn asset_timeout(&self) -> Duration {
        Duration::from_millis(self.asset_timeout_ms)
    }

    /// Store flush debounce.
    #[must_use]
    pub const fn flush_debounce(&self) -> Duration {
        Duration::from_millis(self.flush_debounce_ms)
    }

    /// Forced-flush acknowledgement timeout.
    #[must_use]
    pub const fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }

    /// Idle receive poll interval.
    #[must_use]
    pub const fn idle_recv(&self) -> Duration {
        Duration::from_millis(self.idle_recv_ms)
    }
}
