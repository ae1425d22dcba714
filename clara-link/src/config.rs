//! Link timing and limits.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default reconnect delay for the first attempt.
pub const DEFAULT_INITIAL_DELAY_MS: u64 = 1_000;
/// Backoff ceiling.
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
/// How long a never-connected endpoint may stay `initial_connecting`.
pub const DEFAULT_GRACE_MS: u64 = 10_000;
/// How long a dropped connection may stay `reconnecting`.
pub const DEFAULT_DEBOUNCE_MS: u64 = 4_000;
/// Transport connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;
/// Inbound text frame size limit (16 MiB). Greeting audio arrives inline
/// as base64, so frames are routinely a few hundred KiB.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 16 << 20;

/// Settings for the connection manager and its transport.
///
/// Every field has a default, so a partial `[link]` table deserializes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub grace_ms: u64,
    pub debounce_ms: u64,
    /// Close connections nobody has been subscribed to for this long.
    /// `None` keeps them open indefinitely.
    pub idle_timeout_ms: Option<u64>,
    pub connect_timeout_ms: u64,
    pub max_frame_bytes: usize,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: DEFAULT_INITIAL_DELAY_MS,
            max_delay_ms: DEFAULT_MAX_DELAY_MS,
            grace_ms: DEFAULT_GRACE_MS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            idle_timeout_ms: None,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl LinkConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_table_uses_defaults() {
        let cfg: LinkConfig = serde_json::from_str(r#"{"debounce_ms": 1500}"#).unwrap();
        assert_eq!(cfg.debounce(), Duration::from_millis(1500));
        assert_eq!(cfg.grace_ms, DEFAULT_GRACE_MS);
        assert_eq!(cfg.idle_timeout(), None);
    }

    #[test]
    fn test_debounce_shorter_than_grace() {
        let cfg = LinkConfig::default();
        assert!(cfg.debounce() < cfg.grace());
        assert!(cfg.initial_delay() < cfg.max_delay());
    }
}
