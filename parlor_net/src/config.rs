// Connection manager configuration.
//
// `NetConfig` carries the retry budget, the timeouts, the diagnostic log
// capacity, and the ICE server list. Values are plain milliseconds so the
// struct round-trips through JSON; fields missing from the JSON keep their
// defaults. TURN credentials are sourced externally (typically minted per
// session by the backend service) and are optional.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// TURN relay endpoint plus credentials.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TurnCredentials {
    pub urls: Vec<String>,
    pub username: String,
    pub credential: String,
}

/// ICE servers handed to every peer object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IceConfig {
    pub stun_urls: Vec<String>,
    pub turn: Option<TurnCredentials>,
}

impl Default for IceConfig {
    fn default() -> Self {
        Self {
            stun_urls: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
            turn: None,
        }
    }
}

impl IceConfig {
    /// Whether relay-only mode has anything to relay through.
    pub fn has_relay(&self) -> bool {
        self.turn.as_ref().is_some_and(|t| !t.urls.is_empty())
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Connect attempts per connect loop (the relay restart gets a fresh loop).
    pub max_attempts: u32,
    /// How long one attempt may wait for the signaling service to open.
    pub attempt_timeout_ms: u64,
    /// Retry `n` waits `n * retry_base_delay_ms`.
    pub retry_base_delay_ms: u64,
    /// How long a client waits for its channel to the host to open.
    pub channel_open_timeout_ms: u64,
    /// Entries kept in the diagnostic log.
    pub diagnostic_capacity: usize,
    pub ice: IceConfig,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout_ms: 10_000,
            retry_base_delay_ms: 1_000,
            channel_open_timeout_ms: 20_000,
            diagnostic_capacity: 15,
            ice: IceConfig::default(),
        }
    }
}

impl NetConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    /// Backoff before retry number `attempt` (1-based): linear in the attempt.
    pub fn retry_delay(&self, attempt: u32) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms.saturating_mul(u64::from(attempt)))
    }

    pub fn channel_open_timeout(&self) -> Duration {
        Duration::from_millis(self.channel_open_timeout_ms)
    }
}
