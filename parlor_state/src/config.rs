// Session Persistence configuration.
//
// Loaded from JSON like every other Parlor config; fields left out of the
// JSON fall back to `Default`.

use serde::{Deserialize, Serialize};

/// One day, in milliseconds.
pub const DEFAULT_SESSION_TTL_MS: u64 = 24 * 60 * 60 * 1000;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Key prefix; sessions live under `"<namespace>:<matchID>"`.
    pub namespace: String,
    /// A session is dead once `now - updatedAt` exceeds this.
    pub ttl_ms: u64,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            namespace: "parlor-session".into(),
            ttl_ms: DEFAULT_SESSION_TTL_MS,
        }
    }
}

impl PersistConfig {
    pub fn from_json_str(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}
