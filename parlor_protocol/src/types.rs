// Core identity types for Parlor lobbies.
//
// These are shared by the lobby roster (`message.rs`), the connection manager
// in `parlor_net`, and the signal server in `parlor_signal`. Player ids are
// plain strings chosen by the peers themselves ("host", "player-<millis>");
// connection ids are assigned by whichever signaling backend created the link.
//
// The host peer id is derived from `(game_id, match_id)` so every client that
// dials the same pair lands on the same rendezvous name. Only the game id is
// sanitized; match ids are issued by the backend and already URL-safe.

use serde::{Deserialize, Serialize};

/// Roster id the host always uses for itself.
pub const HOST_PLAYER_ID: &str = "host";

/// Which side of the star topology a participant occupies. Fixed for the
/// lifetime of a lobby.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerRole {
    Host,
    Client,
}

impl PeerRole {
    pub fn is_host(self) -> bool {
        self == PeerRole::Host
    }
}

/// Backend-assigned id for one peer-to-peer link. Unique within a single
/// backend (or signal server) instance, never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Public roster entry for one lobby participant.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LobbyPlayer {
    pub id: String,
    pub name: String,
    pub is_host: bool,
    pub is_ready: bool,
}

impl LobbyPlayer {
    /// The host's own roster record. Hosts are always ready.
    pub fn host(name: impl Into<String>) -> Self {
        Self {
            id: HOST_PLAYER_ID.into(),
            name: name.into(),
            is_host: true,
            is_ready: true,
        }
    }

    /// A client's own roster record, keyed by the given unix-millis timestamp.
    pub fn client(name: impl Into<String>, joined_at_ms: u64) -> Self {
        Self {
            id: format!("player-{joined_at_ms}"),
            name: name.into(),
            is_host: false,
            is_ready: false,
        }
    }
}

/// Replace every character outside `[A-Za-z0-9]` with `-`.
pub fn sanitize_game_id(game_id: &str) -> String {
    game_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}

/// Rendezvous id the host registers under and clients dial:
/// `lobby-<sanitized game id>-<match id>`.
pub fn host_peer_id(game_id: &str, match_id: &str) -> String {
    format!("lobby-{}-{}", sanitize_game_id(game_id), match_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_id_for_plain_game() {
        assert_eq!(host_peer_id("trivia", "ABC123"), "lobby-trivia-ABC123");
    }

    #[test]
    fn host_id_sanitizes_game_id_only() {
        assert_eq!(
            host_peer_id("tic tac/toe.v2", "m_1"),
            "lobby-tic-tac-toe-v2-m_1"
        );
    }

    #[test]
    fn sanitize_replaces_non_ascii() {
        assert_eq!(sanitize_game_id("échecs"), "-checs");
    }

    #[test]
    fn host_id_is_deterministic() {
        assert_eq!(host_peer_id("go", "X9"), host_peer_id("go", "X9"));
    }

    #[test]
    fn client_record_uses_timestamp_id() {
        let p = LobbyPlayer::client("Cleo", 1_700_000_000_123);
        assert_eq!(p.id, "player-1700000000123");
        assert!(!p.is_host);
        assert!(!p.is_ready);
    }
}
