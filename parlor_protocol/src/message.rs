// Protocol messages for Parlor lobbies.
//
// Two vocabularies live here:
// - `LobbyMessage`: the roster protocol peers exchange over a data channel
//   once a link is up. Serialized as internally-tagged JSON
//   (`{"type":"player-info",...}`) so the envelope matches what browser peers
//   send.
// - `SignalRequest` / `SignalResponse`: the rendezvous protocol spoken between
//   a `TcpBackend` and the `parlor_signal` server. The server relays data
//   channel payloads verbatim and never parses them.
//
// Payloads are carried as `String` because data channels deliver the lobby
// envelopes as JSON text.

use serde::{Deserialize, Serialize};

use crate::types::{ConnId, LobbyPlayer};

/// Roster message exchanged between peers over a reliable, ordered channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum LobbyMessage {
    /// Upsert this player into the receiver's roster.
    PlayerInfo { player: LobbyPlayer },
    /// Remove this player id from the receiver's roster.
    PlayerLeft {
        #[serde(rename = "playerId")]
        player_id: String,
    },
    /// Host has started the match.
    StartGame,
}

impl LobbyMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Why the signal server refused a registration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RejectReason {
    /// Another peer already holds the requested id.
    IdTaken,
    /// The server could not complete the request.
    ServerError,
}

/// Messages sent by a peer to the signal server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalRequest {
    /// Register on the server. `peer_id: None` asks for a server-assigned id.
    Register { peer_id: Option<String> },
    /// Open a link to `target`. `request` is echoed back so the caller can
    /// match the reply to its dial.
    Connect { request: u64, target: String },
    /// Deliver a payload over an open link.
    Send { conn: ConnId, payload: String },
    /// Close one link.
    Close { conn: ConnId },
    /// Unregister and drop every link.
    Goodbye,
}

/// Messages sent by the signal server to a peer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalResponse {
    /// Registration accepted under this id.
    Registered { peer_id: String },
    /// Registration refused.
    Rejected { reason: RejectReason },
    /// A dial succeeded; the link is open on both ends.
    ConnectOk { request: u64, conn: ConnId },
    /// Nobody is registered under `target` (yet).
    PeerUnavailable { request: u64, target: String },
    /// Another peer opened a link to us.
    Incoming { conn: ConnId, from: String },
    /// Payload received on a link.
    Data { conn: ConnId, payload: String },
    /// The far end closed the link (or went away).
    Closed { conn: ConnId },
}
