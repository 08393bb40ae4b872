// parlor_protocol — wire types shared by every Parlor crate.
//
// This crate defines the roster messages peers exchange over data channels,
// the rendezvous messages spoken to the signal server, and the framing used on
// the signal server's TCP links. It has no networking code of its own and no
// dependency on the state store or the connection manager.
//
// Module overview:
// - `types.rs`:    `PeerRole`, `LobbyPlayer`, `ConnId`, and host-id derivation.
// - `message.rs`:  `LobbyMessage` (peer ↔ peer) and `SignalRequest` /
//                  `SignalResponse` (peer ↔ signal server).
// - `framing.rs`:  4-byte big-endian length prefix, then JSON payload.
//
// Design decisions:
// - **JSON everywhere.** Browser peers speak JSON on their data channels, so
//   the lobby envelope format is fixed; the signal server reuses serde_json
//   rather than adding a second encoding.
// - **Closed enums.** Every message kind is an enum variant matched
//   exhaustively by receivers; there is no string-keyed dispatch.

pub mod framing;
pub mod message;
pub mod types;

pub use framing::{MAX_MESSAGE_SIZE, read_json, read_message, write_json, write_message};
pub use message::{LobbyMessage, RejectReason, SignalRequest, SignalResponse};
pub use types::{ConnId, HOST_PLAYER_ID, LobbyPlayer, PeerRole, host_peer_id, sanitize_game_id};
