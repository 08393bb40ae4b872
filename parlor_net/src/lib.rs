// parlor_net — the lobby connection manager.
//
// Builds a star of peer-to-peer links (host plus N clients) through a
// signaling service, falls back to relay-only transport once when the direct
// path fails, and keeps a shared roster consistent by exchanging
// `LobbyMessage`s over the links.
//
// Module overview:
// - `manager.rs`:     `ConnectionManager`, the event/timer-driven state
//                     machine, plus `LobbyRequest` and `LobbyNotification`.
// - `backend.rs`:     `SignalingBackend` trait and the `PeerEvent` contract.
// - `loopback.rs`:    in-process network with fault injection.
// - `tcp.rs`:         backend speaking to the `parlor_signal` server.
// - `roster.rs`:      id-keyed, last-writer-wins player list.
// - `timers.rs`:      deadline bookkeeping for retries and timeouts.
// - `diagnostics.rs`: bounded, human-readable event log for the UI.
// - `config.rs`:      `NetConfig` / `IceConfig` / `TurnCredentials`.
// - `error.rs`:       `SignalingError`, `TransportError`, `LobbyError`.
//
// Design decisions:
// - **Sans-IO core.** The manager never blocks or sleeps on its own; it
//   reacts to events and explicit `Instant`s. `pump()` adds a blocking driver
//   on top, and tests call `handle_event` / `fire_timers` directly.
// - **Backend is an owned object.** No global signaling client; each manager
//   owns its backend and the only channel that backend reports on.
// - **Generations, not callbacks.** Destroyed peers can't be unsubscribed from
//   in-flight events, so every event carries the generation of its peer and
//   stale ones are dropped at the door.

pub mod backend;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod loopback;
pub mod manager;
pub mod roster;
pub mod tcp;
pub mod timers;

pub use backend::{
    IceState, PeerEvent, PeerEventKind, PeerGeneration, PeerOptions, SignalingBackend,
    event_channel,
};
pub use config::{IceConfig, NetConfig, TurnCredentials};
pub use diagnostics::{DiagnosticEntry, Diagnostics};
pub use error::{LobbyError, SignalingError, TransportError};
pub use loopback::{LoopbackBackend, LoopbackNetwork};
pub use manager::{ConnectionManager, ConnectionState, LobbyNotification, LobbyRequest};
pub use roster::Roster;
pub use tcp::TcpBackend;

impl ConnectionManager {
    /// Manager attached to a fresh endpoint on `network`.
    pub fn on_loopback(network: &LoopbackNetwork, config: NetConfig) -> Self {
        let (backend, events) = network.backend();
        Self::new(Box::new(backend), events, config)
    }

    /// Manager talking to the signal server at `server_addr`.
    pub fn over_tcp(server_addr: &str, config: NetConfig) -> Self {
        let (backend, events) = TcpBackend::new(server_addr);
        Self::new(Box::new(backend), events, config)
    }
}
