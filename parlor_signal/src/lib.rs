// parlor_signal — rendezvous and relay server for Parlor lobbies.
//
// Peers register under a name (the host under its derived lobby id, clients
// anonymously), dial each other by name, and exchange link payloads through
// the server. It is the TCP stand-in for a WebRTC signaling service plus
// TURN relay: the server never interprets lobby messages, it only routes
// opaque strings between the two ends of a link.
//
// Module overview:
// - `registry.rs`: peer-id registry and link table, plus the write halves of
//                  every client connection. Driven by `server.rs`.
// - `server.rs`:   TCP listener, reader threads (one per client), and the
//                  single-threaded main loop that owns the `Registry`.
//
// Dependencies: `parlor_protocol` for the wire messages and framing. The
// client side of this protocol is `parlor_net::TcpBackend`.
//
// The server can run standalone (`main.rs`) or be embedded via
// `start_signal_server`, which is how the integration tests use it.

pub mod registry;
pub mod server;

pub use server::{SignalConfig, SignalHandle, start_signal_server};
