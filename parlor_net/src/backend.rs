// The signaling backend contract.
//
// A backend owns "peer objects": one registration with a signaling service
// plus the links dialed from or accepted by it. The connection manager drives
// the backend through `SignalingBackend` calls and learns about everything
// asynchronous (registration, incoming links, channel open/close, payloads,
// ICE state) from `PeerEvent`s delivered on an mpsc channel created by
// `event_channel()`.
//
// Every peer object is created under a `PeerGeneration` chosen by the caller,
// and every event is tagged with the generation that produced it. When the
// manager destroys a peer (retry, relay restart, teardown) it moves on to a
// new generation, so events still in flight from the old peer are recognizably
// stale and get dropped.
//
// Implementations:
// - `loopback.rs`: in-process network with fault injection (tests).
// - `tcp.rs`:      talks to the `parlor_signal` server over TCP.

use std::sync::mpsc::{self, Receiver, Sender};

use parlor_protocol::ConnId;

use crate::config::IceConfig;
use crate::error::{SignalingError, TransportError};

/// Incarnation number of a peer object. Assigned by the manager, strictly
/// increasing within one manager.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeerGeneration(pub u64);

impl PeerGeneration {
    pub fn next(self) -> PeerGeneration {
        PeerGeneration(self.0 + 1)
    }
}

/// ICE connection state of one link, as browsers report it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceState {
    /// States that mean the path is gone or never came up.
    pub fn is_degraded(self) -> bool {
        matches!(
            self,
            IceState::Disconnected | IceState::Failed | IceState::Closed
        )
    }
}

/// How to create a peer object.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerOptions {
    /// Register under this id, or let the service assign one.
    pub peer_id: Option<String>,
    pub ice: IceConfig,
    /// Force every path through the TURN relay.
    pub relay_only: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PeerEventKind {
    /// Registration succeeded under `peer_id`.
    Open { peer_id: String },
    /// The signaling service reported a failure for this peer.
    Error(SignalingError),
    /// A remote peer dialed us. `ChannelOpen` follows once the link is up.
    Incoming { conn: ConnId, remote_peer: String },
    ChannelOpen { conn: ConnId },
    Data { conn: ConnId, payload: String },
    ChannelClosed { conn: ConnId },
    IceState { conn: ConnId, state: IceState },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PeerEvent {
    pub generation: PeerGeneration,
    pub kind: PeerEventKind,
}

impl PeerEvent {
    pub fn new(generation: PeerGeneration, kind: PeerEventKind) -> Self {
        Self { generation, kind }
    }
}

/// Channel a backend reports events on. The sender goes to the backend, the
/// receiver to the `ConnectionManager`.
pub fn event_channel() -> (Sender<PeerEvent>, Receiver<PeerEvent>) {
    mpsc::channel()
}

/// Operations the connection manager needs from a signaling service and the
/// transport behind it. Calls never block on the network; outcomes arrive as
/// `PeerEvent`s.
pub trait SignalingBackend {
    /// Create the peer object for `generation` and start registering it.
    /// Reports `Open` or `Error` when registration settles, or nothing at all
    /// if the service never answers.
    fn open_peer(&mut self, generation: PeerGeneration, options: PeerOptions);

    /// Dial `remote_peer` from an open peer. The returned id names the local
    /// end of the link; `ChannelOpen`, `IceState` or
    /// `Error(PeerUnavailable)` follow.
    fn connect(
        &mut self,
        generation: PeerGeneration,
        remote_peer: &str,
    ) -> Result<ConnId, TransportError>;

    /// Send one payload on an open link.
    fn send(&mut self, conn: ConnId, payload: &str) -> Result<(), TransportError>;

    /// Close one link. Unknown or already-closed links are ignored.
    fn close(&mut self, conn: ConnId);

    /// Tear down the peer object and every link it owns. Idempotent.
    fn destroy_peer(&mut self, generation: PeerGeneration);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degraded_states() {
        let degraded: Vec<IceState> = [
            IceState::New,
            IceState::Checking,
            IceState::Connected,
            IceState::Completed,
            IceState::Disconnected,
            IceState::Failed,
            IceState::Closed,
        ]
        .into_iter()
        .filter(|s| s.is_degraded())
        .collect();
        assert_eq!(
            degraded,
            vec![IceState::Disconnected, IceState::Failed, IceState::Closed]
        );
    }

    #[test]
    fn generations_increase() {
        let g = PeerGeneration(4);
        assert!(g.next() > g);
        assert_eq!(g.next(), PeerGeneration(5));
    }
}
