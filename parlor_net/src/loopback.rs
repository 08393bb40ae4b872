// In-process signaling service and network.
//
// `LoopbackNetwork` stands in for a signaling server plus the internet
// between browsers. Every `LoopbackBackend` handed out by `backend()` is one
// endpoint (one "browser"); its events arrive on the receiver returned
// alongside it. Links are delivered instantly and in order.
//
// Fault injection, all toggled on the shared network:
// - `set_direct_blocked`: direct paths fail ICE. A link then only comes up
//   if one side is in relay-only mode *and* has TURN credentials.
// - `set_signaling_silent`: `open_peer` never answers (attempt timeouts).
// - `fail_next_open`: queue a signaling error for the next `open_peer`.
// - `set_channel_stall`: links come up at the ICE level but their data
//   channels never open (channel-open timeouts).
// - `break_link`: an established link loses its path; both ends see ICE
//   `Disconnected` followed by a channel close.
//
// A relay-only peer without TURN credentials has no candidates at all, so
// every link it tries fails ICE, blocked or not.
//
// See also: `tcp.rs` for the backend that talks to a real signal server.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::{Receiver, Sender};

use parking_lot::Mutex;
use parlor_protocol::ConnId;

use crate::backend::{
    IceState, PeerEvent, PeerEventKind, PeerGeneration, PeerOptions, SignalingBackend,
    event_channel,
};
use crate::error::{SignalingError, TransportError};

/// Shared in-process network. Cheap to clone; clones see the same network.
#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    hub: Arc<Mutex<Hub>>,
}

/// One endpoint on a `LoopbackNetwork`.
pub struct LoopbackBackend {
    hub: Arc<Mutex<Hub>>,
    endpoint: usize,
}

type PeerKey = (usize, PeerGeneration);

#[derive(Default)]
struct Hub {
    endpoints: Vec<Sender<PeerEvent>>,
    peers: HashMap<PeerKey, PeerSlot>,
    registry: HashMap<String, PeerKey>,
    links: HashMap<ConnId, LinkEnd>,
    next_conn: u64,
    next_anonymous: u64,
    direct_blocked: bool,
    signaling_silent: bool,
    channel_stall: bool,
    open_failures: VecDeque<SignalingError>,
    opens: Vec<PeerOptions>,
}

struct PeerSlot {
    peer_id: String,
    relay_only: bool,
    has_turn: bool,
}

impl PeerSlot {
    /// Can gather any candidate at all.
    fn has_candidates(&self) -> bool {
        !self.relay_only || self.has_turn
    }

    fn relayed(&self) -> bool {
        self.relay_only && self.has_turn
    }
}

#[derive(Clone, Copy)]
struct LinkEnd {
    owner: PeerKey,
    remote: ConnId,
    open: bool,
}

impl Hub {
    fn emit(&self, (endpoint, generation): PeerKey, kind: PeerEventKind) {
        if let Some(tx) = self.endpoints.get(endpoint) {
            // Receiver gone means the manager was dropped; nothing to tell.
            let _ = tx.send(PeerEvent::new(generation, kind));
        }
    }

    fn alloc_conn(&mut self) -> ConnId {
        self.next_conn += 1;
        ConnId(self.next_conn)
    }

    /// Remove both ends of the link `conn` belongs to, telling the far end.
    fn close_link(&mut self, conn: ConnId) {
        let Some(end) = self.links.remove(&conn) else {
            return;
        };
        if let Some(far) = self.links.remove(&end.remote) {
            self.emit(far.owner, PeerEventKind::ChannelClosed { conn: end.remote });
        }
    }

    fn path_ok(&self, a: &PeerSlot, b: &PeerSlot) -> bool {
        a.has_candidates()
            && b.has_candidates()
            && (!self.direct_blocked || a.relayed() || b.relayed())
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a new endpoint to the network.
    pub fn backend(&self) -> (LoopbackBackend, Receiver<PeerEvent>) {
        let (tx, rx) = event_channel();
        let mut hub = self.hub.lock();
        hub.endpoints.push(tx);
        let endpoint = hub.endpoints.len() - 1;
        (
            LoopbackBackend {
                hub: Arc::clone(&self.hub),
                endpoint,
            },
            rx,
        )
    }

    pub fn set_direct_blocked(&self, blocked: bool) {
        self.hub.lock().direct_blocked = blocked;
    }

    pub fn set_signaling_silent(&self, silent: bool) {
        self.hub.lock().signaling_silent = silent;
    }

    pub fn set_channel_stall(&self, stall: bool) {
        self.hub.lock().channel_stall = stall;
    }

    pub fn fail_next_open(&self, error: SignalingError) {
        self.hub.lock().open_failures.push_back(error);
    }

    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.hub.lock().registry.contains_key(peer_id)
    }

    /// Number of established links, counting each link once.
    pub fn link_count(&self) -> usize {
        self.hub.lock().links.len() / 2
    }

    /// Every `open_peer` call seen so far, in order.
    pub fn opens(&self) -> Vec<PeerOptions> {
        self.hub.lock().opens.clone()
    }

    /// Simulate path loss on the link `conn` belongs to.
    pub fn break_link(&self, conn: ConnId) {
        let mut hub = self.hub.lock();
        let Some(end) = hub.links.remove(&conn) else {
            return;
        };
        let far = hub.links.remove(&end.remote);
        let disconnected = |c| PeerEventKind::IceState {
            conn: c,
            state: IceState::Disconnected,
        };
        hub.emit(end.owner, disconnected(conn));
        hub.emit(end.owner, PeerEventKind::ChannelClosed { conn });
        if let Some(far) = far {
            hub.emit(far.owner, disconnected(end.remote));
            hub.emit(far.owner, PeerEventKind::ChannelClosed { conn: end.remote });
        }
    }
}

impl SignalingBackend for LoopbackBackend {
    fn open_peer(&mut self, generation: PeerGeneration, options: PeerOptions) {
        let key = (self.endpoint, generation);
        let mut hub = self.hub.lock();
        hub.opens.push(options.clone());

        if let Some(error) = hub.open_failures.pop_front() {
            hub.emit(key, PeerEventKind::Error(error));
            return;
        }
        if hub.signaling_silent {
            return;
        }

        let peer_id = match options.peer_id {
            Some(id) => id,
            None => {
                hub.next_anonymous += 1;
                format!("peer-{}", hub.next_anonymous)
            }
        };
        if hub.registry.contains_key(&peer_id) {
            hub.emit(key, PeerEventKind::Error(SignalingError::UnavailableId(peer_id)));
            return;
        }
        hub.registry.insert(peer_id.clone(), key);
        hub.peers.insert(
            key,
            PeerSlot {
                peer_id: peer_id.clone(),
                relay_only: options.relay_only,
                has_turn: options.ice.has_relay(),
            },
        );
        hub.emit(key, PeerEventKind::Open { peer_id });
    }

    fn connect(
        &mut self,
        generation: PeerGeneration,
        remote_peer: &str,
    ) -> Result<ConnId, TransportError> {
        let key = (self.endpoint, generation);
        let mut hub = self.hub.lock();
        if !hub.peers.contains_key(&key) {
            return Err(TransportError::PeerNotOpen(generation));
        }
        let local = hub.alloc_conn();

        let Some(&remote_key) = hub.registry.get(remote_peer) else {
            hub.emit(
                key,
                PeerEventKind::Error(SignalingError::PeerUnavailable(remote_peer.to_string())),
            );
            return Ok(local);
        };
        let remote = hub.alloc_conn();

        let (reachable, my_id) = match (hub.peers.get(&key), hub.peers.get(&remote_key)) {
            (Some(me), Some(them)) => (hub.path_ok(me, them), me.peer_id.clone()),
            _ => return Err(TransportError::PeerNotOpen(generation)),
        };

        hub.emit(
            remote_key,
            PeerEventKind::Incoming {
                conn: remote,
                remote_peer: my_id,
            },
        );
        hub.emit(
            key,
            PeerEventKind::IceState {
                conn: local,
                state: IceState::Checking,
            },
        );

        if !reachable {
            hub.emit(
                key,
                PeerEventKind::IceState {
                    conn: local,
                    state: IceState::Failed,
                },
            );
            hub.emit(
                remote_key,
                PeerEventKind::IceState {
                    conn: remote,
                    state: IceState::Failed,
                },
            );
            return Ok(local);
        }

        let open = !hub.channel_stall;
        hub.links.insert(
            local,
            LinkEnd {
                owner: key,
                remote,
                open,
            },
        );
        hub.links.insert(
            remote,
            LinkEnd {
                owner: remote_key,
                remote: local,
                open,
            },
        );
        for (owner, conn) in [(remote_key, remote), (key, local)] {
            hub.emit(
                owner,
                PeerEventKind::IceState {
                    conn,
                    state: IceState::Connected,
                },
            );
            if open {
                hub.emit(owner, PeerEventKind::ChannelOpen { conn });
            }
        }
        Ok(local)
    }

    fn send(&mut self, conn: ConnId, payload: &str) -> Result<(), TransportError> {
        let hub = self.hub.lock();
        let end = match hub.links.get(&conn) {
            Some(end) if end.open && end.owner.0 == self.endpoint => *end,
            _ => return Err(TransportError::LinkNotOpen(conn)),
        };
        let far = hub
            .links
            .get(&end.remote)
            .ok_or(TransportError::LinkNotOpen(conn))?;
        hub.emit(
            far.owner,
            PeerEventKind::Data {
                conn: end.remote,
                payload: payload.to_string(),
            },
        );
        Ok(())
    }

    fn close(&mut self, conn: ConnId) {
        let mut hub = self.hub.lock();
        if hub
            .links
            .get(&conn)
            .is_some_and(|end| end.owner.0 == self.endpoint)
        {
            hub.close_link(conn);
        }
    }

    fn destroy_peer(&mut self, generation: PeerGeneration) {
        let key = (self.endpoint, generation);
        let mut hub = self.hub.lock();
        let slot = hub.peers.remove(&key);
        if let Some(slot) = slot.filter(|s| hub.registry.get(&s.peer_id) == Some(&key)) {
            hub.registry.remove(&slot.peer_id);
        }
        let owned: Vec<ConnId> = hub
            .links
            .iter()
            .filter(|(_, end)| end.owner == key)
            .map(|(conn, _)| *conn)
            .collect();
        for conn in owned {
            hub.close_link(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc::Receiver;

    use crate::config::{IceConfig, TurnCredentials};

    use super::*;

    fn options(peer_id: Option<&str>, relay_only: bool, turn: bool) -> PeerOptions {
        PeerOptions {
            peer_id: peer_id.map(str::to_string),
            ice: IceConfig {
                stun_urls: vec![],
                turn: turn.then(|| TurnCredentials {
                    urls: vec!["turn:relay.test:3478".into()],
                    username: "u".into(),
                    credential: "c".into(),
                }),
            },
            relay_only,
        }
    }

    fn drain(rx: &Receiver<PeerEvent>) -> Vec<PeerEventKind> {
        rx.try_iter().map(|e| e.kind).collect()
    }

    const G1: PeerGeneration = PeerGeneration(1);

    #[test]
    fn register_dial_and_exchange() {
        let net = LoopbackNetwork::new();
        let (mut host, host_rx) = net.backend();
        let (mut client, client_rx) = net.backend();

        host.open_peer(G1, options(Some("lobby-x-1"), false, false));
        assert_eq!(
            drain(&host_rx),
            vec![PeerEventKind::Open {
                peer_id: "lobby-x-1".into()
            }]
        );
        client.open_peer(G1, options(None, false, false));
        assert!(matches!(&drain(&client_rx)[..], [PeerEventKind::Open { .. }]));

        let c = client.connect(G1, "lobby-x-1").unwrap();
        let host_events = drain(&host_rx);
        let h = match host_events[0] {
            PeerEventKind::Incoming { conn, .. } => conn,
            ref other => panic!("expected incoming, got {other:?}"),
        };
        assert!(host_events.contains(&PeerEventKind::ChannelOpen { conn: h }));
        assert!(drain(&client_rx).contains(&PeerEventKind::ChannelOpen { conn: c }));
        assert_eq!(net.link_count(), 1);

        client.send(c, "hello").unwrap();
        assert_eq!(
            drain(&host_rx),
            vec![PeerEventKind::Data {
                conn: h,
                payload: "hello".into()
            }]
        );

        client.close(c);
        assert_eq!(drain(&host_rx), vec![PeerEventKind::ChannelClosed { conn: h }]);
        assert!(host.send(h, "late").is_err());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let net = LoopbackNetwork::new();
        let (mut a, _a_rx) = net.backend();
        let (mut b, b_rx) = net.backend();
        a.open_peer(G1, options(Some("lobby-x-1"), false, false));
        b.open_peer(G1, options(Some("lobby-x-1"), false, false));
        assert_eq!(
            drain(&b_rx),
            vec![PeerEventKind::Error(SignalingError::UnavailableId(
                "lobby-x-1".into()
            ))]
        );
    }

    #[test]
    fn dialing_unknown_peer_reports_unavailable() {
        let net = LoopbackNetwork::new();
        let (mut client, rx) = net.backend();
        client.open_peer(G1, options(None, false, false));
        drain(&rx);
        client.connect(G1, "lobby-nobody-1").unwrap();
        assert_eq!(
            drain(&rx),
            vec![PeerEventKind::Error(SignalingError::PeerUnavailable(
                "lobby-nobody-1".into()
            ))]
        );
    }

    #[test]
    fn blocked_direct_path_needs_turn_relay() {
        let net = LoopbackNetwork::new();
        net.set_direct_blocked(true);
        let (mut host, _host_rx) = net.backend();
        let (mut client, rx) = net.backend();
        host.open_peer(G1, options(Some("h"), false, false));

        client.open_peer(G1, options(None, false, true));
        drain(&rx);
        let c = client.connect(G1, "h").unwrap();
        assert!(drain(&rx).contains(&PeerEventKind::IceState {
            conn: c,
            state: IceState::Failed
        }));

        let g2 = PeerGeneration(2);
        client.destroy_peer(G1);
        client.open_peer(g2, options(None, true, true));
        drain(&rx);
        let c = client.connect(g2, "h").unwrap();
        assert!(drain(&rx).contains(&PeerEventKind::ChannelOpen { conn: c }));
    }

    #[test]
    fn relay_only_without_turn_never_connects() {
        let net = LoopbackNetwork::new();
        let (mut host, _host_rx) = net.backend();
        let (mut client, rx) = net.backend();
        host.open_peer(G1, options(Some("h"), false, false));
        client.open_peer(G1, options(None, true, false));
        drain(&rx);
        let c = client.connect(G1, "h").unwrap();
        assert!(drain(&rx).contains(&PeerEventKind::IceState {
            conn: c,
            state: IceState::Failed
        }));
        assert_eq!(net.link_count(), 0);
    }

    #[test]
    fn destroy_peer_unregisters_and_closes_links() {
        let net = LoopbackNetwork::new();
        let (mut host, host_rx) = net.backend();
        let (mut client, _client_rx) = net.backend();
        host.open_peer(G1, options(Some("h"), false, false));
        client.open_peer(G1, options(None, false, false));
        client.connect(G1, "h").unwrap();
        drain(&host_rx);

        client.destroy_peer(G1);
        assert!(matches!(
            &drain(&host_rx)[..],
            [PeerEventKind::ChannelClosed { .. }]
        ));
        host.destroy_peer(G1);
        assert!(!net.is_registered("h"));
        // Idempotent.
        host.destroy_peer(G1);
    }

    #[test]
    fn silent_signaling_never_answers() {
        let net = LoopbackNetwork::new();
        net.set_signaling_silent(true);
        let (mut a, rx) = net.backend();
        a.open_peer(G1, options(None, false, false));
        assert!(drain(&rx).is_empty());
        assert_eq!(net.opens().len(), 1);
    }

    #[test]
    fn break_link_notifies_both_ends() {
        let net = LoopbackNetwork::new();
        let (mut host, host_rx) = net.backend();
        let (mut client, client_rx) = net.backend();
        host.open_peer(G1, options(Some("h"), false, false));
        client.open_peer(G1, options(None, false, false));
        let c = client.connect(G1, "h").unwrap();
        drain(&host_rx);
        drain(&client_rx);

        net.break_link(c);
        assert_eq!(
            drain(&client_rx),
            vec![
                PeerEventKind::IceState {
                    conn: c,
                    state: IceState::Disconnected
                },
                PeerEventKind::ChannelClosed { conn: c },
            ]
        );
        assert_eq!(drain(&host_rx).len(), 2);
        assert_eq!(net.link_count(), 0);
    }
}
