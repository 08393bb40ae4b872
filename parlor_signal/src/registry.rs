// Peer registry and link table for the signal server.
//
// `Registry` is the state `server.rs` drives from its single-threaded main
// loop. It maps registered peer ids to TCP connections, hands out anonymous
// ids, and tracks every link between two registered peers. Link payloads are
// forwarded verbatim; the server never looks inside them.
//
// Writing to clients: each registered client's write half lives here. Write
// errors are logged and otherwise ignored; the client's reader thread will
// notice the broken socket and report a disconnect, which cleans up through
// `remove`.
//
// Invariants:
// - A peer id maps to at most one client.
// - Every link in `links` joins two clients that are still registered.
// - Conn ids are never reused within one registry.

use std::collections::{BTreeMap, HashMap};
use std::io::Write;

use parlor_protocol::{ConnId, RejectReason, SignalResponse, write_json};
use tracing::{debug, info, warn};

/// Server-side id of one TCP connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClientKey(pub u64);

/// Write half of a client connection.
pub type ClientWriter = Box<dyn Write + Send>;

struct ClientState {
    peer_id: String,
    writer: ClientWriter,
}

#[derive(Clone, Copy)]
struct Link {
    dialer: ClientKey,
    acceptor: ClientKey,
}

impl Link {
    fn other(&self, end: ClientKey) -> Option<ClientKey> {
        if end == self.dialer {
            Some(self.acceptor)
        } else if end == self.acceptor {
            Some(self.dialer)
        } else {
            None
        }
    }

    fn involves(&self, end: ClientKey) -> bool {
        self.other(end).is_some()
    }
}

#[derive(Default)]
pub struct Registry {
    clients: BTreeMap<ClientKey, ClientState>,
    by_peer_id: HashMap<String, ClientKey>,
    links: BTreeMap<ConnId, Link>,
    next_client: u64,
    next_conn: u64,
    next_anonymous: u64,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection under `requested`, or under a fresh
    /// `peer-<n>` id. On success the client has been sent `Registered`.
    pub fn register(
        &mut self,
        requested: Option<String>,
        writer: ClientWriter,
    ) -> Result<(ClientKey, String), RejectReason> {
        let peer_id = match requested {
            Some(id) if id.is_empty() => return Err(RejectReason::ServerError),
            Some(id) if self.by_peer_id.contains_key(&id) => return Err(RejectReason::IdTaken),
            Some(id) => id,
            None => self.anonymous_id(),
        };

        self.next_client += 1;
        let key = ClientKey(self.next_client);
        self.by_peer_id.insert(peer_id.clone(), key);
        self.clients.insert(
            key,
            ClientState {
                peer_id: peer_id.clone(),
                writer,
            },
        );
        info!(peer_id = %peer_id, client = key.0, "peer registered");
        self.send_to(
            key,
            &SignalResponse::Registered {
                peer_id: peer_id.clone(),
            },
        );
        Ok((key, peer_id))
    }

    fn anonymous_id(&mut self) -> String {
        loop {
            self.next_anonymous += 1;
            let id = format!("peer-{}", self.next_anonymous);
            if !self.by_peer_id.contains_key(&id) {
                return id;
            }
        }
    }

    /// Dial `target` on behalf of `from`.
    pub fn connect(&mut self, from: ClientKey, request: u64, target: &str) {
        let Some(dialer_id) = self.clients.get(&from).map(|c| c.peer_id.clone()) else {
            return;
        };
        let acceptor = match self.by_peer_id.get(target) {
            Some(&key) if key != from => key,
            _ => {
                debug!(from = %dialer_id, target = %target, "dial target unavailable");
                self.send_to(
                    from,
                    &SignalResponse::PeerUnavailable {
                        request,
                        target: target.to_string(),
                    },
                );
                return;
            }
        };

        self.next_conn += 1;
        let conn = ConnId(self.next_conn);
        self.links.insert(
            conn,
            Link {
                dialer: from,
                acceptor,
            },
        );
        info!(conn = %conn, from = %dialer_id, to = %target, "link established");
        self.send_to(
            acceptor,
            &SignalResponse::Incoming {
                conn,
                from: dialer_id,
            },
        );
        self.send_to(from, &SignalResponse::ConnectOk { request, conn });
    }

    /// Forward a payload to the other end of `conn`.
    pub fn relay(&mut self, from: ClientKey, conn: ConnId, payload: String) {
        match self.links.get(&conn).and_then(|link| link.other(from)) {
            Some(to) => self.send_to(to, &SignalResponse::Data { conn, payload }),
            None => debug!(conn = %conn, client = from.0, "send on unknown link"),
        }
    }

    /// Close `conn` at the request of one of its ends.
    pub fn close(&mut self, from: ClientKey, conn: ConnId) {
        let Some(to) = self.links.get(&conn).and_then(|link| link.other(from)) else {
            return;
        };
        self.links.remove(&conn);
        debug!(conn = %conn, "link closed");
        self.send_to(to, &SignalResponse::Closed { conn });
    }

    /// Drop a client: unregister its id and close every link it was part of.
    pub fn remove(&mut self, key: ClientKey) {
        let Some(state) = self.clients.remove(&key) else {
            return;
        };
        if self.by_peer_id.get(&state.peer_id) == Some(&key) {
            self.by_peer_id.remove(&state.peer_id);
        }
        info!(peer_id = %state.peer_id, "peer left");

        let dead: Vec<(ConnId, Link)> = self
            .links
            .iter()
            .filter(|(_, link)| link.involves(key))
            .map(|(conn, link)| (*conn, *link))
            .collect();
        for (conn, link) in dead {
            self.links.remove(&conn);
            if let Some(other) = link.other(key) {
                self.send_to(other, &SignalResponse::Closed { conn });
            }
        }
    }

    pub fn peer_count(&self) -> usize {
        self.clients.len()
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    pub fn is_registered(&self, peer_id: &str) -> bool {
        self.by_peer_id.contains_key(peer_id)
    }

    fn send_to(&mut self, key: ClientKey, response: &SignalResponse) {
        let Some(client) = self.clients.get_mut(&key) else {
            return;
        };
        if let Err(e) = write_json(&mut client.writer, response) {
            warn!(peer_id = %client.peer_id, error = %e, "write to client failed");
        }
    }
}
