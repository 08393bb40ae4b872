// Signaling backend over the `parlor_signal` TCP server.
//
// Each peer object is one TCP connection to the signal server. `open_peer`
// spawns a thread that connects, performs the `Register` handshake, then
// stays on as the reader for that connection, translating `SignalResponse`s
// into `PeerEvent`s on the manager's channel. The manager's thread writes
// requests through a shared `BufWriter`; writes are small and flushed
// synchronously.
//
// The signal server relays link payloads itself, so every link is
// effectively relayed: a link reports ICE `Connected` and opens as soon as
// the server confirms it, and relay-only mode changes nothing.
//
// Connection ids: the server numbers links globally; this backend hands the
// manager its own local ids and keeps the mapping per peer. A dial's local
// id doubles as the `Connect` request id so the server's answer can be
// matched back to it.
//
// See also: `loopback.rs` for the in-process backend, `parlor_signal::server`
// for the other end of this connection.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use parlor_protocol::{ConnId, RejectReason, SignalRequest, SignalResponse, read_json, write_json};
use tracing::{debug, warn};

use crate::backend::{
    IceState, PeerEvent, PeerEventKind, PeerGeneration, PeerOptions, SignalingBackend,
    event_channel,
};
use crate::error::{SignalingError, TransportError};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TcpBackend {
    server_addr: String,
    events: Sender<PeerEvent>,
    peers: HashMap<PeerGeneration, Arc<PeerLink>>,
    next_local: Arc<AtomicU64>,
}

/// One registration on the signal server, shared with its reader thread.
struct PeerLink {
    generation: PeerGeneration,
    writer: Mutex<Option<BufWriter<TcpStream>>>,
    /// Extra handle used only to shut the socket down and unblock the reader.
    stream: Mutex<Option<TcpStream>>,
    conns: Mutex<ConnTable>,
    closed: AtomicBool,
}

#[derive(Default)]
struct ConnTable {
    /// Outstanding dials: request id → target peer.
    pending: HashMap<u64, String>,
    to_local: HashMap<ConnId, ConnId>,
    to_server: HashMap<ConnId, ConnId>,
}

impl ConnTable {
    fn bind(&mut self, server: ConnId, local: ConnId) {
        self.to_local.insert(server, local);
        self.to_server.insert(local, server);
    }

    fn unbind_local(&mut self, local: ConnId) -> Option<ConnId> {
        let server = self.to_server.remove(&local)?;
        self.to_local.remove(&server);
        Some(server)
    }

    fn unbind_server(&mut self, server: ConnId) -> Option<ConnId> {
        let local = self.to_local.remove(&server)?;
        self.to_server.remove(&local);
        Some(local)
    }

    fn drain_local(&mut self) -> Vec<ConnId> {
        self.to_local.clear();
        self.pending.clear();
        self.to_server.drain().map(|(local, _)| local).collect()
    }
}

impl PeerLink {
    fn new(generation: PeerGeneration) -> Self {
        Self {
            generation,
            writer: Mutex::new(None),
            stream: Mutex::new(None),
            conns: Mutex::new(ConnTable::default()),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn is_registered(&self) -> bool {
        self.writer.lock().is_some()
    }

    fn send(&self, request: &SignalRequest) -> Result<(), TransportError> {
        let mut guard = self.writer.lock();
        let writer = guard
            .as_mut()
            .ok_or(TransportError::PeerNotOpen(self.generation))?;
        write_json(writer, request)?;
        Ok(())
    }

    fn shutdown(&self) {
        if let Some(stream) = self.stream.lock().take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

fn alloc_local(next: &AtomicU64) -> ConnId {
    ConnId(next.fetch_add(1, Ordering::Relaxed) + 1)
}

impl TcpBackend {
    /// Backend for the signal server at `server_addr` (`host:port`).
    pub fn new(server_addr: &str) -> (Self, Receiver<PeerEvent>) {
        let (tx, rx) = event_channel();
        (
            Self {
                server_addr: server_addr.to_string(),
                events: tx,
                peers: HashMap::new(),
                next_local: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    fn owner_of(&self, local: ConnId) -> Option<(&Arc<PeerLink>, ConnId)> {
        self.peers.values().find_map(|link| {
            let server = link.conns.lock().to_server.get(&local).copied()?;
            Some((link, server))
        })
    }
}

impl SignalingBackend for TcpBackend {
    fn open_peer(&mut self, generation: PeerGeneration, options: PeerOptions) {
        let link = Arc::new(PeerLink::new(generation));
        self.peers.insert(generation, Arc::clone(&link));
        let addr = self.server_addr.clone();
        let events = self.events.clone();
        let next_local = Arc::clone(&self.next_local);
        thread::spawn(move || {
            run_peer(&addr, options.peer_id, &link, &events, &next_local);
        });
    }

    fn connect(
        &mut self,
        generation: PeerGeneration,
        remote_peer: &str,
    ) -> Result<ConnId, TransportError> {
        let link = self
            .peers
            .get(&generation)
            .filter(|link| link.is_registered())
            .ok_or(TransportError::PeerNotOpen(generation))?;
        let local = alloc_local(&self.next_local);
        link.conns
            .lock()
            .pending
            .insert(local.0, remote_peer.to_string());
        link.send(&SignalRequest::Connect {
            request: local.0,
            target: remote_peer.to_string(),
        })?;
        Ok(local)
    }

    fn send(&mut self, conn: ConnId, payload: &str) -> Result<(), TransportError> {
        let (link, server) = self.owner_of(conn).ok_or(TransportError::LinkNotOpen(conn))?;
        link.send(&SignalRequest::Send {
            conn: server,
            payload: payload.to_string(),
        })
    }

    fn close(&mut self, conn: ConnId) {
        let Some(link) = self.owner_of(conn).map(|(link, _)| Arc::clone(link)) else {
            return;
        };
        let Some(server) = link.conns.lock().unbind_local(conn) else {
            return;
        };
        if let Err(e) = link.send(&SignalRequest::Close { conn: server }) {
            debug!(conn = %conn, error = %e, "close not delivered");
        }
    }

    fn destroy_peer(&mut self, generation: PeerGeneration) {
        let Some(link) = self.peers.remove(&generation) else {
            return;
        };
        link.closed.store(true, Ordering::Release);
        let _ = link.send(&SignalRequest::Goodbye);
        link.shutdown();
    }
}

impl Drop for TcpBackend {
    fn drop(&mut self) {
        let generations: Vec<PeerGeneration> = self.peers.keys().copied().collect();
        for generation in generations {
            self.destroy_peer(generation);
        }
    }
}

/// Body of a peer's thread: register, then read until the socket closes.
fn run_peer(
    addr: &str,
    peer_id: Option<String>,
    link: &PeerLink,
    events: &Sender<PeerEvent>,
    next_local: &AtomicU64,
) {
    let emit = |kind: PeerEventKind| {
        // Receiver gone means the manager was dropped.
        let _ = events.send(PeerEvent::new(link.generation, kind));
    };

    let reader = match register(addr, peer_id, link) {
        Ok((reader, assigned)) => {
            emit(PeerEventKind::Open { peer_id: assigned });
            reader
        }
        Err(error) => {
            if !link.is_closed() {
                emit(PeerEventKind::Error(error));
            }
            return;
        }
    };

    read_loop(reader, link, &emit, next_local);

    if !link.is_closed() {
        let orphaned = link.conns.lock().drain_local();
        for conn in orphaned {
            emit(PeerEventKind::ChannelClosed { conn });
        }
        emit(PeerEventKind::Error(SignalingError::Network(
            "lost connection to signal server".into(),
        )));
    }
}

fn register(
    addr: &str,
    peer_id: Option<String>,
    link: &PeerLink,
) -> Result<(BufReader<TcpStream>, String), SignalingError> {
    let network = |e: std::io::Error| SignalingError::Network(format!("{addr}: {e}"));

    let stream = TcpStream::connect(addr).map_err(network)?;
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).ok();
    stream.set_nodelay(true).ok();
    let reader_stream = stream.try_clone().map_err(network)?;
    let shutdown_handle = stream.try_clone().map_err(network)?;
    let mut writer = BufWriter::new(stream);

    write_json(
        &mut writer,
        &SignalRequest::Register {
            peer_id: peer_id.clone(),
        },
    )
    .map_err(network)?;

    let mut reader = BufReader::new(reader_stream);
    let assigned = match read_json::<_, SignalResponse>(&mut reader).map_err(network)? {
        SignalResponse::Registered { peer_id } => peer_id,
        SignalResponse::Rejected {
            reason: RejectReason::IdTaken,
        } => return Err(SignalingError::UnavailableId(peer_id.unwrap_or_default())),
        SignalResponse::Rejected {
            reason: RejectReason::ServerError,
        } => return Err(SignalingError::Server("registration refused".into())),
        other => {
            return Err(SignalingError::Server(format!(
                "unexpected handshake response: {other:?}"
            )));
        }
    };
    reader.get_ref().set_read_timeout(None).ok();

    *link.writer.lock() = Some(writer);
    *link.stream.lock() = Some(shutdown_handle);
    // Destroyed mid-handshake: nobody else will shut this socket down.
    if link.is_closed() {
        link.shutdown();
        return Err(SignalingError::Network("peer destroyed".into()));
    }
    Ok((reader, assigned))
}

fn read_loop(
    mut reader: BufReader<TcpStream>,
    link: &PeerLink,
    emit: &dyn Fn(PeerEventKind),
    next_local: &AtomicU64,
) {
    let link_up = |local: ConnId| {
        emit(PeerEventKind::IceState {
            conn: local,
            state: IceState::Connected,
        });
        emit(PeerEventKind::ChannelOpen { conn: local });
    };

    loop {
        let response: SignalResponse = match read_json(&mut reader) {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "signal connection closed");
                return;
            }
        };
        match response {
            SignalResponse::ConnectOk { request, conn } => {
                let local = ConnId(request);
                let dialed = {
                    let mut table = link.conns.lock();
                    let dialed = table.pending.remove(&request).is_some();
                    if dialed {
                        table.bind(conn, local);
                    }
                    dialed
                };
                if dialed {
                    link_up(local);
                }
            }
            SignalResponse::PeerUnavailable { request, target } => {
                link.conns.lock().pending.remove(&request);
                emit(PeerEventKind::Error(SignalingError::PeerUnavailable(target)));
            }
            SignalResponse::Incoming { conn, from } => {
                let local = alloc_local(next_local);
                link.conns.lock().bind(conn, local);
                emit(PeerEventKind::Incoming {
                    conn: local,
                    remote_peer: from,
                });
                link_up(local);
            }
            SignalResponse::Data { conn, payload } => {
                let local = link.conns.lock().to_local.get(&conn).copied();
                if let Some(local) = local {
                    emit(PeerEventKind::Data {
                        conn: local,
                        payload,
                    });
                }
            }
            SignalResponse::Closed { conn } => {
                let local = link.conns.lock().unbind_server(conn);
                if let Some(local) = local {
                    emit(PeerEventKind::ChannelClosed { conn: local });
                }
            }
            other @ (SignalResponse::Registered { .. } | SignalResponse::Rejected { .. }) => {
                warn!(response = ?other, "unexpected response after registration");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::TcpListener;

    use crate::config::IceConfig;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    fn options(peer_id: Option<&str>) -> PeerOptions {
        PeerOptions {
            peer_id: peer_id.map(str::to_string),
            ice: IceConfig::default(),
            relay_only: false,
        }
    }

    /// Accept one connection and answer the handshake with `reply`.
    fn fake_server(
        reply: SignalResponse,
    ) -> (String, thread::JoinHandle<(BufReader<TcpStream>, BufWriter<TcpStream>)>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = BufReader::new(stream.try_clone().unwrap());
            let mut writer = BufWriter::new(stream);
            let _: SignalRequest = read_json(&mut reader).unwrap();
            write_json(&mut writer, &reply).unwrap();
            (reader, writer)
        });
        (addr, handle)
    }

    #[test]
    fn taken_id_maps_to_unavailable_id() {
        let (addr, server) = fake_server(SignalResponse::Rejected {
            reason: RejectReason::IdTaken,
        });
        let (mut backend, rx) = TcpBackend::new(&addr);
        backend.open_peer(PeerGeneration(1), options(Some("lobby-x-1")));
        let event = rx.recv_timeout(WAIT).unwrap();
        assert_eq!(
            event.kind,
            PeerEventKind::Error(SignalingError::UnavailableId("lobby-x-1".into()))
        );
        server.join().unwrap();
    }

    #[test]
    fn unreachable_server_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);
        let (mut backend, rx) = TcpBackend::new(&addr);
        backend.open_peer(PeerGeneration(1), options(None));
        let event = rx.recv_timeout(WAIT).unwrap();
        assert!(matches!(
            event.kind,
            PeerEventKind::Error(SignalingError::Network(_))
        ));
    }

    #[test]
    fn server_conn_ids_are_translated_both_ways() {
        let (addr, server) = fake_server(SignalResponse::Registered {
            peer_id: "lobby-x-1".into(),
        });
        let (mut backend, rx) = TcpBackend::new(&addr);
        let generation = PeerGeneration(1);
        backend.open_peer(generation, options(Some("lobby-x-1")));
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap(),
            PeerEvent::new(
                generation,
                PeerEventKind::Open {
                    peer_id: "lobby-x-1".into()
                }
            )
        );

        let (mut reader, mut writer) = server.join().unwrap();
        let server_conn = ConnId(77);
        write_json(
            &mut writer,
            &SignalResponse::Incoming {
                conn: server_conn,
                from: "peer-3".into(),
            },
        )
        .unwrap();
        write_json(
            &mut writer,
            &SignalResponse::Data {
                conn: server_conn,
                payload: "hi".into(),
            },
        )
        .unwrap();

        let local = match rx.recv_timeout(WAIT).unwrap().kind {
            PeerEventKind::Incoming { conn, remote_peer } => {
                assert_eq!(remote_peer, "peer-3");
                conn
            }
            other => panic!("expected incoming, got {other:?}"),
        };
        assert_ne!(local, server_conn);
        let rest: Vec<PeerEventKind> = (0..3)
            .map(|_| rx.recv_timeout(WAIT).unwrap().kind)
            .collect();
        assert_eq!(
            rest,
            vec![
                PeerEventKind::IceState {
                    conn: local,
                    state: IceState::Connected
                },
                PeerEventKind::ChannelOpen { conn: local },
                PeerEventKind::Data {
                    conn: local,
                    payload: "hi".into()
                },
            ]
        );

        backend.send(local, "yo").unwrap();
        let request: SignalRequest = read_json(&mut reader).unwrap();
        assert_eq!(
            request,
            SignalRequest::Send {
                conn: server_conn,
                payload: "yo".into()
            }
        );

        backend.close(local);
        let request: SignalRequest = read_json(&mut reader).unwrap();
        assert_eq!(request, SignalRequest::Close { conn: server_conn });
        assert!(backend.send(local, "late").is_err());

        backend.destroy_peer(generation);
        let request: SignalRequest = read_json(&mut reader).unwrap();
        assert_eq!(request, SignalRequest::Goodbye);
    }
}
