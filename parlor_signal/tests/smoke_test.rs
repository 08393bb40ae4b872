// Integration smoke test for the signal server.
//
// Starts a server on localhost, connects mock TCP clients, and exercises the
// protocol end to end: registration (named, anonymous, duplicate), dialing,
// payload relay in both directions, explicit close, and disconnect cleanup.
//
// Each client is a plain TCP socket using the protocol crate's framing and
// message types; no connection manager involved.

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use parlor_protocol::{ConnId, RejectReason, SignalRequest, SignalResponse, read_json, write_json};
use parlor_signal::server::{SignalConfig, start_signal_server};

struct MockPeer {
    reader: BufReader<TcpStream>,
    writer: BufWriter<TcpStream>,
}

impl MockPeer {
    fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        Self {
            reader,
            writer: BufWriter::new(stream),
        }
    }

    fn send(&mut self, request: &SignalRequest) {
        write_json(&mut self.writer, request).unwrap();
    }

    fn recv(&mut self) -> SignalResponse {
        read_json(&mut self.reader).unwrap()
    }

    /// Connect and register; returns the peer and its assigned id.
    fn register(addr: SocketAddr, peer_id: Option<&str>) -> (Self, String) {
        let mut peer = Self::connect(addr);
        peer.send(&SignalRequest::Register {
            peer_id: peer_id.map(str::to_string),
        });
        match peer.recv() {
            SignalResponse::Registered { peer_id } => (peer, peer_id),
            other => panic!("expected Registered, got {other:?}"),
        }
    }
}

fn start() -> (parlor_signal::SignalHandle, SocketAddr) {
    let config = SignalConfig {
        port: 0,
        ..SignalConfig::default()
    };
    start_signal_server(config).unwrap()
}

#[test]
fn full_link_lifecycle() {
    let (handle, addr) = start();

    let (mut host, host_id) = MockPeer::register(addr, Some("lobby-trivia-ABC123"));
    assert_eq!(host_id, "lobby-trivia-ABC123");
    let (mut client, client_id) = MockPeer::register(addr, None);
    assert!(client_id.starts_with("peer-"));

    client.send(&SignalRequest::Connect {
        request: 1,
        target: "lobby-trivia-ABC123".into(),
    });
    let conn = match host.recv() {
        SignalResponse::Incoming { conn, from } => {
            assert_eq!(from, client_id);
            conn
        }
        other => panic!("expected Incoming, got {other:?}"),
    };
    assert_eq!(client.recv(), SignalResponse::ConnectOk { request: 1, conn });

    client.send(&SignalRequest::Send {
        conn,
        payload: r#"{"type":"player-info"}"#.into(),
    });
    assert_eq!(
        host.recv(),
        SignalResponse::Data {
            conn,
            payload: r#"{"type":"player-info"}"#.into()
        }
    );
    host.send(&SignalRequest::Send {
        conn,
        payload: r#"{"type":"start-game"}"#.into(),
    });
    assert_eq!(
        client.recv(),
        SignalResponse::Data {
            conn,
            payload: r#"{"type":"start-game"}"#.into()
        }
    );

    client.send(&SignalRequest::Close { conn });
    assert_eq!(host.recv(), SignalResponse::Closed { conn });

    host.send(&SignalRequest::Goodbye);
    client.send(&SignalRequest::Goodbye);
    handle.stop();
}

#[test]
fn duplicate_id_is_rejected() {
    let (handle, addr) = start();
    let (_host, _) = MockPeer::register(addr, Some("lobby-go-X9"));

    let mut imposter = MockPeer::connect(addr);
    imposter.send(&SignalRequest::Register {
        peer_id: Some("lobby-go-X9".into()),
    });
    assert_eq!(
        imposter.recv(),
        SignalResponse::Rejected {
            reason: RejectReason::IdTaken
        }
    );
    handle.stop();
}

#[test]
fn dialing_missing_peer_is_unavailable() {
    let (handle, addr) = start();
    let (mut client, _) = MockPeer::register(addr, None);
    client.send(&SignalRequest::Connect {
        request: 7,
        target: "lobby-nobody-1".into(),
    });
    assert_eq!(
        client.recv(),
        SignalResponse::PeerUnavailable {
            request: 7,
            target: "lobby-nobody-1".into()
        }
    );
    handle.stop();
}

#[test]
fn disconnect_closes_links_and_frees_the_id() {
    let (handle, addr) = start();
    let (host, _) = MockPeer::register(addr, Some("lobby-chess-1"));
    let (mut client, _) = MockPeer::register(addr, None);
    client.send(&SignalRequest::Connect {
        request: 1,
        target: "lobby-chess-1".into(),
    });
    let conn = match client.recv() {
        SignalResponse::ConnectOk { conn, .. } => conn,
        other => panic!("expected ConnectOk, got {other:?}"),
    };
    assert_eq!(conn, ConnId(1));

    // Host vanishes without a Goodbye.
    drop(host);
    assert_eq!(client.recv(), SignalResponse::Closed { conn });

    let (_again, id) = MockPeer::register(addr, Some("lobby-chess-1"));
    assert_eq!(id, "lobby-chess-1");
    handle.stop();
}
