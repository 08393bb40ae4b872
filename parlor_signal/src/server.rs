// TCP server and main event loop for the signal server.
//
// Architecture: thread-per-reader with a central `mpsc` channel.
//
// - **Listener thread** (`TcpListener::accept()` loop): accepts new TCP
//   connections and sends `InternalEvent::NewConnection` to the main thread.
// - **Reader threads** (one per registered client): read framed
//   `SignalRequest`s and send `InternalEvent::RequestFrom` to the main
//   thread. On `Goodbye`, error, or EOF they send `InternalEvent::Disconnected`.
// - **Main thread**: owns the `Registry`, receives events from the channel,
//   and dispatches them. `recv_timeout` wakes it periodically to check the
//   `keep_running` flag.
//
// The main thread is the only writer to client TCP streams (via `Registry`).
// Reader threads only read.
//
// The registration handshake runs on the main thread with a short read
// timeout, so a client that connects and says nothing stalls other events for
// at most that long.
//
// Shutdown: `SignalHandle::stop` clears `keep_running` and joins the main
// thread.

use std::io::{BufReader, BufWriter};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread;
use std::time::Duration;

use parlor_protocol::{SignalRequest, SignalResponse, read_json, write_json};
use tracing::{debug, info, warn};

use crate::registry::{ClientKey, Registry};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const IDLE_WAKE: Duration = Duration::from_millis(100);

/// Events sent from listener/reader threads to the main thread.
enum InternalEvent {
    NewConnection { stream: TcpStream },
    RequestFrom { client: ClientKey, request: SignalRequest },
    Disconnected { client: ClientKey },
}

/// Handle returned by `start_signal_server` to control the running server.
pub struct SignalHandle {
    keep_running: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl SignalHandle {
    /// Signal the server to stop and wait for it to shut down.
    pub fn stop(self) {
        self.keep_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread {
            let _ = handle.join();
        }
    }
}

/// Configuration for starting a signal server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignalConfig {
    pub port: u16,
    pub bind_addr: String,
}

impl Default for SignalConfig {
    fn default() -> Self {
        Self {
            port: 9090,
            bind_addr: "127.0.0.1".into(),
        }
    }
}

/// Start the signal server on a background thread. Returns a handle for
/// stopping it and the actual bound address (port 0 lets the OS pick).
pub fn start_signal_server(config: SignalConfig) -> std::io::Result<(SignalHandle, SocketAddr)> {
    let listener = TcpListener::bind((config.bind_addr.as_str(), config.port))?;
    let addr = listener.local_addr()?;
    let keep_running = Arc::new(AtomicBool::new(true));
    let keep_running_clone = keep_running.clone();

    info!(%addr, "signal server listening");
    let thread = thread::spawn(move || {
        run_server(listener, keep_running_clone);
    });

    Ok((
        SignalHandle {
            keep_running,
            thread: Some(thread),
        },
        addr,
    ))
}

/// Main loop. Runs until `keep_running` is set to false.
fn run_server(listener: TcpListener, keep_running: Arc<AtomicBool>) {
    let mut registry = Registry::new();
    let (tx, rx): (Sender<InternalEvent>, Receiver<InternalEvent>) = mpsc::channel();

    // Non-blocking so the accept thread can check keep_running.
    listener.set_nonblocking(true).ok();

    let keep_running_listener = keep_running.clone();
    let tx_listener = tx.clone();
    thread::spawn(move || {
        while keep_running_listener.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    stream.set_nonblocking(false).ok();
                    let _ = tx_listener.send(InternalEvent::NewConnection { stream });
                }
                Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(Duration::from_millis(20));
                }
                Err(e) => {
                    warn!(error = %e, "accept failed, listener exiting");
                    break;
                }
            }
        }
    });

    while keep_running.load(Ordering::SeqCst) {
        match rx.recv_timeout(IDLE_WAKE) {
            Ok(event) => {
                handle_event(&mut registry, event, &tx, &keep_running);
                while let Ok(event) = rx.try_recv() {
                    handle_event(&mut registry, event, &tx, &keep_running);
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {}
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("signal server stopped");
}

fn handle_event(
    registry: &mut Registry,
    event: InternalEvent,
    tx: &Sender<InternalEvent>,
    keep_running: &Arc<AtomicBool>,
) {
    match event {
        InternalEvent::NewConnection { stream } => {
            handle_new_connection(registry, stream, tx, keep_running);
        }
        InternalEvent::RequestFrom { client, request } => {
            handle_request(registry, client, request);
        }
        InternalEvent::Disconnected { client } => registry.remove(client),
    }
}

/// Read the `Register` handshake, add the client to the registry, and spawn
/// its reader thread. Anything other than `Register` drops the connection.
fn handle_new_connection(
    registry: &mut Registry,
    stream: TcpStream,
    tx: &Sender<InternalEvent>,
    keep_running: &Arc<AtomicBool>,
) {
    stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT)).ok();
    stream.set_nodelay(true).ok();

    let mut reader = match stream.try_clone() {
        Ok(s) => BufReader::new(s),
        Err(_) => return,
    };
    let requested = match read_json::<_, SignalRequest>(&mut reader) {
        Ok(SignalRequest::Register { peer_id }) => peer_id,
        Ok(other) => {
            debug!(request = ?other, "expected Register, dropping connection");
            return;
        }
        Err(e) => {
            debug!(error = %e, "handshake failed");
            return;
        }
    };
    let write_stream = match stream.try_clone() {
        Ok(s) => s,
        Err(_) => return,
    };

    match registry.register(requested, Box::new(BufWriter::new(write_stream))) {
        Ok((client, _)) => {
            stream.set_read_timeout(None).ok();
            let tx_reader = tx.clone();
            let keep_running_reader = keep_running.clone();
            thread::spawn(move || {
                reader_loop(reader, client, tx_reader, keep_running_reader);
            });
        }
        Err(reason) => {
            debug!(?reason, "registration rejected");
            let mut writer = BufWriter::new(stream);
            let _ = write_json(&mut writer, &SignalResponse::Rejected { reason });
        }
    }
}

/// Reader loop for a single client. Runs in its own thread.
fn reader_loop(
    mut reader: BufReader<TcpStream>,
    client: ClientKey,
    tx: Sender<InternalEvent>,
    keep_running: Arc<AtomicBool>,
) {
    while keep_running.load(Ordering::SeqCst) {
        match read_json::<_, SignalRequest>(&mut reader) {
            Ok(SignalRequest::Goodbye) | Err(_) => break,
            Ok(request) => {
                if tx.send(InternalEvent::RequestFrom { client, request }).is_err() {
                    return;
                }
            }
        }
    }
    let _ = tx.send(InternalEvent::Disconnected { client });
}

fn handle_request(registry: &mut Registry, client: ClientKey, request: SignalRequest) {
    match request {
        SignalRequest::Connect { request, target } => registry.connect(client, request, &target),
        SignalRequest::Send { conn, payload } => registry.relay(client, conn, payload),
        SignalRequest::Close { conn } => registry.close(client, conn),
        SignalRequest::Register { .. } => {
            debug!(client = client.0, "ignoring second Register");
        }
        SignalRequest::Goodbye => registry.remove(client),
    }
}
