// The lobby connection manager.
//
// One `ConnectionManager` per participant. It owns a `SignalingBackend`, the
// backend's event receiver, the roster, and every timer. All state changes
// happen on the caller's thread, inside `handle_event`, `fire_timers`, or one
// of the public commands; `pump` is a convenience driver that blocks on the
// event channel bounded by the next timer deadline, the same loop shape as
// the signal server's main loop.
//
// Lifecycle (`ConnectionState`):
//
//   idle → connecting → connected
//               ↓  ↑ (retry)
//           degraded → relay-retry → connected | failed
//
// and `closed` after `teardown`.
//
// Connect loop: each attempt creates a fresh peer object under a new
// `PeerGeneration`. The host registers under the derived host id; a client
// registers anonymously and dials the host id. "Peer unavailable" (the host
// isn't registered yet) and per-attempt timeouts consume an attempt and retry
// after `attempt * retry_base_delay`. Exhausting the budget is terminal. Any
// other signaling error before connecting is terminal immediately.
//
// Relay fallback: while not yet connected, an ICE failure on our link, a host
// channel that closes before opening, or a channel-open timeout triggers one
// relay-only restart (fresh connect loop with `relay_only`). The flag that
// limits this to once is reset only by `initialize`.
//
// Roster handshake: on channel open each side sends its own `player-info`.
// The host also replays the players it knows to the joiner, binds the channel
// to the id of the first `player-info` received on it, and forwards joiner
// updates to everyone else. When a bound channel closes the host removes that
// player and broadcasts `player-left`. An id already bound to another channel
// is refused and the newcomer's channel closed. Incoming links that don't open
// within the channel-open timeout are dropped.
//
// Stale events: every event carries the generation of the peer that emitted
// it. Events from a destroyed peer, or arriving after teardown, are dropped
// before they touch any state.
//
// See also: `backend.rs` for the event contract, `roster.rs`, `timers.rs`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parlor_protocol::{ConnId, LobbyMessage, LobbyPlayer, PeerRole, host_peer_id};
use tracing::{debug, info, warn};

use crate::backend::{
    IceState, PeerEvent, PeerEventKind, PeerGeneration, PeerOptions, SignalingBackend,
};
use crate::config::NetConfig;
use crate::diagnostics::Diagnostics;
use crate::error::{LobbyError, SignalingError};
use crate::roster::Roster;
use crate::timers::{TimerKind, Timers};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Idle,
    Connecting,
    Connected,
    Degraded,
    RelayRetry,
    Failed,
    Closed,
}

/// Something the UI should react to. Drained with
/// `ConnectionManager::poll_notifications`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LobbyNotification {
    Connected,
    RosterChanged,
    GameStarted,
    Failed(LobbyError),
}

/// Parameters for `ConnectionManager::initialize`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LobbyRequest {
    pub game_id: String,
    pub match_id: String,
    pub role: PeerRole,
    pub player_name: String,
    /// When false, `initialize` does nothing (single-player mode).
    pub enabled: bool,
}

impl LobbyRequest {
    pub fn host(game_id: &str, match_id: &str, player_name: &str) -> Self {
        Self::new(game_id, match_id, PeerRole::Host, player_name)
    }

    pub fn client(game_id: &str, match_id: &str, player_name: &str) -> Self {
        Self::new(game_id, match_id, PeerRole::Client, player_name)
    }

    fn new(game_id: &str, match_id: &str, role: PeerRole, player_name: &str) -> Self {
        Self {
            game_id: game_id.to_string(),
            match_id: match_id.to_string(),
            role,
            player_name: player_name.to_string(),
            enabled: true,
        }
    }
}

struct Lobby {
    host_id: String,
    role: PeerRole,
    local: LobbyPlayer,
}

struct Link {
    remote_peer: String,
    open: bool,
    /// Host side: the player this channel speaks for.
    player_id: Option<String>,
}

pub struct ConnectionManager {
    backend: Box<dyn SignalingBackend>,
    events: Receiver<PeerEvent>,
    config: NetConfig,

    lobby: Option<Lobby>,
    state: ConnectionState,
    error: Option<LobbyError>,
    roster: Roster,

    generation: PeerGeneration,
    peer_active: bool,
    peer_open: bool,
    alive: bool,
    attempt: u32,
    relay_mode: bool,
    relay_attempted: bool,

    links: BTreeMap<ConnId, Link>,
    host_conn: Option<ConnId>,

    timers: Timers,
    diagnostics: Diagnostics,
    last_ice_state: Option<IceState>,
    notifications: VecDeque<LobbyNotification>,
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}

impl ConnectionManager {
    pub fn new(
        backend: Box<dyn SignalingBackend>,
        events: Receiver<PeerEvent>,
        config: NetConfig,
    ) -> Self {
        let diagnostics = Diagnostics::new(config.diagnostic_capacity, Instant::now());
        Self {
            backend,
            events,
            config,
            lobby: None,
            state: ConnectionState::Idle,
            error: None,
            roster: Roster::new(),
            generation: PeerGeneration(0),
            peer_active: false,
            peer_open: false,
            alive: false,
            attempt: 0,
            relay_mode: false,
            relay_attempted: false,
            links: BTreeMap::new(),
            host_conn: None,
            timers: Timers::new(),
            diagnostics,
            last_ice_state: None,
            notifications: VecDeque::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    /// Start a lobby. Tears down any previous lobby first, then resets the
    /// relay flag, attempt counter, roster and diagnostics.
    pub fn initialize(&mut self, request: LobbyRequest, now: Instant) {
        if self.lobby.is_some() {
            self.teardown(now);
        }
        self.lobby = None;
        self.state = ConnectionState::Idle;
        self.error = None;
        self.roster.clear();
        self.diagnostics.reset(now);
        self.timers.clear();
        self.notifications.clear();
        self.last_ice_state = None;
        self.attempt = 0;
        self.relay_mode = false;
        self.relay_attempted = false;

        if !request.enabled {
            self.diagnostics.push(now, "multiplayer disabled");
            return;
        }

        let host_id = host_peer_id(&request.game_id, &request.match_id);
        let local = match request.role {
            PeerRole::Host => LobbyPlayer::host(request.player_name),
            PeerRole::Client => LobbyPlayer::client(request.player_name, unix_millis()),
        };
        info!(host_id = %host_id, role = ?request.role, player = %local.id, "initializing lobby");
        self.diagnostics
            .push(now, format!("lobby {host_id} as {:?}", request.role));
        self.roster.upsert(local.clone());
        self.lobby = Some(Lobby {
            host_id,
            role: request.role,
            local,
        });
        self.alive = true;
        self.start_attempt(now);
    }

    /// Host only: tell everyone the game is starting, then raise the local
    /// notification. Returns false (and does nothing) for clients or before
    /// the host is registered.
    pub fn start_game(&mut self) -> bool {
        if !self.alive || !self.is_host() || !self.is_connected() {
            return false;
        }
        let now = Instant::now();
        let sent = self.broadcast_except(now, &LobbyMessage::StartGame, None);
        self.diagnostics
            .push(now, format!("game started ({sent} players notified)"));
        info!(players = sent, "starting game");
        self.notifications.push_back(LobbyNotification::GameStarted);
        true
    }

    /// Best-effort send to every open channel. Returns how many sends
    /// succeeded; failures are logged and skipped.
    pub fn broadcast(&mut self, message: &LobbyMessage) -> usize {
        self.broadcast_except(Instant::now(), message, None)
    }

    pub fn set_ready(&mut self, ready: bool) {
        self.update_local(|p| p.is_ready = ready);
    }

    pub fn set_name(&mut self, name: &str) {
        self.update_local(|p| p.name = name.to_string());
    }

    /// Close every channel, destroy the peer, cancel every timer. A client
    /// announces `player-left` first. Safe to call repeatedly and after a
    /// failure.
    pub fn teardown(&mut self, now: Instant) {
        if !self.alive {
            return;
        }
        if let (Some(conn), Some(lobby)) = (self.host_conn, &self.lobby) {
            let goodbye = LobbyMessage::PlayerLeft {
                player_id: lobby.local.id.clone(),
            };
            if self.links.get(&conn).is_some_and(|l| l.open) {
                self.send_to(now, conn, &goodbye);
            }
        }
        self.timers.clear();
        self.drop_peer();
        self.alive = false;
        self.state = ConnectionState::Closed;
        self.diagnostics.push(now, "lobby closed");
        info!("lobby torn down");
    }

    // -----------------------------------------------------------------------
    // Driving
    // -----------------------------------------------------------------------

    /// Handle everything already queued on the event channel.
    pub fn process_pending(&mut self, now: Instant) -> usize {
        let mut handled = 0;
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event, now);
            handled += 1;
        }
        handled
    }

    /// Process events and timers until `deadline`.
    pub fn pump(&mut self, deadline: Instant) {
        loop {
            let now = Instant::now();
            self.process_pending(now);
            self.fire_timers(now);
            if now >= deadline {
                break;
            }
            let wake = self
                .timers
                .next_deadline()
                .map_or(deadline, |at| at.min(deadline));
            let wait = wake.saturating_duration_since(now);
            match self.events.recv_timeout(wait) {
                Ok(event) => self.handle_event(event, Instant::now()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => std::thread::sleep(wait),
            }
        }
    }

    pub fn pump_for(&mut self, duration: Duration) {
        self.pump(Instant::now() + duration);
    }

    /// Fire every timer due at `now`.
    pub fn fire_timers(&mut self, now: Instant) {
        for timer in self.timers.take_expired(now) {
            if !self.alive {
                break;
            }
            match timer {
                TimerKind::AttemptTimeout { generation } => {
                    if generation == self.generation && self.peer_active && !self.peer_open {
                        self.fail_attempt(now, "signaling did not open in time".into());
                    }
                }
                TimerKind::RetryConnect => {
                    let waiting = matches!(
                        self.state,
                        ConnectionState::Connecting | ConnectionState::RelayRetry
                    );
                    if waiting && !self.peer_active {
                        self.start_attempt(now);
                    }
                }
                TimerKind::ChannelOpenTimeout { generation, conn } => {
                    let pending = generation == self.generation
                        && self.links.get(&conn).is_some_and(|l| !l.open);
                    if !pending {
                        continue;
                    }
                    if self.is_host() {
                        debug!(conn = %conn, "incoming link did not open, dropping");
                        self.diagnostics
                            .push(now, format!("incoming {conn} did not open"));
                        self.links.remove(&conn);
                        self.backend.close(conn);
                    } else if self.relay_attempted {
                        self.fail(now, LobbyError::HostUnreachable);
                    } else {
                        self.state = ConnectionState::Degraded;
                        self.diagnostics.push(now, "host channel did not open");
                        self.relay_restart(now);
                    }
                }
            }
        }
    }

    /// Apply one backend event.
    pub fn handle_event(&mut self, event: PeerEvent, now: Instant) {
        if !self.alive || !self.peer_active || event.generation != self.generation {
            debug!(generation = event.generation.0, "ignoring stale peer event");
            return;
        }
        match event.kind {
            PeerEventKind::Open { peer_id } => self.on_open(now, peer_id),
            PeerEventKind::Error(error) => self.on_signaling_error(now, error),
            PeerEventKind::Incoming { conn, remote_peer } => {
                self.on_incoming(now, conn, remote_peer)
            }
            PeerEventKind::ChannelOpen { conn } => self.on_channel_open(now, conn),
            PeerEventKind::Data { conn, payload } => self.on_data(now, conn, &payload),
            PeerEventKind::ChannelClosed { conn } => self.on_channel_closed(now, conn),
            PeerEventKind::IceState { conn, state } => self.on_ice_state(now, conn, state),
        }
    }

    pub fn poll_notifications(&mut self) -> Vec<LobbyNotification> {
        self.notifications.drain(..).collect()
    }

    // -----------------------------------------------------------------------
    // Observers
    // -----------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connecting(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Degraded | ConnectionState::RelayRetry
        )
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn players(&self) -> &[LobbyPlayer] {
        self.roster.players()
    }

    pub fn error(&self) -> Option<&LobbyError> {
        self.error.as_ref()
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn last_ice_state(&self) -> Option<IceState> {
        self.last_ice_state
    }

    pub fn relay_mode(&self) -> bool {
        self.relay_mode
    }

    pub fn host_peer_id(&self) -> Option<&str> {
        self.lobby.as_ref().map(|l| l.host_id.as_str())
    }

    pub fn local_player(&self) -> Option<&LobbyPlayer> {
        self.lobby.as_ref().map(|l| &l.local)
    }

    pub fn role(&self) -> Option<PeerRole> {
        self.lobby.as_ref().map(|l| l.role)
    }

    /// Attempt number within the current connect loop (1-based once started).
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Number of channels currently open.
    pub fn open_channels(&self) -> usize {
        self.links.values().filter(|l| l.open).count()
    }

    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // Connect loop
    // -----------------------------------------------------------------------

    fn is_host(&self) -> bool {
        self.lobby.as_ref().is_some_and(|l| l.role.is_host())
    }

    fn local_id(&self) -> Option<String> {
        self.lobby.as_ref().map(|l| l.local.id.clone())
    }

    fn start_attempt(&mut self, now: Instant) {
        let peer_id = match &self.lobby {
            Some(lobby) if lobby.role.is_host() => Some(lobby.host_id.clone()),
            Some(_) => None,
            None => return,
        };
        self.attempt += 1;
        self.generation = self.generation.next();
        self.peer_active = true;
        self.peer_open = false;
        self.state = if self.relay_mode {
            ConnectionState::RelayRetry
        } else {
            ConnectionState::Connecting
        };

        let relay = if self.relay_mode { " via relay" } else { "" };
        self.diagnostics.push(
            now,
            format!(
                "attempt {}/{}{relay}",
                self.attempt, self.config.max_attempts
            ),
        );
        info!(attempt = self.attempt, relay_only = self.relay_mode, "opening peer");

        let options = PeerOptions {
            peer_id,
            ice: self.config.ice.clone(),
            relay_only: self.relay_mode,
        };
        self.backend.open_peer(self.generation, options);
        self.timers.schedule(
            now + self.config.attempt_timeout(),
            TimerKind::AttemptTimeout {
                generation: self.generation,
            },
        );
    }

    /// Close every link and destroy the current peer object.
    fn drop_peer(&mut self) {
        self.timers.cancel_generation(self.generation);
        for conn in std::mem::take(&mut self.links).into_keys() {
            self.backend.close(conn);
        }
        self.host_conn = None;
        if self.peer_active {
            self.backend.destroy_peer(self.generation);
            self.peer_active = false;
        }
        self.peer_open = false;
    }

    /// The current attempt failed transiently: retry within budget or give up.
    fn fail_attempt(&mut self, now: Instant, reason: String) {
        self.drop_peer();
        if self.attempt < self.config.max_attempts {
            let delay = self.config.retry_delay(self.attempt);
            warn!(attempt = self.attempt, reason = %reason, "connect attempt failed, retrying");
            self.diagnostics.push(
                now,
                format!("{reason}; retrying in {} ms", delay.as_millis()),
            );
            self.timers.schedule(now + delay, TimerKind::RetryConnect);
        } else {
            self.diagnostics.push(
                now,
                format!("{reason}; giving up after {} attempts", self.attempt),
            );
            self.fail(now, LobbyError::SignalingExhausted);
        }
    }

    fn relay_restart(&mut self, now: Instant) {
        self.relay_attempted = true;
        self.relay_mode = true;
        info!("restarting through relay");
        self.diagnostics.push(now, "switching to relay-only transport");
        self.timers.clear();
        self.drop_peer();
        self.attempt = 0;
        self.state = ConnectionState::RelayRetry;
        self.start_attempt(now);
    }

    /// Our path failed before we connected.
    fn degrade(&mut self, now: Instant, reason: String) {
        self.diagnostics.push(now, reason);
        if self.relay_attempted {
            self.fail(now, LobbyError::RelayFailed);
        } else {
            self.state = ConnectionState::Degraded;
            self.relay_restart(now);
        }
    }

    fn fail(&mut self, now: Instant, error: LobbyError) {
        warn!(error = %error, "lobby failed");
        self.diagnostics.push(now, format!("failed: {error}"));
        self.timers.clear();
        self.drop_peer();
        self.state = ConnectionState::Failed;
        self.error = Some(error.clone());
        self.notifications.push_back(LobbyNotification::Failed(error));
    }

    fn mark_connected(&mut self, now: Instant) {
        if self.state == ConnectionState::Connected {
            return;
        }
        self.state = ConnectionState::Connected;
        let relay = if self.relay_mode { " (relay)" } else { "" };
        self.diagnostics.push(now, format!("connected{relay}"));
        self.notifications.push_back(LobbyNotification::Connected);
    }

    // -----------------------------------------------------------------------
    // Event handlers
    // -----------------------------------------------------------------------

    fn on_open(&mut self, now: Instant, peer_id: String) {
        self.peer_open = true;
        self.timers.cancel(TimerKind::AttemptTimeout {
            generation: self.generation,
        });
        let Some(lobby) = &self.lobby else {
            return;
        };
        if lobby.role.is_host() {
            info!(host_id = %peer_id, "host registered");
            self.diagnostics.push(now, format!("registered as {peer_id}"));
            self.mark_connected(now);
            return;
        }

        let host_id = lobby.host_id.clone();
        self.diagnostics
            .push(now, format!("signaling open as {peer_id}, dialing {host_id}"));
        match self.backend.connect(self.generation, &host_id) {
            Ok(conn) => {
                debug!(conn = %conn, host_id = %host_id, "dialing host");
                self.links.insert(
                    conn,
                    Link {
                        remote_peer: host_id,
                        open: false,
                        player_id: None,
                    },
                );
                self.host_conn = Some(conn);
                self.timers.schedule(
                    now + self.config.channel_open_timeout(),
                    TimerKind::ChannelOpenTimeout {
                        generation: self.generation,
                        conn,
                    },
                );
            }
            Err(e) => self.fail_attempt(now, format!("dial failed: {e}")),
        }
    }

    fn on_signaling_error(&mut self, now: Instant, error: SignalingError) {
        if error.is_transient() {
            if !self.is_host() && !self.is_connected() {
                self.fail_attempt(now, error.to_string());
            } else {
                debug!(error = %error, "ignoring transient signaling error");
            }
            return;
        }
        if self.is_connected() {
            // Open channels survive losing the signaling service.
            warn!(error = %error, "signaling error after connect");
            self.diagnostics.push(now, format!("signaling: {error}"));
            return;
        }
        self.fail(now, LobbyError::Signaling(error));
    }

    fn on_incoming(&mut self, now: Instant, conn: ConnId, remote_peer: String) {
        if !self.is_host() {
            debug!(conn = %conn, "client refusing incoming link");
            self.backend.close(conn);
            return;
        }
        self.diagnostics
            .push(now, format!("incoming link from {remote_peer}"));
        self.links.insert(
            conn,
            Link {
                remote_peer,
                open: false,
                player_id: None,
            },
        );
        self.timers.schedule(
            now + self.config.channel_open_timeout(),
            TimerKind::ChannelOpenTimeout {
                generation: self.generation,
                conn,
            },
        );
    }

    fn on_channel_open(&mut self, now: Instant, conn: ConnId) {
        let Some(link) = self.links.get_mut(&conn) else {
            debug!(conn = %conn, "open for unknown link");
            return;
        };
        link.open = true;
        let remote = link.remote_peer.clone();
        self.timers.cancel(TimerKind::ChannelOpenTimeout {
            generation: self.generation,
            conn,
        });
        let Some(local) = self.lobby.as_ref().map(|l| l.local.clone()) else {
            return;
        };

        if self.is_host() {
            self.diagnostics.push(now, format!("channel open: {remote}"));
            let known: Vec<LobbyPlayer> = self
                .roster
                .players()
                .iter()
                .filter(|p| p.id != local.id)
                .cloned()
                .collect();
            self.send_to(now, conn, &LobbyMessage::PlayerInfo { player: local });
            for player in known {
                self.send_to(now, conn, &LobbyMessage::PlayerInfo { player });
            }
        } else if self.host_conn == Some(conn) {
            self.mark_connected(now);
            self.send_to(now, conn, &LobbyMessage::PlayerInfo { player: local });
        }
    }

    fn on_data(&mut self, now: Instant, conn: ConnId, payload: &str) {
        if !self.links.get(&conn).is_some_and(|l| l.open) {
            debug!(conn = %conn, "data on unopened link");
            return;
        }
        let message = match LobbyMessage::from_json(payload) {
            Ok(m) => m,
            Err(e) => {
                warn!(conn = %conn, error = %e, "dropping malformed lobby message");
                self.diagnostics
                    .push(now, format!("malformed message on {conn}"));
                return;
            }
        };
        match message {
            LobbyMessage::PlayerInfo { player } => self.on_player_info(now, conn, player),
            LobbyMessage::PlayerLeft { player_id } => self.on_player_left(now, conn, player_id),
            LobbyMessage::StartGame => {
                if !self.is_host() && self.host_conn == Some(conn) {
                    self.diagnostics.push(now, "host started the game");
                    self.notifications.push_back(LobbyNotification::GameStarted);
                } else {
                    debug!(conn = %conn, "ignoring start-game from non-host");
                }
            }
        }
    }

    fn on_player_info(&mut self, now: Instant, conn: ConnId, player: LobbyPlayer) {
        if self.local_id().as_deref() == Some(player.id.as_str()) {
            return;
        }
        if !self.is_host() {
            if self.host_conn == Some(conn) && self.roster.upsert(player) {
                self.notifications.push_back(LobbyNotification::RosterChanged);
            }
            return;
        }

        if player.is_host {
            warn!(conn = %conn, "client claimed to be host");
            return;
        }
        let claimed_elsewhere = self
            .links
            .iter()
            .any(|(c, l)| *c != conn && l.player_id.as_deref() == Some(player.id.as_str()));
        let Some(link) = self.links.get_mut(&conn) else {
            return;
        };
        if link.player_id.is_none() && claimed_elsewhere {
            warn!(conn = %conn, claimed = %player.id, "player id already bound to another channel, closing");
            self.diagnostics
                .push(now, format!("duplicate player id {} on {conn}", player.id));
            self.links.remove(&conn);
            self.backend.close(conn);
            return;
        }
        let bound = link.player_id.get_or_insert_with(|| player.id.clone());
        if *bound != player.id {
            warn!(conn = %conn, bound = %bound, claimed = %player.id, "player-info for another player");
            return;
        }
        if self.roster.upsert(player.clone()) {
            self.notifications.push_back(LobbyNotification::RosterChanged);
            self.broadcast_except(now, &LobbyMessage::PlayerInfo { player }, Some(conn));
        }
    }

    fn on_player_left(&mut self, now: Instant, conn: ConnId, player_id: String) {
        if !self.is_host() {
            if self.host_conn == Some(conn)
                && self.local_id().as_deref() != Some(player_id.as_str())
                && self.roster.remove(&player_id).is_some()
            {
                self.diagnostics.push(now, format!("{player_id} left"));
                self.notifications.push_back(LobbyNotification::RosterChanged);
            }
            return;
        }
        let Some(link) = self.links.get_mut(&conn) else {
            return;
        };
        if link.player_id.as_deref() != Some(player_id.as_str()) {
            warn!(conn = %conn, player = %player_id, "player-left for a player this channel doesn't speak for");
            return;
        }
        link.player_id = None;
        self.remove_player(now, &player_id, Some(conn));
    }

    fn on_channel_closed(&mut self, now: Instant, conn: ConnId) {
        let Some(link) = self.links.remove(&conn) else {
            return;
        };
        if self.is_host() {
            self.diagnostics
                .push(now, format!("channel closed: {}", link.remote_peer));
            if let Some(id) = link.player_id {
                self.remove_player(now, &id, None);
            }
            return;
        }
        if self.host_conn != Some(conn) {
            return;
        }
        self.host_conn = None;
        if link.open {
            if let Some(id) = self.local_id() {
                self.roster.retain_only(&id);
            }
            self.notifications.push_back(LobbyNotification::RosterChanged);
            self.fail(now, LobbyError::HostLeft);
        } else {
            self.degrade(now, "host channel closed before opening".into());
        }
    }

    fn on_ice_state(&mut self, now: Instant, conn: ConnId, state: IceState) {
        self.last_ice_state = Some(state);
        self.diagnostics.push(now, format!("ice {conn}: {state:?}"));
        if !state.is_degraded() || !self.links.contains_key(&conn) {
            return;
        }
        if !self.is_connected() {
            self.degrade(now, format!("link degraded ({state:?})"));
        } else if self.is_host() {
            debug!(conn = %conn, state = ?state, "dropping degraded incoming link");
            self.backend.close(conn);
            self.on_channel_closed(now, conn);
        }
    }

    // -----------------------------------------------------------------------
    // Roster plumbing
    // -----------------------------------------------------------------------

    fn remove_player(&mut self, now: Instant, player_id: &str, except: Option<ConnId>) {
        if self.roster.remove(player_id).is_none() {
            return;
        }
        info!(player = %player_id, "player left");
        self.diagnostics.push(now, format!("{player_id} left"));
        self.notifications.push_back(LobbyNotification::RosterChanged);
        let message = LobbyMessage::PlayerLeft {
            player_id: player_id.to_string(),
        };
        self.broadcast_except(now, &message, except);
    }

    fn update_local(&mut self, change: impl FnOnce(&mut LobbyPlayer)) {
        let Some(lobby) = self.lobby.as_mut() else {
            return;
        };
        change(&mut lobby.local);
        let player = lobby.local.clone();
        if self.roster.upsert(player.clone()) {
            self.notifications.push_back(LobbyNotification::RosterChanged);
        }
        if self.alive {
            self.broadcast_except(Instant::now(), &LobbyMessage::PlayerInfo { player }, None);
        }
    }

    fn broadcast_except(
        &mut self,
        now: Instant,
        message: &LobbyMessage,
        except: Option<ConnId>,
    ) -> usize {
        let targets: Vec<ConnId> = self
            .links
            .iter()
            .filter(|(conn, link)| link.open && Some(**conn) != except)
            .map(|(conn, _)| *conn)
            .collect();
        targets
            .into_iter()
            .filter(|conn| self.send_to(now, *conn, message))
            .count()
    }

    fn send_to(&mut self, now: Instant, conn: ConnId, message: &LobbyMessage) -> bool {
        let payload = match message.to_json() {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "could not encode lobby message");
                return false;
            }
        };
        match self.backend.send(conn, &payload) {
            Ok(()) => true,
            Err(e) => {
                warn!(conn = %conn, error = %e, "send failed");
                self.diagnostics.push(now, format!("send to {conn} failed"));
                false
            }
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.teardown(Instant::now());
    }
}
