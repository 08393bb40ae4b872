// Test-only lobby driver for multiplayer integration tests.
//
// Wraps real `ConnectionManager`s (from `parlor_net`) so a test can run a
// host and several clients on one thread: `TestLobby::pump_until` gives every
// participant a short `pump` slice in turn until a condition holds, and
// panics with a description if it doesn't within the timeout. The managers,
// backends, and signal server are the production code paths; the only
// test-specific code is this round-robin polling.
//
// See also: `tests/lobby_pipeline.rs` for the scenarios.

use std::time::{Duration, Instant};

use parlor_net::{
    ConnectionManager, LobbyError, LobbyNotification, LobbyRequest, LoopbackNetwork, NetConfig,
};

/// Default timeout for `pump_until`.
const PUMP_TIMEOUT: Duration = Duration::from_secs(5);

/// Time slice each participant gets per round.
const PUMP_SLICE: Duration = Duration::from_millis(5);

/// Config with short timers so failure paths finish quickly.
pub fn fast_config() -> NetConfig {
    NetConfig {
        max_attempts: 3,
        attempt_timeout_ms: 500,
        retry_base_delay_ms: 20,
        channel_open_timeout_ms: 300,
        ..NetConfig::default()
    }
}

/// One participant: a manager plus every notification it has raised.
pub struct TestPeer {
    pub manager: ConnectionManager,
    pub notifications: Vec<LobbyNotification>,
}

impl TestPeer {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            notifications: Vec::new(),
        }
    }

    pub fn join(&mut self, request: LobbyRequest) {
        self.manager.initialize(request, Instant::now());
    }

    fn pump(&mut self) {
        self.manager.pump_for(PUMP_SLICE);
        self.notifications
            .extend(self.manager.poll_notifications());
    }

    pub fn roster_ids(&self) -> Vec<String> {
        self.manager.players().iter().map(|p| p.id.clone()).collect()
    }

    pub fn local_id(&self) -> String {
        self.manager
            .local_player()
            .map(|p| p.id.clone())
            .unwrap_or_default()
    }

    pub fn saw(&self, notification: &LobbyNotification) -> bool {
        self.notifications.contains(notification)
    }

    pub fn failed_with(&self) -> Option<&LobbyError> {
        self.manager.error()
    }
}

/// A set of participants driven together.
#[derive(Default)]
pub struct TestLobby {
    pub peers: Vec<TestPeer>,
}

impl TestLobby {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a participant on `network`; returns its index.
    pub fn add_loopback(&mut self, network: &LoopbackNetwork, config: NetConfig) -> usize {
        self.add(ConnectionManager::on_loopback(network, config))
    }

    /// Add a participant talking to the signal server at `addr`.
    pub fn add_tcp(&mut self, addr: &str, config: NetConfig) -> usize {
        self.add(ConnectionManager::over_tcp(addr, config))
    }

    fn add(&mut self, manager: ConnectionManager) -> usize {
        self.peers.push(TestPeer::new(manager));
        self.peers.len() - 1
    }

    pub fn peer(&mut self, index: usize) -> &mut TestPeer {
        &mut self.peers[index]
    }

    /// Pump every participant round-robin until `done` holds.
    pub fn pump_until(&mut self, what: &str, mut done: impl FnMut(&TestLobby) -> bool) {
        let start = Instant::now();
        while !done(self) {
            assert!(start.elapsed() < PUMP_TIMEOUT, "timed out waiting for {what}");
            for peer in &mut self.peers {
                peer.pump();
            }
        }
    }

    /// Pump everyone for a fixed duration.
    pub fn pump_for(&mut self, duration: Duration) {
        let start = Instant::now();
        while start.elapsed() < duration {
            for peer in &mut self.peers {
                peer.pump();
            }
        }
    }

    /// True when every participant's roster holds exactly `ids`, in any
    /// order. Beyond the host sorting first, roster order is arrival order
    /// and differs between participants.
    pub fn same_players(&self, ids: &[String]) -> bool {
        let mut want = ids.to_vec();
        want.sort();
        self.peers.iter().all(|p| {
            let mut have = p.roster_ids();
            have.sort();
            have == want
        })
    }
}
