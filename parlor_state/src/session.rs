// Session Persistence — TTL-bounded local snapshots of a match.
//
// `SessionStore` lets a host's match survive a reload. It serializes a
// `PersistedSession` to JSON under `"<namespace>:<matchID>"` in any
// `KeyValueStore` and treats the entry as alive until `now - updatedAt`
// exceeds the configured TTL. Every successful read, write, or touch moves
// `updatedAt` forward, so an actively played match never expires.
//
// Fault policy: nothing here returns an error to the caller. Storage faults
// degrade to "no session":
// - absent, unparsable, or expired entries read as `None`, and the unparsable
//   or expired ones are deleted as a side effect of the read;
// - a quota failure on save triggers `cleanup_expired_sessions()` and reports
//   the save as not landed. The failed write itself is not retried.
// Faults are logged through `tracing` so they remain diagnosable.
//
// `snapshot_match` / `restore_match` bridge to the Game State Store
// (`store.rs`): the host snapshots after each state change and restores on
// startup after a reload.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock::{Clock, SystemClock};
use crate::config::PersistConfig;
use crate::kv::{KeyValueStore, KvError};
use crate::store::{FetchWants, StorageAdapter};

/// Durable snapshot of one match. Field names match the browser storage
/// layout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PersistedSession {
    #[serde(rename = "matchID")]
    pub match_id: String,
    #[serde(rename = "gameName")]
    pub game_name: String,
    #[serde(rename = "numPlayers")]
    pub num_players: u32,
    pub state: Value,
    #[serde(rename = "initialState")]
    pub initial_state: Value,
    pub log: Vec<Value>,
    pub metadata: Value,
    /// Unix millis.
    #[serde(rename = "createdAt")]
    pub created_at: u64,
    /// Unix millis.
    #[serde(rename = "updatedAt")]
    pub updated_at: u64,
}

impl PersistedSession {
    /// A fresh session whose current state is its initial state.
    pub fn new(
        match_id: impl Into<String>,
        game_name: impl Into<String>,
        num_players: u32,
        initial_state: Value,
        metadata: Value,
        now_ms: u64,
    ) -> Self {
        Self {
            match_id: match_id.into(),
            game_name: game_name.into(),
            num_players,
            state: initial_state.clone(),
            initial_state,
            log: Vec::new(),
            metadata,
            created_at: now_ms,
            updated_at: now_ms,
        }
    }
}

/// Reads and writes `PersistedSession`s in a `KeyValueStore`.
pub struct SessionStore<K: KeyValueStore> {
    kv: K,
    config: PersistConfig,
    clock: Box<dyn Clock>,
}

impl<K: KeyValueStore> SessionStore<K> {
    pub fn new(kv: K, config: PersistConfig) -> Self {
        Self::with_clock(kv, config, Box::new(SystemClock))
    }

    pub fn with_clock(kv: K, config: PersistConfig, clock: Box<dyn Clock>) -> Self {
        Self { kv, config, clock }
    }

    pub fn kv(&self) -> &K {
        &self.kv
    }

    pub fn kv_mut(&mut self) -> &mut K {
        &mut self.kv
    }

    pub fn config(&self) -> &PersistConfig {
        &self.config
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    /// Storage key for a match.
    pub fn key_for(&self, match_id: &str) -> String {
        format!("{}:{}", self.config.namespace, match_id)
    }

    fn prefix(&self) -> String {
        format!("{}:", self.config.namespace)
    }

    fn is_expired(&self, session: &PersistedSession, now: u64) -> bool {
        now.saturating_sub(session.updated_at) > self.config.ttl_ms
    }

    /// Stamp `updatedAt = now` and write the session. Returns whether the
    /// write landed.
    pub fn save_session(&mut self, mut session: PersistedSession) -> bool {
        session.updated_at = self.clock.now_ms();
        let key = self.key_for(&session.match_id);
        let json = match serde_json::to_string(&session) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(match_id = %session.match_id, error = %e, "session not serializable");
                return false;
            }
        };
        match self.kv.set(&key, &json) {
            Ok(()) => true,
            Err(KvError::QuotaExceeded { needed, quota }) => {
                tracing::warn!(
                    match_id = %session.match_id,
                    needed,
                    quota,
                    "storage quota exceeded, sweeping expired sessions"
                );
                let removed = self.cleanup_expired_sessions();
                tracing::info!(removed, "expired sessions removed after quota failure");
                false
            }
            Err(e) => {
                tracing::warn!(match_id = %session.match_id, error = %e, "session save failed");
                false
            }
        }
    }

    /// Read a live session without refreshing it. Corrupt or expired entries
    /// are deleted.
    fn read_live(&mut self, match_id: &str) -> Option<PersistedSession> {
        let key = self.key_for(match_id);
        let raw = match self.kv.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(match_id, error = %e, "session read failed");
                return None;
            }
        };
        let now = self.clock.now_ms();
        match serde_json::from_str::<PersistedSession>(&raw) {
            Ok(session) if !self.is_expired(&session, now) => Some(session),
            Ok(_) => {
                tracing::debug!(match_id, "session expired, removing");
                self.remove_key(&key);
                None
            }
            Err(e) => {
                tracing::warn!(match_id, error = %e, "corrupt session, removing");
                self.remove_key(&key);
                None
            }
        }
    }

    fn remove_key(&mut self, key: &str) {
        if let Err(e) = self.kv.remove(key) {
            tracing::warn!(key, error = %e, "failed to remove session entry");
        }
    }

    /// Load a live session, refreshing its `updatedAt`. `None` if absent,
    /// corrupt, or expired.
    pub fn load_session(&mut self, match_id: &str) -> Option<PersistedSession> {
        let mut session = self.read_live(match_id)?;
        session.updated_at = self.clock.now_ms();
        // A failed refresh still returns the data we read.
        self.save_session(session.clone());
        Some(session)
    }

    /// Patch the current state (and log, if given) of an existing session.
    /// Creates nothing when there is no live session. Returns whether a
    /// session was updated and written.
    pub fn update_session_state(
        &mut self,
        match_id: &str,
        state: Value,
        log: Option<Vec<Value>>,
    ) -> bool {
        let Some(mut session) = self.read_live(match_id) else {
            return false;
        };
        session.state = state;
        if let Some(log) = log {
            session.log = log;
        }
        self.save_session(session)
    }

    /// Refresh `updatedAt` of an existing session. No-op if absent.
    pub fn touch_session(&mut self, match_id: &str) -> bool {
        match self.read_live(match_id) {
            Some(session) => self.save_session(session),
            None => false,
        }
    }

    /// Remove a session regardless of its age.
    pub fn delete_session(&mut self, match_id: &str) {
        let key = self.key_for(match_id);
        self.remove_key(&key);
    }

    /// Delete every namespaced entry that is unparsable or past its TTL.
    /// Returns how many were removed.
    pub fn cleanup_expired_sessions(&mut self) -> usize {
        let keys = match self.kv.scan_keys(&self.prefix()) {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "session scan failed");
                return 0;
            }
        };
        let now = self.clock.now_ms();
        let mut removed = 0;
        for key in keys {
            let dead = match self.kv.get(&key) {
                Ok(Some(raw)) => match serde_json::from_str::<PersistedSession>(&raw) {
                    Ok(session) => self.is_expired(&session, now),
                    Err(_) => true,
                },
                Ok(None) => false,
                Err(e) => {
                    tracing::warn!(key, error = %e, "session read failed during cleanup");
                    false
                }
            };
            if dead {
                self.remove_key(&key);
                removed += 1;
            }
        }
        removed
    }

    /// Every live session, sorted by match id. Does not refresh them.
    pub fn list_sessions(&mut self) -> Vec<PersistedSession> {
        let keys = match self.kv.scan_keys(&self.prefix()) {
            Ok(keys) => keys,
            Err(e) => {
                tracing::warn!(error = %e, "session scan failed");
                return Vec::new();
            }
        };
        let prefix_len = self.prefix().len();
        keys.iter()
            .filter_map(|key| self.read_live(&key[prefix_len..]))
            .collect()
    }

    /// Persist the match record currently held in `store`. An existing live
    /// session keeps its `createdAt`. Returns false if the store has no state
    /// for `match_id` or the write did not land.
    pub fn snapshot_match(
        &mut self,
        store: &impl StorageAdapter,
        match_id: &str,
        game_name: &str,
        num_players: u32,
    ) -> bool {
        let record = store.fetch(match_id, FetchWants::ALL);
        let Some(state) = record.state else {
            return false;
        };
        let now = self.clock.now_ms();
        let created_at = self
            .read_live(match_id)
            .map_or(now, |existing| existing.created_at);
        let session = PersistedSession {
            match_id: match_id.into(),
            game_name: game_name.into(),
            num_players,
            initial_state: record.initial_state.unwrap_or_else(|| state.clone()),
            state,
            log: record.log.unwrap_or_default(),
            metadata: record.metadata.unwrap_or(Value::Null),
            created_at,
            updated_at: now,
        };
        self.save_session(session)
    }

    /// Recreate a persisted match inside `store` after a reload. Returns
    /// whether a live session was found and restored.
    pub fn restore_match(&mut self, store: &mut impl StorageAdapter, match_id: &str) -> bool {
        let Some(session) = self.load_session(match_id) else {
            return false;
        };
        store.create_match(match_id, session.initial_state, session.metadata);
        store.set_state(match_id, session.state, Some(session.log));
        tracing::info!(match_id, "match restored from persisted session");
        true
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::clock::ManualClock;
    use crate::kv::MemoryKv;
    use crate::store::{ListFilter, MatchStore};

    const T0: u64 = 1_700_000_000_000;

    fn store_at(clock: &ManualClock) -> SessionStore<MemoryKv> {
        SessionStore::with_clock(
            MemoryKv::new(),
            PersistConfig {
                namespace: "test".into(),
                ttl_ms: 60_000,
            },
            Box::new(clock.clone()),
        )
    }

    fn sample(match_id: &str) -> PersistedSession {
        PersistedSession::new(
            match_id,
            "trivia",
            2,
            json!({"round": 0}),
            json!({"gameName": "trivia"}),
            T0,
        )
    }

    #[test]
    fn save_then_load_only_advances_updated_at() {
        let clock = ManualClock::new(T0);
        let mut sessions = store_at(&clock);
        let original = sample("m1");
        assert!(sessions.save_session(original.clone()));

        clock.advance(1_000);
        let loaded = sessions.load_session("m1").unwrap();
        assert_eq!(loaded.updated_at, T0 + 1_000);
        assert_eq!(
            PersistedSession {
                updated_at: original.updated_at,
                ..loaded
            },
            original
        );
    }

    #[test]
    fn stored_json_uses_browser_layout() {
        let clock = ManualClock::new(T0);
        let mut sessions = store_at(&clock);
        sessions.save_session(sample("m1"));

        let raw = sessions.kv().get("test:m1").unwrap().unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        for field in [
            "matchID",
            "gameName",
            "numPlayers",
            "state",
            "initialState",
            "log",
            "metadata",
            "createdAt",
            "updatedAt",
        ] {
            assert!(value.get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn expired_session_is_absent_and_deleted() {
        let clock = ManualClock::new(T0);
        let mut sessions = store_at(&clock);
        let mut stale = sample("old");
        stale.updated_at = T0 - 60_001;
        let raw = serde_json::to_string(&stale).unwrap();
        sessions.kv_mut().set("test:old", &raw).unwrap();

        assert!(sessions.load_session("old").is_none());
        assert_eq!(sessions.kv().get("test:old").unwrap(), None);
    }

    #[test]
    fn session_exactly_at_ttl_is_still_alive() {
        let clock = ManualClock::new(T0);
        let mut sessions = store_at(&clock);
        sessions.save_session(sample("m1"));
        clock.advance(60_000);
        assert!(sessions.load_session("m1").is_some());
    }

    #[test]
    fn corrupt_session_is_absent_and_deleted() {
        let clock = ManualClock::new(T0);
        let mut sessions = store_at(&clock);
        sessions.kv_mut().set("test:bad", "{oops").unwrap();
        assert!(sessions.load_session("bad").is_none());
        assert!(sessions.kv().is_empty());
    }

    #[test]
    fn reads_keep_a_session_alive() {
        let clock = ManualClock::new(T0);
        let mut sessions = store_at(&clock);
        sessions.save_session(sample("m1"));
        for _ in 0..5 {
            clock.advance(50_000);
            assert!(sessions.load_session("m1").is_some());
        }
    }

    #[test]
    fn update_patches_state_and_log() {
        let clock = ManualClock::new(T0);
        let mut sessions = store_at(&clock);
        sessions.save_session(sample("m1"));

        assert!(sessions.update_session_state(
            "m1",
            json!({"round": 3}),
            Some(vec![json!({"answer": "b"})])
        ));
        let s = sessions.load_session("m1").unwrap();
        assert_eq!(s.state, json!({"round": 3}));
        assert_eq!(s.log, vec![json!({"answer": "b"})]);
        assert_eq!(s.initial_state, json!({"round": 0}));
    }

    #[test]
    fn update_without_session_creates_nothing() {
        let clock = ManualClock::new(T0);
        let mut sessions = store_at(&clock);
        assert!(!sessions.update_session_state("ghost", json!(1), None));
        assert!(sessions.kv().is_empty());
    }

    #[test]
    fn touch_refreshes_and_ignores_missing() {
        let clock = ManualClock::new(T0);
        let mut sessions = store_at(&clock);
        sessions.save_session(sample("m1"));
        clock.advance(59_000);
        assert!(sessions.touch_session("m1"));
        clock.advance(59_000);
        assert!(sessions.load_session("m1").is_some());
        assert!(!sessions.touch_session("ghost"));
        assert_eq!(sessions.kv().len(), 1);
    }

    #[test]
    fn cleanup_removes_only_dead_namespaced_entries() {
        let clock = ManualClock::new(T0);
        let mut sessions = store_at(&clock);
        sessions.save_session(sample("fresh"));
        let mut stale = sample("stale");
        stale.updated_at = T0 - 120_000;
        let raw = serde_json::to_string(&stale).unwrap();
        sessions.kv_mut().set("test:stale", &raw).unwrap();
        sessions.kv_mut().set("test:junk", "[]").unwrap();
        sessions.kv_mut().set("other:junk", "[]").unwrap();

        assert_eq!(sessions.cleanup_expired_sessions(), 2);
        assert_eq!(
            sessions.kv().scan_keys("").unwrap(),
            vec!["other:junk", "test:fresh"]
        );
    }

    #[test]
    fn quota_failure_sweeps_expired_sessions() {
        let clock = ManualClock::new(T0);
        let mut sessions = SessionStore::with_clock(
            MemoryKv::with_quota(800),
            PersistConfig {
                namespace: "test".into(),
                ttl_ms: 60_000,
            },
            Box::new(clock.clone()),
        );
        assert!(sessions.save_session(sample("a")));
        clock.advance(120_000);

        let mut big = sample("b");
        big.state = json!("x".repeat(500));
        assert!(!sessions.save_session(big.clone()));
        // The expired session made room, but the failed write is not retried.
        assert!(sessions.kv().is_empty());
        assert!(sessions.save_session(big));
    }

    #[test]
    fn list_sessions_skips_dead_entries() {
        let clock = ManualClock::new(T0);
        let mut sessions = store_at(&clock);
        sessions.save_session(sample("b"));
        sessions.save_session(sample("a"));
        sessions.kv_mut().set("test:c", "garbage").unwrap();

        let ids: Vec<String> = sessions
            .list_sessions()
            .into_iter()
            .map(|s| s.match_id)
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn snapshot_and_restore_through_match_store() {
        let clock = ManualClock::new(T0);
        let mut sessions = store_at(&clock);

        let mut host_store = MatchStore::new();
        host_store.create_match("m1", json!({"score": 0}), json!({"gameName": "trivia"}));
        host_store.set_state("m1", json!({"score": 4}), Some(vec![json!("q1")]));
        assert!(sessions.snapshot_match(&host_store, "m1", "trivia", 3));

        clock.advance(5_000);
        host_store.set_state("m1", json!({"score": 9}), Some(vec![json!("q2")]));
        assert!(sessions.snapshot_match(&host_store, "m1", "trivia", 3));

        // Page reload: a fresh store comes back from the snapshot.
        let mut reloaded = MatchStore::new();
        assert!(sessions.restore_match(&mut reloaded, "m1"));
        let r = reloaded.fetch("m1", FetchWants::ALL);
        assert_eq!(r.state, Some(json!({"score": 9})));
        assert_eq!(r.initial_state, Some(json!({"score": 0})));
        assert_eq!(r.log, Some(vec![json!("q1"), json!("q2")]));
        assert_eq!(reloaded.list_matches(&ListFilter::default()), vec!["m1"]);

        let persisted = sessions.load_session("m1").unwrap();
        assert_eq!(persisted.created_at, T0);
        assert_eq!(persisted.num_players, 3);
    }

    #[test]
    fn snapshot_of_unknown_match_writes_nothing() {
        let clock = ManualClock::new(T0);
        let mut sessions = store_at(&clock);
        assert!(!sessions.snapshot_match(&MatchStore::new(), "nope", "trivia", 2));
        assert!(sessions.kv().is_empty());
    }
}
