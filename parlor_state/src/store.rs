// Game State Store — host-local, in-memory, multi-match storage.
//
// `MatchStore` is the only implementation of `StorageAdapter`, the storage
// contract an external turn-based rules engine is allowed to depend on. The
// host process owns the store exclusively; clients never see it and learn
// about state changes only through broadcast messages.
//
// Each match is spread across four maps (current state, initial state, log,
// metadata) so a rules engine can write one aspect without touching the
// others. `set_state` on an id that was never created is accepted and only
// populates the state map (and the log, if a delta is given); the store is
// ephemeral and enforces no uniqueness or existence rules.
//
// The log is append-only: `set_state` extends it, nothing truncates it, and
// only `wipe` drops it.
//
// See also: `session.rs`, which snapshots a match out of this store into
// durable storage and restores it after a reload.

use rustc_hash::FxHashMap;
use serde_json::Value;

/// Which parts of a match record `fetch` should return.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FetchWants {
    pub state: bool,
    pub initial_state: bool,
    pub log: bool,
    pub metadata: bool,
}

impl FetchWants {
    /// Request every part of the record.
    pub const ALL: FetchWants = FetchWants {
        state: true,
        initial_state: true,
        log: true,
        metadata: true,
    };
}

/// Subset of a match record. Fields not requested, or belonging to an unknown
/// match, are `None`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FetchResult {
    pub state: Option<Value>,
    pub initial_state: Option<Value>,
    pub log: Option<Vec<Value>>,
    pub metadata: Option<Value>,
}

impl FetchResult {
    /// True when nothing at all came back.
    pub fn is_empty(&self) -> bool {
        self.state.is_none()
            && self.initial_state.is_none()
            && self.log.is_none()
            && self.metadata.is_none()
    }
}

/// Filter for `list_matches`.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Only matches whose metadata has `"gameName": <this>`.
    pub game_name: Option<String>,
}

/// Storage contract consumed by the rules engine. This is the full surface
/// the engine may depend on.
pub trait StorageAdapter {
    /// Store `initial_state` as both the initial and current snapshot, with an
    /// empty log. Silently replaces any existing record under `match_id`.
    fn create_match(&mut self, match_id: &str, initial_state: Value, metadata: Value);

    /// Replace the current snapshot and append `delta_log` (if any).
    fn set_state(&mut self, match_id: &str, state: Value, delta_log: Option<Vec<Value>>);

    /// Replace the stored metadata wholesale.
    fn set_metadata(&mut self, match_id: &str, metadata: Value);

    /// Return the requested subset of the record. Unknown ids yield an empty
    /// result, never an error.
    fn fetch(&self, match_id: &str, wants: FetchWants) -> FetchResult;

    /// Drop every part of the record.
    fn wipe(&mut self, match_id: &str);

    /// Ids of every known match, sorted.
    fn list_matches(&self, filter: &ListFilter) -> Vec<String>;
}

/// In-memory `StorageAdapter`.
#[derive(Default)]
pub struct MatchStore {
    state: FxHashMap<String, Value>,
    initial: FxHashMap<String, Value>,
    log: FxHashMap<String, Vec<Value>>,
    metadata: FxHashMap<String, Value>,
}

impl MatchStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of log entries recorded for a match (0 if unknown).
    pub fn log_len(&self, match_id: &str) -> usize {
        self.log.get(match_id).map_or(0, Vec::len)
    }
}

impl StorageAdapter for MatchStore {
    fn create_match(&mut self, match_id: &str, initial_state: Value, metadata: Value) {
        tracing::debug!(match_id, "create match");
        self.initial.insert(match_id.into(), initial_state.clone());
        self.state.insert(match_id.into(), initial_state);
        self.log.insert(match_id.into(), Vec::new());
        self.metadata.insert(match_id.into(), metadata);
    }

    fn set_state(&mut self, match_id: &str, state: Value, delta_log: Option<Vec<Value>>) {
        self.state.insert(match_id.into(), state);
        if let Some(delta) = delta_log {
            self.log.entry(match_id.into()).or_default().extend(delta);
        }
    }

    fn set_metadata(&mut self, match_id: &str, metadata: Value) {
        self.metadata.insert(match_id.into(), metadata);
    }

    fn fetch(&self, match_id: &str, wants: FetchWants) -> FetchResult {
        FetchResult {
            state: wants
                .state
                .then(|| self.state.get(match_id).cloned())
                .flatten(),
            initial_state: wants
                .initial_state
                .then(|| self.initial.get(match_id).cloned())
                .flatten(),
            log: wants.log.then(|| self.log.get(match_id).cloned()).flatten(),
            metadata: wants
                .metadata
                .then(|| self.metadata.get(match_id).cloned())
                .flatten(),
        }
    }

    fn wipe(&mut self, match_id: &str) {
        tracing::debug!(match_id, "wipe match");
        self.state.remove(match_id);
        self.initial.remove(match_id);
        self.log.remove(match_id);
        self.metadata.remove(match_id);
    }

    fn list_matches(&self, filter: &ListFilter) -> Vec<String> {
        let mut ids: Vec<String> = self
            .state
            .keys()
            .chain(self.initial.keys())
            .chain(self.log.keys())
            .chain(self.metadata.keys())
            .filter(|id| match &filter.game_name {
                None => true,
                Some(name) => self
                    .metadata
                    .get(id.as_str())
                    .and_then(|m| m.get("gameName"))
                    .and_then(Value::as_str)
                    == Some(name.as_str()),
            })
            .cloned()
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }
}
