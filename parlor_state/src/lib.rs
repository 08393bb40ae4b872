// parlor_state — host-side match storage and reload survival.
//
// The host of a Parlor lobby owns the authoritative match state. This crate
// holds it in memory for the rules engine and snapshots it to durable local
// storage so a reload can pick the match back up.
//
// Module overview:
// - `store.rs`:    `StorageAdapter`, the storage contract the rules engine
//                  consumes, and `MatchStore`, its in-memory implementation.
// - `session.rs`:  `SessionStore` — TTL-bounded `PersistedSession` snapshots
//                  in a `KeyValueStore`, plus match snapshot/restore.
// - `kv.rs`:       `KeyValueStore` trait, `MemoryKv`, and the file-backed
//                  `FileKv`.
// - `clock.rs`:    Unix-millis clock trait with system and manual clocks.
// - `config.rs`:   `PersistConfig` (namespace, TTL).
//
// Neither half knows about the network. Connectivity failures in `parlor_net`
// therefore cannot corrupt the store or a persisted session.

pub mod clock;
pub mod config;
pub mod kv;
pub mod session;
pub mod store;

pub use clock::{Clock, ManualClock, SystemClock, unix_millis};
pub use config::PersistConfig;
pub use kv::{FileKv, KeyValueStore, KvError, MemoryKv};
pub use session::{PersistedSession, SessionStore};
pub use store::{FetchResult, FetchWants, ListFilter, MatchStore, StorageAdapter};
