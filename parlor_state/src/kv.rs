// Minimal key-value storage seam behind Session Persistence.
//
// `KeyValueStore` is the four-call surface a browser-style local store offers
// (`get`, `set`, `remove`, prefix scan). Session Persistence only ever talks to
// this trait, so any embedded persistent store can back it.
//
// Two implementations:
// - `MemoryKv`: a `BTreeMap` with an optional byte quota. Used in tests and by
//   hosts that don't need reload survival.
// - `FileKv`: the same map mirrored to a single JSON file, rewritten through a
//   temp file + rename on every mutation so a crash never leaves a half-written
//   store behind.
//
// Both count quota the way browsers do: the sum of key and value lengths.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Key-value storage failures.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("storage quota exceeded: {needed} bytes needed, {quota} allowed")]
    QuotaExceeded { needed: usize, quota: usize },
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Durable string-to-string storage.
pub trait KeyValueStore {
    fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    fn set(&mut self, key: &str, value: &str) -> Result<(), KvError>;
    fn remove(&mut self, key: &str) -> Result<(), KvError>;
    /// Every key starting with `prefix`, in sorted order.
    fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, KvError>;
}

/// Quota-aware map shared by both implementations.
#[derive(Clone, Debug, Default)]
struct QuotaMap {
    entries: BTreeMap<String, String>,
    quota: Option<usize>,
}

impl QuotaMap {
    fn usage(&self) -> usize {
        self.entries.iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    fn check_insert(&self, key: &str, value: &str) -> Result<(), KvError> {
        let Some(quota) = self.quota else {
            return Ok(());
        };
        let replaced = self.entries.get(key).map_or(0, |old| key.len() + old.len());
        let needed = self.usage() - replaced + key.len() + value.len();
        if needed > quota {
            return Err(KvError::QuotaExceeded { needed, quota });
        }
        Ok(())
    }

    fn scan(&self, prefix: &str) -> Vec<String> {
        self.entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect()
    }
}

/// In-memory store with an optional byte quota.
#[derive(Clone, Debug, Default)]
pub struct MemoryKv {
    map: QuotaMap,
}

impl MemoryKv {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that refuses writes pushing total usage past `quota` bytes.
    pub fn with_quota(quota: usize) -> Self {
        Self {
            map: QuotaMap {
                entries: BTreeMap::new(),
                quota: Some(quota),
            },
        }
    }

    pub fn len(&self) -> usize {
        self.map.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.entries.is_empty()
    }
}

impl KeyValueStore for MemoryKv {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.map.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), KvError> {
        self.map.check_insert(key, value)?;
        self.map.entries.insert(key.into(), value.into());
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), KvError> {
        self.map.entries.remove(key);
        Ok(())
    }

    fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        Ok(self.map.scan(prefix))
    }
}

/// Store persisted as one JSON object on disk.
#[derive(Debug)]
pub struct FileKv {
    path: PathBuf,
    map: QuotaMap,
}

impl FileKv {
    /// Open (or lazily create) the store at `path`. A missing file is an empty
    /// store; an unreadable one is an error.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, KvError> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(text) => serde_json::from_str(&text)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path,
            map: QuotaMap {
                entries,
                quota: None,
            },
        })
    }

    /// Apply a byte quota to subsequent writes.
    pub fn with_quota(mut self, quota: usize) -> Self {
        self.map.quota = Some(quota);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) -> Result<(), KvError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir)?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(&self.map.entries)?)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileKv {
    fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        Ok(self.map.entries.get(key).cloned())
    }

    fn set(&mut self, key: &str, value: &str) -> Result<(), KvError> {
        self.map.check_insert(key, value)?;
        let previous = self.map.entries.insert(key.into(), value.into());
        if let Err(e) = self.flush() {
            // Keep memory and disk in agreement.
            match previous {
                Some(old) => self.map.entries.insert(key.into(), old),
                None => self.map.entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), KvError> {
        let Some(old) = self.map.entries.remove(key) else {
            return Ok(());
        };
        if let Err(e) = self.flush() {
            self.map.entries.insert(key.into(), old);
            return Err(e);
        }
        Ok(())
    }

    fn scan_keys(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        Ok(self.map.scan(prefix))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_set_get_remove() {
        let mut kv = MemoryKv::new();
        kv.set("a", "1").unwrap();
        assert_eq!(kv.get("a").unwrap().as_deref(), Some("1"));
        kv.remove("a").unwrap();
        assert_eq!(kv.get("a").unwrap(), None);
        kv.remove("a").unwrap();
    }

    #[test]
    fn scan_respects_prefix_boundary() {
        let mut kv = MemoryKv::new();
        kv.set("ns:1", "x").unwrap();
        kv.set("ns:2", "x").unwrap();
        kv.set("nt:1", "x").unwrap();
        kv.set("n", "x").unwrap();
        assert_eq!(kv.scan_keys("ns:").unwrap(), vec!["ns:1", "ns:2"]);
    }

    #[test]
    fn quota_rejects_growth_but_allows_shrinking_overwrite() {
        let mut kv = MemoryKv::with_quota(10);
        kv.set("k", "123456789").unwrap(); // 10 bytes
        let err = kv.set("j", "1").unwrap_err();
        assert!(matches!(err, KvError::QuotaExceeded { needed: 12, quota: 10 }));
        kv.set("k", "1").unwrap();
        kv.set("j", "1").unwrap();
        assert_eq!(kv.len(), 2);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sessions.json");
        {
            let mut kv = FileKv::open(&path).unwrap();
            kv.set("ns:m1", "{}").unwrap();
            kv.set("ns:m2", "[]").unwrap();
            kv.remove("ns:m2").unwrap();
        }
        let kv = FileKv::open(&path).unwrap();
        assert_eq!(kv.get("ns:m1").unwrap().as_deref(), Some("{}"));
        assert_eq!(kv.scan_keys("ns:").unwrap(), vec!["ns:m1"]);
    }

    #[test]
    fn file_store_quota_leaves_disk_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        let mut kv = FileKv::open(&path).unwrap().with_quota(4);
        assert!(kv.set("key", "value").is_err());
        assert!(!path.exists());
    }

    #[test]
    fn failed_flush_keeps_memory_matching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        let mut kv = FileKv::open(&path).unwrap();
        kv.set("ns:m1", "{}").unwrap();

        // A directory where the temp file goes makes every flush fail.
        fs::create_dir(path.with_extension("tmp")).unwrap();
        assert!(matches!(kv.remove("ns:m1"), Err(KvError::Io(_))));
        assert_eq!(kv.get("ns:m1").unwrap().as_deref(), Some("{}"));
        assert!(kv.set("ns:m2", "[]").is_err());
        assert_eq!(kv.scan_keys("ns:").unwrap(), vec!["ns:m1"]);

        let reopened = FileKv::open(&path).unwrap();
        assert_eq!(reopened.get("ns:m1").unwrap().as_deref(), Some("{}"));
    }

    #[test]
    fn corrupt_file_refuses_to_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        fs::write(&path, "not json").unwrap();
        assert!(matches!(FileKv::open(&path), Err(KvError::Corrupt(_))));
    }
}
