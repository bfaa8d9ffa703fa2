//! Viewer-local key-value state: feed thresholds, cached clear markers and
//! the user directory cache. Nothing here is authoritative, so a missing or
//! corrupt file just starts empty.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: serde_json::Value,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

impl Entry {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Writes snapshots to disk in the order they were taken. Older snapshots
/// that lose the race to a newer one are skipped.
struct FileWriter {
    path: PathBuf,
    written: Mutex<u64>,
    done: watch::Sender<u64>,
}

impl FileWriter {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            written: Mutex::new(0),
            done: watch::channel(0).0,
        }
    }

    fn write(&self, seq: u64, bytes: &[u8]) {
        let Ok(mut written) = self.written.lock() else { return };
        if *written >= seq {
            return;
        }

        let tmp = self.path.with_extension("tmp");
        if let Err(e) = std::fs::write(&tmp, bytes).and_then(|_| std::fs::rename(&tmp, &self.path)) {
            warn!("Cannot write state file {}: {}", self.path.display(), e);
        }
        *written = seq;
        self.done.send_replace(seq);
    }
}

pub struct KvStore {
    writer: Option<Arc<FileWriter>>,
    entries: Mutex<HashMap<String, Entry>>,
    issued: AtomicU64,
}

impl KvStore {
    /// Load from `path`, starting empty if the file is absent or unreadable.
    pub fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        let entries = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|e| {
                warn!("Discarding unreadable state file {}: {}", path.display(), e);
                HashMap::new()
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn!("Cannot read state file {}: {}", path.display(), e);
                HashMap::new()
            }
        };

        Self {
            writer: Some(Arc::new(FileWriter::new(path))),
            entries: Mutex::new(entries),
            issued: AtomicU64::new(0),
        }
    }

    /// Non-persistent store.
    pub fn in_memory() -> Self {
        Self {
            writer: None,
            entries: Mutex::new(HashMap::new()),
            issued: AtomicU64::new(0),
        }
    }

    /// Wait until every change made so far is on disk.
    pub async fn flush(&self) {
        let Some(writer) = &self.writer else { return };
        let target = self.issued.load(Ordering::Acquire);
        let mut done = writer.done.subscribe();
        let _ = done.wait_for(|written| *written >= target).await;
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let mut entries = self.entries.lock().ok()?;
        let entry = entries.get(key)?;

        if entry.is_expired(Utc::now()) {
            entries.remove(key);
            self.persist(&entries);
            return None;
        }

        match serde_json::from_value(entry.value.clone()) {
            Ok(value) => Some(value),
            Err(e) => {
                debug!("Ignoring stale value under {}: {}", key, e);
                None
            }
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) {
        self.insert(key, value, None);
    }

    pub fn set_with_ttl<T: Serialize>(&self, key: &str, value: &T, ttl: Duration) {
        let expires_at = chrono::Duration::from_std(ttl)
            .ok()
            .and_then(|ttl| Utc::now().checked_add_signed(ttl));
        self.insert(key, value, expires_at);
    }

    /// Store with an absolute expiry.
    pub fn set_until<T: Serialize>(&self, key: &str, value: &T, expires_at: DateTime<Utc>) {
        self.insert(key, value, Some(expires_at));
    }

    pub fn invalidate(&self, key: &str) {
        let Ok(mut entries) = self.entries.lock() else { return };
        if entries.remove(key).is_some() {
            self.persist(&entries);
        }
    }

    pub fn invalidate_prefix(&self, prefix: &str) {
        let Ok(mut entries) = self.entries.lock() else { return };
        let before = entries.len();
        entries.retain(|key, _| !key.starts_with(prefix));
        if entries.len() != before {
            self.persist(&entries);
        }
    }

    fn insert<T: Serialize>(&self, key: &str, value: &T, expires_at: Option<DateTime<Utc>>) {
        let value = match serde_json::to_value(value) {
            Ok(value) => value,
            Err(e) => {
                warn!("Cannot encode value for {}: {}", key, e);
                return;
            }
        };

        let Ok(mut entries) = self.entries.lock() else { return };
        entries.insert(key.to_string(), Entry { value, expires_at });
        self.persist(&entries);
    }

    /// Write-through of a snapshot taken under the entries lock. Inside a
    /// runtime the file write runs on the blocking pool; `flush` waits for it.
    /// Failures only cost the next session its cached state.
    fn persist(&self, entries: &HashMap<String, Entry>) {
        let Some(writer) = &self.writer else { return };

        let bytes = match serde_json::to_vec(entries) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Cannot encode state file: {}", e);
                return;
            }
        };
        let seq = self.issued.fetch_add(1, Ordering::AcqRel) + 1;

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let writer = writer.clone();
                handle.spawn_blocking(move || writer.write(seq, &bytes));
            }
            Err(_) => writer.write(seq, &bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let kv = KvStore::open(&path);
        kv.set("feed:seen_after", &"2026-01-01T10:00:00Z");
        kv.set("count", &3u32);
        drop(kv);

        let kv = KvStore::open(&path);
        assert_eq!(kv.get::<String>("feed:seen_after").as_deref(), Some("2026-01-01T10:00:00Z"));
        assert_eq!(kv.get::<u32>("count"), Some(3));
    }

    #[test]
    fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{not json").unwrap();

        let kv = KvStore::open(&path);
        assert_eq!(kv.get::<u32>("anything"), None);
        kv.set("anything", &1u32);
        assert_eq!(kv.get::<u32>("anything"), Some(1));
    }

    #[tokio::test]
    async fn writes_inside_a_runtime_land_after_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");

        let kv = KvStore::open(&path);
        for n in 0..20u32 {
            kv.set("count", &n);
        }
        kv.flush().await;

        assert_eq!(KvStore::open(&path).get::<u32>("count"), Some(19));
    }

    #[test]
    fn expired_entries_read_as_missing() {
        let kv = KvStore::in_memory();
        kv.set_until("old", &1u32, Utc::now() - chrono::Duration::seconds(1));
        kv.set_with_ttl("fresh", &2u32, Duration::from_secs(60));

        assert_eq!(kv.get::<u32>("old"), None);
        assert_eq!(kv.get::<u32>("fresh"), Some(2));
    }

    #[test]
    fn invalidate_by_prefix() {
        let kv = KvStore::in_memory();
        kv.set("directory:a", &1u32);
        kv.set("directory:b", &2u32);
        kv.set("feed:seen_after", &3u32);

        kv.invalidate_prefix("directory:");
        assert_eq!(kv.get::<u32>("directory:a"), None);
        assert_eq!(kv.get::<u32>("directory:b"), None);
        assert_eq!(kv.get::<u32>("feed:seen_after"), Some(3));

        kv.invalidate("feed:seen_after");
        assert_eq!(kv.get::<u32>("feed:seen_after"), None);
    }

    #[test]
    fn wrong_type_reads_as_missing() {
        let kv = KvStore::in_memory();
        kv.set("n", &"text");
        assert_eq!(kv.get::<u32>("n"), None);
    }
}
