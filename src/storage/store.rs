use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::core::errors::{EngineError, Result};

const ZSTD_LEVEL: i32 = 3;

/// Sortable key fragment for a timestamp, e.g. `20250101T120000.123456`
pub fn timestamp_key(at: DateTime<Utc>) -> String {
    at.format("%Y%m%dT%H%M%S%.6f").to_string()
}

/// Write `bytes` to `path` through a sibling temp file and a rename.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&dir)
        .map_err(|e| EngineError::io(format!("create dir {}", dir.display()), e))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| EngineError::internal(format!("no file name in {}", path.display())))?;
    let tmp_path = dir.join(format!(".{}.{}.tmp", file_name, uuid::Uuid::new_v4().simple()));

    let result = (|| -> std::io::Result<()> {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if let Err(e) = result {
        let _ = fs::remove_file(&tmp_path);
        return Err(EngineError::io(format!("atomic write {}", path.display()), e));
    }
    Ok(())
}

/// Append-only log record kept in a sled tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub event: String,
    #[serde(default)]
    pub details: Value,
}

impl LogEntry {
    pub fn new<S: Into<String>>(event: S, details: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            event: event.into(),
            details,
        }
    }
}

/// Embedded key-value store shared by every persistent component.
///
/// Cloning is cheap: `sled::Db` is reference counted internally.
#[derive(Clone)]
pub struct EngineStore {
    db: sled::Db,
    path: Option<PathBuf>,
}

impl EngineStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        fs::create_dir_all(path)
            .map_err(|e| EngineError::io(format!("create storage dir {}", path.display()), e))?;
        let db = sled::open(path)
            .map_err(|e| EngineError::database(format!("open {}", path.display()), e))?;
        info!(storage_path = %path.display(), "Opened engine store");
        Ok(Self {
            db,
            path: Some(path.to_path_buf()),
        })
    }

    /// In-memory database that is discarded on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| EngineError::database("open temporary", e))?;
        Ok(Self { db, path: None })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn tree(&self, name: &str) -> Result<sled::Tree> {
        self.db
            .open_tree(name)
            .map_err(|e| EngineError::database(format!("open tree {}", name), e))
    }

    pub fn put_json<T: Serialize>(&self, tree: &str, key: &str, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.tree(tree)?.insert(key.as_bytes(), bytes)?;
        Ok(())
    }

    pub fn get_json<T: DeserializeOwned>(&self, tree: &str, key: &str) -> Result<Option<T>> {
        match self.tree(tree)?.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Store JSON compressed with zstd
    pub fn put_compressed<T: Serialize>(&self, tree: &str, key: &str, value: &T) -> Result<()> {
        let serialized = serde_json::to_vec(value)?;
        let compressed = zstd::encode_all(&serialized[..], ZSTD_LEVEL)
            .map_err(|e| EngineError::io("zstd encode", e))?;
        self.tree(tree)?.insert(key.as_bytes(), compressed)?;
        Ok(())
    }

    pub fn get_compressed<T: DeserializeOwned>(&self, tree: &str, key: &str) -> Result<Option<T>> {
        match self.tree(tree)?.get(key.as_bytes())? {
            Some(compressed) => {
                let bytes = zstd::decode_all(&compressed[..])
                    .map_err(|e| EngineError::io("zstd decode", e))?;
                Ok(Some(serde_json::from_slice(&bytes)?))
            }
            None => Ok(None),
        }
    }

    pub fn remove(&self, tree: &str, key: &str) -> Result<bool> {
        Ok(self.tree(tree)?.remove(key.as_bytes())?.is_some())
    }

    /// Keys under `prefix`, in ascending order
    pub fn keys_with_prefix(&self, tree: &str, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.tree(tree)?.scan_prefix(prefix.as_bytes()) {
            let (key, _) = item?;
            keys.push(String::from_utf8_lossy(&key).into_owned());
        }
        Ok(keys)
    }

    pub fn values<T: DeserializeOwned>(&self, tree: &str) -> Result<Vec<(String, T)>> {
        let mut out = Vec::new();
        for item in self.tree(tree)?.iter() {
            let (key, bytes) = item?;
            out.push((
                String::from_utf8_lossy(&key).into_owned(),
                serde_json::from_slice(&bytes)?,
            ));
        }
        Ok(out)
    }

    pub fn remove_prefix(&self, tree: &str, prefix: &str) -> Result<usize> {
        let handle = self.tree(tree)?;
        let mut removed = 0;
        for key in self.keys_with_prefix(tree, prefix)? {
            if handle.remove(key.as_bytes())?.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub fn len(&self, tree: &str) -> Result<usize> {
        Ok(self.tree(tree)?.len())
    }

    pub fn clear(&self, tree: &str) -> Result<()> {
        self.tree(tree)?.clear()?;
        Ok(())
    }

    /// Append to a log tree, dropping the oldest entries beyond `capacity`.
    pub fn append_log(&self, tree: &str, entry: &LogEntry, capacity: Option<usize>) -> Result<()> {
        let handle = self.tree(tree)?;
        let id = self.db.generate_id()?;
        handle.insert(id.to_be_bytes(), serde_json::to_vec(entry)?)?;

        if let Some(capacity) = capacity {
            while handle.len() > capacity {
                match handle.pop_min()? {
                    Some(_) => {}
                    None => break,
                }
            }
        }
        Ok(())
    }

    /// Log entries, oldest first
    pub fn read_log(&self, tree: &str) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        for item in self.tree(tree)?.iter() {
            let (_, bytes) = item?;
            entries.push(serde_json::from_slice(&bytes)?);
        }
        Ok(entries)
    }

    pub fn prune_log_before(&self, tree: &str, cutoff: DateTime<Utc>) -> Result<usize> {
        let handle = self.tree(tree)?;
        let mut stale = Vec::new();
        for item in handle.iter() {
            let (key, bytes) = item?;
            let entry: LogEntry = serde_json::from_slice(&bytes)?;
            if entry.timestamp < cutoff {
                stale.push(key);
            }
        }
        for key in &stale {
            handle.remove(key)?;
        }
        if !stale.is_empty() {
            debug!(tree = tree, removed = stale.len(), "Pruned log entries");
        }
        Ok(stale.len())
    }

    pub fn flush(&self) -> Result<()> {
        self.db
            .flush()
            .map_err(|e| EngineError::database("flush", e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_json_and_compressed_round_trip() {
        let store = EngineStore::temporary().unwrap();
        let value = json!({"task": "visit", "nodes": [1, 2, 3]});

        store.put_json("t", "plain", &value).unwrap();
        store.put_compressed("t", "packed", &value).unwrap();

        assert_eq!(store.get_json::<Value>("t", "plain").unwrap(), Some(value.clone()));
        assert_eq!(store.get_compressed::<Value>("t", "packed").unwrap(), Some(value));
        assert_eq!(store.get_json::<Value>("t", "missing").unwrap(), None);
    }

    #[test]
    fn test_prefix_scan_is_ordered() {
        let store = EngineStore::temporary().unwrap();
        for key in ["task_b", "task_a_2", "task_a_1", "other"] {
            store.put_json("t", key, &1).unwrap();
        }
        assert_eq!(
            store.keys_with_prefix("t", "task_a").unwrap(),
            vec!["task_a_1".to_string(), "task_a_2".to_string()]
        );
        assert_eq!(store.remove_prefix("t", "task_").unwrap(), 3);
        assert_eq!(store.len("t").unwrap(), 1);
    }

    #[test]
    fn test_log_capacity_and_pruning() {
        let store = EngineStore::temporary().unwrap();
        for i in 0..5 {
            store
                .append_log("log", &LogEntry::new(format!("e{}", i), Value::Null), Some(3))
                .unwrap();
        }
        let events: Vec<_> = store
            .read_log("log")
            .unwrap()
            .into_iter()
            .map(|e| e.event)
            .collect();
        assert_eq!(events, vec!["e2", "e3", "e4"]);

        let mut old = LogEntry::new("ancient", Value::Null);
        old.timestamp = Utc::now() - ChronoDuration::days(40);
        store.append_log("log", &old, None).unwrap();
        let pruned = store
            .prune_log_before("log", Utc::now() - ChronoDuration::days(30))
            .unwrap();
        assert_eq!(pruned, 1);
        assert_eq!(store.read_log("log").unwrap().len(), 3);
    }

    #[test]
    fn test_atomic_write_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("doc.json");
        atomic_write(&path, b"first").unwrap();
        atomic_write(&path, b"second").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "second");

        let leftovers = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .map(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
                    .unwrap_or(false)
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn test_timestamp_keys_sort_chronologically() {
        let earlier = Utc::now();
        let later = earlier + ChronoDuration::milliseconds(5);
        assert!(timestamp_key(earlier) < timestamp_key(later));
    }
}
