//! Durable storage for status records and active subjects

use crate::errors::{NotifierError, Result};
use crate::status::StatusRecord;
use crate::subject::WatchedSubject;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

/// Synchronous key-value persistence used by the notifier.
pub trait PersistenceStore: Send + Sync {
    fn load_status(&self, key: &str) -> Result<Option<StatusRecord>>;
    fn save_status(&self, key: &str, record: &StatusRecord) -> Result<()>;
    fn load_subjects(&self) -> Result<Vec<WatchedSubject>>;
    fn save_subjects(&self, subjects: &[WatchedSubject]) -> Result<()>;
}

/// Volatile store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    statuses: Mutex<HashMap<String, StatusRecord>>,
    subjects: Mutex<Vec<WatchedSubject>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PersistenceStore for MemoryStore {
    fn load_status(&self, key: &str) -> Result<Option<StatusRecord>> {
        let statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        Ok(statuses.get(key).cloned())
    }

    fn save_status(&self, key: &str, record: &StatusRecord) -> Result<()> {
        let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        statuses.insert(key.to_string(), record.clone());
        Ok(())
    }

    fn load_subjects(&self) -> Result<Vec<WatchedSubject>> {
        Ok(self.subjects.lock().unwrap_or_else(|e| e.into_inner()).clone())
    }

    fn save_subjects(&self, subjects: &[WatchedSubject]) -> Result<()> {
        *self.subjects.lock().unwrap_or_else(|e| e.into_inner()) = subjects.to_vec();
        Ok(())
    }
}

/// One JSON file per status record plus a `subjects.json`, under a data directory.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    root: PathBuf,
}

impl JsonFileStore {
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("status"))?;
        debug!("Opened JSON store at {}", root.display());
        Ok(Self { root })
    }

    fn status_path(&self, key: &str) -> PathBuf {
        self.root
            .join("status")
            .join(format!("{}.json", encode_key(key)))
    }

    fn subjects_path(&self) -> PathBuf {
        self.root.join("subjects.json")
    }

    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| NotifierError::Store(format!("{}: {}", path.display(), e)))
    }

    /// Write through a temporary file so readers never see a torn document.
    fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
        let body = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, body)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

/// File stem for a key. Anything outside `[A-Za-z0-9-]`, the escape
/// character included, becomes `_XX` per byte, so distinct keys never share
/// a file.
fn encode_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' {
            out.push(byte as char);
        } else {
            out.push_str(&format!("_{:02X}", byte));
        }
    }
    out
}

impl PersistenceStore for JsonFileStore {
    fn load_status(&self, key: &str) -> Result<Option<StatusRecord>> {
        Self::read_json(&self.status_path(key))
    }

    fn save_status(&self, key: &str, record: &StatusRecord) -> Result<()> {
        Self::write_json(&self.status_path(key), record)
    }

    fn load_subjects(&self) -> Result<Vec<WatchedSubject>> {
        Ok(Self::read_json(&self.subjects_path())?.unwrap_or_default())
    }

    fn save_subjects(&self, subjects: &[WatchedSubject]) -> Result<()> {
        Self::write_json(&self.subjects_path(), subjects)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::StatusLabel;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new();
        assert!(store.load_status("a").unwrap().is_none());

        let record = StatusRecord::new(StatusLabel::Online, Utc::now());
        store.save_status("a", &record).unwrap();
        assert_eq!(store.load_status("a").unwrap(), Some(record));
    }

    #[test]
    fn test_json_store_status_persists_across_instances() {
        let dir = TempDir::new().unwrap();
        let since = Utc.with_ymd_and_hms(2024, 3, 1, 18, 0, 0).unwrap();
        let record = StatusRecord::new(StatusLabel::Unhealthy, since);

        {
            let store = JsonFileStore::open(dir.path()).unwrap();
            store.save_status("gaw", &record).unwrap();
        }

        let store = JsonFileStore::open(dir.path()).unwrap();
        assert_eq!(store.load_status("gaw").unwrap(), Some(record));
        assert!(store.load_status("pgaw").unwrap().is_none());
    }

    #[test]
    fn test_json_store_subjects() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        assert!(store.load_subjects().unwrap().is_empty());

        let subject = WatchedSubject::new("magic".to_string(), HashMap::new(), Utc::now());
        store.save_subjects(&[subject.clone()]).unwrap();
        assert_eq!(store.load_subjects().unwrap(), vec![subject]);

        store.save_subjects(&[]).unwrap();
        assert!(store.load_subjects().unwrap().is_empty());
    }

    #[test]
    fn test_json_store_encodes_keys() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let record = StatusRecord::new(StatusLabel::Offline, Utc::now());

        store.save_status("../escape/attempt", &record).unwrap();
        assert!(!dir.path().join("escape").exists());
        assert!(
            dir.path()
                .join("status")
                .join("_2E_2E_2Fescape_2Fattempt.json")
                .exists()
        );
        assert_eq!(store.load_status("../escape/attempt").unwrap(), Some(record));
    }

    #[test]
    fn test_json_store_similar_keys_do_not_collide() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        let slash = StatusRecord::new(StatusLabel::Online, Utc::now());
        let underscore = StatusRecord::new(StatusLabel::Offline, Utc::now());

        store.save_status("a/b", &slash).unwrap();
        store.save_status("a_b", &underscore).unwrap();

        assert_eq!(store.load_status("a/b").unwrap(), Some(slash));
        assert_eq!(store.load_status("a_b").unwrap(), Some(underscore));
        assert_ne!(encode_key("a/b"), encode_key("a_b"));
        assert_eq!(encode_key("gaw-1"), "gaw-1");
    }

    #[test]
    fn test_json_store_corrupt_file_is_store_error() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::open(dir.path()).unwrap();
        fs::write(dir.path().join("status").join("gaw.json"), "{not json").unwrap();

        let err = store.load_status("gaw").unwrap_err();
        assert!(matches!(err, NotifierError::Store(_)));
    }
}
