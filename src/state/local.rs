//! Local file-based state storage backend.
//!
//! Each resource is stored in its own JSON file so that persisting one
//! resource never rewrites another. Writes go to a temporary file first and
//! are renamed into place, which makes every save atomic.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{ConvergeError, Result, StateError};
use crate::model::Address;

use super::lock::{generate_holder_id, LockInfo, LOCK_EXPIRY_SECS};
use super::store::StateStore;
use super::types::{push_bounded, RunHistoryEntry, StateRecord, StateSnapshot, STATE_VERSION};

/// Default state directory name.
pub const STATE_DIR: &str = ".converge";

/// Directory holding one file per resource.
const RESOURCES_DIR: &str = "resources";

/// History file name.
const HISTORY_FILE: &str = "history.json";

/// Lock file name.
const LOCK_FILE: &str = "state.lock";

/// Local file-based state store.
#[derive(Debug)]
pub struct LocalStateStore {
    /// Base directory for state files.
    base_dir: PathBuf,
    /// Directory of per-resource records.
    resources_dir: PathBuf,
    /// Path to the lock file.
    lock_path: PathBuf,
    /// Path to the history file.
    history_path: PathBuf,
    /// Serializes read-modify-write of the history file.
    history_guard: Mutex<()>,
}

impl LocalStateStore {
    /// Creates a new local state store in `.converge` under the current directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the current directory cannot be determined.
    pub fn new() -> Result<Self> {
        let base_dir = std::env::current_dir()
            .map_err(|e| ConvergeError::internal(format!("Cannot determine current directory: {e}")))?
            .join(STATE_DIR);

        Ok(Self::with_base_dir(base_dir))
    }

    /// Creates a new local state store with a custom base directory.
    #[must_use]
    pub fn with_base_dir(base_dir: impl Into<PathBuf>) -> Self {
        let base_dir = base_dir.into();
        Self {
            resources_dir: base_dir.join(RESOURCES_DIR),
            lock_path: base_dir.join(LOCK_FILE),
            history_path: base_dir.join(HISTORY_FILE),
            base_dir,
            history_guard: Mutex::new(()),
        }
    }

    /// Returns the base directory.
    #[must_use]
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn record_path(&self, address: &Address) -> PathBuf {
        self.resources_dir.join(format!("{address}.json"))
    }

    /// Ensures the state directories exist.
    async fn ensure_dir(&self) -> Result<()> {
        if !self.resources_dir.exists() {
            debug!(path = %self.resources_dir.display(), "creating state directory");
            fs::create_dir_all(&self.resources_dir).await.map_err(|e| {
                ConvergeError::State(StateError::write(format!(
                    "Failed to create state directory: {e}"
                )))
            })?;
        }
        Ok(())
    }

    async fn read_record(path: &Path) -> Result<StateRecord> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to read {}: {e}", path.display()),
            })
        })?;

        let record: StateRecord = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to parse {}: {e}", path.display()),
            })
        })?;

        if record.version != STATE_VERSION {
            return Err(ConvergeError::State(StateError::VersionMismatch {
                expected: STATE_VERSION.to_string(),
                found: record.version,
            }));
        }

        Ok(record)
    }

    /// Reads the lock file if it exists.
    async fn read_lock_file(&self) -> Result<Option<LockInfo>> {
        if !self.lock_path.exists() {
            return Ok(None);
        }

        let content = fs::read_to_string(&self.lock_path).await.map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to read lock file: {e}"),
            })
        })?;

        let lock_info: LockInfo = serde_json::from_str(&content).map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to parse lock file: {e}"),
            })
        })?;

        Ok(Some(lock_info))
    }

    /// Deletes the lock file.
    async fn delete_lock_file(&self) -> Result<()> {
        match fs::remove_file(&self.lock_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(ConvergeError::State(StateError::LockFailed {
                message: format!("Failed to delete lock file: {e}"),
            })),
        }
    }

    /// Creates the lock file, failing with `AlreadyExists` if it is present.
    async fn create_lock_file(&self, content: &[u8]) -> std::io::Result<()> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.lock_path)
            .await?;

        let written = async {
            file.write_all(content).await?;
            file.sync_all().await
        }
        .await;
        if written.is_err() {
            drop(file);
            let _ = fs::remove_file(&self.lock_path).await;
        }
        written
    }

    /// Removes the lock file only while it still holds `lock_id`.
    async fn remove_lock_if(&self, lock_id: &str) -> Result<()> {
        match self.read_lock_file().await {
            Ok(Some(current)) if current.lock_id == lock_id => self.delete_lock_file().await,
            _ => Ok(()),
        }
    }
}

/// Error for a lock held by someone else, or still being written.
fn contended(existing: Option<&LockInfo>) -> ConvergeError {
    let (holder, since) = existing.map_or_else(
        || (String::from("unknown"), String::from("just now")),
        |lock| (lock.holder.clone(), lock.acquired_at.to_rfc3339()),
    );
    ConvergeError::State(StateError::LockedByOther { holder, since })
}

fn lock_io_error(e: &std::io::Error) -> ConvergeError {
    ConvergeError::State(StateError::LockFailed {
        message: format!("Failed to create lock file: {e}"),
    })
}

/// Writes `content` to `path` through a synced temporary file and a rename.
async fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let file_name = path
        .file_stem()
        .map_or_else(String::new, |stem| stem.to_string_lossy().into_owned());
    let temp_path = path.with_file_name(format!("{file_name}.{}.tmp", Uuid::new_v4().simple()));

    let mut file = fs::File::create(&temp_path).await.map_err(|e| {
        ConvergeError::State(StateError::write(format!(
            "Failed to create {}: {e}",
            temp_path.display()
        )))
    })?;

    file.write_all(content)
        .await
        .map_err(|e| ConvergeError::State(StateError::write(format!("Failed to write: {e}"))))?;

    file.sync_all()
        .await
        .map_err(|e| ConvergeError::State(StateError::write(format!("Failed to sync: {e}"))))?;

    fs::rename(&temp_path, path).await.map_err(|e| {
        ConvergeError::State(StateError::write(format!(
            "Failed to rename into {}: {e}",
            path.display()
        )))
    })?;

    Ok(())
}

#[async_trait]
impl StateStore for LocalStateStore {
    async fn load(&self) -> Result<StateSnapshot> {
        let mut snapshot = StateSnapshot::new();
        if !self.resources_dir.exists() {
            debug!(path = %self.resources_dir.display(), "state directory does not exist");
            return Ok(snapshot);
        }

        let mut entries = fs::read_dir(&self.resources_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().is_none_or(|ext| ext != "json") {
                if path.extension().is_some_and(|ext| ext == "tmp") {
                    warn!(path = %path.display(), "ignoring interrupted state write");
                }
                continue;
            }

            let record = Self::read_record(&path).await?;
            let expected = self.record_path(&record.address);
            if expected != path {
                return Err(ConvergeError::State(StateError::Corrupted {
                    message: format!(
                        "{} holds the record for {}",
                        path.display(),
                        record.address
                    ),
                }));
            }
            snapshot.insert(record.address.clone(), record);
        }

        info!(resources = snapshot.len(), path = %self.base_dir.display(), "loaded state");
        Ok(snapshot)
    }

    async fn save(&self, address: &Address, record: &StateRecord) -> Result<()> {
        self.ensure_dir().await?;

        let content = serde_json::to_vec_pretty(record).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!(
                "Failed to serialize {address}: {e}"
            )))
        })?;

        write_atomic(&self.record_path(address), &content).await?;
        debug!(%address, id = %record.id, "state record saved");
        Ok(())
    }

    async fn remove(&self, address: &Address) -> Result<()> {
        let path = self.record_path(address);
        if path.exists() {
            fs::remove_file(&path).await.map_err(|e| {
                ConvergeError::State(StateError::write(format!(
                    "Failed to remove {}: {e}",
                    path.display()
                )))
            })?;
            debug!(%address, "state record removed");
        }
        Ok(())
    }

    async fn acquire_lock(&self, holder: &str, operation: &str) -> Result<LockInfo> {
        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        let lock_info = LockInfo::new(&holder_id, operation);
        let content = serde_json::to_vec_pretty(&lock_info).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        fs::create_dir_all(&self.base_dir).await?;
        match self.create_lock_file(&content).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let existing = self.read_lock_file().await.ok().flatten();
                match existing {
                    Some(expired) if expired.is_expired() => {
                        warn!(holder = %expired.holder, "expired lock found, taking over");
                        self.remove_lock_if(&expired.lock_id).await?;
                        self.create_lock_file(&content).await.map_err(|e| {
                            if e.kind() == ErrorKind::AlreadyExists {
                                contended(None)
                            } else {
                                lock_io_error(&e)
                            }
                        })?;
                    }
                    other => return Err(contended(other.as_ref())),
                }
            }
            Err(e) => return Err(lock_io_error(&e)),
        }

        info!(
            lock_id = %lock_info.lock_id,
            expires_in_secs = LOCK_EXPIRY_SECS,
            "acquired state lock"
        );

        Ok(lock_info)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock_file().await? {
            if existing.lock_id == lock_id {
                self.delete_lock_file().await?;
                info!(%lock_id, "released state lock");
            } else {
                debug!(expected = %lock_id, found = %existing.lock_id, "lock ID mismatch");
            }
        }
        Ok(())
    }

    async fn force_unlock(&self) -> Result<()> {
        warn!(path = %self.lock_path.display(), "force-removing state lock");
        self.delete_lock_file().await
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock_file().await
    }

    async fn append_history(&self, entry: RunHistoryEntry) -> Result<()> {
        let _guard = self.history_guard.lock().await;

        let mut history = self.load_history().await?;
        push_bounded(&mut history, entry);

        let content = serde_json::to_vec_pretty(&history).map_err(|e| {
            ConvergeError::State(StateError::serialization(format!(
                "Failed to serialize history: {e}"
            )))
        })?;

        fs::create_dir_all(&self.base_dir).await?;
        write_atomic(&self.history_path, &content).await
    }

    async fn load_history(&self) -> Result<Vec<RunHistoryEntry>> {
        if !self.history_path.exists() {
            return Ok(Vec::new());
        }

        let content = fs::read_to_string(&self.history_path).await?;
        serde_json::from_str(&content).map_err(|e| {
            ConvergeError::State(StateError::Corrupted {
                message: format!("Failed to parse history: {e}"),
            })
        })
    }

    fn backend_type(&self) -> &'static str {
        "local"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AttrMap;
    use crate::state::RunOperation;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store() -> (LocalStateStore, TempDir) {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let store = LocalStateStore::with_base_dir(temp_dir.path());
        (store, temp_dir)
    }

    fn record(name: &str) -> StateRecord {
        StateRecord::new(
            Address::new("queue", name),
            "local",
            &format!("id-{name}"),
            AttrMap::from([(String::from("name"), json!(name))]),
            AttrMap::new(),
            vec![],
        )
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let (store, _temp) = create_test_store();

        let a = record("a");
        let b = record("b");
        store.save(&a.address, &a).await.expect("Failed to save a");
        store.save(&b.address, &b).await.expect("Failed to save b");

        let loaded = store.load().await.expect("Failed to load state");
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&a.address], a);
        assert!(store.base_dir().join("resources/queue.a.json").exists());
    }

    #[tokio::test]
    async fn test_load_nonexistent() {
        let (store, _temp) = create_test_store();

        let result = store.load().await.expect("Load should not fail");
        assert!(result.is_empty());
    }

    #[tokio::test]
    async fn test_remove() {
        let (store, _temp) = create_test_store();

        let a = record("a");
        store.save(&a.address, &a).await.expect("save");
        store.remove(&a.address).await.expect("remove");
        store.remove(&a.address).await.expect("remove twice");

        assert!(store.load().await.expect("load").is_empty());
    }

    #[tokio::test]
    async fn test_leftover_temp_file_ignored() {
        let (store, _temp) = create_test_store();

        let a = record("a");
        store.save(&a.address, &a).await.expect("save");
        std::fs::write(store.base_dir().join("resources/queue.b.tmp"), "{partial")
            .expect("write temp");

        let loaded = store.load().await.expect("load");
        assert_eq!(loaded.len(), 1);
    }

    #[tokio::test]
    async fn test_corrupted_record_reported() {
        let (store, _temp) = create_test_store();

        store.ensure_dir().await.expect("dir");
        std::fs::write(store.base_dir().join("resources/queue.a.json"), "not json")
            .expect("write");

        let result = store.load().await;
        assert!(matches!(
            result,
            Err(ConvergeError::State(StateError::Corrupted { .. }))
        ));
    }

    #[tokio::test]
    async fn test_lock_acquire_release() {
        let (store, _temp) = create_test_store();

        let lock = store
            .acquire_lock("test-holder", "apply")
            .await
            .expect("Failed to acquire lock");

        assert!(store.is_locked().await.expect("is_locked failed"));

        store
            .release_lock(&lock.lock_id)
            .await
            .expect("Failed to release lock");

        assert!(!store.is_locked().await.expect("is_locked failed"));
    }

    #[tokio::test]
    async fn test_lock_conflict() {
        let (store, _temp) = create_test_store();

        let _lock1 = store
            .acquire_lock("holder-1", "apply")
            .await
            .expect("Failed to acquire first lock");

        let result = store.acquire_lock("holder-2", "apply").await;
        assert!(matches!(
            result,
            Err(ConvergeError::State(StateError::LockedByOther { .. }))
        ));

        store.force_unlock().await.expect("force unlock");
        assert!(store.acquire_lock("holder-2", "apply").await.is_ok());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_acquire_has_one_winner() {
        let temp = TempDir::new().expect("temp dir");
        let first = LocalStateStore::with_base_dir(temp.path());
        let second = LocalStateStore::with_base_dir(temp.path());

        for _ in 0..50 {
            let (a, b) = tokio::join!(
                first.acquire_lock("holder-1", "apply"),
                second.acquire_lock("holder-2", "apply")
            );
            assert!(a.is_ok() != b.is_ok(), "exactly one run must hold the lock");
            for result in [a, b] {
                if let Err(e) = result {
                    assert!(matches!(e, ConvergeError::State(StateError::LockedByOther { .. })));
                }
            }
            first.force_unlock().await.expect("unlock");
        }
    }

    #[tokio::test]
    async fn test_expired_lock_is_taken_over() {
        let (store, _temp) = create_test_store();

        let mut stale = LockInfo::new("crashed-run", "apply");
        stale.expires_at = stale.acquired_at - chrono::Duration::seconds(1);
        std::fs::create_dir_all(store.base_dir()).expect("dir");
        std::fs::write(
            store.base_dir().join(LOCK_FILE),
            serde_json::to_vec(&stale).expect("serialize"),
        )
        .expect("write lock");

        let lock = store.acquire_lock("holder-2", "apply").await.expect("take over");
        let current = store.get_lock_info().await.expect("read").expect("held");
        assert_eq!(current.lock_id, lock.lock_id);
        assert_eq!(current.holder, "holder-2");
    }

    #[tokio::test]
    async fn test_history_append() {
        let (store, _temp) = create_test_store();

        store
            .append_history(RunHistoryEntry::new(RunOperation::Apply, "h1"))
            .await
            .expect("append");
        store
            .append_history(RunHistoryEntry::new(RunOperation::Destroy, "h2"))
            .await
            .expect("append");

        let history = store.load_history().await.expect("history");
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].operation, RunOperation::Destroy);
    }
}
