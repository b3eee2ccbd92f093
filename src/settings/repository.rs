// Settings persistence
//
// The store only relies on load/save/watch. The file repository writes JSON
// atomically (temp file + rename) under an advisory lock so two processes
// cannot interleave writes.

use async_trait::async_trait;
use fs2::FileExt;
use notify::{RecursiveMode, Watcher};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use super::GlobalSettings;
use crate::errors::RepositoryError;

/// Callback invoked when the persisted settings change outside this process
pub type WatchCallback = Arc<dyn Fn() + Send + Sync>;

/// Keeps a watch registration alive; dropping it stops watching
pub struct WatchHandle {
    _watcher: Option<notify::RecommendedWatcher>,
}

impl WatchHandle {
    /// A handle that watches nothing
    pub fn inert() -> Self {
        Self { _watcher: None }
    }
}

#[async_trait]
pub trait SettingsRepository: Send + Sync {
    /// Load persisted settings, `None` when nothing has been saved yet
    async fn load(&self) -> Result<Option<GlobalSettings>, RepositoryError>;

    async fn save(&self, settings: &GlobalSettings) -> Result<(), RepositoryError>;

    /// Register for external change notifications
    fn watch(&self, callback: WatchCallback) -> Result<WatchHandle, RepositoryError>;
}

/// JSON file repository
pub struct FileSettingsRepository {
    path: PathBuf,
}

impl FileSettingsRepository {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> RepositoryError {
        RepositoryError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let lock_path = path.with_extension("lock");
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)?;
    lock.lock_exclusive()?;

    let tmp_path = path.with_extension("json.tmp");
    let result = (|| {
        let mut tmp = fs::File::create(&tmp_path)?;
        tmp.write_all(contents)?;
        tmp.sync_all()?;
        fs::rename(&tmp_path, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    let _ = fs2::FileExt::unlock(&lock);
    result
}

#[async_trait]
impl SettingsRepository for FileSettingsRepository {
    async fn load(&self) -> Result<Option<GlobalSettings>, RepositoryError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_error(e)),
        };

        if contents.trim().is_empty() {
            return Ok(None);
        }

        let settings = serde_json::from_str(&contents).map_err(|source| RepositoryError::Parse {
            path: self.path.clone(),
            source,
        })?;
        Ok(Some(settings))
    }

    async fn save(&self, settings: &GlobalSettings) -> Result<(), RepositoryError> {
        let json = serde_json::to_vec_pretty(settings).map_err(|source| RepositoryError::Parse {
            path: self.path.clone(),
            source,
        })?;

        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomically(&path, &json))
            .await
            .map_err(|e| self.io_error(std::io::Error::new(std::io::ErrorKind::Other, e)))?
            .map_err(|e| self.io_error(e))?;

        tracing::debug!(path = %self.path.display(), "settings written");
        Ok(())
    }

    fn watch(&self, callback: WatchCallback) -> Result<WatchHandle, RepositoryError> {
        let target = self.path.clone();
        let file_name = target.file_name().map(|name| name.to_os_string());

        let mut watcher = notify::recommended_watcher(move |event: notify::Result<notify::Event>| {
            match event {
                Ok(event) => {
                    let touches_settings = event.paths.iter().any(|path| {
                        path.file_name().map(|name| name.to_os_string()) == file_name
                    });
                    if touches_settings && (event.kind.is_modify() || event.kind.is_create()) {
                        callback();
                    }
                }
                Err(e) => tracing::warn!("settings watcher error: {}", e),
            }
        })
        .map_err(|e| RepositoryError::Watch(e.to_string()))?;

        // Watch the directory: atomic renames replace the file's inode
        let dir = target
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(|e| self.io_error(e))?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| RepositoryError::Watch(e.to_string()))?;

        Ok(WatchHandle {
            _watcher: Some(watcher),
        })
    }
}

/// In-memory repository for embedding and tests
#[derive(Default)]
pub struct MemorySettingsRepository {
    stored: Mutex<Option<GlobalSettings>>,
    failures_remaining: AtomicU32,
    saves: AtomicU32,
    callbacks: Mutex<Vec<WatchCallback>>,
}

impl MemorySettingsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_settings(settings: GlobalSettings) -> Self {
        let repo = Self::default();
        *repo.stored.lock().unwrap_or_else(|e| e.into_inner()) = Some(settings);
        repo
    }

    /// Make the next `count` saves fail
    pub fn fail_next_saves(&self, count: u32) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Number of save calls, failed ones included
    pub fn save_attempts(&self) -> u32 {
        self.saves.load(Ordering::SeqCst)
    }

    pub fn stored(&self) -> Option<GlobalSettings> {
        self.stored.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the stored settings as another process would, notifying watchers
    pub fn replace_externally(&self, settings: GlobalSettings) {
        *self.stored.lock().unwrap_or_else(|e| e.into_inner()) = Some(settings);
        let callbacks = self
            .callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for callback in callbacks {
            callback();
        }
    }
}

#[async_trait]
impl SettingsRepository for MemorySettingsRepository {
    async fn load(&self) -> Result<Option<GlobalSettings>, RepositoryError> {
        Ok(self.stored())
    }

    async fn save(&self, settings: &GlobalSettings) -> Result<(), RepositoryError> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        let should_fail = self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(RepositoryError::Rejected("simulated save failure".to_string()));
        }
        *self.stored.lock().unwrap_or_else(|e| e.into_inner()) = Some(settings.clone());
        Ok(())
    }

    fn watch(&self, callback: WatchCallback) -> Result<WatchHandle, RepositoryError> {
        self.callbacks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
        Ok(WatchHandle::inert())
    }
}
