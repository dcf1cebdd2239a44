// Store module - Durable key-value storage for checkpoints, workflow snapshots and patterns

use crate::error::{AgentvisorError, Result};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use uuid::Uuid;

/// Key-value backend used for checkpoints and workflow persistence
///
/// Keys are `/`-separated paths such as `workflows/build-42`. Implementations
/// must be safe to share between the reliability manager and background
/// checkpoint writers.
pub trait StateStore: Send + Sync {
    /// Store `value` under `key`, replacing any previous value
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Fetch the value stored under `key`
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// List every stored key starting with `prefix`, sorted
    fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>>;
}

fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(AgentvisorError::InvalidKey("key is empty".to_string()));
    }

    for segment in key.split('/') {
        if segment.is_empty() || segment == "." || segment == ".." {
            return Err(AgentvisorError::InvalidKey(key.to_string()));
        }
        if segment.ends_with(".tmp") {
            return Err(AgentvisorError::InvalidKey(format!(
                "{} (segments may not end in .tmp)",
                key
            )));
        }
    }

    Ok(())
}

/// Sibling `<file name>.<uuid>.tmp`, unique per write
fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{}.{}.tmp", name, Uuid::new_v4().simple()))
}

/// Filesystem store: each key maps to a file below the root directory
pub struct FileStateStore {
    root: PathBuf,
}

impl FileStateStore {
    /// Create a new store rooted at `root`
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Get the root directory of the store
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        key.split('/')
            .fold(self.root.clone(), |path, segment| path.join(segment))
    }

    fn collect_keys(&self, dir: &Path, prefix: &str, keys: &mut Vec<String>) -> Result<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(AgentvisorError::StateError(format!(
                    "Failed to read {}: {}",
                    dir.display(),
                    e
                )))
            }
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if path.is_dir() {
                self.collect_keys(&path, prefix, keys)?;
                continue;
            }
            if path.extension().and_then(|e| e.to_str()) == Some("tmp") {
                continue;
            }

            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let key = relative
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");

            if key.starts_with(prefix) {
                keys.push(key);
            }
        }

        Ok(())
    }
}

impl StateStore for FileStateStore {
    /// Write with the temp-file-and-rename pattern so readers never see partial data
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        let path = self.path_for(key);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                AgentvisorError::StateError(format!("Failed to create state directory: {}", e))
            })?;
        }

        let temp_path = temp_path_for(&path);

        {
            let file = File::create(&temp_path).map_err(|e| {
                AgentvisorError::StateError(format!("Failed to create temp state file: {}", e))
            })?;

            let mut writer = BufWriter::new(file);
            writer.write_all(value).map_err(|e| {
                AgentvisorError::StateError(format!("Failed to write state file: {}", e))
            })?;
            writer.flush().map_err(|e| {
                AgentvisorError::StateError(format!("Failed to flush state file: {}", e))
            })?;
        }

        fs::rename(&temp_path, &path).map_err(|e| {
            AgentvisorError::StateError(format!("Failed to rename temp state file: {}", e))
        })?;

        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(AgentvisorError::StateError(format!(
                "Failed to read {}: {}",
                key, e
            ))),
        }
    }

    fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, prefix, &mut keys)?;
        keys.sort();
        Ok(keys)
    }
}

/// In-memory store, used by tests and short-lived drivers
#[derive(Default)]
pub struct MemoryStateStore {
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| AgentvisorError::StateError("memory store lock poisoned".to_string()))
    }
}

impl StateStore for MemoryStateStore {
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        validate_key(key)?;
        self.entries()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        validate_key(key)?;
        Ok(self.entries()?.get(key).cloned())
    }

    fn list_by_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .entries()?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}
