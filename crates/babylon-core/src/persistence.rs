//! Write-through persistence for task records.
//!
//! A key→JSON file store. Writes are atomic-by-rename: serialize to
//! `<key>.json.tmp.<timestamp>`, then rename over `<key>.json`, so a crash
//! mid-write leaves the prior value intact. Persistence exists for
//! observability only; nothing is read back mid-run.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

use crate::task::Task;

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("failed to create store at {}", root.display()))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }

    /// Atomically write `value` under `key`. Keys may contain `/` to nest.
    pub fn write(&self, key: &str, value: &Value) -> Result<()> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let timestamp = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
        let tmp = self.root.join(format!("{key}.json.tmp.{timestamp}"));
        let serialized = serde_json::to_vec_pretty(value)?;
        std::fs::write(&tmp, serialized)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path)
            .with_context(|| format!("failed to rename into {}", path.display()))?;
        Ok(())
    }

    pub fn read(&self, key: &str) -> Result<Option<Value>> {
        let path = self.path_for(key);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }
}

/// Task records under `tasks/<task-id>.json`.
pub struct TaskStore {
    store: FileStore,
}

impl TaskStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            store: FileStore::new(root)?,
        })
    }

    pub fn save(&self, task: &Task) -> Result<()> {
        let value = serde_json::to_value(task)?;
        self.store.write(&format!("tasks/{}", task.id), &value)
    }

    pub fn load(&self, task_id: &str) -> Result<Option<Task>> {
        match self.store.read(&format!("tasks/{task_id}"))? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }
}
