//! Task directory discovery and lookup.
//!
//! A task is any direct subdirectory of the agents path that carries a
//! `.clod` marker directory with a `system/run` script inside it. Discovery
//! happens once at startup; the registry is immutable afterwards.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::{AppError, Result};

/// Marker directory that makes a subdirectory a task directory.
pub const MARKER_DIR: &str = ".clod";

/// Run script path relative to the marker directory.
pub const RUN_SCRIPT: &str = "system/run";

/// Registry of discovered task directories, keyed by lowercased name.
#[derive(Debug, Clone)]
pub struct TaskRegistry {
    base_path: PathBuf,
    tasks: BTreeMap<String, PathBuf>,
}

impl TaskRegistry {
    /// Scan `base_path` and register every task directory found.
    ///
    /// Subdirectories without both the marker directory and the run script
    /// are silently skipped.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Discovery` if `base_path` cannot be resolved or
    /// read.
    pub fn discover(base_path: impl AsRef<Path>) -> Result<Self> {
        let base_path = base_path
            .as_ref()
            .canonicalize()
            .map_err(|err| AppError::Discovery(format!("invalid agents path: {err}")))?;

        let entries = fs::read_dir(&base_path)
            .map_err(|err| AppError::Discovery(format!("cannot read agents path: {err}")))?;

        let mut tasks = BTreeMap::new();
        for entry in entries {
            let entry =
                entry.map_err(|err| AppError::Discovery(format!("cannot read entry: {err}")))?;
            let task_path = entry.path();
            if !task_path.is_dir() {
                continue;
            }

            let marker = task_path.join(MARKER_DIR);
            if !marker.is_dir() {
                continue;
            }
            if !marker.join(RUN_SCRIPT).exists() {
                debug!(path = %task_path.display(), "marker present but no run script, skipping");
                continue;
            }

            let Some(name) = entry.file_name().to_str().map(str::to_lowercase) else {
                continue;
            };
            tasks.insert(name, task_path);
        }

        Ok(Self { base_path, tasks })
    }

    /// Base path the registry was discovered from.
    #[must_use]
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a task name (case-insensitive) to its directory.
    ///
    /// # Errors
    ///
    /// Returns `AppError::NotFound` for unknown names.
    pub fn lookup(&self, name: &str) -> Result<PathBuf> {
        self.tasks
            .get(&name.to_lowercase())
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("unknown task: {name:?}")))
    }

    /// All registered task names, sorted ascending.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.tasks.keys().cloned().collect()
    }

    /// Human-readable task listing for help messages.
    #[must_use]
    pub fn list_formatted(&self) -> String {
        if self.tasks.is_empty() {
            "No tasks available.".to_owned()
        } else {
            format!("Available tasks: {}", self.list().join(", "))
        }
    }

    /// Path to the run script for a task directory.
    #[must_use]
    pub fn run_script(task_path: &Path) -> PathBuf {
        task_path.join(MARKER_DIR).join(RUN_SCRIPT)
    }
}
