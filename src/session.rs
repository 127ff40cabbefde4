//! Thread-to-session mapping with atomic JSON persistence.
//!
//! Each Slack thread that has run a task maps to the agent session ID minted
//! by the subprocess, so follow-up replies can resume the same conversation.
//! The store is a single JSON array on disk, rewritten atomically on save.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{AppError, Result};

/// Map key for a (channel, thread) pair.
#[must_use]
pub fn thread_key(channel_id: &str, thread_ts: &str) -> String {
    format!("{channel_id}:{thread_ts}")
}

/// Persisted record tying a Slack thread to an agent session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescriptor {
    pub channel_id: String,
    pub thread_ts: String,
    pub task_name: String,
    pub task_path: PathBuf,
    pub session_id: String,
    pub user_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionDescriptor {
    /// Create a descriptor stamped with the current time.
    #[must_use]
    pub fn new(
        channel_id: impl Into<String>,
        thread_ts: impl Into<String>,
        task_name: impl Into<String>,
        task_path: impl Into<PathBuf>,
        session_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            channel_id: channel_id.into(),
            thread_ts: thread_ts.into(),
            task_name: task_name.into(),
            task_path: task_path.into(),
            session_id: session_id.into(),
            user_id: user_id.into(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Durable ThreadKey → [`SessionDescriptor`] store.
#[derive(Debug)]
pub struct SessionStore {
    path: PathBuf,
    sessions: RwLock<HashMap<String, SessionDescriptor>>,
}

impl SessionStore {
    /// Load the store from `path`. A missing file starts the store empty.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` if the file exists but cannot be read
    /// or parsed.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let sessions = match fs::read(&path) {
            Ok(data) => {
                let list: Vec<SessionDescriptor> = serde_json::from_slice(&data).map_err(|err| {
                    AppError::Persistence(format!("invalid session store: {err}"))
                })?;
                list.into_iter()
                    .map(|s| (thread_key(&s.channel_id, &s.thread_ts), s))
                    .collect()
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(err) => {
                return Err(AppError::Persistence(format!(
                    "cannot read session store: {err}"
                )))
            }
        };

        Ok(Self {
            path,
            sessions: RwLock::new(sessions),
        })
    }

    /// Fetch the descriptor for a thread, if any.
    #[must_use]
    pub fn get(&self, channel_id: &str, thread_ts: &str) -> Option<SessionDescriptor> {
        self.sessions
            .read()
            .expect("session store lock poisoned")
            .get(&thread_key(channel_id, thread_ts))
            .cloned()
    }

    /// Insert or replace the descriptor for its thread, stamping `updated_at`.
    pub fn set(&self, mut descriptor: SessionDescriptor) {
        descriptor.updated_at = Utc::now();
        let key = thread_key(&descriptor.channel_id, &descriptor.thread_ts);
        self.sessions
            .write()
            .expect("session store lock poisoned")
            .insert(key, descriptor);
    }

    /// Number of stored descriptors.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions
            .read()
            .expect("session store lock poisoned")
            .len()
    }

    /// Path the store persists to.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist a snapshot atomically: serialize outside the lock, write to a
    /// sibling temp file, then rename over the destination. After a
    /// successful return a crash cannot leave a half-written file behind.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Persistence` on serialization or file I/O failure.
    pub fn save(&self) -> Result<()> {
        let mut snapshot: Vec<SessionDescriptor> = {
            let guard = self.sessions.read().expect("session store lock poisoned");
            guard.values().cloned().collect()
        };
        snapshot.sort_by(|a, b| {
            (&a.channel_id, &a.thread_ts).cmp(&(&b.channel_id, &b.thread_ts))
        });

        let data = serde_json::to_vec_pretty(&snapshot)
            .map_err(|err| AppError::Persistence(format!("serialize sessions: {err}")))?;

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)
            .map_err(|err| AppError::Persistence(format!("create temp file: {err}")))?;
        tmp.write_all(&data)
            .map_err(|err| AppError::Persistence(format!("write sessions: {err}")))?;
        tmp.persist(&self.path)
            .map_err(|err| AppError::Persistence(format!("rename session store: {err}")))?;

        Ok(())
    }
}
