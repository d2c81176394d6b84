use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::PilotResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts: i64,
    pub role: String,
    pub content: Option<String>,
    pub action: Option<serde_json::Value>,
}

impl HistoryEntry {
    pub fn new(role: &str, content: Option<String>, action: Option<serde_json::Value>) -> Self {
        Self {
            ts: chrono::Utc::now().timestamp_millis(),
            role: role.to_string(),
            content,
            action,
        }
    }
}

/// Per-run transcript. With a file, every entry is appended as one JSON line
/// as soon as it is pushed.
pub struct SessionHistory {
    pub session_id: String,
    entries: Vec<HistoryEntry>,
    file_path: Option<PathBuf>,
}

impl SessionHistory {
    /// Keep entries in memory only.
    pub fn in_memory() -> Self {
        Self {
            session_id: uuid::Uuid::new_v4().to_string(),
            entries: Vec::new(),
            file_path: None,
        }
    }

    /// Record to `<dir>/session_<uuid>.jsonl`.
    pub fn in_dir(dir: &Path) -> PilotResult<Self> {
        std::fs::create_dir_all(dir)?;
        let mut history = Self::in_memory();
        history.file_path = Some(dir.join(format!("session_{}.jsonl", history.session_id)));
        Ok(history)
    }

    /// Record under the platform data directory, or in memory if that fails.
    pub fn persistent() -> Self {
        let dir = sessions_dir();
        match Self::in_dir(&dir) {
            Ok(h) => h,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "session history not recorded");
                Self::in_memory()
            }
        }
    }

    pub fn push(&mut self, entry: HistoryEntry) -> PilotResult<()> {
        if let Some(path) = &self.file_path {
            let line = serde_json::to_string(&entry)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            writeln!(file, "{line}")?;
            tracing::debug!(path = %path.display(), role = %entry.role, "history entry flushed");
        }
        self.entries.push(entry);
        Ok(())
    }

    pub fn entries(&self) -> &[HistoryEntry] {
        &self.entries
    }

    pub fn path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }
}

impl Default for SessionHistory {
    fn default() -> Self {
        Self::in_memory()
    }
}

/// `<data_local_dir>/phonepilot/sessions`, falling back to `./sessions`.
pub fn sessions_dir() -> PathBuf {
    match dirs::data_local_dir() {
        Some(base) => base.join("phonepilot").join("sessions"),
        None => PathBuf::from("sessions"),
    }
}
