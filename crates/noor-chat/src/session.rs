//! Session context hooks.
//!
//! The id of the active conversation outlives a restart. The engine never
//! reads it from ambient state: it is loaded and saved through a
//! [`SessionStore`] handed to it at construction.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use noor_core::error::{NoorError, Result};

/// File name of the persisted session inside the data directory.
pub const SESSION_FILE_NAME: &str = "session.json";

/// Load/save hooks for the remembered active conversation.
pub trait SessionStore: Send + Sync {
    /// The previously active conversation id, if any.
    fn load_active_id(&self) -> Option<String>;

    /// Remember `id` as the active conversation.
    fn save_active_id(&self, id: &str) -> Result<()>;
}

/// In-process session, forgotten on exit.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    active_id: Mutex<Option<String>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A session that already remembers `id`.
    pub fn with_active_id(id: impl Into<String>) -> Self {
        Self {
            active_id: Mutex::new(Some(id.into())),
        }
    }
}

impl SessionStore for MemorySessionStore {
    fn load_active_id(&self) -> Option<String> {
        self.active_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn save_active_id(&self, id: &str) -> Result<()> {
        *self.active_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(id.to_string());
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SessionFile {
    #[serde(default)]
    active_conversation_id: Option<String>,
}

/// Session persisted as a small JSON document.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    path: PathBuf,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The session file inside `data_dir`.
    pub fn in_dir(data_dir: &Path) -> Self {
        Self::new(data_dir.join(SESSION_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> Result<SessionFile> {
        let data = fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

impl SessionStore for FileSessionStore {
    fn load_active_id(&self) -> Option<String> {
        if !self.path.exists() {
            return None;
        }
        match self.read() {
            Ok(file) => file.active_conversation_id.filter(|id| !id.is_empty()),
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Ignoring unreadable session file");
                None
            }
        }
    }

    fn save_active_id(&self, id: &str) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| NoorError::Session(format!("{}: {}", parent.display(), e)))?;
        }
        let file = SessionFile {
            active_conversation_id: Some(id.to_string()),
        };
        let data = serde_json::to_string_pretty(&file)?;
        fs::write(&self.path, data)?;
        tracing::debug!(path = %self.path.display(), active_id = %id, "Session saved");
        Ok(())
    }
}
