//! Session persistence
//!
//! The engine appends messages through the [`MessageStore`] contract and never
//! deletes a session; the most it does is archive one. [`FileMessageStore`]
//! keeps one JSON document per session, [`MemoryMessageStore`] keeps
//! everything in process.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use warden_provider::Message;

/// Persistence failures
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("STORE IO ERROR: {0}")]
    Io(#[from] std::io::Error),

    #[error("STORE ENCODING ERROR: {0}")]
    Json(#[from] serde_json::Error),

    #[error("SESSION NOT FOUND: {0}")]
    NotFound(String),

    #[error("SESSION ARCHIVED: {0}")]
    Archived(String),

    #[error("SESSION HISTORY CORRUPT: {session_id}: {reason}")]
    Corrupt { session_id: String, reason: String },
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence contract for session histories
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append_message(&self, session_id: &str, message: &Message) -> Result<()>;
    /// Full ordered history; empty for an unknown session
    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>>;
    async fn list_sessions(&self) -> Result<Vec<String>>;
    async fn archive(&self, session_id: &str) -> Result<()>;
}

/// A persisted conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: String,
    pub messages: Vec<Message>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub archived: bool,
}

impl SessionRecord {
    pub fn new(id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            archived: false,
        }
    }

    fn push(&mut self, message: Message) {
        self.messages.push(message);
        self.updated_at = Utc::now();
    }
}

/// One JSON file per session under a root directory
pub struct FileMessageStore {
    sessions_dir: PathBuf,
    cache: Mutex<HashMap<String, SessionRecord>>,
}

impl FileMessageStore {
    pub fn new(sessions_dir: impl AsRef<Path>) -> Self {
        Self {
            sessions_dir: sessions_dir.as_ref().to_path_buf(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn sessions_dir(&self) -> &Path {
        &self.sessions_dir
    }

    fn archive_dir(&self) -> PathBuf {
        self.sessions_dir.join("archive")
    }

    /// File path for a session id
    fn session_path(&self, session_id: &str) -> PathBuf {
        let safe_id = session_id.replace([':', '/', '\\'], "_");
        self.sessions_dir.join(format!("{}.json", safe_id))
    }

    /// `None` when no file exists; an unparsable file is an error and stays untouched
    async fn load(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let path = self.session_path(session_id);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_str::<SessionRecord>(&content) {
            Ok(record) => {
                debug!("Loaded session: {}", session_id);
                Ok(Some(record))
            }
            Err(e) => {
                warn!(session_id, error = %e, "◆ SESSION FILE CORRUPT");
                Err(StoreError::Corrupt {
                    session_id: session_id.to_string(),
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Write through a temp file so a crash never leaves a truncated document
    async fn persist(&self, record: &SessionRecord) -> Result<()> {
        tokio::fs::create_dir_all(&self.sessions_dir).await?;
        let path = self.session_path(&record.id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(record)?;
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, &path).await?;
        debug!("Saved session: {}", record.id);
        Ok(())
    }
}

#[async_trait]
impl MessageStore for FileMessageStore {
    async fn append_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let mut cache = self.cache.lock().await;
        if !cache.contains_key(session_id) {
            let record = self
                .load(session_id)
                .await?
                .unwrap_or_else(|| SessionRecord::new(session_id));
            cache.insert(session_id.to_string(), record);
        }
        let Some(record) = cache.get_mut(session_id) else {
            return Err(StoreError::NotFound(session_id.to_string()));
        };
        if record.archived {
            return Err(StoreError::Archived(session_id.to_string()));
        }

        let previous = record.updated_at;
        record.push(message.clone());
        if let Err(e) = self.persist(record).await {
            // Cache mirrors disk
            record.messages.pop();
            record.updated_at = previous;
            return Err(e);
        }
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let cache = self.cache.lock().await;
        if let Some(record) = cache.get(session_id) {
            return Ok(record.messages.clone());
        }
        drop(cache);
        Ok(self
            .load(session_id)
            .await?
            .map(|record| record.messages)
            .unwrap_or_default())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();

        if let Ok(mut entries) = tokio::fs::read_dir(&self.sessions_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match tokio::fs::read_to_string(&path).await {
                    Ok(content) => match serde_json::from_str::<SessionRecord>(&content) {
                        Ok(record) => ids.push(record.id),
                        Err(e) => warn!("Skipping unreadable session {:?}: {}", path, e),
                    },
                    Err(e) => warn!("Skipping unreadable session {:?}: {}", path, e),
                }
            }
        }

        ids.sort();
        Ok(ids)
    }

    async fn archive(&self, session_id: &str) -> Result<()> {
        let mut cache = self.cache.lock().await;
        let mut record = match cache.remove(session_id) {
            Some(record) => record,
            None => self
                .load(session_id)
                .await?
                .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?,
        };
        record.archived = true;
        record.updated_at = Utc::now();

        let archive_dir = self.archive_dir();
        tokio::fs::create_dir_all(&archive_dir).await?;
        let file_name = self
            .session_path(session_id)
            .file_name()
            .map(|n| n.to_owned())
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        let target = archive_dir.join(file_name);
        tokio::fs::write(&target, serde_json::to_string_pretty(&record)?).await?;

        let live = self.session_path(session_id);
        if live.exists() {
            tokio::fs::remove_file(live).await?;
        }
        info!("◆ SESSION ARCHIVED: {}", session_id);
        Ok(())
    }
}

/// In-process store
#[derive(Default)]
pub struct MemoryMessageStore {
    sessions: Mutex<HashMap<String, SessionRecord>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_archived(&self, session_id: &str) -> bool {
        self.sessions
            .lock()
            .await
            .get(session_id)
            .map(|r| r.archived)
            .unwrap_or(false)
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append_message(&self, session_id: &str, message: &Message) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions
            .entry(session_id.to_string())
            .or_insert_with(|| SessionRecord::new(session_id));
        if record.archived {
            return Err(StoreError::Archived(session_id.to_string()));
        }
        record.push(message.clone());
        Ok(())
    }

    async fn list_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        Ok(self
            .sessions
            .lock()
            .await
            .get(session_id)
            .map(|r| r.messages.clone())
            .unwrap_or_default())
    }

    async fn list_sessions(&self) -> Result<Vec<String>> {
        let mut ids: Vec<String> = self
            .sessions
            .lock()
            .await
            .values()
            .filter(|r| !r.archived)
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn archive(&self, session_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let record = sessions
            .get_mut(session_id)
            .ok_or_else(|| StoreError::NotFound(session_id.to_string()))?;
        record.archived = true;
        record.updated_at = Utc::now();
        Ok(())
    }
}
