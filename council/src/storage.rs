//! Conversation store.
//!
//! One writer per conversation, ordered durable appends, and a list view
//! that skips corrupted entries instead of failing the listing. Two
//! implementations: an in-memory map, and a JSON file for the
//! `PERSIST_STORAGE` path. Both are synchronous — entries are small and the
//! orchestrator performs at most two writes per run.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::types::AssistantMessage;

pub const DEFAULT_TITLE: &str = "New conversation";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("conversation not found: {0}")]
    NotFound(String),

    #[error("storage I/O failure: {0}")]
    Io(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// A user turn as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl UserMessage {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Either side of a conversation turn.
///
/// Untagged: an assistant message is recognized by its stage fields, a user
/// message by `content`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredMessage {
    Assistant(Box<AssistantMessage>),
    User(UserMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub messages: Vec<StoredMessage>,
}

/// Row in the conversation list view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub message_count: usize,
}

/// Contract consumed by the orchestrator. Single writer per conversation id;
/// appends are ordered and durable once `Ok` is returned.
pub trait ConversationStore: Send + Sync {
    fn create(&self, title: Option<&str>) -> StoreResult<Conversation>;
    fn load(&self, id: &str) -> StoreResult<Conversation>;
    fn delete(&self, id: &str) -> StoreResult<()>;
    fn append_message(&self, id: &str, message: StoredMessage) -> StoreResult<()>;
    fn set_title(&self, id: &str, title: &str) -> StoreResult<()>;
    fn list(&self) -> StoreResult<Vec<ConversationSummary>>;
}

fn new_conversation(title: Option<&str>) -> Conversation {
    Conversation {
        id: Uuid::new_v4().to_string(),
        title: title.unwrap_or(DEFAULT_TITLE).to_string(),
        created_at: Utc::now(),
        messages: Vec::new(),
    }
}

fn summaries(conversations: impl Iterator<Item = Conversation>) -> Vec<ConversationSummary> {
    let mut out: Vec<ConversationSummary> = conversations
        .map(|c| ConversationSummary {
            id: c.id,
            title: c.title,
            created_at: c.created_at,
            message_count: c.messages.len(),
        })
        .collect();
    // Newest first.
    out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    out
}

/// Volatile store for tests and `PERSIST_STORAGE=false`.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, Conversation>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStore for MemoryStore {
    fn create(&self, title: Option<&str>) -> StoreResult<Conversation> {
        let conversation = new_conversation(title);
        self.inner
            .lock()
            .unwrap()
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    fn load(&self, id: &str) -> StoreResult<Conversation> {
        self.inner
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn delete(&self, id: &str) -> StoreResult<()> {
        self.inner
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn append_message(&self, id: &str, message: StoredMessage) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let conversation = inner
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        conversation.messages.push(message);
        Ok(())
    }

    fn set_title(&self, id: &str, title: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let conversation = inner
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        conversation.title = title.to_string();
        Ok(())
    }

    fn list(&self) -> StoreResult<Vec<ConversationSummary>> {
        Ok(summaries(self.inner.lock().unwrap().values().cloned()))
    }
}

/// All conversations in one JSON document on disk, rewritten atomically per
/// mutation. The mutex keeps writes for the same file serialized.
pub struct FileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn read_all(&self) -> StoreResult<HashMap<String, Conversation>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let raw = std::fs::read_to_string(&self.path).map_err(|e| StoreError::Io(e.to_string()))?;
        if raw.trim().is_empty() {
            return Ok(HashMap::new());
        }
        // A corrupted entry should not take the whole store down: parse
        // loosely, keep what decodes, warn about the rest.
        let values: HashMap<String, serde_json::Value> =
            serde_json::from_str(&raw).map_err(|e| StoreError::Io(e.to_string()))?;
        let mut out = HashMap::new();
        for (id, value) in values {
            match serde_json::from_value::<Conversation>(value) {
                Ok(conversation) => {
                    out.insert(id, conversation);
                }
                Err(e) => warn!(%id, error = %e, "Skipping corrupted conversation entry"),
            }
        }
        Ok(out)
    }

    fn write_all(&self, all: &HashMap<String, Conversation>) -> StoreResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Io(e.to_string()))?;
            }
        }
        let json =
            serde_json::to_string_pretty(all).map_err(|e| StoreError::Io(e.to_string()))?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| StoreError::Io(e.to_string()))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StoreError::Io(e.to_string()))?;
        Ok(())
    }

    fn mutate<T>(
        &self,
        f: impl FnOnce(&mut HashMap<String, Conversation>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let _guard = self.lock.lock().unwrap();
        let mut all = self.read_all()?;
        let result = f(&mut all)?;
        self.write_all(&all)?;
        Ok(result)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConversationStore for FileStore {
    fn create(&self, title: Option<&str>) -> StoreResult<Conversation> {
        self.mutate(|all| {
            let conversation = new_conversation(title);
            all.insert(conversation.id.clone(), conversation.clone());
            Ok(conversation)
        })
    }

    fn load(&self, id: &str) -> StoreResult<Conversation> {
        let _guard = self.lock.lock().unwrap();
        self.read_all()?
            .remove(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn delete(&self, id: &str) -> StoreResult<()> {
        self.mutate(|all| {
            all.remove(id)
                .map(|_| ())
                .ok_or_else(|| StoreError::NotFound(id.to_string()))
        })
    }

    fn append_message(&self, id: &str, message: StoredMessage) -> StoreResult<()> {
        self.mutate(|all| {
            let conversation = all
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            conversation.messages.push(message);
            Ok(())
        })
    }

    fn set_title(&self, id: &str, title: &str) -> StoreResult<()> {
        self.mutate(|all| {
            let conversation = all
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            conversation.title = title.to_string();
            Ok(())
        })
    }

    fn list(&self) -> StoreResult<Vec<ConversationSummary>> {
        let _guard = self.lock.lock().unwrap();
        Ok(summaries(self.read_all()?.into_values()))
    }
}

/// Store selection per configuration: file-backed when persistence is on.
pub fn from_config(config: &crate::config::CouncilConfig) -> std::sync::Arc<dyn ConversationStore> {
    if config.persist_storage {
        std::sync::Arc::new(FileStore::new(config.conversations_file.clone()))
    } else {
        std::sync::Arc::new(MemoryStore::new())
    }
}
