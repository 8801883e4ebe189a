//! Persisted chat sessions, one per chatbot connection.
//!
//! Sessions are keyed by a generated id (`_id` on the wire) and carry the chatbot's socket id,
//! the append-only message history, and list-preview fields. The store keeps everything in
//! memory and rewrites a JSON file after each mutation so sessions survive restarts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Unique session identifier (opaque string).
pub type SessionId = String;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("session not found: {0}")]
    NotFound(SessionId),
    #[error("session store io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("session store is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

/// Who wrote a message; determines display and routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sender {
    User,
    Bot,
    Portal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredImage {
    pub data: String,
    pub name: String,
    pub mime_type: String,
}

/// One history entry. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message: String,
    pub sender: Sender,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub images: Vec<StoredImage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_provider: Option<String>,
    /// Set on help-request messages raised by the chatbot side.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub help_requested: bool,
}

impl Message {
    fn new(sender: Sender, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            sender,
            timestamp: Utc::now(),
            images: Vec::new(),
            ai_provider: None,
            help_requested: false,
        }
    }

    pub fn user(message: impl Into<String>, images: Vec<StoredImage>, provider: impl Into<String>) -> Self {
        Self {
            images,
            ai_provider: Some(provider.into()),
            ..Self::new(Sender::User, message)
        }
    }

    pub fn bot(message: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            ai_provider: Some(provider.into()),
            ..Self::new(Sender::Bot, message)
        }
    }

    pub fn portal(message: impl Into<String>) -> Self {
        Self::new(Sender::Portal, message)
    }

    pub fn help(message: impl Into<String>) -> Self {
        Self {
            help_requested: true,
            ..Self::new(Sender::User, message)
        }
    }

    /// Text shown in session lists for this message.
    pub fn preview(&self) -> String {
        if !self.message.is_empty() || self.images.is_empty() {
            self.message.clone()
        } else {
            format!("Sent {} image(s)", self.images.len())
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    #[serde(rename = "_id")]
    pub id: SessionId,
    pub socket_id: String,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub ai_provider: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Session without history, for list views.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    #[serde(rename = "_id")]
    pub id: SessionId,
    pub socket_id: String,
    pub last_message: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub ai_provider: String,
}

impl From<&Session> for SessionSummary {
    fn from(s: &Session) -> Self {
        Self {
            id: s.id.clone(),
            socket_id: s.socket_id.clone(),
            last_message: s.last_message.clone(),
            created_at: s.created_at,
            updated_at: s.updated_at,
            ai_provider: s.ai_provider.clone(),
        }
    }
}

/// Result of [`SessionStore::attach`].
#[derive(Debug, Clone)]
pub struct Attached {
    pub session: Session,
    /// False when an existing session for the socket id was restored.
    pub created: bool,
}

/// Session store: in-memory map, optionally mirrored to a JSON file.
pub struct SessionStore {
    path: Option<PathBuf>,
    inner: RwLock<HashMap<SessionId, Session>>,
}

impl SessionStore {
    /// Store without a backing file (tests, ephemeral runs).
    pub fn in_memory() -> Self {
        Self {
            path: None,
            inner: RwLock::new(HashMap::new()),
        }
    }

    /// Open the store at `path`. A missing file starts empty; an unparsable one is an error.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let sessions: Vec<Session> = match tokio::fs::read_to_string(&path).await {
            Ok(s) if s.trim().is_empty() => Vec::new(),
            Ok(s) => serde_json::from_str(&s)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        log::info!("session store: loaded {} session(s) from {}", sessions.len(), path.display());
        Ok(Self {
            path: Some(path),
            inner: RwLock::new(sessions.into_iter().map(|s| (s.id.clone(), s)).collect()),
        })
    }

    /// Write the whole map to disk (temp file + rename). Called with the write lock held so
    /// file contents follow mutation order.
    async fn persist(&self, sessions: &HashMap<SessionId, Session>) -> Result<(), StoreError> {
        let Some(ref path) = self.path else {
            return Ok(());
        };
        let mut list: Vec<&Session> = sessions.values().collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        let json = serde_json::to_string_pretty(&list)?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    /// Find the session owned by `socket_id`, or create it.
    pub async fn attach(&self, socket_id: &str, default_provider: &str) -> Result<Attached, StoreError> {
        let mut g = self.inner.write().await;
        if let Some(existing) = g.values().find(|s| s.socket_id == socket_id) {
            return Ok(Attached {
                session: existing.clone(),
                created: false,
            });
        }
        let now = Utc::now();
        let session = Session {
            id: uuid::Uuid::new_v4().simple().to_string(),
            socket_id: socket_id.to_string(),
            history: Vec::new(),
            last_message: String::new(),
            ai_provider: default_provider.to_string(),
            created_at: now,
            updated_at: now,
        };
        g.insert(session.id.clone(), session.clone());
        self.persist(&g).await?;
        Ok(Attached {
            session,
            created: true,
        })
    }

    /// Return a clone of the session if it exists.
    pub async fn get(&self, id: &str) -> Option<Session> {
        self.inner.read().await.get(id).cloned()
    }

    pub async fn find_by_socket_id(&self, socket_id: &str) -> Option<Session> {
        self.inner
            .read()
            .await
            .values()
            .find(|s| s.socket_id == socket_id)
            .cloned()
    }

    /// Most recently updated sessions first, at most `limit`.
    pub async fn list_recent(&self, limit: usize) -> Vec<SessionSummary> {
        let g = self.inner.read().await;
        let mut list: Vec<SessionSummary> = g.values().map(SessionSummary::from).collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        list.truncate(limit);
        list
    }

    /// Append a message, refreshing `lastMessage`, `updatedAt` and (when tagged) `aiProvider`.
    /// On a write failure the in-memory append is kept and the error returned.
    pub async fn append(&self, id: &str, message: Message) -> Result<Message, StoreError> {
        let mut g = self.inner.write().await;
        let session = g
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        session.last_message = message.preview();
        if let Some(ref provider) = message.ai_provider {
            session.ai_provider = provider.clone();
        }
        session.updated_at = message.timestamp.max(session.updated_at);
        session.history.push(message.clone());
        self.persist(&g).await?;
        Ok(message)
    }

    /// Truncate history to empty.
    pub async fn clear_history(&self, id: &str) -> Result<(), StoreError> {
        let mut g = self.inner.write().await;
        let session = g
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        session.history.clear();
        session.last_message.clear();
        session.updated_at = Utc::now();
        self.persist(&g).await
    }

    /// Delete one session; returns whether it existed.
    pub async fn delete(&self, id: &str) -> Result<bool, StoreError> {
        let mut g = self.inner.write().await;
        if g.remove(id).is_none() {
            return Ok(false);
        }
        self.persist(&g).await?;
        Ok(true)
    }

    /// Delete every session; returns how many were removed.
    pub async fn delete_all(&self) -> Result<usize, StoreError> {
        let mut g = self.inner.write().await;
        let n = g.len();
        g.clear();
        self.persist(&g).await?;
        Ok(n)
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_store_path() -> PathBuf {
        std::env::temp_dir()
            .join(format!("chatrelay-store-test-{}", uuid::Uuid::new_v4()))
            .join("sessions.json")
    }

    #[tokio::test]
    async fn attach_creates_once_per_socket() {
        let store = SessionStore::in_memory();
        let a = store.attach("sock-1", "gemini-25-flash").await.unwrap();
        assert!(a.created);
        assert_eq!(a.session.ai_provider, "gemini-25-flash");
        let b = store.attach("sock-1", "gemini-25-flash").await.unwrap();
        assert!(!b.created);
        assert_eq!(a.session.id, b.session.id);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn append_updates_preview_and_provider() {
        let store = SessionStore::in_memory();
        let id = store.attach("s", "gemini-25-flash").await.unwrap().session.id;
        let img = StoredImage {
            data: "QUJD".into(),
            name: "shot.png".into(),
            mime_type: "image/png".into(),
        };
        store.append(&id, Message::user("", vec![img], "claude")).await.unwrap();
        let s = store.get(&id).await.unwrap();
        assert_eq!(s.last_message, "Sent 1 image(s)");
        assert_eq!(s.ai_provider, "claude");

        store.append(&id, Message::portal("operator here")).await.unwrap();
        let s = store.get(&id).await.unwrap();
        assert_eq!(s.last_message, "operator here");
        assert_eq!(s.ai_provider, "claude");
        assert_eq!(s.history.len(), 2);
        assert_eq!(s.history[1].sender, Sender::Portal);
    }

    #[tokio::test]
    async fn append_to_missing_session_is_not_found() {
        let store = SessionStore::in_memory();
        let err = store.append("nope", Message::portal("x")).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn list_is_most_recent_first_and_limited() {
        let store = SessionStore::in_memory();
        let first = store.attach("a", "p").await.unwrap().session.id;
        store.attach("b", "p").await.unwrap();
        store.attach("c", "p").await.unwrap();
        store.append(&first, Message::portal("bump")).await.unwrap();
        let list = store.list_recent(2).await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].id, first);
    }

    #[tokio::test]
    async fn clear_and_delete() {
        let store = SessionStore::in_memory();
        let id = store.attach("a", "p").await.unwrap().session.id;
        store.append(&id, Message::bot("hi", "p")).await.unwrap();
        store.clear_history(&id).await.unwrap();
        let s = store.get(&id).await.unwrap();
        assert!(s.history.is_empty());
        assert_eq!(s.last_message, "");
        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
        for sock in ["1", "2", "3"] {
            store.attach(sock, "p").await.unwrap();
        }
        assert_eq!(store.delete_all().await.unwrap(), 3);
        assert!(store.list_recent(100).await.is_empty());
    }

    #[tokio::test]
    async fn sessions_survive_reopen() {
        let path = temp_store_path();
        let id = {
            let store = SessionStore::open(&path).await.unwrap();
            let id = store.attach("sock", "gemini-25-flash").await.unwrap().session.id;
            store.append(&id, Message::user("hello", vec![], "gemini-25-flash")).await.unwrap();
            store.append(&id, Message::bot("hi there", "gemini-25-flash")).await.unwrap();
            id
        };
        let store = SessionStore::open(&path).await.unwrap();
        let s = store.get(&id).await.unwrap();
        assert_eq!(s.history.len(), 2);
        assert_eq!(s.history[0].sender, Sender::User);
        assert_eq!(s.last_message, "hi there");
        let restored = store.attach("sock", "gemini-25-flash").await.unwrap();
        assert!(!restored.created);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[tokio::test]
    async fn corrupt_file_is_an_error() {
        let path = temp_store_path();
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(SessionStore::open(&path).await, Err(StoreError::Corrupt(_))));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }

    #[test]
    fn wire_shape() {
        let m = Message::help("stuck");
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["sender"], "user");
        assert_eq!(v["helpRequested"], true);
        assert!(v.get("aiProvider").is_none());
        let m = Message::portal("x");
        let v = serde_json::to_value(&m).unwrap();
        assert!(v.get("helpRequested").is_none());
        assert_eq!(v["images"], serde_json::json!([]));
    }
}
