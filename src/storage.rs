//! Durable session-state storage.
//!
//! The connection core persists `{smId, smInbound, resource, timestamp,
//! joinedRooms}` per JID so a restarted process can resume its SM session
//! (or at least rejoin its rooms). Every operation may fail; callers treat
//! failures as non-fatal.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// A multi-user room the session had joined, kept for rejoin after a fresh
/// (non-resumed) session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinedRoomInfo {
    pub jid: String,
    pub nickname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub autojoin: Option<bool>,
}

/// Persisted record for one JID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredSessionState {
    pub sm_id: Option<String>,
    pub sm_inbound: Option<u32>,
    pub resource: Option<String>,
    /// Epoch millis at which the record was written.
    pub timestamp: u64,
    #[serde(default)]
    pub joined_rooms: Vec<JoinedRoomInfo>,
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn get_session_state(&self, jid: &str) -> Result<Option<StoredSessionState>, String>;

    async fn set_session_state(&self, jid: &str, state: &StoredSessionState)
        -> Result<(), String>;

    /// Blocking write for process-teardown hooks, where an async write may
    /// never get scheduled.
    fn set_session_state_sync(&self, jid: &str, state: &StoredSessionState)
        -> Result<(), String>;

    async fn clear_session_state(&self, jid: &str) -> Result<(), String>;
}

/// In-memory store, for embedding hosts without durable storage and tests.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    entries: Mutex<HashMap<String, StoredSessionState>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, StoredSessionState>>, String> {
        self.entries
            .lock()
            .map_err(|_| "Session store lock poisoned".to_string())
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get_session_state(&self, jid: &str) -> Result<Option<StoredSessionState>, String> {
        Ok(self.lock()?.get(jid).cloned())
    }

    async fn set_session_state(
        &self,
        jid: &str,
        state: &StoredSessionState,
    ) -> Result<(), String> {
        self.set_session_state_sync(jid, state)
    }

    fn set_session_state_sync(&self, jid: &str, state: &StoredSessionState) -> Result<(), String> {
        self.lock()?.insert(jid.to_string(), state.clone());
        Ok(())
    }

    async fn clear_session_state(&self, jid: &str) -> Result<(), String> {
        self.lock()?.remove(jid);
        Ok(())
    }
}

/// One JSON file per JID under a directory.
#[derive(Debug, Clone)]
pub struct FileSessionStore {
    dir: PathBuf,
}

impl FileSessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Platform data directory:
    ///   macOS:   ~/Library/Application Support/com.processone.fluux/sessions/
    ///   Linux:   ~/.local/share/com.processone.fluux/sessions/
    ///   Windows: %LOCALAPPDATA%\com.processone.fluux\sessions\
    pub fn default_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("com.processone.fluux")
            .join("sessions")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path for a JID. Anything outside `[A-Za-z0-9@._-]` is replaced so
    /// a resource or odd localpart can't escape the directory.
    pub fn path_for(&self, jid: &str) -> PathBuf {
        let name: String = jid
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '@' | '.' | '_' | '-') {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.dir.join(format!("{}.json", name.trim_start_matches('.')))
    }

    fn encode(state: &StoredSessionState) -> Result<String, String> {
        serde_json::to_string(state).map_err(|e| format!("Failed to serialize session state: {}", e))
    }
}

impl Default for FileSessionStore {
    fn default() -> Self {
        Self::new(Self::default_dir())
    }
}

#[async_trait]
impl SessionStore for FileSessionStore {
    async fn get_session_state(&self, jid: &str) -> Result<Option<StoredSessionState>, String> {
        let path = self.path_for(jid);
        let text = match tokio::fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(jid, "No stored session state");
                return Ok(None);
            }
            Err(e) => return Err(format!("Failed to read {}: {}", path.display(), e)),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|e| format!("Failed to parse {}: {}", path.display(), e))
    }

    async fn set_session_state(
        &self,
        jid: &str,
        state: &StoredSessionState,
    ) -> Result<(), String> {
        let json = Self::encode(state)?;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| format!("Failed to create {}: {}", self.dir.display(), e))?;
        let path = self.path_for(jid);
        tokio::fs::write(&path, json)
            .await
            .map_err(|e| format!("Failed to write {}: {}", path.display(), e))
    }

    fn set_session_state_sync(&self, jid: &str, state: &StoredSessionState) -> Result<(), String> {
        let json = Self::encode(state)?;
        std::fs::create_dir_all(&self.dir)
            .map_err(|e| format!("Failed to create {}: {}", self.dir.display(), e))?;
        let path = self.path_for(jid);
        std::fs::write(&path, json).map_err(|e| format!("Failed to write {}: {}", path.display(), e))
    }

    async fn clear_session_state(&self, jid: &str) -> Result<(), String> {
        let path = self.path_for(jid);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                info!(jid, "Cleared stored session state");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(format!("Failed to remove {}: {}", path.display(), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StoredSessionState {
        StoredSessionState {
            sm_id: Some("sm-abc".into()),
            sm_inbound: Some(42),
            resource: Some("fluux-desktop".into()),
            timestamp: 1_700_000_000_000,
            joined_rooms: vec![JoinedRoomInfo {
                jid: "dev@conference.example.com".into(),
                nickname: "alice".into(),
                password: None,
                autojoin: Some(true),
            }],
        }
    }

    #[test]
    fn test_stored_state_json_shape() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["smId"], "sm-abc");
        assert_eq!(json["smInbound"], 42);
        assert_eq!(json["joinedRooms"][0]["nickname"], "alice");
        assert!(json["joinedRooms"][0].get("password").is_none());
    }

    #[test]
    fn test_missing_joined_rooms_defaults_to_empty() {
        let state: StoredSessionState = serde_json::from_str(
            r#"{"smId":null,"smInbound":null,"resource":null,"timestamp":5}"#,
        )
        .unwrap();
        assert!(state.joined_rooms.is_empty());
    }

    #[test]
    fn test_path_for_sanitizes_jid() {
        let store = FileSessionStore::new("/tmp/sessions");
        assert_eq!(
            store.path_for("alice@example.com"),
            PathBuf::from("/tmp/sessions/alice@example.com.json")
        );
        assert_eq!(
            store.path_for("../../etc/passwd"),
            PathBuf::from("/tmp/sessions/_.._etc_passwd.json")
        );
    }

    #[tokio::test]
    async fn test_file_store_roundtrip_and_clear() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path().join("sessions"));

        assert_eq!(store.get_session_state("a@b.com").await.unwrap(), None);

        store.set_session_state("a@b.com", &sample()).await.unwrap();
        assert_eq!(
            store.get_session_state("a@b.com").await.unwrap(),
            Some(sample())
        );

        store.clear_session_state("a@b.com").await.unwrap();
        assert_eq!(store.get_session_state("a@b.com").await.unwrap(), None);
        // Clearing twice is fine
        store.clear_session_state("a@b.com").await.unwrap();
    }

    #[tokio::test]
    async fn test_file_store_sync_write_is_readable() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        store.set_session_state_sync("a@b.com", &sample()).unwrap();
        assert_eq!(
            store.get_session_state("a@b.com").await.unwrap(),
            Some(sample())
        );
    }

    #[tokio::test]
    async fn test_file_store_corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileSessionStore::new(dir.path());
        std::fs::write(store.path_for("a@b.com"), "{not json").unwrap();
        assert!(store.get_session_state("a@b.com").await.is_err());
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemorySessionStore::new();
        store.set_session_state("a@b.com", &sample()).await.unwrap();
        assert_eq!(
            store.get_session_state("a@b.com").await.unwrap(),
            Some(sample())
        );
        store.clear_session_state("a@b.com").await.unwrap();
        assert_eq!(store.get_session_state("a@b.com").await.unwrap(), None);
    }
}
