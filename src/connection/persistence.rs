//! Stream-management state cache and persistence.
//!
//! The in-memory cache survives transport client destruction, so a reconnect
//! after a dead socket can still attempt resumption. The durable copy (keyed by
//! JID) survives process restarts until it goes stale. Storage is best-effort:
//! failures are logged and swallowed, never propagated.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::status::now_millis;
use crate::storage::{JoinedRoomInfo, SessionStore, StoredSessionState};
use crate::transport::{SmState, SmStatus};

/// What `load` recovered for a JID.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedSession {
    /// `None` when nothing was stored or the record is stale.
    pub sm_state: Option<SmState>,
    pub resource: Option<String>,
    /// Kept even for stale records: rejoin works without resumption.
    pub joined_rooms: Vec<JoinedRoomInfo>,
}

pub struct SmPersistence {
    cache: Mutex<Option<SmState>>,
    store: Option<Arc<dyn SessionStore>>,
    max_age: Duration,
}

impl SmPersistence {
    pub fn new(store: Option<Arc<dyn SessionStore>>, max_age: Duration) -> Self {
        Self {
            cache: Mutex::new(None),
            store,
            max_age,
        }
    }

    pub fn has_store(&self) -> bool {
        self.store.is_some()
    }

    pub fn update_cache(&self, id: &str, inbound: u32) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(SmState {
                id: id.to_string(),
                inbound,
            });
        }
    }

    pub fn cache(&self) -> Option<SmState> {
        self.cache.lock().ok().and_then(|c| c.clone())
    }

    pub fn clear_cache(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = None;
        }
    }

    /// Prefer live state from the active client (refreshing the cache), fall
    /// back to the cache otherwise.
    pub fn get_state(&self, live: Option<&SmStatus>) -> Option<SmState> {
        if let Some(state) = live.and_then(SmStatus::resumable_state) {
            self.update_cache(&state.id, state.inbound);
            return Some(state);
        }
        self.cache()
    }

    fn record(&self, resource: Option<&str>, joined_rooms: Vec<JoinedRoomInfo>) -> Option<StoredSessionState> {
        let sm = self.cache()?;
        Some(StoredSessionState {
            sm_id: Some(sm.id),
            sm_inbound: Some(sm.inbound),
            resource: resource.map(str::to_string),
            timestamp: now_millis(),
            joined_rooms,
        })
    }

    /// Write the cached SM state for `jid`. No-op without cached state or
    /// without a store.
    pub async fn persist(&self, jid: &str, resource: Option<&str>, joined_rooms: Vec<JoinedRoomInfo>) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let Some(record) = self.record(resource, joined_rooms) else {
            debug!(jid, "No SM state to persist");
            return;
        };
        match store.set_session_state(jid, &record).await {
            Ok(()) => debug!(jid, inbound = record.sm_inbound, "Persisted SM state"),
            Err(e) => warn!(jid, error = %e, "Failed to persist SM state"),
        }
    }

    /// Synchronous variant for process teardown.
    pub fn persist_now(&self, jid: &str, resource: Option<&str>, joined_rooms: Vec<JoinedRoomInfo>) {
        let Some(store) = self.store.as_ref() else {
            return;
        };
        let Some(record) = self.record(resource, joined_rooms) else {
            return;
        };
        match store.set_session_state_sync(jid, &record) {
            Ok(()) => info!(jid, inbound = record.sm_inbound, "Persisted SM state on teardown"),
            Err(e) => warn!(jid, error = %e, "Failed to persist SM state on teardown"),
        }
    }

    /// Read stored state for `jid`. Stale records lose their SM token (and are
    /// removed from storage) but still report their joined rooms.
    pub async fn load(&self, jid: &str) -> LoadedSession {
        let Some(store) = self.store.as_ref() else {
            return LoadedSession::default();
        };
        let stored = match store.get_session_state(jid).await {
            Ok(Some(stored)) => stored,
            Ok(None) => return LoadedSession::default(),
            Err(e) => {
                warn!(jid, error = %e, "Failed to load stored SM state");
                return LoadedSession::default();
            }
        };

        let age_ms = now_millis().saturating_sub(stored.timestamp);
        if age_ms > self.max_age.as_millis() as u64 {
            info!(jid, age_ms, "Stored SM state is stale, discarding token");
            if let Err(e) = store.clear_session_state(jid).await {
                warn!(jid, error = %e, "Failed to clear stale SM state");
            }
            return LoadedSession {
                sm_state: None,
                resource: stored.resource,
                joined_rooms: stored.joined_rooms,
            };
        }

        let sm_state = match (stored.sm_id, stored.sm_inbound) {
            (Some(id), Some(inbound)) if !id.is_empty() => Some(SmState { id, inbound }),
            _ => None,
        };
        debug!(jid, age_ms, has_sm = sm_state.is_some(), "Loaded stored SM state");
        LoadedSession {
            sm_state,
            resource: stored.resource,
            joined_rooms: stored.joined_rooms,
        }
    }

    /// Remove stored state; the next session starts fresh.
    pub async fn clear(&self, jid: &str) {
        if let Some(store) = self.store.as_ref() {
            if let Err(e) = store.clear_session_state(jid).await {
                warn!(jid, error = %e, "Failed to clear stored SM state");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemorySessionStore;
    use async_trait::async_trait;

    const TEN_MINUTES: Duration = Duration::from_secs(600);

    fn rooms() -> Vec<JoinedRoomInfo> {
        vec![JoinedRoomInfo {
            jid: "team@conference.b.com".into(),
            nickname: "a".into(),
            password: Some("secret".into()),
            autojoin: None,
        }]
    }

    fn with_memory_store() -> (SmPersistence, Arc<MemorySessionStore>) {
        let store = Arc::new(MemorySessionStore::new());
        (SmPersistence::new(Some(store.clone()), TEN_MINUTES), store)
    }

    #[test]
    fn test_cache_operations() {
        let persistence = SmPersistence::new(None, TEN_MINUTES);
        assert_eq!(persistence.cache(), None);
        persistence.update_cache("sm-1", 3);
        assert_eq!(
            persistence.cache(),
            Some(SmState {
                id: "sm-1".into(),
                inbound: 3
            })
        );
        persistence.clear_cache();
        assert_eq!(persistence.cache(), None);
    }

    #[test]
    fn test_get_state_prefers_live_client() {
        let persistence = SmPersistence::new(None, TEN_MINUTES);
        persistence.update_cache("old", 1);

        let live = SmStatus {
            id: Some("new".into()),
            inbound: 9,
            enabled: true,
            ..Default::default()
        };
        let state = persistence.get_state(Some(&live)).unwrap();
        assert_eq!(state.id, "new");
        // Cache refreshed from the live client
        assert_eq!(persistence.cache().unwrap().inbound, 9);
    }

    #[test]
    fn test_get_state_falls_back_to_cache() {
        let persistence = SmPersistence::new(None, TEN_MINUTES);
        assert_eq!(persistence.get_state(None), None);

        persistence.update_cache("cached", 5);
        let dead = SmStatus::default();
        assert_eq!(persistence.get_state(Some(&dead)).unwrap().id, "cached");
        assert_eq!(persistence.get_state(None).unwrap().inbound, 5);
    }

    #[tokio::test]
    async fn test_persist_then_load_roundtrips() {
        let (persistence, _store) = with_memory_store();
        persistence.update_cache("sm-xyz", 17);
        persistence.persist("a@b.com", Some("res"), rooms()).await;

        let loaded = persistence.load("a@b.com").await;
        assert_eq!(
            loaded.sm_state,
            Some(SmState {
                id: "sm-xyz".into(),
                inbound: 17
            })
        );
        assert_eq!(loaded.resource.as_deref(), Some("res"));
        assert_eq!(loaded.joined_rooms, rooms());
    }

    #[tokio::test]
    async fn test_persist_without_cache_is_noop() {
        let (persistence, store) = with_memory_store();
        persistence.persist("a@b.com", None, rooms()).await;
        assert_eq!(store.get_session_state("a@b.com").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_stale_state_drops_token_keeps_rooms() {
        let (persistence, store) = with_memory_store();
        let stale = StoredSessionState {
            sm_id: Some("sm-old".into()),
            sm_inbound: Some(3),
            resource: Some("res".into()),
            timestamp: now_millis() - 11 * 60 * 1000,
            joined_rooms: rooms(),
        };
        store.set_session_state("a@b.com", &stale).await.unwrap();

        let loaded = persistence.load("a@b.com").await;
        assert_eq!(loaded.sm_state, None);
        assert_eq!(loaded.joined_rooms, rooms());
        // Stale entry proactively removed
        assert_eq!(store.get_session_state("a@b.com").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_persist_now_writes_synchronously() {
        let (persistence, store) = with_memory_store();
        persistence.update_cache("sm-1", 100);
        persistence.persist_now("a@b.com", None, Vec::new());
        let stored = store.get_session_state("a@b.com").await.unwrap().unwrap();
        assert_eq!(stored.sm_inbound, Some(100));
    }

    #[tokio::test]
    async fn test_clear_removes_stored_state() {
        let (persistence, store) = with_memory_store();
        persistence.update_cache("sm-1", 1);
        persistence.persist("a@b.com", None, Vec::new()).await;
        persistence.clear("a@b.com").await;
        assert_eq!(store.get_session_state("a@b.com").await.unwrap(), None);
    }

    struct FailingStore;

    #[async_trait]
    impl SessionStore for FailingStore {
        async fn get_session_state(&self, _: &str) -> Result<Option<StoredSessionState>, String> {
            Err("disk on fire".into())
        }
        async fn set_session_state(&self, _: &str, _: &StoredSessionState) -> Result<(), String> {
            Err("disk on fire".into())
        }
        fn set_session_state_sync(&self, _: &str, _: &StoredSessionState) -> Result<(), String> {
            Err("disk on fire".into())
        }
        async fn clear_session_state(&self, _: &str) -> Result<(), String> {
            Err("disk on fire".into())
        }
    }

    #[tokio::test]
    async fn test_storage_failures_are_swallowed() {
        let persistence = SmPersistence::new(Some(Arc::new(FailingStore)), TEN_MINUTES);
        persistence.update_cache("sm-1", 1);
        persistence.persist("a@b.com", None, Vec::new()).await;
        persistence.persist_now("a@b.com", None, Vec::new());
        persistence.clear("a@b.com").await;
        assert_eq!(persistence.load("a@b.com").await, LoadedSession::default());
    }
}
