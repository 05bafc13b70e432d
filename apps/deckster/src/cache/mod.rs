//! Synchronous snapshot cache keyed by session id.
//!
//! The cache exists so a returning view can render instantly without a
//! network round trip. It is a performance optimization, never a correctness
//! dependency: every failure mode (missing key, parse failure, schema
//! mismatch, TTL expiry, quota exhaustion) degrades to a plain miss or a
//! dropped write.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::config::SyncTuning;
use crate::session::{ArtifactRef, ArtifactVersion, Stage, StatusNote, StoredMessage, UserMessage};

/// Bump when [`CachedSessionState`] changes shape; old snapshots then read
/// as misses instead of errors.
pub const SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CacheWriteError {
    #[error("storage quota exceeded")]
    QuotaExceeded,
}

/// Minimal synchronous string store the cache sits on. Implementations must
/// not block on I/O.
pub trait CacheStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn put(&self, key: &str, value: &str) -> Result<(), CacheWriteError>;
    fn remove(&self, key: &str);
}

/// In-memory store with an optional byte budget so quota behavior is real
/// and testable.
#[derive(Default)]
pub struct MemoryStore {
    byte_budget: Option<usize>,
    entries: RwLock<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_budget(byte_budget: usize) -> Self {
        Self {
            byte_budget: Some(byte_budget),
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl CacheStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        self.entries.read().unwrap().get(key).cloned()
    }

    fn put(&self, key: &str, value: &str) -> Result<(), CacheWriteError> {
        let mut entries = self.entries.write().unwrap();
        if let Some(budget) = self.byte_budget {
            let other_bytes: usize = entries
                .iter()
                .filter(|(existing, _)| existing.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if other_bytes + key.len() + value.len() > budget {
                return Err(CacheWriteError::QuotaExceeded);
            }
        }
        entries.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.entries.write().unwrap().remove(key);
    }
}

pub fn session_state_key(session_id: &str) -> String {
    format!("deckster_session_{session_id}")
}

pub fn session_metadata_key(session_id: &str) -> String {
    format!("deckster_metadata_{session_id}")
}

/// Full state snapshot stored under `deckster_session_{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedSessionState {
    #[serde(rename = "version")]
    pub schema_version: u32,
    pub messages: Vec<StoredMessage>,
    pub user_messages: Vec<UserMessage>,
    #[serde(default)]
    pub strawman: Option<ArtifactRef>,
    #[serde(default, rename = "final")]
    pub final_artifact: Option<ArtifactRef>,
    #[serde(default)]
    pub active_version: Option<ArtifactVersion>,
    #[serde(default)]
    pub stage: Option<Stage>,
    #[serde(default)]
    pub slide_count: Option<u32>,
    #[serde(default)]
    pub slide_structure: Option<Value>,
    #[serde(default)]
    pub current_status: Option<StatusNote>,
    pub last_updated: DateTime<Utc>,
}

impl CachedSessionState {
    fn empty() -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            messages: Vec::new(),
            user_messages: Vec::new(),
            strawman: None,
            final_artifact: None,
            active_version: None,
            stage: None,
            slide_count: None,
            slide_structure: None,
            current_status: None,
            last_updated: Utc::now(),
        }
    }
}

/// Lightweight metadata stored under `deckster_metadata_{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachedMetadata {
    #[serde(rename = "version")]
    pub schema_version: u32,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub stage: Option<Stage>,
    pub last_updated: DateTime<Utc>,
}

/// Partial update merged onto the existing snapshot. `current_status` uses a
/// double option so callers can distinguish "leave alone" from "clear".
#[derive(Debug, Clone, Default)]
pub struct CacheUpdate {
    pub strawman: Option<ArtifactRef>,
    pub final_artifact: Option<ArtifactRef>,
    pub active_version: Option<ArtifactVersion>,
    pub stage: Option<Stage>,
    pub slide_count: Option<u32>,
    pub slide_structure: Option<Value>,
    pub current_status: Option<Option<StatusNote>>,
}

impl CacheUpdate {
    fn apply_to(self, snapshot: &mut CachedSessionState) {
        if let Some(strawman) = self.strawman {
            snapshot.strawman = Some(strawman);
        }
        if let Some(final_artifact) = self.final_artifact {
            snapshot.final_artifact = Some(final_artifact);
        }
        if let Some(active_version) = self.active_version {
            snapshot.active_version = Some(active_version);
        }
        if let Some(stage) = self.stage {
            snapshot.stage = Some(stage);
        }
        if let Some(slide_count) = self.slide_count {
            snapshot.slide_count = Some(slide_count);
        }
        if let Some(slide_structure) = self.slide_structure {
            snapshot.slide_structure = Some(slide_structure);
        }
        if let Some(current_status) = self.current_status {
            snapshot.current_status = current_status;
        }
    }
}

/// Per-session write-through view over a [`CacheStore`].
#[derive(Clone)]
pub struct SessionCache {
    store: Arc<dyn CacheStore>,
    session_id: String,
    ttl: Duration,
    message_cap: usize,
}

impl SessionCache {
    pub fn new(store: Arc<dyn CacheStore>, session_id: impl Into<String>, tuning: &SyncTuning) -> Self {
        Self {
            store,
            session_id: session_id.into(),
            ttl: tuning.cache_ttl,
            message_cap: tuning.cache_message_cap,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Missing key, parse failure, schema mismatch, and TTL expiry are all
    /// indistinguishable misses.
    pub fn get_cached_state(&self) -> Option<CachedSessionState> {
        let raw = self.store.get(&session_state_key(&self.session_id))?;
        let snapshot: CachedSessionState = serde_json::from_str(&raw).ok()?;
        if snapshot.schema_version != SCHEMA_VERSION {
            return None;
        }
        let max_age = chrono::Duration::from_std(self.ttl).ok()?;
        if Utc::now().signed_duration_since(snapshot.last_updated) > max_age {
            return None;
        }
        Some(snapshot)
    }

    pub fn set_cached_state(&self, update: CacheUpdate) {
        let mut snapshot = self
            .get_cached_state()
            .unwrap_or_else(CachedSessionState::empty);
        update.apply_to(&mut snapshot);
        self.write(snapshot);
    }

    pub fn append_message(&self, message: &StoredMessage) {
        let mut snapshot = self
            .get_cached_state()
            .unwrap_or_else(CachedSessionState::empty);
        snapshot.messages.push(message.clone());
        self.write(snapshot);
    }

    /// User-authored text lands in the parallel user-message list; the raw
    /// stream list only ever holds wire frames.
    pub fn append_user_message(&self, message: &UserMessage) {
        let mut snapshot = self
            .get_cached_state()
            .unwrap_or_else(CachedSessionState::empty);
        snapshot.user_messages.push(message.clone());
        self.write(snapshot);
    }

    /// Wholesale replacement, used after a remote restore supersedes whatever
    /// the snapshot held.
    pub fn replace_cached_state(
        &self,
        messages: Vec<StoredMessage>,
        user_messages: Vec<UserMessage>,
        update: CacheUpdate,
    ) {
        let mut snapshot = CachedSessionState::empty();
        snapshot.messages = messages;
        snapshot.user_messages = user_messages;
        update.apply_to(&mut snapshot);
        self.write(snapshot);
    }

    pub fn set_metadata(&self, title: Option<String>, stage: Option<Stage>) {
        let metadata = CachedMetadata {
            schema_version: SCHEMA_VERSION,
            title,
            stage,
            last_updated: Utc::now(),
        };
        let Ok(raw) = serde_json::to_string(&metadata) else {
            return;
        };
        if self
            .store
            .put(&session_metadata_key(&self.session_id), &raw)
            .is_err()
        {
            debug!(session_id = %self.session_id, "metadata cache write dropped");
        }
    }

    pub fn get_metadata(&self) -> Option<CachedMetadata> {
        let raw = self.store.get(&session_metadata_key(&self.session_id))?;
        let metadata: CachedMetadata = serde_json::from_str(&raw).ok()?;
        (metadata.schema_version == SCHEMA_VERSION).then_some(metadata)
    }

    /// Eager eviction for session switches; expiry alone would leave stale
    /// cross-session state readable.
    pub fn evict(&self) {
        self.store.remove(&session_state_key(&self.session_id));
        self.store.remove(&session_metadata_key(&self.session_id));
    }

    fn write(&self, mut snapshot: CachedSessionState) {
        snapshot.schema_version = SCHEMA_VERSION;
        snapshot.last_updated = Utc::now();
        let key = session_state_key(&self.session_id);
        let Ok(raw) = serde_json::to_string(&snapshot) else {
            debug!(session_id = %self.session_id, "cache snapshot failed to serialize");
            return;
        };
        match self.store.put(&key, &raw) {
            Ok(()) => {}
            Err(CacheWriteError::QuotaExceeded) => {
                trim_to_newest(&mut snapshot.messages, self.message_cap);
                trim_to_newest(&mut snapshot.user_messages, self.message_cap);
                let Ok(raw) = serde_json::to_string(&snapshot) else {
                    return;
                };
                if self.store.put(&key, &raw).is_err() {
                    debug!(session_id = %self.session_id, "cache write dropped after trim");
                }
            }
        }
    }
}

fn trim_to_newest<T>(list: &mut Vec<T>, cap: usize) {
    if list.len() > cap {
        let excess = list.len() - cap;
        list.drain(..excess);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use director_proto::{ChatPayload, FrameBody, ServerFrame};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tuning() -> SyncTuning {
        SyncTuning {
            cache_message_cap: 500,
            ..SyncTuning::default()
        }
    }

    fn stored(id: &str, text: &str) -> StoredMessage {
        StoredMessage {
            frame: ServerFrame {
                message_id: id.into(),
                session_id: "sess-1".into(),
                timestamp: "2025-05-02T10:00:00Z".into(),
                body: FrameBody::ChatMessage(ChatPayload {
                    text: text.into(),
                    ..ChatPayload::default()
                }),
            },
            received_at: Some(Utc::now()),
        }
    }

    /// Store double that rejects the first N puts with a quota error.
    struct QuotaOnce {
        inner: MemoryStore,
        failures_left: AtomicUsize,
    }

    impl QuotaOnce {
        fn new(failures: usize) -> Self {
            Self {
                inner: MemoryStore::new(),
                failures_left: AtomicUsize::new(failures),
            }
        }
    }

    impl CacheStore for QuotaOnce {
        fn get(&self, key: &str) -> Option<String> {
            self.inner.get(key)
        }

        fn put(&self, key: &str, value: &str) -> Result<(), CacheWriteError> {
            let left = self.failures_left.load(Ordering::SeqCst);
            if left > 0 {
                self.failures_left.store(left - 1, Ordering::SeqCst);
                return Err(CacheWriteError::QuotaExceeded);
            }
            self.inner.put(key, value)
        }

        fn remove(&self, key: &str) {
            self.inner.remove(key);
        }
    }

    #[test]
    fn expired_snapshot_reads_as_a_miss() {
        let store = Arc::new(MemoryStore::new());
        let cache = SessionCache::new(store.clone(), "sess-1", &tuning());
        cache.append_message(&stored("m1", "hello"));
        assert!(cache.get_cached_state().is_some());

        // Age the stored snapshot past the TTL by rewriting its stamp.
        let key = session_state_key("sess-1");
        let raw = store.get(&key).unwrap();
        let mut snapshot: CachedSessionState = serde_json::from_str(&raw).unwrap();
        snapshot.last_updated = Utc::now() - chrono::Duration::hours(25);
        store
            .put(&key, &serde_json::to_string(&snapshot).unwrap())
            .unwrap();

        assert!(cache.get_cached_state().is_none());
    }

    #[test]
    fn schema_mismatch_and_garbage_read_as_misses() {
        let store = Arc::new(MemoryStore::new());
        let cache = SessionCache::new(store.clone(), "sess-1", &tuning());
        let key = session_state_key("sess-1");

        store.put(&key, "not json at all").unwrap();
        assert!(cache.get_cached_state().is_none());

        let mut snapshot = CachedSessionState::empty();
        snapshot.schema_version = SCHEMA_VERSION + 1;
        store
            .put(&key, &serde_json::to_string(&snapshot).unwrap())
            .unwrap();
        assert!(cache.get_cached_state().is_none());
    }

    #[test]
    fn quota_failure_trims_to_the_newest_entries_and_retries() {
        let tuning = SyncTuning {
            cache_message_cap: 500,
            ..SyncTuning::default()
        };
        let store = Arc::new(MemoryStore::new());
        let cache = SessionCache::new(store.clone(), "sess-1", &tuning);
        for i in 0..600 {
            cache.append_message(&stored(&format!("m{i}"), "x"));
        }
        assert_eq!(cache.get_cached_state().unwrap().messages.len(), 600);

        // Next write hits the quota once; the retry lands trimmed.
        let quota_store = Arc::new(QuotaOnce::new(1));
        quota_store
            .inner
            .put(
                &session_state_key("sess-1"),
                &store.get(&session_state_key("sess-1")).unwrap(),
            )
            .unwrap();
        let cache = SessionCache::new(quota_store, "sess-1", &tuning);
        cache.append_message(&stored("m600", "x"));

        let snapshot = cache.get_cached_state().unwrap();
        assert_eq!(snapshot.messages.len(), 500);
        assert_eq!(snapshot.messages.last().unwrap().frame.message_id, "m600");
    }

    #[test]
    fn write_is_dropped_silently_when_trim_does_not_help() {
        let store = Arc::new(QuotaOnce::new(2));
        let cache = SessionCache::new(store, "sess-1", &tuning());
        cache.append_message(&stored("m1", "hello"));
        assert!(cache.get_cached_state().is_none());
    }

    #[test]
    fn user_messages_live_in_the_parallel_list() {
        let store = Arc::new(MemoryStore::new());
        let cache = SessionCache::new(store, "sess-1", &tuning());
        cache.append_message(&stored("m1", "hello"));
        cache.append_user_message(&UserMessage::new("Create a pitch deck"));

        let snapshot = cache.get_cached_state().unwrap();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.user_messages.len(), 1);
        assert_eq!(snapshot.user_messages[0].text, "Create a pitch deck");
    }

    #[test]
    fn partial_updates_merge_onto_the_existing_snapshot() {
        let store = Arc::new(MemoryStore::new());
        let cache = SessionCache::new(store, "sess-1", &tuning());
        cache.append_message(&stored("m1", "hello"));

        cache.set_cached_state(CacheUpdate {
            active_version: Some(ArtifactVersion::Strawman),
            stage: Some(Stage::PreviewReady),
            slide_count: Some(8),
            ..CacheUpdate::default()
        });
        cache.set_cached_state(CacheUpdate {
            current_status: Some(None),
            ..CacheUpdate::default()
        });

        let snapshot = cache.get_cached_state().unwrap();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.active_version, Some(ArtifactVersion::Strawman));
        assert_eq!(snapshot.stage, Some(Stage::PreviewReady));
        assert_eq!(snapshot.slide_count, Some(8));
        assert!(snapshot.current_status.is_none());
    }

    #[test]
    fn switching_sessions_evicts_eagerly() {
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let old = SessionCache::new(store.clone(), "sess-old", &tuning());
        old.append_message(&stored("m1", "hello"));
        old.set_metadata(Some("Old deck".into()), Some(Stage::Planning));
        assert!(old.get_cached_state().is_some());
        assert!(old.get_metadata().is_some());

        old.evict();
        assert!(old.get_cached_state().is_none());
        assert!(old.get_metadata().is_none());
    }

    #[test]
    fn memory_store_budget_rejects_oversized_writes() {
        let store = MemoryStore::with_budget(32);
        assert!(store.put("k", "small").is_ok());
        assert_eq!(
            store.put("k", &"x".repeat(64)),
            Err(CacheWriteError::QuotaExceeded)
        );
        // The prior value is still readable.
        assert_eq!(store.get("k").as_deref(), Some("small"));
    }
}
