//! Asynchronous batched durability, decoupled from UI responsiveness.
//!
//! Entries are keyed by message id with last-write-wins semantics before
//! flush. User-originated writes flush immediately; agent bursts coalesce
//! behind a debounce window. A failed flush never drops data — entries stay
//! queued and drain on the next trigger.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::cache::SessionCache;
use crate::config::SyncTuning;
use crate::session::api::{MessageUpsert, SessionApi, SessionApiError, SessionMetadataUpdate};
use crate::session::{StoredMessage, UserMessage};

#[derive(Debug, Clone)]
pub enum QueueEvent {
    FlushSucceeded { count: usize },
    FlushFailed { error: String, pending: usize },
}

/// The two write paths, selected by a single provenance predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushStrategy {
    Immediate,
    Debounced,
}

pub const fn flush_strategy(user_originated: bool) -> FlushStrategy {
    if user_originated {
        FlushStrategy::Immediate
    } else {
        FlushStrategy::Debounced
    }
}

struct Entry {
    record: MessageUpsert,
    revision: u64,
}

#[derive(Default)]
struct EntryMap {
    map: HashMap<String, Entry>,
    order: Vec<String>,
    next_revision: u64,
}

impl EntryMap {
    fn upsert(&mut self, record: MessageUpsert) {
        let revision = self.next_revision;
        self.next_revision += 1;
        let id = record.id.clone();
        if self.map.insert(id.clone(), Entry { record, revision }).is_none() {
            self.order.push(id);
        }
    }
}

struct QueueInner {
    session_id: String,
    api: SessionApi,
    cache: SessionCache,
    debounce_window: Duration,
    entries: Mutex<EntryMap>,
    flush_in_flight: AtomicBool,
    debounce_timer: Mutex<Option<JoinHandle<()>>>,
    events: Option<mpsc::UnboundedSender<QueueEvent>>,
}

#[derive(Clone)]
pub struct PersistenceQueue {
    inner: Arc<QueueInner>,
}

impl PersistenceQueue {
    pub fn new(
        api: SessionApi,
        cache: SessionCache,
        session_id: impl Into<String>,
        tuning: &SyncTuning,
        events: Option<mpsc::UnboundedSender<QueueEvent>>,
    ) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                session_id: session_id.into(),
                api,
                cache,
                debounce_window: tuning.flush_debounce,
                entries: Mutex::new(EntryMap::default()),
                flush_in_flight: AtomicBool::new(false),
                debounce_timer: Mutex::new(None),
                events,
            }),
        }
    }

    /// Queue an inbound wire frame. The cache mirror happens synchronously
    /// before the entry is enqueued. `user_originated` is the reconciler's
    /// classification (server echoes of user input count as user).
    pub async fn queue_frame(&self, message: &StoredMessage, user_originated: bool) {
        self.inner.cache.append_message(message);
        self.enqueue(MessageUpsert::from_stored(message), user_originated)
            .await;
    }

    /// Queue locally authored text. Always user-originated.
    pub async fn queue_user_message(&self, message: &UserMessage) {
        self.inner.cache.append_user_message(message);
        self.enqueue(MessageUpsert::from_user(message), true).await;
    }

    async fn enqueue(&self, record: MessageUpsert, user_originated: bool) {
        self.inner.entries.lock().unwrap().upsert(record);
        match flush_strategy(user_originated) {
            FlushStrategy::Immediate => {
                self.cancel_debounce();
                self.flush().await;
            }
            FlushStrategy::Debounced => self.schedule_debounced_flush(),
        }
    }

    /// Idempotent: a no-op when the queue is empty or a flush is already in
    /// flight. On success exactly the flushed batch is cleared; entries
    /// re-queued mid-flight keep their newer value.
    pub async fn flush(&self) {
        if self.inner.flush_in_flight.swap(true, Ordering::SeqCst) {
            debug!("flush already in flight");
            return;
        }
        let batch: Vec<(String, u64, MessageUpsert)> = {
            let entries = self.inner.entries.lock().unwrap();
            entries
                .order
                .iter()
                .filter_map(|id| {
                    entries
                        .map
                        .get(id)
                        .map(|entry| (id.clone(), entry.revision, entry.record.clone()))
                })
                .collect()
        };
        if batch.is_empty() {
            self.inner.flush_in_flight.store(false, Ordering::SeqCst);
            return;
        }

        let records: Vec<MessageUpsert> =
            batch.iter().map(|(_, _, record)| record.clone()).collect();
        let result = self
            .inner
            .api
            .push_messages(&self.inner.session_id, &records)
            .await;
        self.inner.flush_in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                let mut entries = self.inner.entries.lock().unwrap();
                for (id, revision, _) in &batch {
                    if entries.map.get(id).map(|entry| entry.revision) == Some(*revision) {
                        entries.map.remove(id);
                    }
                }
                let EntryMap { map, order, .. } = &mut *entries;
                order.retain(|id| map.contains_key(id));
                drop(entries);
                self.emit(QueueEvent::FlushSucceeded {
                    count: batch.len(),
                });
            }
            Err(err) => {
                let pending = self.pending_len();
                warn!(error = %err, pending, "message flush failed; entries retained");
                self.emit(QueueEvent::FlushFailed {
                    error: err.to_string(),
                    pending,
                });
            }
        }
    }

    /// Final teardown: one awaited flush, then a best-effort beacon for
    /// anything a failed flush left behind.
    pub async fn shutdown(&self) {
        self.cancel_debounce();
        self.flush().await;
        let leftovers: Vec<MessageUpsert> = {
            let entries = self.inner.entries.lock().unwrap();
            entries
                .order
                .iter()
                .filter_map(|id| entries.map.get(id).map(|entry| entry.record.clone()))
                .collect()
        };
        if !leftovers.is_empty() {
            debug!(count = leftovers.len(), "sending unload beacon for unflushed entries");
            self.inner.api.beacon_push(&self.inner.session_id, leftovers);
        }
    }

    /// Session-level pass-through; bypasses the message dedup/debounce path.
    pub async fn update_metadata(
        &self,
        patch: &SessionMetadataUpdate,
    ) -> Result<(), SessionApiError> {
        self.inner
            .api
            .update_metadata(&self.inner.session_id, patch)
            .await
    }

    pub fn pending_len(&self) -> usize {
        self.inner.entries.lock().unwrap().map.len()
    }

    fn schedule_debounced_flush(&self) {
        let queue = self.clone();
        let window = self.inner.debounce_window;
        let handle = tokio::spawn(async move {
            sleep(window).await;
            queue.flush().await;
        });
        // Restart the window: the flush fires after the *last* event.
        if let Some(old) = self.inner.debounce_timer.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    fn cancel_debounce(&self) {
        if let Some(timer) = self.inner.debounce_timer.lock().unwrap().take() {
            timer.abort();
        }
    }

    fn emit(&self, event: QueueEvent) {
        if let Some(events) = &self.inner.events {
            let _ = events.send(event);
        }
    }
}
