//! Per-session coordinator: owns one session's transport, state, cache,
//! queue, and reconciler, and drives the event loop between them.
//!
//! `BuilderSession` is a cheap clone-able handle; one clone runs the event
//! loop ([`BuilderSession::run`]) while others feed user input and read the
//! reconciled transcript. Consumers observe the session through the
//! [`BuilderEvent`] stream returned by the constructor.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use director_proto::ServerFrame;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::cache::{CacheStore, CacheUpdate, SessionCache};
use crate::config::SyncTuning;
use crate::queue::{PersistenceQueue, QueueEvent};
use crate::reconcile::{DisplayMessage, DisplayUnit, MessageReconciler, Provenance};
use crate::session::api::{
    SessionApi, SessionApiError, SessionMetadataUpdate, SessionRecord,
};
use crate::session::{
    ArtifactVersion, RestoreHints, SessionEvent, SessionState, Stage, StatusNote, StoredMessage,
    UserMessage,
};
use crate::transport::{
    ConnectionState, DirectorConnection, MessageContext, SessionIdentity, TransportError,
    TransportEvent,
};

mod generation;

pub use generation::{GenerationSlot, GenerationState};

#[derive(Debug, Error)]
pub enum BuilderError {
    #[error("transport setup failed: {0}")]
    Transport(#[from] TransportError),
    #[error("session api error: {0}")]
    Api(#[from] SessionApiError),
    /// The remote store reports the session soft-deleted; callers start a
    /// fresh session instead of rendering broken state.
    #[error("session was deleted")]
    SessionDeleted,
}

/// What the owning view needs to react to. Everything else stays internal.
#[derive(Debug, Clone)]
pub enum BuilderEvent {
    Connection(ConnectionState),
    /// Reconnect attempts are exhausted; the one state that needs a
    /// persistent user-facing affordance.
    ConnectionLost,
    TranscriptUpdated,
    StatusChanged,
    StageChanged(Stage),
    PreviewReady { url: String },
    PresentationReady { url: String },
    /// A flush failed; entries are retained and retried, so this is
    /// informational rather than actionable.
    PersistenceError(String),
}

/// Locally authored messages plus the classifier that reconciles them
/// against the stream. Kept together because every mutation touches both.
#[derive(Default)]
struct ReconcileBook {
    reconciler: MessageReconciler,
    user_messages: Vec<UserMessage>,
}

struct BuilderInner {
    identity: SessionIdentity,
    director_url: String,
    tuning: SyncTuning,
    store: Arc<dyn CacheStore>,
    connection: Arc<DirectorConnection>,
    state: Mutex<SessionState>,
    reconcile: Mutex<ReconcileBook>,
    cache: SessionCache,
    queue: PersistenceQueue,
    api: SessionApi,
    generation: GenerationSlot,
    events: mpsc::UnboundedSender<BuilderEvent>,
    transport_rx: Mutex<Option<mpsc::UnboundedReceiver<TransportEvent>>>,
    queue_rx: Mutex<Option<mpsc::UnboundedReceiver<QueueEvent>>>,
    status_clear: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct BuilderSession {
    inner: Arc<BuilderInner>,
}

impl BuilderSession {
    pub fn new(
        director_url: &str,
        tuning: SyncTuning,
        store: Arc<dyn CacheStore>,
        api: SessionApi,
        identity: SessionIdentity,
    ) -> Result<(Self, mpsc::UnboundedReceiver<BuilderEvent>), BuilderError> {
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let connection = Arc::new(DirectorConnection::new(
            director_url,
            tuning.clone(),
            transport_tx,
        )?);
        connection.set_identity(identity.clone());
        let cache = SessionCache::new(Arc::clone(&store), identity.session_id.clone(), &tuning);
        let queue = PersistenceQueue::new(
            api.clone(),
            cache.clone(),
            identity.session_id.clone(),
            &tuning,
            Some(queue_tx),
        );
        let generation = GenerationSlot::new(tuning.generation_timeout);
        let state = SessionState::new(identity.session_id.clone());

        let session = Self {
            inner: Arc::new(BuilderInner {
                identity,
                director_url: director_url.to_string(),
                tuning,
                store,
                connection,
                state: Mutex::new(state),
                reconcile: Mutex::new(ReconcileBook::default()),
                cache,
                queue,
                api,
                generation,
                events: event_tx,
                transport_rx: Mutex::new(Some(transport_rx)),
                queue_rx: Mutex::new(Some(queue_rx)),
                status_clear: Mutex::new(None),
            }),
        };
        Ok((session, event_rx))
    }

    pub fn session_id(&self) -> &str {
        &self.inner.identity.session_id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn stage(&self) -> Stage {
        self.inner.state.lock().unwrap().stage()
    }

    pub fn status(&self) -> Option<StatusNote> {
        self.inner.state.lock().unwrap().current_status().cloned()
    }

    pub fn active_version(&self) -> Option<ArtifactVersion> {
        self.inner.state.lock().unwrap().active_version()
    }

    pub fn presentation_url(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .unwrap()
            .presentation_url()
            .map(str::to_string)
    }

    pub fn generation(&self) -> &GenerationSlot {
        &self.inner.generation
    }

    pub fn pending_writes(&self) -> usize {
        self.inner.queue.pending_len()
    }

    /// Bring the session up: restore from the snapshot cache (instant), then
    /// the remote store (authoritative), then open the Director socket.
    ///
    /// Remote restore failures other than a deleted session degrade to the
    /// cached view; availability beats strict consistency here.
    pub async fn open(&self) -> Result<(), BuilderError> {
        self.restore_from_cache();
        match self.inner.api.fetch_session(self.session_id()).await {
            Ok(record) => self.restore_from_record(&record),
            Err(SessionApiError::Gone) => return Err(BuilderError::SessionDeleted),
            Err(err) => {
                warn!(error = %err, "remote restore failed; keeping cached view");
            }
        }
        self.inner.connection.connect().await;
        Ok(())
    }

    /// Drive transport and queue events until the connection handle drops.
    /// A second concurrent call is a logged no-op.
    pub async fn run(&self) {
        let taken = (
            self.inner.transport_rx.lock().unwrap().take(),
            self.inner.queue_rx.lock().unwrap().take(),
        );
        let (Some(mut transport_rx), Some(mut queue_rx)) = taken else {
            debug!("builder event loop already running");
            return;
        };
        loop {
            tokio::select! {
                event = transport_rx.recv() => match event {
                    Some(event) => self.handle_transport(event).await,
                    None => break,
                },
                event = queue_rx.recv() => match event {
                    Some(event) => self.handle_queue(event),
                    None => break,
                },
            }
        }
    }

    /// Optimistic send: the local append (reconciler, cache, queue) happens
    /// whether or not the socket accepts the frame. Returns the transport's
    /// verdict.
    pub async fn send_user_message(&self, text: &str, context: Option<MessageContext>) -> bool {
        let message = UserMessage::new(text);
        {
            let mut guard = self.inner.reconcile.lock().unwrap();
            let book = &mut *guard;
            book.reconciler.note_local_message(&message);
            book.user_messages.push(message.clone());
        }
        self.inner.queue.queue_user_message(&message).await;
        // The Director starts generating on user input; arm the placeholder
        // so a stalled run rolls back instead of spinning forever.
        self.inner.generation.begin();
        self.emit(BuilderEvent::TranscriptUpdated);
        let sent = self.inner.connection.send_user_message(text, context);
        if !sent {
            debug!("user message kept locally; socket not open");
        }
        sent
    }

    pub fn switch_version(&self, target: ArtifactVersion) -> bool {
        let switched = self.inner.state.lock().unwrap().switch_version(target);
        if switched {
            self.inner.cache.set_cached_state(CacheUpdate {
                active_version: Some(target),
                ..CacheUpdate::default()
            });
            self.emit(BuilderEvent::TranscriptUpdated);
        }
        switched
    }

    /// The deduplicated, ordered message view.
    pub fn reconciled(&self) -> Vec<DisplayMessage> {
        let messages = self.inner.state.lock().unwrap().messages().to_vec();
        let mut guard = self.inner.reconcile.lock().unwrap();
        let book = &mut *guard;
        book.reconciler.reconcile(&book.user_messages, &messages)
    }

    /// The view with adjacent structural frames collapsed for rendering.
    pub fn transcript(&self) -> Vec<DisplayUnit> {
        MessageReconciler::group(&self.reconciled())
    }

    /// Fold one decoded frame into the session. Exposed for restore and
    /// replay paths; live frames arrive through [`run`].
    pub async fn apply_frame(&self, frame: ServerFrame, received_at: DateTime<Utc>) {
        let user_originated = {
            let mut guard = self.inner.reconcile.lock().unwrap();
            guard.reconciler.classify(&frame) == Provenance::User
        };
        let stored = StoredMessage {
            frame: frame.clone(),
            received_at: Some(received_at),
        };
        let (events, mirror, stage, preview_url, final_url, active_version) = {
            let mut state = self.inner.state.lock().unwrap();
            let events = state.apply(frame, received_at);
            let mirror = CacheUpdate {
                strawman: state.strawman().cloned(),
                final_artifact: state.final_artifact().cloned(),
                active_version: state.active_version(),
                stage: Some(state.stage()),
                slide_count: state.active_artifact().and_then(|a| a.slide_count),
                slide_structure: state.slide_structure().cloned(),
                current_status: Some(state.current_status().cloned()),
            };
            (
                events,
                mirror,
                state.stage(),
                state.strawman().map(|a| a.url.clone()),
                state.final_artifact().map(|a| a.url.clone()),
                state.active_version(),
            )
        };
        self.inner.cache.set_cached_state(mirror);

        let mut appended = false;
        let mut stage_changed = false;
        for event in &events {
            match event {
                SessionEvent::MessageAppended => appended = true,
                SessionEvent::DuplicateDropped => {}
                SessionEvent::StatusChanged => self.emit(BuilderEvent::StatusChanged),
                SessionEvent::ScheduleStatusClear => self.schedule_status_clear(),
                SessionEvent::PreviewReady => {
                    self.inner.generation.resolve();
                    if let Some(url) = preview_url.clone() {
                        self.emit(BuilderEvent::PreviewReady { url });
                    }
                }
                SessionEvent::PresentationReady => {
                    self.inner.generation.resolve();
                    if let Some(url) = final_url.clone() {
                        self.emit(BuilderEvent::PresentationReady { url });
                    }
                }
                SessionEvent::StageChanged(stage) => {
                    stage_changed = true;
                    self.emit(BuilderEvent::StageChanged(*stage));
                }
            }
        }
        if appended {
            self.inner.queue.queue_frame(&stored, user_originated).await;
            self.emit(BuilderEvent::TranscriptUpdated);
        }
        if stage_changed {
            self.sync_metadata(stage, active_version);
        }
    }

    /// Flush, disconnect, and cancel timers. The cache entry survives so the
    /// same session can restore instantly later.
    pub async fn shutdown(&self) {
        if let Some(timer) = self.inner.status_clear.lock().unwrap().take() {
            timer.abort();
        }
        self.inner.generation.reset();
        self.inner.queue.shutdown().await;
        self.inner.connection.disconnect().await;
    }

    /// Tear this session fully down (flush + evict + disconnect), then hand
    /// back a fresh builder for the next session on the same store and api.
    pub async fn switch_session(
        &self,
        identity: SessionIdentity,
    ) -> Result<(BuilderSession, mpsc::UnboundedReceiver<BuilderEvent>), BuilderError> {
        self.shutdown().await;
        self.inner.cache.evict();
        BuilderSession::new(
            &self.inner.director_url,
            self.inner.tuning.clone(),
            Arc::clone(&self.inner.store),
            self.inner.api.clone(),
            identity,
        )
    }

    /// User-initiated soft delete. Unlike transient persistence failures,
    /// errors here propagate so the UI can surface them.
    pub async fn delete(&self) -> Result<(), BuilderError> {
        self.shutdown().await;
        self.inner.api.soft_delete(self.session_id()).await?;
        self.inner.cache.evict();
        Ok(())
    }

    pub async fn set_title(&self, title: &str) -> Result<(), BuilderError> {
        let stage = self.stage();
        self.inner.cache.set_metadata(Some(title.to_string()), Some(stage));
        self.inner
            .queue
            .update_metadata(&SessionMetadataUpdate {
                title: Some(title.to_string()),
                ..SessionMetadataUpdate::default()
            })
            .await?;
        Ok(())
    }

    async fn handle_transport(&self, event: TransportEvent) {
        match event {
            TransportEvent::StateChanged(state) => self.emit(BuilderEvent::Connection(state)),
            TransportEvent::Frame { frame, received_at } => {
                self.apply_frame(frame, received_at).await;
            }
            TransportEvent::ConnectionError(error) => {
                // Transient; the close path owns recovery.
                debug!(%error, "transport error");
            }
            TransportEvent::RetriesExhausted => self.emit(BuilderEvent::ConnectionLost),
        }
    }

    fn handle_queue(&self, event: QueueEvent) {
        match event {
            QueueEvent::FlushSucceeded { count } => {
                trace!(count, "persistence flush succeeded");
            }
            QueueEvent::FlushFailed { error, pending } => {
                debug!(%error, pending, "persistence flush failed");
                self.emit(BuilderEvent::PersistenceError(error));
            }
        }
    }

    fn restore_from_cache(&self) {
        let Some(snapshot) = self.inner.cache.get_cached_state() else {
            return;
        };
        {
            let mut guard = self.inner.reconcile.lock().unwrap();
            let book = &mut *guard;
            book.user_messages = snapshot.user_messages;
            for message in &book.user_messages {
                book.reconciler.note_local_message(message);
            }
        }
        let hints = RestoreHints {
            active_version: snapshot.active_version,
            stage: snapshot.stage,
            strawman: snapshot.strawman,
            final_artifact: snapshot.final_artifact,
            slide_structure: snapshot.slide_structure,
        };
        self.inner
            .state
            .lock()
            .unwrap()
            .restore(snapshot.messages, hints);
        self.emit(BuilderEvent::TranscriptUpdated);
    }

    fn restore_from_record(&self, record: &SessionRecord) {
        let history = record.history();
        let user_history = record.user_history();
        let hints = record.restore_hints();
        {
            let mut guard = self.inner.reconcile.lock().unwrap();
            let book = &mut *guard;
            book.user_messages = user_history.clone();
            for message in &book.user_messages {
                book.reconciler.note_local_message(message);
            }
        }
        let mirror = {
            let mut state = self.inner.state.lock().unwrap();
            state.restore(history.clone(), hints);
            CacheUpdate {
                strawman: state.strawman().cloned(),
                final_artifact: state.final_artifact().cloned(),
                // The resolution ladder's verdict, not the raw hint.
                active_version: state.active_version(),
                stage: Some(state.stage()),
                slide_count: state.active_artifact().and_then(|a| a.slide_count),
                slide_structure: state.slide_structure().cloned(),
                current_status: Some(None),
            }
        };
        self.inner
            .cache
            .replace_cached_state(history, user_history, mirror);
        self.emit(BuilderEvent::TranscriptUpdated);
    }

    fn schedule_status_clear(&self) {
        let inner = Arc::clone(&self.inner);
        let linger = self.inner.tuning.status_linger;
        let handle = tokio::spawn(async move {
            sleep(linger).await;
            let cleared = inner.state.lock().unwrap().clear_terminal_status();
            if cleared {
                inner.cache.set_cached_state(CacheUpdate {
                    current_status: Some(None),
                    ..CacheUpdate::default()
                });
                let _ = inner.events.send(BuilderEvent::StatusChanged);
            }
        });
        if let Some(old) = self.inner.status_clear.lock().unwrap().replace(handle) {
            old.abort();
        }
    }

    /// Best-effort: session-level metadata follows stage transitions, but a
    /// failed patch never blocks the message path.
    fn sync_metadata(&self, stage: Stage, active_version: Option<ArtifactVersion>) {
        let title = self.inner.cache.get_metadata().and_then(|meta| meta.title);
        self.inner.cache.set_metadata(title, Some(stage));
        let queue = self.inner.queue.clone();
        let patch = SessionMetadataUpdate {
            stage: Some(stage.ordinal()),
            active_version: active_version.map(|version| version.as_str().to_string()),
            ..SessionMetadataUpdate::default()
        };
        tokio::spawn(async move {
            if let Err(err) = queue.update_metadata(&patch).await {
                debug!(error = %err, "metadata sync failed");
            }
        });
    }

    fn emit(&self, event: BuilderEvent) {
        let _ = self.inner.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryStore;
    use crate::session::api::testing::RecordingBackend;
    use director_proto::{
        ChatPayload, FrameBody, PresentationPayload, SlideMetadata, SlidePayload, StatusKind,
        StatusPayload,
    };
    use std::time::Duration;

    fn identity(session_id: &str) -> SessionIdentity {
        SessionIdentity {
            session_id: session_id.into(),
            user_id: "user-1".into(),
        }
    }

    fn make_builder(
        backend: Arc<RecordingBackend>,
        tuning: SyncTuning,
        session_id: &str,
        store: Arc<dyn CacheStore>,
    ) -> (BuilderSession, mpsc::UnboundedReceiver<BuilderEvent>) {
        let api = SessionApi::with_backend("http://mock.store", backend).unwrap();
        // Unroutable endpoint: these tests never open a live socket.
        BuilderSession::new("ws://127.0.0.1:9/ws", tuning, store, api, identity(session_id))
            .unwrap()
    }

    fn frame(id: &str, body: FrameBody) -> ServerFrame {
        ServerFrame {
            message_id: id.into(),
            session_id: "sess-1".into(),
            timestamp: "2025-05-02T10:00:00Z".into(),
            body,
        }
    }

    fn chat(id: &str, text: &str) -> ServerFrame {
        frame(
            id,
            FrameBody::ChatMessage(ChatPayload {
                text: text.into(),
                ..ChatPayload::default()
            }),
        )
    }

    #[tokio::test]
    async fn echoed_user_text_keeps_the_local_copy() {
        let backend = Arc::new(RecordingBackend::default());
        let (builder, _events) = make_builder(
            backend.clone(),
            SyncTuning::default(),
            "sess-1",
            Arc::new(MemoryStore::new()),
        );

        let sent = builder.send_user_message("Create a pitch deck", None).await;
        assert!(!sent, "socket is closed; the send itself fails fast");

        builder
            .apply_frame(chat("srv-1", "  create a PITCH deck "), Utc::now())
            .await;

        let reconciled = builder.reconciled();
        assert_eq!(reconciled.len(), 1);
        assert_eq!(reconciled[0].provenance, Provenance::User);
        assert!(reconciled[0].id.starts_with("local-"));

        // Both the local record and the user-classified echo flush
        // immediately rather than waiting out the debounce window.
        assert_eq!(backend.pushes.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn terminal_status_clears_after_the_linger_window() {
        let tuning = SyncTuning {
            status_linger: Duration::from_millis(30),
            ..SyncTuning::default()
        };
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let backend = Arc::new(RecordingBackend::default());
        let (builder, _events) =
            make_builder(backend, tuning.clone(), "sess-1", Arc::clone(&store));

        builder
            .apply_frame(
                frame(
                    "m1",
                    FrameBody::StatusUpdate(StatusPayload {
                        status: StatusKind::Complete,
                        text: Some("done".into()),
                    }),
                ),
                Utc::now(),
            )
            .await;
        assert!(builder.status().is_some());

        sleep(Duration::from_millis(100)).await;
        assert!(builder.status().is_none());

        let mirror = SessionCache::new(store, "sess-1", &tuning);
        assert!(mirror.get_cached_state().unwrap().current_status.is_none());
    }

    #[tokio::test]
    async fn strawman_then_final_mirrors_cache_and_syncs_metadata() {
        let tuning = SyncTuning::default();
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let backend = Arc::new(RecordingBackend::default());
        let (builder, _events) =
            make_builder(backend.clone(), tuning.clone(), "sess-1", Arc::clone(&store));

        builder
            .apply_frame(
                frame(
                    "m1",
                    FrameBody::SlideUpdate(SlidePayload {
                        metadata: Some(SlideMetadata {
                            preview_url: Some("https://x/preview".into()),
                            presentation_id: Some("pres-straw".into()),
                            slide_count: Some(8),
                        }),
                        ..SlidePayload::default()
                    }),
                ),
                Utc::now(),
            )
            .await;
        assert_eq!(builder.active_version(), Some(ArtifactVersion::Strawman));

        builder
            .apply_frame(
                frame(
                    "m2",
                    FrameBody::PresentationUrl(PresentationPayload {
                        url: "https://x/final".into(),
                        presentation_id: Some("pres-final".into()),
                        slide_count: Some(10),
                    }),
                ),
                Utc::now(),
            )
            .await;
        assert_eq!(builder.active_version(), Some(ArtifactVersion::Final));
        assert_eq!(builder.presentation_url().as_deref(), Some("https://x/final"));
        assert_eq!(builder.stage(), Stage::Complete);

        let mirror = SessionCache::new(Arc::clone(&store), "sess-1", &tuning);
        let snapshot = mirror.get_cached_state().unwrap();
        assert_eq!(snapshot.active_version, Some(ArtifactVersion::Final));
        assert_eq!(snapshot.stage, Some(Stage::Complete));
        assert_eq!(snapshot.messages.len(), 2);

        // The spawned metadata patches land shortly after the stage changes.
        sleep(Duration::from_millis(50)).await;
        let patches = backend.patches.lock().unwrap();
        assert!(patches.iter().any(|patch| patch.stage == Some(4)));
        assert!(patches
            .iter()
            .any(|patch| patch.stage == Some(6)
                && patch.active_version.as_deref() == Some("final")));
    }

    #[tokio::test]
    async fn switching_sessions_flushes_and_evicts_the_old_cache() {
        let tuning = SyncTuning {
            flush_debounce: Duration::from_secs(3600),
            ..SyncTuning::default()
        };
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let backend = Arc::new(RecordingBackend::default());
        let (builder, _events) =
            make_builder(backend.clone(), tuning.clone(), "sess-1", Arc::clone(&store));

        builder.apply_frame(chat("m1", "the outline"), Utc::now()).await;
        assert_eq!(builder.pending_writes(), 1, "agent frame waits out the debounce");

        let (next, _next_events) = builder.switch_session(identity("sess-2")).await.unwrap();
        assert_eq!(next.session_id(), "sess-2");

        // The pending entry was flushed on teardown, not dropped.
        assert_eq!(backend.pushes.lock().unwrap().len(), 1);
        let old_cache = SessionCache::new(store, "sess-1", &tuning);
        assert!(old_cache.get_cached_state().is_none(), "old key must be evicted");
    }

    #[tokio::test]
    async fn opening_a_deleted_session_reports_it() {
        let backend = Arc::new(RecordingBackend::default());
        backend.deleted.lock().unwrap().insert("sess-gone".into());
        let (builder, _events) = make_builder(
            backend,
            SyncTuning::default(),
            "sess-gone",
            Arc::new(MemoryStore::new()),
        );
        let err = builder.open().await.unwrap_err();
        assert!(matches!(err, BuilderError::SessionDeleted));
    }

    #[tokio::test]
    async fn a_new_builder_restores_from_the_shared_snapshot_cache() {
        let tuning = SyncTuning::default();
        let store: Arc<dyn CacheStore> = Arc::new(MemoryStore::new());
        let backend = Arc::new(RecordingBackend::default());
        let (builder, _events) =
            make_builder(backend.clone(), tuning.clone(), "sess-1", Arc::clone(&store));

        builder.send_user_message("Create a pitch deck", None).await;
        builder.apply_frame(chat("srv-1", "On it."), Utc::now()).await;

        // Same store, fresh builder: the snapshot alone restores the view
        // even though the remote store has no record of this session.
        let (revived, _revived_events) =
            make_builder(backend, tuning, "sess-1", Arc::clone(&store));
        revived.restore_from_cache();

        let reconciled = revived.reconciled();
        assert_eq!(reconciled.len(), 2);
        assert_eq!(reconciled[0].provenance, Provenance::User);
        assert!(reconciled[0].id.starts_with("local-"));
    }
}
