//! Session state: the fold of inbound Director frames and explicit local
//! actions into a single [`SessionState`].
//!
//! The reducer is deliberately side-effect free. Timer work it needs done
//! (deferred status clears) comes back to the caller as [`SessionEvent`]
//! directives instead of being scheduled here.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use director_proto::{FrameBody, ServerFrame, SlidePayload, StatusKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub mod api;

/// How far a session has progressed. Monotonic from the client's point of
/// view except on explicit reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Starting,
    Planning,
    Outlining,
    PreviewReady,
    Refining,
    Complete,
}

impl Stage {
    pub const fn ordinal(self) -> u8 {
        match self {
            Stage::Starting => 1,
            Stage::Planning => 2,
            Stage::Outlining => 3,
            Stage::PreviewReady => 4,
            Stage::Refining => 5,
            Stage::Complete => 6,
        }
    }

    pub const fn from_ordinal(ordinal: u8) -> Option<Self> {
        match ordinal {
            1 => Some(Stage::Starting),
            2 => Some(Stage::Planning),
            3 => Some(Stage::Outlining),
            4 => Some(Stage::PreviewReady),
            5 => Some(Stage::Refining),
            6 => Some(Stage::Complete),
            _ => None,
        }
    }
}

/// Which of the two parallel artifact versions is the display target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactVersion {
    Strawman,
    Final,
}

impl ArtifactVersion {
    pub const fn as_str(self) -> &'static str {
        match self {
            ArtifactVersion::Strawman => "strawman",
            ArtifactVersion::Final => "final",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "strawman" => Some(ArtifactVersion::Strawman),
            "final" => Some(ArtifactVersion::Final),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub url: String,
    #[serde(default)]
    pub presentation_id: Option<String>,
    #[serde(default)]
    pub slide_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusNote {
    pub kind: StatusKind,
    #[serde(default)]
    pub text: Option<String>,
}

/// Locally authored text, synthesized before (and independent of) any echo
/// the Director may stream back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessage {
    pub message_id: String,
    pub text: String,
    pub sent_at: DateTime<Utc>,
}

impl UserMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            message_id: director_proto::local_message_id(),
            text: text.into(),
            sent_at: Utc::now(),
        }
    }
}

/// A streamed frame plus its local receipt stamp. Restored history has no
/// receipt stamp; ordering falls back to the server timestamp there.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub frame: ServerFrame,
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
}

impl StoredMessage {
    pub fn effective_time(&self) -> Option<DateTime<Utc>> {
        self.received_at.or_else(|| self.frame.server_time())
    }
}

/// Directives emitted by [`SessionState::apply`] for the owner to act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    MessageAppended,
    DuplicateDropped,
    StatusChanged,
    /// A terminal status was set; clear it after the configured linger so
    /// the completion flash does not vanish abruptly.
    ScheduleStatusClear,
    PreviewReady,
    PresentationReady,
    StageChanged(Stage),
}

/// State hints accompanying restored history. Persisted sessions may predate
/// the explicit active-version field, hence the fallback ladder in
/// [`resolve_active_version`].
#[derive(Debug, Clone, Default)]
pub struct RestoreHints {
    pub active_version: Option<ArtifactVersion>,
    pub stage: Option<Stage>,
    pub strawman: Option<ArtifactRef>,
    pub final_artifact: Option<ArtifactRef>,
    pub slide_structure: Option<Value>,
}

#[derive(Debug)]
pub struct SessionState {
    session_id: String,
    stage: Stage,
    messages: Vec<StoredMessage>,
    seen_ids: HashSet<String>,
    strawman: Option<ArtifactRef>,
    final_artifact: Option<ArtifactRef>,
    active_version: Option<ArtifactVersion>,
    slide_structure: Option<Value>,
    current_status: Option<StatusNote>,
}

impl SessionState {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            stage: Stage::Starting,
            messages: Vec::new(),
            seen_ids: HashSet::new(),
            strawman: None,
            final_artifact: None,
            active_version: None,
            slide_structure: None,
            current_status: None,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn messages(&self) -> &[StoredMessage] {
        &self.messages
    }

    pub fn strawman(&self) -> Option<&ArtifactRef> {
        self.strawman.as_ref()
    }

    pub fn final_artifact(&self) -> Option<&ArtifactRef> {
        self.final_artifact.as_ref()
    }

    pub fn active_version(&self) -> Option<ArtifactVersion> {
        self.active_version
    }

    pub fn active_artifact(&self) -> Option<&ArtifactRef> {
        match self.active_version? {
            ArtifactVersion::Strawman => self.strawman.as_ref(),
            ArtifactVersion::Final => self.final_artifact.as_ref(),
        }
    }

    pub fn presentation_url(&self) -> Option<&str> {
        self.active_artifact().map(|artifact| artifact.url.as_str())
    }

    pub fn slide_structure(&self) -> Option<&Value> {
        self.slide_structure.as_ref()
    }

    pub fn current_status(&self) -> Option<&StatusNote> {
        self.current_status.as_ref()
    }

    /// Fold one inbound frame into the state.
    pub fn apply(
        &mut self,
        frame: ServerFrame,
        received_at: DateTime<Utc>,
    ) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        match &frame.body {
            FrameBody::StatusUpdate(status) => {
                // Transient only; never part of the visible message list.
                let terminal = status.status.is_terminal();
                self.current_status = Some(StatusNote {
                    kind: status.status,
                    text: status.text.clone(),
                });
                events.push(SessionEvent::StatusChanged);
                if terminal {
                    events.push(SessionEvent::ScheduleStatusClear);
                }
            }
            FrameBody::PresentationUrl(payload) => {
                self.final_artifact = Some(ArtifactRef {
                    url: payload.url.clone(),
                    presentation_id: payload.presentation_id.clone(),
                    slide_count: payload.slide_count,
                });
                self.active_version = Some(ArtifactVersion::Final);
                if self.current_status.take().is_some() {
                    events.push(SessionEvent::StatusChanged);
                }
                self.advance_stage(Stage::Complete, &mut events);
                events.push(SessionEvent::PresentationReady);
                self.record_message(frame, received_at, &mut events);
            }
            FrameBody::SlideUpdate(payload) => {
                if let Some(structure) = &payload.slide_structure {
                    self.slide_structure = Some(structure.clone());
                }
                if let Some(preview) = discover_preview(payload) {
                    self.strawman = Some(preview);
                    if self.final_artifact.is_none() {
                        self.active_version = Some(ArtifactVersion::Strawman);
                        if self.current_status.take().is_some() {
                            events.push(SessionEvent::StatusChanged);
                        }
                        self.advance_stage(Stage::PreviewReady, &mut events);
                        events.push(SessionEvent::PreviewReady);
                    } else {
                        // Final always wins: a late strawman refresh never
                        // demotes an already-final session.
                        debug!("strawman preview arrived after final artifact; keeping final active");
                    }
                }
                self.record_message(frame, received_at, &mut events);
            }
            FrameBody::ChatMessage(_) | FrameBody::ActionRequest(_) => {
                self.record_message(frame, received_at, &mut events);
            }
        }
        events
    }

    /// Deferred clear for a lingering terminal status. Returns whether
    /// anything changed; a newer in-progress status is left untouched.
    pub fn clear_terminal_status(&mut self) -> bool {
        match &self.current_status {
            Some(note) if note.kind.is_terminal() => {
                self.current_status = None;
                true
            }
            _ => false,
        }
    }

    /// Pure local action: activate the requested artifact when it exists.
    /// Requesting an absent artifact is a no-op, not an error.
    pub fn switch_version(&mut self, target: ArtifactVersion) -> bool {
        let exists = match target {
            ArtifactVersion::Strawman => self.strawman.is_some(),
            ArtifactVersion::Final => self.final_artifact.is_some(),
        };
        if !exists {
            debug!(target = target.as_str(), "version switch ignored: artifact absent");
            return false;
        }
        self.active_version = Some(target);
        true
    }

    /// Load persisted history plus state hints, resolving the active version
    /// through the documented fallback ladder.
    pub fn restore(&mut self, history: Vec<StoredMessage>, hints: RestoreHints) {
        self.messages.clear();
        self.seen_ids.clear();
        for message in history {
            if self.seen_ids.insert(message.frame.message_id.clone()) {
                self.messages.push(message);
            }
        }
        self.strawman = hints.strawman;
        self.final_artifact = hints.final_artifact;
        self.slide_structure = hints.slide_structure;
        if let Some(stage) = hints.stage {
            self.stage = stage;
        }
        self.active_version = resolve_active_version(
            hints.active_version,
            hints.stage,
            self.strawman.is_some(),
            self.final_artifact.is_some(),
        );
    }

    /// Explicit session reset, the one non-monotonic stage path.
    pub fn reset(&mut self, session_id: impl Into<String>) {
        *self = SessionState::new(session_id);
    }

    fn record_message(
        &mut self,
        frame: ServerFrame,
        received_at: DateTime<Utc>,
        events: &mut Vec<SessionEvent>,
    ) {
        if !self.seen_ids.insert(frame.message_id.clone()) {
            debug!(message_id = %frame.message_id, "dropping duplicate frame");
            events.push(SessionEvent::DuplicateDropped);
            return;
        }
        self.messages.push(StoredMessage {
            frame,
            received_at: Some(received_at),
        });
        events.push(SessionEvent::MessageAppended);
    }

    fn advance_stage(&mut self, target: Stage, events: &mut Vec<SessionEvent>) {
        if target > self.stage {
            self.stage = target;
            events.push(SessionEvent::StageChanged(target));
        }
    }
}

/// Active-version fallback ladder for restored sessions: explicit hint,
/// stage inference, final-over-strawman, then whichever single URL exists.
fn resolve_active_version(
    hint: Option<ArtifactVersion>,
    stage: Option<Stage>,
    has_strawman: bool,
    has_final: bool,
) -> Option<ArtifactVersion> {
    if let Some(explicit) = hint {
        return Some(explicit);
    }
    match stage {
        Some(Stage::PreviewReady) if has_strawman => return Some(ArtifactVersion::Strawman),
        Some(Stage::Complete) if has_final => return Some(ArtifactVersion::Final),
        _ => {}
    }
    match (has_strawman, has_final) {
        (_, true) => Some(ArtifactVersion::Final),
        (true, false) => Some(ArtifactVersion::Strawman),
        (false, false) => None,
    }
}

/// One historical home of the strawman preview URL, probed in order.
type PreviewExtractor = fn(&SlidePayload) -> Option<ArtifactRef>;

const PREVIEW_SOURCES: &[PreviewExtractor] = &[
    preview_from_metadata,
    preview_from_strawman_block,
    preview_from_root,
];

fn discover_preview(payload: &SlidePayload) -> Option<ArtifactRef> {
    PREVIEW_SOURCES
        .iter()
        .find_map(|extract| extract(payload))
}

fn preview_from_metadata(payload: &SlidePayload) -> Option<ArtifactRef> {
    let metadata = payload.metadata.as_ref()?;
    let url = metadata.preview_url.clone()?;
    Some(ArtifactRef {
        url,
        presentation_id: metadata.presentation_id.clone(),
        slide_count: metadata.slide_count,
    })
}

fn preview_from_strawman_block(payload: &SlidePayload) -> Option<ArtifactRef> {
    let block = payload.strawman.as_ref()?;
    let url = block.url.clone()?;
    Some(ArtifactRef {
        url,
        presentation_id: block.presentation_id.clone(),
        slide_count: block.slide_count,
    })
}

fn preview_from_root(payload: &SlidePayload) -> Option<ArtifactRef> {
    let url = payload.preview_url.clone()?;
    Some(ArtifactRef {
        url,
        presentation_id: payload.presentation_id.clone(),
        slide_count: payload.slide_count,
    })
}
