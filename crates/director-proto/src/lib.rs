//! Wire definitions for client ↔ Director communication: frame envelopes,
//! payload shapes, heartbeat sentinels, and timestamp normalization. Lives
//! apart from the engine so server-side tooling can speak the protocol
//! without dragging in the sync runtime.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

pub const PROTOCOL_VERSION: u8 = 1;

/// Heartbeat sentinel sent by the client as a bare text frame.
pub const PING_FRAME: &str = "ping";
/// Heartbeat acknowledgement sent by the Director as a bare text frame.
pub const PONG_FRAME: &str = "pong";

/// Envelope for every application frame streamed by the Director.
///
/// On the wire the body's discriminant and payload appear as sibling
/// `type` / `payload` keys next to the envelope fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerFrame {
    pub message_id: String,
    pub session_id: String,
    /// ISO-8601 stamp issued by the Director. May lack a timezone suffix;
    /// use [`parse_timestamp`] rather than parsing directly.
    pub timestamp: String,
    #[serde(flatten)]
    pub body: FrameBody,
}

impl ServerFrame {
    pub fn kind(&self) -> FrameKind {
        self.body.kind()
    }

    /// Server-issued timestamp normalized to UTC, when parseable.
    pub fn server_time(&self) -> Option<DateTime<Utc>> {
        parse_timestamp(&self.timestamp)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum FrameBody {
    ChatMessage(ChatPayload),
    ActionRequest(ActionPayload),
    SlideUpdate(SlidePayload),
    PresentationUrl(PresentationPayload),
    StatusUpdate(StatusPayload),
}

impl FrameBody {
    pub fn kind(&self) -> FrameKind {
        match self {
            FrameBody::ChatMessage(_) => FrameKind::ChatMessage,
            FrameBody::ActionRequest(_) => FrameKind::ActionRequest,
            FrameBody::SlideUpdate(_) => FrameKind::SlideUpdate,
            FrameBody::PresentationUrl(_) => FrameKind::PresentationUrl,
            FrameBody::StatusUpdate(_) => FrameKind::StatusUpdate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    ChatMessage,
    ActionRequest,
    SlideUpdate,
    PresentationUrl,
    StatusUpdate,
}

impl FrameKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            FrameKind::ChatMessage => "chat_message",
            FrameKind::ActionRequest => "action_request",
            FrameKind::SlideUpdate => "slide_update",
            FrameKind::PresentationUrl => "presentation_url",
            FrameKind::StatusUpdate => "status_update",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatPayload {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub sub_title: Option<String>,
    /// Authoritative authored-by-user marker. Directors that echo user
    /// input back set this; older ones omit it entirely.
    #[serde(default)]
    pub from_user: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ActionPayload {
    #[serde(default)]
    pub prompt_text: String,
    #[serde(default)]
    pub actions: Vec<ActionOption>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionOption {
    pub label: String,
    pub value: String,
    #[serde(default)]
    pub primary: bool,
}

/// Slide-structure updates. The preview URL for the strawman artifact has
/// moved between payload shapes over time, so every historical location is
/// kept optional here and the engine probes them in precedence order.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SlidePayload {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub slide_structure: Option<Value>,
    #[serde(default)]
    pub metadata: Option<SlideMetadata>,
    #[serde(default)]
    pub strawman: Option<StrawmanBlock>,
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub presentation_id: Option<String>,
    #[serde(default)]
    pub slide_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SlideMetadata {
    #[serde(default)]
    pub preview_url: Option<String>,
    #[serde(default)]
    pub presentation_id: Option<String>,
    #[serde(default)]
    pub slide_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StrawmanBlock {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub presentation_id: Option<String>,
    #[serde(default)]
    pub slide_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresentationPayload {
    pub url: String,
    #[serde(default)]
    pub presentation_id: Option<String>,
    #[serde(default)]
    pub slide_count: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPayload {
    pub status: StatusKind,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusKind {
    Thinking,
    Generating,
    Complete,
    Idle,
    #[serde(other)]
    Unknown,
}

impl StatusKind {
    /// Terminal statuses linger briefly client-side, then clear.
    pub const fn is_terminal(self) -> bool {
        matches!(self, StatusKind::Complete | StatusKind::Idle)
    }
}

/// Application frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    UserMessage { data: UserMessageData },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserMessageData {
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u32>,
}

impl UserMessageData {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            store_name: None,
            file_count: None,
        }
    }
}

/// Id for a message authored client-side, before the Director has had a
/// chance to assign one. The `local-` prefix distinguishes these from
/// server-issued ids in persisted history.
pub fn local_message_id() -> String {
    format!("local-{}", Uuid::new_v4())
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame codec error: {0}")]
    Json(#[from] serde_json::Error),
}

pub fn encode_client_frame(frame: &ClientFrame) -> Result<String, FrameError> {
    serde_json::to_string(frame).map_err(FrameError::from)
}

pub fn decode_server_frame(text: &str) -> Result<ServerFrame, FrameError> {
    serde_json::from_str(text).map_err(FrameError::from)
}

pub fn encode_server_frame(frame: &ServerFrame) -> Result<String, FrameError> {
    serde_json::to_string(frame).map_err(FrameError::from)
}

/// Parse a Director timestamp, tolerating a missing timezone suffix.
/// Suffix-less stamps are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(with_tz) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(with_tz.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
