//! HTTP client for the remote session store. The engine only consumes this
//! interface; the store itself lives elsewhere.
//!
//! All calls go through the [`SessionBackend`] seam so tests can swap the
//! reqwest implementation for an in-memory one.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use director_proto::FrameBody;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::{ArtifactRef, RestoreHints, Stage, StoredMessage, UserMessage};

/// Message-type discriminant for locally authored records.
pub const USER_MESSAGE_TYPE: &str = "user";

#[derive(Debug, Error)]
pub enum SessionApiError {
    #[error("invalid session api configuration: {0}")]
    InvalidConfig(String),
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected http status {0}")]
    HttpStatus(StatusCode),
    /// The session was soft-deleted; callers start a fresh one.
    #[error("session deleted")]
    Gone,
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

/// Normalized record for the batched message upsert endpoint. Also the shape
/// the persistence queue holds while entries wait to flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageUpsert {
    pub id: String,
    pub message_type: String,
    pub timestamp: DateTime<Utc>,
    pub payload: Value,
    #[serde(default)]
    pub user_text: Option<String>,
}

impl MessageUpsert {
    pub fn from_stored(message: &StoredMessage) -> Self {
        let frame = &message.frame;
        let payload = match &frame.body {
            FrameBody::ChatMessage(p) => serde_json::to_value(p),
            FrameBody::ActionRequest(p) => serde_json::to_value(p),
            FrameBody::SlideUpdate(p) => serde_json::to_value(p),
            FrameBody::PresentationUrl(p) => serde_json::to_value(p),
            FrameBody::StatusUpdate(p) => serde_json::to_value(p),
        }
        .unwrap_or(Value::Null);
        Self {
            id: frame.message_id.clone(),
            message_type: frame.kind().as_str().to_string(),
            timestamp: message.effective_time().unwrap_or_else(Utc::now),
            payload,
            user_text: None,
        }
    }

    pub fn from_user(message: &UserMessage) -> Self {
        Self {
            id: message.message_id.clone(),
            message_type: USER_MESSAGE_TYPE.to_string(),
            timestamp: message.sent_at,
            payload: json!({ "text": message.text }),
            user_text: Some(message.text.clone()),
        }
    }

    pub fn is_user(&self) -> bool {
        self.message_type == USER_MESSAGE_TYPE
    }

    /// Rebuild the wire frame for a persisted server message. `None` for
    /// user records and for payloads that no longer decode.
    pub fn to_stored(&self, session_id: &str) -> Option<StoredMessage> {
        if self.is_user() {
            return None;
        }
        let raw = json!({
            "message_id": self.id,
            "session_id": session_id,
            "timestamp": self.timestamp.to_rfc3339(),
            "type": self.message_type,
            "payload": self.payload,
        });
        match serde_json::from_value(raw) {
            Ok(frame) => Some(StoredMessage {
                frame,
                received_at: None,
            }),
            Err(err) => {
                debug!(id = %self.id, error = %err, "skipping undecodable persisted message");
                None
            }
        }
    }

    pub fn to_user_message(&self) -> Option<UserMessage> {
        if !self.is_user() {
            return None;
        }
        let text = self
            .user_text
            .clone()
            .or_else(|| {
                self.payload
                    .get("text")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })?;
        Some(UserMessage {
            message_id: self.id.clone(),
            text,
            sent_at: self.timestamp,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CreateSessionRequest {
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// Session-level fields for the PATCH endpoint. Bypasses the message
/// dedup/debounce path entirely.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionMetadataUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub strawman: Option<ArtifactRef>,
    #[serde(rename = "final", skip_serializing_if = "Option::is_none")]
    pub final_artifact: Option<ArtifactRef>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub stage: Option<u8>,
    #[serde(default)]
    pub active_version: Option<String>,
    #[serde(default)]
    pub strawman: Option<ArtifactRef>,
    #[serde(default, rename = "final")]
    pub final_artifact: Option<ArtifactRef>,
    #[serde(default)]
    pub slide_structure: Option<Value>,
    #[serde(default)]
    pub messages: Vec<MessageUpsert>,
}

impl SessionRecord {
    pub fn restore_hints(&self) -> RestoreHints {
        RestoreHints {
            active_version: self
                .active_version
                .as_deref()
                .and_then(super::ArtifactVersion::parse),
            stage: self.stage.and_then(Stage::from_ordinal),
            strawman: self.strawman.clone(),
            final_artifact: self.final_artifact.clone(),
            slide_structure: self.slide_structure.clone(),
        }
    }

    pub fn history(&self) -> Vec<StoredMessage> {
        self.messages
            .iter()
            .filter_map(|record| record.to_stored(&self.session_id))
            .collect()
    }

    pub fn user_history(&self) -> Vec<UserMessage> {
        self.messages
            .iter()
            .filter_map(MessageUpsert::to_user_message)
            .collect()
    }
}

#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn create_session(
        &self,
        base_url: &Url,
        request: &CreateSessionRequest,
    ) -> Result<SessionRecord, SessionApiError>;

    async fn fetch_session(
        &self,
        base_url: &Url,
        session_id: &str,
    ) -> Result<SessionRecord, SessionApiError>;

    async fn update_metadata(
        &self,
        base_url: &Url,
        session_id: &str,
        patch: &SessionMetadataUpdate,
    ) -> Result<(), SessionApiError>;

    async fn soft_delete(&self, base_url: &Url, session_id: &str)
        -> Result<(), SessionApiError>;

    async fn push_messages(
        &self,
        base_url: &Url,
        session_id: &str,
        batch: &[MessageUpsert],
    ) -> Result<(), SessionApiError>;
}

#[derive(Clone)]
pub struct SessionApi {
    base_url: Arc<Url>,
    backend: Arc<dyn SessionBackend>,
}

impl SessionApi {
    pub fn new(api_base_url: impl AsRef<str>) -> Result<Self, SessionApiError> {
        let backend = Arc::new(ReqwestSessionBackend::new()?);
        Self::with_backend(api_base_url, backend)
    }

    /// Construct with an explicit backend. Production callers use [`new`];
    /// tests inject in-memory backends here.
    pub fn with_backend(
        api_base_url: impl AsRef<str>,
        backend: Arc<dyn SessionBackend>,
    ) -> Result<Self, SessionApiError> {
        let mut base = api_base_url.as_ref().trim().to_string();
        if base.is_empty() {
            return Err(SessionApiError::InvalidConfig(
                "session api base url cannot be empty".into(),
            ));
        }
        if !base.starts_with("http://") && !base.starts_with("https://") {
            base = format!("http://{base}");
        }
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|err| SessionApiError::InvalidConfig(format!("invalid api url: {err}")))?;
        Ok(Self {
            base_url: Arc::new(base_url),
            backend,
        })
    }

    pub async fn create_session(
        &self,
        request: &CreateSessionRequest,
    ) -> Result<SessionRecord, SessionApiError> {
        self.backend.create_session(&self.base_url, request).await
    }

    pub async fn fetch_session(
        &self,
        session_id: &str,
    ) -> Result<SessionRecord, SessionApiError> {
        self.backend.fetch_session(&self.base_url, session_id).await
    }

    pub async fn update_metadata(
        &self,
        session_id: &str,
        patch: &SessionMetadataUpdate,
    ) -> Result<(), SessionApiError> {
        self.backend
            .update_metadata(&self.base_url, session_id, patch)
            .await
    }

    pub async fn soft_delete(&self, session_id: &str) -> Result<(), SessionApiError> {
        self.backend.soft_delete(&self.base_url, session_id).await
    }

    pub async fn push_messages(
        &self,
        session_id: &str,
        batch: &[MessageUpsert],
    ) -> Result<(), SessionApiError> {
        self.backend
            .push_messages(&self.base_url, session_id, batch)
            .await
    }

    /// Best-effort fire-and-forget push for teardown paths. Delivery is not
    /// guaranteed; failures are logged and swallowed.
    pub fn beacon_push(&self, session_id: &str, batch: Vec<MessageUpsert>) {
        if batch.is_empty() {
            return;
        }
        let backend = Arc::clone(&self.backend);
        let base_url = Arc::clone(&self.base_url);
        let session_id = session_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = backend.push_messages(&base_url, &session_id, &batch).await {
                debug!(error = %err, "unload beacon push failed");
            }
        });
    }
}

struct ReqwestSessionBackend {
    client: reqwest::Client,
}

impl ReqwestSessionBackend {
    fn new() -> Result<Self, SessionApiError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(8))
            .no_proxy()
            .build()?;
        Ok(Self { client })
    }

    fn endpoint(base_url: &Url, path: &str) -> Result<Url, SessionApiError> {
        base_url
            .join(path)
            .map_err(|err| SessionApiError::InvalidConfig(format!("invalid endpoint {path}: {err}")))
    }
}

#[async_trait]
impl SessionBackend for ReqwestSessionBackend {
    async fn create_session(
        &self,
        base_url: &Url,
        request: &CreateSessionRequest,
    ) -> Result<SessionRecord, SessionApiError> {
        let endpoint = Self::endpoint(base_url, "sessions")?;
        let response = self.client.post(endpoint).json(request).send().await?;
        if !response.status().is_success() {
            return Err(SessionApiError::HttpStatus(response.status()));
        }
        Ok(response.json::<SessionRecord>().await?)
    }

    async fn fetch_session(
        &self,
        base_url: &Url,
        session_id: &str,
    ) -> Result<SessionRecord, SessionApiError> {
        let endpoint = Self::endpoint(base_url, &format!("sessions/{session_id}"))?;
        let response = self.client.get(endpoint).send().await?;
        if response.status() == StatusCode::GONE {
            return Err(SessionApiError::Gone);
        }
        if !response.status().is_success() {
            return Err(SessionApiError::HttpStatus(response.status()));
        }
        Ok(response.json::<SessionRecord>().await?)
    }

    async fn update_metadata(
        &self,
        base_url: &Url,
        session_id: &str,
        patch: &SessionMetadataUpdate,
    ) -> Result<(), SessionApiError> {
        let endpoint = Self::endpoint(base_url, &format!("sessions/{session_id}"))?;
        let response = self.client.patch(endpoint).json(patch).send().await?;
        if !response.status().is_success() {
            return Err(SessionApiError::HttpStatus(response.status()));
        }
        Ok(())
    }

    async fn soft_delete(
        &self,
        base_url: &Url,
        session_id: &str,
    ) -> Result<(), SessionApiError> {
        let endpoint = Self::endpoint(base_url, &format!("sessions/{session_id}"))?;
        let response = self.client.delete(endpoint).send().await?;
        if !response.status().is_success() {
            return Err(SessionApiError::HttpStatus(response.status()));
        }
        Ok(())
    }

    async fn push_messages(
        &self,
        base_url: &Url,
        session_id: &str,
        batch: &[MessageUpsert],
    ) -> Result<(), SessionApiError> {
        let endpoint = Self::endpoint(base_url, &format!("sessions/{session_id}/messages"))?;
        let response = self
            .client
            .post(endpoint)
            .json(&json!({ "messages": batch }))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(SessionApiError::HttpStatus(response.status()));
        }
        Ok(())
    }
}
