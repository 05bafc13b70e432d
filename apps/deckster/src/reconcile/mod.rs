//! Derives the final, deduplicated, temporally ordered view from the union
//! of locally authored messages and the server-streamed list — which may
//! echo user input back under fresh ids.
//!
//! Classification and greeting detection are ordered predicate chains; each
//! rule is independently testable and the first match wins.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use director_proto::{FrameBody, FrameKind, ServerFrame};
use tracing::debug;

use crate::session::{StoredMessage, UserMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provenance {
    User,
    Agent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DisplayBody {
    User { text: String },
    Agent(FrameBody),
}

#[derive(Debug, Clone, PartialEq)]
pub struct DisplayMessage {
    pub id: String,
    pub provenance: Provenance,
    pub timestamp: DateTime<Utc>,
    pub body: DisplayBody,
}

impl DisplayMessage {
    /// Text used for content-based matching. Only user entries and agent
    /// chat messages participate; structural frames never content-match.
    fn content(&self) -> Option<&str> {
        match &self.body {
            DisplayBody::User { text } => Some(text),
            DisplayBody::Agent(FrameBody::ChatMessage(chat)) => Some(&chat.text),
            DisplayBody::Agent(_) => None,
        }
    }

    fn frame_kind(&self) -> Option<FrameKind> {
        match &self.body {
            DisplayBody::Agent(body) => Some(body.kind()),
            DisplayBody::User { .. } => None,
        }
    }
}

/// Composite unit handed to rendering. Grouping is structural only; the
/// underlying ordered list used for persistence and replay is untouched.
#[derive(Debug, Clone, PartialEq)]
pub enum DisplayUnit {
    Single(DisplayMessage),
    Combined {
        slide: DisplayMessage,
        presentation: DisplayMessage,
        action: Option<DisplayMessage>,
    },
}

#[derive(Debug, Default)]
pub struct MessageReconciler {
    known_user_ids: HashSet<String>,
    content_to_local_id: HashMap<String, String>,
    welcome_id: Option<String>,
}

impl MessageReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register locally authored text so future echoes classify as user.
    pub fn note_local_message(&mut self, message: &UserMessage) {
        self.known_user_ids.insert(message.message_id.clone());
        self.content_to_local_id
            .insert(normalize_content(&message.text), message.message_id.clone());
    }

    /// Classification rules, first match wins:
    /// 1. explicit authored-by-user marker,
    /// 2. id already tracked as a local user message,
    /// 3. normalized content matches locally sent text (registers the id),
    /// 4. otherwise agent.
    pub fn classify(&mut self, frame: &ServerFrame) -> Provenance {
        if let FrameBody::ChatMessage(chat) = &frame.body {
            if chat.from_user == Some(true) {
                self.known_user_ids.insert(frame.message_id.clone());
                return Provenance::User;
            }
        }
        if self.known_user_ids.contains(&frame.message_id) {
            return Provenance::User;
        }
        if let FrameBody::ChatMessage(chat) = &frame.body {
            let normalized = normalize_content(&chat.text);
            if self.content_to_local_id.contains_key(&normalized) {
                self.known_user_ids.insert(frame.message_id.clone());
                return Provenance::User;
            }
        }
        Provenance::Agent
    }

    pub fn reconcile(
        &mut self,
        local: &[UserMessage],
        stream: &[StoredMessage],
    ) -> Vec<DisplayMessage> {
        for message in local {
            self.note_local_message(message);
        }

        let mut entries: Vec<(DisplayMessage, Origin)> = Vec::new();
        let mut by_id: HashMap<String, usize> = HashMap::new();

        for message in local {
            let entry = DisplayMessage {
                id: message.message_id.clone(),
                provenance: Provenance::User,
                // User messages order by their local send time.
                timestamp: message.sent_at,
                body: DisplayBody::User {
                    text: message.text.clone(),
                },
            };
            insert_entry(&mut entries, &mut by_id, entry, Origin::Local);
        }

        for message in stream {
            if matches!(message.frame.body, FrameBody::StatusUpdate(_)) {
                continue;
            }
            let provenance = self.classify(&message.frame);
            // Receipt time wins over the server stamp to dodge clock skew;
            // restored history has only the server stamp.
            let timestamp = message
                .received_at
                .or_else(|| message.frame.server_time())
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let body = match (provenance, &message.frame.body) {
                (Provenance::User, FrameBody::ChatMessage(chat)) => DisplayBody::User {
                    text: chat.text.clone(),
                },
                (_, body) => DisplayBody::Agent(body.clone()),
            };
            let entry = DisplayMessage {
                id: message.frame.message_id.clone(),
                provenance,
                timestamp,
                body,
            };
            insert_entry(&mut entries, &mut by_id, entry, Origin::Stream);
        }

        // Secondary pass: once the authoritative local copy is kept, any
        // streamed entry sharing its normalized content is a redundant echo,
        // whatever the server called it.
        let local_content: HashSet<String> = entries
            .iter()
            .filter(|(_, origin)| *origin == Origin::Local)
            .filter_map(|(entry, _)| entry.content())
            .map(normalize_content)
            .collect();
        entries.retain(|(entry, origin)| {
            let keep = *origin == Origin::Local
                || entry
                    .content()
                    .map(|text| !local_content.contains(&normalize_content(text)))
                    .unwrap_or(true);
            if !keep {
                debug!(id = %entry.id, "dropping server echo of local message");
            }
            keep
        });

        let mut entries: Vec<DisplayMessage> =
            entries.into_iter().map(|(entry, _)| entry).collect();
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));

        let mut result = Vec::with_capacity(entries.len());
        for (index, entry) in entries.into_iter().enumerate() {
            if is_greeting(&entry) {
                match &self.welcome_id {
                    Some(shown) if *shown != entry.id && index != 0 => {
                        debug!(id = %entry.id, "suppressing repeated greeting");
                        continue;
                    }
                    Some(_) => {}
                    None => self.welcome_id = Some(entry.id.clone()),
                }
            }
            result.push(entry);
        }
        result
    }

    /// Collapse strictly adjacent slide-update → presentation-url
    /// (→ optional action-request) runs into one combined unit.
    pub fn group(messages: &[DisplayMessage]) -> Vec<DisplayUnit> {
        let mut units = Vec::new();
        let mut index = 0;
        while index < messages.len() {
            let is_combined_head = messages[index].frame_kind() == Some(FrameKind::SlideUpdate)
                && messages
                    .get(index + 1)
                    .and_then(DisplayMessage::frame_kind)
                    == Some(FrameKind::PresentationUrl);
            if is_combined_head {
                let action = messages
                    .get(index + 2)
                    .filter(|entry| entry.frame_kind() == Some(FrameKind::ActionRequest))
                    .cloned();
                let consumed = if action.is_some() { 3 } else { 2 };
                units.push(DisplayUnit::Combined {
                    slide: messages[index].clone(),
                    presentation: messages[index + 1].clone(),
                    action,
                });
                index += consumed;
            } else {
                units.push(DisplayUnit::Single(messages[index].clone()));
                index += 1;
            }
        }
        units
    }
}

/// Where an entry came from. Local entries are authoritative for content
/// dedup; streamed entries may be echoes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Local,
    Stream,
}

/// Id-level dedup. A user-classified copy beats an agent copy; otherwise the
/// first (locally authored) entry stands.
fn insert_entry(
    entries: &mut Vec<(DisplayMessage, Origin)>,
    by_id: &mut HashMap<String, usize>,
    entry: DisplayMessage,
    origin: Origin,
) {
    match by_id.get(&entry.id) {
        Some(&index) => {
            if entries[index].0.provenance == Provenance::Agent
                && entry.provenance == Provenance::User
            {
                entries[index] = (entry, origin);
            }
        }
        None => {
            by_id.insert(entry.id.clone(), entries.len());
            entries.push((entry, origin));
        }
    }
}

fn normalize_content(text: &str) -> String {
    text.trim().to_lowercase()
}

const GREETING_PREFIXES: &[&str] = &["welcome to deckster", "hi! i'm", "hello! i'm"];

/// Greeting predicates in order: the explicit `sub_title` marker, then a
/// normalized prefix match. Only agent chat messages qualify.
fn is_greeting(entry: &DisplayMessage) -> bool {
    let DisplayBody::Agent(FrameBody::ChatMessage(chat)) = &entry.body else {
        return false;
    };
    if entry.provenance != Provenance::Agent {
        return false;
    }
    if chat.sub_title.as_deref() == Some("welcome") {
        return true;
    }
    let normalized = normalize_content(&chat.text);
    GREETING_PREFIXES
        .iter()
        .any(|prefix| normalized.starts_with(prefix))
}
