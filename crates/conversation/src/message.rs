use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Free-form message metadata (mode, badges, classification, ...).
pub type Metadata = Map<String, Value>;

/// Text shown in place of an assistant reply when neither the stream nor the
/// fallback exchange produced one.
pub const FALLBACK_FAILURE_TEXT: &str =
    "Sorry, I couldn't get a response from your coach. Please try sending your message again.";

/// Stable identifier for one message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new_v7() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}", self.0)
    }
}

/// Backend-issued conversation identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into().trim().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Opaque reference to an uploaded attachment (image key, file URL, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttachmentRef(String);

impl AttachmentRef {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Chat speaker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// Lifecycle status for one message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageStatus {
    /// The in-flight placeholder; the only status that may still change.
    Streaming,
    Done,
    Error(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub role: Role,
    pub content: String,
    pub timestamp_unix_ms: u64,
    pub attachments: Vec<AttachmentRef>,
    pub metadata: Metadata,
    pub status: MessageStatus,
}

impl Message {
    /// Creates a finished user message.
    pub fn user(content: impl Into<String>, attachments: Vec<AttachmentRef>) -> Self {
        Self {
            id: MessageId::new_v7(),
            role: Role::User,
            content: content.into(),
            timestamp_unix_ms: unix_millis_now(),
            attachments,
            metadata: Metadata::new(),
            status: MessageStatus::Done,
        }
    }

    /// Creates an empty assistant placeholder with metadata seeded from the mode.
    pub fn assistant_placeholder(mode: &ConversationMode) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert("mode".to_string(), Value::String(mode.as_str().to_string()));

        Self {
            id: MessageId::new_v7(),
            role: Role::Assistant,
            content: String::new(),
            timestamp_unix_ms: unix_millis_now(),
            attachments: Vec::new(),
            metadata,
            status: MessageStatus::Streaming,
        }
    }

    /// Creates the locally synthesized reply shown when delivery failed outright.
    pub fn assistant_error(reason: impl Into<String>) -> Self {
        let mut metadata = Metadata::new();
        metadata.insert("error".to_string(), Value::Bool(true));

        Self {
            id: MessageId::new_v7(),
            role: Role::Assistant,
            content: FALLBACK_FAILURE_TEXT.to_string(),
            timestamp_unix_ms: unix_millis_now(),
            attachments: Vec::new(),
            metadata,
            status: MessageStatus::Error(reason.into()),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        matches!(self.status, MessageStatus::Streaming)
    }

    pub fn is_error(&self) -> bool {
        matches!(self.status, MessageStatus::Error(_))
    }
}

/// How the backend treats the conversation; selects placeholder seeding and badges.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum ConversationMode {
    #[default]
    Chat,
    /// Structured program/workout building.
    Build,
    Other(String),
}

impl ConversationMode {
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        if trimmed.eq_ignore_ascii_case("chat") || trimmed.eq_ignore_ascii_case("standard") {
            Self::Chat
        } else if trimmed.eq_ignore_ascii_case("build") {
            Self::Build
        } else if trimmed.is_empty() {
            Self::default()
        } else {
            Self::Other(trimmed.to_string())
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Chat => "chat",
            Self::Build => "build",
            Self::Other(raw) => raw,
        }
    }
}

impl Serialize for ConversationMode {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ConversationMode {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        Ok(Self::parse(&value))
    }
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Conversation {
    pub id: ConversationId,
    pub mode: ConversationMode,
    /// Auxiliary backend session, e.g. the workout-creator state.
    pub session: Option<Value>,
    pub size: Option<u64>,
}

impl Conversation {
    pub fn new(id: ConversationId, mode: ConversationMode) -> Self {
        Self {
            id,
            mode,
            session: None,
            size: None,
        }
    }

    pub fn apply_patch(&mut self, patch: &ConversationPatch) {
        if let Some(id) = &patch.id
            && !id.is_empty()
        {
            self.id = id.clone();
        }
        if let Some(mode) = &patch.mode {
            self.mode = mode.clone();
        }
        if let Some(size) = patch.size {
            self.size = Some(size);
        }
        // `Some(None)` is an explicit reset sent by the backend as `null`.
        if let Some(session) = &patch.session {
            self.session = session.clone();
        }
    }
}

/// Conversation fields carried by a terminal event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ConversationPatch {
    pub id: Option<ConversationId>,
    pub mode: Option<ConversationMode>,
    pub size: Option<u64>,
    pub session: Option<Option<Value>>,
}

impl ConversationPatch {
    pub fn is_empty(&self) -> bool {
        self.id.is_none() && self.mode.is_none() && self.size.is_none() && self.session.is_none()
    }
}

pub(crate) fn unix_millis_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn mode_parsing_is_lenient_and_round_trips_unknown_values() {
        assert_eq!(ConversationMode::parse(" BUILD "), ConversationMode::Build);
        assert_eq!(ConversationMode::parse("standard"), ConversationMode::Chat);
        assert_eq!(ConversationMode::parse(""), ConversationMode::Chat);
        assert_eq!(
            ConversationMode::parse("program-design"),
            ConversationMode::Other("program-design".to_string())
        );

        let encoded = serde_json::to_value(ConversationMode::Build).expect("serialize mode");
        assert_eq!(encoded, json!("build"));
    }

    #[test]
    fn placeholder_is_seeded_with_mode() {
        let placeholder = Message::assistant_placeholder(&ConversationMode::Build);

        assert!(placeholder.is_placeholder());
        assert!(placeholder.content.is_empty());
        assert_eq!(placeholder.metadata.get("mode"), Some(&json!("build")));
    }

    #[test]
    fn patch_distinguishes_missing_session_from_explicit_null() {
        let mut conversation =
            Conversation::new(ConversationId::new("c-1"), ConversationMode::Build);
        conversation.session = Some(json!({"step": 2}));

        conversation.apply_patch(&ConversationPatch {
            size: Some(4),
            ..ConversationPatch::default()
        });
        assert_eq!(conversation.session, Some(json!({"step": 2})));
        assert_eq!(conversation.size, Some(4));

        conversation.apply_patch(&ConversationPatch {
            session: Some(None),
            mode: Some(ConversationMode::Chat),
            ..ConversationPatch::default()
        });
        assert_eq!(conversation.session, None);
        assert_eq!(conversation.mode, ConversationMode::Chat);
        assert_eq!(conversation.id.as_str(), "c-1");
    }
}
