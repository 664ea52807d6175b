use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::message::{ConversationId, ConversationMode, ConversationPatch, Metadata};

/// One classified unit of the assistant event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// Ephemeral progress narration; never part of message content.
    Contextual(ContextualUpdate),
    /// Early partial message metadata.
    Metadata(Metadata),
    /// Ordered content fragment.
    Chunk(String),
    /// Terminal success carrying the authoritative message.
    Complete(CompletePayload),
    /// Non-fatal diagnostic from the backend.
    Error(String),
}

impl StreamEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Contextual(_) => "contextual",
            Self::Metadata(_) => "metadata",
            Self::Chunk(_) => "chunk",
            Self::Complete(_) => "complete",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextualUpdate {
    pub text: String,
    pub stage: Option<String>,
}

impl ContextualUpdate {
    pub fn new(text: impl Into<String>, stage: Option<String>) -> Self {
        Self {
            text: text.into(),
            stage,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiMessage {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Payload of a `complete` unit, and the response shape of the fallback exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletePayload {
    pub ai_message: AiMessage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_size: Option<u64>,
    #[serde(
        default,
        deserialize_with = "deserialize_present",
        skip_serializing_if = "Option::is_none"
    )]
    pub workout_creator_session: Option<Option<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

impl CompletePayload {
    /// Minimal payload carrying only message content.
    pub fn from_content(content: impl Into<String>) -> Self {
        Self {
            ai_message: AiMessage {
                content: content.into(),
                metadata: None,
            },
            conversation_id: None,
            mode: None,
            conversation_size: None,
            workout_creator_session: None,
            metadata: None,
        }
    }

    pub fn content(&self) -> &str {
        &self.ai_message.content
    }

    /// Metadata overlay applied at finalization: top-level `metadata` first, then the
    /// message's own metadata, so the more specific value wins on key collisions.
    pub fn metadata_overlay(&self) -> Metadata {
        let mut overlay = self.metadata.clone().unwrap_or_default();
        if let Some(message_metadata) = &self.ai_message.metadata {
            overlay.extend(message_metadata.clone());
        }
        overlay
    }

    pub fn conversation_patch(&self) -> ConversationPatch {
        ConversationPatch {
            id: self
                .conversation_id
                .as_deref()
                .map(ConversationId::new)
                .filter(|id| !id.is_empty()),
            mode: self.mode.as_deref().map(ConversationMode::parse),
            size: self.conversation_size,
            session: self.workout_creator_session.clone(),
        }
    }
}

// A present `null` must stay distinguishable from a missing field.
fn deserialize_present<'de, D>(deserializer: D) -> Result<Option<Option<Value>>, D::Error>
where
    D: Deserializer<'de>,
{
    Option::<Value>::deserialize(deserializer).map(Some)
}
