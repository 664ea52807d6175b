use std::time::Duration;

use coachstream_conversation::ConversationId;

pub const DEFAULT_STREAM_PATH: &str = "/conversations/{conversation_id}/stream";
pub const DEFAULT_MESSAGE_PATH: &str = "/conversations/{conversation_id}/messages";
pub const DEFAULT_EXPLAIN_PATH: &str = "/terms/explain";

const CONVERSATION_PLACEHOLDER: &str = "{conversation_id}";

/// Endpoint layout and timeouts for the coach backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub base_url: String,
    pub stream_path: String,
    pub message_path: String,
    pub explain_path: String,
    pub connect_timeout: Duration,
    /// Maximum silence between two reads of the event stream.
    pub read_timeout: Duration,
    /// Whole-request budget for the non-streaming calls.
    pub request_timeout: Duration,
}

impl ApiConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim().trim_end_matches('/').to_string(),
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            message_path: DEFAULT_MESSAGE_PATH.to_string(),
            explain_path: DEFAULT_EXPLAIN_PATH.to_string(),
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(60),
            request_timeout: Duration::from_secs(90),
        }
    }

    pub fn stream_url(&self, conversation_id: &ConversationId) -> String {
        self.endpoint(&self.stream_path, conversation_id)
    }

    pub fn message_url(&self, conversation_id: &ConversationId) -> String {
        self.endpoint(&self.message_path, conversation_id)
    }

    pub fn explain_url(&self, conversation_id: &ConversationId) -> String {
        self.endpoint(&self.explain_path, conversation_id)
    }

    fn endpoint(&self, template: &str, conversation_id: &ConversationId) -> String {
        let path = template.replace(CONVERSATION_PLACEHOLDER, conversation_id.as_str());
        if path.starts_with('/') {
            format!("{}{path}", self.base_url)
        } else {
            format!("{}/{path}", self.base_url)
        }
    }
}
