use std::future::Future;
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::{FallbackError, LookupError, TransportError};
use crate::event::CompletePayload;
use crate::message::{AttachmentRef, ConversationId};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Raw units as delivered by the transport; boundaries carry no meaning.
pub type UnitStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

/// Logical payload of one send, shared by the streaming and fallback requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    pub conversation_id: ConversationId,
    pub coach_id: String,
    pub user_id: String,
    pub user_message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<AttachmentRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TermRequest {
    pub term: String,
    pub conversation_id: ConversationId,
    pub coach_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TermExplanation {
    #[serde(default)]
    pub term: String,
    #[serde(alias = "definition")]
    pub explanation: String,
}

/// Opens the chunked event stream for one send.
pub trait StreamTransport: Send + Sync {
    fn open_stream<'a>(
        &'a self,
        payload: &'a MessagePayload,
    ) -> BoxFuture<'a, Result<UnitStream, TransportError>>;
}

/// Non-streaming equivalent of [`StreamTransport`], answered with one `complete` payload.
pub trait FallbackClient: Send + Sync {
    fn send_message<'a>(
        &'a self,
        payload: &'a MessagePayload,
    ) -> BoxFuture<'a, Result<CompletePayload, FallbackError>>;
}

pub trait TermLookup: Send + Sync {
    fn explain<'a>(
        &'a self,
        request: &'a TermRequest,
    ) -> BoxFuture<'a, Result<TermExplanation, LookupError>>;
}
