use snafu::Snafu;

use crate::message::MessageId;
use crate::phase::PhaseRejection;

/// One transport unit could not be turned into a stream event.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum DecodeError {
    #[snafu(display("stream line is not valid UTF-8 on `{stage}`"))]
    InvalidUtf8 { stage: &'static str },
    #[snafu(display("stream line is not valid JSON on `{stage}`: {details} (near `{excerpt}`)"))]
    MalformedJson {
        stage: &'static str,
        details: String,
        excerpt: String,
    },
    #[snafu(display("stream unit has no string `type` discriminant on `{stage}` (near `{excerpt}`)"))]
    MissingDiscriminant {
        stage: &'static str,
        excerpt: String,
    },
    #[snafu(display("stream unit of type '{kind}' is invalid on `{stage}`: {details}"))]
    InvalidFields {
        stage: &'static str,
        kind: String,
        details: String,
    },
}

/// The event stream could not deliver a terminal event.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("failed to open event stream on `{stage}`: {message}"))]
    OpenStream { stage: &'static str, message: String },
    #[snafu(display("event stream returned status {status} on `{stage}`: {body}"))]
    StreamStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("event stream read failed on `{stage}`: {message}"))]
    ReadStream { stage: &'static str, message: String },
    #[snafu(display("event stream closed before a terminal event on `{stage}`"))]
    ClosedEarly { stage: &'static str },
}

/// The one-shot non-streaming exchange failed.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum FallbackError {
    #[snafu(display("fallback request failed on `{stage}`: {message}"))]
    FallbackRequest { stage: &'static str, message: String },
    #[snafu(display("fallback request returned status {status} on `{stage}`: {body}"))]
    FallbackStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("fallback response could not be parsed on `{stage}`: {details}"))]
    FallbackResponse { stage: &'static str, details: String },
}

/// Side-channel term lookup failure.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LookupError {
    #[snafu(display("term lookup needs a non-empty term"))]
    EmptyTerm { stage: &'static str },
    #[snafu(display("no term lookup client is configured"))]
    LookupUnavailable { stage: &'static str },
    #[snafu(display("term lookup failed on `{stage}`: {message}"))]
    LookupRequest { stage: &'static str, message: String },
    #[snafu(display("term lookup returned status {status} on `{stage}`: {body}"))]
    LookupStatus {
        stage: &'static str,
        status: u16,
        body: String,
    },
    #[snafu(display("term lookup response could not be parsed on `{stage}`: {details}"))]
    LookupResponse { stage: &'static str, details: String },
}

/// Rejected placeholder lifecycle operation.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum LifecycleError {
    #[snafu(display("a send is already in flight with placeholder {active}"))]
    Busy {
        stage: &'static str,
        active: MessageId,
    },
    #[snafu(display("send phase transition rejected on `{stage}`: {rejection:?}"))]
    Transition {
        stage: &'static str,
        rejection: PhaseRejection,
    },
}

/// Failures that escape [`crate::ConversationAgent::send_message`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SendError {
    #[snafu(display("cannot send without a conversation id"))]
    MissingConversationId { stage: &'static str },
    #[snafu(display("cannot send an empty message"))]
    EmptyMessage { stage: &'static str },
    #[snafu(display("send rejected on `{stage}`: {source}"))]
    Lifecycle {
        stage: &'static str,
        source: LifecycleError,
    },
    #[snafu(display("message could not be delivered, fallback failed on `{stage}`: {source}"))]
    Fallback {
        stage: &'static str,
        /// Id of the synthesized error message appended to the conversation.
        error_message_id: MessageId,
        source: FallbackError,
    },
}

impl SendError {
    /// True when the send was refused because another one is still in flight.
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            Self::Lifecycle {
                source: LifecycleError::Busy { .. },
                ..
            }
        )
    }
}
