#![deny(unsafe_code)]

//! Streaming delivery engine for coach conversations.
//!
//! A send turns into one assistant placeholder that is grown from a typed event
//! stream, finalized from the terminal `complete` event (or a one-shot fallback
//! exchange), or removed on cancellation. Observers follow the conversation through
//! immutable snapshots published by [`ConversationStore`].

pub mod agent;
pub mod cancel;
pub mod decoder;
pub mod error;
/// Wire-level stream events and the terminal `complete` payload.
pub mod event;
pub mod fallback;
/// Messages, conversations and their identifiers.
pub mod message;
pub mod phase;
pub mod store;
/// Contracts for the collaborators that carry bytes to and from the backend.
pub mod transport;

pub use agent::{ConversationAgent, Delivery, Participants, SendOutcome, SendRequest};
pub use cancel::{CancelScope, CancelToken, CancellationCoordinator, ScopeLease};
pub use decoder::{Decoded, StreamDecoder, decode_units};
pub use error::{
    DecodeError, FallbackError, LifecycleError, LookupError, SendError, TransportError,
};
pub use event::{AiMessage, CompletePayload, ContextualUpdate, StreamEvent};
pub use fallback::{FallbackCoordinator, FallbackOutcome};
pub use message::{
    AttachmentRef, Conversation, ConversationId, ConversationMode, ConversationPatch, Message,
    MessageId, MessageStatus, Metadata, Role,
};
pub use phase::{PhaseRejection, PhaseResult, PhaseTransition, SendPhase};
pub use store::{
    ConversationSnapshot, ConversationStore, LookupPanel, MutationOutcome, StreamingScratchState,
};
pub use transport::{
    BoxFuture, FallbackClient, MessagePayload, StreamTransport, TermExplanation, TermLookup,
    TermRequest, UnitStream,
};
