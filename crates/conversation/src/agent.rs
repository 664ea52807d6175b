//! Send orchestration: one user turn from placeholder creation to its terminal outcome.

use std::sync::Arc;

use futures::StreamExt;
use snafu::{ResultExt, ensure};

use crate::cancel::{CancelScope, CancelToken, CancellationCoordinator, ScopeLease};
use crate::decoder::{Decoded, decode_units};
use crate::error::{
    ClosedEarlySnafu, EmptyMessageSnafu, EmptyTermSnafu, LifecycleError, LifecycleSnafu,
    LookupError, LookupUnavailableSnafu, MissingConversationIdSnafu, SendError,
};
use crate::event::StreamEvent;
use crate::fallback::{FallbackCoordinator, FallbackOutcome};
use crate::message::{AttachmentRef, Message, MessageId};
use crate::store::{ConversationStore, MutationOutcome};
use crate::transport::{
    FallbackClient, MessagePayload, StreamTransport, TermExplanation, TermLookup, TermRequest,
};

/// Who is talking in this conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participants {
    pub user_id: String,
    pub coach_id: String,
}

impl Participants {
    pub fn new(user_id: impl Into<String>, coach_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            coach_id: coach_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SendRequest {
    pub text: String,
    pub attachments: Vec<AttachmentRef>,
}

impl SendRequest {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            attachments: Vec::new(),
        }
    }

    pub fn with_attachments(mut self, attachments: Vec<AttachmentRef>) -> Self {
        self.attachments = attachments;
        self
    }
}

/// Path that produced the final assistant message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Stream,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Delivered {
        message_id: MessageId,
        delivery: Delivery,
    },
    /// Stopped by the user or superseded; the placeholder is gone.
    Cancelled,
}

enum StreamEnd {
    Completed,
    Cancelled,
    Interrupted(String),
}

/// Drops the placeholder of a send whose future ended without settling it, and
/// releases the send token.
struct TurnGuard<'a> {
    store: &'a ConversationStore,
    placeholder: MessageId,
    lease: ScopeLease<'a>,
}

impl<'a> TurnGuard<'a> {
    fn new(
        store: &'a ConversationStore,
        coordinator: &'a CancellationCoordinator,
        token: CancelToken,
        placeholder: MessageId,
    ) -> Self {
        Self {
            store,
            placeholder,
            lease: ScopeLease::new(coordinator, token),
        }
    }

    fn token(&self) -> &CancelToken {
        self.lease.token()
    }
}

impl Drop for TurnGuard<'_> {
    fn drop(&mut self) {
        if let Ok(MutationOutcome::Applied) = self.store.remove(self.placeholder) {
            tracing::debug!(message_id = %self.placeholder, "dropped unsettled placeholder");
        }
    }
}

/// Drives sends and term lookups for one conversation store.
pub struct ConversationAgent {
    store: Arc<ConversationStore>,
    participants: Participants,
    transport: Arc<dyn StreamTransport>,
    fallback: Arc<dyn FallbackClient>,
    lookup: Option<Arc<dyn TermLookup>>,
    cancellation: Arc<CancellationCoordinator>,
}

impl ConversationAgent {
    pub fn new(
        store: Arc<ConversationStore>,
        participants: Participants,
        transport: Arc<dyn StreamTransport>,
        fallback: Arc<dyn FallbackClient>,
    ) -> Self {
        Self {
            store,
            participants,
            transport,
            fallback,
            lookup: None,
            cancellation: Arc::new(CancellationCoordinator::new()),
        }
    }

    pub fn with_term_lookup(mut self, lookup: Arc<dyn TermLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    /// Sends one user message and resolves once its assistant reply is settled.
    ///
    /// Validation and the in-flight check run before anything is mutated. Transport
    /// failures are recovered through the fallback exchange and never surface on
    /// their own.
    pub async fn send_message(&self, request: SendRequest) -> Result<SendOutcome, SendError> {
        let conversation = self.store.conversation();
        ensure!(
            !conversation.id.is_empty(),
            MissingConversationIdSnafu {
                stage: "send-message"
            }
        );

        let text = request.text.trim().to_string();
        ensure!(
            !text.is_empty() || !request.attachments.is_empty(),
            EmptyMessageSnafu {
                stage: "send-message"
            }
        );

        let payload = MessagePayload {
            conversation_id: conversation.id,
            coach_id: self.participants.coach_id.clone(),
            user_id: self.participants.user_id.clone(),
            user_message: text.clone(),
            attachments: request.attachments.clone(),
        };

        let placeholder = self
            .store
            .begin_turn(Message::user(text, request.attachments))
            .context(LifecycleSnafu {
                stage: "begin-turn",
            })?;
        // Only a send that got past the in-flight check may claim the scope.
        let token = self.cancellation.begin(CancelScope::Send);
        let guard = TurnGuard::new(&self.store, &self.cancellation, token, placeholder);

        tracing::info!(
            conversation_id = %payload.conversation_id,
            message_id = %placeholder,
            "sending message"
        );

        let cause = match self
            .stream_turn(placeholder, &payload, guard.token())
            .await
            .context(LifecycleSnafu { stage: "stream" })?
        {
            StreamEnd::Completed => {
                return Ok(SendOutcome::Delivered {
                    message_id: placeholder,
                    delivery: Delivery::Stream,
                });
            }
            StreamEnd::Cancelled => {
                self.store.remove(placeholder).context(LifecycleSnafu {
                    stage: "cancel-send",
                })?;
                tracing::info!(message_id = %placeholder, "send cancelled");
                return Ok(SendOutcome::Cancelled);
            }
            StreamEnd::Interrupted(cause) => cause,
        };

        let outcome = FallbackCoordinator::new(&self.store, self.fallback.as_ref())
            .recover(placeholder, &payload, guard.token(), &cause)
            .await
            .context(LifecycleSnafu { stage: "fallback" })?;

        match outcome {
            FallbackOutcome::Finalized => Ok(SendOutcome::Delivered {
                message_id: placeholder,
                delivery: Delivery::Fallback,
            }),
            FallbackOutcome::Cancelled => Ok(SendOutcome::Cancelled),
            FallbackOutcome::Failed {
                error_message_id,
                source,
            } => Err(SendError::Fallback {
                stage: "fallback",
                error_message_id,
                source,
            }),
        }
    }

    async fn stream_turn(
        &self,
        placeholder: MessageId,
        payload: &MessagePayload,
        token: &CancelToken,
    ) -> Result<StreamEnd, LifecycleError> {
        let units = tokio::select! {
            biased;
            _ = token.cancelled() => return Ok(StreamEnd::Cancelled),
            opened = self.transport.open_stream(payload) => match opened {
                Ok(units) => units,
                Err(error) => {
                    tracing::warn!(message_id = %placeholder, error = %error, "failed to open event stream");
                    return Ok(StreamEnd::Interrupted(error.to_string()));
                }
            },
        };

        let mut events = Box::pin(decode_units(units));
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => return Ok(StreamEnd::Cancelled),
                next = events.next() => next,
            };
            if token.is_cancelled() {
                return Ok(StreamEnd::Cancelled);
            }

            match next {
                Some(Decoded::Event(event)) => {
                    if self.apply_event(placeholder, event)? {
                        return Ok(StreamEnd::Completed);
                    }
                }
                Some(Decoded::Malformed(error)) => {
                    tracing::warn!(message_id = %placeholder, error = %error, "skipping undecodable stream unit");
                }
                Some(Decoded::TransportFailed(error)) => {
                    tracing::warn!(message_id = %placeholder, error = %error, "event stream failed");
                    return Ok(StreamEnd::Interrupted(error.to_string()));
                }
                None => {
                    let error = ClosedEarlySnafu {
                        stage: "read-stream",
                    }
                    .build();
                    return Ok(StreamEnd::Interrupted(error.to_string()));
                }
            }
        }
    }

    /// Returns true once the terminal event was applied.
    fn apply_event(
        &self,
        placeholder: MessageId,
        event: StreamEvent,
    ) -> Result<bool, LifecycleError> {
        let kind = event.kind();
        let outcome = match event {
            StreamEvent::Contextual(update) => self.store.set_contextual(placeholder, update)?,
            StreamEvent::Metadata(fields) => self.store.merge_metadata(placeholder, fields)?,
            StreamEvent::Chunk(text) => self.store.append_chunk(placeholder, &text)?,
            StreamEvent::Error(message) => {
                tracing::warn!(message_id = %placeholder, error = %message, "coach stream reported an error");
                return Ok(false);
            }
            StreamEvent::Complete(payload) => {
                self.store.finalize_complete(placeholder, &payload)?;
                return Ok(true);
            }
        };

        if outcome == MutationOutcome::Ignored {
            tracing::debug!(message_id = %placeholder, kind, "dropped event for settled placeholder");
        }
        Ok(false)
    }

    /// Stops the in-flight send. Returns false when nothing was in flight.
    pub fn cancel_send(&self) -> bool {
        self.cancellation.cancel(CancelScope::Send)
    }

    /// Looks up a term for the explanation panel. A newer lookup, or closing the
    /// panel, supersedes this one and makes it resolve to `Ok(None)`.
    pub async fn explain_term(&self, term: &str) -> Result<Option<TermExplanation>, LookupError> {
        let term = term.trim();
        ensure!(
            !term.is_empty(),
            EmptyTermSnafu {
                stage: "explain-term"
            }
        );
        let Some(lookup) = self.lookup.as_ref() else {
            return LookupUnavailableSnafu {
                stage: "explain-term",
            }
            .fail();
        };

        let lease = ScopeLease::new(
            &self.cancellation,
            self.cancellation.begin(CancelScope::TermLookup),
        );
        self.store.begin_lookup(term);

        let request = TermRequest {
            term: term.to_string(),
            conversation_id: self.store.conversation().id,
            coach_id: self.participants.coach_id.clone(),
            user_id: self.participants.user_id.clone(),
        };

        let result = tokio::select! {
            biased;
            _ = lease.token().cancelled() => return Ok(None),
            result = lookup.explain(&request) => result,
        };
        if lease.token().is_cancelled() {
            return Ok(None);
        }

        match result {
            Ok(mut explanation) => {
                if explanation.term.is_empty() {
                    explanation.term = term.to_string();
                }
                self.store.resolve_lookup(term, explanation.clone());
                Ok(Some(explanation))
            }
            Err(error) => {
                tracing::warn!(term, error = %error, "term lookup failed");
                self.store.fail_lookup(term, error.to_string());
                Err(error)
            }
        }
    }

    pub fn close_explanation(&self) {
        self.cancellation.cancel(CancelScope::TermLookup);
        self.store.clear_lookup();
    }
}
