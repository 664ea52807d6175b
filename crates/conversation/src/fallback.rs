//! One-shot recovery for sends whose stream never reached a terminal event.

use crate::cancel::CancelToken;
use crate::error::{FallbackError, LifecycleError};
use crate::message::{Message, MessageId};
use crate::store::{ConversationStore, MutationOutcome};
use crate::transport::{FallbackClient, MessagePayload};

/// How a fallback attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FallbackOutcome {
    /// The placeholder was finalized from the fallback response.
    Finalized,
    /// The send was cancelled, or the placeholder was already gone.
    Cancelled,
    /// The placeholder was replaced with a synthesized error reply.
    Failed {
        error_message_id: MessageId,
        source: FallbackError,
    },
}

pub struct FallbackCoordinator<'a> {
    store: &'a ConversationStore,
    client: &'a dyn FallbackClient,
}

impl<'a> FallbackCoordinator<'a> {
    pub fn new(store: &'a ConversationStore, client: &'a dyn FallbackClient) -> Self {
        Self { store, client }
    }

    /// Re-sends `payload` through the non-streaming exchange and settles `placeholder`.
    ///
    /// Fails with [`LifecycleError`] only when the placeholder already used its one
    /// fallback attempt.
    pub async fn recover(
        &self,
        placeholder: MessageId,
        payload: &MessagePayload,
        token: &CancelToken,
        cause: &str,
    ) -> Result<FallbackOutcome, LifecycleError> {
        if token.is_cancelled() {
            return self.abandon(placeholder);
        }
        if self.store.begin_fallback(placeholder)? == MutationOutcome::Ignored {
            return Ok(FallbackOutcome::Cancelled);
        }

        tracing::warn!(
            conversation_id = %payload.conversation_id,
            message_id = %placeholder,
            cause,
            "stream ended without a terminal event, falling back to a single request"
        );

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return self.abandon(placeholder),
            response = self.client.send_message(payload) => response,
        };

        if token.is_cancelled() {
            return self.abandon(placeholder);
        }

        match response {
            Ok(complete) => match self.store.finalize_complete(placeholder, &complete)? {
                MutationOutcome::Applied => Ok(FallbackOutcome::Finalized),
                MutationOutcome::Ignored => Ok(FallbackOutcome::Cancelled),
            },
            Err(source) => {
                tracing::error!(
                    conversation_id = %payload.conversation_id,
                    message_id = %placeholder,
                    error = %source,
                    "fallback request failed"
                );

                let error_message = Message::assistant_error(source.to_string());
                let error_message_id = error_message.id;
                match self.store.replace_with_error(placeholder, error_message)? {
                    MutationOutcome::Applied => Ok(FallbackOutcome::Failed {
                        error_message_id,
                        source,
                    }),
                    MutationOutcome::Ignored => Ok(FallbackOutcome::Cancelled),
                }
            }
        }
    }

    fn abandon(&self, placeholder: MessageId) -> Result<FallbackOutcome, LifecycleError> {
        self.store.remove(placeholder)?;
        Ok(FallbackOutcome::Cancelled)
    }
}
