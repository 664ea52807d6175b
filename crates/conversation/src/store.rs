//! Conversation state store and placeholder lifecycle.
//!
//! The store is the only owner of the message list and the streaming scratch state.
//! Every applied mutation bumps `revision` and publishes one full, immutable
//! [`ConversationSnapshot`]; ignored mutations publish nothing.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use crate::error::{BusySnafu, LifecycleError, TransitionSnafu};
use crate::event::{CompletePayload, ContextualUpdate};
use crate::message::{
    Conversation, ConversationMode, ConversationPatch, Message, MessageId, MessageStatus, Metadata,
};
use crate::phase::{PhaseRejection, PhaseTransition, SendPhase};
use crate::transport::TermExplanation;

/// Ephemeral per-store streaming state, reset after every terminal event.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamingScratchState {
    pub is_streaming: bool,
    pub is_typing: bool,
    pub in_flight_placeholder_id: Option<MessageId>,
    pub contextual_update: Option<ContextualUpdate>,
}

impl StreamingScratchState {
    fn for_placeholder(id: MessageId) -> Self {
        Self {
            is_streaming: true,
            is_typing: true,
            in_flight_placeholder_id: Some(id),
            contextual_update: None,
        }
    }

    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

/// State of the side-channel term explanation panel.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LookupPanel {
    pub term: Option<String>,
    pub loading: bool,
    pub explanation: Option<TermExplanation>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSnapshot {
    pub revision: u64,
    pub conversation: Conversation,
    pub messages: Vec<Message>,
    pub scratch: StreamingScratchState,
    pub phase: SendPhase,
    pub lookup: LookupPanel,
}

impl ConversationSnapshot {
    pub fn placeholder(&self) -> Option<&Message> {
        let id = self.phase.placeholder()?;
        self.messages.iter().find(|message| message.id == id)
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }
}

/// Whether a lifecycle call changed anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied,
    /// Addressed to a placeholder that is no longer in flight; nothing changed.
    Ignored,
}

#[derive(Debug)]
struct StoreState {
    revision: u64,
    conversation: Conversation,
    messages: Vec<Message>,
    scratch: StreamingScratchState,
    phase: SendPhase,
    lookup: LookupPanel,
}

impl StoreState {
    fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            revision: self.revision,
            conversation: self.conversation.clone(),
            messages: self.messages.clone(),
            scratch: self.scratch.clone(),
            phase: self.phase,
            lookup: self.lookup.clone(),
        }
    }

    fn placeholder_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages
            .iter_mut()
            .find(|message| message.id == id && message.is_placeholder())
    }

    /// Validates a transition. `Ok(None)` marks a stale target that must be ignored.
    fn check(
        &self,
        transition: PhaseTransition,
        stage: &'static str,
    ) -> Result<Option<SendPhase>, LifecycleError> {
        match self.phase.apply(transition) {
            Ok(next) => Ok(Some(next)),
            Err(rejection) if rejection.is_stale() => {
                tracing::debug!(stage, ?rejection, "ignoring mutation for a stale placeholder");
                Ok(None)
            }
            Err(PhaseRejection::AlreadyInFlight { active, .. }) => {
                BusySnafu { stage, active }.fail()
            }
            Err(rejection) => TransitionSnafu { stage, rejection }.fail(),
        }
    }
}

pub struct ConversationStore {
    state: Mutex<StoreState>,
    snapshots: watch::Sender<Arc<ConversationSnapshot>>,
}

impl ConversationStore {
    pub fn new(conversation: Conversation) -> Self {
        Self::with_history(conversation, Vec::new())
    }

    /// Creates a store over already finalized history.
    pub fn with_history(conversation: Conversation, messages: Vec<Message>) -> Self {
        let state = StoreState {
            revision: 0,
            conversation,
            messages,
            scratch: StreamingScratchState::default(),
            phase: SendPhase::Idle,
            lookup: LookupPanel::default(),
        };
        let (snapshots, _) = watch::channel(Arc::new(state.snapshot()));

        Self {
            state: Mutex::new(state),
            snapshots,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ConversationSnapshot>> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> Arc<ConversationSnapshot> {
        self.snapshots.borrow().clone()
    }

    pub fn conversation(&self) -> Conversation {
        self.state.lock().conversation.clone()
    }

    pub fn phase(&self) -> SendPhase {
        self.state.lock().phase
    }

    fn publish(&self, state: &mut StoreState) {
        state.revision += 1;
        self.snapshots.send_replace(Arc::new(state.snapshot()));
    }

    /// Appends the user's message and opens the assistant placeholder for it.
    ///
    /// Rejected as a whole, without appending anything, while another send is in flight.
    pub fn begin_turn(&self, user_message: Message) -> Result<MessageId, LifecycleError> {
        let mut state = self.state.lock();
        if let Some(active) = state.phase.placeholder() {
            return BusySnafu {
                stage: "begin-turn",
                active,
            }
            .fail();
        }

        state.messages.push(user_message);
        self.publish(&mut state);

        let mode = state.conversation.mode.clone();
        self.create_locked(&mut state, &mode)
    }

    /// Allocates the in-flight assistant placeholder.
    pub fn create(&self, mode: &ConversationMode) -> Result<MessageId, LifecycleError> {
        let mut state = self.state.lock();
        self.create_locked(&mut state, mode)
    }

    fn create_locked(
        &self,
        state: &mut StoreState,
        mode: &ConversationMode,
    ) -> Result<MessageId, LifecycleError> {
        let placeholder = Message::assistant_placeholder(mode);
        let id = placeholder.id;
        let next = state
            .phase
            .apply(PhaseTransition::Create(id))
            .map_err(|rejection| match rejection {
                PhaseRejection::AlreadyInFlight { active, .. } => LifecycleError::Busy {
                    stage: "create-placeholder",
                    active,
                },
                rejection => LifecycleError::Transition {
                    stage: "create-placeholder",
                    rejection,
                },
            })?;

        state.phase = next;
        state.messages.push(placeholder);
        state.scratch = StreamingScratchState::for_placeholder(id);
        self.publish(state);

        tracing::debug!(message_id = %id, mode = mode.as_str(), "created assistant placeholder");
        Ok(id)
    }

    /// Appends one chunk. A chunk always supersedes pending narration.
    pub fn append_chunk(
        &self,
        id: MessageId,
        text: &str,
    ) -> Result<MutationOutcome, LifecycleError> {
        let mut state = self.state.lock();
        let Some(next) = state.check(PhaseTransition::Stream(id), "append-chunk")? else {
            return Ok(MutationOutcome::Ignored);
        };
        let Some(message) = state.placeholder_mut(id) else {
            return Ok(MutationOutcome::Ignored);
        };

        message.content.push_str(text);
        state.phase = next;
        state.scratch.contextual_update = None;
        state.scratch.is_typing = false;
        self.publish(&mut state);
        Ok(MutationOutcome::Applied)
    }

    /// Shallow-merges early metadata without touching content.
    pub fn merge_metadata(
        &self,
        id: MessageId,
        fields: Metadata,
    ) -> Result<MutationOutcome, LifecycleError> {
        let mut state = self.state.lock();
        let Some(next) = state.check(PhaseTransition::Stream(id), "merge-metadata")? else {
            return Ok(MutationOutcome::Ignored);
        };
        let Some(message) = state.placeholder_mut(id) else {
            return Ok(MutationOutcome::Ignored);
        };

        message.metadata.extend(fields);
        state.phase = next;
        self.publish(&mut state);
        Ok(MutationOutcome::Applied)
    }

    pub fn set_contextual(
        &self,
        id: MessageId,
        update: ContextualUpdate,
    ) -> Result<MutationOutcome, LifecycleError> {
        let mut state = self.state.lock();
        let Some(next) = state.check(PhaseTransition::Stream(id), "set-contextual")? else {
            return Ok(MutationOutcome::Ignored);
        };

        state.phase = next;
        state.scratch.contextual_update = Some(update);
        self.publish(&mut state);
        Ok(MutationOutcome::Applied)
    }

    /// Marks the placeholder as recovering through the one-shot fallback exchange.
    pub fn begin_fallback(&self, id: MessageId) -> Result<MutationOutcome, LifecycleError> {
        let mut state = self.state.lock();
        let Some(next) = state.check(PhaseTransition::InvokeFallback(id), "begin-fallback")? else {
            return Ok(MutationOutcome::Ignored);
        };

        state.phase = next;
        state.scratch.is_streaming = false;
        state.scratch.is_typing = true;
        state.scratch.contextual_update = None;
        self.publish(&mut state);
        Ok(MutationOutcome::Applied)
    }

    /// Replaces the placeholder's content with the authoritative value and closes the send.
    ///
    /// Accumulated chunks are discarded; metadata keeps what was merged mid-stream with
    /// `metadata_overlay` written on top.
    pub fn finalize(
        &self,
        id: MessageId,
        content: String,
        metadata_overlay: Metadata,
        patch: &ConversationPatch,
    ) -> Result<MutationOutcome, LifecycleError> {
        let mut state = self.state.lock();
        let Some(next) = state.check(PhaseTransition::Finalize(id), "finalize")? else {
            return Ok(MutationOutcome::Ignored);
        };
        let Some(message) = state.placeholder_mut(id) else {
            return Ok(MutationOutcome::Ignored);
        };

        message.content = content;
        message.metadata.extend(metadata_overlay);
        message.status = MessageStatus::Done;

        state.conversation.apply_patch(patch);
        state.phase = next;
        state.scratch = StreamingScratchState::default();
        self.publish(&mut state);

        tracing::debug!(message_id = %id, "finalized assistant message");
        Ok(MutationOutcome::Applied)
    }

    pub fn finalize_complete(
        &self,
        id: MessageId,
        payload: &CompletePayload,
    ) -> Result<MutationOutcome, LifecycleError> {
        self.finalize(
            id,
            payload.content().to_string(),
            payload.metadata_overlay(),
            &payload.conversation_patch(),
        )
    }

    /// Deletes the placeholder entirely; the user's message is kept.
    pub fn remove(&self, id: MessageId) -> Result<MutationOutcome, LifecycleError> {
        let mut state = self.state.lock();
        let Some(next) = state.check(PhaseTransition::Remove(id), "remove")? else {
            return Ok(MutationOutcome::Ignored);
        };

        state.messages.retain(|message| message.id != id);
        state.phase = next;
        state.scratch = StreamingScratchState::default();
        self.publish(&mut state);

        tracing::debug!(message_id = %id, "removed assistant placeholder");
        Ok(MutationOutcome::Applied)
    }

    /// Swaps the placeholder for a locally synthesized error reply in one snapshot.
    pub fn replace_with_error(
        &self,
        id: MessageId,
        error_message: Message,
    ) -> Result<MutationOutcome, LifecycleError> {
        let mut state = self.state.lock();
        let Some(next) = state.check(PhaseTransition::Remove(id), "replace-with-error")? else {
            return Ok(MutationOutcome::Ignored);
        };

        state.messages.retain(|message| message.id != id);
        state.messages.push(error_message);
        state.phase = next;
        state.scratch = StreamingScratchState::default();
        self.publish(&mut state);
        Ok(MutationOutcome::Applied)
    }

    pub fn begin_lookup(&self, term: &str) {
        let mut state = self.state.lock();
        state.lookup = LookupPanel {
            term: Some(term.to_string()),
            loading: true,
            explanation: None,
            error: None,
        };
        self.publish(&mut state);
    }

    /// Stores a lookup result if the panel still shows `term`.
    pub fn resolve_lookup(&self, term: &str, explanation: TermExplanation) -> MutationOutcome {
        self.settle_lookup(term, |panel| panel.explanation = Some(explanation))
    }

    pub fn fail_lookup(&self, term: &str, error: String) -> MutationOutcome {
        self.settle_lookup(term, |panel| panel.error = Some(error))
    }

    fn settle_lookup(&self, term: &str, apply: impl FnOnce(&mut LookupPanel)) -> MutationOutcome {
        let mut state = self.state.lock();
        if state.lookup.term.as_deref() != Some(term) {
            return MutationOutcome::Ignored;
        }

        state.lookup.loading = false;
        apply(&mut state.lookup);
        self.publish(&mut state);
        MutationOutcome::Applied
    }

    pub fn clear_lookup(&self) -> MutationOutcome {
        let mut state = self.state.lock();
        if state.lookup == LookupPanel::default() {
            return MutationOutcome::Ignored;
        }

        state.lookup = LookupPanel::default();
        self.publish(&mut state);
        MutationOutcome::Applied
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::message::{ConversationId, Role};

    fn store() -> ConversationStore {
        ConversationStore::new(Conversation::new(
            ConversationId::new("c-1"),
            ConversationMode::Chat,
        ))
    }

    fn metadata(value: serde_json::Value) -> Metadata {
        match value {
            serde_json::Value::Object(map) => map,
            _ => Metadata::new(),
        }
    }

    #[test]
    fn begin_turn_appends_user_message_then_placeholder() {
        let store = store();
        let id = store
            .begin_turn(Message::user("hello", Vec::new()))
            .expect("begin turn");

        let snapshot = store.snapshot();
        assert_eq!(snapshot.revision, 2);
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[0].role, Role::User);
        assert_eq!(snapshot.messages[1].id, id);
        assert_eq!(snapshot.scratch.in_flight_placeholder_id, Some(id));
        assert!(snapshot.scratch.is_streaming && snapshot.scratch.is_typing);
        assert_eq!(snapshot.phase, SendPhase::PlaceholderCreated(id));
    }

    #[test]
    fn second_turn_is_rejected_without_touching_the_message_list() {
        let store = store();
        let id = store
            .begin_turn(Message::user("first", Vec::new()))
            .expect("first turn");
        let revision = store.snapshot().revision;

        let error = store
            .begin_turn(Message::user("second", Vec::new()))
            .expect_err("second turn rejected");
        assert!(matches!(error, LifecycleError::Busy { active, .. } if active == id));

        let error = store.create(&ConversationMode::Chat).expect_err("create rejected");
        assert!(matches!(error, LifecycleError::Busy { .. }));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.revision, revision);
        assert_eq!(snapshot.messages.len(), 2);
    }

    #[test]
    fn finalize_overrides_accumulated_chunks_and_clears_scratch() {
        let store = store();
        let id = store.create(&ConversationMode::Chat).expect("create");

        store
            .set_contextual(id, ContextualUpdate::new("thinking", Some("analyzing".into())))
            .expect("contextual");
        assert!(store.snapshot().scratch.contextual_update.is_some());

        store.append_chunk(id, "Hi").expect("chunk");
        let snapshot = store.snapshot();
        assert_eq!(snapshot.scratch.contextual_update, None);
        assert!(!snapshot.scratch.is_typing);

        store.append_chunk(id, " there").expect("chunk");
        assert_eq!(store.snapshot().messages[0].content, "Hi there");

        let outcome = store
            .finalize_complete(id, &CompletePayload::from_content("Hi there!"))
            .expect("finalize");
        assert_eq!(outcome, MutationOutcome::Applied);

        let snapshot = store.snapshot();
        assert_eq!(snapshot.messages[0].content, "Hi there!");
        assert_eq!(snapshot.messages[0].status, MessageStatus::Done);
        assert!(snapshot.scratch.is_idle());
        assert_eq!(snapshot.phase, SendPhase::Idle);
    }

    #[test]
    fn metadata_is_last_write_wins_with_complete_overlay_on_top() {
        let store = store();
        let id = store.create(&ConversationMode::Build).expect("create");

        store
            .merge_metadata(id, metadata(json!({"badge": "draft", "intent": "plan"})))
            .expect("metadata");
        store.append_chunk(id, "x").expect("chunk");
        store
            .merge_metadata(id, metadata(json!({"badge": "review"})))
            .expect("metadata");

        let mut payload = CompletePayload::from_content("done");
        payload.ai_message.metadata = Some(metadata(json!({"intent": "program"})));
        store.finalize_complete(id, &payload).expect("finalize");

        let message = &store.snapshot().messages[0];
        assert_eq!(message.metadata.get("mode"), Some(&json!("build")));
        assert_eq!(message.metadata.get("badge"), Some(&json!("review")));
        assert_eq!(message.metadata.get("intent"), Some(&json!("program")));
        assert_eq!(message.content, "done");
    }

    #[test]
    fn duplicate_finalize_is_ignored_without_publishing() {
        let store = store();
        let id = store.create(&ConversationMode::Chat).expect("create");
        store
            .finalize_complete(id, &CompletePayload::from_content("first"))
            .expect("finalize");
        let before = store.snapshot();

        let outcome = store
            .finalize_complete(id, &CompletePayload::from_content("second"))
            .expect("duplicate finalize");
        assert_eq!(outcome, MutationOutcome::Ignored);
        assert_eq!(store.append_chunk(id, "late"), Ok(MutationOutcome::Ignored));
        assert_eq!(store.remove(id), Ok(MutationOutcome::Ignored));

        let after = store.snapshot();
        assert_eq!(after.revision, before.revision);
        assert_eq!(after.messages[0].content, "first");
    }

    #[test]
    fn remove_deletes_only_the_placeholder() {
        let store = store();
        let id = store
            .begin_turn(Message::user("hello", Vec::new()))
            .expect("begin turn");
        store.append_chunk(id, "Hi").expect("chunk");

        assert_eq!(store.remove(id), Ok(MutationOutcome::Applied));

        let snapshot = store.snapshot();
        assert_eq!(snapshot.messages.len(), 1);
        assert_eq!(snapshot.messages[0].content, "hello");
        assert!(snapshot.scratch.is_idle());
        assert!(snapshot.phase.is_idle());
    }

    #[test]
    fn error_reply_replaces_the_placeholder_in_one_snapshot() {
        let store = store();
        let id = store
            .begin_turn(Message::user("hello", Vec::new()))
            .expect("begin turn");
        let revision = store.snapshot().revision;

        let error_message = Message::assistant_error("fallback status 502");
        let error_id = error_message.id;
        assert_eq!(
            store.replace_with_error(id, error_message),
            Ok(MutationOutcome::Applied)
        );

        let snapshot = store.snapshot();
        assert_eq!(snapshot.revision, revision + 1);
        assert_eq!(snapshot.messages.len(), 2);
        assert!(snapshot.message(id).is_none());
        assert!(snapshot.message(error_id).is_some_and(Message::is_error));
        assert!(snapshot.phase.is_idle());
    }

    #[test]
    fn finalize_applies_conversation_patch() {
        let store = store();
        let id = store.create(&ConversationMode::Chat).expect("create");
        let mut payload = CompletePayload::from_content("ok");
        payload.mode = Some("build".to_string());
        payload.conversation_size = Some(6);
        payload.workout_creator_session = Some(Some(json!({"step": "goals"})));

        store.finalize_complete(id, &payload).expect("finalize");

        let conversation = store.conversation();
        assert_eq!(conversation.mode, ConversationMode::Build);
        assert_eq!(conversation.size, Some(6));
        assert_eq!(conversation.session, Some(json!({"step": "goals"})));
    }

    #[test]
    fn fallback_can_only_begin_once() {
        let store = store();
        let id = store.create(&ConversationMode::Chat).expect("create");

        assert_eq!(store.begin_fallback(id), Ok(MutationOutcome::Applied));
        let snapshot = store.snapshot();
        assert!(!snapshot.scratch.is_streaming);
        assert!(snapshot.scratch.is_typing);

        let error = store.begin_fallback(id).expect_err("second fallback");
        assert!(matches!(
            error,
            LifecycleError::Transition {
                rejection: PhaseRejection::FallbackAlreadyAttempted(_),
                ..
            }
        ));
    }

    #[test]
    fn subscribers_observe_every_applied_mutation_as_a_full_snapshot() {
        let store = store();
        let mut receiver = store.subscribe();
        assert_eq!(receiver.borrow_and_update().revision, 0);

        let id = store.create(&ConversationMode::Chat).expect("create");
        assert!(receiver.has_changed().expect("sender alive"));
        let snapshot = receiver.borrow_and_update().clone();
        assert_eq!(snapshot.revision, 1);
        assert_eq!(snapshot.placeholder().map(|message| message.id), Some(id));

        store.append_chunk(id, "Hi").expect("chunk");
        let snapshot = receiver.borrow_and_update().clone();
        assert_eq!(snapshot.revision, 2);
        assert_eq!(snapshot.placeholder().map(|message| message.content.as_str()), Some("Hi"));
    }

    #[test]
    fn stale_lookup_results_are_ignored() {
        let store = store();
        store.begin_lookup("RPE");
        store.begin_lookup("tempo");

        let explanation = TermExplanation {
            term: "RPE".to_string(),
            explanation: "Rate of perceived exertion".to_string(),
        };
        assert_eq!(store.resolve_lookup("RPE", explanation), MutationOutcome::Ignored);
        assert_eq!(
            store.fail_lookup("tempo", "timeout".to_string()),
            MutationOutcome::Applied
        );

        let panel = store.snapshot().lookup.clone();
        assert_eq!(panel.term.as_deref(), Some("tempo"));
        assert!(!panel.loading);
        assert_eq!(panel.error.as_deref(), Some("timeout"));

        assert_eq!(store.clear_lookup(), MutationOutcome::Applied);
        assert_eq!(store.clear_lookup(), MutationOutcome::Ignored);
    }
}
