//! Per-store send lifecycle.
//!
//! `Idle → PlaceholderCreated → Streaming* → FallbackInvoked? → Idle`. A store holds
//! at most one placeholder, so every transition names the placeholder it targets and
//! is checked against the active one.

use crate::message::MessageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SendPhase {
    #[default]
    Idle,
    PlaceholderCreated(MessageId),
    Streaming(MessageId),
    FallbackInvoked(MessageId),
}

/// Transition input for the send lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseTransition {
    Create(MessageId),
    /// A chunk, metadata or contextual event was applied to the placeholder.
    Stream(MessageId),
    InvokeFallback(MessageId),
    Finalize(MessageId),
    Remove(MessageId),
}

/// Rejection reason for illegal send transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseRejection {
    AlreadyInFlight {
        active: MessageId,
        attempted: MessageId,
    },
    NoSendInFlight,
    PlaceholderMismatch {
        active: MessageId,
        attempted: MessageId,
    },
    FallbackAlreadyAttempted(MessageId),
    StreamAfterFallback(MessageId),
}

impl PhaseRejection {
    /// Stale rejections come from events that target a placeholder which is already gone.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::NoSendInFlight | Self::PlaceholderMismatch { .. })
    }
}

pub type PhaseResult = Result<SendPhase, PhaseRejection>;

impl SendPhase {
    /// Returns the in-flight placeholder, if any.
    pub fn placeholder(&self) -> Option<MessageId> {
        match self {
            Self::Idle => None,
            Self::PlaceholderCreated(id) | Self::Streaming(id) | Self::FallbackInvoked(id) => {
                Some(*id)
            }
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self, Self::Idle)
    }

    /// Applies one transition deterministically.
    pub fn apply(&self, transition: PhaseTransition) -> PhaseResult {
        match transition {
            PhaseTransition::Create(id) => self.apply_create(id),
            PhaseTransition::Stream(id) => self.apply_stream(id),
            PhaseTransition::InvokeFallback(id) => self.apply_fallback(id),
            PhaseTransition::Finalize(id) | PhaseTransition::Remove(id) => {
                self.require_active(id).map(|_| Self::Idle)
            }
        }
    }

    fn apply_create(&self, id: MessageId) -> PhaseResult {
        match self.placeholder() {
            Some(active) => Err(PhaseRejection::AlreadyInFlight {
                active,
                attempted: id,
            }),
            None => Ok(Self::PlaceholderCreated(id)),
        }
    }

    fn apply_stream(&self, id: MessageId) -> PhaseResult {
        self.require_active(id)?;
        match self {
            Self::FallbackInvoked(active) => Err(PhaseRejection::StreamAfterFallback(*active)),
            _ => Ok(Self::Streaming(id)),
        }
    }

    fn apply_fallback(&self, id: MessageId) -> PhaseResult {
        self.require_active(id)?;
        match self {
            Self::FallbackInvoked(active) => {
                Err(PhaseRejection::FallbackAlreadyAttempted(*active))
            }
            _ => Ok(Self::FallbackInvoked(id)),
        }
    }

    fn require_active(&self, id: MessageId) -> Result<MessageId, PhaseRejection> {
        match self.placeholder() {
            Some(active) if active == id => Ok(active),
            Some(active) => Err(PhaseRejection::PlaceholderMismatch {
                active,
                attempted: id,
            }),
            None => Err(PhaseRejection::NoSendInFlight),
        }
    }
}
