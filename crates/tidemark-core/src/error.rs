//! Error types for the actor runtime

use crate::actor::ActorId;
use thiserror::Error;

/// Errors surfaced by the actor system and router.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SystemError {
    /// The target actor's mailbox is at capacity; the caller should retry
    /// later or drop the message.
    #[error("mailbox full for actor {0}")]
    MailboxFull(ActorId),

    /// No actor is registered under the given id.
    #[error("no such actor {0}")]
    NoSuchActor(ActorId),

    /// The target actor is stopping or stopped and no longer accepts
    /// messages.
    #[error("actor {0} is stopped")]
    ActorStopped(ActorId),

    /// An actor with the given id is already registered.
    #[error("actor {0} already spawned")]
    DuplicateActor(ActorId),

    /// The system itself has been shut down.
    #[error("actor system is stopped")]
    SystemStopped,
}

impl SystemError {
    /// Whether the send that produced this error may succeed if retried.
    pub fn is_retriable(&self) -> bool {
        matches!(self, SystemError::MailboxFull(_))
    }
}

/// Result type for actor system operations.
pub type Result<T> = std::result::Result<T, SystemError>;
