//! Cooperative actor runtime
//!
//! Actors own their state and communicate only through bounded mailboxes.
//! A [`System`] multiplexes all registered actors onto a fixed pool of
//! workers; the scheduler guarantees that at most one worker polls a given
//! actor at a time, so actor code never needs internal locking.

mod mailbox;
mod router;
mod system;

pub use mailbox::{Mailbox, SendResult};
pub use router::Router;
pub use system::{System, SystemConfig};

use async_trait::async_trait;

/// Identifier of an actor within one system.
///
/// `u64::MAX` is reserved by the scheduler.
pub type ActorId = u64;

/// A message delivered through an actor mailbox.
///
/// `Barrier`, `Stop` and `Tick` form the control plane; `Value` carries the
/// payload type of the hosting system (for table actors, a pipeline
/// message).
#[derive(Debug)]
pub enum Message<T> {
    /// Pause emission beyond the given timestamp until raised.
    Barrier(u64),
    /// Stop the actor. The transition is one-way.
    Stop,
    /// Periodic nudge with no payload; lets idle actors make progress.
    Tick,
    /// Data payload.
    Value(T),
}

impl<T> Message<T> {
    /// Message kind for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Barrier(_) => "barrier",
            Message::Stop => "stop",
            Message::Tick => "tick",
            Message::Value(_) => "value",
        }
    }
}

/// Context handed to an actor on every poll.
#[derive(Debug, Clone)]
pub struct ActorContext {
    /// Id the actor was spawned under.
    pub id: ActorId,
}

/// A cooperative actor.
///
/// `poll` must not block: long-running work belongs in background tasks the
/// actor communicates with through channels. Returning `false` marks the
/// actor as done; the system then calls [`Actor::on_close`] and removes it
/// from the router.
#[async_trait]
pub trait Actor: Send {
    type Payload: Send + 'static;

    /// Handle one batch of messages. Returns whether the actor stays alive.
    async fn poll(&mut self, ctx: &ActorContext, msgs: Vec<Message<Self::Payload>>) -> bool;

    /// Called exactly once after the final poll, before removal.
    async fn on_close(&mut self) {}
}

/// Boxed actor stored by the system.
pub type BoxedActor<T> = Box<dyn Actor<Payload = T> + Send>;
