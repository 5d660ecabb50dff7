//! Bounded actor mailbox

use crate::actor::Message;
use crate::error::SystemError;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use super::ActorId;

/// Outcome of a [`crate::actor::Router::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendResult {
    /// The message was enqueued.
    Delivered,
    /// The mailbox is at capacity; retry later or drop.
    MailboxFull,
    /// No actor registered under the id.
    NoSuchActor,
    /// The actor is stopping or stopped.
    Stopped,
}

impl SendResult {
    pub fn is_delivered(&self) -> bool {
        matches!(self, SendResult::Delivered)
    }

    /// Convert into a `Result`, attributing failures to `id`.
    pub fn into_result(self, id: ActorId) -> Result<(), SystemError> {
        match self {
            SendResult::Delivered => Ok(()),
            SendResult::MailboxFull => Err(SystemError::MailboxFull(id)),
            SendResult::NoSuchActor => Err(SystemError::NoSuchActor(id)),
            SendResult::Stopped => Err(SystemError::ActorStopped(id)),
        }
    }
}

/// Bounded FIFO queue owned by one actor.
///
/// Senders go through [`Mailbox::try_send`], which never blocks; the
/// refusal (`MailboxFull`) is the runtime's backpressure primitive. The
/// `scheduled` flag ensures the owning actor sits in the system's ready
/// queue at most once.
pub struct Mailbox<T> {
    capacity: usize,
    queue: Mutex<VecDeque<Message<T>>>,
    stopped: AtomicBool,
    scheduled: AtomicBool,
}

impl<T> Mailbox<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            queue: Mutex::new(VecDeque::with_capacity(capacity.min(64))),
            stopped: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
        }
    }

    /// Enqueue without blocking.
    pub fn try_send(&self, msg: Message<T>) -> SendResult {
        if self.stopped.load(Ordering::Acquire) {
            return SendResult::Stopped;
        }
        let mut queue = self.queue.lock();
        if queue.len() >= self.capacity {
            return SendResult::MailboxFull;
        }
        queue.push_back(msg);
        SendResult::Delivered
    }

    /// Enqueue ignoring capacity. Reserved for the system's own `Stop`
    /// delivery so a full mailbox cannot wedge shutdown.
    pub(crate) fn force_send(&self, msg: Message<T>) {
        self.queue.lock().push_back(msg);
    }

    /// Move up to `max` messages into `out`, preserving order.
    pub(crate) fn drain(&self, max: usize, out: &mut Vec<Message<T>>) {
        let mut queue = self.queue.lock();
        let n = queue.len().min(max);
        out.extend(queue.drain(..n));
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Reject all further sends. One-way.
    pub(crate) fn mark_stopped(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Claim the right to enqueue the actor on the ready queue. Returns
    /// `true` when the caller won the claim.
    pub(crate) fn try_claim_schedule(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    /// Release the schedule claim after a poll round.
    pub(crate) fn release_schedule(&self) {
        self.scheduled.store(false, Ordering::Release);
    }
}
