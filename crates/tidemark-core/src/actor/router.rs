//! Message routing to actor mailboxes

use crate::actor::{ActorId, BoxedActor, Mailbox, Message, SendResult};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::trace;

/// One registered actor: its mailbox plus the actor state itself.
///
/// The actor is kept inside an async Mutex taken only by the worker that
/// currently owns the schedule claim, so the lock is uncontended by
/// construction.
pub(crate) struct ActorCell<T> {
    pub(crate) id: ActorId,
    pub(crate) mailbox: Mailbox<T>,
    pub(crate) actor: tokio::sync::Mutex<Option<BoxedActor<T>>>,
    pub(crate) stop_requested: AtomicBool,
}

/// Routes messages to actors by id.
///
/// Cheap to clone; all clones share the same registry.
pub struct Router<T> {
    inner: Arc<RouterInner<T>>,
}

impl<T> Clone for Router<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

pub(crate) struct RouterInner<T> {
    pub(crate) name: String,
    pub(crate) actors: RwLock<HashMap<ActorId, Arc<ActorCell<T>>>>,
    pub(crate) ready_tx: mpsc::UnboundedSender<ActorId>,
}

impl<T: Send + 'static> Router<T> {
    pub(crate) fn new(name: impl Into<String>, ready_tx: mpsc::UnboundedSender<ActorId>) -> Self {
        Self {
            inner: Arc::new(RouterInner {
                name: name.into(),
                actors: RwLock::new(HashMap::new()),
                ready_tx,
            }),
        }
    }

    /// System name this router belongs to.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Deliver one message to an actor's mailbox.
    ///
    /// Never blocks. `MailboxFull` and `NoSuchActor` are recoverable by the
    /// caller (retry, or drop respectively).
    pub fn send(&self, id: ActorId, msg: Message<T>) -> SendResult {
        let cell = match self.get(id) {
            Some(cell) => cell,
            None => return SendResult::NoSuchActor,
        };
        let result = cell.mailbox.try_send(msg);
        if result.is_delivered() {
            self.schedule(&cell);
        }
        result
    }

    /// Deliver a batch, stopping at the first refusal. Returns the refusal
    /// (or `Delivered` if the whole batch landed) and how many messages got
    /// in.
    pub fn send_batch(&self, id: ActorId, msgs: Vec<Message<T>>) -> (SendResult, usize) {
        let cell = match self.get(id) {
            Some(cell) => cell,
            None => return (SendResult::NoSuchActor, 0),
        };
        let mut sent = 0;
        for msg in msgs {
            match cell.mailbox.try_send(msg) {
                SendResult::Delivered => sent += 1,
                refused => {
                    if sent > 0 {
                        self.schedule(&cell);
                    }
                    return (refused, sent);
                }
            }
        }
        if sent > 0 {
            self.schedule(&cell);
        }
        (SendResult::Delivered, sent)
    }

    /// Number of live actors.
    pub fn len(&self) -> usize {
        self.inner.actors.read().len()
    }

    /// Ids of all live actors, ascending.
    pub fn ids(&self) -> Vec<ActorId> {
        let mut ids: Vec<ActorId> = self.inner.actors.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Push an id straight onto the ready queue, bypassing the schedule
    /// claim. Only the system's shutdown sentinel uses this.
    pub(crate) fn push_ready(&self, id: ActorId) {
        let _ = self.inner.ready_tx.send(id);
    }

    pub fn is_empty(&self) -> bool {
        self.inner.actors.read().is_empty()
    }

    pub(crate) fn get(&self, id: ActorId) -> Option<Arc<ActorCell<T>>> {
        self.inner.actors.read().get(&id).cloned()
    }

    pub(crate) fn insert(&self, id: ActorId, cell: Arc<ActorCell<T>>) -> bool {
        use std::collections::hash_map::Entry;
        match self.inner.actors.write().entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                vacant.insert(cell);
                true
            }
        }
    }

    pub(crate) fn remove(&self, id: ActorId) -> Option<Arc<ActorCell<T>>> {
        let removed = self.inner.actors.write().remove(&id);
        if removed.is_some() {
            trace!(system = %self.inner.name, actor = id, "actor removed from router");
        }
        removed
    }

    /// Put the actor on the ready queue unless it is already there (or is
    /// being polled right now; the polling worker re-checks the mailbox
    /// before releasing its claim).
    pub(crate) fn schedule(&self, cell: &ActorCell<T>) {
        if cell.mailbox.try_claim_schedule() {
            // Receiver only closes at system shutdown; at that point the
            // message is moot.
            let _ = self.inner.ready_tx.send(cell.id);
        }
    }
}
