//! Actor system: worker pool and lifecycle

use crate::actor::router::ActorCell;
use crate::actor::{ActorContext, ActorId, BoxedActor, Mailbox, Message, Router};
use crate::error::{Result, SystemError};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Sentinel id the shutdown path pushes onto the ready queue, one per
/// worker.
const SHUTDOWN_SENTINEL: ActorId = ActorId::MAX;

/// Tuning knobs for a [`System`].
#[derive(Debug, Clone)]
pub struct SystemConfig {
    /// Size of the worker pool.
    pub worker_count: usize,
    /// Default mailbox capacity for spawned actors.
    pub mailbox_capacity: usize,
    /// Maximum messages handed to one `poll` call.
    pub batch_size: usize,
    /// Wall-clock budget for one scheduling round of a single actor.
    pub poll_budget: Duration,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            worker_count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            mailbox_capacity: 256,
            batch_size: 64,
            poll_budget: Duration::from_millis(10),
        }
    }
}

/// Hosts actors on a fixed worker pool.
///
/// Must be created inside a tokio runtime. Dropping the system does not
/// stop running actors; call [`System::shutdown`] for an orderly exit.
pub struct System<T> {
    config: SystemConfig,
    router: Router<T>,
    stopped: Arc<AtomicBool>,
    workers: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl<T: Send + 'static> System<T> {
    /// Create the system and start its workers.
    pub fn new(name: impl Into<String>, config: SystemConfig) -> Self {
        let (ready_tx, ready_rx) = mpsc::unbounded_channel();
        let router = Router::new(name, ready_tx);
        let ready_rx = Arc::new(tokio::sync::Mutex::new(ready_rx));
        let stopped = Arc::new(AtomicBool::new(false));

        let mut workers = Vec::with_capacity(config.worker_count.max(1));
        for worker_id in 0..config.worker_count.max(1) {
            let worker = Worker {
                id: worker_id,
                router: router.clone(),
                ready_rx: Arc::clone(&ready_rx),
                batch_size: config.batch_size,
                poll_budget: config.poll_budget,
            };
            workers.push(tokio::spawn(worker.run()));
        }

        Self {
            config,
            router,
            stopped,
            workers: parking_lot::Mutex::new(workers),
        }
    }

    /// Router handle for this system.
    pub fn router(&self) -> Router<T> {
        self.router.clone()
    }

    /// Register an actor under `id` with the default mailbox capacity.
    pub fn spawn(&self, id: ActorId, actor: BoxedActor<T>) -> Result<()> {
        self.spawn_with_capacity(id, actor, self.config.mailbox_capacity)
    }

    /// Register an actor under `id` with an explicit mailbox capacity.
    pub fn spawn_with_capacity(
        &self,
        id: ActorId,
        actor: BoxedActor<T>,
        capacity: usize,
    ) -> Result<()> {
        if self.stopped.load(Ordering::Acquire) {
            return Err(SystemError::SystemStopped);
        }
        if id == SHUTDOWN_SENTINEL {
            return Err(SystemError::DuplicateActor(id));
        }
        let cell = Arc::new(ActorCell {
            id,
            mailbox: Mailbox::new(capacity),
            actor: tokio::sync::Mutex::new(Some(actor)),
            stop_requested: AtomicBool::new(false),
        });
        if !self.router.insert(id, cell) {
            return Err(SystemError::DuplicateActor(id));
        }
        debug!(system = %self.router.name(), actor = id, "actor spawned");
        Ok(())
    }

    /// Stop one actor: reject further sends, drain what is queued, deliver
    /// `Stop`, run `on_close`, remove from the router. Returns whether the
    /// actor existed. The id is reusable as soon as removal completes.
    pub fn stop(&self, id: ActorId) -> bool {
        let cell = match self.router.get(id) {
            Some(cell) => cell,
            None => return false,
        };
        cell.mailbox.mark_stopped();
        cell.stop_requested.store(true, Ordering::Release);
        cell.mailbox.force_send(Message::Stop);
        self.router.schedule(&cell);
        true
    }

    /// Stop every actor and terminate the workers once drained.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        for id in self.router.ids() {
            self.stop(id);
        }
        // Sentinels queue behind the stop work; each worker consumes exactly
        // one and exits.
        for _ in 0..self.config.worker_count.max(1) {
            self.router.push_ready(SHUTDOWN_SENTINEL);
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for handle in handles {
            if let Err(join_err) = handle.await {
                error!(error = %join_err, "actor system worker terminated abnormally");
            }
        }
    }

    /// Whether `shutdown` has been requested.
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

struct Worker<T> {
    id: usize,
    router: Router<T>,
    ready_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<ActorId>>>,
    batch_size: usize,
    poll_budget: Duration,
}

impl<T: Send + 'static> Worker<T> {
    async fn run(self) {
        loop {
            let actor_id = {
                let mut rx = self.ready_rx.lock().await;
                match rx.recv().await {
                    Some(id) => id,
                    None => break,
                }
            };
            if actor_id == SHUTDOWN_SENTINEL {
                break;
            }
            let cell = match self.router.get(actor_id) {
                Some(cell) => cell,
                None => continue,
            };
            self.poll_round(&cell).await;
        }
        debug!(worker = self.id, "actor system worker exited");
    }

    /// One scheduling round for one actor. The schedule claim held by the
    /// caller guarantees exclusivity, so taking the actor out of its cell
    /// never contends.
    async fn poll_round(&self, cell: &Arc<ActorCell<T>>) {
        let mut slot = cell.actor.lock().await;
        let mut actor = match slot.take() {
            Some(actor) => actor,
            None => {
                // Already closed by another round.
                cell.mailbox.release_schedule();
                return;
            }
        };
        drop(slot);

        let ctx = ActorContext { id: cell.id };
        let started = Instant::now();
        let mut alive = true;

        loop {
            let mut msgs = Vec::with_capacity(self.batch_size.min(16));
            cell.mailbox.drain(self.batch_size, &mut msgs);
            if msgs.is_empty() {
                break;
            }
            let first_kind = msgs[0].kind();
            match AssertUnwindSafe(actor.poll(&ctx, msgs)).catch_unwind().await {
                Ok(true) => {}
                Ok(false) => {
                    alive = false;
                    break;
                }
                Err(_) => {
                    error!(
                        system = %self.router.name(),
                        actor = cell.id,
                        message_kind = first_kind,
                        "actor panicked; stopping it"
                    );
                    alive = false;
                    break;
                }
            }
            if started.elapsed() >= self.poll_budget {
                break;
            }
        }

        // A requested stop completes once the queue is drained, even if the
        // actor keeps answering `true`.
        if alive
            && cell.stop_requested.load(Ordering::Acquire)
            && cell.mailbox.is_empty()
        {
            alive = false;
        }

        if !alive {
            cell.mailbox.mark_stopped();
            if let Err(_panic) = AssertUnwindSafe(actor.on_close()).catch_unwind().await {
                warn!(
                    system = %self.router.name(),
                    actor = cell.id,
                    "actor panicked in on_close"
                );
            }
            self.router.remove(cell.id);
            cell.mailbox.release_schedule();
            return;
        }

        // Put the actor back and release the claim; re-check afterwards so a
        // send racing with the release is never lost.
        *cell.actor.lock().await = Some(actor);
        cell.mailbox.release_schedule();
        if !cell.mailbox.is_empty() {
            self.router.schedule(cell);
        }
    }
}
