// src/scheduler/mod.rs

//! The scheduler: an explicitly constructed handle over a [`Store`].
//!
//! Layout:
//! - [`lifecycle`] holds the state machine: submission, dependency
//!   propagation, end of job, stop / restart / delete, reconciliation.
//! - [`launch`] selects the next READY job and runs the lock protocol.
//! - [`runner`] contains the background tasks started by
//!   [`Scheduler::start`]: the runner loop, the message pump and the
//!   periodic reconciliation.
//! - [`backoff`] defers jobs whose locks could not be taken.
//!
//! Every operation opens one store transaction, which also serialises it
//! against the others. Transactions never live across an `.await`.

pub mod backoff;
mod launch;
mod lifecycle;
mod runner;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::connector::{Connector, ConnectorId, Connectors};
use crate::dependency::{Dependency, DependencyKey, DependencyKind};
use crate::errors::{Result, SchedulerError};
use crate::exec::{JobProcess, JobRunner};
use crate::lock::{Lock, LockTarget};
use crate::resource::{Message, MessageSender, Resource, ResourceId, ResourceState};
use crate::store::Store;

pub use backoff::{BackoffPolicy, LockBackoff};

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// Owner recorded in the locks this scheduler takes.
    pub pid: String,
    /// Period of the reconciliation pass.
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            pid: std::process::id().to_string(),
            poll_interval: Duration::from_secs(5),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// One inbound edge of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Requirement {
    pub from: ResourceId,
    pub kind: DependencyKind,
}

impl Requirement {
    pub fn read(from: ResourceId) -> Self {
        Self {
            from,
            kind: DependencyKind::ReadWrite,
        }
    }

    pub fn exclusive(from: ResourceId) -> Self {
        Self {
            from,
            kind: DependencyKind::Exclusive,
        }
    }

    pub fn tokens(from: ResourceId, tokens: u32) -> Self {
        Self {
            from,
            kind: DependencyKind::CountToken { tokens },
        }
    }
}

/// Outcome of one [`Scheduler::launch_next`] attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// No READY job is eligible.
    Idle,
    Started(ResourceId),
    /// The done marker was already there; nothing was spawned.
    AlreadyDone(ResourceId),
    /// Locks were unavailable; the job was put back to WAITING.
    Requeued(ResourceId),
    /// The job could not be started and is now in ERROR.
    Failed(ResourceId),
}

#[derive(Debug)]
struct RunningJob {
    process: Box<dyn JobProcess>,
    /// The job's own lock file first, then its dependency locks.
    locks: Vec<Lock>,
}

pub(crate) struct Inner {
    store: Arc<Store>,
    connectors: Connectors,
    runner: Arc<dyn JobRunner>,
    options: SchedulerOptions,
    /// Serialises dependency lock acquisition across jobs.
    lock_sync: Mutex<()>,
    processes: Mutex<HashMap<ResourceId, RunningJob>>,
    backoff: Mutex<LockBackoff>,
    messages: MessageSender,
    inbox: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    stopping: AtomicBool,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

fn relock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn connector_for(&self, resource: &Resource) -> Result<Arc<dyn Connector>> {
        Ok(self.connectors.get(&resource.connector)?)
    }

    fn processes(&self) -> MutexGuard<'_, HashMap<ResourceId, RunningJob>> {
        relock(&self.processes)
    }

    fn backoff(&self) -> MutexGuard<'_, LockBackoff> {
        relock(&self.backoff)
    }

    /// Locks were given back: every deferred job may now succeed.
    fn locks_released(&self) {
        self.backoff().clear_all();
        self.store.runners().notify_one();
    }
}

/// Handle on a running scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("store", &self.inner.store)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    /// Build a scheduler over `store`.
    ///
    /// Locks reloaded from a snapshot are bound again to their connectors and
    /// token counters, and token usage is recounted from them.
    pub fn new(
        store: Arc<Store>,
        connectors: Connectors,
        runner: Arc<dyn JobRunner>,
        options: SchedulerOptions,
    ) -> Result<Self> {
        rebind_locks(&store, &connectors)?;

        let (messages, inbox) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let backoff = LockBackoff::new(options.backoff);
        Ok(Self {
            inner: Arc::new(Inner {
                store,
                connectors,
                runner,
                options,
                lock_sync: Mutex::new(()),
                processes: Mutex::new(HashMap::new()),
                backoff: Mutex::new(backoff),
                messages,
                inbox: Mutex::new(Some(inbox)),
                stopping: AtomicBool::new(false),
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        })
    }

    /// Open (or create) a store snapshot at `path` and build a scheduler on it.
    pub fn open(
        path: impl Into<PathBuf>,
        connectors: Connectors,
        runner: Arc<dyn JobRunner>,
        options: SchedulerOptions,
    ) -> Result<Self> {
        let store = Store::open(path)?;
        Self::new(Arc::new(store), connectors, runner, options)
    }

    /// Spawn the runner loop, the message pump and the reconciliation task.
    ///
    /// Must be called from within a tokio runtime, once.
    pub fn start(&self) -> Result<()> {
        let inbox = relock(&self.inner.inbox)
            .take()
            .ok_or_else(|| SchedulerError::Other(anyhow::anyhow!("scheduler already started")))?;

        let handles = vec![
            tokio::spawn(runner::run_loop(self.clone(), self.inner.shutdown.subscribe())),
            tokio::spawn(runner::pump_messages(
                self.clone(),
                inbox,
                self.inner.shutdown.subscribe(),
            )),
            tokio::spawn(runner::reconcile_loop(
                self.clone(),
                self.inner.shutdown.subscribe(),
            )),
        ];
        relock(&self.inner.tasks).extend(handles);
        info!(pid = %self.inner.options.pid, "scheduler started");
        Ok(())
    }

    /// Stop the background tasks. Running processes are left alone; their
    /// markers let a later scheduler pick up the results.
    pub async fn shutdown(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("scheduler shutting down");
        self.inner.shutdown.send_replace(true);
        self.inner.store.runners().notify_waiters();

        let tasks = std::mem::take(&mut *relock(&self.inner.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "scheduler task ended abnormally");
            }
        }
        info!("scheduler stopped");
    }

    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    // ---- entry points ----------------------------------------------------

    /// Store `resource` with its requirements and evaluate it.
    ///
    /// A resource whose connector and path are already known replaces the
    /// stored one (keeping its id) if that one is in an updatable state.
    pub fn submit(&self, resource: Resource, requirements: Vec<Requirement>) -> Result<ResourceId> {
        let mut tx = self.inner.store.begin();
        let id = self.inner.submit(&mut tx, resource, &requirements)?;
        tx.commit()?;
        Ok(id)
    }

    /// Deliver a message to the state machine.
    pub fn notify(&self, message: Message) -> Result<()> {
        debug!(?message, "notify");
        let mut tx = self.inner.store.begin();
        self.inner.handle_message(&mut tx, message)?;
        tx.commit()
    }

    /// Sender process monitors use to report `EndOfJob`.
    pub fn message_sender(&self) -> MessageSender {
        self.inner.messages.clone()
    }

    /// Handle the messages process monitors have queued so far.
    ///
    /// Only does something before [`start`](Self::start); afterwards the
    /// message pump owns the queue.
    pub fn process_messages(&self) -> Result<usize> {
        let mut inbox = relock(&self.inner.inbox);
        let Some(rx) = inbox.as_mut() else {
            return Ok(0);
        };
        let mut handled = 0;
        while let Ok(message) = rx.try_recv() {
            self.notify(message)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Stop a job: kill it if RUNNING, hold it if READY or WAITING.
    /// Returns false when the job was in neither situation.
    pub fn stop(&self, id: ResourceId) -> Result<bool> {
        let mut tx = self.inner.store.begin();
        let stopped = self.inner.stop(&mut tx, id)?;
        tx.commit()?;
        Ok(stopped)
    }

    /// Put a finished or held job back to WAITING, removing its generated
    /// markers. Returns false for active jobs.
    pub fn restart(&self, id: ResourceId) -> Result<bool> {
        let mut tx = self.inner.store.begin();
        let restarted = self.inner.restart(&mut tx, id)?;
        tx.commit()?;
        Ok(restarted)
    }

    pub fn delete(&self, id: ResourceId, recursive: bool) -> Result<()> {
        let mut tx = self.inner.store.begin();
        self.inner.delete(&mut tx, id, recursive)?;
        tx.commit()
    }

    pub fn set_token_limit(&self, id: ResourceId, limit: u32) -> Result<()> {
        let mut tx = self.inner.store.begin();
        let unblocked = self.inner.set_token_limit(&mut tx, id, limit)?;
        tx.commit()?;
        if unblocked {
            self.inner.locks_released();
        }
        Ok(())
    }

    /// Re-read on-disk markers and repair drifted states.
    pub fn reconcile(&self) -> Result<()> {
        let mut tx = self.inner.store.begin();
        self.inner.reconcile(&mut tx)?;
        tx.commit()
    }

    /// Try to start the best READY job.
    pub fn launch_next(&self) -> Result<Launch> {
        self.inner.launch_next()
    }

    pub fn notify_runners(&self) {
        self.inner.store.runners().notify_one();
    }

    // ---- queries ---------------------------------------------------------

    pub fn store(&self) -> &Arc<Store> {
        &self.inner.store
    }

    pub fn resource(&self, id: ResourceId) -> Option<Resource> {
        self.inner.store.begin().get(id).cloned()
    }

    pub fn dependency(&self, key: DependencyKey) -> Option<Dependency> {
        self.inner.store.begin().dependency(key).cloned()
    }

    /// Id of the resource stored at `path` on `connector`.
    pub fn find(&self, connector: &ConnectorId, path: &Path) -> Option<ResourceId> {
        self.inner.store.begin().find_by_path(connector, path)
    }

    pub fn state(&self, id: ResourceId) -> Option<ResourceState> {
        self.inner.store.begin().get(id).map(Resource::state)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Message> {
        self.inner.store.subscribe()
    }

    /// True when no job is READY, LOCKING or RUNNING.
    pub fn is_idle(&self) -> bool {
        let tx = self.inner.store.begin();
        let busy = tx.ids_in_states(&[
            ResourceState::Ready,
            ResourceState::Locking,
            ResourceState::Running,
        ]);
        busy.iter().all(|id| tx.get(*id).is_some_and(|r| !r.is_job()))
    }

    /// Jobs with a live process handle.
    pub fn running_jobs(&self) -> Vec<ResourceId> {
        let mut ids: Vec<_> = self.inner.processes().keys().copied().collect();
        ids.sort();
        ids
    }
}

/// Attach reloaded locks to live connectors and counters, then recount the
/// tokens held.
fn rebind_locks(store: &Store, connectors: &Connectors) -> Result<()> {
    let tx = store.begin();
    let mut used: HashMap<ResourceId, u32> = HashMap::new();

    for dependency in tx.dependencies() {
        let Some(lock) = dependency.lock().filter(|l| !l.is_released()) else {
            continue;
        };
        match lock.target() {
            LockTarget::File { connector, .. } | LockTarget::Status { connector, .. } => {
                if !lock.is_bound() {
                    lock.bind_connector(connectors.get(connector)?);
                }
            }
            LockTarget::Token { token, tokens } => {
                let resource = tx.resource(*token)?;
                let details = resource.as_token().ok_or_else(|| {
                    SchedulerError::invalid_state(*token, resource.state(), "lock targets a non-token")
                })?;
                if !lock.is_bound() {
                    lock.bind_counter(Arc::clone(details.counter()));
                }
                *used.entry(*token).or_default() += tokens;
            }
        }
    }

    for resource in tx.resources() {
        if let (Some(id), Some(token)) = (resource.id(), resource.as_token()) {
            let held = used.get(&id).copied().unwrap_or(0);
            if token.used() != held {
                info!(token = %id, stored = token.used(), held, "token usage recounted");
            }
            token.counter().set_used(held);
        }
    }
    Ok(())
}
