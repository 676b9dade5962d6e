// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Job queue engine.
//!
//! One dispatcher task feeds the head of the queue to the compute engine,
//! one job at a time, whenever the resource is `Ready`. All mutations go
//! through the store lock and are persisted before the lock is released, so
//! the on-disk snapshot always follows the in-memory order of operations.
//!
//! Lock order is store, then active dispatch. The per-step engine callback
//! only takes the store lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::entry::{output_file_name, Entry, EntryParams, EntryState};
use super::persist::PersistenceGateway;
use super::store::JobStore;
use crate::engine::{EngineHandle, JobOutput, JobRequest, StepControl, StepProgress};
use crate::error::{JobFailure, MalformedSnapshot, QueueError};
use crate::locks::{resilient_lock, resilient_read, resilient_write};
use crate::resource::ResourcePhase;

/// Capacity of the queue event broadcast channel.
const EVENT_CAPACITY: usize = 1024;

/// Receipt for an enqueued entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueToken {
    pub id: Uuid,
    /// Queue position at the time of enqueueing.
    pub position: usize,
}

/// The job currently inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActiveJob {
    pub id: Uuid,
    pub step: u32,
    pub total: u32,
}

/// Changes observers can follow.
#[derive(Debug, Clone, PartialEq)]
pub enum QueueEvent {
    Enqueued { id: Uuid, position: usize },
    Progress { id: Uuid, step: u32, total: u32 },
    StateChanged { id: Uuid, state: EntryState },
    Updated { id: Uuid },
    Inserted { id: Uuid },
    Removed { id: Uuid },
    Reordered { queue: Vec<Uuid> },
}

struct Dispatch {
    id: Uuid,
    cancel: Arc<AtomicBool>,
}

struct Inner {
    store: RwLock<JobStore>,
    gateway: Arc<dyn PersistenceGateway>,
    output_dir: PathBuf,
    active: Mutex<Option<Dispatch>>,
    active_tx: watch::Sender<Option<ActiveJob>>,
    events_tx: broadcast::Sender<QueueEvent>,
    work: Notify,
    stop: Notify,
    stopping: AtomicBool,
}

/// Durable, ordered queue of generation jobs.
///
/// Cheap to clone; clones share the same queue.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<Inner>,
}

impl JobQueue {
    /// Open the queue from persisted state.
    ///
    /// A missing or malformed snapshot starts from the default state. Any
    /// other load failure is returned so the real state is never overwritten.
    pub fn open(
        gateway: Arc<dyn PersistenceGateway>,
        output_dir: impl Into<PathBuf>,
    ) -> anyhow::Result<Self> {
        let store = match gateway.load() {
            Ok(Some(snapshot)) => {
                let store = JobStore::from_snapshot(snapshot);
                info!(
                    entries = store.entries().len(),
                    queued = store.queue().len(),
                    "loaded job state"
                );
                store
            }
            Ok(None) => JobStore::default(),
            Err(e) if e.downcast_ref::<MalformedSnapshot>().is_some() => {
                warn!("job state unreadable, starting fresh: {:#}", e);
                JobStore::default()
            }
            Err(e) => return Err(e.context("could not load job state")),
        };

        let (active_tx, _) = watch::channel(None);
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                store: RwLock::new(store),
                gateway,
                output_dir: output_dir.into(),
                active: Mutex::new(None),
                active_tx,
                events_tx,
                work: Notify::new(),
                stop: Notify::new(),
                stopping: AtomicBool::new(false),
            }),
        })
    }

    /// Append a job to the queue tail.
    ///
    /// `Creating` templates are rejected; use [`JobQueue::commit_prototype`].
    pub fn enqueue(&self, mut entry: Entry) -> Result<QueueToken, QueueError> {
        let id = entry.id();
        if entry.state() == EntryState::Creating {
            return Err(QueueError::NotQueueable(id));
        }
        if self.inner.active_id() == Some(id) {
            return Err(QueueError::Busy(id));
        }

        entry.state = EntryState::Queued;
        let position = {
            let mut store = resilient_write(&self.inner.store);
            store.upsert(entry);
            let position = store.push_queue(id);
            self.inner.persist(&store);
            position
        };

        debug!(%id, position, "enqueued");
        self.inner.emit(QueueEvent::Enqueued { id, position });
        self.inner.work.notify_one();
        Ok(QueueToken { id, position })
    }

    /// Cancel a queued or rendering job.
    ///
    /// A job inside the engine is stopped cooperatively at its next step; any
    /// other queued job leaves the queue immediately. Returns false when the
    /// entry had already finished, which makes late cancellation a no-op.
    pub fn cancel(&self, id: Uuid) -> Result<bool, QueueError> {
        let path = {
            let mut store = resilient_write(&self.inner.store);
            let entry = store.get_mut(id).ok_or(QueueError::UnknownEntry(id))?;
            if !entry.state().stays_in_queue() {
                return Ok(false);
            }
            entry.state = EntryState::Cancelled;

            if !self.inner.signal_abort(id) {
                store.remove_from_queue(id);
            }
            self.inner.persist(&store);
            self.inner.artifact_path(id)
        };

        remove_artifact(&path);
        info!(%id, "job cancelled");
        self.inner.emit(QueueEvent::StateChanged {
            id,
            state: EntryState::Cancelled,
        });
        Ok(true)
    }

    /// Move a queued id to the head. Does not interrupt a running job.
    pub fn reprioritize(&self, id: Uuid) -> bool {
        let queue = {
            let mut store = resilient_write(&self.inner.store);
            if !store.move_to_front(id) {
                return false;
            }
            self.inner.persist(&store);
            store.queue().to_vec()
        };
        debug!(%id, "moved to queue head");
        self.inner.emit(QueueEvent::Reordered { queue });
        true
    }

    /// Delete an entry. A rendering job is aborted; the artifact is removed.
    pub fn delete(&self, id: Uuid) -> Result<Entry, QueueError> {
        let entry = {
            let mut store = resilient_write(&self.inner.store);
            let entry = store.remove(id).ok_or(QueueError::UnknownEntry(id))?;
            self.inner.signal_abort(id);
            self.inner.persist(&store);
            entry
        };

        remove_artifact(&entry.output_path(&self.inner.output_dir));
        info!(%id, "entry deleted");
        self.inner.emit(QueueEvent::Removed { id });
        Ok(entry)
    }

    /// Replace an entry's parameters. The seed is resolved again.
    ///
    /// Only entries that have not started rendering can be edited: queued
    /// jobs outside the engine and prototypes.
    pub fn update_parameters(&self, id: Uuid, params: EntryParams) -> Result<(), QueueError> {
        {
            let mut store = resilient_write(&self.inner.store);
            let active = self.inner.active_id();
            let entry = store.get_mut(id).ok_or(QueueError::UnknownEntry(id))?;
            match entry.state() {
                EntryState::Queued if active == Some(id) => return Err(QueueError::Busy(id)),
                EntryState::Queued | EntryState::Creating | EntryState::Cloning { .. } => {}
                EntryState::Rendering { .. } => return Err(QueueError::Busy(id)),
                EntryState::Done
                | EntryState::Cancelled
                | EntryState::Error
                | EntryState::Blocked => return Err(QueueError::Rendered(id)),
            }
            entry.set_params(params);
            self.inner.persist(&store);
        }
        self.inner.emit(QueueEvent::Updated { id });
        Ok(())
    }

    /// Turn a `Creating` or `Cloning` prototype into a real queued job.
    ///
    /// A `Creating` template stays in place; a `Cloning` copy is replaced by
    /// the new job at the same position.
    pub fn commit_prototype(&self, prototype_id: Uuid) -> Result<QueueToken, QueueError> {
        let (id, position, replaced) = {
            let mut store = resilient_write(&self.inner.store);
            let prototype = store
                .get(prototype_id)
                .ok_or(QueueError::UnknownEntry(prototype_id))?;
            let replaced = match prototype.state() {
                EntryState::Creating => false,
                EntryState::Cloning { .. } => true,
                _ => return Err(QueueError::NotQueueable(prototype_id)),
            };

            let job = prototype.clone_as_queued();
            let id = job.id();
            if replaced {
                store.insert_after(prototype_id, job);
                store.remove(prototype_id);
            } else {
                store.upsert(job);
            }
            let position = store.push_queue(id);
            self.inner.persist(&store);
            (id, position, replaced)
        };

        if replaced {
            self.inner.emit(QueueEvent::Removed { id: prototype_id });
        }
        self.inner.emit(QueueEvent::Enqueued { id, position });
        self.inner.work.notify_one();
        Ok(QueueToken { id, position })
    }

    /// Queue a copy of a finished entry with a new random seed, listed right
    /// after the source.
    pub fn random_variant(&self, source_id: Uuid) -> Result<QueueToken, QueueError> {
        let (id, position) = {
            let mut store = resilient_write(&self.inner.store);
            let source = store
                .get(source_id)
                .ok_or(QueueError::UnknownEntry(source_id))?;
            if source.state() != EntryState::Done {
                return Err(QueueError::NotFinished(source_id));
            }
            let variant = source.random_variant();
            let id = variant.id();
            store.insert_after(source_id, variant);
            let position = store.push_queue(id);
            self.inner.persist(&store);
            (id, position)
        };

        self.inner.emit(QueueEvent::Enqueued { id, position });
        self.inner.work.notify_one();
        Ok(QueueToken { id, position })
    }

    /// Insert an editable, unqueued copy right after a finished entry.
    pub fn insert_editable_prototype(&self, source_id: Uuid) -> Result<Uuid, QueueError> {
        let id = {
            let mut store = resilient_write(&self.inner.store);
            let source = store
                .get(source_id)
                .ok_or(QueueError::UnknownEntry(source_id))?;
            if source.state() != EntryState::Done {
                return Err(QueueError::NotFinished(source_id));
            }
            let prototype = source.editable_prototype();
            let id = prototype.id();
            store.insert_after(source_id, prototype);
            self.inner.persist(&store);
            id
        };
        self.inner.emit(QueueEvent::Inserted { id });
        Ok(id)
    }

    /// Every entry in display order.
    pub fn entries(&self) -> Vec<Entry> {
        resilient_read(&self.inner.store).entries().to_vec()
    }

    pub fn get(&self, id: Uuid) -> Option<Entry> {
        resilient_read(&self.inner.store).get(id).cloned()
    }

    /// Pending ids in dispatch order.
    pub fn queued_ids(&self) -> Vec<Uuid> {
        resilient_read(&self.inner.store).queue().to_vec()
    }

    /// The `Creating` template, if any.
    pub fn prototype(&self) -> Option<Entry> {
        resilient_read(&self.inner.store)
            .entries()
            .iter()
            .find(|e| e.state() == EntryState::Creating)
            .cloned()
    }

    /// Resolve a full id or a unique id prefix.
    pub fn resolve_id(&self, prefix: &str) -> Result<Uuid, QueueError> {
        let prefix = prefix.trim().to_ascii_lowercase();
        let store = resilient_read(&self.inner.store);
        let mut matches = store
            .entries()
            .iter()
            .map(|e| e.id())
            .filter(|id| !prefix.is_empty() && id.to_string().starts_with(&prefix));
        match (matches.next(), matches.next()) {
            (Some(id), None) => Ok(id),
            (Some(_), Some(_)) => Err(QueueError::AmbiguousId(prefix)),
            (None, _) => Err(QueueError::UnknownPrefix(prefix)),
        }
    }

    /// Where the artifact for `id` is written.
    pub fn output_path(&self, id: Uuid) -> PathBuf {
        self.inner.artifact_path(id)
    }

    /// The job currently inside the engine with its step progress.
    pub fn active(&self) -> Option<ActiveJob> {
        *self.inner.active_tx.borrow()
    }

    pub fn watch_active(&self) -> watch::Receiver<Option<ActiveJob>> {
        self.inner.active_tx.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events_tx.subscribe()
    }

    /// True when nothing is waiting or rendering.
    pub fn is_idle(&self) -> bool {
        self.active().is_none() && !resilient_read(&self.inner.store).has_dispatchable()
    }

    /// Spawn the dispatcher. It runs until [`JobQueue::stop`] is called or the
    /// resource shuts down.
    pub fn start_dispatch(&self, phase: watch::Receiver<ResourcePhase>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move { queue.dispatch_loop(phase).await })
    }

    /// Stop dispatching. A job inside the engine is interrupted and stays
    /// queued so it runs again after restart.
    pub fn stop(&self) {
        if self.inner.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("stopping dispatcher");
        if let Some(dispatch) = resilient_lock(&self.inner.active).as_ref() {
            dispatch.cancel.store(true, Ordering::SeqCst);
        }
        self.inner.stop.notify_one();
    }

    async fn dispatch_loop(self, mut phase: watch::Receiver<ResourcePhase>) {
        debug!("dispatcher started");
        loop {
            if self.inner.stopping.load(Ordering::SeqCst) {
                break;
            }

            if !resilient_read(&self.inner.store).has_dispatchable() {
                tokio::select! {
                    _ = self.inner.work.notified() => continue,
                    _ = self.inner.stop.notified() => break,
                }
            }

            let engine = tokio::select! {
                engine = ready_engine(&mut phase) => engine,
                _ = self.inner.stop.notified() => break,
            };
            let Some(engine) = engine else {
                info!("resource shut down, dispatcher exiting");
                break;
            };

            let Some((request, cancel)) = self.inner.begin_next() else {
                continue;
            };
            self.run_job(engine, request, cancel).await;
        }
        debug!("dispatcher stopped");
    }

    async fn run_job(&self, engine: EngineHandle, request: JobRequest, cancel: Arc<AtomicBool>) {
        let id = request.id;
        info!(%id, steps = request.steps, seed = request.seed, "rendering");

        let inner = Arc::clone(&self.inner);
        let result = tokio::task::spawn_blocking(move || {
            let mut on_step = |progress: StepProgress| inner.on_step(id, &cancel, progress);
            engine.run(&request, &mut on_step)
        })
        .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(e) => Err(JobFailure::Failed(format!("engine panicked: {}", e))),
        };
        self.inner.finish(id, outcome).await;
    }
}

impl Inner {
    fn artifact_path(&self, id: Uuid) -> PathBuf {
        self.output_dir.join(output_file_name(id))
    }

    fn active_id(&self) -> Option<Uuid> {
        resilient_lock(&self.active).as_ref().map(|d| d.id)
    }

    /// Raise the abort flag if `id` is inside the engine.
    fn signal_abort(&self, id: Uuid) -> bool {
        match resilient_lock(&self.active).as_ref() {
            Some(dispatch) if dispatch.id == id => {
                dispatch.cancel.store(true, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    fn persist(&self, store: &JobStore) {
        if let Err(e) = self.gateway.save(&store.to_snapshot()) {
            warn!("failed to persist job state: {:#}", e);
        }
    }

    fn emit(&self, event: QueueEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Claim the queue head for dispatch and mark it rendering.
    fn begin_next(&self) -> Option<(JobRequest, Arc<AtomicBool>)> {
        let mut store = resilient_write(&self.store);
        let (next, dropped) = store.next_dispatchable();
        let Some(id) = next else {
            if dropped > 0 {
                self.persist(&store);
            }
            return None;
        };

        let entry = store.get_mut(id)?;
        let total = entry.params().steps;
        entry.state = EntryState::Rendering { step: 0, total };
        let request = entry.to_request();

        let cancel = Arc::new(AtomicBool::new(false));
        *resilient_lock(&self.active) = Some(Dispatch {
            id,
            cancel: Arc::clone(&cancel),
        });
        self.persist(&store);
        drop(store);

        self.active_tx.send_replace(Some(ActiveJob { id, step: 0, total }));
        self.emit(QueueEvent::StateChanged {
            id,
            state: EntryState::Rendering { step: 0, total },
        });
        Some((request, cancel))
    }

    /// Per-step handshake from the engine thread.
    fn on_step(&self, id: Uuid, cancel: &AtomicBool, progress: StepProgress) -> StepControl {
        if cancel.load(Ordering::SeqCst) {
            return StepControl::Abort;
        }
        {
            let mut store = resilient_write(&self.store);
            match store.get_mut(id) {
                Some(entry) if entry.state().stays_in_queue() => {
                    entry.state = EntryState::Rendering {
                        step: progress.step,
                        total: progress.total,
                    };
                }
                _ => return StepControl::Abort,
            }
        }

        self.active_tx.send_replace(Some(ActiveJob {
            id,
            step: progress.step,
            total: progress.total,
        }));
        self.emit(QueueEvent::Progress {
            id,
            step: progress.step,
            total: progress.total,
        });
        StepControl::Continue
    }

    async fn finish(&self, id: Uuid, outcome: Result<JobOutput, JobFailure>) {
        let path = self.artifact_path(id);
        let outcome = match outcome {
            Ok(output) => match write_artifact(&path, &output.bytes).await {
                Ok(()) => Ok(()),
                Err(e) => Err(JobFailure::Failed(format!(
                    "could not write {}: {}",
                    path.display(),
                    e
                ))),
            },
            Err(failure) => Err(failure),
        };

        let interrupted = matches!(outcome, Err(JobFailure::Aborted))
            && self.stopping.load(Ordering::SeqCst);

        let final_state = {
            let mut store = resilient_write(&self.store);
            let final_state = match store.get_mut(id) {
                None => None,
                Some(entry) if entry.state() == EntryState::Cancelled => Some(EntryState::Cancelled),
                Some(entry) => {
                    entry.state = match &outcome {
                        Ok(()) => EntryState::Done,
                        Err(JobFailure::Aborted) if interrupted => EntryState::Queued,
                        Err(JobFailure::Aborted) => EntryState::Cancelled,
                        Err(JobFailure::Rejected(_)) => EntryState::Blocked,
                        Err(JobFailure::Failed(_)) => EntryState::Error,
                    };
                    Some(entry.state())
                }
            };
            if final_state != Some(EntryState::Queued) {
                store.remove_from_queue(id);
            }
            *resilient_lock(&self.active) = None;
            self.persist(&store);
            final_state
        };

        if final_state != Some(EntryState::Done) {
            remove_artifact(&path);
        }
        self.active_tx.send_replace(None);

        match (&final_state, &outcome) {
            (Some(EntryState::Done), _) => info!(%id, path = %path.display(), "job done"),
            (Some(EntryState::Queued), _) => info!(%id, "job interrupted, left queued"),
            (Some(state), Err(failure)) => info!(%id, state = state.label(), "job ended: {}", failure),
            (Some(state), Ok(())) => info!(%id, state = state.label(), "job ended"),
            (None, _) => info!(%id, "deleted entry finished rendering"),
        }
        match final_state {
            Some(state) => self.emit(QueueEvent::StateChanged { id, state }),
            None => self.emit(QueueEvent::Removed { id }),
        }
    }
}

/// Wait for `Ready` and take its engine. `None` once the resource shuts down.
async fn ready_engine(phase: &mut watch::Receiver<ResourcePhase>) -> Option<EngineHandle> {
    let ready = phase
        .wait_for(|p| p.is_ready() || matches!(p, ResourcePhase::ShutDown))
        .await;
    match ready {
        Ok(current) => current.engine(),
        Err(_) => None,
    }
}

async fn write_artifact(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let temp_path = path.with_extension("part");
    tokio::fs::write(&temp_path, bytes).await?;
    tokio::fs::rename(&temp_path, path).await
}

/// Best-effort artifact cleanup. Failures are logged, never raised.
fn remove_artifact(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed artifact"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "could not remove artifact: {}", e),
    }
}
