//! The scheduler: pending queue, running set, recently-completed ring, and
//! every job state transition.
//!
//! One task owns the collections and runs both the periodic tick and the
//! event inbox through `select!`. Admin mutations enter through short
//! critical sections on the state lock; nothing ever suspends while a lock is
//! held. The config store is written before a mutation is acknowledged to the
//! caller, and terminal transitions persist before completion watchers are
//! notified.
//!
//! # Architecture
//!
//! ```text
//! AccessPoints ──► schedule / cancel / pause ──┐
//!                                              ▼
//! tick (~1s) ──► persist dirty ──► dispatch eligible ──► police running
//!                                              ▲
//! client tasks ──► SchedulerEvent inbox ───────┘
//!     (Registered, StatsChunk, JobCompleted, Disconnected)
//! ```

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::common::error::{CoreError, CoreResult};
use crate::common::id::{IdAllocator, JobId, OptimizingJobId};
use crate::fleet::{
    ClientCommand, ClientId, ClientKind, ClientRegistry, JobDispatch, PickError, PickedClient,
};
use crate::jobs::{ClientStats, DependencyRef, Job, JobState, JobTemplate};
use crate::plugins::PluginRegistry;
use crate::store::ConfigStore;

use super::events::SchedulerEvent;

/// Tunables for the scheduler loop.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub tick_interval: Duration,
    /// How long a job may wait for an explicitly requested client before it
    /// is failed.
    pub max_client_wait: Duration,
    /// How long stopped clients get to acknowledge before being abandoned.
    pub shutdown_grace: Duration,
    pub recently_completed_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            max_client_wait: Duration::from_secs(300),
            shutdown_grace: Duration::from_secs(10),
            recently_completed_capacity: 10,
        }
    }
}

struct PendingEntry {
    seq: u64,
    job: Job,
}

struct RunningJob {
    job: Job,
    /// Active worker set: client id to address.
    clients: HashMap<ClientId, String>,
    /// Clients that reported their terminal state.
    done: HashSet<ClientId>,
    monitors: HashSet<ClientId>,
    any_failed: bool,
    /// Terminal state to enter once every client settles.
    stop_target: Option<JobState>,
    stop_sent_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl RunningJob {
    fn all_done(&self) -> bool {
        self.done.len() >= self.clients.len()
    }
}

#[derive(Default)]
struct SchedulerState {
    pending: Vec<PendingEntry>,
    running: HashMap<JobId, RunningJob>,
    recently_completed: VecDeque<Job>,
    dirty: HashSet<JobId>,
    next_seq: u64,
}

impl SchedulerState {
    fn insert_pending(&mut self, job: Job) {
        let entry = PendingEntry {
            seq: self.next_seq,
            job,
        };
        self.next_seq += 1;

        let key = (entry.job.spec.start_time, entry.seq);
        let position = self
            .pending
            .partition_point(|e| (e.job.spec.start_time, e.seq) <= key);
        self.pending.insert(position, entry);
    }

    fn take_pending(&mut self, id: &JobId) -> Option<Job> {
        let index = self.pending.iter().position(|e| &e.job.id == id)?;
        Some(self.pending.remove(index).job)
    }

    fn pending_mut(&mut self, id: &JobId) -> Option<&mut Job> {
        self.pending
            .iter_mut()
            .map(|e| &mut e.job)
            .find(|j| &j.id == id)
    }

    fn find_job(&self, id: &JobId) -> Option<&Job> {
        self.pending
            .iter()
            .map(|e| &e.job)
            .find(|j| &j.id == id)
            .or_else(|| self.running.get(id).map(|r| &r.job))
            .or_else(|| self.recently_completed.iter().find(|j| &j.id == id))
    }

    fn retire(&mut self, job: Job, capacity: usize) {
        self.dirty.remove(&job.id);
        self.recently_completed.push_back(job);
        while self.recently_completed.len() > capacity {
            self.recently_completed.pop_front();
        }
    }
}

pub struct Scheduler {
    config: SchedulerConfig,
    store: Arc<dyn ConfigStore>,
    registry: Arc<ClientRegistry>,
    ids: Arc<IdAllocator>,
    plugins: Arc<PluginRegistry>,
    state: RwLock<SchedulerState>,
    watchers: Mutex<HashMap<JobId, Vec<oneshot::Sender<Job>>>>,
    events_tx: mpsc::UnboundedSender<SchedulerEvent>,
    events_rx: Mutex<Option<mpsc::UnboundedReceiver<SchedulerEvent>>>,
    shutdown: CancellationToken,
    unavailable: AtomicBool,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        store: Arc<dyn ConfigStore>,
        registry: Arc<ClientRegistry>,
        ids: Arc<IdAllocator>,
        plugins: Arc<PluginRegistry>,
        events_tx: mpsc::UnboundedSender<SchedulerEvent>,
        events_rx: mpsc::UnboundedReceiver<SchedulerEvent>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            ids,
            plugins,
            state: RwLock::new(SchedulerState::default()),
            watchers: Mutex::new(HashMap::new()),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            shutdown,
            unavailable: AtomicBool::new(false),
        }
    }

    /// Sender used by client connection tasks to post events.
    pub fn event_sender(&self) -> mpsc::UnboundedSender<SchedulerEvent> {
        self.events_tx.clone()
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn is_available(&self) -> bool {
        !self.unavailable.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> CoreResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(CoreError::ConfigStore(crate::store::StoreError::Backend(
                "scheduler halted after a config store failure".into(),
            )))
        }
    }

    fn halt(&self, err: &CoreError) {
        error!(error = %err, "fatal config store failure; halting scheduler");
        self.unavailable.store(true, Ordering::SeqCst);
        self.shutdown.cancel();
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, SchedulerState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, SchedulerState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Validate, persist, and enqueue a job. Returns the new ID.
    pub async fn schedule_job(&self, template: JobTemplate) -> CoreResult<JobId> {
        self.schedule_job_opts(template, false, None).await
    }

    /// Schedule with controller-level options: create the job `Disabled`
    /// (paused optimizing jobs do this) and/or tie it to an optimizing
    /// parent.
    pub(crate) async fn schedule_job_opts(
        &self,
        template: JobTemplate,
        disabled: bool,
        parent: Option<OptimizingJobId>,
    ) -> CoreResult<JobId> {
        self.ensure_available()?;
        template.validate()?;

        if !self.plugins.has_job_class(&template.job_class) {
            return Err(CoreError::UnknownJobClass(template.job_class));
        }
        if let Some(job_class) = self.plugins.job_class(&template.job_class) {
            job_class.validate_parameters(&template.parameters)?;
        }
        self.check_dependencies(&template.dependencies).await?;

        let id = self.ids.next_job_id().await?;
        let mut job = Job::from_template(id.clone(), template);
        job.optimizing_parent = parent;
        job.transition(JobState::NotYetStarted)?;
        if disabled {
            job.transition(JobState::Disabled)?;
        }

        // Write before acknowledging the mutation.
        self.store.put_job(&job).await.map_err(CoreError::from)?;

        info!(job_id = %job.id, job_class = %job.spec.job_class, state = %job.state, "job scheduled");
        self.write().insert_pending(job);
        Ok(id)
    }

    /// Every referenced dependency must exist; unknown IDs are rejected.
    async fn check_dependencies(&self, dependencies: &[DependencyRef]) -> CoreResult<()> {
        for dependency in dependencies {
            let known = match dependency {
                DependencyRef::Job(id) => {
                    self.read().find_job(id).is_some() || self.store.get_job(id).await?.is_some()
                }
                DependencyRef::OptimizingJob(id) => {
                    self.store.get_optimizing_job(id).await?.is_some()
                }
            };
            if !known {
                return Err(CoreError::InvalidDependency(format!(
                    "{} does not exist",
                    dependency
                )));
            }
        }
        Ok(())
    }

    /// Cancel a job: pending jobs end `Cancelled` immediately, running jobs
    /// get a stop signal and end `StoppedByUser` once their clients settle.
    pub async fn cancel_job(&self, id: &JobId) -> CoreResult<()> {
        self.ensure_available()?;

        let retired = {
            let mut state = self.write();
            if let Some(mut job) = state.take_pending(id) {
                job.transition(JobState::Cancelled)?;
                job.stop_reason = Some("cancelled by user".into());
                state.retire(job.clone(), self.config.recently_completed_capacity);
                Some(job)
            } else if state.running.contains_key(id) {
                None
            } else if let Some(job) = state.find_job(id) {
                return Err(CoreError::NotCancellable(format!(
                    "job {} already {}",
                    id, job.state
                )));
            } else {
                return Err(CoreError::NotFound(format!("job {}", id)));
            }
        };

        match retired {
            Some(job) => {
                self.persist_terminal(&job).await?;
                self.fire_watchers(&job);
                info!(job_id = %id, "pending job cancelled");
                Ok(())
            }
            None => {
                self.request_stop(id, JobState::StoppedByUser, "cancelled by user")
                    .await
            }
        }
    }

    /// Pause a pending job (`NotYetStarted` -> `Disabled`).
    pub async fn pause_job(&self, id: &JobId) -> CoreResult<()> {
        self.ensure_available()?;
        let job = {
            let mut state = self.write();
            if state.running.contains_key(id) {
                return Err(CoreError::NotPausable(format!("job {} is running", id)));
            }
            match state.pending_mut(id) {
                Some(job) => {
                    if job.state != JobState::NotYetStarted {
                        return Err(CoreError::NotPausable(format!(
                            "job {} is {}",
                            id, job.state
                        )));
                    }
                    job.transition(JobState::Disabled)?;
                    job.clone()
                }
                None => return Err(CoreError::NotFound(format!("job {}", id))),
            }
        };

        self.store.put_job(&job).await.map_err(CoreError::from)?;
        info!(job_id = %id, "job paused");
        Ok(())
    }

    /// Resume a paused job (`Disabled` -> `NotYetStarted`).
    pub async fn unpause_job(&self, id: &JobId) -> CoreResult<()> {
        self.ensure_available()?;
        let job = {
            let mut state = self.write();
            match state.pending_mut(id) {
                Some(job) => {
                    if job.state != JobState::Disabled {
                        return Err(CoreError::NotPausable(format!(
                            "job {} is {}",
                            id, job.state
                        )));
                    }
                    job.transition(JobState::NotYetStarted)?;
                    job.clone()
                }
                None => return Err(CoreError::NotFound(format!("job {}", id))),
            }
        };

        self.store.put_job(&job).await.map_err(CoreError::from)?;
        info!(job_id = %id, "job unpaused");
        Ok(())
    }

    pub async fn get_job(&self, id: &JobId) -> CoreResult<Job> {
        if let Some(job) = self.read().find_job(id) {
            return Ok(job.clone());
        }
        self.store
            .get_job(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("job {}", id)))
    }

    /// Delete a job record. Active jobs must be cancelled first.
    pub async fn remove_job(&self, id: &JobId) -> CoreResult<()> {
        self.ensure_available()?;
        {
            let state = self.read();
            let active = state.running.contains_key(id)
                || state.pending.iter().any(|e| &e.job.id == id);
            if active {
                return Err(CoreError::InvalidValue(format!(
                    "job {} is active; cancel it first",
                    id
                )));
            }
        }

        if !self.store.delete_job(id).await? {
            return Err(CoreError::NotFound(format!("job {}", id)));
        }
        self.write().recently_completed.retain(|j| &j.id != id);
        info!(job_id = %id, "job removed");
        Ok(())
    }

    pub fn pending_jobs(&self) -> Vec<Job> {
        self.read().pending.iter().map(|e| e.job.clone()).collect()
    }

    pub fn running_jobs(&self) -> Vec<Job> {
        let state = self.read();
        let mut jobs: Vec<Job> = state.running.values().map(|r| r.job.clone()).collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn recently_completed(&self) -> Vec<Job> {
        self.read().recently_completed.iter().cloned().collect()
    }

    /// Every job currently held in memory (pending, running, and the ring).
    pub fn jobs_snapshot(&self) -> Vec<Job> {
        let state = self.read();
        state
            .pending
            .iter()
            .map(|e| e.job.clone())
            .chain(state.running.values().map(|r| r.job.clone()))
            .chain(state.recently_completed.iter().cloned())
            .collect()
    }

    /// Update the folder of a job wherever it currently lives, persisting the
    /// change.
    pub async fn set_job_folder(&self, id: &JobId, folder: Option<String>) -> CoreResult<()> {
        self.ensure_available()?;
        let in_memory = {
            let mut state = self.write();
            let job = state
                .pending_mut(id)
                .map(|j| {
                    j.spec.folder = folder.clone();
                    j.clone()
                })
                .or_else(|| {
                    state.running.get_mut(id).map(|r| {
                        r.job.spec.folder = folder.clone();
                        r.job.clone()
                    })
                })
                .or_else(|| {
                    state
                        .recently_completed
                        .iter_mut()
                        .find(|j| &j.id == id)
                        .map(|j| {
                            j.spec.folder = folder.clone();
                            j.clone()
                        })
                });
            job
        };

        let job = match in_memory {
            Some(job) => job,
            None => {
                let mut job = self
                    .store
                    .get_job(id)
                    .await?
                    .ok_or_else(|| CoreError::NotFound(format!("job {}", id)))?;
                job.spec.folder = folder;
                job
            }
        };

        self.store.put_job(&job).await.map_err(CoreError::from)
    }

    /// Refresh in-memory folder fields after an atomic multi-record move.
    pub fn sync_folders_in_memory(&self, ids: &[JobId], folder: Option<String>) {
        let mut state = self.write();
        for id in ids {
            if let Some(job) = state.pending_mut(id) {
                job.spec.folder = folder.clone();
            } else if let Some(running) = state.running.get_mut(id) {
                running.job.spec.folder = folder.clone();
            } else if let Some(job) = state.recently_completed.iter_mut().find(|j| &j.id == id) {
                job.spec.folder = folder.clone();
            }
        }
    }

    /// Re-enqueue persisted pending jobs at startup.
    pub fn restore_pending(&self, jobs: Vec<Job>) {
        let mut state = self.write();
        for job in jobs {
            debug_assert!(matches!(
                job.state,
                JobState::NotYetStarted | JobState::Disabled
            ));
            state.insert_pending(job);
        }
    }

    // ========================================================================
    // Completion watchers
    // ========================================================================

    /// Wait until the job reaches a terminal state and return its record.
    ///
    /// Optimizing-job controllers suspend here; the wait is cancelled by
    /// scheduler shutdown.
    pub async fn await_completion(&self, id: &JobId) -> CoreResult<Job> {
        let receiver = {
            let state = self.read();
            if let Some(job) = state.find_job(id) {
                if job.state.is_terminal() {
                    return Ok(job.clone());
                }
            }
            drop(state);

            let (tx, rx) = oneshot::channel();
            self.watchers
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(id.clone())
                .or_default()
                .push(tx);
            rx
        };

        // Close the race with ring eviction: the record may already be
        // terminal in the store.
        if let Some(job) = self.store.get_job(id).await? {
            if job.state.is_terminal() {
                return Ok(job);
            }
        }

        tokio::select! {
            _ = self.shutdown.cancelled() => Err(CoreError::NotFound(format!(
                "job {}: scheduler stopped before completion",
                id
            ))),
            result = receiver => {
                result.map_err(|_| CoreError::NotFound(format!("job {}", id)))
            }
        }
    }

    fn fire_watchers(&self, job: &Job) {
        let senders = self
            .watchers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&job.id);
        if let Some(senders) = senders {
            for sender in senders {
                let _ = sender.send(job.clone());
            }
        }
    }

    // ========================================================================
    // Run loop
    // ========================================================================

    /// Run the scheduler until shutdown. Must be called exactly once.
    pub async fn run(self: Arc<Self>) {
        let mut events = self
            .events_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .expect("scheduler run loop started twice");

        let mut tick = tokio::time::interval(self.config.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_ms = self.config.tick_interval.as_millis() as u64,
            "scheduler loop starting"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    if let Err(err) = self.tick().await {
                        self.halt(&err);
                        break;
                    }
                }
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
            }
        }

        self.drain_on_shutdown(&mut events).await;
        info!("scheduler loop stopped");
    }

    async fn tick(&self) -> CoreResult<()> {
        self.persist_dirty().await?;
        self.dispatch_eligible().await?;
        self.police_running().await;
        Ok(())
    }

    async fn persist_dirty(&self) -> CoreResult<()> {
        let jobs: Vec<Job> = {
            let mut state = self.write();
            let ids: Vec<JobId> = state.dirty.drain().collect();
            ids.iter()
                .filter_map(|id| state.find_job(id).cloned())
                .collect()
        };

        for job in jobs {
            self.store.put_job(&job).await.map_err(CoreError::from)?;
        }
        Ok(())
    }

    async fn dispatch_eligible(&self) -> CoreResult<()> {
        let now = Utc::now();
        let candidates: Vec<Job> = {
            let state = self.read();
            state
                .pending
                .iter()
                .filter(|e| {
                    e.job.state == JobState::NotYetStarted && e.job.spec.start_time <= now
                })
                .map(|e| e.job.clone())
                .collect()
        };

        for job in candidates {
            if !self.dependencies_satisfied(&job).await? {
                continue;
            }

            match self.registry.pick_for_job(&job) {
                Ok(picked) => self.dispatch(&job.id, picked).await?,
                Err(PickError::Insufficient { needed, available }) => {
                    debug!(job_id = %job.id, needed, available, "insufficient clients; job stays pending");
                }
                Err(PickError::RequestedUnavailable { address }) => {
                    let waited_out = job.spec.start_time
                        + chrono::Duration::from_std(self.config.max_client_wait)
                            .unwrap_or_else(|_| chrono::Duration::seconds(300))
                        <= now;
                    if waited_out {
                        warn!(job_id = %job.id, %address, "requested client never appeared; failing job");
                        self.fail_pending(
                            &job.id,
                            &format!("requested client {} unavailable", address),
                        )
                        .await?;
                    }
                }
            }
        }

        Ok(())
    }

    /// A job may start once every dependency is terminal. A reference that no
    /// longer exists counts as satisfied (deleted records are terminal).
    async fn dependencies_satisfied(&self, job: &Job) -> CoreResult<bool> {
        for dependency in &job.spec.dependencies {
            let satisfied = match dependency {
                DependencyRef::Job(id) => {
                    let in_memory = {
                        let state = self.read();
                        state.find_job(id).map(|j| j.state)
                    };
                    match in_memory {
                        Some(state) => state.is_terminal(),
                        None => match self.store.get_job(id).await? {
                            Some(job) => job.state.is_terminal(),
                            None => true,
                        },
                    }
                }
                DependencyRef::OptimizingJob(id) => {
                    match self.store.get_optimizing_job(id).await? {
                        Some(record) => record.state.is_terminal(),
                        None => true,
                    }
                }
            };
            if !satisfied {
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn dispatch(
        &self,
        id: &JobId,
        picked: crate::fleet::PickedClients,
    ) -> CoreResult<()> {
        // Send the start command to every chosen client before committing.
        let mut failed: Vec<ClientId> = Vec::new();
        let dispatch = {
            let state = self.read();
            match state.find_job(id) {
                Some(job) => JobDispatch::for_job(job),
                None => {
                    release_picked(&self.registry, id, &picked);
                    return Ok(());
                }
            }
        };

        for client in picked.load.iter().chain(picked.monitors.iter()) {
            if client
                .commands
                .send(ClientCommand::StartJob(dispatch.clone()))
                .is_err()
            {
                failed.push(client.id);
            }
        }

        if !failed.is_empty() {
            warn!(job_id = %id, failed = failed.len(), "dispatch failed; client channels closed");
            release_picked(&self.registry, id, &picked);
            for client in failed {
                let _ = self.registry.force_disconnect(client);
            }
            return self.fail_pending(id, "dispatch failed: client vanished").await;
        }

        // Commit: move pending -> running.
        let job = {
            let mut state = self.write();
            let mut job = match state.take_pending(id) {
                Some(job) => job,
                None => {
                    // Cancelled between snapshot and dispatch; undo the pick.
                    release_picked(&self.registry, id, &picked);
                    return Ok(());
                }
            };
            if job.state != JobState::NotYetStarted {
                // Paused between snapshot and dispatch; undo the pick.
                state.insert_pending(job);
                release_picked(&self.registry, id, &picked);
                return Ok(());
            }
            job.transition(JobState::Running)?;

            let running = RunningJob {
                job: job.clone(),
                clients: picked
                    .load
                    .iter()
                    .map(|c| (c.id, c.address.clone()))
                    .collect(),
                done: HashSet::new(),
                monitors: picked.monitors.iter().map(|c| c.id).collect(),
                any_failed: false,
                stop_target: None,
                stop_sent_at: None,
            };
            state.running.insert(id.clone(), running);
            job
        };

        let client_ids: Vec<ClientId> = picked.load.iter().map(|c| c.id).collect();
        self.registry.mark_running(&client_ids);
        self.store.put_job(&job).await.map_err(CoreError::from)?;

        info!(
            job_id = %id,
            clients = picked.load.len(),
            monitors = picked.monitors.len(),
            "job dispatched"
        );
        Ok(())
    }

    /// Fail a still-pending job into `StoppedDueToError`.
    async fn fail_pending(&self, id: &JobId, reason: &str) -> CoreResult<()> {
        let job = {
            let mut state = self.write();
            let mut job = match state.take_pending(id) {
                Some(job) => job,
                None => return Ok(()),
            };
            if job.state != JobState::NotYetStarted {
                state.insert_pending(job);
                return Ok(());
            }
            job.transition(JobState::StoppedDueToError)?;
            job.stop_reason = Some(reason.to_string());
            state.retire(job.clone(), self.config.recently_completed_capacity);
            job
        };

        self.persist_terminal(&job).await?;
        self.fire_watchers(&job);
        Ok(())
    }

    /// Enforce duration and stop-time limits on running jobs.
    async fn police_running(&self) {
        let now = Utc::now();
        let expired: Vec<(JobId, JobState, &'static str)> = {
            let state = self.read();
            state
                .running
                .values()
                .filter(|r| r.stop_sent_at.is_none())
                .filter_map(|r| {
                    if let Some(deadline) = r.job.duration_deadline() {
                        if deadline <= now {
                            return Some((
                                r.job.id.clone(),
                                JobState::StoppedDueToDuration,
                                "duration elapsed",
                            ));
                        }
                    }
                    if let Some(stop_time) = r.job.spec.stop_time {
                        if stop_time <= now {
                            return Some((
                                r.job.id.clone(),
                                JobState::StoppedDueToStopTime,
                                "stop time reached",
                            ));
                        }
                    }
                    None
                })
                .collect()
        };

        for (id, target, reason) in expired {
            if let Err(err) = self.request_stop(&id, target, reason).await {
                warn!(job_id = %id, error = %err, "failed to stop expired job");
            }
        }
    }

    /// Send stop to a running job's unsettled clients and arrange for the
    /// given terminal state once they all report.
    async fn request_stop(
        &self,
        id: &JobId,
        target: JobState,
        reason: &str,
    ) -> CoreResult<()> {
        let (pending_clients, already_settled) = {
            let mut state = self.write();
            let running = match state.running.get_mut(id) {
                Some(running) => running,
                None => return Err(CoreError::NotFound(format!("job {}", id))),
            };

            if running.stop_target.is_none() {
                running.stop_target = Some(target);
                running.job.stop_reason = Some(reason.to_string());
                running.stop_sent_at = Some(Utc::now());
            }

            let pending: Vec<ClientId> = running
                .clients
                .keys()
                .filter(|c| !running.done.contains(c))
                .copied()
                .collect();
            (pending.clone(), pending.is_empty())
        };

        for client in &pending_clients {
            if let Some(sender) = self.registry.command_sender(*client) {
                let _ = sender.send(ClientCommand::StopJob { job_id: id.clone() });
            }
        }
        self.registry.mark_reporting(&pending_clients);
        debug!(job_id = %id, target = %target, clients = pending_clients.len(), "stop requested");

        if already_settled {
            self.finalize(id).await;
        }
        Ok(())
    }

    /// Move a settled running job to its terminal state and retire it.
    async fn finalize(&self, id: &JobId) {
        let finished = {
            let mut state = self.write();
            let running = match state.running.remove(id) {
                Some(running) => running,
                None => return,
            };

            let mut job = running.job;
            let target = running.stop_target.unwrap_or(if running.any_failed {
                JobState::CompletedWithErrors
            } else {
                JobState::CompletedSuccessfully
            });

            if let Err(err) = job.transition(target) {
                error!(job_id = %id, error = %err, "illegal finalize transition");
            }
            state.retire(job.clone(), self.config.recently_completed_capacity);
            (job, running.monitors)
        };

        let (job, monitors) = finished;
        for monitor in monitors {
            if let Some(sender) = self.registry.command_sender(monitor) {
                let _ = sender.send(ClientCommand::StopJob {
                    job_id: job.id.clone(),
                });
            }
            self.registry.release_monitor(monitor, &job.id);
        }

        // Persist before watchers observe the terminal state.
        if let Err(err) = self.persist_terminal(&job).await {
            self.halt(&err);
        }
        self.fire_watchers(&job);

        info!(
            job_id = %job.id,
            state = %job.state,
            has_stats = job.has_stats(),
            "job finished"
        );
    }

    async fn persist_terminal(&self, job: &Job) -> CoreResult<()> {
        self.store.put_job(job).await.map_err(CoreError::from)
    }

    // ========================================================================
    // Event handling
    // ========================================================================

    async fn handle_event(&self, event: SchedulerEvent) {
        match event {
            SchedulerEvent::ClientRegistered { client, kind } => {
                debug!(client = %client, kind = %kind, "client registered");
            }

            SchedulerEvent::StatsChunk {
                address,
                job,
                payload,
                ..
            } => {
                let mut state = self.write();
                if let Some(running) = state.running.get_mut(&job) {
                    running.job.stats.push(ClientStats {
                        client: address,
                        collected_at: Utc::now(),
                        payload,
                    });
                }
                if state.running.contains_key(&job) {
                    state.dirty.insert(job);
                }
            }

            SchedulerEvent::JobCompleted {
                client,
                job,
                succeeded,
            } => {
                self.registry.release(client);
                let settled = {
                    let mut state = self.write();
                    match state.running.get_mut(&job) {
                        Some(running) if running.clients.contains_key(&client) => {
                            running.done.insert(client);
                            if !succeeded {
                                running.any_failed = true;
                            }
                            running.all_done()
                        }
                        _ => false,
                    }
                };
                if settled {
                    self.finalize(&job).await;
                }
            }

            SchedulerEvent::ClientDisconnected {
                client,
                kind: ClientKind::Load,
                job: Some(job),
                graceful,
            } => {
                self.handle_client_loss(client, &job, graceful).await;
            }

            SchedulerEvent::ClientDisconnected {
                client,
                kind: ClientKind::Monitor,
                ..
            } => {
                let mut state = self.write();
                for running in state.running.values_mut() {
                    running.monitors.remove(&client);
                }
            }

            SchedulerEvent::ClientDisconnected { client, kind, .. } => {
                debug!(client = %client, kind = %kind, "client disconnected");
            }
        }
    }

    /// A load client vanished mid-run and cannot be replaced: the job ends
    /// `StoppedDueToError`, retaining whatever statistics already flushed.
    async fn handle_client_loss(&self, client: ClientId, job: &JobId, graceful: bool) {
        let (remaining, settled) = {
            let mut state = self.write();
            let running = match state.running.get_mut(job) {
                Some(running) => running,
                None => return,
            };
            if running.done.contains(&client) || !running.clients.contains_key(&client) {
                // Already reported; the disconnect is routine.
                return;
            }

            warn!(job_id = %job, client = %client, graceful, "client lost during run");
            running.clients.remove(&client);
            if running.stop_target.is_none() {
                running.stop_target = Some(JobState::StoppedDueToError);
                running.job.stop_reason = Some("client disconnected during run".into());
                running.stop_sent_at = Some(Utc::now());
            }

            let remaining: Vec<ClientId> = running
                .clients
                .keys()
                .filter(|c| !running.done.contains(c))
                .copied()
                .collect();
            (remaining.clone(), remaining.is_empty())
        };

        for survivor in &remaining {
            if let Some(sender) = self.registry.command_sender(*survivor) {
                let _ = sender.send(ClientCommand::StopJob { job_id: job.clone() });
            }
        }
        self.registry.mark_reporting(&remaining);

        if settled {
            self.finalize(job).await;
        }
    }

    // ========================================================================
    // Watchdog hooks
    // ========================================================================

    /// Periodic sweep: force-terminate jobs whose clients failed to
    /// acknowledge a stop within the grace period, backstop the duration and
    /// stop-time limits, and trim the recently-completed ring.
    pub async fn sweep(&self) {
        let grace = chrono::Duration::from_std(self.config.shutdown_grace)
            .unwrap_or_else(|_| chrono::Duration::seconds(10));
        let now = Utc::now();

        let stuck: Vec<(JobId, Vec<ClientId>)> = {
            let state = self.read();
            state
                .running
                .values()
                .filter(|r| matches!(r.stop_sent_at, Some(sent) if sent + grace <= now))
                .map(|r| {
                    let unsettled = r
                        .clients
                        .keys()
                        .filter(|c| !r.done.contains(c))
                        .copied()
                        .collect();
                    (r.job.id.clone(), unsettled)
                })
                .collect()
        };

        for (id, unsettled) in stuck {
            warn!(job_id = %id, stuck = unsettled.len(), "clients failed to acknowledge stop; forcing termination");
            self.force_finalize(&id, JobState::StoppedDueToError).await;
            for client in unsettled {
                let _ = self.registry.force_disconnect(client);
            }
        }

        self.police_running().await;

        let capacity = self.config.recently_completed_capacity;
        let mut state = self.write();
        while state.recently_completed.len() > capacity {
            state.recently_completed.pop_front();
        }
    }

    /// Finalize without waiting for the remaining client acknowledgements.
    async fn force_finalize(&self, id: &JobId, fallback: JobState) {
        {
            let mut state = self.write();
            if let Some(running) = state.running.get_mut(id) {
                let pending: Vec<ClientId> = running.clients.keys().copied().collect();
                running.done.extend(pending);
                if running.stop_target.is_none() {
                    running.stop_target = Some(fallback);
                }
            } else {
                return;
            }
        }
        self.finalize(id).await;
    }

    // ========================================================================
    // Shutdown
    // ========================================================================

    /// Stop all running jobs, wait up to the grace period for their clients
    /// to acknowledge, then mark the rest `StoppedByShutdown`.
    async fn drain_on_shutdown(&self, events: &mut mpsc::UnboundedReceiver<SchedulerEvent>) {
        let running: Vec<JobId> = {
            let state = self.read();
            state.running.keys().cloned().collect()
        };
        if running.is_empty() {
            let _ = self.persist_dirty().await;
            return;
        }

        info!(count = running.len(), "stopping running jobs for shutdown");
        for id in &running {
            let _ = self
                .request_stop(id, JobState::StoppedByShutdown, "server shutting down")
                .await;
        }

        let deadline = tokio::time::Instant::now() + self.config.shutdown_grace;
        loop {
            let still_running = !self.read().running.is_empty();
            if !still_running {
                break;
            }
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(event)) => self.handle_event(event).await,
                Ok(None) => break,
                Err(_) => break,
            }
        }

        let stragglers: Vec<JobId> = {
            let state = self.read();
            state.running.keys().cloned().collect()
        };
        for id in stragglers {
            warn!(job_id = %id, "forcing shutdown state after grace period");
            self.force_finalize(&id, JobState::StoppedByShutdown).await;
        }

        let _ = self.persist_dirty().await;
    }
}

fn release_picked(
    registry: &ClientRegistry,
    job: &JobId,
    picked: &crate::fleet::PickedClients,
) {
    for client in &picked.load {
        registry.release(client.id);
    }
    for PickedClient { id, .. } in &picked.monitors {
        registry.release_monitor(*id, job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn job_at(id: &str, start_offset_secs: i64) -> Job {
        let template = JobTemplate::builder()
            .job_class("swarm.builtin.NoOpJob")
            .start_time(Utc::now() + ChronoDuration::seconds(start_offset_secs))
            .build();
        let mut job = Job::from_template(JobId::new(id), template);
        job.transition(JobState::NotYetStarted).unwrap();
        job
    }

    #[test]
    fn pending_orders_by_start_time_then_insertion() {
        let mut state = SchedulerState::default();
        state.insert_pending(job_at("late", 60));
        state.insert_pending(job_at("early", 10));
        state.insert_pending(job_at("early-second", 10));

        let order: Vec<&str> = state.pending.iter().map(|e| e.job.id.as_str()).collect();
        assert_eq!(order, vec!["early", "early-second", "late"]);
    }

    #[test]
    fn take_pending_removes_by_id() {
        let mut state = SchedulerState::default();
        state.insert_pending(job_at("a", 0));
        state.insert_pending(job_at("b", 0));

        assert!(state.take_pending(&JobId::new("a")).is_some());
        assert!(state.take_pending(&JobId::new("a")).is_none());
        assert_eq!(state.pending.len(), 1);
    }

    #[test]
    fn ring_is_bounded() {
        let mut state = SchedulerState::default();
        for index in 0..15 {
            let mut job = job_at(&format!("job-{:02}", index), 0);
            job.transition(JobState::Cancelled).unwrap();
            state.retire(job, 10);
        }

        assert_eq!(state.recently_completed.len(), 10);
        // Oldest entries fall off the front.
        assert_eq!(
            state.recently_completed.front().unwrap().id.as_str(),
            "job-05"
        );
    }

    #[test]
    fn find_job_searches_all_collections() {
        let mut state = SchedulerState::default();
        state.insert_pending(job_at("pending", 0));

        let mut done = job_at("done", 0);
        done.transition(JobState::Cancelled).unwrap();
        state.retire(done, 10);

        assert!(state.find_job(&JobId::new("pending")).is_some());
        assert!(state.find_job(&JobId::new("done")).is_some());
        assert!(state.find_job(&JobId::new("ghost")).is_none());
    }
}
