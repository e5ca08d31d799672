//! Optimizing-job controller: the per-record iteration loop.
//!
//! One cooperative task per optimizing job. The controller schedules child
//! iterations through the same path the admin layer uses, suspends on each
//! child's terminal event, scores it with the bound algorithm, and decides
//! whether to advance. It never holds scheduler locks while waiting, and
//! every wait is cancellable.
//!
//! Durability: the persisted record (template + iteration list) is the only
//! state. After a restart the controller replays the persisted children
//! through the algorithm to rebuild its cursor, best value, and
//! non-improving counter, then continues where it left off.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::common::error::{CoreError, CoreResult};
use crate::common::id::{JobId, OptimizingJobId};
use crate::jobs::{DependencyRef, Job, JobState, OptimizingJob};
use crate::scheduler::Scheduler;
use crate::store::ConfigStore;

use super::algorithm::OptimizationAlgorithm;

/// Controller tunables surfaced from server configuration.
#[derive(Debug, Clone, Default)]
pub struct ControllerConfig {
    /// Source-parity toggle: treat an explicit re-run duration of zero as
    /// "use the template duration".
    pub rerun_zero_means_template: bool,
}

/// Shared handle to a live controller task.
#[derive(Clone)]
pub struct ControllerHandle {
    pub cancel: CancellationToken,
    pub resume: Arc<Notify>,
}

/// Live controllers, keyed by optimizing-job ID.
#[derive(Default)]
pub struct ControllerSet {
    inner: Mutex<HashMap<OptimizingJobId, ControllerHandle>>,
}

impl ControllerSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<OptimizingJobId, ControllerHandle>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, id: OptimizingJobId, handle: ControllerHandle) {
        self.lock().insert(id, handle);
    }

    pub fn remove(&self, id: &OptimizingJobId) {
        self.lock().remove(id);
    }

    pub fn get(&self, id: &OptimizingJobId) -> Option<ControllerHandle> {
        self.lock().get(id).cloned()
    }

    pub fn is_active(&self, id: &OptimizingJobId) -> bool {
        self.lock().contains_key(id)
    }

    /// Cancel a live controller. Returns false when none is running.
    pub fn cancel(&self, id: &OptimizingJobId) -> bool {
        match self.get(id) {
            Some(handle) => {
                handle.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Wake a controller waiting in the paused state.
    pub fn resume(&self, id: &OptimizingJobId) -> bool {
        match self.get(id) {
            Some(handle) => {
                handle.resume.notify_one();
                true
            }
            None => false,
        }
    }
}

#[derive(Default)]
struct Progress {
    best: Option<f64>,
    non_improving: u32,
    errored: usize,
    succeeded: usize,
}

pub struct OptimizingJobController {
    record: OptimizingJob,
    algorithm: Box<dyn OptimizationAlgorithm>,
    scheduler: Arc<Scheduler>,
    store: Arc<dyn ConfigStore>,
    config: ControllerConfig,
    resume: Arc<Notify>,
    cancel: CancellationToken,
}

/// Spawn the controller task for an optimizing job and register its handle.
pub fn spawn(
    record: OptimizingJob,
    algorithm: Box<dyn OptimizationAlgorithm>,
    scheduler: Arc<Scheduler>,
    store: Arc<dyn ConfigStore>,
    controllers: Arc<ControllerSet>,
    config: ControllerConfig,
) -> ControllerHandle {
    let handle = ControllerHandle {
        cancel: CancellationToken::new(),
        resume: Arc::new(Notify::new()),
    };
    controllers.register(record.id.clone(), handle.clone());

    let id = record.id.clone();
    let controller = OptimizingJobController {
        record,
        algorithm,
        scheduler,
        store,
        config,
        resume: handle.resume.clone(),
        cancel: handle.cancel.clone(),
    };

    let registry = controllers;
    tokio::spawn(async move {
        if let Err(err) = controller.run().await {
            error!(optimizing_job = %id, error = %err, "optimizing-job controller failed");
        }
        registry.remove(&id);
    });

    handle
}

impl OptimizingJobController {
    async fn run(mut self) -> CoreResult<()> {
        if self.record.state == JobState::NotYetStarted {
            self.record.state = JobState::Running;
            self.record.actual_start_time = Some(Utc::now());
            self.persist().await?;
        }

        let mut progress = Progress::default();
        let mut prev_child: Option<JobId> = None;

        // Replay persisted children (restart recovery); a no-op for fresh
        // records. Non-terminal children are awaited like live ones.
        let replayed = self.record.iterations.len();
        for index in 0..replayed {
            let child_id = self.record.iterations[index].clone();
            let child = self.await_child(&child_id).await?;
            let child = match child {
                Some(child) => child,
                None => return self.finish_cancelled().await,
            };
            let threads = self.record.thread_count_for_iteration(index);
            self.observe(&child, threads, &mut progress);
            prev_child = Some(child_id);
        }
        if replayed > 0 {
            self.persist().await?;
            info!(
                optimizing_job = %self.record.id,
                iterations = replayed,
                "recovered controller state from persisted record"
            );
        }

        // A restart can land after the re-run was scheduled; just see it
        // through.
        if let Some(rerun_id) = self.record.rerun_iteration.clone() {
            if let Some(rerun) = self.await_child(&rerun_id).await? {
                self.count_outcome(&rerun, &mut progress);
                return self.finish(&progress).await;
            }
            return self.finish_cancelled().await;
        }

        let threshold = self.record.spec.max_consecutive_non_improving.max(1);
        let mut index = replayed;
        let mut stopped = replayed > 0 && self.should_stop_loop(&progress, index, threshold);

        while !stopped {
            self.refresh_admin_fields().await;
            if self.cancel.is_cancelled() {
                return self.finish_cancelled().await;
            }

            let threads = self.record.thread_count_for_iteration(index);
            let paused = self.record.pause_requested;
            let child_id = self
                .schedule_child(threads, prev_child.clone(), paused, None)
                .await?;
            self.record.iterations.push(child_id.clone());
            self.persist().await?;

            if paused {
                info!(
                    optimizing_job = %self.record.id,
                    iteration = index,
                    "paused; iteration created disabled"
                );
                if !self.wait_for_resume(&child_id).await {
                    let _ = self.scheduler.cancel_job(&child_id).await;
                    return self.finish_cancelled().await;
                }
                self.record.pause_requested = false;
            }

            let child = match self.await_child(&child_id).await? {
                Some(child) => child,
                None => {
                    let _ = self.scheduler.cancel_job(&child_id).await;
                    return self.finish_cancelled().await;
                }
            };

            self.observe(&child, threads, &mut progress);
            self.persist().await?;

            prev_child = Some(child_id);
            index += 1;
            stopped = self.should_stop_loop(&progress, index, threshold);
        }

        if self.record.spec.rerun_best_iteration && self.record.optimal_job_id.is_some() {
            let threads = self
                .record
                .optimal_thread_count
                .unwrap_or(self.record.spec.min_threads);
            let duration = self.rerun_duration();
            let rerun_id = self
                .schedule_child(threads, prev_child, false, Some(duration))
                .await?;
            self.record.rerun_iteration = Some(rerun_id.clone());
            self.persist().await?;
            info!(
                optimizing_job = %self.record.id,
                threads,
                "re-running best iteration"
            );

            match self.await_child(&rerun_id).await? {
                Some(rerun) => self.count_outcome(&rerun, &mut progress),
                None => {
                    let _ = self.scheduler.cancel_job(&rerun_id).await;
                    return self.finish_cancelled().await;
                }
            }
        }

        self.finish(&progress).await
    }

    /// Wait for a child's terminal record; `None` means the controller was
    /// cancelled while waiting.
    async fn await_child(&self, child_id: &JobId) -> CoreResult<Option<Job>> {
        tokio::select! {
            _ = self.cancel.cancelled() => Ok(None),
            result = self.scheduler.await_completion(child_id) => result.map(Some),
        }
    }

    /// Park until the operator unpauses (and the disabled child is actually
    /// re-enabled; a stale resume permit re-parks). Returns false on cancel.
    async fn wait_for_resume(&self, child_id: &JobId) -> bool {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return false,
                _ = self.resume.notified() => {}
            }
            match self.scheduler.get_job(child_id).await {
                Ok(job) if job.state != JobState::Disabled => return true,
                Ok(_) => continue,
                Err(_) => return true,
            }
        }
    }

    /// Score a finished iteration and update the search state.
    fn observe(&mut self, child: &Job, threads: u32, progress: &mut Progress) {
        let value = if child.has_stats() {
            self.algorithm.iteration_value(child)
        } else {
            Err(CoreError::StatisticsUnreadable(format!(
                "job {} reported no statistics",
                child.id
            )))
        };

        match value {
            Ok(value) => {
                if child.state.is_errored() {
                    progress.errored += 1;
                } else {
                    progress.succeeded += 1;
                }

                // The first scored iteration is unconditionally improving.
                let improving = match progress.best {
                    None => true,
                    Some(best) => self.algorithm.is_better_than(value, best),
                };
                if improving {
                    progress.best = Some(value);
                    progress.non_improving = 0;
                    self.record.optimal_value = Some(value);
                    self.record.optimal_thread_count = Some(threads);
                    self.record.optimal_job_id = Some(child.id.clone());
                } else {
                    progress.non_improving += 1;
                }
                debug!(
                    optimizing_job = %self.record.id,
                    child = %child.id,
                    threads,
                    value,
                    improving,
                    "iteration scored"
                );
            }
            Err(err) => {
                debug!(
                    optimizing_job = %self.record.id,
                    child = %child.id,
                    threads,
                    error = %err,
                    "iteration not scorable; counted as non-improving"
                );
                progress.errored += 1;
                progress.non_improving += 1;
            }
        }
    }

    fn count_outcome(&self, child: &Job, progress: &mut Progress) {
        if child.state.is_errored() || !child.has_stats() {
            progress.errored += 1;
        } else {
            progress.succeeded += 1;
        }
    }

    fn should_stop_loop(&self, progress: &Progress, next_index: usize, threshold: u32) -> bool {
        if progress.non_improving >= threshold {
            return true;
        }
        if let Some(max) = self.record.spec.max_threads {
            if self.record.thread_count_for_iteration(next_index) > max {
                return true;
            }
        }
        self.algorithm.should_stop()
    }

    async fn schedule_child(
        &self,
        threads: u32,
        prev_child: Option<JobId>,
        disabled: bool,
        duration_override: Option<Option<u64>>,
    ) -> CoreResult<JobId> {
        let mut template = self.record.spec.job.clone();
        template.threads_per_client = threads;

        if self.record.spec.include_threads_in_description {
            template.description = Some(match &self.record.spec.job.description {
                Some(base) => format!("{} ({} threads)", base, threads),
                None => format!("({} threads)", threads),
            });
        }

        let now = Utc::now();
        template.start_time = if prev_child.is_none() {
            now
        } else {
            now + chrono::Duration::seconds(self.record.spec.delay_between_iterations_secs as i64)
        };
        template.dependencies = prev_child.map(DependencyRef::Job).into_iter().collect();

        if let Some(duration) = duration_override {
            template.duration_secs = duration;
        }

        self.scheduler
            .schedule_job_opts(template, disabled, Some(self.record.id.clone()))
            .await
    }

    /// Duration for the re-run iteration: `rerun_duration_secs` when set,
    /// falling back to the template duration (optionally also for an
    /// explicit zero, for strict source parity).
    fn rerun_duration(&self) -> Option<u64> {
        match self.record.spec.rerun_duration_secs {
            Some(0) if self.config.rerun_zero_means_template => self.record.spec.job.duration_secs,
            Some(duration) => Some(duration),
            None => self.record.spec.job.duration_secs,
        }
    }

    /// Pick up admin mutations that landed while the controller was waiting:
    /// pause requests and folder moves.
    async fn refresh_admin_fields(&mut self) {
        if let Ok(Some(stored)) = self.store.get_optimizing_job(&self.record.id).await {
            self.record.pause_requested = stored.pause_requested;
            self.record.spec.job.folder = stored.spec.job.folder;
        }
    }

    async fn persist(&self) -> CoreResult<()> {
        self.store
            .put_optimizing_job(&self.record)
            .await
            .map_err(CoreError::from)
    }

    async fn finish(&mut self, progress: &Progress) -> CoreResult<()> {
        self.record.state = if progress.errored > 0 && progress.succeeded == 0 {
            JobState::CompletedWithErrors
        } else {
            JobState::CompletedSuccessfully
        };
        self.record.actual_stop_time = Some(Utc::now());
        self.persist().await?;

        info!(
            optimizing_job = %self.record.id,
            state = %self.record.state,
            iterations = self.record.iterations.len(),
            optimal_threads = ?self.record.optimal_thread_count,
            optimal_value = ?self.record.optimal_value,
            "optimizing job finished"
        );
        Ok(())
    }

    async fn finish_cancelled(&mut self) -> CoreResult<()> {
        if !self.record.state.is_terminal() {
            self.record.state = JobState::Cancelled;
            self.record.actual_stop_time = Some(Utc::now());
            self.persist().await?;
        }
        info!(optimizing_job = %self.record.id, "optimizing job cancelled");
        Ok(())
    }
}
