//! Access points: the stable operation surface exposed to the admin layer.
//!
//! Every operation returns typed records and a [`CoreError`] with a stable
//! kind code; the admin layer adapts HTTP to these calls. Mutations are
//! persisted before they are acknowledged.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::common::error::{CoreError, CoreResult};
use crate::common::id::{IdAllocator, JobId, OptimizingJobId};
use crate::common::input;
use crate::fleet::{
    ClientId, ClientKind, ClientManagerController, ClientRegistry, ClientView, ConnectPlan,
    ConnectSummary, ManagerAck, ManagerView,
};
use crate::jobs::{Job, JobFolder, JobState, JobTemplate, OptimizingJob, OptimizingJobTemplate};
use crate::optimize::{spawn_controller, ControllerConfig, ControllerSet};
use crate::plugins::{PluginCatalog, PluginRegistry};
use crate::store::{ConfigStore, StoreError};

use super::core::Scheduler;

#[derive(Clone)]
pub struct AccessPoints {
    scheduler: Arc<Scheduler>,
    store: Arc<dyn ConfigStore>,
    registry: Arc<ClientRegistry>,
    managers: Arc<ClientManagerController>,
    plugins: Arc<PluginRegistry>,
    ids: Arc<IdAllocator>,
    controllers: Arc<ControllerSet>,
    controller_config: ControllerConfig,
    /// Honor the legacy `"one"` spelling when coercing operator flags.
    accept_one_as_truthy: bool,
}

impl AccessPoints {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        scheduler: Arc<Scheduler>,
        store: Arc<dyn ConfigStore>,
        registry: Arc<ClientRegistry>,
        managers: Arc<ClientManagerController>,
        plugins: Arc<PluginRegistry>,
        ids: Arc<IdAllocator>,
        controllers: Arc<ControllerSet>,
        controller_config: ControllerConfig,
        accept_one_as_truthy: bool,
    ) -> Self {
        Self {
            scheduler,
            store,
            registry,
            managers,
            plugins,
            ids,
            controllers,
            controller_config,
            accept_one_as_truthy,
        }
    }

    // ========================================================================
    // Operator inputs
    // ========================================================================
    //
    // The admin layer adapts raw form strings through these before building
    // templates; nothing else in the core parses operator input.

    /// Parse a 14-digit local-time stamp `YYYYMMDDhhmmss`.
    pub fn parse_schedule_time(&self, raw: &str) -> CoreResult<DateTime<Utc>> {
        input::parse_timestamp(raw)
    }

    /// Parse a duration (`"30s"`, `"5m"`, `"2h"`, or bare seconds).
    pub fn parse_duration_secs(&self, raw: &str) -> CoreResult<u64> {
        input::parse_duration_secs(raw)
    }

    /// Coerce an operator boolean flag (e.g. include-threads-in-description).
    /// The legacy `"one"` spelling counts as truthy only when the operator
    /// enabled it in server configuration.
    pub fn parse_flag(&self, raw: &str) -> bool {
        input::parse_flag(raw, self.accept_one_as_truthy)
    }

    // ========================================================================
    // Jobs
    // ========================================================================

    pub async fn schedule_job(&self, template: JobTemplate) -> CoreResult<JobId> {
        self.scheduler.schedule_job(template).await
    }

    pub async fn cancel_job(&self, id: &JobId) -> CoreResult<()> {
        self.scheduler.cancel_job(id).await
    }

    pub async fn pause_job(&self, id: &JobId) -> CoreResult<()> {
        self.scheduler.pause_job(id).await
    }

    pub async fn unpause_job(&self, id: &JobId) -> CoreResult<()> {
        self.scheduler.unpause_job(id).await
    }

    pub async fn get_job(&self, id: &JobId) -> CoreResult<Job> {
        self.scheduler.get_job(id).await
    }

    pub async fn remove_job(&self, id: &JobId) -> CoreResult<()> {
        self.scheduler.remove_job(id).await
    }

    pub fn pending_jobs(&self) -> Vec<Job> {
        self.scheduler.pending_jobs()
    }

    pub fn running_jobs(&self) -> Vec<Job> {
        self.scheduler.running_jobs()
    }

    pub fn recently_completed_jobs(&self) -> Vec<Job> {
        self.scheduler.recently_completed()
    }

    /// Ordered listing from the store, overlaid with any fresher in-memory
    /// copies, optionally restricted to one folder and one state.
    pub async fn list_jobs(
        &self,
        folder: Option<&str>,
        state_filter: Option<JobState>,
    ) -> CoreResult<Vec<Job>> {
        let mut jobs = self.store.list_jobs(folder).await?;

        let in_memory: HashMap<JobId, Job> = self
            .scheduler
            .jobs_snapshot()
            .into_iter()
            .map(|job| (job.id.clone(), job))
            .collect();
        for job in &mut jobs {
            if let Some(fresher) = in_memory.get(&job.id) {
                *job = fresher.clone();
            }
        }

        if let Some(state) = state_filter {
            jobs.retain(|job| job.state == state);
        }
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(jobs)
    }

    pub async fn move_job(&self, id: &JobId, target_folder: &str) -> CoreResult<()> {
        self.ensure_folder_exists(target_folder).await?;
        self.scheduler
            .set_job_folder(id, folder_option(target_folder))
            .await?;
        info!(job_id = %id, folder = target_folder, "job moved");
        Ok(())
    }

    // ========================================================================
    // Optimizing jobs
    // ========================================================================

    pub async fn schedule_optimizing_job(
        &self,
        template: OptimizingJobTemplate,
    ) -> CoreResult<OptimizingJobId> {
        template.validate()?;

        let job_class = self
            .plugins
            .job_class(&template.job.job_class)
            .ok_or_else(|| CoreError::UnknownJobClass(template.job.job_class.clone()))?;
        job_class.validate_parameters(&template.job.parameters)?;

        let mut algorithm = self
            .plugins
            .new_algorithm(&template.algorithm)
            .ok_or_else(|| CoreError::UnknownOptimizationAlgorithm(template.algorithm.clone()))?;
        if !algorithm.available_with_job_class(job_class.as_ref()) {
            return Err(CoreError::InvalidValue(format!(
                "algorithm {} is not available with job class {}",
                template.algorithm, template.job.job_class
            )));
        }

        let id = self.ids.next_optimizing_job_id().await?;
        let record = OptimizingJob::from_template(id.clone(), template);
        algorithm.initialize(&record, &record.spec.algorithm_parameters)?;

        // Write before acknowledging; the controller owns the record from
        // here on.
        self.store
            .put_optimizing_job(&record)
            .await
            .map_err(CoreError::from)?;

        info!(optimizing_job = %id, algorithm = %record.spec.algorithm, "optimizing job scheduled");
        spawn_controller(
            record,
            algorithm,
            self.scheduler.clone(),
            self.store.clone(),
            self.controllers.clone(),
            self.controller_config.clone(),
        );
        Ok(id)
    }

    pub async fn get_optimizing_job(&self, id: &OptimizingJobId) -> CoreResult<OptimizingJob> {
        self.store
            .get_optimizing_job(id)
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("optimizing job {}", id)))
    }

    pub async fn list_optimizing_jobs(
        &self,
        folder: Option<&str>,
    ) -> CoreResult<Vec<OptimizingJob>> {
        let mut records = self.store.list_optimizing_jobs(folder).await?;
        records.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(records)
    }

    pub async fn cancel_optimizing_job(&self, id: &OptimizingJobId) -> CoreResult<()> {
        if self.controllers.cancel(id) {
            info!(optimizing_job = %id, "cancel requested");
            return Ok(());
        }

        // No live controller; settle the record directly.
        let mut record = self.get_optimizing_job(id).await?;
        if record.state.is_terminal() {
            return Err(CoreError::NotCancellable(format!(
                "optimizing job {} already {}",
                id, record.state
            )));
        }
        record.state = JobState::Cancelled;
        record.actual_stop_time = Some(Utc::now());
        self.store
            .put_optimizing_job(&record)
            .await
            .map_err(CoreError::from)?;
        info!(optimizing_job = %id, "cancelled without live controller");
        Ok(())
    }

    /// Request a pause: the next iteration is created `Disabled` and the
    /// controller suspends until unpaused.
    pub async fn pause_optimizing_job(&self, id: &OptimizingJobId) -> CoreResult<()> {
        let mut record = self.get_optimizing_job(id).await?;
        if record.state.is_terminal() {
            return Err(CoreError::NotPausable(format!(
                "optimizing job {} already {}",
                id, record.state
            )));
        }
        if record.pause_requested {
            return Ok(());
        }

        record.pause_requested = true;
        self.store
            .put_optimizing_job(&record)
            .await
            .map_err(CoreError::from)?;
        info!(optimizing_job = %id, "pause requested");
        Ok(())
    }

    pub async fn unpause_optimizing_job(&self, id: &OptimizingJobId) -> CoreResult<()> {
        let mut record = self.get_optimizing_job(id).await?;
        if record.state.is_terminal() {
            return Err(CoreError::NotPausable(format!(
                "optimizing job {} already {}",
                id, record.state
            )));
        }

        record.pause_requested = false;
        self.store
            .put_optimizing_job(&record)
            .await
            .map_err(CoreError::from)?;

        // Re-enable the disabled iteration before waking the controller.
        if let Some(last) = record.iterations.last() {
            if let Ok(job) = self.scheduler.get_job(last).await {
                if job.state == JobState::Disabled {
                    self.scheduler.unpause_job(last).await?;
                }
            }
        }
        self.controllers.resume(id);
        info!(optimizing_job = %id, "unpaused");
        Ok(())
    }

    /// Move an optimizing job, atomically taking its iterations along when
    /// `include_iterations` is set.
    pub async fn move_optimizing_job(
        &self,
        id: &OptimizingJobId,
        target_folder: &str,
        include_iterations: bool,
    ) -> CoreResult<()> {
        self.ensure_folder_exists(target_folder).await?;
        let record = self.get_optimizing_job(id).await?;

        let job_ids = if include_iterations {
            record.all_children()
        } else {
            Vec::new()
        };
        self.store
            .move_records(&job_ids, std::slice::from_ref(id), target_folder)
            .await
            .map_err(|err| match err {
                StoreError::MissingRecord(what) => CoreError::NotFound(what),
                other => CoreError::ConfigStore(other),
            })?;
        self.scheduler
            .sync_folders_in_memory(&job_ids, folder_option(target_folder));

        info!(
            optimizing_job = %id,
            folder = target_folder,
            iterations = job_ids.len(),
            "optimizing job moved"
        );
        Ok(())
    }

    pub async fn remove_optimizing_job(
        &self,
        id: &OptimizingJobId,
        include_iterations: bool,
    ) -> CoreResult<()> {
        if self.controllers.is_active(id) {
            return Err(CoreError::InvalidValue(format!(
                "optimizing job {} is active; cancel it first",
                id
            )));
        }
        let record = self.get_optimizing_job(id).await?;

        for child in record.all_children() {
            if include_iterations {
                match self.scheduler.remove_job(&child).await {
                    Ok(()) | Err(CoreError::NotFound(_)) => {}
                    Err(err) => return Err(err),
                }
            } else if let Ok(mut job) = self.scheduler.get_job(&child).await {
                job.optimizing_parent = None;
                self.store.put_job(&job).await.map_err(CoreError::from)?;
            }
        }

        if !self.store.delete_optimizing_job(id).await? {
            return Err(CoreError::NotFound(format!("optimizing job {}", id)));
        }
        info!(optimizing_job = %id, include_iterations, "optimizing job removed");
        Ok(())
    }

    // ========================================================================
    // Folders
    // ========================================================================

    pub async fn create_folder(&self, folder: JobFolder) -> CoreResult<()> {
        if folder.name.trim().is_empty() {
            return Err(CoreError::InvalidValue("folder name must not be empty".into()));
        }
        if self.store.get_folder(&folder.name).await?.is_some() {
            return Err(CoreError::InvalidValue(format!(
                "folder {} already exists",
                folder.name
            )));
        }
        self.store.put_folder(&folder).await.map_err(CoreError::from)
    }

    /// Remove an empty folder.
    pub async fn remove_folder(&self, name: &str) -> CoreResult<()> {
        if self.store.get_folder(name).await?.is_none() {
            return Err(CoreError::UnknownFolder(name.to_string()));
        }
        let jobs = self.store.list_jobs(Some(name)).await?;
        let optimizing = self.store.list_optimizing_jobs(Some(name)).await?;
        if !jobs.is_empty() || !optimizing.is_empty() {
            return Err(CoreError::InvalidValue(format!(
                "folder {} is not empty",
                name
            )));
        }
        self.store.delete_folder(name).await?;
        Ok(())
    }

    pub async fn list_folders(&self) -> CoreResult<Vec<JobFolder>> {
        Ok(self.store.list_folders().await?)
    }

    async fn ensure_folder_exists(&self, name: &str) -> CoreResult<()> {
        if name.is_empty() {
            // The default folder always exists.
            return Ok(());
        }
        match self.store.get_folder(name).await? {
            Some(_) => Ok(()),
            None => Err(CoreError::UnknownFolder(name.to_string())),
        }
    }

    // ========================================================================
    // Fleet
    // ========================================================================

    /// Issue explicit per-manager connect requests; one ack per manager.
    pub fn connect_clients(&self, requests: &HashMap<ClientId, u32>) -> Vec<ManagerAck> {
        self.managers.connect_clients(requests)
    }

    /// Plan and issue a fleet-wide connect for `total` additional clients.
    pub fn connect_total(&self, total: u32) -> ConnectSummary {
        self.managers.connect_total(total)
    }

    pub fn plan_connect(&self, total: u32) -> ConnectPlan {
        self.managers.plan(total)
    }

    pub fn start_clients(&self, manager: ClientId, count: u32) -> CoreResult<()> {
        self.managers.start_clients(manager, count)
    }

    pub fn stop_clients(&self, manager: ClientId, count: i32) -> CoreResult<()> {
        self.managers.stop_clients(manager, count)
    }

    pub fn disconnect_client(&self, id: ClientId, graceful: bool) -> CoreResult<()> {
        if graceful {
            self.registry.request_disconnect(id)
        } else {
            self.registry.force_disconnect(id)
        }
    }

    pub fn list_clients(&self, kind: ClientKind) -> Vec<ClientView> {
        self.registry.list_sorted(kind)
    }

    pub fn list_client_managers(&self) -> Vec<ManagerView> {
        self.registry.manager_views()
    }

    // ========================================================================
    // Plugins
    // ========================================================================

    /// Reload plugins from a catalog (the explicit "reload" command).
    pub fn reload_plugins(&self, catalog: &dyn PluginCatalog) -> CoreResult<()> {
        self.plugins.load(catalog)
    }

    pub fn job_class_names(&self) -> Vec<String> {
        self.plugins.job_class_names()
    }

    pub fn algorithm_names(&self) -> Vec<String> {
        self.plugins.algorithm_names()
    }
}

fn folder_option(target: &str) -> Option<String> {
    if target.is_empty() {
        None
    } else {
        Some(target.to_string())
    }
}
