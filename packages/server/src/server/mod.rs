//! Server wiring: one explicit value owning every core component.
//!
//! There are no process-wide singletons; request handlers receive the
//! [`AccessPoints`] surface and worker connection tasks go through the
//! [`ClientRegistry`]. Startup recovers persisted state: pending jobs
//! re-enter the queue, jobs caught mid-run by a crash are settled, and
//! non-terminal optimizing jobs get their controllers respawned.

use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::common::error::CoreResult;
use crate::common::id::IdAllocator;
use crate::config::ServerConfig;
use crate::fleet::{ClientManagerController, ClientRegistry};
use crate::jobs::JobState;
use crate::optimize::{spawn_controller, ControllerSet};
use crate::plugins::{PluginCatalog, PluginRegistry};
use crate::scheduler::{AccessPoints, Scheduler, SchedulerEvent, Watchdog};
use crate::store::ConfigStore;

pub struct Server {
    config: ServerConfig,
    store: Arc<dyn ConfigStore>,
    registry: Arc<ClientRegistry>,
    plugins: Arc<PluginRegistry>,
    ids: Arc<IdAllocator>,
    scheduler: Arc<Scheduler>,
    managers: Arc<ClientManagerController>,
    controllers: Arc<ControllerSet>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Server {
    /// Build every component, spawn the scheduler loop and the watchdog, and
    /// recover persisted state.
    pub async fn start(
        config: ServerConfig,
        store: Arc<dyn ConfigStore>,
        catalog: &dyn PluginCatalog,
    ) -> CoreResult<Arc<Self>> {
        let plugins = Arc::new(PluginRegistry::new());
        plugins.load(catalog)?;

        let ids = Arc::new(IdAllocator::new(store.clone()).await?);
        let shutdown = CancellationToken::new();

        let (events_tx, events_rx) = tokio::sync::mpsc::unbounded_channel::<SchedulerEvent>();
        let registry = Arc::new(ClientRegistry::new(events_tx.clone()));
        let scheduler = Arc::new(Scheduler::new(
            config.scheduler_config(),
            store.clone(),
            registry.clone(),
            ids.clone(),
            plugins.clone(),
            events_tx,
            events_rx,
            shutdown.clone(),
        ));
        let managers = Arc::new(ClientManagerController::new(registry.clone()));
        let controllers = Arc::new(ControllerSet::new());

        let server = Arc::new(Self {
            config,
            store,
            registry,
            plugins,
            ids,
            scheduler: scheduler.clone(),
            managers,
            controllers,
            shutdown: shutdown.clone(),
            tasks: Mutex::new(Vec::new()),
        });

        {
            let mut tasks = server.tasks.lock().unwrap_or_else(|e| e.into_inner());
            tasks.push(tokio::spawn(scheduler.clone().run()));
            tasks.push(tokio::spawn(
                Watchdog::new(scheduler, server.config.watchdog_interval(), shutdown).run(),
            ));
        }

        server.recover().await?;
        info!("server started");
        Ok(server)
    }

    /// Recover persisted state after a restart.
    async fn recover(&self) -> CoreResult<()> {
        let mut restored = 0usize;
        let mut interrupted = 0usize;
        let mut pending = Vec::new();

        for mut job in self.store.list_jobs(None).await? {
            match job.state {
                JobState::NotYetStarted | JobState::Disabled => {
                    restored += 1;
                    pending.push(job);
                }
                JobState::Running => {
                    // The fleet that ran this job is gone with the old
                    // process.
                    job.transition(JobState::StoppedByShutdown)?;
                    job.stop_reason = Some("server restarted during run".into());
                    self.store.put_job(&job).await?;
                    interrupted += 1;
                }
                _ => {}
            }
        }
        self.scheduler.restore_pending(pending);

        let mut resumed = 0usize;
        for mut record in self.store.list_optimizing_jobs(None).await? {
            if record.state.is_terminal() {
                continue;
            }

            match self.plugins.new_algorithm(&record.spec.algorithm) {
                Some(mut algorithm) => {
                    match algorithm.initialize(&record, &record.spec.algorithm_parameters) {
                        Ok(()) => {
                            spawn_controller(
                                record,
                                algorithm,
                                self.scheduler.clone(),
                                self.store.clone(),
                                self.controllers.clone(),
                                self.config.controller_config(),
                            );
                            resumed += 1;
                        }
                        Err(err) => {
                            warn!(
                                optimizing_job = %record.id,
                                error = %err,
                                "algorithm rejected persisted parameters; failing record"
                            );
                            record.state = JobState::StoppedDueToError;
                            self.store.put_optimizing_job(&record).await?;
                        }
                    }
                }
                None => {
                    error!(
                        optimizing_job = %record.id,
                        algorithm = %record.spec.algorithm,
                        "algorithm plugin no longer available; failing record"
                    );
                    record.state = JobState::StoppedDueToError;
                    self.store.put_optimizing_job(&record).await?;
                }
            }
        }

        if restored + interrupted + resumed > 0 {
            info!(
                pending = restored,
                interrupted,
                optimizing_resumed = resumed,
                "recovered persisted state"
            );
        }
        Ok(())
    }

    /// The stable operation surface handed to the admin layer.
    pub fn access(&self) -> AccessPoints {
        AccessPoints::new(
            self.scheduler.clone(),
            self.store.clone(),
            self.registry.clone(),
            self.managers.clone(),
            self.plugins.clone(),
            self.ids.clone(),
            self.controllers.clone(),
            self.config.controller_config(),
            self.config.accept_one_as_truthy,
        )
    }

    /// Registry used by worker connection tasks.
    pub fn registry(&self) -> Arc<ClientRegistry> {
        self.registry.clone()
    }

    pub fn scheduler(&self) -> Arc<Scheduler> {
        self.scheduler.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn is_available(&self) -> bool {
        self.scheduler.is_available()
    }

    /// Stop accepting work, drain running jobs within the grace period, and
    /// join the background tasks.
    pub async fn shutdown(&self) {
        info!("server shutting down");
        self.shutdown.cancel();

        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            let _ = task.await;
        }
        info!("server stopped");
    }
}
