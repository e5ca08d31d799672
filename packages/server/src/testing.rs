//! Test support: a simulated client fleet.
//!
//! Scripted workers register with the real [`ClientRegistry`], consume the
//! commands the scheduler dispatches, and post scheduler events the way live
//! connection tasks would. Integration tests drive whole scenarios (client
//! loss, duration stops, optimizing-job searches) without any sockets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::common::error::CoreResult;
use crate::fleet::{
    ClientCommand, ClientId, ClientRegistry, ManagerCommand, ManagerRegistration, Registration,
};
use crate::scheduler::SchedulerEvent;
use crate::server::Server;

/// How a simulated worker reacts to a job dispatch.
#[derive(Debug, Clone)]
pub enum WorkerScript {
    /// Post one stats payload after `delay`, then report completion.
    CompleteWith {
        payload: serde_json::Value,
        succeed: bool,
        delay: Duration,
    },
    /// Report a synthetic throughput keyed by the dispatched thread count;
    /// unknown thread counts complete without statistics.
    ThroughputByThreads {
        values: HashMap<u32, f64>,
        delay: Duration,
    },
    /// Keep running until the server sends stop, then flush and complete.
    RunUntilStopped { payload: serde_json::Value },
    /// Drop off the fleet the moment a job starts, without reporting.
    VanishOnStart,
    /// Accept the dispatch and never respond.
    Silent,
}

/// Handle for connecting scripted workers and managers to a server.
#[derive(Clone)]
pub struct SimulatedFleet {
    registry: Arc<ClientRegistry>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
}

impl SimulatedFleet {
    pub fn new(server: &Server) -> Self {
        Self {
            registry: server.registry(),
            events: server.scheduler().event_sender(),
        }
    }

    /// Connect one scripted load worker.
    pub fn connect_worker(
        &self,
        name: &str,
        address: &str,
        script: WorkerScript,
    ) -> CoreResult<ClientId> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.registry.register(Registration {
            name: name.to_string(),
            address: address.to_string(),
            commands: tx,
        })?;
        self.spawn_worker_task(id, address.to_string(), rx, script);
        Ok(id)
    }

    /// Connect one scripted resource-monitor worker.
    pub fn connect_monitor(
        &self,
        name: &str,
        address: &str,
        script: WorkerScript,
    ) -> CoreResult<ClientId> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.registry.register_monitor(Registration {
            name: name.to_string(),
            address: address.to_string(),
            commands: tx,
        })?;
        self.spawn_worker_task(id, address.to_string(), rx, script);
        Ok(id)
    }

    /// Connect a simulated client-manager daemon. On `StartClients` it
    /// registers that many fresh workers on its host, each running
    /// `worker_script`.
    pub fn connect_manager(
        &self,
        name: &str,
        host: &str,
        max_clients: u32,
        worker_script: WorkerScript,
    ) -> CoreResult<ClientId> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = self.registry.register_manager(ManagerRegistration {
            name: name.to_string(),
            address: format!("{}:4000", host),
            max_clients,
            commands: tx,
        })?;

        let fleet = self.clone();
        let host = host.to_string();
        let manager_name = name.to_string();
        tokio::spawn(async move {
            let mut spawned: Vec<ClientId> = Vec::new();
            let mut next_port = 3001u32;
            while let Some(command) = rx.recv().await {
                match command {
                    ManagerCommand::StartClients { count } => {
                        for _ in 0..count {
                            let worker_name = format!("{}-worker-{}", manager_name, next_port);
                            let address = format!("{}:{}", host, next_port);
                            next_port += 1;
                            if let Ok(worker) = fleet.connect_worker(
                                &worker_name,
                                &address,
                                worker_script.clone(),
                            ) {
                                spawned.push(worker);
                            }
                        }
                    }
                    ManagerCommand::StopClients { count } => {
                        let stop = count.map(|n| n as usize).unwrap_or(spawned.len());
                        for worker in spawned.drain(..stop.min(spawned.len())) {
                            fleet.registry.unregister(worker, true);
                        }
                    }
                }
            }
        });
        Ok(id)
    }

    fn spawn_worker_task(
        &self,
        id: ClientId,
        address: String,
        mut rx: mpsc::UnboundedReceiver<ClientCommand>,
        script: WorkerScript,
    ) {
        let registry = self.registry.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    ClientCommand::StartJob(dispatch) => match &script {
                        WorkerScript::CompleteWith {
                            payload,
                            succeed,
                            delay,
                        } => {
                            tokio::time::sleep(*delay).await;
                            let _ = events.send(SchedulerEvent::StatsChunk {
                                client: id,
                                address: address.clone(),
                                job: dispatch.job_id.clone(),
                                payload: payload.clone(),
                            });
                            let _ = events.send(SchedulerEvent::JobCompleted {
                                client: id,
                                job: dispatch.job_id,
                                succeeded: *succeed,
                            });
                        }
                        WorkerScript::ThroughputByThreads { values, delay } => {
                            tokio::time::sleep(*delay).await;
                            if let Some(value) = values.get(&dispatch.threads_per_client) {
                                let _ = events.send(SchedulerEvent::StatsChunk {
                                    client: id,
                                    address: address.clone(),
                                    job: dispatch.job_id.clone(),
                                    payload: serde_json::json!({ "throughput": value }),
                                });
                            }
                            let _ = events.send(SchedulerEvent::JobCompleted {
                                client: id,
                                job: dispatch.job_id,
                                succeeded: true,
                            });
                        }
                        WorkerScript::RunUntilStopped { .. } => {
                            // Wait for the StopJob command.
                        }
                        WorkerScript::VanishOnStart => {
                            registry.unregister(id, false);
                            return;
                        }
                        WorkerScript::Silent => {}
                    },
                    ClientCommand::StopJob { job_id } => {
                        if let WorkerScript::RunUntilStopped { payload } = &script {
                            let _ = events.send(SchedulerEvent::StatsChunk {
                                client: id,
                                address: address.clone(),
                                job: job_id.clone(),
                                payload: payload.clone(),
                            });
                            let _ = events.send(SchedulerEvent::JobCompleted {
                                client: id,
                                job: job_id,
                                succeeded: true,
                            });
                        }
                    }
                    ClientCommand::Disconnect { graceful } => {
                        registry.unregister(id, graceful);
                        return;
                    }
                }
            }
        });
    }
}
