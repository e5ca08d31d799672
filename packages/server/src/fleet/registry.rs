//! Client registry: the sole owner of fleet connection state.
//!
//! Three tables (load clients, resource monitors, client managers) behind a
//! single mutex. Picks are atomic with respect to concurrent disconnects, and
//! no caller ever suspends while the mutex is held. The registry posts
//! `Registered` / `Disconnected` events into the scheduler inbox; it never
//! touches scheduler state directly.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::common::error::{CoreError, CoreResult};
use crate::common::id::JobId;
use crate::jobs::Job;
use crate::scheduler::SchedulerEvent;

use super::client::{
    ClientCommand, ClientId, ClientKind, ClientStatus, ClientView, ManagerCommand,
    ManagerRegistration, ManagerView, Registration,
};
use super::planner::ManagerCapacity;

struct LoadEntry {
    id: ClientId,
    name: String,
    address: String,
    established_at: DateTime<Utc>,
    status: ClientStatus,
    assigned_job: Option<JobId>,
    idle_since: DateTime<Utc>,
    commands: mpsc::UnboundedSender<ClientCommand>,
}

struct MonitorEntry {
    id: ClientId,
    name: String,
    address: String,
    established_at: DateTime<Utc>,
    status: ClientStatus,
    jobs_in_progress: HashSet<JobId>,
    commands: mpsc::UnboundedSender<ClientCommand>,
}

pub(crate) struct ManagerEntry {
    id: ClientId,
    name: String,
    address: String,
    established_at: DateTime<Utc>,
    pub(crate) started_clients: u32,
    pub(crate) pending_starts: u32,
    pub(crate) max_clients: u32,
    pub(crate) commands: mpsc::UnboundedSender<ManagerCommand>,
}

#[derive(Default)]
struct Tables {
    load: HashMap<ClientId, LoadEntry>,
    monitors: HashMap<ClientId, MonitorEntry>,
    managers: HashMap<ClientId, ManagerEntry>,
}

/// Why a pick could not be satisfied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PickError {
    /// Not enough idle clients right now; the job stays pending.
    Insufficient { needed: usize, available: usize },
    /// An explicitly requested client is missing or busy.
    RequestedUnavailable { address: String },
}

/// One chosen client plus the channel used to dispatch to it.
pub struct PickedClient {
    pub id: ClientId,
    pub address: String,
    pub commands: mpsc::UnboundedSender<ClientCommand>,
}

/// Result of a successful pick: the job's worker set plus any monitors.
pub struct PickedClients {
    pub load: Vec<PickedClient>,
    pub monitors: Vec<PickedClient>,
}

pub struct ClientRegistry {
    tables: Mutex<Tables>,
    events: mpsc::UnboundedSender<SchedulerEvent>,
}

impl ClientRegistry {
    pub fn new(events: mpsc::UnboundedSender<SchedulerEvent>) -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            events,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: SchedulerEvent) {
        // The receiver only goes away during shutdown.
        let _ = self.events.send(event);
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Register a load client. Fails `DuplicateClient` when the self-declared
    /// name collides with a live load entry.
    pub fn register(&self, registration: Registration) -> CoreResult<ClientId> {
        let id = Uuid::new_v4();
        {
            let mut tables = self.lock();
            if tables.load.values().any(|e| e.name == registration.name) {
                return Err(CoreError::DuplicateClient(registration.name));
            }

            let now = Utc::now();
            tables.load.insert(
                id,
                LoadEntry {
                    id,
                    name: registration.name.clone(),
                    address: registration.address.clone(),
                    established_at: now,
                    status: ClientStatus::Idle,
                    assigned_job: None,
                    idle_since: now,
                    commands: registration.commands,
                },
            );

            // Credit the manager on the same host, if any: a newly appearing
            // load client is how start-clients requests complete.
            let host = host_of(&registration.address);
            if let Some(manager) = tables.managers.values_mut().find(|m| host_of(&m.address) == host)
            {
                manager.started_clients += 1;
                manager.pending_starts = manager.pending_starts.saturating_sub(1);
            }
        }

        info!(client = %id, address = %registration.address, "load client registered");
        self.emit(SchedulerEvent::ClientRegistered {
            client: id,
            kind: ClientKind::Load,
        });
        Ok(id)
    }

    /// Register a resource-monitor client.
    pub fn register_monitor(&self, registration: Registration) -> CoreResult<ClientId> {
        let id = Uuid::new_v4();
        {
            let mut tables = self.lock();
            if tables.monitors.values().any(|e| e.name == registration.name) {
                return Err(CoreError::DuplicateClient(registration.name));
            }

            tables.monitors.insert(
                id,
                MonitorEntry {
                    id,
                    name: registration.name.clone(),
                    address: registration.address.clone(),
                    established_at: Utc::now(),
                    status: ClientStatus::Idle,
                    jobs_in_progress: HashSet::new(),
                    commands: registration.commands,
                },
            );
        }

        info!(client = %id, address = %registration.address, "monitor client registered");
        self.emit(SchedulerEvent::ClientRegistered {
            client: id,
            kind: ClientKind::Monitor,
        });
        Ok(id)
    }

    /// Register a client-manager daemon.
    pub fn register_manager(&self, registration: ManagerRegistration) -> CoreResult<ClientId> {
        let id = Uuid::new_v4();
        {
            let mut tables = self.lock();
            if tables.managers.values().any(|e| e.name == registration.name) {
                return Err(CoreError::DuplicateClient(registration.name));
            }

            tables.managers.insert(
                id,
                ManagerEntry {
                    id,
                    name: registration.name.clone(),
                    address: registration.address.clone(),
                    established_at: Utc::now(),
                    started_clients: 0,
                    pending_starts: 0,
                    max_clients: registration.max_clients,
                    commands: registration.commands,
                },
            );
        }

        info!(client = %id, address = %registration.address, "client manager registered");
        self.emit(SchedulerEvent::ClientRegistered {
            client: id,
            kind: ClientKind::Manager,
        });
        Ok(id)
    }

    /// Remove a connection that went away. The scheduler learns about it from
    /// the emitted `ClientDisconnected` event and reacts if the client was
    /// part of a running job.
    pub fn unregister(&self, id: ClientId, graceful: bool) {
        let event = {
            let mut tables = self.lock();
            if let Some(entry) = tables.load.remove(&id) {
                let host = host_of(&entry.address);
                if let Some(manager) =
                    tables.managers.values_mut().find(|m| host_of(&m.address) == host)
                {
                    manager.started_clients = manager.started_clients.saturating_sub(1);
                }
                Some(SchedulerEvent::ClientDisconnected {
                    client: id,
                    kind: ClientKind::Load,
                    job: entry.assigned_job,
                    graceful,
                })
            } else if tables.monitors.remove(&id).is_some() {
                Some(SchedulerEvent::ClientDisconnected {
                    client: id,
                    kind: ClientKind::Monitor,
                    job: None,
                    graceful,
                })
            } else if tables.managers.remove(&id).is_some() {
                Some(SchedulerEvent::ClientDisconnected {
                    client: id,
                    kind: ClientKind::Manager,
                    job: None,
                    graceful,
                })
            } else {
                None
            }
        };

        match event {
            Some(event) => {
                debug!(client = %id, graceful, "client unregistered");
                self.emit(event);
            }
            None => warn!(client = %id, "unregister for unknown client"),
        }
    }

    // ========================================================================
    // Picking
    // ========================================================================

    /// Choose the worker set for a job and atomically mark it assigned.
    ///
    /// Explicitly requested clients must all be idle and present; the rest of
    /// the worker set is filled longest-idle-first. Monitor resolution
    /// follows `monitor_clients_if_available`.
    pub fn pick_for_job(&self, job: &Job) -> Result<PickedClients, PickError> {
        let mut tables = self.lock();
        let needed = job.spec.num_clients as usize;

        let mut chosen: Vec<ClientId> = Vec::with_capacity(needed);

        // Requested clients first; all of them must be available.
        for address in &job.spec.requested_clients {
            let entry = tables
                .load
                .values()
                .find(|e| e.address == *address && e.status == ClientStatus::Idle)
                .ok_or_else(|| PickError::RequestedUnavailable {
                    address: address.clone(),
                })?;
            chosen.push(entry.id);
        }

        // Fill the remainder, longest idle first.
        let mut idle: Vec<(&ClientId, &LoadEntry)> = tables
            .load
            .iter()
            .filter(|(id, e)| e.status == ClientStatus::Idle && !chosen.contains(*id))
            .collect();
        idle.sort_by_key(|(_, e)| e.idle_since);

        let available = chosen.len() + idle.len();
        if available < needed {
            return Err(PickError::Insufficient { needed, available });
        }
        chosen.extend(idle.iter().take(needed - chosen.len()).map(|(id, _)| **id));

        // Monitors: resolve addresses; missing ones fail unless the job asked
        // for best-effort monitoring.
        let mut monitor_ids: Vec<ClientId> = Vec::new();
        for address in &job.spec.monitor_clients {
            match tables.monitors.values().find(|e| e.address == *address) {
                Some(entry) => monitor_ids.push(entry.id),
                None if job.spec.monitor_clients_if_available => {}
                None => {
                    return Err(PickError::RequestedUnavailable {
                        address: address.clone(),
                    })
                }
            }
        }

        // All checks passed; commit the assignment.
        let mut picked = PickedClients {
            load: Vec::with_capacity(chosen.len()),
            monitors: Vec::with_capacity(monitor_ids.len()),
        };
        for id in &chosen {
            let entry = tables.load.get_mut(id).expect("chosen entry exists");
            entry.status = ClientStatus::Assigned;
            entry.assigned_job = Some(job.id.clone());
            picked.load.push(PickedClient {
                id: *id,
                address: entry.address.clone(),
                commands: entry.commands.clone(),
            });
        }
        for id in &monitor_ids {
            let entry = tables.monitors.get_mut(id).expect("chosen monitor exists");
            entry.status = ClientStatus::Running;
            entry.jobs_in_progress.insert(job.id.clone());
            picked.monitors.push(PickedClient {
                id: *id,
                address: entry.address.clone(),
                commands: entry.commands.clone(),
            });
        }

        Ok(picked)
    }

    /// Mark dispatched clients as running.
    pub fn mark_running(&self, ids: &[ClientId]) {
        let mut tables = self.lock();
        for id in ids {
            if let Some(entry) = tables.load.get_mut(id) {
                entry.status = ClientStatus::Running;
            }
        }
    }

    /// Mark clients whose stop signal was sent; they are flushing statistics.
    pub fn mark_reporting(&self, ids: &[ClientId]) {
        let mut tables = self.lock();
        for id in ids {
            if let Some(entry) = tables.load.get_mut(id) {
                if entry.status == ClientStatus::Running || entry.status == ClientStatus::Assigned {
                    entry.status = ClientStatus::Reporting;
                }
            }
        }
    }

    /// Return a load client to the idle pool.
    pub fn release(&self, id: ClientId) {
        let mut tables = self.lock();
        if let Some(entry) = tables.load.get_mut(&id) {
            entry.status = ClientStatus::Idle;
            entry.assigned_job = None;
            entry.idle_since = Utc::now();
        }
    }

    /// Detach a monitor from a finished job.
    pub fn release_monitor(&self, id: ClientId, job: &JobId) {
        let mut tables = self.lock();
        if let Some(entry) = tables.monitors.get_mut(&id) {
            entry.jobs_in_progress.remove(job);
            if entry.jobs_in_progress.is_empty() {
                entry.status = ClientStatus::Idle;
            }
        }
    }

    /// Command channel for a load or monitor client.
    pub fn command_sender(&self, id: ClientId) -> Option<mpsc::UnboundedSender<ClientCommand>> {
        let tables = self.lock();
        tables
            .load
            .get(&id)
            .map(|e| e.commands.clone())
            .or_else(|| tables.monitors.get(&id).map(|e| e.commands.clone()))
    }

    // ========================================================================
    // Disconnects
    // ========================================================================

    /// Ask a client to disconnect after flushing in-flight statistics.
    pub fn request_disconnect(&self, id: ClientId) -> CoreResult<()> {
        let sender = {
            let mut tables = self.lock();
            if let Some(entry) = tables.load.get_mut(&id) {
                entry.status = ClientStatus::Disconnecting;
                entry.commands.clone()
            } else if let Some(entry) = tables.monitors.get_mut(&id) {
                entry.status = ClientStatus::Disconnecting;
                entry.commands.clone()
            } else {
                return Err(CoreError::NotFound(format!("client {}", id)));
            }
        };

        let _ = sender.send(ClientCommand::Disconnect { graceful: true });
        Ok(())
    }

    /// Drop a client immediately, discarding anything in flight.
    pub fn force_disconnect(&self, id: ClientId) -> CoreResult<()> {
        let known = {
            let tables = self.lock();
            tables.load.contains_key(&id)
                || tables.monitors.contains_key(&id)
                || tables.managers.contains_key(&id)
        };
        if !known {
            return Err(CoreError::NotFound(format!("client {}", id)));
        }

        if let Some(sender) = self.command_sender(id) {
            let _ = sender.send(ClientCommand::Disconnect { graceful: false });
        }
        self.unregister(id, false);
        Ok(())
    }

    // ========================================================================
    // Managers
    // ========================================================================

    /// Run `f` against a manager entry under the registry mutex.
    pub(crate) fn with_manager<R>(
        &self,
        id: ClientId,
        f: impl FnOnce(&mut ManagerEntry) -> R,
    ) -> CoreResult<R> {
        let mut tables = self.lock();
        let entry = tables
            .managers
            .get_mut(&id)
            .ok_or_else(|| CoreError::NotFound(format!("client manager {}", id)))?;
        Ok(f(entry))
    }

    /// Capacity snapshot for the fleet-wide connect planner.
    pub fn manager_capacities(&self) -> Vec<ManagerCapacity> {
        let tables = self.lock();
        let mut capacities: Vec<ManagerCapacity> = tables
            .managers
            .values()
            .map(|m| ManagerCapacity {
                id: m.id,
                in_use: m.started_clients + m.pending_starts,
                max_clients: m.max_clients,
            })
            .collect();
        capacities.sort_by_key(|c| c.id);
        capacities
    }

    // ========================================================================
    // Listings
    // ========================================================================

    /// Deterministic listing for status display: by address, then
    /// establishment time.
    pub fn list_sorted(&self, kind: ClientKind) -> Vec<ClientView> {
        let tables = self.lock();
        let mut views: Vec<ClientView> = match kind {
            ClientKind::Load => tables
                .load
                .values()
                .map(|e| ClientView {
                    id: e.id,
                    name: e.name.clone(),
                    address: e.address.clone(),
                    kind: ClientKind::Load,
                    established_at: e.established_at,
                    status: e.status,
                    assigned_job: e.assigned_job.clone(),
                })
                .collect(),
            ClientKind::Monitor => tables
                .monitors
                .values()
                .map(|e| ClientView {
                    id: e.id,
                    name: e.name.clone(),
                    address: e.address.clone(),
                    kind: ClientKind::Monitor,
                    established_at: e.established_at,
                    status: e.status,
                    assigned_job: None,
                })
                .collect(),
            ClientKind::Manager => tables
                .managers
                .values()
                .map(|e| ClientView {
                    id: e.id,
                    name: e.name.clone(),
                    address: e.address.clone(),
                    kind: ClientKind::Manager,
                    established_at: e.established_at,
                    status: ClientStatus::Idle,
                    assigned_job: None,
                })
                .collect(),
        };

        views.sort_by(|a, b| {
            a.address
                .cmp(&b.address)
                .then(a.established_at.cmp(&b.established_at))
        });
        views
    }

    pub fn manager_views(&self) -> Vec<ManagerView> {
        let tables = self.lock();
        let mut views: Vec<ManagerView> = tables
            .managers
            .values()
            .map(|m| ManagerView {
                id: m.id,
                name: m.name.clone(),
                address: m.address.clone(),
                established_at: m.established_at,
                started_clients: m.started_clients,
                pending_starts: m.pending_starts,
                max_clients: m.max_clients,
            })
            .collect();
        views.sort_by(|a, b| {
            a.address
                .cmp(&b.address)
                .then(a.established_at.cmp(&b.established_at))
        });
        views
    }

    pub fn idle_load_clients(&self) -> usize {
        self.lock()
            .load
            .values()
            .filter(|e| e.status == ClientStatus::Idle)
            .count()
    }
}

fn host_of(address: &str) -> &str {
    address.rsplit_once(':').map(|(host, _)| host).unwrap_or(address)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::id::JobId;
    use crate::jobs::JobTemplate;

    fn registry() -> (ClientRegistry, mpsc::UnboundedReceiver<SchedulerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ClientRegistry::new(tx), rx)
    }

    fn connect(registry: &ClientRegistry, name: &str, address: &str) -> ClientId {
        let (tx, _rx) = mpsc::unbounded_channel();
        registry
            .register(Registration {
                name: name.into(),
                address: address.into(),
                commands: tx,
            })
            .unwrap()
    }

    fn job(num_clients: u32) -> Job {
        Job::from_template(
            JobId::new("j1"),
            JobTemplate::builder()
                .job_class("swarm.builtin.NoOpJob")
                .start_time(Utc::now())
                .num_clients(num_clients)
                .build(),
        )
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let (registry, _rx) = registry();
        connect(&registry, "c1", "10.0.0.1:3000");
        let (tx, _rx2) = mpsc::unbounded_channel();
        let err = registry
            .register(Registration {
                name: "c1".into(),
                address: "10.0.0.2:3000".into(),
                commands: tx,
            })
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicateClient(_)));
    }

    #[test]
    fn pick_prefers_longest_idle() {
        let (registry, _rx) = registry();
        let first = connect(&registry, "c1", "10.0.0.1:3000");
        let second = connect(&registry, "c2", "10.0.0.2:3000");

        // Cycle the second client through a release so its idle_since is
        // newer than the first's.
        registry.mark_running(&[second]);
        registry.release(second);

        let picked = registry.pick_for_job(&job(1)).unwrap();
        assert_eq!(picked.load.len(), 1);
        assert_eq!(picked.load[0].id, first);
    }

    #[test]
    fn pick_fails_when_requested_client_is_busy() {
        let (registry, _rx) = registry();
        connect(&registry, "c1", "10.0.0.1:3000");
        connect(&registry, "c2", "10.0.0.2:3000");

        let mut wanted = job(1);
        wanted.spec.requested_clients = vec!["10.0.0.1:3000".into()];
        let first_pick = registry.pick_for_job(&wanted).unwrap();
        assert_eq!(first_pick.load[0].address, "10.0.0.1:3000");

        let mut second = job(1);
        second.id = JobId::new("j2");
        second.spec.requested_clients = vec!["10.0.0.1:3000".into()];
        assert!(matches!(
            registry.pick_for_job(&second),
            Err(PickError::RequestedUnavailable { .. })
        ));
    }

    #[test]
    fn pick_reports_insufficient() {
        let (registry, _rx) = registry();
        connect(&registry, "c1", "10.0.0.1:3000");

        match registry.pick_for_job(&job(3)) {
            Err(PickError::Insufficient { needed, available }) => {
                assert_eq!(needed, 3);
                assert_eq!(available, 1);
            }
            _ => panic!("expected Insufficient"),
        }
    }

    #[test]
    fn assigned_clients_are_not_picked_twice() {
        let (registry, _rx) = registry();
        connect(&registry, "c1", "10.0.0.1:3000");
        connect(&registry, "c2", "10.0.0.2:3000");

        registry.pick_for_job(&job(2)).unwrap();
        let mut second = job(1);
        second.id = JobId::new("j2");
        assert!(registry.pick_for_job(&second).is_err());
    }

    #[test]
    fn disconnect_of_assigned_client_reports_its_job() {
        let (registry, mut rx) = registry();
        let id = connect(&registry, "c1", "10.0.0.1:3000");
        registry.pick_for_job(&job(1)).unwrap();

        registry.unregister(id, false);

        let mut saw_disconnect = false;
        while let Ok(event) = rx.try_recv() {
            if let SchedulerEvent::ClientDisconnected { client, job, .. } = event {
                assert_eq!(client, id);
                assert_eq!(job, Some(JobId::new("j1")));
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
    }

    #[test]
    fn listings_sort_by_address_then_establishment() {
        let (registry, _rx) = registry();
        connect(&registry, "c2", "10.0.0.2:3000");
        connect(&registry, "c1", "10.0.0.1:3000");

        let views = registry.list_sorted(ClientKind::Load);
        assert_eq!(views[0].address, "10.0.0.1:3000");
        assert_eq!(views[1].address, "10.0.0.2:3000");
    }

    #[test]
    fn manager_capacity_counts_pending_starts() {
        let (registry, _rx) = registry();
        let (tx, _mrx) = mpsc::unbounded_channel();
        let manager = registry
            .register_manager(ManagerRegistration {
                name: "m1".into(),
                address: "10.0.0.9:4000".into(),
                max_clients: 5,
                commands: tx,
            })
            .unwrap();

        registry
            .with_manager(manager, |m| m.pending_starts = 2)
            .unwrap();
        let capacities = registry.manager_capacities();
        assert_eq!(capacities[0].in_use, 2);

        // A load client appearing on the manager's host converts a pending
        // start into a started client.
        connect(&registry, "spawned", "10.0.0.9:3001");
        let views = registry.manager_views();
        assert_eq!(views[0].started_clients, 1);
        assert_eq!(views[0].pending_starts, 1);
    }
}
