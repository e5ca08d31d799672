//! Client-manager controller: start/stop commands toward manager daemons.
//!
//! The controller enforces capacity caps and the one-request-at-a-time rule;
//! it never retries. Completion is asynchronous: new load clients appear via
//! `ClientRegistry::register`, which credits the manager on the same host.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::info;

use crate::common::error::{CoreError, CoreResult};

use super::client::{ClientId, ManagerCommand};
use super::planner::{plan_connections, ConnectPlan};
use super::registry::ClientRegistry;

/// Per-manager acknowledgement of a connect request.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerAck {
    pub manager: ClientId,
    pub requested: u32,
    pub accepted: bool,
    pub error: Option<String>,
}

/// Result of a fleet-wide connect: per-manager acks plus the shortfall the
/// planner could not place.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectSummary {
    pub acks: Vec<ManagerAck>,
    pub shortfall: u32,
}

pub struct ClientManagerController {
    registry: Arc<ClientRegistry>,
}

impl ClientManagerController {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    /// Ask one manager to start `count` clients.
    pub fn start_clients(&self, manager: ClientId, count: u32) -> CoreResult<()> {
        if count == 0 {
            return Err(CoreError::InvalidValue("count must be at least 1".into()));
        }

        self.registry.with_manager(manager, |entry| {
            if entry.pending_starts > 0 {
                return Err(CoreError::ManagerBusy(format!(
                    "manager {} still has {} starts in flight",
                    manager, entry.pending_starts
                )));
            }

            if entry.max_clients > 0 {
                let headroom = entry
                    .max_clients
                    .saturating_sub(entry.started_clients + entry.pending_starts);
                if count > headroom {
                    return Err(CoreError::CapacityExceeded {
                        manager: manager.to_string(),
                        requested: count,
                        headroom,
                    });
                }
            }

            entry
                .commands
                .send(ManagerCommand::StartClients { count })
                .map_err(|_| CoreError::ManagerUnreachable(manager.to_string()))?;
            entry.pending_starts += count;
            Ok(())
        })??;

        info!(manager = %manager, count, "start-clients dispatched");
        Ok(())
    }

    /// Ask one manager to stop `count` clients; `-1` stops all of them.
    pub fn stop_clients(&self, manager: ClientId, count: i32) -> CoreResult<()> {
        let stop = match count {
            -1 => None,
            n if n > 0 => Some(n as u32),
            _ => {
                return Err(CoreError::InvalidValue(
                    "count must be positive or -1 for all".into(),
                ))
            }
        };

        self.registry.with_manager(manager, |entry| {
            entry
                .commands
                .send(ManagerCommand::StopClients { count: stop })
                .map_err(|_| CoreError::ManagerUnreachable(manager.to_string()))
        })??;

        info!(manager = %manager, count, "stop-clients dispatched");
        Ok(())
    }

    /// Issue explicit per-manager connect requests.
    pub fn connect_clients(&self, requests: &HashMap<ClientId, u32>) -> Vec<ManagerAck> {
        let mut acks: Vec<ManagerAck> = requests
            .iter()
            .map(|(manager, count)| match self.start_clients(*manager, *count) {
                Ok(()) => ManagerAck {
                    manager: *manager,
                    requested: *count,
                    accepted: true,
                    error: None,
                },
                Err(err) => ManagerAck {
                    manager: *manager,
                    requested: *count,
                    accepted: false,
                    error: Some(err.to_string()),
                },
            })
            .collect();
        acks.sort_by_key(|ack| ack.manager);
        acks
    }

    /// Plan a fleet-wide connect for `total` additional clients and issue the
    /// per-manager requests.
    pub fn connect_total(&self, total: u32) -> ConnectSummary {
        let plan = self.plan(total);
        let mut acks = Vec::new();
        for (manager, count) in &plan.allocations {
            if *count == 0 {
                continue;
            }
            let ack = match self.start_clients(*manager, *count) {
                Ok(()) => ManagerAck {
                    manager: *manager,
                    requested: *count,
                    accepted: true,
                    error: None,
                },
                Err(err) => ManagerAck {
                    manager: *manager,
                    requested: *count,
                    accepted: false,
                    error: Some(err.to_string()),
                },
            };
            acks.push(ack);
        }

        ConnectSummary {
            acks,
            shortfall: plan.shortfall,
        }
    }

    /// Planner output against the current capacity snapshot, without issuing
    /// any commands.
    pub fn plan(&self, total: u32) -> ConnectPlan {
        plan_connections(total, &self.registry.manager_capacities())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::client::ManagerRegistration;
    use crate::scheduler::SchedulerEvent;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<ClientRegistry>,
        controller: ClientManagerController,
        _events: mpsc::UnboundedReceiver<SchedulerEvent>,
    }

    fn fixture() -> Fixture {
        let (tx, rx) = mpsc::unbounded_channel();
        let registry = Arc::new(ClientRegistry::new(tx));
        let controller = ClientManagerController::new(registry.clone());
        Fixture {
            registry,
            controller,
            _events: rx,
        }
    }

    fn add_manager(
        fixture: &Fixture,
        name: &str,
        max_clients: u32,
    ) -> (ClientId, mpsc::UnboundedReceiver<ManagerCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = fixture
            .registry
            .register_manager(ManagerRegistration {
                name: name.into(),
                address: format!("{}.example:4000", name),
                max_clients,
                commands: tx,
            })
            .unwrap();
        (id, rx)
    }

    #[test]
    fn start_clients_sends_command_and_tracks_pending() {
        let fixture = fixture();
        let (id, mut rx) = add_manager(&fixture, "m1", 5);

        fixture.controller.start_clients(id, 3).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            ManagerCommand::StartClients { count: 3 }
        ));
        assert_eq!(fixture.registry.manager_views()[0].pending_starts, 3);
    }

    #[test]
    fn start_clients_rejects_over_capacity() {
        let fixture = fixture();
        let (id, _rx) = add_manager(&fixture, "m1", 2);

        let err = fixture.controller.start_clients(id, 3).unwrap_err();
        assert!(matches!(err, CoreError::CapacityExceeded { .. }));
    }

    #[test]
    fn busy_manager_rejects_second_request() {
        let fixture = fixture();
        let (id, _rx) = add_manager(&fixture, "m1", 10);

        fixture.controller.start_clients(id, 2).unwrap();
        let err = fixture.controller.start_clients(id, 1).unwrap_err();
        assert!(matches!(err, CoreError::ManagerBusy(_)));
    }

    #[test]
    fn dead_channel_is_unreachable() {
        let fixture = fixture();
        let (id, rx) = add_manager(&fixture, "m1", 10);
        drop(rx);

        let err = fixture.controller.start_clients(id, 1).unwrap_err();
        assert!(matches!(err, CoreError::ManagerUnreachable(_)));
    }

    #[test]
    fn stop_all_uses_sentinel() {
        let fixture = fixture();
        let (id, mut rx) = add_manager(&fixture, "m1", 10);

        fixture.controller.stop_clients(id, -1).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            ManagerCommand::StopClients { count: None }
        ));

        assert!(fixture.controller.stop_clients(id, 0).is_err());
    }

    #[test]
    fn connect_total_reports_shortfall() {
        let fixture = fixture();
        let (_a, _rx_a) = add_manager(&fixture, "m1", 2);
        let (_b, _rx_b) = add_manager(&fixture, "m2", 1);

        let summary = fixture.controller.connect_total(5);
        let accepted: u32 = summary
            .acks
            .iter()
            .filter(|ack| ack.accepted)
            .map(|ack| ack.requested)
            .sum();
        assert_eq!(accepted, 3);
        assert_eq!(summary.shortfall, 2);
    }
}
