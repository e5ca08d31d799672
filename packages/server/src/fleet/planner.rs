//! Fleet-wide connect planner.
//!
//! Given a desired number of additional load clients and the managers'
//! current capacity, compute a per-manager allocation that respects every
//! cap, spreads as evenly as possible, and reports the shortfall when total
//! capacity runs out.

use super::client::ClientId;

/// Capacity snapshot of one client manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerCapacity {
    pub id: ClientId,
    /// Clients already started plus starts still materializing.
    pub in_use: u32,
    /// Hard cap; 0 means unlimited.
    pub max_clients: u32,
}

impl ManagerCapacity {
    fn headroom(&self) -> u32 {
        if self.max_clients == 0 {
            u32::MAX
        } else {
            self.max_clients.saturating_sub(self.in_use)
        }
    }
}

/// Outcome of planning: how many clients each manager should start, and how
/// many of the requested total could not be placed anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectPlan {
    pub allocations: Vec<(ClientId, u32)>,
    pub shortfall: u32,
}

impl ConnectPlan {
    pub fn total_allocated(&self) -> u32 {
        self.allocations.iter().map(|(_, n)| n).sum()
    }
}

/// Round-robin allocation: one client per manager per pass, skipping managers
/// at capacity, until the total is reached or a full pass makes no progress.
pub fn plan_connections(total: u32, managers: &[ManagerCapacity]) -> ConnectPlan {
    let mut allocations: Vec<u32> = vec![0; managers.len()];
    let mut remaining = total;

    while remaining > 0 {
        let mut progressed = false;
        for (index, manager) in managers.iter().enumerate() {
            if remaining == 0 {
                break;
            }
            if allocations[index] < manager.headroom() {
                allocations[index] += 1;
                remaining -= 1;
                progressed = true;
            }
        }
        if !progressed {
            break;
        }
    }

    ConnectPlan {
        allocations: managers
            .iter()
            .zip(allocations)
            .map(|(manager, count)| (manager.id, count))
            .collect(),
        shortfall: remaining,
    }
}
