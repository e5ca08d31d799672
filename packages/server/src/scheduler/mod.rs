// Scheduling: the central loop that matches jobs to clients and drives every
// state transition, plus the admin-facing access points and the watchdog.

mod access;
mod core;
mod events;
mod watchdog;

pub use access::AccessPoints;
pub use core::{Scheduler, SchedulerConfig};
pub use events::SchedulerEvent;
pub use watchdog::Watchdog;
