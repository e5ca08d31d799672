// Fleet management: the three worker-connection tables and everything that
// grows or shrinks them.
//
// The registry owns connection state; the manager controller and the connect
// planner sit on top of it. Nothing here blocks: commands go out over
// per-connection channels, and replies come back as scheduler events.

mod client;
mod manager;
mod planner;
mod registry;

pub use client::{
    ClientCommand, ClientId, ClientKind, ClientStatus, ClientView, JobDispatch, ManagerCommand,
    ManagerRegistration, ManagerView, Registration,
};
pub use manager::{ClientManagerController, ConnectSummary, ManagerAck};
pub use planner::{plan_connections, ConnectPlan, ManagerCapacity};
pub use registry::{ClientRegistry, PickError, PickedClient, PickedClients};
