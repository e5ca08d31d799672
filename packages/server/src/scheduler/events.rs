//! Events flowing into the scheduler's inbox.
//!
//! Per-connection tasks and the client registry only ever *post* these; the
//! scheduler loop is the sole consumer. Within one job, events arrive in the
//! order its clients emitted them.

use crate::common::id::JobId;
use crate::fleet::{ClientId, ClientKind};

#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A worker connection registered with the fleet.
    ClientRegistered { client: ClientId, kind: ClientKind },

    /// A worker connection went away. `job` is the job the client was part
    /// of, if any; `graceful` means in-flight statistics were flushed first.
    ClientDisconnected {
        client: ClientId,
        kind: ClientKind,
        job: Option<JobId>,
        graceful: bool,
    },

    /// A statistics payload from a client running a job.
    StatsChunk {
        client: ClientId,
        address: String,
        job: JobId,
        payload: serde_json::Value,
    },

    /// A client finished its part of a job.
    JobCompleted {
        client: ClientId,
        job: JobId,
        succeeded: bool,
    },
}
