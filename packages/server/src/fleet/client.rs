//! Client-facing types: identities, statuses, and the commands the server
//! sends over a worker's connection.
//!
//! The wire protocol itself lives outside the core; a per-connection task
//! owns the socket, forwards [`ClientCommand`]s to the worker, and posts
//! scheduler events for whatever comes back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::common::id::JobId;
use crate::common::params::ParameterList;
use crate::jobs::Job;

/// Connection-scoped client identifier, assigned at registration.
pub type ClientId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    /// Executes job-class logic.
    Load,
    /// Reports host metrics alongside a job.
    Monitor,
    /// Daemon able to spawn and reap local load clients.
    Manager,
}

impl std::fmt::Display for ClientKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            ClientKind::Load => "load",
            ClientKind::Monitor => "monitor",
            ClientKind::Manager => "manager",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Idle,
    /// Picked for a job; start command dispatched.
    Assigned,
    Running,
    /// Stop requested; final statistics still flushing.
    Reporting,
    Disconnecting,
}

/// Parameters a client needs to execute its part of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDispatch {
    pub job_id: JobId,
    pub job_class: String,
    pub threads_per_client: u32,
    pub thread_startup_delay_ms: u64,
    pub collection_interval_secs: u32,
    pub duration_secs: Option<u64>,
    pub parameters: ParameterList,
}

impl JobDispatch {
    pub fn for_job(job: &Job) -> Self {
        Self {
            job_id: job.id.clone(),
            job_class: job.spec.job_class.clone(),
            threads_per_client: job.spec.threads_per_client,
            thread_startup_delay_ms: job.spec.thread_startup_delay_ms,
            collection_interval_secs: job.spec.collection_interval_secs,
            duration_secs: job.spec.duration_secs,
            parameters: job.spec.parameters.clone(),
        }
    }
}

/// Commands the server sends to a load or monitor client.
#[derive(Debug, Clone)]
pub enum ClientCommand {
    StartJob(JobDispatch),
    StopJob { job_id: JobId },
    Disconnect { graceful: bool },
}

/// Commands the server sends to a client-manager daemon.
#[derive(Debug, Clone)]
pub enum ManagerCommand {
    StartClients {
        count: u32,
    },
    /// `count = None` stops every client the manager started.
    StopClients {
        count: Option<u32>,
    },
}

/// What a load or monitor worker supplies when it connects.
pub struct Registration {
    /// Self-declared client name; duplicates of live entries are rejected.
    pub name: String,
    /// `host:port` endpoint of the worker.
    pub address: String,
    pub commands: mpsc::UnboundedSender<ClientCommand>,
}

/// What a client-manager daemon supplies when it connects.
pub struct ManagerRegistration {
    pub name: String,
    pub address: String,
    /// Hard cap on clients this manager may run; 0 means unlimited.
    pub max_clients: u32,
    pub commands: mpsc::UnboundedSender<ManagerCommand>,
}

// ============================================================================
// Display snapshots
// ============================================================================

/// Read-only snapshot of a load or monitor entry, for status display.
#[derive(Debug, Clone, Serialize)]
pub struct ClientView {
    pub id: ClientId,
    pub name: String,
    pub address: String,
    pub kind: ClientKind,
    pub established_at: DateTime<Utc>,
    pub status: ClientStatus,
    pub assigned_job: Option<JobId>,
}

/// Read-only snapshot of a client-manager entry.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerView {
    pub id: ClientId,
    pub name: String,
    pub address: String,
    pub established_at: DateTime<Utc>,
    pub started_clients: u32,
    pub pending_starts: u32,
    pub max_clients: u32,
}
