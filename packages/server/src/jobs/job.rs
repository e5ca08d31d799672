//! Job model: one scheduled load-generation run across a set of clients.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::common::error::{CoreError, CoreResult};
use crate::common::id::{JobId, OptimizingJobId};
use crate::common::params::ParameterList;

// ============================================================================
// State machine
// ============================================================================

/// Lifecycle state of a job.
///
/// Every `Completed*` / `Stopped*` / `Cancelled` state is terminal; a job
/// never leaves a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Uninitialized,
    NotYetStarted,
    Disabled,
    Running,
    CompletedSuccessfully,
    CompletedWithErrors,
    StoppedByUser,
    StoppedByShutdown,
    StoppedDueToError,
    StoppedDueToDuration,
    StoppedDueToStopTime,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::CompletedSuccessfully
                | JobState::CompletedWithErrors
                | JobState::StoppedByUser
                | JobState::StoppedByShutdown
                | JobState::StoppedDueToError
                | JobState::StoppedDueToDuration
                | JobState::StoppedDueToStopTime
                | JobState::Cancelled
        )
    }

    /// Whether this terminal state counts as an error outcome.
    pub fn is_errored(&self) -> bool {
        matches!(
            self,
            JobState::CompletedWithErrors | JobState::StoppedDueToError
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Uninitialized => "uninitialized",
            JobState::NotYetStarted => "not_yet_started",
            JobState::Disabled => "disabled",
            JobState::Running => "running",
            JobState::CompletedSuccessfully => "completed_successfully",
            JobState::CompletedWithErrors => "completed_with_errors",
            JobState::StoppedByUser => "stopped_by_user",
            JobState::StoppedByShutdown => "stopped_by_shutdown",
            JobState::StoppedDueToError => "stopped_due_to_error",
            JobState::StoppedDueToDuration => "stopped_due_to_duration",
            JobState::StoppedDueToStopTime => "stopped_due_to_stop_time",
            JobState::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Supporting records
// ============================================================================

/// Reference to a job or optimizing job this job must wait for.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum DependencyRef {
    Job(JobId),
    OptimizingJob(OptimizingJobId),
}

impl std::fmt::Display for DependencyRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyRef::Job(id) => write!(f, "job {}", id),
            DependencyRef::OptimizingJob(id) => write!(f, "optimizing job {}", id),
        }
    }
}

/// One statistics payload reported by a client. Opaque to the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStats {
    /// Address of the reporting client.
    pub client: String,
    pub collected_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

// ============================================================================
// Template
// ============================================================================

/// Everything the admin layer supplies to schedule a job.
///
/// The scheduler assigns the ID and owns the lifecycle; the template is the
/// immutable part of the record (the folder is the exception: moves rewrite
/// it in place).
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct JobTemplate {
    /// Fully qualified name of the job class the clients will execute.
    pub job_class: String,

    #[builder(default)]
    #[serde(default)]
    pub job_group: Option<String>,

    #[builder(default)]
    #[serde(default)]
    pub folder: Option<String>,

    #[builder(default)]
    #[serde(default)]
    pub description: Option<String>,

    #[builder(default)]
    #[serde(default)]
    pub comments: Option<String>,

    pub start_time: DateTime<Utc>,

    /// Absolute deadline; reaching it ends the job `StoppedDueToStopTime`.
    #[builder(default)]
    #[serde(default)]
    pub stop_time: Option<DateTime<Utc>>,

    /// Run length in seconds; absent means run until stopped.
    #[builder(default)]
    #[serde(default)]
    pub duration_secs: Option<u64>,

    #[builder(default = 1)]
    pub num_clients: u32,

    /// Explicit worker addresses that must be part of the run.
    #[builder(default)]
    #[serde(default)]
    pub requested_clients: Vec<String>,

    /// Resource-monitor client addresses to attach to the run.
    #[builder(default)]
    #[serde(default)]
    pub monitor_clients: Vec<String>,

    /// When true, missing monitor clients are skipped instead of failing the
    /// dispatch.
    #[builder(default)]
    #[serde(default)]
    pub monitor_clients_if_available: bool,

    #[builder(default = 1)]
    pub threads_per_client: u32,

    #[builder(default)]
    #[serde(default)]
    pub thread_startup_delay_ms: u64,

    #[builder(default = 1)]
    pub collection_interval_secs: u32,

    #[builder(default)]
    #[serde(default)]
    pub dependencies: Vec<DependencyRef>,

    /// Job-class parameters, opaque to the scheduler.
    #[builder(default)]
    #[serde(default)]
    pub parameters: ParameterList,

    #[builder(default)]
    #[serde(default)]
    pub notify_addresses: Vec<String>,
}

impl JobTemplate {
    pub fn validate(&self) -> CoreResult<()> {
        if self.job_class.trim().is_empty() {
            return Err(CoreError::InvalidValue("job class must not be empty".into()));
        }
        if self.num_clients < 1 {
            return Err(CoreError::InvalidValue("num_clients must be at least 1".into()));
        }
        if self.threads_per_client < 1 {
            return Err(CoreError::InvalidValue(
                "threads_per_client must be at least 1".into(),
            ));
        }
        if self.collection_interval_secs < 1 {
            return Err(CoreError::InvalidValue(
                "collection_interval_secs must be at least 1".into(),
            ));
        }
        if self.requested_clients.len() > self.num_clients as usize {
            return Err(CoreError::InvalidValue(format!(
                "requested {} specific clients but num_clients is {}",
                self.requested_clients.len(),
                self.num_clients
            )));
        }
        if let Some(stop) = self.stop_time {
            if stop <= self.start_time {
                return Err(CoreError::InvalidValue(
                    "stop_time must be after start_time".into(),
                ));
            }
        }

        let mut seen = std::collections::HashSet::new();
        for address in &self.requested_clients {
            if !seen.insert(address.as_str()) {
                return Err(CoreError::InvalidValue(format!(
                    "requested client {} listed twice",
                    address
                )));
            }
        }

        let mut deps = std::collections::HashSet::new();
        for dep in &self.dependencies {
            if !deps.insert(dep) {
                return Err(CoreError::InvalidDependency(format!("{} listed twice", dep)));
            }
        }

        Ok(())
    }
}

// ============================================================================
// Job
// ============================================================================

/// A single load-generation run and its execution record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub spec: JobTemplate,

    #[serde(default)]
    pub state: JobState,

    #[serde(default)]
    pub actual_start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub actual_stop_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub stop_reason: Option<String>,

    /// Set when this job is an iteration owned by an optimizing job.
    #[serde(default)]
    pub optimizing_parent: Option<OptimizingJobId>,

    /// Per-client statistics payloads collected so far.
    #[serde(default)]
    pub stats: Vec<ClientStats>,
}

impl Job {
    pub fn from_template(id: JobId, spec: JobTemplate) -> Self {
        Self {
            id,
            spec,
            state: JobState::Uninitialized,
            actual_start_time: None,
            actual_stop_time: None,
            stop_reason: None,
            optimizing_parent: None,
            stats: Vec::new(),
        }
    }

    pub fn has_stats(&self) -> bool {
        !self.stats.is_empty()
    }

    /// The instant at which a duration-bounded run must stop.
    pub fn duration_deadline(&self) -> Option<DateTime<Utc>> {
        match (self.actual_start_time, self.spec.duration_secs) {
            (Some(start), Some(secs)) => Some(start + Duration::seconds(secs as i64)),
            _ => None,
        }
    }

    /// Apply a state transition, enforcing the state machine.
    ///
    /// Entering `Running` records the actual start time; entering a terminal
    /// state records the actual stop time.
    pub fn transition(&mut self, next: JobState) -> CoreResult<()> {
        let legal = match (self.state, next) {
            (JobState::Uninitialized, JobState::NotYetStarted) => true,
            (JobState::NotYetStarted, JobState::Disabled) => true,
            (JobState::Disabled, JobState::NotYetStarted) => true,
            (JobState::NotYetStarted | JobState::Disabled, JobState::Cancelled) => true,
            (JobState::NotYetStarted, JobState::Running) => true,
            (JobState::NotYetStarted, JobState::StoppedDueToError) => true,
            (JobState::Running, to) if to.is_terminal() => true,
            _ => false,
        };

        if !legal {
            return Err(CoreError::InvalidValue(format!(
                "job {} cannot move from {} to {}",
                self.id, self.state, next
            )));
        }

        if next == JobState::Running {
            self.actual_start_time = Some(Utc::now());
        }
        if next.is_terminal() {
            let stopped = Utc::now();
            // Keep actual_start_time <= actual_stop_time even on clock skew.
            self.actual_stop_time = Some(match self.actual_start_time {
                Some(start) if start > stopped => start,
                _ => stopped,
            });
        }

        self.state = next;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_template() -> JobTemplate {
        JobTemplate::builder()
            .job_class("swarm.builtin.NoOpJob")
            .start_time(Utc::now())
            .num_clients(2u32)
            .threads_per_client(4u32)
            .build()
    }

    fn sample_job() -> Job {
        Job::from_template(JobId::new("20260101000000-00000001"), sample_template())
    }

    #[test]
    fn template_defaults_validate() {
        assert!(sample_template().validate().is_ok());
    }

    #[test]
    fn template_rejects_too_many_requested_clients() {
        let mut tpl = sample_template();
        tpl.requested_clients = vec!["a:1".into(), "b:1".into(), "c:1".into()];
        assert!(matches!(tpl.validate(), Err(CoreError::InvalidValue(_))));
    }

    #[test]
    fn template_rejects_duplicate_dependencies() {
        let mut tpl = sample_template();
        let dep = DependencyRef::Job(JobId::new("x"));
        tpl.dependencies = vec![dep.clone(), dep];
        assert!(matches!(
            tpl.validate(),
            Err(CoreError::InvalidDependency(_))
        ));
    }

    #[test]
    fn template_rejects_zero_collection_interval() {
        let mut tpl = sample_template();
        tpl.collection_interval_secs = 0;
        assert!(tpl.validate().is_err());
    }

    #[test]
    fn template_rejects_stop_before_start() {
        let mut tpl = sample_template();
        tpl.stop_time = Some(tpl.start_time - Duration::seconds(1));
        assert!(tpl.validate().is_err());
    }

    #[test]
    fn schedule_then_run_then_complete() {
        let mut job = sample_job();
        job.transition(JobState::NotYetStarted).unwrap();
        job.transition(JobState::Running).unwrap();
        assert!(job.actual_start_time.is_some());

        job.transition(JobState::CompletedSuccessfully).unwrap();
        assert!(job.actual_stop_time.is_some());
        assert!(job.actual_start_time.unwrap() <= job.actual_stop_time.unwrap());
    }

    #[test]
    fn terminal_states_are_sticky() {
        let mut job = sample_job();
        job.transition(JobState::NotYetStarted).unwrap();
        job.transition(JobState::Running).unwrap();
        job.transition(JobState::StoppedByUser).unwrap();

        for next in [
            JobState::Running,
            JobState::NotYetStarted,
            JobState::Cancelled,
            JobState::CompletedSuccessfully,
        ] {
            assert!(job.clone().transition(next).is_err());
        }
    }

    #[test]
    fn pause_resume_only_while_pending() {
        let mut job = sample_job();
        job.transition(JobState::NotYetStarted).unwrap();
        job.transition(JobState::Disabled).unwrap();
        job.transition(JobState::NotYetStarted).unwrap();
        job.transition(JobState::Running).unwrap();
        assert!(job.transition(JobState::Disabled).is_err());
    }

    #[test]
    fn duration_deadline_requires_start() {
        let mut job = sample_job();
        job.spec.duration_secs = Some(30);
        assert!(job.duration_deadline().is_none());

        job.transition(JobState::NotYetStarted).unwrap();
        job.transition(JobState::Running).unwrap();
        let deadline = job.duration_deadline().unwrap();
        assert_eq!(
            deadline,
            job.actual_start_time.unwrap() + Duration::seconds(30)
        );
    }

    #[test]
    fn record_roundtrips_through_json() {
        let mut job = sample_job();
        job.transition(JobState::NotYetStarted).unwrap();
        job.stats.push(ClientStats {
            client: "10.0.0.1:3000".into(),
            collected_at: Utc::now(),
            payload: serde_json::json!({"throughput": 120.5}),
        });

        let json = serde_json::to_string(&job).unwrap();
        let back: Job = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.state, JobState::NotYetStarted);
        assert!(back.has_stats());
    }
}
