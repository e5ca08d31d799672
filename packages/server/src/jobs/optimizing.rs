//! Optimizing-job model: a search driver over child job iterations.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::common::error::{CoreError, CoreResult};
use crate::common::id::{JobId, OptimizingJobId};
use crate::common::params::ParameterList;

use super::job::{JobState, JobTemplate};

/// Everything the admin layer supplies to schedule an optimizing job.
///
/// `job` is the template every child iteration is built from; its
/// `threads_per_client` is overridden per iteration with
/// `min_threads + i * thread_increment`.
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct OptimizingJobTemplate {
    pub job: JobTemplate,

    #[builder(default = 1)]
    pub min_threads: u32,

    #[builder(default)]
    #[serde(default)]
    pub max_threads: Option<u32>,

    #[builder(default = 1)]
    pub thread_increment: u32,

    #[builder(default)]
    #[serde(default)]
    pub delay_between_iterations_secs: u64,

    #[builder(default = 1)]
    pub max_consecutive_non_improving: u32,

    /// Fully qualified name of the optimization algorithm.
    pub algorithm: String,

    #[builder(default)]
    #[serde(default)]
    pub algorithm_parameters: ParameterList,

    /// Suffix child descriptions with ` (N threads)`.
    #[builder(default)]
    #[serde(default)]
    pub include_threads_in_description: bool,

    #[builder(default)]
    #[serde(default)]
    pub rerun_best_iteration: bool,

    /// Duration for the re-run iteration; absent falls back to the template
    /// duration.
    #[builder(default)]
    #[serde(default)]
    pub rerun_duration_secs: Option<u64>,
}

impl OptimizingJobTemplate {
    pub fn validate(&self) -> CoreResult<()> {
        self.job.validate()?;

        if self.min_threads < 1 {
            return Err(CoreError::InvalidValue("min_threads must be at least 1".into()));
        }
        if self.thread_increment < 1 {
            return Err(CoreError::InvalidValue(
                "thread_increment must be at least 1".into(),
            ));
        }
        if let Some(max) = self.max_threads {
            if max < self.min_threads {
                return Err(CoreError::InvalidValue(format!(
                    "max_threads {} is below min_threads {}",
                    max, self.min_threads
                )));
            }
        }
        if self.algorithm.trim().is_empty() {
            return Err(CoreError::InvalidValue("algorithm must not be empty".into()));
        }

        Ok(())
    }
}

/// An optimizing job and its execution record.
///
/// The record is the controller's only durable state: the iteration list plus
/// the template is enough to resume the search after a restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OptimizingJob {
    pub id: OptimizingJobId,
    pub spec: OptimizingJobTemplate,

    #[serde(default)]
    pub state: JobState,

    /// Child jobs, in scheduling order.
    #[serde(default)]
    pub iterations: Vec<JobId>,

    #[serde(default)]
    pub rerun_iteration: Option<JobId>,

    #[serde(default)]
    pub optimal_thread_count: Option<u32>,

    #[serde(default)]
    pub optimal_value: Option<f64>,

    #[serde(default)]
    pub optimal_job_id: Option<JobId>,

    #[serde(default)]
    pub pause_requested: bool,

    #[serde(default)]
    pub actual_start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub actual_stop_time: Option<DateTime<Utc>>,
}

impl OptimizingJob {
    pub fn from_template(id: OptimizingJobId, spec: OptimizingJobTemplate) -> Self {
        Self {
            id,
            spec,
            state: JobState::NotYetStarted,
            iterations: Vec::new(),
            rerun_iteration: None,
            optimal_thread_count: None,
            optimal_value: None,
            optimal_job_id: None,
            pause_requested: false,
            actual_start_time: None,
            actual_stop_time: None,
        }
    }

    pub fn folder(&self) -> Option<&str> {
        self.spec.job.folder.as_deref()
    }

    /// Thread count for the iteration at `index`.
    pub fn thread_count_for_iteration(&self, index: usize) -> u32 {
        self.spec.min_threads + index as u32 * self.spec.thread_increment
    }

    /// All children, including the re-run iteration when present.
    pub fn all_children(&self) -> Vec<JobId> {
        let mut children = self.iterations.clone();
        if let Some(rerun) = &self.rerun_iteration {
            children.push(rerun.clone());
        }
        children
    }
}
