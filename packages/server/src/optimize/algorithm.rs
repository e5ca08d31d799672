//! Optimization algorithm contract, and the built-in scalar-metric
//! implementation.

use crate::common::error::{CoreError, CoreResult};
use crate::common::params::{ParameterKind, ParameterList, ParameterStub};
use crate::jobs::{Job, OptimizingJob};
use crate::plugins::JobClass;

/// Scores completed iterations for an optimizing job.
///
/// One instance exists per optimizing job; `initialize` runs once before the
/// first iteration is scheduled and may reject parameter values. Instances
/// may keep state across iterations (e.g. for confidence-based early
/// stopping via `should_stop`).
pub trait OptimizationAlgorithm: Send + Sync {
    /// Fully qualified algorithm name; the plugin's identity.
    fn algorithm_name(&self) -> &str;

    /// Whether this algorithm can score runs of the given job class.
    fn available_with_job_class(&self, _job_class: &dyn JobClass) -> bool {
        true
    }

    /// Schema of the algorithm-specific parameters.
    fn parameter_stubs(&self, job_class: &dyn JobClass) -> Vec<ParameterStub>;

    /// Bind parameter values for one optimizing job. Fails `InvalidValue`.
    fn initialize(&mut self, record: &OptimizingJob, parameters: &ParameterList)
        -> CoreResult<()>;

    /// Score one completed iteration as a scalar.
    fn iteration_value(&mut self, job: &Job) -> CoreResult<f64>;

    /// Whether `candidate` beats `best`.
    fn is_better_than(&self, candidate: f64, best: f64) -> bool;

    /// Optional early termination after any iteration.
    fn should_stop(&self) -> bool {
        false
    }
}

// ============================================================================
// Built-in: scalar metric
// ============================================================================

/// Optimizes a single named statistic, summed across the reporting clients.
///
/// Parameters: `metric` (name of the statistic in the client payloads,
/// default `throughput`) and `objective` (`maximize` or `minimize`, default
/// `maximize`).
pub struct ScalarMetricAlgorithm {
    metric: String,
    maximize: bool,
}

impl ScalarMetricAlgorithm {
    pub const NAME: &'static str = "swarm.builtin.ScalarMetric";

    pub fn new() -> Self {
        Self {
            metric: "throughput".to_string(),
            maximize: true,
        }
    }
}

impl Default for ScalarMetricAlgorithm {
    fn default() -> Self {
        Self::new()
    }
}

impl OptimizationAlgorithm for ScalarMetricAlgorithm {
    fn algorithm_name(&self) -> &str {
        Self::NAME
    }

    fn parameter_stubs(&self, _job_class: &dyn JobClass) -> Vec<ParameterStub> {
        vec![
            ParameterStub::new("metric", "Statistic to Optimize", ParameterKind::Text, false),
            ParameterStub::new(
                "objective",
                "Optimization Objective",
                ParameterKind::Text,
                false,
            ),
        ]
    }

    fn initialize(
        &mut self,
        _record: &OptimizingJob,
        parameters: &ParameterList,
    ) -> CoreResult<()> {
        if let Some(metric) = parameters.text("metric") {
            if metric.trim().is_empty() {
                return Err(CoreError::InvalidValue("metric must not be empty".into()));
            }
            self.metric = metric.to_string();
        }

        match parameters.text("objective") {
            None => {}
            Some("maximize") => self.maximize = true,
            Some("minimize") => self.maximize = false,
            Some(other) => {
                return Err(CoreError::InvalidValue(format!(
                    "objective must be maximize or minimize, got {:?}",
                    other
                )))
            }
        }

        Ok(())
    }

    fn iteration_value(&mut self, job: &Job) -> CoreResult<f64> {
        if !job.has_stats() {
            return Err(CoreError::StatisticsUnreadable(format!(
                "job {} reported no statistics",
                job.id
            )));
        }

        let mut total = 0.0;
        let mut found = false;
        for stats in &job.stats {
            if let Some(value) = stats.payload.get(&self.metric).and_then(|v| v.as_f64()) {
                total += value;
                found = true;
            }
        }

        if !found {
            return Err(CoreError::StatisticsUnreadable(format!(
                "job {} has no numeric statistic {:?}",
                job.id, self.metric
            )));
        }

        Ok(total)
    }

    fn is_better_than(&self, candidate: f64, best: f64) -> bool {
        if self.maximize {
            candidate > best
        } else {
            candidate < best
        }
    }
}
