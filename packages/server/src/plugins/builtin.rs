//! Built-in plugins shipped with the server.

use std::sync::Arc;

use crate::common::params::{ParameterKind, ParameterStub};
use crate::optimize::{OptimizationAlgorithm, ScalarMetricAlgorithm};

use super::{AlgorithmFactory, JobClass, PluginCatalog};

pub const NOOP_JOB_CLASS: &str = "swarm.builtin.NoOpJob";
pub const SCALAR_METRIC_ALGORITHM: &str = ScalarMetricAlgorithm::NAME;

/// Job class that keeps its threads idle for the run. Useful for smoke
/// testing the dispatch path without generating real load.
pub struct NoOpJobClass;

impl JobClass for NoOpJobClass {
    fn class_name(&self) -> &str {
        NOOP_JOB_CLASS
    }

    fn display_name(&self) -> &str {
        "No-Op"
    }

    fn description(&self) -> &str {
        "Occupies the configured threads without generating load."
    }

    fn parameter_stubs(&self) -> Vec<ParameterStub> {
        vec![ParameterStub::new(
            "sleep_ms",
            "Per-Cycle Sleep (ms)",
            ParameterKind::Integer,
            false,
        )]
    }
}

/// Catalog with the plugins compiled into the server binary.
pub struct BuiltinCatalog;

impl PluginCatalog for BuiltinCatalog {
    fn job_classes(&self) -> Vec<Arc<dyn JobClass>> {
        vec![Arc::new(NoOpJobClass)]
    }

    fn algorithms(&self) -> Vec<(String, AlgorithmFactory)> {
        vec![(
            SCALAR_METRIC_ALGORITHM.to_string(),
            Arc::new(|| Box::new(ScalarMetricAlgorithm::new()) as Box<dyn OptimizationAlgorithm>),
        )]
    }
}
