// Optimization: the algorithm contract and the per-record controller that
// drives the thread-count search.

mod algorithm;
mod controller;

pub use algorithm::{OptimizationAlgorithm, ScalarMetricAlgorithm};
pub use controller::{
    spawn as spawn_controller, ControllerConfig, ControllerHandle, ControllerSet,
    OptimizingJobController,
};
