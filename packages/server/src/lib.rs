// Loadswarm - distributed load-generation orchestration core
//
// A central control server schedules load-generation jobs onto a fleet of
// remote worker clients, collects their statistics, and - for optimizing
// jobs - iteratively re-runs the same job at increasing concurrency to find
// the thread count that optimizes a chosen metric.
//
// The admin HTTP surface, the wire protocol to workers, and job-class logic
// live outside this crate; they talk to the core through AccessPoints, the
// ClientRegistry, and the plugin traits.

pub mod common;
pub mod config;
pub mod fleet;
pub mod jobs;
pub mod optimize;
pub mod plugins;
pub mod scheduler;
pub mod server;
pub mod store;
pub mod testing;

pub use config::ServerConfig;
