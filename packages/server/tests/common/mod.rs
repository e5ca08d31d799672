//! Shared harness for integration tests.
//!
//! Every test gets a real server over the in-memory store, fast intervals,
//! and a simulated fleet. Workers are scripted per test.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use swarm_core::common::id::{JobId, OptimizingJobId};
use swarm_core::jobs::{Job, JobState, JobTemplate, OptimizingJob, OptimizingJobTemplate};
use swarm_core::plugins::builtin::{BuiltinCatalog, NOOP_JOB_CLASS, SCALAR_METRIC_ALGORITHM};
use swarm_core::scheduler::AccessPoints;
use swarm_core::server::Server;
use swarm_core::store::{ConfigStore, MemoryStore};
use swarm_core::testing::SimulatedFleet;
use swarm_core::ServerConfig;

pub struct Harness {
    pub server: Arc<Server>,
    pub access: AccessPoints,
    pub fleet: SimulatedFleet,
    pub store: Arc<MemoryStore>,
}

/// Fast intervals so scenarios settle in tens of milliseconds.
pub fn fast_config() -> ServerConfig {
    ServerConfig {
        tick_interval_ms: 20,
        watchdog_interval_secs: 1,
        shutdown_grace_secs: 1,
        max_client_wait_secs: 1,
        ..Default::default()
    }
}

pub async fn start_harness() -> Harness {
    start_harness_with(fast_config(), Arc::new(MemoryStore::new())).await
}

pub async fn start_harness_with(config: ServerConfig, store: Arc<MemoryStore>) -> Harness {
    // Run tests with RUST_LOG=debug cargo test -- --nocapture to see logs.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let store_dyn: Arc<dyn ConfigStore> = store.clone();
    let server = Server::start(config, store_dyn, &BuiltinCatalog)
        .await
        .expect("server should start");
    let access = server.access();
    let fleet = SimulatedFleet::new(&server);

    Harness {
        server,
        access,
        fleet,
        store,
    }
}

pub fn job_template() -> JobTemplate {
    JobTemplate::builder()
        .job_class(NOOP_JOB_CLASS)
        .start_time(Utc::now())
        .build()
}

pub fn optimizing_template() -> OptimizingJobTemplate {
    OptimizingJobTemplate::builder()
        .job(job_template())
        .algorithm(SCALAR_METRIC_ALGORITHM)
        .build()
}

/// Synthetic throughput curve used by the happy-path scenarios: rises to a
/// peak of 300 at 5 threads, then declines.
pub fn throughput_curve() -> std::collections::HashMap<u32, f64> {
    [
        (1, 100.0),
        (2, 180.0),
        (3, 240.0),
        (4, 280.0),
        (5, 300.0),
        (6, 295.0),
        (7, 290.0),
    ]
    .into_iter()
    .collect()
}

pub async fn wait_for_job_state(
    access: &AccessPoints,
    id: &JobId,
    state: JobState,
    timeout: Duration,
) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(job) = access.get_job(id).await {
            if job.state == state {
                return job;
            }
            assert!(
                !(job.state.is_terminal() && job.state != state),
                "job {} settled in {} while waiting for {}",
                id,
                job.state,
                state
            );
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for job {} to reach {}",
            id,
            state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_terminal_job(
    access: &AccessPoints,
    id: &JobId,
    timeout: Duration,
) -> Job {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(job) = access.get_job(id).await {
            if job.state.is_terminal() {
                return job;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for job {} to settle",
            id
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_optimizing_state(
    access: &AccessPoints,
    id: &OptimizingJobId,
    state: JobState,
    timeout: Duration,
) -> OptimizingJob {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(record) = access.get_optimizing_job(id).await {
            if record.state == state {
                return record;
            }
            assert!(
                !(record.state.is_terminal() && record.state != state),
                "optimizing job {} settled in {} while waiting for {}",
                id,
                record.state,
                state
            );
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for optimizing job {} to reach {}",
            id,
            state
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until the optimizing record has at least `count` iterations.
pub async fn wait_for_iteration_count(
    access: &AccessPoints,
    id: &OptimizingJobId,
    count: usize,
    timeout: Duration,
) -> OptimizingJob {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(record) = access.get_optimizing_job(id).await {
            if record.iterations.len() >= count {
                return record;
            }
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for optimizing job {} to reach {} iterations",
            id,
            count
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
