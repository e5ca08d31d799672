//! Persistence and restart recovery: records survive a server restart and
//! optimizing-job controllers resume from their persisted iteration lists.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use swarm_core::jobs::JobState;
use swarm_core::store::MemoryStore;
use swarm_core::testing::WorkerScript;

fn curve_worker(delay_ms: u64) -> WorkerScript {
    WorkerScript::ThroughputByThreads {
        values: throughput_curve(),
        delay: Duration::from_millis(delay_ms),
    }
}

#[tokio::test]
async fn optimizing_record_is_identical_after_restart() {
    let store = Arc::new(MemoryStore::new());

    let (id, before) = {
        let harness = start_harness_with(fast_config(), store.clone()).await;
        harness
            .fleet
            .connect_worker("c1", "10.0.0.1:3000", curve_worker(10))
            .unwrap();

        let mut template = optimizing_template();
        template.max_threads = Some(10);
        template.max_consecutive_non_improving = 2;
        let id = harness
            .access
            .schedule_optimizing_job(template)
            .await
            .unwrap();
        let record = wait_for_optimizing_state(
            &harness.access,
            &id,
            JobState::CompletedSuccessfully,
            Duration::from_secs(15),
        )
        .await;
        harness.server.shutdown().await;
        (id, record)
    };

    let harness = start_harness_with(fast_config(), store).await;
    let after = harness.access.get_optimizing_job(&id).await.unwrap();

    assert_eq!(after.state, JobState::CompletedSuccessfully);
    assert_eq!(after.optimal_thread_count, before.optimal_thread_count);
    assert_eq!(after.optimal_value, before.optimal_value);
    assert_eq!(after.optimal_job_id, before.optimal_job_id);
    assert_eq!(after.iterations, before.iterations);
    assert_eq!(after.rerun_iteration, before.rerun_iteration);

    harness.server.shutdown().await;
}

#[tokio::test]
async fn pending_jobs_resume_after_restart() {
    let store = Arc::new(MemoryStore::new());

    let id = {
        // No clients connected: the job stays pending.
        let harness = start_harness_with(fast_config(), store.clone()).await;
        let id = harness.access.schedule_job(job_template()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(
            harness.access.get_job(&id).await.unwrap().state,
            JobState::NotYetStarted
        );
        harness.server.shutdown().await;
        id
    };

    let harness = start_harness_with(fast_config(), store).await;
    assert!(harness
        .access
        .pending_jobs()
        .iter()
        .any(|job| job.id == id));

    harness
        .fleet
        .connect_worker(
            "c1",
            "10.0.0.1:3000",
            WorkerScript::CompleteWith {
                payload: serde_json::json!({ "throughput": 5.0 }),
                succeed: true,
                delay: Duration::from_millis(10),
            },
        )
        .unwrap();

    wait_for_job_state(
        &harness.access,
        &id,
        JobState::CompletedSuccessfully,
        Duration::from_secs(5),
    )
    .await;

    harness.server.shutdown().await;
}

#[tokio::test]
async fn interrupted_search_resumes_and_finds_the_peak() {
    let store = Arc::new(MemoryStore::new());

    let id = {
        // No clients: the controller schedules iteration 1 and then blocks
        // waiting for clients that never come.
        let harness = start_harness_with(fast_config(), store.clone()).await;
        let mut template = optimizing_template();
        template.max_threads = Some(10);
        template.max_consecutive_non_improving = 2;
        let id = harness
            .access
            .schedule_optimizing_job(template)
            .await
            .unwrap();
        wait_for_iteration_count(&harness.access, &id, 1, Duration::from_secs(5)).await;
        harness.server.shutdown().await;
        id
    };

    // The record is still mid-flight in the store.
    {
        use swarm_core::store::ConfigStore;
        let record = store.get_optimizing_job(&id).await.unwrap().unwrap();
        assert!(!record.state.is_terminal());
    }

    // Restart with a worker available: recovery replays iteration 1 and the
    // search runs to the end.
    let harness = start_harness_with(fast_config(), store).await;
    harness
        .fleet
        .connect_worker("c1", "10.0.0.1:3000", curve_worker(10))
        .unwrap();

    let record = wait_for_optimizing_state(
        &harness.access,
        &id,
        JobState::CompletedSuccessfully,
        Duration::from_secs(20),
    )
    .await;

    assert_eq!(record.iterations.len(), 7);
    assert_eq!(record.optimal_thread_count, Some(5));
    assert_eq!(record.optimal_value, Some(300.0));

    harness.server.shutdown().await;
}

#[tokio::test]
async fn jobs_found_running_at_startup_are_settled() {
    use swarm_core::common::id::JobId;
    use swarm_core::jobs::Job;
    use swarm_core::store::ConfigStore;

    let store = Arc::new(MemoryStore::new());

    // A record a crashed process left behind mid-run.
    let mut job = Job::from_template(JobId::new("20260101000000-00000001"), job_template());
    job.transition(JobState::NotYetStarted).unwrap();
    job.transition(JobState::Running).unwrap();
    store.put_job(&job).await.unwrap();

    let harness = start_harness_with(fast_config(), store.clone()).await;

    let settled = store.get_job(&job.id).await.unwrap().unwrap();
    assert_eq!(settled.state, JobState::StoppedByShutdown);
    assert!(settled.stop_reason.unwrap().contains("restarted"));

    harness.server.shutdown().await;
}

#[tokio::test]
async fn id_sequences_never_repeat_across_restarts() {
    let store = Arc::new(MemoryStore::new());

    let first = {
        let harness = start_harness_with(fast_config(), store.clone()).await;
        let mut template = job_template();
        template.start_time = chrono::Utc::now() + chrono::Duration::hours(1);
        let id = harness.access.schedule_job(template).await.unwrap();
        harness.server.shutdown().await;
        id
    };

    let harness = start_harness_with(fast_config(), store).await;
    let mut template = job_template();
    template.start_time = chrono::Utc::now() + chrono::Duration::hours(1);
    let second = harness.access.schedule_job(template).await.unwrap();

    assert_ne!(first, second);

    harness.server.shutdown().await;
}
