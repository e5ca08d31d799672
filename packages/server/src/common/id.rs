//! Job and optimizing-job identifiers, and the allocator that mints them.
//!
//! IDs are opaque strings. Within a single server epoch their lexicographic
//! order matches creation order; across restarts they remain unique because
//! the allocator persists its counter high-water mark in reservation blocks.

use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::common::error::CoreResult;
use crate::store::ConfigStore;

/// Identifier of a single load-generation job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of an optimizing job. Distinct namespace from [`JobId`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OptimizingJobId(String);

impl OptimizingJobId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OptimizingJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Counter key in the config store.
const COUNTER_KEY: &str = "id_allocator";

/// How many IDs to reserve per store write. A crash wastes at most one block.
const RESERVATION_BLOCK: u64 = 64;

struct AllocatorState {
    next: u64,
    reserved_until: u64,
}

/// Mints globally unique job and optimizing-job IDs.
///
/// The counter is shared between both namespaces; the optimizing prefix keeps
/// them distinct. Allocation is serialized behind an async mutex so all
/// callers observe distinct IDs.
pub struct IdAllocator {
    epoch: String,
    store: Arc<dyn ConfigStore>,
    state: Mutex<AllocatorState>,
}

impl IdAllocator {
    /// Load the persisted high-water mark and reserve the first block.
    pub async fn new(store: Arc<dyn ConfigStore>) -> CoreResult<Self> {
        let start = store.load_counter(COUNTER_KEY).await?.unwrap_or(0);
        let reserved_until = start + RESERVATION_BLOCK;
        store.store_counter(COUNTER_KEY, reserved_until).await?;

        Ok(Self {
            epoch: Utc::now().format("%Y%m%d%H%M%S").to_string(),
            store,
            state: Mutex::new(AllocatorState {
                next: start,
                reserved_until,
            }),
        })
    }

    /// The startup epoch embedded in every ID from this process.
    pub fn epoch(&self) -> &str {
        &self.epoch
    }

    pub async fn next_job_id(&self) -> CoreResult<JobId> {
        let seq = self.next_sequence().await?;
        Ok(JobId::new(format!("{}-{:08}", self.epoch, seq)))
    }

    pub async fn next_optimizing_job_id(&self) -> CoreResult<OptimizingJobId> {
        let seq = self.next_sequence().await?;
        Ok(OptimizingJobId::new(format!("opt-{}-{:08}", self.epoch, seq)))
    }

    async fn next_sequence(&self) -> CoreResult<u64> {
        let mut state = self.state.lock().await;
        if state.next >= state.reserved_until {
            let reserved_until = state.reserved_until + RESERVATION_BLOCK;
            self.store.store_counter(COUNTER_KEY, reserved_until).await?;
            state.reserved_until = reserved_until;
        }
        let seq = state.next;
        state.next += 1;
        Ok(seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn ids_are_distinct_and_ordered() {
        let store = Arc::new(MemoryStore::new());
        let allocator = IdAllocator::new(store).await.unwrap();

        let a = allocator.next_job_id().await.unwrap();
        let b = allocator.next_job_id().await.unwrap();
        assert_ne!(a, b);
        assert!(a < b, "lexicographic order must follow creation order");
    }

    #[tokio::test]
    async fn optimizing_ids_use_distinct_namespace() {
        let store = Arc::new(MemoryStore::new());
        let allocator = IdAllocator::new(store).await.unwrap();

        let opt = allocator.next_optimizing_job_id().await.unwrap();
        assert!(opt.as_str().starts_with("opt-"));
    }

    #[tokio::test]
    async fn counter_survives_restart() {
        let store = Arc::new(MemoryStore::new());

        let first = {
            let allocator = IdAllocator::new(store.clone()).await.unwrap();
            allocator.next_job_id().await.unwrap()
        };

        // A new allocator over the same store must never reuse a sequence
        // number, even though the epoch differs.
        let allocator = IdAllocator::new(store).await.unwrap();
        let second = allocator.next_job_id().await.unwrap();

        let seq = |id: &JobId| {
            id.as_str()
                .rsplit('-')
                .next()
                .unwrap()
                .parse::<u64>()
                .unwrap()
        };
        assert!(seq(&second) > seq(&first));
    }

    #[tokio::test]
    async fn many_allocations_cross_reservation_blocks() {
        let store = Arc::new(MemoryStore::new());
        let allocator = IdAllocator::new(store).await.unwrap();

        let mut seen = std::collections::HashSet::new();
        for _ in 0..200 {
            let id = allocator.next_job_id().await.unwrap();
            assert!(seen.insert(id), "allocator handed out a duplicate");
        }
    }
}
