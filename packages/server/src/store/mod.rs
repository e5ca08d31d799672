//! Config store: the durable home of jobs, optimizing jobs, and folders.
//!
//! The scheduler treats the store as a linearizable collaborator and writes
//! records before acknowledging mutations to callers. Records are
//! self-describing JSON so a future version can add fields without breaking
//! older readers.
//!
//! Two implementations ship with the server:
//! - [`MemoryStore`] for tests and embedded use
//! - [`PostgresStore`] for production

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use thiserror::Error;

use crate::common::id::{JobId, OptimizingJobId};
use crate::jobs::{Job, JobFolder, OptimizingJob};

/// Errors at the store boundary. These surface to callers as the fatal
/// `ConfigStore` core error.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("record not found: {0}")]
    MissingRecord(String),

    #[error("backend error: {0}")]
    Backend(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        StoreError::Backend(err.to_string())
    }
}

/// Durable key/value store for the orchestration core.
///
/// Keyspaces: `jobs/{id}`, `opt/{id}`, folders, and named counters for the
/// ID allocator. Folder-scoped listings are served from secondary indexes.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    // Jobs
    async fn put_job(&self, job: &Job) -> Result<(), StoreError>;
    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError>;
    /// Returns true when a record was deleted.
    async fn delete_job(&self, id: &JobId) -> Result<bool, StoreError>;
    /// `folder = None` lists every job; `Some("")` is the default folder.
    async fn list_jobs(&self, folder: Option<&str>) -> Result<Vec<Job>, StoreError>;

    // Optimizing jobs
    async fn put_optimizing_job(&self, job: &OptimizingJob) -> Result<(), StoreError>;
    async fn get_optimizing_job(
        &self,
        id: &OptimizingJobId,
    ) -> Result<Option<OptimizingJob>, StoreError>;
    async fn delete_optimizing_job(&self, id: &OptimizingJobId) -> Result<bool, StoreError>;
    async fn list_optimizing_jobs(
        &self,
        folder: Option<&str>,
    ) -> Result<Vec<OptimizingJob>, StoreError>;

    /// Atomically move the named records to `target`. Either every record
    /// moves or none does; a missing record fails the whole move.
    async fn move_records(
        &self,
        job_ids: &[JobId],
        optimizing_ids: &[OptimizingJobId],
        target: &str,
    ) -> Result<(), StoreError>;

    // Folders
    async fn put_folder(&self, folder: &JobFolder) -> Result<(), StoreError>;
    async fn get_folder(&self, name: &str) -> Result<Option<JobFolder>, StoreError>;
    async fn delete_folder(&self, name: &str) -> Result<bool, StoreError>;
    async fn list_folders(&self) -> Result<Vec<JobFolder>, StoreError>;

    // Counters (ID allocator high-water marks)
    async fn load_counter(&self, name: &str) -> Result<Option<u64>, StoreError>;
    async fn store_counter(&self, name: &str, value: u64) -> Result<(), StoreError>;
}

/// Folder key a record is indexed under.
pub(crate) fn folder_key(folder: Option<&str>) -> &str {
    folder.unwrap_or(crate::jobs::DEFAULT_FOLDER)
}
