//! In-memory config store for tests and embedded use.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;

use crate::common::id::{JobId, OptimizingJobId};
use crate::jobs::{Job, JobFolder, OptimizingJob};

use super::{folder_key, ConfigStore, StoreError};

#[derive(Default)]
struct Tables {
    jobs: BTreeMap<String, Job>,
    optimizing: BTreeMap<String, OptimizingJob>,
    folders: BTreeMap<String, JobFolder>,
    counters: HashMap<String, u64>,
}

/// Config store backed by process memory. Nothing survives a drop, which is
/// exactly what integration tests want; persistence tests reuse one instance
/// across simulated restarts.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Tables> {
        self.tables.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Tables> {
        self.tables.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn put_job(&self, job: &Job) -> Result<(), StoreError> {
        self.write().jobs.insert(job.id.as_str().to_string(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.read().jobs.get(id.as_str()).cloned())
    }

    async fn delete_job(&self, id: &JobId) -> Result<bool, StoreError> {
        Ok(self.write().jobs.remove(id.as_str()).is_some())
    }

    async fn list_jobs(&self, folder: Option<&str>) -> Result<Vec<Job>, StoreError> {
        let tables = self.read();
        Ok(tables
            .jobs
            .values()
            .filter(|job| match folder {
                None => true,
                Some(target) => folder_key(job.spec.folder.as_deref()) == target,
            })
            .cloned()
            .collect())
    }

    async fn put_optimizing_job(&self, job: &OptimizingJob) -> Result<(), StoreError> {
        self.write()
            .optimizing
            .insert(job.id.as_str().to_string(), job.clone());
        Ok(())
    }

    async fn get_optimizing_job(
        &self,
        id: &OptimizingJobId,
    ) -> Result<Option<OptimizingJob>, StoreError> {
        Ok(self.read().optimizing.get(id.as_str()).cloned())
    }

    async fn delete_optimizing_job(&self, id: &OptimizingJobId) -> Result<bool, StoreError> {
        Ok(self.write().optimizing.remove(id.as_str()).is_some())
    }

    async fn list_optimizing_jobs(
        &self,
        folder: Option<&str>,
    ) -> Result<Vec<OptimizingJob>, StoreError> {
        let tables = self.read();
        Ok(tables
            .optimizing
            .values()
            .filter(|job| match folder {
                None => true,
                Some(target) => folder_key(job.folder()) == target,
            })
            .cloned()
            .collect())
    }

    async fn move_records(
        &self,
        job_ids: &[JobId],
        optimizing_ids: &[OptimizingJobId],
        target: &str,
    ) -> Result<(), StoreError> {
        let mut tables = self.write();

        // Validate everything before mutating anything.
        for id in job_ids {
            if !tables.jobs.contains_key(id.as_str()) {
                return Err(StoreError::MissingRecord(format!("job {}", id)));
            }
        }
        for id in optimizing_ids {
            if !tables.optimizing.contains_key(id.as_str()) {
                return Err(StoreError::MissingRecord(format!("optimizing job {}", id)));
            }
        }

        let folder = if target.is_empty() {
            None
        } else {
            Some(target.to_string())
        };
        for id in job_ids {
            if let Some(job) = tables.jobs.get_mut(id.as_str()) {
                job.spec.folder = folder.clone();
            }
        }
        for id in optimizing_ids {
            if let Some(job) = tables.optimizing.get_mut(id.as_str()) {
                job.spec.job.folder = folder.clone();
            }
        }

        Ok(())
    }

    async fn put_folder(&self, folder: &JobFolder) -> Result<(), StoreError> {
        self.write()
            .folders
            .insert(folder.name.clone(), folder.clone());
        Ok(())
    }

    async fn get_folder(&self, name: &str) -> Result<Option<JobFolder>, StoreError> {
        Ok(self.read().folders.get(name).cloned())
    }

    async fn delete_folder(&self, name: &str) -> Result<bool, StoreError> {
        Ok(self.write().folders.remove(name).is_some())
    }

    async fn list_folders(&self) -> Result<Vec<JobFolder>, StoreError> {
        Ok(self.read().folders.values().cloned().collect())
    }

    async fn load_counter(&self, name: &str) -> Result<Option<u64>, StoreError> {
        Ok(self.read().counters.get(name).copied())
    }

    async fn store_counter(&self, name: &str, value: u64) -> Result<(), StoreError> {
        self.write().counters.insert(name.to_string(), value);
        Ok(())
    }
}
