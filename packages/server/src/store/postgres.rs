//! PostgreSQL-backed config store.
//!
//! Records are stored as self-describing JSONB payloads keyed by ID, with the
//! folder and state mirrored into indexed columns for scoped listings and
//! operational queries. Multi-record moves run in a single transaction.

use async_trait::async_trait;
use sqlx::PgPool;

use crate::common::id::{JobId, OptimizingJobId};
use crate::jobs::{Job, JobFolder, OptimizingJob};

use super::{folder_key, ConfigStore, StoreError};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run the schema migrations for the store tables.
    pub async fn migrate(pool: &PgPool) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(pool)
            .await
            .map_err(|e| StoreError::Backend(e.to_string()))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn decode<T: serde::de::DeserializeOwned>(data: serde_json::Value) -> Result<T, StoreError> {
    serde_json::from_value(data).map_err(StoreError::from)
}

#[async_trait]
impl ConfigStore for PostgresStore {
    async fn put_job(&self, job: &Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO swarm_jobs (id, folder, state, data, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (id) DO UPDATE SET
                folder = EXCLUDED.folder,
                state = EXCLUDED.state,
                data = EXCLUDED.data,
                updated_at = NOW()
            "#,
        )
        .bind(job.id.as_str())
        .bind(folder_key(job.spec.folder.as_deref()))
        .bind(job.state.as_str())
        .bind(serde_json::to_value(job)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT data FROM swarm_jobs WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode).transpose()
    }

    async fn delete_job(&self, id: &JobId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM swarm_jobs WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_jobs(&self, folder: Option<&str>) -> Result<Vec<Job>, StoreError> {
        let rows = match folder {
            Some(target) => {
                sqlx::query_scalar::<_, serde_json::Value>(
                    "SELECT data FROM swarm_jobs WHERE folder = $1 ORDER BY id",
                )
                .bind(target)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar::<_, serde_json::Value>(
                    "SELECT data FROM swarm_jobs ORDER BY id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(decode).collect()
    }

    async fn put_optimizing_job(&self, job: &OptimizingJob) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO swarm_optimizing_jobs (id, folder, state, data, updated_at)
            VALUES ($1, $2, $3, $4, NOW())
            ON CONFLICT (id) DO UPDATE SET
                folder = EXCLUDED.folder,
                state = EXCLUDED.state,
                data = EXCLUDED.data,
                updated_at = NOW()
            "#,
        )
        .bind(job.id.as_str())
        .bind(folder_key(job.folder()))
        .bind(job.state.as_str())
        .bind(serde_json::to_value(job)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_optimizing_job(
        &self,
        id: &OptimizingJobId,
    ) -> Result<Option<OptimizingJob>, StoreError> {
        let row = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT data FROM swarm_optimizing_jobs WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode).transpose()
    }

    async fn delete_optimizing_job(&self, id: &OptimizingJobId) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM swarm_optimizing_jobs WHERE id = $1")
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_optimizing_jobs(
        &self,
        folder: Option<&str>,
    ) -> Result<Vec<OptimizingJob>, StoreError> {
        let rows = match folder {
            Some(target) => {
                sqlx::query_scalar::<_, serde_json::Value>(
                    "SELECT data FROM swarm_optimizing_jobs WHERE folder = $1 ORDER BY id",
                )
                .bind(target)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar::<_, serde_json::Value>(
                    "SELECT data FROM swarm_optimizing_jobs ORDER BY id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.into_iter().map(decode).collect()
    }

    async fn move_records(
        &self,
        job_ids: &[JobId],
        optimizing_ids: &[OptimizingJobId],
        target: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        let folder_value = if target.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::Value::String(target.to_string())
        };

        for id in job_ids {
            let updated = sqlx::query(
                r#"
                UPDATE swarm_jobs
                SET folder = $1,
                    data = jsonb_set(data, '{spec,folder}', $2),
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(target)
            .bind(&folder_value)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated == 0 {
                tx.rollback().await?;
                return Err(StoreError::MissingRecord(format!("job {}", id)));
            }
        }

        for id in optimizing_ids {
            let updated = sqlx::query(
                r#"
                UPDATE swarm_optimizing_jobs
                SET folder = $1,
                    data = jsonb_set(data, '{spec,job,folder}', $2),
                    updated_at = NOW()
                WHERE id = $3
                "#,
            )
            .bind(target)
            .bind(&folder_value)
            .bind(id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if updated == 0 {
                tx.rollback().await?;
                return Err(StoreError::MissingRecord(format!("optimizing job {}", id)));
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn put_folder(&self, folder: &JobFolder) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO swarm_folders (name, data)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET data = EXCLUDED.data
            "#,
        )
        .bind(&folder.name)
        .bind(serde_json::to_value(folder)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_folder(&self, name: &str) -> Result<Option<JobFolder>, StoreError> {
        let row = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT data FROM swarm_folders WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        row.map(decode).transpose()
    }

    async fn delete_folder(&self, name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM swarm_folders WHERE name = $1")
            .bind(name)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_folders(&self) -> Result<Vec<JobFolder>, StoreError> {
        let rows = sqlx::query_scalar::<_, serde_json::Value>(
            "SELECT data FROM swarm_folders ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(decode).collect()
    }

    async fn load_counter(&self, name: &str) -> Result<Option<u64>, StoreError> {
        let value = sqlx::query_scalar::<_, i64>(
            "SELECT value FROM swarm_counters WHERE name = $1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(value.map(|v| v as u64))
    }

    async fn store_counter(&self, name: &str, value: u64) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO swarm_counters (name, value)
            VALUES ($1, $2)
            ON CONFLICT (name) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(name)
        .bind(value as i64)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
