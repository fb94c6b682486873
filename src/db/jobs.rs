//! Job record persistence.

use crate::error::DatabaseError;
use crate::types::JobId;
use crate::{Error, Result};

use super::{Database, JobRecord};

impl Database {
    /// Insert or replace a job record
    pub async fn upsert_job(&self, job: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, name, status, message, progress, temp_dir, final_dir,
                direct_urls, direct_index, direct_skipped, direct_exts,
                headers, meta, meta_path, post_processed, encryption, created_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                status = excluded.status,
                message = excluded.message,
                progress = excluded.progress,
                temp_dir = excluded.temp_dir,
                final_dir = excluded.final_dir,
                direct_urls = excluded.direct_urls,
                direct_index = excluded.direct_index,
                direct_skipped = excluded.direct_skipped,
                direct_exts = excluded.direct_exts,
                headers = excluded.headers,
                meta = excluded.meta,
                meta_path = excluded.meta_path,
                post_processed = excluded.post_processed,
                encryption = excluded.encryption
            "#,
        )
        .bind(job.id)
        .bind(&job.name)
        .bind(&job.status)
        .bind(&job.message)
        .bind(job.progress)
        .bind(&job.temp_dir)
        .bind(&job.final_dir)
        .bind(&job.direct_urls)
        .bind(job.direct_index)
        .bind(job.direct_skipped)
        .bind(&job.direct_exts)
        .bind(&job.headers)
        .bind(&job.meta)
        .bind(&job.meta_path)
        .bind(job.post_processed)
        .bind(&job.encryption)
        .bind(job.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to save job: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Get a job record by ID
    pub async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT
                id, name, status, message, progress, temp_dir, final_dir,
                direct_urls, direct_index, direct_skipped, direct_exts,
                headers, meta, meta_path, post_processed, encryption, created_at
            FROM jobs
            WHERE id = ?
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to get job: {}",
                e
            )))
        })?;

        Ok(row)
    }

    /// List all job records, oldest first
    pub async fn list_jobs(&self) -> Result<Vec<JobRecord>> {
        let rows = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT
                id, name, status, message, progress, temp_dir, final_dir,
                direct_urls, direct_index, direct_skipped, direct_exts,
                headers, meta, meta_path, post_processed, encryption, created_at
            FROM jobs
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list jobs: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Delete a job record
    pub async fn delete_job(&self, id: JobId) -> Result<()> {
        sqlx::query("DELETE FROM jobs WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to delete job: {}",
                    e
                )))
            })?;

        Ok(())
    }

    /// Highest persisted job ID, 0 when the table is empty
    pub async fn max_job_id(&self) -> Result<i64> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(id) FROM jobs")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to query max job id: {}",
                    e
                )))
            })?;

        Ok(max.unwrap_or(0))
    }
}
