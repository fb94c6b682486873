//! Runtime state: a small key/value table, used for clean-shutdown tracking.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::Database;

const CLEAN_SHUTDOWN_KEY: &str = "clean_shutdown";

impl Database {
    /// Read a runtime state value
    pub async fn get_state(&self, key: &str) -> Result<Option<String>> {
        sqlx::query_scalar("SELECT value FROM runtime_state WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to read runtime state {key}: {e}"
                )))
            })
    }

    /// Insert or replace a runtime state value
    pub async fn set_state(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO runtime_state (key, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to write runtime state {key}: {e}"
            )))
        })?;
        Ok(())
    }

    /// Whether the previous process exited without calling
    /// [`set_clean_shutdown`](Self::set_clean_shutdown)
    ///
    /// A store that never recorded the flag counts as unclean.
    pub async fn was_unclean_shutdown(&self) -> Result<bool> {
        let value = self.get_state(CLEAN_SHUTDOWN_KEY).await?;
        Ok(value.is_none_or(|v| v != "true"))
    }

    /// Record that a process is running against this store
    pub async fn set_clean_start(&self) -> Result<()> {
        self.set_state(CLEAN_SHUTDOWN_KEY, "false").await
    }

    /// Record that the running process shut down cleanly
    pub async fn set_clean_shutdown(&self) -> Result<()> {
        self.set_state(CLEAN_SHUTDOWN_KEY, "true").await
    }
}
