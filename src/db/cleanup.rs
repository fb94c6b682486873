//! Pending-cleanup ledger.

use crate::error::DatabaseError;
use crate::{Error, Result};

use super::{CleanupKind, Database, PendingCleanup};

impl Database {
    /// Record a path that still has to be deleted
    ///
    /// Registering the same path twice is a no-op.
    pub async fn add_pending_cleanup(&self, path: &str, kind: CleanupKind) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        sqlx::query(
            r#"
            INSERT INTO pending_cleanup (path, kind, created_at)
            VALUES (?, ?, ?)
            ON CONFLICT(path) DO NOTHING
            "#,
        )
        .bind(path)
        .bind(kind.as_str())
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to register pending cleanup: {}",
                e
            )))
        })?;

        Ok(())
    }

    /// Ledger entries of one kind, oldest first
    pub async fn list_pending_cleanup(&self, kind: CleanupKind) -> Result<Vec<PendingCleanup>> {
        let rows = sqlx::query_as::<_, PendingCleanup>(
            r#"
            SELECT path, kind, created_at
            FROM pending_cleanup
            WHERE kind = ?
            ORDER BY created_at ASC, path ASC
            "#,
        )
        .bind(kind.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| {
            Error::Database(DatabaseError::QueryFailed(format!(
                "Failed to list pending cleanup: {}",
                e
            )))
        })?;

        Ok(rows)
    }

    /// Drop a ledger entry
    pub async fn remove_pending_cleanup(&self, path: &str) -> Result<()> {
        sqlx::query("DELETE FROM pending_cleanup WHERE path = ?")
            .bind(path)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                Error::Database(DatabaseError::QueryFailed(format!(
                    "Failed to remove pending cleanup: {}",
                    e
                )))
            })?;

        Ok(())
    }
}
