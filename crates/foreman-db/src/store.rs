//! Key/value operations over the `tasks` table.
//!
//! The store is deliberately dumb: it serializes whole [`TaskRecord`]s and
//! never inspects them. Per-task write ordering is the scheduler's job; the
//! store guarantees that each upsert is atomic and durable.

use anyhow::{Context, Result};
use sqlx::{Row, SqlitePool};

use crate::models::TaskRecord;

/// Handle to the durable task store.
#[derive(Debug, Clone)]
pub struct TaskStore {
    pool: SqlitePool,
}

impl TaskStore {
    /// Wrap an open pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// The underlying pool, for health checks.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert or replace the record for `task.id`.
    pub async fn upsert(&self, task: &TaskRecord) -> Result<()> {
        let record =
            serde_json::to_string(task).context("failed to serialize task record")?;

        sqlx::query(
            "INSERT INTO tasks (id, record, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4) \
             ON CONFLICT(id) DO UPDATE SET \
               record = excluded.record, \
               updated_at = excluded.updated_at",
        )
        .bind(&task.id)
        .bind(&record)
        .bind(task.created_at.to_rfc3339())
        .bind(task.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to upsert task {}", task.id))?;

        Ok(())
    }

    /// Fetch a single record by task id.
    pub async fn get(&self, id: &str) -> Result<Option<TaskRecord>> {
        let row = sqlx::query("SELECT record FROM tasks WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to fetch task {id}"))?;

        match row {
            Some(row) => {
                let record: String = row.get("record");
                let task = serde_json::from_str(&record)
                    .with_context(|| format!("failed to decode stored record for task {id}"))?;
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    /// Load every stored record, oldest first. Used for warm-start recovery.
    ///
    /// A record that no longer decodes (e.g. an unknown status value written
    /// by an incompatible version) is an error, not a silent skip.
    pub async fn scan(&self) -> Result<Vec<TaskRecord>> {
        let rows = sqlx::query("SELECT id, record FROM tasks ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .context("failed to scan tasks")?;

        let mut tasks = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.get("id");
            let record: String = row.get("record");
            let task = serde_json::from_str(&record)
                .with_context(|| format!("failed to decode stored record for task {id}"))?;
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// Delete a record. Returns `true` if a row was removed.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete task {id}"))?;

        Ok(result.rows_affected() > 0)
    }

    /// Number of stored tasks. Used by the health endpoint.
    pub async fn count(&self) -> Result<i64> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM tasks")
            .fetch_one(&self.pool)
            .await
            .context("failed to count tasks")?;
        Ok(count.0)
    }
}
