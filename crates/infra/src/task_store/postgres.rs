//! Postgres-backed task store.
//!
//! ## Atomicity
//!
//! Every state change is one `UPDATE … WHERE id = $n AND status = ANY($m)`
//! statement, so the database performs the compare-and-swap. Two workers
//! claiming the same row both issue the update; Postgres serializes them on
//! the row lock and the loser re-evaluates the `WHERE` clause against the new
//! status and affects zero rows.
//!
//! The partial unique index `uq_tasks_in_flight_key` (see
//! `migrations/0001_tasks.sql`) enforces the in-flight de-duplication rule even
//! when two submitters race past the lookup.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Code | StoreError |
//! |------------|-----------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (other) | any | `Unavailable` |
//! | Decode / ColumnDecode / ColumnNotFound | N/A | `Corrupt` |
//! | PoolClosed / PoolTimedOut / Io / Tls / other | N/A | `Unavailable` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::instrument;

use smartbill_core::{DedupKey, Task, TaskId, TaskStatus, TaskType};

use super::r#trait::{StoreError, TaskStore, TaskUpdate, UpdateGuard};

/// Schema for the `tasks` table and its indexes. Idempotent.
pub const MIGRATION: &str = include_str!("../../migrations/0001_tasks.sql");

const TASK_COLUMNS: &str = "id, owner_id, type, target_id, content_fingerprint, status, \
     created_by, result_json, error, created_at, updated_at";

/// Postgres-backed task store.
///
/// `Send + Sync` and cheap to clone; all operations go through the SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresTaskStore {
    pool: Arc<PgPool>,
}

impl PostgresTaskStore {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Connect with a small pool sized for a worker process.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| map_sqlx_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the `tasks` table and indexes if missing.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(MIGRATION)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_one_task(
        &self,
        operation: &str,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<Option<Task>, StoreError> {
        let row = query
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;
        row.map(|row| decode_task(&row)).transpose()
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    #[instrument(skip(self, task), fields(task_id = %task.id, task_type = %task.task_type), err)]
    async fn insert(&self, task: &Task) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO tasks (
                id,
                owner_id,
                type,
                target_id,
                content_fingerprint,
                status,
                created_by,
                result_json,
                error,
                created_at,
                updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(task.id.as_uuid())
        .bind(&task.owner_id)
        .bind(task.task_type.as_str())
        .bind(&task.target_id)
        .bind(task.content_fingerprint.as_deref())
        .bind(task.status.as_str())
        .bind(&task.created_by)
        .bind(&task.result)
        .bind(task.error.as_deref())
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_task", e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1");
        self.fetch_one_task("get_task", sqlx::query(&sql).bind(id.as_uuid()))
            .await
    }

    #[instrument(skip(self), fields(task_id = %id), err)]
    async fn get_for_owner(&self, owner_id: &str, id: TaskId) -> Result<Option<Task>, StoreError> {
        let sql = format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = $1 AND owner_id = $2");
        self.fetch_one_task(
            "get_task_for_owner",
            sqlx::query(&sql).bind(id.as_uuid()).bind(owner_id),
        )
        .await
    }

    #[instrument(skip(self, key), fields(task_type = %key.task_type, target_id = %key.target_id), err)]
    async fn find_active(&self, key: &DedupKey) -> Result<Option<Task>, StoreError> {
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE type = $1
                AND owner_id = $2
                AND target_id = $3
                AND status IN ('queued', 'processing')
                AND ($4::text IS NULL OR content_fingerprint = $4)
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#
        );
        self.fetch_one_task(
            "find_active_task",
            sqlx::query(&sql)
                .bind(key.task_type.as_str())
                .bind(&key.owner_id)
                .bind(&key.target_id)
                .bind(key.fingerprint.as_deref()),
        )
        .await
    }

    #[instrument(skip(self), err)]
    async fn oldest_queued(&self) -> Result<Option<Task>, StoreError> {
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE status = 'queued'
            ORDER BY created_at ASC, id ASC
            LIMIT 1
            "#
        );
        self.fetch_one_task("oldest_queued", sqlx::query(&sql)).await
    }

    #[instrument(skip(self, guard, update), fields(task_id = %id, to = %update.status), err)]
    async fn update_if(
        &self,
        id: TaskId,
        guard: &UpdateGuard,
        update: &TaskUpdate,
    ) -> Result<u64, StoreError> {
        let expected: Vec<String> = guard
            .expected
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = $1,
                result_json = $2,
                error = $3,
                updated_at = $4
            WHERE id = $5
                AND status = ANY($6)
                AND ($7::text IS NULL OR owner_id = $7)
            "#,
        )
        .bind(update.status.as_str())
        .bind(&update.result)
        .bind(update.error.as_deref())
        .bind(Utc::now())
        .bind(id.as_uuid())
        .bind(&expected)
        .bind(guard.owner_id.as_deref())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_task_if", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self, error), err)]
    async fn fail_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failed',
                result_json = NULL,
                error = $1,
                updated_at = $2
            WHERE status = 'processing' AND updated_at < $3
            "#,
        )
        .bind(error)
        .bind(Utc::now())
        .bind(cutoff)
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("fail_stale_processing", e))?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn list_for_owner(
        &self,
        owner_id: &str,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let sql = format!(
            r#"
            SELECT {TASK_COLUMNS}
            FROM tasks
            WHERE owner_id = $1
                AND ($2::text IS NULL OR status = $2)
            ORDER BY created_at ASC, id ASC
            LIMIT $3
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(owner_id)
            .bind(status.map(|s| s.as_str()))
            .bind(i64::try_from(limit).unwrap_or(i64::MAX))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_tasks_for_owner", e))?;

        rows.iter().map(decode_task).collect()
    }
}

// SQLx row types

#[derive(Debug)]
struct TaskRow {
    id: uuid::Uuid,
    owner_id: String,
    task_type: String,
    target_id: String,
    content_fingerprint: Option<String>,
    status: String,
    created_by: String,
    result_json: Option<serde_json::Value>,
    error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for TaskRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(TaskRow {
            id: row.try_get("id")?,
            owner_id: row.try_get("owner_id")?,
            task_type: row.try_get("type")?,
            target_id: row.try_get("target_id")?,
            content_fingerprint: row.try_get("content_fingerprint")?,
            status: row.try_get("status")?,
            created_by: row.try_get("created_by")?,
            result_json: row.try_get("result_json")?,
            error: row.try_get("error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<TaskRow> for Task {
    type Error = StoreError;

    fn try_from(row: TaskRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<TaskStatus>()
            .map_err(|e| StoreError::Corrupt(format!("task {}: {e}", row.id)))?;

        Ok(Task {
            id: TaskId::from_uuid(row.id),
            owner_id: row.owner_id,
            task_type: TaskType::from(row.task_type),
            target_id: row.target_id,
            content_fingerprint: row.content_fingerprint,
            status,
            created_by: row.created_by,
            result: row.result_json,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_task(row: &PgRow) -> Result<Task, StoreError> {
    use sqlx::FromRow;

    let row = TaskRow::from_row(row).map_err(|e| map_sqlx_error("decode_task", e))?;
    Task::try_from(row)
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                _ => StoreError::Unavailable(msg),
            }
        }
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_)
        | sqlx::Error::RowNotFound => {
            StoreError::Corrupt(format!("sqlx error in {}: {}", operation, err))
        }
        sqlx::Error::PoolClosed => {
            StoreError::Unavailable(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Unavailable(format!("sqlx error in {}: {}", operation, err)),
    }
}
