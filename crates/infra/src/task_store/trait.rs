use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use smartbill_core::{DedupKey, Task, TaskError, TaskId, TaskStatus};

/// Task store operation error.
///
/// These are **infrastructure errors**; the service layer turns them into the
/// caller-visible [`TaskError`] taxonomy.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The backing store could not be reached (network, pool, lock).
    #[error("task store unavailable: {0}")]
    Unavailable(String),

    /// An insert collided with a uniqueness rule (duplicate id, or another
    /// in-flight task with the same de-duplication key).
    #[error("task conflict: {0}")]
    Conflict(String),

    /// A stored row could not be decoded.
    #[error("corrupt task row: {0}")]
    Corrupt(String),
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(msg) | StoreError::Conflict(msg) | StoreError::Corrupt(msg) => {
                TaskError::StoreUnavailable(msg)
            }
        }
    }
}

/// Condition under which [`TaskStore::update_if`] applies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateGuard {
    /// The task's current status must be one of these.
    pub expected: Vec<TaskStatus>,
    /// When set, the task must also belong to this owner.
    pub owner_id: Option<String>,
}

impl UpdateGuard {
    pub fn status(expected: TaskStatus) -> Self {
        Self {
            expected: vec![expected],
            owner_id: None,
        }
    }

    pub fn any_of(expected: &[TaskStatus]) -> Self {
        Self {
            expected: expected.to_vec(),
            owner_id: None,
        }
    }

    pub fn owned_by(mut self, owner_id: impl Into<String>) -> Self {
        self.owner_id = Some(owner_id.into());
        self
    }

    pub fn allows(&self, task: &Task) -> bool {
        self.expected.contains(&task.status)
            && self
                .owner_id
                .as_deref()
                .is_none_or(|owner| task.owner_id == owner)
    }
}

/// Fields written by a guarded update.
///
/// Every update writes status, result and error together, which keeps the
/// "result only on success, error only on failure" invariant in one place.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskUpdate {
    pub status: TaskStatus,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl TaskUpdate {
    /// `queued -> processing`.
    pub fn claim() -> Self {
        Self {
            status: TaskStatus::Processing,
            result: None,
            error: None,
        }
    }

    pub fn succeeded(result: serde_json::Value) -> Self {
        Self {
            status: TaskStatus::Succeeded,
            result: Some(result),
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn canceled() -> Self {
        Self {
            status: TaskStatus::Canceled,
            result: None,
            error: None,
        }
    }

    /// Apply to an in-memory record, stamping `updated_at`.
    pub fn apply_to(&self, task: &mut Task, now: DateTime<Utc>) {
        task.status = self.status;
        task.result = self.result.clone();
        task.error = self.error.clone();
        task.updated_at = now;
    }
}

/// Durable store of tasks.
///
/// ## Implementation requirements
///
/// - `update_if` and `fail_stale_processing` must be single atomic conditional
///   writes (no read-then-write).
/// - `insert` must reject a second in-flight task with the same exact
///   [`DedupKey`] with [`StoreError::Conflict`].
/// - `oldest_queued` orders by `(created_at, id)` ascending.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Persist a new task.
    async fn insert(&self, task: &Task) -> Result<(), StoreError>;

    /// Load a task by id, regardless of owner.
    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Load a task by id, scoped to its owner.
    async fn get_for_owner(&self, owner_id: &str, id: TaskId) -> Result<Option<Task>, StoreError>;

    /// Find an in-flight (`queued`/`processing`) task matching `key`.
    async fn find_active(&self, key: &DedupKey) -> Result<Option<Task>, StoreError>;

    /// The oldest `queued` task, if any.
    async fn oldest_queued(&self) -> Result<Option<Task>, StoreError>;

    /// Apply `update` when `guard` holds; returns the number of rows changed (0 or 1).
    async fn update_if(
        &self,
        id: TaskId,
        guard: &UpdateGuard,
        update: &TaskUpdate,
    ) -> Result<u64, StoreError>;

    /// Fail every `processing` task last updated before `cutoff`.
    async fn fail_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
    ) -> Result<u64, StoreError>;

    /// Owner-scoped listing ordered by `(created_at, id)`.
    async fn list_for_owner(
        &self,
        owner_id: &str,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError>;
}

#[async_trait]
impl<S> TaskStore for Arc<S>
where
    S: TaskStore + ?Sized,
{
    async fn insert(&self, task: &Task) -> Result<(), StoreError> {
        (**self).insert(task).await
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        (**self).get(id).await
    }

    async fn get_for_owner(&self, owner_id: &str, id: TaskId) -> Result<Option<Task>, StoreError> {
        (**self).get_for_owner(owner_id, id).await
    }

    async fn find_active(&self, key: &DedupKey) -> Result<Option<Task>, StoreError> {
        (**self).find_active(key).await
    }

    async fn oldest_queued(&self) -> Result<Option<Task>, StoreError> {
        (**self).oldest_queued().await
    }

    async fn update_if(
        &self,
        id: TaskId,
        guard: &UpdateGuard,
        update: &TaskUpdate,
    ) -> Result<u64, StoreError> {
        (**self).update_if(id, guard, update).await
    }

    async fn fail_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
    ) -> Result<u64, StoreError> {
        (**self).fail_stale_processing(cutoff, error).await
    }

    async fn list_for_owner(
        &self,
        owner_id: &str,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        (**self).list_for_owner(owner_id, status, limit).await
    }
}
