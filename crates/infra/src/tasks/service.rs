//! Submission, lookup and cancellation of tasks.

use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{debug, info, warn};

use smartbill_core::{NewTask, Task, TaskError, TaskId, TaskResult, TaskStatus};

use crate::task_store::{StoreError, TaskStore, TaskUpdate, UpdateGuard};

/// Request-path API of the task engine.
///
/// Cheap to clone; every clone shares the store handle and the worker's wake
/// signal.
pub struct TaskService<S: ?Sized> {
    store: Arc<S>,
    wake: Arc<Notify>,
}

impl<S: ?Sized> Clone for TaskService<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            wake: self.wake.clone(),
        }
    }
}

impl<S> TaskService<S>
where
    S: TaskStore + ?Sized,
{
    pub fn new(store: Arc<S>, wake: Arc<Notify>) -> Self {
        Self { store, wake }
    }

    /// Submit work, returning the in-flight task for the same key if one exists.
    ///
    /// `owner_id` scopes the task's data; `created_by` records who submitted
    /// it (they differ under delegated operation).
    pub async fn submit(
        &self,
        task_type: &str,
        owner_id: &str,
        created_by: &str,
        target_id: &str,
        fingerprint: Option<&str>,
    ) -> TaskResult<Task> {
        let new_task = NewTask::parse(task_type, owner_id, created_by, target_id, fingerprint)?;
        let key = new_task.dedup_key();

        if let Some(existing) = self.store.find_active(&key).await? {
            debug!(task_id = %existing.id, status = %existing.status, "returning in-flight task");
            self.wake_if_queued(&existing);
            return Ok(existing);
        }

        let task = Task::queued(new_task);
        match self.store.insert(&task).await {
            Ok(()) => {
                info!(
                    task_id = %task.id,
                    task_type = %task.task_type,
                    owner_id = %task.owner_id,
                    target_id = %task.target_id,
                    "task queued"
                );
                self.wake.notify_one();
                Ok(task)
            }
            Err(StoreError::Conflict(msg)) => {
                // A concurrent submitter inserted the same key first.
                debug!(error = %msg, "submission lost insert race");
                match self.store.find_active(&key).await? {
                    Some(existing) => {
                        self.wake_if_queued(&existing);
                        Ok(existing)
                    }
                    None => Err(TaskError::store_unavailable(
                        "concurrent submission for the same key, retry",
                    )),
                }
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Submit work on one's own behalf (`owner_id == created_by`).
    pub async fn submit_own(
        &self,
        task_type: &str,
        created_by: &str,
        target_id: &str,
        fingerprint: Option<&str>,
    ) -> TaskResult<Task> {
        self.submit(task_type, created_by, created_by, target_id, fingerprint)
            .await
    }

    /// Owner-scoped lookup for status polling.
    ///
    /// Blank or malformed ids are reported as `NotFound`.
    pub async fn get_task(&self, owner_id: &str, id: &str) -> TaskResult<Task> {
        let owner_id = owner_id.trim();
        if owner_id.is_empty() {
            return Err(TaskError::NotFound);
        }
        let id = parse_id(id)?;

        self.store
            .get_for_owner(owner_id, id)
            .await?
            .ok_or(TaskError::NotFound)
    }

    /// Cancel a task that has not reached a terminal state.
    ///
    /// Cancelling an already canceled task of the caller succeeds.
    pub async fn cancel(&self, id: &str, owner_id: &str) -> TaskResult<()> {
        let owner_id = owner_id.trim();
        if id.trim().is_empty() || owner_id.is_empty() {
            return Err(TaskError::invalid_input("missing task id or owner_id"));
        }
        let id = parse_id(id)?;

        let guard = UpdateGuard::any_of(&TaskStatus::ACTIVE).owned_by(owner_id);
        let rows = self
            .store
            .update_if(id, &guard, &TaskUpdate::canceled())
            .await?;
        if rows > 0 {
            info!(task_id = %id, owner_id = %owner_id, "task canceled");
            return Ok(());
        }

        match self.store.get(id).await? {
            None => Err(TaskError::NotFound),
            Some(task) if task.owner_id == owner_id && task.status == TaskStatus::Canceled => Ok(()),
            Some(task) => {
                warn!(task_id = %id, status = %task.status, "cancel rejected");
                Err(TaskError::NotCancelable)
            }
        }
    }

    /// Owner-scoped listing, oldest first.
    pub async fn list_tasks(
        &self,
        owner_id: &str,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> TaskResult<Vec<Task>> {
        let owner_id = owner_id.trim();
        if owner_id.is_empty() {
            return Err(TaskError::invalid_input("missing owner_id"));
        }
        Ok(self.store.list_for_owner(owner_id, status, limit).await?)
    }

    fn wake_if_queued(&self, task: &Task) {
        if task.status == TaskStatus::Queued {
            self.wake.notify_one();
        }
    }
}

fn parse_id(id: &str) -> TaskResult<TaskId> {
    // No task can exist under an id that is not a UUID.
    id.parse::<TaskId>().map_err(|_| TaskError::NotFound)
}
