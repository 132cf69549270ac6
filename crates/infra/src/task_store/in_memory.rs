use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use smartbill_core::{DedupKey, Task, TaskId, TaskStatus};

use super::r#trait::{StoreError, TaskStore, TaskUpdate, UpdateGuard};

/// In-memory task store.
///
/// Intended for tests/dev. Each conditional write runs under a single write
/// lock, which gives the same compare-and-swap semantics as the SQL store.
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    tasks: RwLock<HashMap<TaskId, Task>>,
    offline: AtomicBool,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage: while set, every operation fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Total number of stored tasks, all owners and statuses.
    pub fn len(&self) -> usize {
        self.tasks.read().map(|tasks| tasks.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, HashMap<TaskId, Task>>, StoreError> {
        self.check_online()?;
        self.tasks
            .read()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<TaskId, Task>>, StoreError> {
        self.check_online()?;
        self.tasks
            .write()
            .map_err(|_| StoreError::Unavailable("lock poisoned".to_string()))
    }
}

fn queue_order(task: &Task) -> (DateTime<Utc>, TaskId) {
    (task.created_at, task.id)
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert(&self, task: &Task) -> Result<(), StoreError> {
        let mut tasks = self.write()?;
        if tasks.contains_key(&task.id) {
            return Err(StoreError::Conflict(format!("task {} already exists", task.id)));
        }
        if task.status.is_active() {
            let key = task.dedup_key();
            if let Some(existing) = tasks
                .values()
                .find(|t| t.status.is_active() && key.is_exact(t))
            {
                return Err(StoreError::Conflict(format!(
                    "task {} already in flight for this key",
                    existing.id
                )));
            }
        }
        tasks.insert(task.id, task.clone());
        Ok(())
    }

    async fn get(&self, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self.read()?.get(&id).cloned())
    }

    async fn get_for_owner(&self, owner_id: &str, id: TaskId) -> Result<Option<Task>, StoreError> {
        Ok(self
            .read()?
            .get(&id)
            .filter(|t| t.owner_id == owner_id)
            .cloned())
    }

    async fn find_active(&self, key: &DedupKey) -> Result<Option<Task>, StoreError> {
        Ok(self
            .read()?
            .values()
            .filter(|t| t.status.is_active() && key.matches(t))
            .min_by_key(|t| queue_order(t))
            .cloned())
    }

    async fn oldest_queued(&self) -> Result<Option<Task>, StoreError> {
        Ok(self
            .read()?
            .values()
            .filter(|t| t.status == TaskStatus::Queued)
            .min_by_key(|t| queue_order(t))
            .cloned())
    }

    async fn update_if(
        &self,
        id: TaskId,
        guard: &UpdateGuard,
        update: &TaskUpdate,
    ) -> Result<u64, StoreError> {
        let mut tasks = self.write()?;
        match tasks.get_mut(&id) {
            Some(task) if guard.allows(task) && task.status.can_transition_to(update.status) => {
                update.apply_to(task, Utc::now());
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn fail_stale_processing(
        &self,
        cutoff: DateTime<Utc>,
        error: &str,
    ) -> Result<u64, StoreError> {
        let mut tasks = self.write()?;
        let now = Utc::now();
        let update = TaskUpdate::failed(error);
        let mut affected = 0;
        for task in tasks
            .values_mut()
            .filter(|t| t.status == TaskStatus::Processing && t.updated_at < cutoff)
        {
            update.apply_to(task, now);
            affected += 1;
        }
        Ok(affected)
    }

    async fn list_for_owner(
        &self,
        owner_id: &str,
        status: Option<TaskStatus>,
        limit: usize,
    ) -> Result<Vec<Task>, StoreError> {
        let tasks = self.read()?;
        let mut result: Vec<_> = tasks
            .values()
            .filter(|t| t.owner_id == owner_id && status.is_none_or(|s| t.status == s))
            .cloned()
            .collect();

        result.sort_by_key(queue_order);
        result.truncate(limit);
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use smartbill_core::NewTask;

    fn queued(owner: &str, target: &str, fp: Option<&str>) -> Task {
        Task::queued(NewTask::parse("invoice_ocr", owner, owner, target, fp).unwrap())
    }

    #[tokio::test]
    async fn insert_rejects_second_in_flight_task_for_same_key() {
        let store = InMemoryTaskStore::new();
        store.insert(&queued("u1", "inv1", Some("h1"))).await.unwrap();

        let err = store.insert(&queued("u1", "inv1", Some("h1"))).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));

        // A different fingerprint or a missing one is a different key.
        store.insert(&queued("u1", "inv1", Some("h2"))).await.unwrap();
        store.insert(&queued("u1", "inv1", None)).await.unwrap();
        assert_eq!(store.len(), 3);
    }

    #[tokio::test]
    async fn terminal_tasks_do_not_block_insert() {
        let store = InMemoryTaskStore::new();
        let first = queued("u1", "inv1", Some("h1"));
        store.insert(&first).await.unwrap();
        let rows = store
            .update_if(first.id, &UpdateGuard::status(TaskStatus::Queued), &TaskUpdate::canceled())
            .await
            .unwrap();
        assert_eq!(rows, 1);

        store.insert(&queued("u1", "inv1", Some("h1"))).await.unwrap();
    }

    #[tokio::test]
    async fn claim_is_exclusive() {
        let store = InMemoryTaskStore::arc();
        let task = queued("u1", "inv1", None);
        store.insert(&task).await.unwrap();

        let guard = UpdateGuard::status(TaskStatus::Queued);
        let claim = TaskUpdate::claim();
        let (a, b) = tokio::join!(
            store.update_if(task.id, &guard, &claim),
            store.update_if(task.id, &guard, &claim),
        );
        assert_eq!(a.unwrap() + b.unwrap(), 1);

        let stored = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Processing);
    }

    #[tokio::test]
    async fn oldest_queued_is_fifo_with_id_tiebreak() {
        let store = InMemoryTaskStore::new();
        let base = Utc::now();

        let mut late = queued("u1", "a", None);
        late.created_at = base + Duration::seconds(5);
        let mut early = queued("u2", "b", None);
        early.created_at = base;
        let mut tie = queued("u3", "c", None);
        tie.created_at = base;

        for t in [&late, &early, &tie] {
            store.insert(t).await.unwrap();
        }

        let expected = early.id.min(tie.id);
        assert_eq!(store.oldest_queued().await.unwrap().unwrap().id, expected);
    }

    #[tokio::test]
    async fn owner_scoped_reads() {
        let store = InMemoryTaskStore::new();
        let task = queued("u1", "inv1", None);
        store.insert(&task).await.unwrap();

        assert!(store.get_for_owner("u1", task.id).await.unwrap().is_some());
        assert!(store.get_for_owner("u2", task.id).await.unwrap().is_none());
        assert_eq!(store.list_for_owner("u1", None, 10).await.unwrap().len(), 1);
        assert!(store.list_for_owner("u2", None, 10).await.unwrap().is_empty());
        assert!(store
            .list_for_owner("u1", Some(TaskStatus::Failed), 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn guarded_update_respects_owner() {
        let store = InMemoryTaskStore::new();
        let task = queued("u1", "inv1", None);
        store.insert(&task).await.unwrap();

        let guard = UpdateGuard::any_of(&TaskStatus::ACTIVE).owned_by("u2");
        let rows = store.update_if(task.id, &guard, &TaskUpdate::canceled()).await.unwrap();
        assert_eq!(rows, 0);

        let guard = UpdateGuard::any_of(&TaskStatus::ACTIVE).owned_by("u1");
        let rows = store.update_if(task.id, &guard, &TaskUpdate::canceled()).await.unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn illegal_transition_is_a_no_op() {
        let store = InMemoryTaskStore::new();
        let task = queued("u1", "inv1", None);
        store.insert(&task).await.unwrap();

        // queued -> failed is not an edge of the lifecycle.
        let guard = UpdateGuard::any_of(&TaskStatus::ALL);
        let rows = store
            .update_if(task.id, &guard, &TaskUpdate::failed("boom"))
            .await
            .unwrap();
        assert_eq!(rows, 0);
        assert_eq!(store.get(task.id).await.unwrap().unwrap().status, TaskStatus::Queued);

        // The store stays usable afterwards.
        assert_eq!(store.oldest_queued().await.unwrap().unwrap().id, task.id);
    }

    #[tokio::test]
    async fn stale_sweep_only_touches_old_processing_rows() {
        let store = InMemoryTaskStore::new();
        let now = Utc::now();

        let mut stale = queued("u1", "a", None);
        stale.status = TaskStatus::Processing;
        stale.updated_at = now - Duration::minutes(10);
        let mut fresh = queued("u1", "b", None);
        fresh.status = TaskStatus::Processing;
        fresh.updated_at = now;
        let mut old_queued = queued("u1", "c", None);
        old_queued.updated_at = now - Duration::minutes(10);

        for t in [&stale, &fresh, &old_queued] {
            store.insert(t).await.unwrap();
        }

        let n = store
            .fail_stale_processing(now - Duration::minutes(1), "task processing timeout")
            .await
            .unwrap();
        assert_eq!(n, 1);

        let reaped = store.get(stale.id).await.unwrap().unwrap();
        assert_eq!(reaped.status, TaskStatus::Failed);
        assert_eq!(reaped.error.as_deref(), Some("task processing timeout"));
        assert!(reaped.outcome_consistent());
        assert_eq!(store.get(fresh.id).await.unwrap().unwrap().status, TaskStatus::Processing);
        assert_eq!(store.get(old_queued.id).await.unwrap().unwrap().status, TaskStatus::Queued);
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let store = InMemoryTaskStore::new();
        store.set_offline(true);
        let err = store.oldest_queued().await.unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));

        store.set_offline(false);
        assert!(store.oldest_queued().await.unwrap().is_none());
    }
}
