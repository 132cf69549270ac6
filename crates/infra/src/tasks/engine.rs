//! Claim-dispatch-complete cycle of the task engine.

use std::any::Any;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};

use smartbill_core::{Task, TaskError, TaskId, TaskStatus, TaskType};

use crate::config::EngineConfig;
use crate::task_store::{StoreError, TaskStore, TaskUpdate, UpdateGuard};

use super::handler::{HandlerRegistry, TaskHandler};
use super::service::TaskService;

/// What a single [`TaskEngine::run_once`] did with the task it claimed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Processed {
    /// The handler returned a result and it was stored.
    Succeeded(TaskId),
    /// The handler failed (or was missing, or panicked) and the error was stored.
    Failed(TaskId),
    /// The task was canceled between claim and dispatch; no handler ran.
    Skipped(TaskId),
    /// The handler ran but the task had already left `processing`
    /// (canceled or reaped), so the outcome was discarded.
    Superseded(TaskId),
}

impl Processed {
    pub fn task_id(&self) -> TaskId {
        match *self {
            Self::Succeeded(id) | Self::Failed(id) | Self::Skipped(id) | Self::Superseded(id) => id,
        }
    }
}

/// Engine runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub superseded: u64,
    pub reaped: u64,
    pub store_errors: u64,
}

/// Background task engine.
///
/// Owns the store handle, the wake signal shared with [`TaskService`], the
/// handler registry and the loop configuration. Build one per process,
/// register handlers, then [`spawn`](TaskEngine::spawn) it.
pub struct TaskEngine<S: ?Sized> {
    pub(super) store: Arc<S>,
    pub(super) wake: Arc<Notify>,
    pub(super) handlers: HandlerRegistry,
    pub(super) config: EngineConfig,
    pub(super) stats: Arc<Mutex<EngineStats>>,
}

impl<S> TaskEngine<S>
where
    S: TaskStore + ?Sized + 'static,
{
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self {
            store,
            wake: Arc::new(Notify::new()),
            handlers: HandlerRegistry::new(),
            config: config.normalized(),
            stats: Arc::new(Mutex::new(EngineStats::default())),
        }
    }

    /// Register (or replace) the handler for a task type.
    pub fn register_handler(&mut self, task_type: impl Into<TaskType>, handler: impl TaskHandler) {
        self.handlers.register(task_type, Arc::new(handler));
    }

    /// Request-path API sharing this engine's store and wake signal.
    pub fn service(&self) -> TaskService<S> {
        TaskService::new(self.store.clone(), self.wake.clone())
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub(super) fn record(&self, f: impl FnOnce(&mut EngineStats)) {
        let mut stats = self
            .stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut stats);
    }

    /// Claim the oldest queued task, run its handler and store the outcome.
    ///
    /// Returns `Ok(None)` when there was nothing to claim (including losing
    /// the claim to another worker). Only store failures are returned as
    /// errors; handler failures are stored on the task.
    pub async fn run_once(&self) -> Result<Option<Processed>, StoreError> {
        let Some(task) = self.store.oldest_queued().await? else {
            return Ok(None);
        };

        let claimed = self
            .store
            .update_if(task.id, &UpdateGuard::status(TaskStatus::Queued), &TaskUpdate::claim())
            .await?;
        if claimed == 0 {
            debug!(task_id = %task.id, "claim lost");
            return Ok(None);
        }

        let processed = self.process_claimed(task).await?;
        self.record(|s| {
            s.processed += 1;
            match processed {
                Processed::Succeeded(_) => s.succeeded += 1,
                Processed::Failed(_) => s.failed += 1,
                Processed::Skipped(_) => s.skipped += 1,
                Processed::Superseded(_) => s.superseded += 1,
            }
        });
        Ok(Some(processed))
    }

    #[instrument(skip_all, fields(task_id = %task.id, task_type = %task.task_type))]
    async fn process_claimed(&self, task: Task) -> Result<Processed, StoreError> {
        // A cancel may have landed right after the claim.
        match self.store.get(task.id).await {
            Ok(Some(current)) if current.status != TaskStatus::Processing => {
                info!(status = %current.status, "task left processing before dispatch, skipping");
                return Ok(Processed::Skipped(task.id));
            }
            Ok(Some(_)) => {}
            Ok(None) => {
                warn!("claimed task disappeared, skipping");
                return Ok(Processed::Skipped(task.id));
            }
            Err(err) => {
                // The completion write is guarded, so running anyway is safe.
                warn!(error = %err, "re-check after claim failed, dispatching anyway");
            }
        }

        let outcome = self.dispatch(&task).await;
        let update = match &outcome {
            Ok(result) => TaskUpdate::succeeded(result.clone()),
            Err(message) => TaskUpdate::failed(message.clone()),
        };

        let rows = self
            .store
            .update_if(task.id, &UpdateGuard::status(TaskStatus::Processing), &update)
            .await?;
        if rows == 0 {
            info!("task left processing while the handler ran, outcome discarded");
            return Ok(Processed::Superseded(task.id));
        }

        match outcome {
            Ok(_) => {
                info!("task succeeded");
                Ok(Processed::Succeeded(task.id))
            }
            Err(message) => {
                warn!(error = %message, "task failed");
                Ok(Processed::Failed(task.id))
            }
        }
    }

    /// Run the handler on its own Tokio task so a panic surfaces as a
    /// `JoinError` instead of unwinding through the worker loop.
    async fn dispatch(&self, task: &Task) -> Result<serde_json::Value, String> {
        let Some(handler) = self.handlers.get(&task.task_type) else {
            return Err(TaskError::UnknownTaskType(task.task_type.to_string()).to_string());
        };

        let target_id = task.target_id.clone();
        let joined = tokio::spawn(async move { handler.process(&target_id).await }).await;

        match joined {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(err)) => Err(format!("{err:#}")),
            Err(join_err) if join_err.is_panic() => Err(format!(
                "handler panicked: {}",
                panic_message(join_err.into_panic())
            )),
            Err(join_err) => Err(format!("handler aborted: {join_err}")),
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
