//! Pluggable task handlers.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;

use smartbill_core::TaskType;

/// Does the actual work for one task type.
///
/// The returned JSON is stored as the task's result; an error's display text
/// (with its context chain) is stored as the task's failure message.
/// Implementations doing blocking work (running an OCR binary, parsing large
/// files) should move it onto `tokio::task::spawn_blocking` and take a slot
/// from the [`ConcurrencyGate`](crate::gate::ConcurrencyGate) first.
#[async_trait]
pub trait TaskHandler: Send + Sync + 'static {
    async fn process(&self, target_id: &str) -> anyhow::Result<serde_json::Value>;
}

/// Adapter turning an async closure into a [`TaskHandler`].
#[derive(Clone)]
pub struct HandlerFn<F>(F);

/// Wrap `f` (taking the target id) as a handler.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    HandlerFn(f)
}

#[async_trait]
impl<F, Fut> TaskHandler for HandlerFn<F>
where
    F: Fn(String) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
{
    async fn process(&self, target_id: &str) -> anyhow::Result<serde_json::Value> {
        (self.0)(target_id.to_string()).await
    }
}

/// Handlers keyed by task type.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `task_type`.
    pub fn register(&mut self, task_type: impl Into<TaskType>, handler: Arc<dyn TaskHandler>) {
        self.handlers.insert(task_type.into(), handler);
    }

    pub fn get(&self, task_type: &TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(task_type).cloned()
    }

    pub fn types(&self) -> impl Iterator<Item = &TaskType> {
        self.handlers.keys()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}
