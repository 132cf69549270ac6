//! Infrastructure layer: task persistence, the background engine and the
//! concurrency gate.

pub mod config;
pub mod gate;
pub mod task_store;
pub mod tasks;

pub use config::{ClassLimit, EngineConfig, GateConfig};
pub use gate::{ConcurrencyGate, GateError, GatePermit};
pub use task_store::{InMemoryTaskStore, PostgresTaskStore, StoreError, TaskStore, TaskUpdate, UpdateGuard};
pub use tasks::{
    EngineHandle, EngineStats, HandlerFn, HandlerRegistry, PROCESSING_TIMEOUT_MESSAGE, Processed,
    TaskEngine, TaskHandler, TaskService, handler_fn,
};
