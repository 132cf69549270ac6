//! Background task execution.
//!
//! [`TaskService`] is the request-path side: it de-duplicates submissions,
//! answers status polls and cancels tasks. [`TaskEngine`] is the background
//! side: one worker loop claims the oldest queued task, dispatches it to the
//! [`TaskHandler`] registered for its type and records the outcome, while a
//! reaper fails tasks stuck in `processing` past the configured TTL.
//!
//! Every status change goes through [`TaskStore::update_if`], so the worker,
//! the reaper and cancellation can race freely: whichever terminal write
//! lands first wins and the others become no-ops.
//!
//! [`TaskStore::update_if`]: crate::task_store::TaskStore::update_if

mod backoff;
mod engine;
mod handler;
mod reaper;
mod service;
mod worker;

pub use engine::{EngineStats, Processed, TaskEngine};
pub use handler::{HandlerFn, HandlerRegistry, TaskHandler, handler_fn};
pub use reaper::PROCESSING_TIMEOUT_MESSAGE;
pub use service::TaskService;
pub use worker::EngineHandle;
