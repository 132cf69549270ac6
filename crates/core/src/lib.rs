//! `smartbill-core`: domain model of the background task engine.
//!
//! This crate contains **pure domain** types (no storage, no runtime): the task
//! record and its state machine, identifiers, resource classes and the
//! caller-visible error taxonomy.

pub mod error;
pub mod id;
pub mod resource;
pub mod task;

pub use error::{TaskError, TaskResult};
pub use id::TaskId;
pub use resource::ResourceClass;
pub use task::{DedupKey, NewTask, Task, TaskStatus, TaskType};
