//! Durable task store boundary.
//!
//! The store is the single source of truth shared by the submission path, the
//! worker loop and the reaper. Every mutation after insert goes through
//! [`TaskStore::update_if`], a compare-and-swap on the task's current status,
//! so that several workers (or duplicated timers) stay correct without any
//! in-process lock.

pub mod in_memory;
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryTaskStore;
pub use postgres::PostgresTaskStore;
pub use r#trait::{StoreError, TaskStore, TaskUpdate, UpdateGuard};
