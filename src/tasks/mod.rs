//! Task model shared by the store, worker, router and gateway.

pub mod model;

pub use model::{
    ClaimFilter, DEFAULT_MAX_RETRIES, NewTask, PriorityLevel, Task, TaskPatch, TaskQuery,
    TaskRecord, TaskStatus,
};
