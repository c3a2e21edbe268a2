//! Task records, lifecycle transitions and query result types.

pub mod model;
pub mod query;

pub use model::{TaskId, TaskRecord, TaskStatus, Transition, TransitionPolicy};
pub use query::{Page, PageRequest, StatusCounts, TaskTypeCount};
