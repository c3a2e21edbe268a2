//! `TaskStore` trait — backend-agnostic access to task records.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{DatabaseError, TaskError};
use crate::tasks::{
    Page, PageRequest, StatusCounts, TaskId, TaskRecord, TaskStatus, TaskTypeCount, Transition,
};

/// Query and lifecycle interface over all task records.
///
/// Reads never fail on an empty result; only backend problems surface as
/// errors. Transitions are compare-and-swap on the stored status: the first
/// writer wins and later writers get [`TaskError::InvalidTransition`].
#[async_trait]
pub trait TaskStore: Send + Sync {
    // ── Writes ──────────────────────────────────────────────────────

    /// Persist a freshly created task and return it with its assigned id.
    async fn insert_task(&self, task: &TaskRecord) -> Result<TaskRecord, TaskError>;

    /// Apply a lifecycle transition to the stored task.
    async fn apply_transition(
        &self,
        id: TaskId,
        transition: Transition,
    ) -> Result<TaskRecord, TaskError>;

    /// Delete every task in terminal `status` whose `completed_at` is
    /// strictly before `cutoff`. Returns the number of rows removed.
    async fn delete_terminal_before(
        &self,
        status: TaskStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, TaskError>;

    /// Create and persist a pending task carrying `payload`.
    async fn create_task(&self, task_type: &str, payload: &str) -> Result<TaskRecord, TaskError> {
        let task = TaskRecord::new(task_type)?.with_payload(payload);
        self.insert_task(&task).await
    }

    /// Claim a pending task for `worker`.
    async fn start_task(&self, id: TaskId, worker: &str) -> Result<TaskRecord, TaskError> {
        self.apply_transition(id, Transition::start(worker)).await
    }

    /// Record a successful result.
    async fn complete_task(&self, id: TaskId, result: &str) -> Result<TaskRecord, TaskError> {
        self.apply_transition(id, Transition::complete(result)).await
    }

    /// Record a failure.
    async fn fail_task(&self, id: TaskId, error: &str) -> Result<TaskRecord, TaskError> {
        self.apply_transition(id, Transition::fail(error)).await
    }

    // ── Lookups ─────────────────────────────────────────────────────

    /// Get a task by id.
    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, DatabaseError>;

    /// Get a task by id, or `NotFound`.
    async fn require_task(&self, id: TaskId) -> Result<TaskRecord, TaskError> {
        self.get_task(id).await?.ok_or(TaskError::NotFound { id })
    }

    /// All tasks in `status`, unordered.
    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// One page of tasks in `status`, ordered by id.
    async fn find_by_status_paged(
        &self,
        status: TaskStatus,
        page: PageRequest,
    ) -> Result<Page<TaskRecord>, DatabaseError>;

    /// All tasks of `task_type`.
    async fn find_by_task_type(&self, task_type: &str) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// All tasks ever assigned to `worker`.
    async fn find_by_assigned_worker(&self, worker: &str)
    -> Result<Vec<TaskRecord>, DatabaseError>;

    /// All tasks, newest first.
    async fn find_all_newest_first(&self) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// Tasks in `status`, oldest first (FIFO order).
    async fn find_by_status_oldest_first(
        &self,
        status: TaskStatus,
    ) -> Result<Vec<TaskRecord>, DatabaseError>;

    /// Tasks created strictly after `after`.
    async fn find_created_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, DatabaseError>;

    // ── Aggregates ──────────────────────────────────────────────────

    /// Number of IN_PROGRESS tasks assigned to `worker`.
    async fn count_active_tasks_for_worker(&self, worker: &str) -> Result<u64, DatabaseError>;

    /// Distinct workers holding at least one IN_PROGRESS task, sorted.
    async fn find_active_workers(&self) -> Result<Vec<String>, DatabaseError>;

    /// Number of tasks in `status`.
    async fn count_by_status(&self, status: TaskStatus) -> Result<u64, DatabaseError>;

    /// Number of COMPLETED tasks with `completed_at` in `[start, end]`.
    async fn count_completed_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, DatabaseError>;

    /// Task count per type, largest first.
    async fn task_type_statistics(&self) -> Result<Vec<TaskTypeCount>, DatabaseError>;

    /// Total number of tasks.
    async fn count_tasks(&self) -> Result<u64, DatabaseError>;

    /// Task count for every status.
    async fn status_counts(&self) -> Result<StatusCounts, DatabaseError>;
}

/// Reject retention deletes aimed at non-terminal tasks.
pub(crate) fn ensure_terminal(status: TaskStatus) -> Result<(), TaskError> {
    if !status.is_terminal() {
        return Err(TaskError::ConstraintViolation(format!(
            "retention cleanup only applies to terminal statuses, got {status}"
        )));
    }
    Ok(())
}

/// Validate a task handed to `insert_task`.
pub(crate) fn ensure_insertable(task: &TaskRecord) -> Result<(), TaskError> {
    crate::tasks::model::validate_task_type(&task.task_type)?;
    if let Some(id) = task.id {
        return Err(TaskError::ConstraintViolation(format!(
            "task already persisted with id {id}"
        )));
    }
    if task.status != TaskStatus::Pending {
        return Err(TaskError::ConstraintViolation(format!(
            "new tasks must be PENDING, got {}",
            task.status
        )));
    }
    Ok(())
}
