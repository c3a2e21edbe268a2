//! Task record and lifecycle state machine.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TaskError;

/// Store-assigned task identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl TaskId {
    pub fn as_i64(&self) -> i64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    /// Created, waiting for a worker.
    Pending,
    /// Claimed by a worker.
    InProgress,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::InProgress,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    /// Check if this status allows transitioning to `target` under `policy`.
    pub fn can_transition_to(&self, target: TaskStatus, policy: TransitionPolicy) -> bool {
        use TaskStatus::*;

        match (self, target) {
            (Pending, InProgress) | (InProgress, Completed) | (InProgress, Failed) => true,
            (Pending, Failed) => policy.allow_fail_pending,
            _ => false,
        }
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Check if the task still has work ahead of it.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// The persisted string form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::InProgress => "IN_PROGRESS",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PENDING" => Ok(Self::Pending),
            "IN_PROGRESS" => Ok(Self::InProgress),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// Which optional transitions are permitted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransitionPolicy {
    /// Allow PENDING -> FAILED without passing through IN_PROGRESS
    /// (cancelling a task nobody has claimed).
    pub allow_fail_pending: bool,
}

impl TransitionPolicy {
    /// Only PENDING -> IN_PROGRESS -> {COMPLETED | FAILED}.
    pub fn strict() -> Self {
        Self::default()
    }

    /// Strict, plus PENDING -> FAILED.
    pub fn permissive() -> Self {
        Self {
            allow_fail_pending: true,
        }
    }
}

/// A lifecycle transition request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    Start { worker: String },
    Complete { result: String },
    Fail { error: String },
}

impl Transition {
    pub fn start(worker: impl Into<String>) -> Self {
        Self::Start {
            worker: worker.into(),
        }
    }

    pub fn complete(result: impl Into<String>) -> Self {
        Self::Complete {
            result: result.into(),
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self::Fail {
            error: error.into(),
        }
    }

    /// Status the task ends up in.
    pub fn target(&self) -> TaskStatus {
        match self {
            Self::Start { .. } => TaskStatus::InProgress,
            Self::Complete { .. } => TaskStatus::Completed,
            Self::Fail { .. } => TaskStatus::Failed,
        }
    }
}

/// A unit of work tracked through its lifecycle.
///
/// Fields are only mutated through [`TaskRecord::apply`], which keeps the
/// timestamp, worker and result/error columns consistent with `status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskRecord {
    pub(crate) id: Option<TaskId>,
    pub(crate) task_type: String,
    pub(crate) payload: Option<String>,
    pub(crate) status: TaskStatus,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) started_at: Option<DateTime<Utc>>,
    pub(crate) completed_at: Option<DateTime<Utc>>,
    pub(crate) assigned_worker: Option<String>,
    pub(crate) result: Option<String>,
    pub(crate) error_message: Option<String>,
}

impl TaskRecord {
    /// Create a pending task without a payload. Fails if `task_type` is blank.
    pub fn new(task_type: impl Into<String>) -> Result<Self, TaskError> {
        Self::new_at(task_type, Utc::now())
    }

    /// Create a pending task with an explicit creation time.
    pub fn new_at(
        task_type: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Result<Self, TaskError> {
        let task_type = task_type.into();
        validate_task_type(&task_type)?;
        Ok(Self {
            id: None,
            task_type,
            payload: None,
            status: TaskStatus::Pending,
            created_at,
            started_at: None,
            completed_at: None,
            assigned_worker: None,
            result: None,
            error_message: None,
        })
    }

    /// Attach an opaque payload.
    pub fn with_payload(mut self, payload: impl Into<String>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn id(&self) -> Option<TaskId> {
        self.id
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }

    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn assigned_worker(&self) -> Option<&str> {
        self.assigned_worker.as_deref()
    }

    pub fn result(&self) -> Option<&str> {
        self.result.as_deref()
    }

    pub fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    /// Claim the task for `worker`.
    pub fn mark_started(&mut self, worker: impl Into<String>) -> Result<(), TaskError> {
        self.apply(Transition::start(worker), TransitionPolicy::strict(), Utc::now())
    }

    /// Finish the task successfully.
    pub fn mark_completed(&mut self, result: impl Into<String>) -> Result<(), TaskError> {
        self.apply(Transition::complete(result), TransitionPolicy::strict(), Utc::now())
    }

    /// Finish the task with an error.
    pub fn mark_failed(&mut self, error: impl Into<String>) -> Result<(), TaskError> {
        self.apply(Transition::fail(error), TransitionPolicy::strict(), Utc::now())
    }

    /// Apply `transition` at time `at`.
    ///
    /// Validation happens before any field is touched, so a rejected
    /// transition leaves the record exactly as it was.
    pub fn apply(
        &mut self,
        transition: Transition,
        policy: TransitionPolicy,
        at: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        let target = transition.target();
        if !self.status.can_transition_to(target, policy) {
            return Err(TaskError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: target,
            });
        }

        match transition {
            Transition::Start { worker } => {
                if worker.trim().is_empty() {
                    return Err(TaskError::ConstraintViolation(
                        "assigned worker must not be empty".to_string(),
                    ));
                }
                self.started_at = Some(at);
                self.assigned_worker = Some(worker);
            }
            Transition::Complete { result } => {
                self.completed_at = Some(at);
                self.result = Some(result);
            }
            Transition::Fail { error } => {
                self.completed_at = Some(at);
                self.error_message = Some(error);
            }
        }
        self.status = target;
        Ok(())
    }

    /// Time spent since the task was started, up to completion or now.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.completed_at.unwrap_or_else(Utc::now);
            let duration = end.signed_duration_since(start);
            Duration::from_millis(duration.num_milliseconds().max(0) as u64)
        })
    }
}

pub(crate) fn validate_task_type(task_type: &str) -> Result<(), TaskError> {
    if task_type.trim().is_empty() {
        return Err(TaskError::ConstraintViolation(
            "task_type must not be empty".to_string(),
        ));
    }
    Ok(())
}
