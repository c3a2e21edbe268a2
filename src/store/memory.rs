//! In-memory `TaskStore` — a `BTreeMap` behind a tokio `RwLock`.
//!
//! Every write holds the write lock for the whole read-validate-mutate step,
//! so transitions are atomic and the first writer wins. Timestamps are kept
//! at microsecond precision, the same as the libSQL backend.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, SubsecRound, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::{DatabaseError, TaskError};
use crate::store::traits::{TaskStore, ensure_insertable, ensure_terminal};
use crate::tasks::{
    Page, PageRequest, StatusCounts, TaskId, TaskRecord, TaskStatus, TaskTypeCount, Transition,
    TransitionPolicy,
};

struct State {
    tasks: BTreeMap<TaskId, TaskRecord>,
    next_id: i64,
}

/// Task store kept entirely in process memory.
pub struct InMemoryTaskStore {
    state: RwLock<State>,
    policy: TransitionPolicy,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State {
                tasks: BTreeMap::new(),
                next_id: 1,
            }),
            policy: TransitionPolicy::strict(),
        }
    }

    /// Use `policy` to validate transitions.
    pub fn with_policy(mut self, policy: TransitionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> TransitionPolicy {
        self.policy
    }

    /// Clone every task matching `filter`, in id order.
    async fn select<F>(&self, filter: F) -> Vec<TaskRecord>
    where
        F: Fn(&TaskRecord) -> bool + Send,
    {
        let state = self.state.read().await;
        state
            .tasks
            .values()
            .filter(|t| filter(t))
            .cloned()
            .collect()
    }

    async fn count<F>(&self, filter: F) -> u64
    where
        F: Fn(&TaskRecord) -> bool + Send,
    {
        let state = self.state.read().await;
        state.tasks.values().filter(|t| filter(t)).count() as u64
    }

    #[cfg(test)]
    pub(crate) async fn set_completed_at(&self, id: TaskId, at: DateTime<Utc>) {
        let mut state = self.state.write().await;
        if let Some(task) = state.tasks.get_mut(&id) {
            task.completed_at = Some(at);
        }
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Sort by `created_at`, breaking ties by id.
fn sort_by_created(tasks: &mut [TaskRecord]) {
    tasks.sort_by_key(|t| (t.created_at, t.id));
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn insert_task(&self, task: &TaskRecord) -> Result<TaskRecord, TaskError> {
        ensure_insertable(task)?;

        let mut state = self.state.write().await;
        let id = TaskId(state.next_id);
        state.next_id += 1;

        let mut stored = task.clone();
        stored.id = Some(id);
        stored.created_at = stored.created_at.trunc_subsecs(6);
        state.tasks.insert(id, stored.clone());

        debug!(task_id = %id, task_type = %stored.task_type, "Task inserted");
        Ok(stored)
    }

    async fn apply_transition(
        &self,
        id: TaskId,
        transition: Transition,
    ) -> Result<TaskRecord, TaskError> {
        let mut state = self.state.write().await;
        let task = state
            .tasks
            .get_mut(&id)
            .ok_or(TaskError::NotFound { id })?;

        let from = task.status;
        task.apply(transition, self.policy, Utc::now().trunc_subsecs(6))?;

        debug!(task_id = %id, from = %from, to = %task.status, "Task transitioned");
        Ok(task.clone())
    }

    async fn delete_terminal_before(
        &self,
        status: TaskStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, TaskError> {
        ensure_terminal(status)?;

        let mut state = self.state.write().await;
        let before = state.tasks.len();
        state.tasks.retain(|_, t| {
            !(t.status == status && t.completed_at.is_some_and(|done| done < cutoff))
        });
        let count = before - state.tasks.len();

        if count > 0 {
            info!(count, status = %status, cutoff = %cutoff, "Deleted old tasks");
        }
        Ok(count)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, DatabaseError> {
        let state = self.state.read().await;
        Ok(state.tasks.get(&id).cloned())
    }

    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, DatabaseError> {
        Ok(self.select(|t| t.status == status).await)
    }

    async fn find_by_status_paged(
        &self,
        status: TaskStatus,
        page: PageRequest,
    ) -> Result<Page<TaskRecord>, DatabaseError> {
        let state = self.state.read().await;
        let matching = state.tasks.values().filter(|t| t.status == status);
        let total = matching.clone().count() as u64;
        let items = matching
            .skip(page.offset() as usize)
            .take(page.size as usize)
            .cloned()
            .collect();
        Ok(Page::new(items, page, total))
    }

    async fn find_by_task_type(&self, task_type: &str) -> Result<Vec<TaskRecord>, DatabaseError> {
        Ok(self.select(|t| t.task_type == task_type).await)
    }

    async fn find_by_assigned_worker(
        &self,
        worker: &str,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        Ok(self
            .select(|t| t.assigned_worker.as_deref() == Some(worker))
            .await)
    }

    async fn find_all_newest_first(&self) -> Result<Vec<TaskRecord>, DatabaseError> {
        let mut tasks = self.select(|_| true).await;
        sort_by_created(&mut tasks);
        tasks.reverse();
        Ok(tasks)
    }

    async fn find_by_status_oldest_first(
        &self,
        status: TaskStatus,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        let mut tasks = self.select(|t| t.status == status).await;
        sort_by_created(&mut tasks);
        Ok(tasks)
    }

    async fn find_created_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        let mut tasks = self.select(|t| t.created_at > after).await;
        sort_by_created(&mut tasks);
        Ok(tasks)
    }

    async fn count_active_tasks_for_worker(&self, worker: &str) -> Result<u64, DatabaseError> {
        Ok(self
            .count(|t| {
                t.status == TaskStatus::InProgress && t.assigned_worker.as_deref() == Some(worker)
            })
            .await)
    }

    async fn find_active_workers(&self) -> Result<Vec<String>, DatabaseError> {
        let state = self.state.read().await;
        let workers: BTreeSet<&String> = state
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::InProgress)
            .filter_map(|t| t.assigned_worker.as_ref())
            .collect();
        Ok(workers.into_iter().cloned().collect())
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<u64, DatabaseError> {
        Ok(self.count(|t| t.status == status).await)
    }

    async fn count_completed_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        Ok(self
            .count(|t| {
                t.status == TaskStatus::Completed
                    && t.completed_at.is_some_and(|done| done >= start && done <= end)
            })
            .await)
    }

    async fn task_type_statistics(&self) -> Result<Vec<TaskTypeCount>, DatabaseError> {
        let state = self.state.read().await;
        let mut by_type: HashMap<&str, u64> = HashMap::new();
        for task in state.tasks.values() {
            *by_type.entry(task.task_type.as_str()).or_default() += 1;
        }

        let mut stats: Vec<TaskTypeCount> = by_type
            .into_iter()
            .map(|(task_type, count)| TaskTypeCount {
                task_type: task_type.to_string(),
                count,
            })
            .collect();
        stats.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.task_type.cmp(&b.task_type)));
        Ok(stats)
    }

    async fn count_tasks(&self) -> Result<u64, DatabaseError> {
        let state = self.state.read().await;
        Ok(state.tasks.len() as u64)
    }

    async fn status_counts(&self) -> Result<StatusCounts, DatabaseError> {
        let state = self.state.read().await;
        let mut counts = StatusCounts::default();
        for task in state.tasks.values() {
            counts.add(task.status, 1);
        }
        Ok(counts)
    }
}
