//! libSQL backend — async `TaskStore` implementation.
//!
//! Supports local file and in-memory databases. Timestamps are stored as
//! fixed-width RFC 3339 strings (microseconds, `Z`), so SQL string
//! comparison and ordering match chronological order.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, SubsecRound, Timelike, Utc};
use libsql::params::IntoParams;
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::{DatabaseError, TaskError};
use crate::store::migrations;
use crate::store::traits::{TaskStore, ensure_insertable, ensure_terminal};
use crate::tasks::{
    Page, PageRequest, StatusCounts, TaskId, TaskRecord, TaskStatus, TaskTypeCount, Transition,
    TransitionPolicy,
};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    policy: TransitionPolicy,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Task database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            policy: TransitionPolicy::strict(),
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    /// Use `policy` to validate transitions.
    pub fn with_policy(mut self, policy: TransitionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn policy(&self) -> TransitionPolicy {
        self.policy
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Write `next` only if the stored status is still `from`.
    ///
    /// A status change by another writer since `from` was read turns into
    /// `InvalidTransition` carrying the status now stored.
    async fn store_transition(
        &self,
        id: TaskId,
        from: TaskStatus,
        next: TaskRecord,
    ) -> Result<TaskRecord, TaskError> {
        let updated = self
            .conn()
            .execute(
                "UPDATE tasks SET status = ?1, started_at = ?2, completed_at = ?3, assigned_worker = ?4, result = ?5, error_message = ?6 WHERE id = ?7 AND status = ?8",
                params![
                    next.status.as_str(),
                    next.started_at.as_ref().map(fmt_datetime),
                    next.completed_at.as_ref().map(fmt_datetime),
                    next.assigned_worker.clone(),
                    next.result.clone(),
                    next.error_message.clone(),
                    id.as_i64(),
                    from.as_str(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("apply_transition: {e}")))?;

        if updated == 0 {
            // Another writer moved the task after we read it.
            let stored = self.require_task(id).await?;
            warn!(task_id = %id, expected = %from, actual = %stored.status, target = %next.status, "Lost task transition race");
            return Err(TaskError::InvalidTransition {
                id: Some(id),
                from: stored.status,
                to: next.status,
            });
        }

        debug!(task_id = %id, from = %from, to = %next.status, "Task transitioned");
        Ok(next)
    }

    /// Run a `SELECT {TASK_COLUMNS}` query and map every row.
    async fn query_tasks(
        &self,
        op: &str,
        sql: &str,
        params: impl IntoParams + Send,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("{op} row: {e}")))?
        {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    /// Run a single-value `COUNT(*)` query.
    async fn query_count(
        &self,
        op: &str,
        sql: &str,
        params: impl IntoParams + Send,
    ) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("{op} row parse: {e}")))?;
                Ok(count.max(0) as u64)
            }
            Ok(None) => Ok(0),
            Err(e) => Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format for timestamps.
fn fmt_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Format a lower bound so that `column >= bound` (or `column < bound`)
/// matches the full-precision comparison against microsecond values.
///
/// Stored values sit on the microsecond grid, so a bound with leftover
/// nanoseconds rounds up to the next microsecond.
fn fmt_datetime_ceil(dt: &DateTime<Utc>) -> String {
    let floor = dt.trunc_subsecs(6);
    if dt.nanosecond() % 1_000 == 0 {
        fmt_datetime(&floor)
    } else {
        fmt_datetime(&(floor + chrono::Duration::microseconds(1)))
    }
}

/// Current time at the precision the database keeps.
fn now_micros() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!(
        "invalid timestamp: {s}"
    )))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

const TASK_COLUMNS: &str = "id, task_type, payload, status, created_at, started_at, completed_at, assigned_worker, result, error_message";

/// Map a libsql Row to a TaskRecord.
///
/// Column order matches TASK_COLUMNS.
fn row_to_task(row: &libsql::Row) -> Result<TaskRecord, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Query(format!("task row parse: {e}"));

    let id: i64 = row.get(0).map_err(parse_err)?;
    let status_str: String = row.get(3).map_err(parse_err)?;
    let created_str: String = row.get(4).map_err(parse_err)?;

    Ok(TaskRecord {
        id: Some(TaskId(id)),
        task_type: row.get(1).map_err(parse_err)?,
        payload: row.get::<String>(2).ok(),
        status: status_str
            .parse::<TaskStatus>()
            .map_err(DatabaseError::Serialization)?,
        created_at: parse_datetime(&created_str)?,
        started_at: parse_optional_datetime(row.get::<String>(5).ok())?,
        completed_at: parse_optional_datetime(row.get::<String>(6).ok())?,
        assigned_worker: row.get::<String>(7).ok(),
        result: row.get::<String>(8).ok(),
        error_message: row.get::<String>(9).ok(),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlBackend {
    async fn insert_task(&self, task: &TaskRecord) -> Result<TaskRecord, TaskError> {
        ensure_insertable(task)?;

        let mut stored = task.clone();
        stored.created_at = stored.created_at.trunc_subsecs(6);

        let mut rows = self
            .conn()
            .query(
                "INSERT INTO tasks (task_type, payload, status, created_at) VALUES (?1, ?2, ?3, ?4) RETURNING id",
                params![
                    stored.task_type.as_str(),
                    stored.payload.clone(),
                    stored.status.as_str(),
                    fmt_datetime(&stored.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?;

        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_task: {e}")))?
            .ok_or_else(|| DatabaseError::Query("insert_task: no id returned".to_string()))?;
        let id: i64 = row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("insert_task id: {e}")))?;
        stored.id = Some(TaskId(id));

        debug!(task_id = id, task_type = %stored.task_type, "Task inserted into DB");
        Ok(stored)
    }

    async fn apply_transition(
        &self,
        id: TaskId,
        transition: Transition,
    ) -> Result<TaskRecord, TaskError> {
        let current = self.require_task(id).await?;
        let from = current.status;

        let mut next = current;
        next.apply(transition, self.policy, now_micros())?;

        self.store_transition(id, from, next).await
    }

    async fn delete_terminal_before(
        &self,
        status: TaskStatus,
        cutoff: DateTime<Utc>,
    ) -> Result<usize, TaskError> {
        ensure_terminal(status)?;

        let count = self
            .conn()
            .execute(
                "DELETE FROM tasks WHERE status = ?1 AND completed_at IS NOT NULL AND completed_at < ?2",
                params![status.as_str(), fmt_datetime_ceil(&cutoff)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_terminal_before: {e}")))?;

        if count > 0 {
            info!(count, status = %status, cutoff = %cutoff, "Deleted old tasks from DB");
        }
        Ok(count as usize)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskRecord>, DatabaseError> {
        let mut tasks = self
            .query_tasks(
                "get_task",
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.as_i64()],
            )
            .await?;
        Ok(tasks.pop())
    }

    async fn find_by_status(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, DatabaseError> {
        self.query_tasks(
            "find_by_status",
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1"),
            params![status.as_str()],
        )
        .await
    }

    async fn find_by_status_paged(
        &self,
        status: TaskStatus,
        page: PageRequest,
    ) -> Result<Page<TaskRecord>, DatabaseError> {
        let total = self.count_by_status(status).await?;
        let items = self
            .query_tasks(
                "find_by_status_paged",
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3"
                ),
                params![status.as_str(), page.size as i64, page.offset() as i64],
            )
            .await?;
        Ok(Page::new(items, page, total))
    }

    async fn find_by_task_type(&self, task_type: &str) -> Result<Vec<TaskRecord>, DatabaseError> {
        self.query_tasks(
            "find_by_task_type",
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE task_type = ?1 ORDER BY id ASC"),
            params![task_type],
        )
        .await
    }

    async fn find_by_assigned_worker(
        &self,
        worker: &str,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        self.query_tasks(
            "find_by_assigned_worker",
            &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE assigned_worker = ?1 ORDER BY id ASC"),
            params![worker],
        )
        .await
    }

    async fn find_all_newest_first(&self) -> Result<Vec<TaskRecord>, DatabaseError> {
        self.query_tasks(
            "find_all_newest_first",
            &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY created_at DESC, id DESC"),
            (),
        )
        .await
    }

    async fn find_by_status_oldest_first(
        &self,
        status: TaskStatus,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        self.query_tasks(
            "find_by_status_oldest_first",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE status = ?1 ORDER BY created_at ASC, id ASC"
            ),
            params![status.as_str()],
        )
        .await
    }

    async fn find_created_after(
        &self,
        after: DateTime<Utc>,
    ) -> Result<Vec<TaskRecord>, DatabaseError> {
        self.query_tasks(
            "find_created_after",
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE created_at > ?1 ORDER BY created_at ASC, id ASC"
            ),
            // `created_at > after` holds for the truncated bound too.
            params![fmt_datetime(&after)],
        )
        .await
    }

    async fn count_active_tasks_for_worker(&self, worker: &str) -> Result<u64, DatabaseError> {
        self.query_count(
            "count_active_tasks_for_worker",
            "SELECT COUNT(*) FROM tasks WHERE assigned_worker = ?1 AND status = 'IN_PROGRESS'",
            params![worker],
        )
        .await
    }

    async fn find_active_workers(&self) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT DISTINCT assigned_worker FROM tasks WHERE status = 'IN_PROGRESS' AND assigned_worker IS NOT NULL ORDER BY assigned_worker ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("find_active_workers: {e}")))?;

        let mut workers = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("find_active_workers row: {e}")))?
        {
            let worker: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("find_active_workers row parse: {e}")))?;
            workers.push(worker);
        }
        Ok(workers)
    }

    async fn count_by_status(&self, status: TaskStatus) -> Result<u64, DatabaseError> {
        self.query_count(
            "count_by_status",
            "SELECT COUNT(*) FROM tasks WHERE status = ?1",
            params![status.as_str()],
        )
        .await
    }

    async fn count_completed_between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<u64, DatabaseError> {
        self.query_count(
            "count_completed_between",
            "SELECT COUNT(*) FROM tasks WHERE status = 'COMPLETED' AND completed_at >= ?1 AND completed_at <= ?2",
            params![fmt_datetime_ceil(&start), fmt_datetime(&end)],
        )
        .await
    }

    async fn task_type_statistics(&self) -> Result<Vec<TaskTypeCount>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT task_type, COUNT(*) AS n FROM tasks GROUP BY task_type ORDER BY n DESC, task_type ASC",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("task_type_statistics: {e}")))?;

        let mut stats = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("task_type_statistics row: {e}")))?
        {
            let task_type: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("task_type_statistics row parse: {e}")))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("task_type_statistics row parse: {e}")))?;
            stats.push(TaskTypeCount {
                task_type,
                count: count.max(0) as u64,
            });
        }
        Ok(stats)
    }

    async fn count_tasks(&self) -> Result<u64, DatabaseError> {
        self.query_count("count_tasks", "SELECT COUNT(*) FROM tasks", ())
            .await
    }

    async fn status_counts(&self) -> Result<StatusCounts, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT status, COUNT(*) FROM tasks GROUP BY status", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("status_counts: {e}")))?;

        let mut counts = StatusCounts::default();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("status_counts row: {e}")))?
        {
            let status_str: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("status_counts row parse: {e}")))?;
            let count: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("status_counts row parse: {e}")))?;
            let status = status_str
                .parse::<TaskStatus>()
                .map_err(DatabaseError::Serialization)?;
            counts.add(status, count.max(0) as u64);
        }
        Ok(counts)
    }
}
