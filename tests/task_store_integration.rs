//! Integration tests for the task store contract.
//!
//! Every property runs against both the libSQL backend (in-memory database)
//! and the process-memory store, so the two stay interchangeable.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use task_ledger::error::TaskError;
use task_ledger::store::{InMemoryTaskStore, LibSqlBackend, TaskStore};
use task_ledger::tasks::{PageRequest, TaskRecord, TaskStatus, TransitionPolicy};

async fn backends() -> Vec<(&'static str, Arc<dyn TaskStore>)> {
    vec![
        (
            "libsql",
            Arc::new(LibSqlBackend::new_memory().await.unwrap()) as Arc<dyn TaskStore>,
        ),
        ("memory", Arc::new(InMemoryTaskStore::new())),
    ]
}

/// Short real-time gap so consecutive timestamps differ.
async fn tick() {
    tokio::time::sleep(Duration::from_millis(5)).await;
}

#[tokio::test]
async fn created_at_survives_every_transition() {
    for (name, store) in backends().await {
        let created = store.create_task("resize", "{\"w\":100}").await.unwrap();
        let id = created.id().unwrap();

        let started = store.start_task(id, "w1").await.unwrap();
        let completed = store.complete_task(id, "ok").await.unwrap();

        assert_eq!(started.created_at(), created.created_at(), "{name}");
        assert_eq!(completed.created_at(), created.created_at(), "{name}");
        assert_eq!(
            store.require_task(id).await.unwrap().created_at(),
            created.created_at(),
            "{name}"
        );
    }
}

#[tokio::test]
async fn start_sets_worker_and_started_at() {
    for (name, store) in backends().await {
        let pending = store.create_task("resize", "").await.unwrap();
        assert!(pending.started_at().is_none(), "{name}");
        assert!(pending.assigned_worker().is_none(), "{name}");

        let started = store.start_task(pending.id().unwrap(), "w1").await.unwrap();
        assert_eq!(started.status(), TaskStatus::InProgress, "{name}");
        assert_eq!(started.assigned_worker(), Some("w1"), "{name}");
        let started_at = started.started_at().unwrap();
        assert!(started_at >= pending.created_at(), "{name}");
    }
}

#[tokio::test]
async fn terminal_outcomes_are_exclusive() {
    for (name, store) in backends().await {
        let a = store.create_task("a", "").await.unwrap().id().unwrap();
        let b = store.create_task("a", "").await.unwrap().id().unwrap();
        store.start_task(a, "w1").await.unwrap();
        store.start_task(b, "w1").await.unwrap();

        let done = store.complete_task(a, "42").await.unwrap();
        assert_eq!(done.result(), Some("42"), "{name}");
        assert!(done.error_message().is_none(), "{name}");
        assert!(done.completed_at().is_some(), "{name}");

        let failed = store.fail_task(b, "boom").await.unwrap();
        assert_eq!(failed.error_message(), Some("boom"), "{name}");
        assert!(failed.result().is_none(), "{name}");
        assert!(failed.completed_at().is_some(), "{name}");
    }
}

#[tokio::test]
async fn active_task_count_per_worker() {
    for (name, store) in backends().await {
        let t1 = store.create_task("a", "").await.unwrap().id().unwrap();
        let t2 = store.create_task("a", "").await.unwrap().id().unwrap();
        store.create_task("a", "").await.unwrap();

        store.start_task(t1, "w1").await.unwrap();
        store.start_task(t2, "w1").await.unwrap();
        store.complete_task(t1, "ok").await.unwrap();

        assert_eq!(store.count_active_tasks_for_worker("w1").await.unwrap(), 1, "{name}");
        assert_eq!(store.count_active_tasks_for_worker("w2").await.unwrap(), 0, "{name}");
        assert_eq!(store.find_active_workers().await.unwrap(), vec!["w1"], "{name}");
        assert_eq!(store.find_by_assigned_worker("w1").await.unwrap().len(), 2, "{name}");
    }
}

#[tokio::test]
async fn oldest_pending_first() {
    for (name, store) in backends().await {
        let t1 = store.create_task("a", "").await.unwrap().id().unwrap();
        tick().await;
        let t2 = store.create_task("a", "").await.unwrap().id().unwrap();
        tick().await;
        let t3 = store.create_task("a", "").await.unwrap().id().unwrap();

        store.start_task(t2, "w1").await.unwrap();

        let ids: Vec<_> = store
            .find_by_status_oldest_first(TaskStatus::Pending)
            .await
            .unwrap()
            .iter()
            .filter_map(TaskRecord::id)
            .collect();
        assert_eq!(ids, vec![t1, t3], "{name}");

        let newest: Vec<_> = store
            .find_all_newest_first()
            .await
            .unwrap()
            .iter()
            .filter_map(TaskRecord::id)
            .collect();
        assert_eq!(newest, vec![t3, t2, t1], "{name}");
    }
}

#[tokio::test]
async fn created_after_is_strict() {
    for (name, store) in backends().await {
        let first = store.create_task("a", "").await.unwrap();
        tick().await;
        let second = store.create_task("a", "").await.unwrap();

        let after: Vec<_> = store
            .find_created_after(first.created_at())
            .await
            .unwrap()
            .iter()
            .filter_map(TaskRecord::id)
            .collect();
        assert_eq!(after, vec![second.id().unwrap()], "{name}");
    }
}

#[tokio::test]
async fn delete_removes_only_old_rows_of_that_status() {
    for (name, store) in backends().await {
        let old_done = store.create_task("a", "").await.unwrap().id().unwrap();
        let old_failed = store.create_task("a", "").await.unwrap().id().unwrap();
        store.start_task(old_done, "w").await.unwrap();
        store.start_task(old_failed, "w").await.unwrap();
        store.complete_task(old_done, "ok").await.unwrap();
        store.fail_task(old_failed, "err").await.unwrap();

        tick().await;
        let cutoff = Utc::now();
        tick().await;

        let new_done = store.create_task("a", "").await.unwrap().id().unwrap();
        store.start_task(new_done, "w").await.unwrap();
        store.complete_task(new_done, "ok").await.unwrap();
        let pending = store.create_task("a", "").await.unwrap().id().unwrap();

        let removed = store
            .delete_terminal_before(TaskStatus::Completed, cutoff)
            .await
            .unwrap();
        assert_eq!(removed, 1, "{name}");
        assert!(store.get_task(old_done).await.unwrap().is_none(), "{name}");
        assert!(store.get_task(old_failed).await.unwrap().is_some(), "{name}");
        assert!(store.get_task(new_done).await.unwrap().is_some(), "{name}");
        assert!(store.get_task(pending).await.unwrap().is_some(), "{name}");

        let rejected = store
            .delete_terminal_before(TaskStatus::Pending, Utc::now())
            .await;
        assert!(matches!(rejected, Err(TaskError::ConstraintViolation(_))), "{name}");
        assert_eq!(store.count_tasks().await.unwrap(), 3, "{name}");
    }
}

#[tokio::test]
async fn bounds_between_microseconds_agree_across_backends() {
    for (name, store) in backends().await {
        let id = store.create_task("a", "").await.unwrap().id().unwrap();
        store.start_task(id, "w").await.unwrap();
        let done = store.complete_task(id, "ok").await.unwrap();
        let completed_at = done.completed_at().unwrap();

        let just_after = completed_at + chrono::Duration::nanoseconds(500);
        let far_future = completed_at + chrono::Duration::days(1);
        assert_eq!(
            store.count_completed_between(just_after, far_future).await.unwrap(),
            0,
            "{name}"
        );
        assert_eq!(
            store.count_completed_between(completed_at, just_after).await.unwrap(),
            1,
            "{name}"
        );
        assert_eq!(
            store
                .delete_terminal_before(TaskStatus::Completed, just_after)
                .await
                .unwrap(),
            1,
            "{name}"
        );
    }
}

#[tokio::test]
async fn task_without_payload_round_trips() {
    for (name, store) in backends().await {
        let stored = store
            .insert_task(&TaskRecord::new("ping").unwrap())
            .await
            .unwrap();
        let fetched = store.require_task(stored.id().unwrap()).await.unwrap();
        assert_eq!(fetched.payload(), None, "{name}");
        assert_eq!(fetched, stored, "{name}");

        let with_payload = store
            .insert_task(&TaskRecord::new("ping").unwrap().with_payload("{}"))
            .await
            .unwrap();
        let fetched = store.require_task(with_payload.id().unwrap()).await.unwrap();
        assert_eq!(fetched.payload(), Some("{}"), "{name}");
    }
}

#[tokio::test]
async fn statistics_sum_to_total_and_sort_descending() {
    for (name, store) in backends().await {
        for task_type in ["email", "resize", "resize", "report", "resize", "email"] {
            store.create_task(task_type, "").await.unwrap();
        }

        let stats = store.task_type_statistics().await.unwrap();
        let total: u64 = stats.iter().map(|s| s.count).sum();
        assert_eq!(total, store.count_tasks().await.unwrap(), "{name}");
        assert!(stats.windows(2).all(|w| w[0].count >= w[1].count), "{name}");
        assert_eq!(stats[0].task_type, "resize", "{name}");
        assert_eq!(stats[0].count, 3, "{name}");
    }
}

#[tokio::test]
async fn counts_and_completion_window() {
    for (name, store) in backends().await {
        let a = store.create_task("a", "").await.unwrap().id().unwrap();
        let b = store.create_task("a", "").await.unwrap().id().unwrap();
        store.create_task("a", "").await.unwrap();

        let window_start = Utc::now();
        store.start_task(a, "w").await.unwrap();
        store.complete_task(a, "ok").await.unwrap();
        store.start_task(b, "w").await.unwrap();
        store.fail_task(b, "err").await.unwrap();
        let window_end = Utc::now();

        assert_eq!(
            store.count_completed_between(window_start, window_end).await.unwrap(),
            1,
            "{name}"
        );
        assert_eq!(
            store
                .count_completed_between(window_end + chrono::Duration::seconds(1), Utc::now() + chrono::Duration::days(1))
                .await
                .unwrap(),
            0,
            "{name}"
        );

        let counts = store.status_counts().await.unwrap();
        assert_eq!(counts.pending, 1, "{name}");
        assert_eq!(counts.completed, 1, "{name}");
        assert_eq!(counts.failed, 1, "{name}");
        assert_eq!(counts.total(), 3, "{name}");
        assert_eq!(store.count_by_status(TaskStatus::InProgress).await.unwrap(), 0, "{name}");
    }
}

#[tokio::test]
async fn paging_by_status() {
    for (name, store) in backends().await {
        for _ in 0..5 {
            store.create_task("a", "").await.unwrap();
        }

        let first = store
            .find_by_status_paged(TaskStatus::Pending, PageRequest::new(0, 2))
            .await
            .unwrap();
        assert_eq!(first.items.len(), 2, "{name}");
        assert_eq!(first.total_items, 5, "{name}");
        assert_eq!(first.total_pages(), 3, "{name}");
        assert!(first.has_next(), "{name}");

        let last = store
            .find_by_status_paged(TaskStatus::Pending, PageRequest::new(2, 2))
            .await
            .unwrap();
        assert_eq!(last.items.len(), 1, "{name}");
        assert!(!last.has_next(), "{name}");

        let empty = store
            .find_by_status_paged(TaskStatus::Failed, PageRequest::default())
            .await
            .unwrap();
        assert!(empty.items.is_empty(), "{name}");
        assert_eq!(empty.total_items, 0, "{name}");
    }
}

#[tokio::test]
async fn invalid_transitions_leave_state_unchanged() {
    for (name, store) in backends().await {
        let id = store.create_task("a", "").await.unwrap().id().unwrap();
        let pending = store.require_task(id).await.unwrap();

        let err = store.complete_task(id, "too early").await.unwrap_err();
        assert!(
            matches!(
                err,
                TaskError::InvalidTransition {
                    from: TaskStatus::Pending,
                    to: TaskStatus::Completed,
                    ..
                }
            ),
            "{name}: {err}"
        );
        assert_eq!(store.require_task(id).await.unwrap(), pending, "{name}");

        store.start_task(id, "w1").await.unwrap();
        store.complete_task(id, "ok").await.unwrap();
        let done = store.require_task(id).await.unwrap();

        assert!(store.fail_task(id, "late").await.is_err(), "{name}");
        assert!(store.start_task(id, "w2").await.is_err(), "{name}");
        assert_eq!(store.require_task(id).await.unwrap(), done, "{name}");
    }
}

#[tokio::test]
async fn missing_and_blank_inputs() {
    for (name, store) in backends().await {
        assert!(matches!(
            store.create_task("  ", "").await,
            Err(TaskError::ConstraintViolation(_))
        ), "{name}");
        assert_eq!(store.count_tasks().await.unwrap(), 0, "{name}");

        let unknown = task_ledger::tasks::TaskId(999);
        assert!(store.get_task(unknown).await.unwrap().is_none(), "{name}");
        assert!(matches!(
            store.start_task(unknown, "w1").await,
            Err(TaskError::NotFound { .. })
        ), "{name}");

        assert!(store.find_by_task_type("nothing").await.unwrap().is_empty(), "{name}");
        assert!(store.find_active_workers().await.unwrap().is_empty(), "{name}");
        assert!(store.task_type_statistics().await.unwrap().is_empty(), "{name}");
    }
}

#[tokio::test]
async fn concurrent_starts_have_one_winner() {
    for (name, store) in backends().await {
        let id = store.create_task("a", "").await.unwrap().id().unwrap();

        let attempts = (0..8).map(|i| {
            let store = Arc::clone(&store);
            async move { store.start_task(id, &format!("w{i}")).await }
        });
        let results = futures::future::join_all(attempts).await;

        let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(winners.len(), 1, "{name}");
        assert!(
            results.iter().filter_map(|r| r.as_ref().err()).all(|e| matches!(
                e,
                TaskError::InvalidTransition {
                    from: TaskStatus::InProgress,
                    to: TaskStatus::InProgress,
                    ..
                }
            )),
            "{name}"
        );

        let stored = store.require_task(id).await.unwrap();
        assert_eq!(stored.assigned_worker(), winners[0].assigned_worker(), "{name}");
    }
}

#[tokio::test]
async fn permissive_policy_allows_cancelling_pending() {
    let stores: Vec<Arc<dyn TaskStore>> = vec![
        Arc::new(
            LibSqlBackend::new_memory()
                .await
                .unwrap()
                .with_policy(TransitionPolicy::permissive()),
        ),
        Arc::new(InMemoryTaskStore::new().with_policy(TransitionPolicy::permissive())),
    ];
    for store in stores {
        let id = store.create_task("a", "").await.unwrap().id().unwrap();
        let failed = store.fail_task(id, "cancelled").await.unwrap();
        assert_eq!(failed.status(), TaskStatus::Failed);
        assert!(failed.assigned_worker().is_none());
        assert!(failed.completed_at().is_some());
    }
}

#[tokio::test]
async fn file_backed_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("tasks.db");

    let (first, started) = {
        let store = LibSqlBackend::new_local(&path).await.unwrap();
        let first = store.create_task("a", "payload").await.unwrap();
        store.create_task("b", "").await.unwrap();
        let started = store.start_task(first.id().unwrap(), "w1").await.unwrap();
        (first, started)
    };

    let store = LibSqlBackend::new_local(&path).await.unwrap();
    let reloaded = store.require_task(first.id().unwrap()).await.unwrap();
    assert_eq!(reloaded, started);
    assert_eq!(reloaded.payload(), Some("payload"));
    assert_eq!(store.count_tasks().await.unwrap(), 2);

    let third = store.create_task("c", "").await.unwrap();
    assert!(third.id().unwrap().as_i64() > first.id().unwrap().as_i64());
}
