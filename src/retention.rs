//! Retention cleanup — periodically deletes old terminal tasks.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::config::RetentionConfig;
use crate::error::TaskError;
use crate::store::TaskStore;
use crate::tasks::TaskStatus;

/// Rows removed by one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetentionReport {
    pub completed: usize,
    pub failed: usize,
}

impl RetentionReport {
    pub fn total(&self) -> usize {
        self.completed + self.failed
    }
}

/// Deletes COMPLETED and FAILED tasks older than the retention window.
pub struct RetentionSweeper {
    store: Arc<dyn TaskStore>,
    config: RetentionConfig,
}

impl RetentionSweeper {
    pub fn new(store: Arc<dyn TaskStore>, config: RetentionConfig) -> Self {
        Self { store, config }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.keep_days > 0
    }

    /// Delete terminal tasks completed before `now - keep_days`.
    pub async fn sweep_once(&self, now: DateTime<Utc>) -> Result<RetentionReport, TaskError> {
        if !self.is_enabled() {
            return Ok(RetentionReport::default());
        }

        let cutoff = chrono::Duration::try_days(i64::from(self.config.keep_days))
            .and_then(|window| now.checked_sub_signed(window))
            .ok_or_else(|| {
                TaskError::ConstraintViolation(format!(
                    "retention window of {} days is out of range",
                    self.config.keep_days
                ))
            })?;
        let report = RetentionReport {
            completed: self
                .store
                .delete_terminal_before(TaskStatus::Completed, cutoff)
                .await?,
            failed: self
                .store
                .delete_terminal_before(TaskStatus::Failed, cutoff)
                .await?,
        };

        if report.total() > 0 {
            info!(
                completed = report.completed,
                failed = report.failed,
                keep_days = self.config.keep_days,
                "Retention sweep removed tasks"
            );
        }
        Ok(report)
    }
}

/// Spawn a background task that sweeps on every `config.interval` tick.
pub fn spawn_retention_task(sweeper: Arc<RetentionSweeper>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if !sweeper.is_enabled() {
            info!("Retention cleanup disabled");
            return;
        }
        let mut interval = tokio::time::interval(sweeper.config.interval);
        loop {
            interval.tick().await;
            if let Err(e) = sweeper.sweep_once(Utc::now()).await {
                warn!("Retention sweep failed: {e}");
            }
        }
    })
}
