use std::sync::Arc;

use task_ledger::config::StoreConfig;
use task_ledger::retention::{self, RetentionSweeper};
use task_ledger::store::{LibSqlBackend, TaskStore};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = StoreConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        std::process::exit(1);
    });

    eprintln!("Task Ledger v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!(
        "   Retention: {} days (every {}s)",
        config.retention.keep_days,
        config.retention.interval.as_secs()
    );

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn TaskStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            })
            .with_policy(config.transition_policy),
    );

    let counts = store.status_counts().await?;
    tracing::info!(
        pending = counts.pending,
        in_progress = counts.in_progress,
        completed = counts.completed,
        failed = counts.failed,
        "Task store ready"
    );

    let active_workers = store.find_active_workers().await?;
    if !active_workers.is_empty() {
        tracing::info!(workers = ?active_workers, "Workers with tasks in progress");
    }

    // ── Retention ────────────────────────────────────────────────────────
    let sweeper = Arc::new(RetentionSweeper::new(
        Arc::clone(&store),
        config.retention.clone(),
    ));
    let retention_handle = retention::spawn_retention_task(sweeper);

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    retention_handle.abort();

    Ok(())
}
