//! Error types for the task ledger.

use crate::tasks::model::{TaskId, TaskStatus};

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Storage backend errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Task lifecycle and validation errors.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("Task {id} not found")]
    NotFound { id: TaskId },

    #[error("Task {} is {from}, cannot transition to {to}", display_id(.id))]
    InvalidTransition {
        id: Option<TaskId>,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}

fn display_id(id: &Option<TaskId>) -> String {
    match id {
        Some(id) => id.to_string(),
        None => "(unsaved)".to_string(),
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
