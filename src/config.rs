//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::tasks::TransitionPolicy;

/// Longest accepted retention window (100 years).
pub const MAX_RETENTION_DAYS: u32 = 36_500;

/// Retention cleanup settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Terminal tasks completed more than this many days ago are deleted.
    /// 0 disables cleanup.
    pub keep_days: u32,
    /// How often the sweeper runs.
    pub interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            keep_days: 30,
            interval: Duration::from_secs(3600), // 1 hour
        }
    }
}

/// Task store configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Path of the libSQL database file.
    pub db_path: PathBuf,
    /// Which optional lifecycle transitions the store accepts.
    pub transition_policy: TransitionPolicy,
    /// Retention cleanup.
    pub retention: RetentionConfig,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/task-ledger.db"),
            transition_policy: TransitionPolicy::strict(),
            retention: RetentionConfig::default(),
        }
    }
}

impl StoreConfig {
    /// Read configuration from `TASK_LEDGER_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup.
    ///
    /// Unset variables fall back to defaults; set but unparseable ones are
    /// an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let db_path = lookup("TASK_LEDGER_DB_PATH")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let allow_fail_pending = match lookup("TASK_LEDGER_ALLOW_FAIL_PENDING") {
            Some(raw) => parse_bool("TASK_LEDGER_ALLOW_FAIL_PENDING", &raw)?,
            None => defaults.transition_policy.allow_fail_pending,
        };

        let keep_days = match lookup("TASK_LEDGER_RETENTION_DAYS") {
            Some(raw) => {
                let days: u32 = parse_number("TASK_LEDGER_RETENTION_DAYS", &raw)?;
                if days > MAX_RETENTION_DAYS {
                    return Err(ConfigError::InvalidValue {
                        key: "TASK_LEDGER_RETENTION_DAYS".to_string(),
                        message: format!("must be at most {MAX_RETENTION_DAYS}"),
                    });
                }
                days
            }
            None => defaults.retention.keep_days,
        };

        let interval = match lookup("TASK_LEDGER_RETENTION_INTERVAL_SECS") {
            Some(raw) => {
                let secs: u64 = parse_number("TASK_LEDGER_RETENTION_INTERVAL_SECS", &raw)?;
                if secs == 0 {
                    return Err(ConfigError::InvalidValue {
                        key: "TASK_LEDGER_RETENTION_INTERVAL_SECS".to_string(),
                        message: "must be greater than 0".to_string(),
                    });
                }
                Duration::from_secs(secs)
            }
            None => defaults.retention.interval,
        };

        Ok(Self {
            db_path,
            transition_policy: TransitionPolicy { allow_fail_pending },
            retention: RetentionConfig {
                keep_days,
                interval,
            },
        })
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool, ConfigError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a boolean, got {other:?}"),
        }),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{e}"),
    })
}
