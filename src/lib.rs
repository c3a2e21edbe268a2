//! Task Ledger — lifecycle-tracked task records with pluggable storage.

pub mod config;
pub mod error;
pub mod retention;
pub mod store;
pub mod tasks;
