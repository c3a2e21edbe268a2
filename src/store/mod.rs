//! Persistence layer — task stores backed by libSQL or process memory.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use memory::InMemoryTaskStore;
pub use traits::TaskStore;
