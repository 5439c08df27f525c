//! chatrelay store: SQLite persistence for the app registry, conversations,
//! and messages, with an explicit unit of work for transcript writes.

pub mod schema;
pub mod sqlite;
pub mod types;
pub mod unit_of_work;

pub use sqlite::SqliteStore;
pub use types::*;
pub use unit_of_work::UnitOfWork;
