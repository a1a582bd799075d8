//! Mailgate Storage - relational message store
//!
//! PostgreSQL repositories for users, inboxes, messages and API tokens,
//! plus an in-memory implementation of the same traits used by tests and
//! single-process deployments.

pub mod db;
pub mod memory;
pub mod models;
pub mod repository;

pub use db::DatabasePool;
pub use memory::MemoryStore;
pub use models::*;
pub use repository::*;
