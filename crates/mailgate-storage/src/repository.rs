//! Repository layer for data access

pub mod inboxes;
pub mod messages;
pub mod tokens;
pub mod users;

use crate::db::DatabasePool;
use crate::memory::MemoryStore;
use std::sync::Arc;

// Re-export concrete repository implementations with simple names
pub use inboxes::DbInboxRepository;
pub use messages::DbMessageStore;
pub use tokens::DbTokenRepository;
pub use users::DbUserRepository;

// Re-export repository traits
pub use inboxes::InboxRepository;
pub use messages::MessageStore;
pub use tokens::TokenRepository;
pub use users::UserRepository;

/// The set of repositories the protocol services run against
#[derive(Clone)]
pub struct Repositories {
    pub messages: Arc<dyn MessageStore>,
    pub inboxes: Arc<dyn InboxRepository>,
    pub users: Arc<dyn UserRepository>,
    pub tokens: Arc<dyn TokenRepository>,
}

impl Repositories {
    /// PostgreSQL-backed repositories sharing one pool
    pub fn postgres(pool: DatabasePool) -> Self {
        Self {
            messages: Arc::new(DbMessageStore::new(pool.clone())),
            inboxes: Arc::new(DbInboxRepository::new(pool.clone())),
            users: Arc::new(DbUserRepository::new(pool.clone())),
            tokens: Arc::new(DbTokenRepository::new(pool)),
        }
    }

    /// All repositories backed by one in-memory store
    pub fn memory(store: Arc<MemoryStore>) -> Self {
        Self {
            messages: store.clone(),
            inboxes: store.clone(),
            users: store.clone(),
            tokens: store,
        }
    }
}
