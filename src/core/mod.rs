//! Core conversation components
//!
//! The conversation manager and the persistence it flushes to.

mod manager;
mod memory;
mod persistence;

pub use manager::{
    ConversationError, ConversationManager, ConversationSession, ConversationSnapshot,
    ManagerSettings, DEFAULT_APOLOGY,
};
pub use memory::{FileStore, InMemoryStore, SnapshotStore, SqliteStore, StoreError};
pub use persistence::{PersistenceAdapter, PersistenceError, RestoredConversation};
