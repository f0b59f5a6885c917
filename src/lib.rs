//! Asset Chat - streaming conversation core for a portfolio assistant
//!
//! Sends a user's question to an assistant backend, ingests the streamed
//! answer (tokens plus tool calls) into a consistent transcript, and keeps
//! that transcript persisted across reloads. Cancellation and retry are
//! supported; failures are reported as state, never as errors.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use asset_chat::core::{ConversationManager, InMemoryStore, ManagerSettings, PersistenceAdapter};
//! use asset_chat::providers::{Chunk, ScriptedBackend};
//!
//! #[tokio::main]
//! async fn main() {
//!     let backend = Arc::new(ScriptedBackend::new(vec![Chunk::token("Hello"), Chunk::Done]));
//!     let persistence = PersistenceAdapter::new(Arc::new(InMemoryStore::new()), "demo");
//!     let manager =
//!         ConversationManager::new(backend, persistence, ManagerSettings::default()).await;
//!
//!     manager.send_message("Hi").await;
//!     assert_eq!(manager.snapshot().messages[1].content, "Hello");
//! }
//! ```

use std::sync::Arc;

pub mod config;
pub mod conversation;
pub mod core;
pub mod providers;
pub mod routes;

use crate::core::ConversationManager;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConversationManager>,
}
