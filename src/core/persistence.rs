//! Transcript persistence
//!
//! Serializes the transcript and conversation id into a single JSON blob:
//!
//! ```json
//! { "messages": [...], "conversationId": "...", "lastUpdated": "2026-01-01T00:00:00Z" }
//! ```
//!
//! Loading never fails. Missing or malformed data is treated as "nothing
//! saved", and every restored message comes back settled (not streaming).
//!
//! Writes carry a revision taken from the manager's state. They are applied
//! one at a time, and a write older than the last applied one is skipped, so
//! a slow save can never resurrect a slot that a later clear removed.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::conversation::{Message, Transcript};

use super::memory::{SnapshotStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersistedConversation {
    messages: Vec<Message>,
    #[serde(default)]
    conversation_id: Option<String>,
    #[serde(default)]
    last_updated: Option<DateTime<Utc>>,
}

/// A conversation restored from the durable slot
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredConversation {
    pub transcript: Transcript,
    pub conversation_id: Option<String>,
}

/// Reads and writes one conversation slot
#[derive(Clone)]
pub struct PersistenceAdapter {
    store: Arc<dyn SnapshotStore>,
    key: String,
    /// Revision of the last applied write, held across the store call
    applied: Arc<Mutex<u64>>,
}

impl PersistenceAdapter {
    pub fn new(store: Arc<dyn SnapshotStore>, key: impl Into<String>) -> Self {
        Self {
            store,
            key: key.into(),
            applied: Arc::new(Mutex::new(0)),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Write the slot. Returns `false` if a newer revision was already applied.
    pub async fn save(
        &self,
        revision: u64,
        messages: &[Message],
        conversation_id: Option<&str>,
    ) -> Result<bool, PersistenceError> {
        let blob = serde_json::to_string(&PersistedConversationRef {
            messages,
            conversation_id,
            last_updated: Utc::now(),
        })?;

        let mut applied = self.applied.lock().await;
        if revision <= *applied {
            tracing::debug!(key = %self.key, revision, applied = *applied, "Skipping stale save");
            return Ok(false);
        }

        self.store.set(&self.key, &blob).await?;
        *applied = revision;
        tracing::debug!(key = %self.key, revision, messages = messages.len(), "Saved conversation");
        Ok(true)
    }

    pub async fn load(&self) -> Option<RestoredConversation> {
        let blob = match self.store.get(&self.key).await {
            Ok(Some(blob)) => blob,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Could not read saved conversation");
                return None;
            }
        };

        match serde_json::from_str::<PersistedConversation>(&blob) {
            Ok(persisted) => {
                tracing::debug!(
                    key = %self.key,
                    messages = persisted.messages.len(),
                    last_updated = ?persisted.last_updated,
                    "Loaded conversation"
                );
                Some(RestoredConversation {
                    transcript: Transcript::restore(persisted.messages),
                    conversation_id: persisted.conversation_id,
                })
            }
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "Discarding malformed saved conversation");
                None
            }
        }
    }

    /// Remove the slot. Returns `false` if a newer revision was already applied.
    pub async fn clear(&self, revision: u64) -> Result<bool, PersistenceError> {
        let mut applied = self.applied.lock().await;
        if revision <= *applied {
            tracing::debug!(key = %self.key, revision, applied = *applied, "Skipping stale clear");
            return Ok(false);
        }

        self.store.remove(&self.key).await?;
        *applied = revision;
        Ok(true)
    }
}

/// Borrowing twin of [`PersistedConversation`] used when saving
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PersistedConversationRef<'a> {
    messages: &'a [Message],
    conversation_id: Option<&'a str>,
    last_updated: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{MessagePatch, ToolCall};
    use crate::core::memory::InMemoryStore;
    use serde_json::{json, Map};

    fn adapter() -> (PersistenceAdapter, Arc<InMemoryStore>) {
        let store = Arc::new(InMemoryStore::new());
        (PersistenceAdapter::new(store.clone(), "conversation"), store)
    }

    #[tokio::test]
    async fn test_round_trip_settles_streaming() {
        let (adapter, _) = adapter();

        let mut transcript = Transcript::new();
        transcript.append(Message::user("Show my ETH balance"));
        let assistant = Message::assistant_placeholder();
        let id = assistant.id.clone();
        transcript.append(assistant);
        transcript.update_by_id(
            &id,
            MessagePatch::default()
                .content("Fetching")
                .tool_calls(vec![ToolCall::new("get_balance", Map::new())]),
        );

        adapter
            .save(1, transcript.messages(), Some("conv-42"))
            .await
            .unwrap();
        let restored = adapter.load().await.unwrap();

        assert_eq!(restored.conversation_id.as_deref(), Some("conv-42"));
        assert_eq!(restored.transcript.len(), 2);
        assert!(restored.transcript.messages().iter().all(|m| !m.streaming));

        let original = transcript.get(&id).unwrap();
        let loaded = restored.transcript.get(&id).unwrap();
        assert_eq!(loaded.content, original.content);
        assert_eq!(loaded.created_at, original.created_at);
        assert_eq!(loaded.tool_calls, original.tool_calls);
    }

    #[tokio::test]
    async fn test_blob_shape() {
        let (adapter, store) = adapter();
        adapter.save(1, &[Message::user("Hi")], None).await.unwrap();

        let blob = store.get("conversation").await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&blob).unwrap();

        assert!(value["messages"][0]["createdAt"].is_string());
        assert!(value["conversationId"].is_null());
        assert!(value["lastUpdated"].is_string());
    }

    #[tokio::test]
    async fn test_missing_slot_loads_nothing() {
        let (adapter, _) = adapter();
        assert!(adapter.load().await.is_none());
    }

    #[tokio::test]
    async fn test_malformed_slot_loads_nothing() {
        let (adapter, store) = adapter();

        store.set("conversation", "not json at all").await.unwrap();
        assert!(adapter.load().await.is_none());

        store
            .set("conversation", &json!({"messages": [{"id": 1}]}).to_string())
            .await
            .unwrap();
        assert!(adapter.load().await.is_none());
    }

    #[tokio::test]
    async fn test_clear_drops_slot() {
        let (adapter, _) = adapter();
        adapter.save(1, &[Message::user("Hi")], Some("c")).await.unwrap();

        assert!(adapter.clear(2).await.unwrap());
        assert!(adapter.load().await.is_none());
    }

    #[tokio::test]
    async fn test_stale_writes_are_skipped() {
        let (adapter, store) = adapter();
        adapter.save(1, &[Message::user("old")], None).await.unwrap();
        assert!(adapter.clear(3).await.unwrap());

        assert!(!adapter.save(2, &[Message::user("old")], None).await.unwrap());
        assert!(store.get("conversation").await.unwrap().is_none());

        assert!(adapter.save(4, &[Message::user("new")], Some("c")).await.unwrap());
        assert!(!adapter.clear(3).await.unwrap());

        let restored = adapter.load().await.unwrap();
        assert_eq!(restored.transcript.messages()[0].content, "new");
    }

    #[tokio::test]
    async fn test_clones_share_write_order() {
        let (adapter, store) = adapter();
        let other = adapter.clone();

        other.save(5, &[Message::user("Hi")], None).await.unwrap();
        assert!(!adapter.clear(4).await.unwrap());
        assert!(store.get("conversation").await.unwrap().is_some());
    }
}
