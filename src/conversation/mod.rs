//! Conversation types and transcript state

pub mod ids;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub use ids::new_id;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A side query issued by the assistant while answering
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,

    #[serde(default)]
    pub arguments: Map<String, Value>,

    /// `None` until the matching `tool_result` chunk arrives
    #[serde(default)]
    pub result: Option<Value>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.into(),
            arguments,
            result: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.result.is_some()
    }
}

/// Resolve the oldest unresolved call named `name`.
///
/// Returns false when no pending call with that name exists.
pub fn resolve_tool_call(calls: &mut [ToolCall], name: &str, result: Value) -> bool {
    match calls
        .iter_mut()
        .find(|call| call.name == name && !call.is_resolved())
    {
        Some(call) => {
            call.result = Some(result);
            true
        }
        None => false,
    }
}

/// One turn in the transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub created_at: DateTime<Utc>,

    #[serde(default)]
    pub streaming: bool,

    /// Only assistant messages carry tool calls
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl Message {
    pub fn user(content: impl Into<String>) -> Self {
        Self::settled(Role::User, content)
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::settled(Role::System, content)
    }

    /// An empty assistant message that is still receiving chunks
    pub fn assistant_placeholder() -> Self {
        Self {
            id: new_id(),
            role: Role::Assistant,
            content: String::new(),
            created_at: Utc::now(),
            streaming: true,
            tool_calls: Some(Vec::new()),
        }
    }

    fn settled(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            role,
            content: content.into(),
            created_at: Utc::now(),
            streaming: false,
            tool_calls: None,
        }
    }
}

/// Partial update applied through [`Transcript::update_by_id`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessagePatch {
    pub content: Option<String>,
    pub streaming: Option<bool>,
    pub tool_calls: Option<Vec<ToolCall>>,
}

impl MessagePatch {
    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = Some(calls);
        self
    }

    pub fn settle(mut self) -> Self {
        self.streaming = Some(false);
        self
    }
}

/// Ordered message sequence; insertion order is conversation order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Transcript {
    messages: Vec<Message>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a transcript from restored messages, settling any that were
    /// left streaming.
    pub fn restore(mut messages: Vec<Message>) -> Self {
        for message in &mut messages {
            message.streaming = false;
        }
        Self { messages }
    }

    pub fn append(&mut self, message: Message) {
        debug_assert!(
            !(message.streaming && self.streaming_message().is_some()),
            "only one message may stream at a time"
        );
        self.messages.push(message);
    }

    /// Apply `patch` to the message with `id`.
    ///
    /// Unknown ids and messages that already finished streaming are left
    /// untouched. Returns whether anything was applied.
    pub fn update_by_id(&mut self, id: &str, patch: MessagePatch) -> bool {
        let Some(message) = self.messages.iter_mut().find(|m| m.id == id) else {
            return false;
        };
        if !message.streaming {
            return false;
        }

        if let Some(content) = patch.content {
            message.content = content;
        }
        if let Some(calls) = patch.tool_calls {
            message.tool_calls = Some(calls);
        }
        if let Some(streaming) = patch.streaming {
            message.streaming = streaming;
        }
        true
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn streaming_message(&self) -> Option<&Message> {
        self.messages.iter().find(|m| m.streaming)
    }

    pub fn last_user_content(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
    }

    /// Drop the trailing user/assistant pair, or only the last message when
    /// the tail has any other shape. Returns the number removed.
    pub(crate) fn remove_last_turn(&mut self) -> usize {
        let len = self.messages.len();
        let ends_with_turn = len >= 2
            && self.messages[len - 2].role == Role::User
            && self.messages[len - 1].role == Role::Assistant;

        let remove = if ends_with_turn { 2 } else { len.min(1) };
        self.messages.truncate(len - remove);
        remove
    }

    pub(crate) fn clear(&mut self) {
        self.messages.clear();
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
