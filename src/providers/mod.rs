//! Assistant backend integrations
//!
//! A backend call yields a lazy, ordered stream of [`Chunk`]s. The manager
//! only depends on the [`AssistantBackend`] trait; transports live in the
//! submodules.

mod http;
mod scripted;

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use http::{HttpBackend, HttpBackendConfig};
pub use scripted::ScriptedBackend;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("Backend returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid chunk: {0}")]
    InvalidChunk(#[from] serde_json::Error),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Tool invocation announced by a `tool_call` chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub name: String,
    #[serde(default)]
    pub arguments: Map<String, Value>,
}

/// Tool outcome carried by a `tool_result` chunk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub name: String,
    #[serde(default)]
    pub result: Option<Value>,
}

/// One unit of a streamed assistant response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Chunk {
    Token {
        content: String,
    },
    ToolCall {
        tool: ToolInvocation,
    },
    ToolResult {
        tool: ToolOutcome,
        #[serde(default)]
        content: String,
    },
    Error {
        #[serde(default)]
        content: String,
    },
    Done,

    /// Any kind this client does not know about yet
    #[serde(other)]
    Unknown,
}

impl Chunk {
    pub fn token(content: impl Into<String>) -> Self {
        Chunk::Token {
            content: content.into(),
        }
    }

    pub fn tool_call(name: impl Into<String>, arguments: Map<String, Value>) -> Self {
        Chunk::ToolCall {
            tool: ToolInvocation {
                name: name.into(),
                arguments,
            },
        }
    }

    pub fn tool_result(name: impl Into<String>, result: Value) -> Self {
        Chunk::ToolResult {
            tool: ToolOutcome {
                name: name.into(),
                result: Some(result),
            },
            content: String::new(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Chunk::Error {
            content: content.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Chunk::Token { .. } => "token",
            Chunk::ToolCall { .. } => "tool_call",
            Chunk::ToolResult { .. } => "tool_result",
            Chunk::Error { .. } => "error",
            Chunk::Done => "done",
            Chunk::Unknown => "unknown",
        }
    }
}

/// Request for a single assistant turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamRequest {
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Chunk, BackendError>> + Send>>;

/// Source of streamed assistant responses.
///
/// Dropping the returned stream must abort the underlying transport.
#[async_trait]
pub trait AssistantBackend: Send + Sync {
    async fn stream(&self, request: StreamRequest) -> Result<ChunkStream, BackendError>;
}
