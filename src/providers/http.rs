//! Streaming HTTP backend
//!
//! Posts the user's message and reads newline-delimited JSON chunks from the
//! response body. Lines may carry an SSE `data:` prefix; blank lines and SSE
//! comments are skipped.
//!
//! ```text
//! POST {base_url}/chat/stream
//! {"message": "How is my portfolio doing?", "conversationId": "..."}
//!
//! {"type":"token","content":"Your "}
//! {"type":"token","content":"portfolio..."}
//! {"type":"done"}
//! ```

use std::time::Duration;

use async_stream::try_stream;
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use reqwest::Client;

use super::{AssistantBackend, BackendError, Chunk, ChunkStream, StreamRequest};

/// HTTP backend configuration
#[derive(Debug, Clone)]
pub struct HttpBackendConfig {
    /// Base URL of the assistant service (e.g., http://localhost:8080/api)
    pub base_url: String,
    /// Bearer token, if the service requires one
    pub api_key: Option<String>,
    /// Connection timeout in seconds. The stream itself has no deadline.
    pub connect_timeout_secs: u64,
}

impl Default for HttpBackendConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080/api".to_string(),
            api_key: None,
            connect_timeout_secs: 10,
        }
    }
}

pub struct HttpBackend {
    config: HttpBackendConfig,
    client: Client,
}

impl HttpBackend {
    pub fn new(config: HttpBackendConfig) -> Result<Self, BackendError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()?;

        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/stream", self.config.base_url.trim_end_matches('/'))
    }
}

#[async_trait]
impl AssistantBackend for HttpBackend {
    async fn stream(&self, request: StreamRequest) -> Result<ChunkStream, BackendError> {
        let mut req_builder = self.client.post(self.endpoint());

        if let Some(ref api_key) = self.config.api_key {
            req_builder = req_builder.header("Authorization", format!("Bearer {}", api_key));
        }

        let response = req_builder
            .header("Accept", "application/x-ndjson")
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(Box::pin(decode_body(response.bytes_stream())))
    }
}

/// Split a response body into lines and decode each into a chunk.
fn decode_body<S, B>(body: S) -> impl Stream<Item = Result<Chunk, BackendError>> + Send
where
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send,
{
    try_stream! {
        let mut body = Box::pin(body);
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(bytes) = body.next().await {
            buffer.extend_from_slice(bytes?.as_ref());

            while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                if let Some(chunk) = parse_line(&String::from_utf8_lossy(&line))? {
                    yield chunk;
                }
            }
        }

        if let Some(chunk) = parse_line(&String::from_utf8_lossy(&buffer))? {
            yield chunk;
        }
    }
}

/// Decode one body line. Returns `None` for lines that carry no chunk.
fn parse_line(line: &str) -> Result<Option<Chunk>, BackendError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }

    let payload = line.strip_prefix("data:").map(str::trim).unwrap_or(line);
    if payload.is_empty() || payload == "[DONE]" {
        return Ok(None);
    }

    Ok(Some(serde_json::from_str(payload)?))
}
