//! Scripted backend that replays canned chunk sequences
//!
//! Useful for offline demos and tests. Each call to `stream` consumes the
//! next scripted turn; the last turn repeats once the script runs out.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{AssistantBackend, BackendError, Chunk, ChunkStream, StreamRequest};

#[derive(Debug, Clone)]
enum Step {
    Chunk(Chunk),
    Fail(String),
}

#[derive(Debug, Clone)]
enum Turn {
    Replay(Vec<Step>),
    Reject(String),
}

#[derive(Debug, Default)]
pub struct ScriptedBackend {
    turns: Mutex<VecDeque<Turn>>,
    requests: Mutex<Vec<StreamRequest>>,
}

impl ScriptedBackend {
    /// Replay `chunks` on every call
    pub fn new(chunks: Vec<Chunk>) -> Self {
        Self::default().then(chunks)
    }

    /// Queue another turn of chunks
    pub fn then(self, chunks: Vec<Chunk>) -> Self {
        self.push(Turn::Replay(chunks.into_iter().map(Step::Chunk).collect()))
    }

    /// Queue a turn that yields `chunks` and then a transport failure
    pub fn then_broken(self, chunks: Vec<Chunk>, message: impl Into<String>) -> Self {
        let mut steps: Vec<Step> = chunks.into_iter().map(Step::Chunk).collect();
        steps.push(Step::Fail(message.into()));
        self.push(Turn::Replay(steps))
    }

    /// Queue a turn whose call fails before any chunk is produced
    pub fn then_unavailable(self, message: impl Into<String>) -> Self {
        self.push(Turn::Reject(message.into()))
    }

    /// Every request received so far, in call order
    pub fn requests(&self) -> Vec<StreamRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }

    fn push(self, turn: Turn) -> Self {
        if let Ok(mut turns) = self.turns.lock() {
            turns.push_back(turn);
        }
        self
    }

    fn next_turn(&self) -> Turn {
        let Ok(mut turns) = self.turns.lock() else {
            return Turn::Reject("script lock poisoned".to_string());
        };
        if turns.len() > 1 {
            turns.pop_front().unwrap_or(Turn::Replay(Vec::new()))
        } else {
            turns.front().cloned().unwrap_or(Turn::Replay(Vec::new()))
        }
    }
}

#[async_trait]
impl AssistantBackend for ScriptedBackend {
    async fn stream(&self, request: StreamRequest) -> Result<ChunkStream, BackendError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request);
        }

        match self.next_turn() {
            Turn::Reject(message) => Err(BackendError::Unavailable(message)),
            Turn::Replay(steps) => {
                let items = steps.into_iter().map(|step| match step {
                    Step::Chunk(chunk) => Ok(chunk),
                    Step::Fail(message) => Err(BackendError::Unavailable(message)),
                });
                Ok(Box::pin(futures::stream::iter(items)))
            }
        }
    }
}
