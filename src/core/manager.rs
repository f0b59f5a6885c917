//! Streaming conversation manager
//!
//! The ConversationManager owns the transcript and session for one
//! conversation. For each user message it:
//! 1. Appends the user message and an empty, streaming assistant message
//! 2. Opens a stream against the assistant backend
//! 3. Applies each chunk to the assistant message in delivery order
//! 4. Settles the message on `done`, or caps it with an apology on failure
//! 5. Flushes the transcript to persistence
//!
//! Failures never escape the public API. They are recorded as the snapshot's
//! `error` string and can be recovered with [`ConversationManager::retry_last_message`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::conversation::{
    new_id, resolve_tool_call, Message, MessagePatch, ToolCall, Transcript,
};
use crate::providers::{AssistantBackend, BackendError, Chunk, ChunkStream, StreamRequest};

use super::persistence::PersistenceAdapter;

/// Shown in place of the assistant's answer when a turn fails
pub const DEFAULT_APOLOGY: &str =
    "Sorry, I couldn't finish answering that. Please try again.";

/// Errors surfaced through the snapshot's `error` field
#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("Message cannot be empty")]
    EmptyMessage,

    #[error("No message to retry")]
    NothingToRetry,

    #[error("Assistant request failed: {0}")]
    Backend(#[from] BackendError),

    #[error("Assistant error: {0}")]
    Stream(String),

    #[error("Response cancelled")]
    Cancelled,

    #[error("No response from the assistant after {}s", .0.as_secs_f32())]
    TimedOut(Duration),
}

impl ConversationError {
    fn from_error_chunk(content: String) -> Self {
        if content.trim().is_empty() {
            ConversationError::Stream("unknown error".to_string())
        } else {
            ConversationError::Stream(content)
        }
    }
}

/// Manager tuning
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    /// Text written into the assistant message when a turn fails
    pub apology: String,

    /// Longest wait between two chunks. `None` waits forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            apology: DEFAULT_APOLOGY.to_string(),
            idle_timeout: None,
        }
    }
}

/// Identifier and retry state for the conversation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationSession {
    pub conversation_id: Option<String>,
    pub last_user_message: Option<String>,
}

/// Read-only view handed to the display layer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSnapshot {
    pub messages: Vec<Message>,
    pub is_loading: bool,
    pub is_streaming: bool,
    pub error: Option<String>,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Activity {
    #[default]
    Idle,
    /// Waiting for the first token
    Loading,
    Streaming,
}

struct ActiveTurn {
    message_id: String,
    cancel: CancellationToken,
}

#[derive(Default)]
struct State {
    transcript: Transcript,
    session: ConversationSession,
    error: Option<String>,
    activity: Activity,
    active: Option<ActiveTurn>,
    /// Bumped on clear so effects from an older turn are dropped
    generation: u64,
    /// Orders writes to the durable slot
    revision: u64,
}

impl State {
    fn next_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }

    /// Copy what the durable slot should hold right now
    fn capture(&mut self) -> Capture {
        Capture {
            revision: self.next_revision(),
            messages: self.transcript.messages().to_vec(),
            conversation_id: self.session.conversation_id.clone(),
        }
    }

    fn snapshot(&self) -> ConversationSnapshot {
        ConversationSnapshot {
            messages: self.transcript.messages().to_vec(),
            is_loading: self.activity == Activity::Loading,
            is_streaming: self.activity == Activity::Streaming,
            error: self.error.clone(),
            conversation_id: self.session.conversation_id.clone(),
        }
    }
}

struct Capture {
    revision: u64,
    messages: Vec<Message>,
    conversation_id: Option<String>,
}

impl Capture {
    /// Save the copy, or drop the slot if the transcript was empty
    async fn write(self, persistence: &PersistenceAdapter) {
        let result = if self.messages.is_empty() {
            persistence.clear(self.revision).await
        } else {
            persistence
                .save(
                    self.revision,
                    &self.messages,
                    self.conversation_id.as_deref(),
                )
                .await
        };

        if let Err(e) = result {
            warn!(error = %e, "Failed to persist conversation");
        }
    }
}

/// What starts a turn
enum TurnRequest<'a> {
    Send(&'a str),
    /// Resend the last user message, replacing the failed turn
    Retry,
}

/// One in-flight send, owned by the `send_message` call driving it
struct Turn {
    message_id: String,
    generation: u64,
    cancel: CancellationToken,
    request: StreamRequest,
}

enum Outcome {
    Completed,
    Failed(ConversationError),
    /// The manager was disposed or cleared underneath the turn
    Abandoned,
}

struct Ingestion {
    content: String,
    tool_calls: Vec<ToolCall>,
    saw_token: bool,
    progressed: bool,
}

impl Ingestion {
    fn new() -> Self {
        Self {
            content: String::new(),
            tool_calls: Vec::new(),
            saw_token: false,
            progressed: false,
        }
    }
}

/// Owns one conversation and drives streamed assistant turns into it
pub struct ConversationManager {
    backend: Arc<dyn AssistantBackend>,
    persistence: PersistenceAdapter,
    settings: ManagerSettings,
    state: Mutex<State>,
    updates: watch::Sender<ConversationSnapshot>,
    alive: AtomicBool,
}

impl ConversationManager {
    /// Create a manager, hydrating from persistence when a snapshot exists
    pub async fn new(
        backend: Arc<dyn AssistantBackend>,
        persistence: PersistenceAdapter,
        settings: ManagerSettings,
    ) -> Self {
        let mut state = State::default();

        if let Some(restored) = persistence.load().await {
            info!(
                key = %persistence.key(),
                messages = restored.transcript.len(),
                "Restored conversation"
            );
            state.session.last_user_message =
                restored.transcript.last_user_content().map(str::to_string);
            state.session.conversation_id = restored.conversation_id;
            state.transcript = restored.transcript;
        }

        let (updates, _) = watch::channel(state.snapshot());

        Self {
            backend,
            persistence,
            settings,
            state: Mutex::new(state),
            updates,
            alive: AtomicBool::new(true),
        }
    }

    pub fn snapshot(&self) -> ConversationSnapshot {
        self.lock().snapshot()
    }

    pub fn session(&self) -> ConversationSession {
        self.lock().session.clone()
    }

    /// Receive a fresh snapshot after every state change
    pub fn subscribe(&self) -> watch::Receiver<ConversationSnapshot> {
        self.updates.subscribe()
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Send a user message and stream the assistant's answer into the transcript.
    ///
    /// Returns once the turn has settled. Overlapping calls are ignored while
    /// a turn is in flight; dropping the future early settles the turn as
    /// cancelled and saves it in the background.
    pub async fn send_message(&self, text: &str) {
        if !self.is_alive() {
            debug!("Ignoring send on a disposed conversation manager");
            return;
        }

        let text = text.trim();
        if text.is_empty() {
            self.report(ConversationError::EmptyMessage);
            return;
        }

        self.run_turn(TurnRequest::Send(text)).await;
    }

    /// Drop the last failed turn and send its user text again
    pub async fn retry_last_message(&self) {
        if !self.is_alive() {
            return;
        }

        self.run_turn(TurnRequest::Retry).await;
    }

    async fn run_turn(&self, request: TurnRequest<'_>) {
        let Some(turn) = self.begin_turn(request) else {
            return;
        };

        let mut unsettled = Unsettled {
            manager: self,
            message_id: turn.message_id.clone(),
            generation: turn.generation,
            armed: true,
        };
        let (outcome, ingestion) = self.ingest(&turn).await;
        unsettled.armed = false;

        if self.settle(&turn.message_id, turn.generation, outcome, ingestion) {
            self.flush().await;
        }
    }

    /// Cancel any in-flight turn and forget the conversation, in memory and on disk
    pub async fn clear_conversation(&self) {
        if !self.is_alive() {
            return;
        }

        let revision = self.reset();

        if let Err(e) = self.persistence.clear(revision).await {
            warn!(error = %e, "Failed to drop saved conversation");
        }
    }

    /// Abort the in-flight turn. It settles as a cancelled failure.
    pub fn cancel(&self) -> bool {
        let state = self.lock();
        match &state.active {
            Some(active) => {
                info!(message_id = %active.message_id, "Cancelling assistant response");
                active.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Tear down: abort the in-flight turn and ignore everything after.
    pub fn dispose(&self) {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return;
        }

        if let Some(active) = &self.lock().active {
            active.cancel.cancel();
        }
        info!("Conversation manager disposed");
    }

    /// Write the current transcript to persistence, or drop the slot if empty
    pub async fn flush(&self) {
        if !self.is_alive() {
            return;
        }

        let capture = self.lock().capture();
        capture.write(&self.persistence).await;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &State) {
        self.updates.send_replace(state.snapshot());
    }

    fn is_current(&self, state: &State, generation: u64) -> bool {
        self.is_alive() && state.generation == generation
    }

    fn report(&self, error: ConversationError) {
        debug!(error = %error, "Rejected conversation command");
        let mut state = self.lock();
        state.error = Some(error.to_string());
        self.publish(&state);
    }

    /// Check, prepare and start a turn under one lock
    fn begin_turn(&self, request: TurnRequest<'_>) -> Option<Turn> {
        let mut state = self.lock();
        if state.active.is_some() {
            warn!("Ignoring message while a response is still in progress");
            return None;
        }

        let text = match request {
            TurnRequest::Send(text) => text.to_string(),
            TurnRequest::Retry => {
                let Some(text) = state.session.last_user_message.clone() else {
                    state.error = Some(ConversationError::NothingToRetry.to_string());
                    self.publish(&state);
                    return None;
                };
                let removed = state.transcript.remove_last_turn();
                debug!(removed, "Removed failed turn before retry");
                text
            }
        };

        state.error = None;
        state.transcript.append(Message::user(text.as_str()));
        state.session.last_user_message = Some(text.clone());

        let assistant = Message::assistant_placeholder();
        let message_id = assistant.id.clone();
        state.transcript.append(assistant);
        state.activity = Activity::Loading;

        let cancel = CancellationToken::new();
        state.active = Some(ActiveTurn {
            message_id: message_id.clone(),
            cancel: cancel.clone(),
        });

        let turn = Turn {
            message_id,
            generation: state.generation,
            cancel,
            request: StreamRequest {
                message: text.clone(),
                conversation_id: state.session.conversation_id.clone(),
            },
        };

        debug!(message_id = %turn.message_id, "Started assistant turn");
        self.publish(&state);
        Some(turn)
    }

    async fn ingest(&self, turn: &Turn) -> (Outcome, Ingestion) {
        let mut ingestion = Ingestion::new();

        let opened = tokio::select! {
            biased;
            _ = turn.cancel.cancelled() => return (self.interrupted(turn), ingestion),
            opened = self.backend.stream(turn.request.clone()) => opened,
        };

        let mut stream = match opened {
            Ok(stream) => stream,
            Err(e) => return (Outcome::Failed(e.into()), ingestion),
        };

        loop {
            let next = tokio::select! {
                biased;
                _ = turn.cancel.cancelled() => return (self.interrupted(turn), ingestion),
                next = self.next_chunk(&mut stream) => next,
            };

            if !self.is_current(&self.lock(), turn.generation) {
                return (Outcome::Abandoned, ingestion);
            }

            let chunk = match next {
                Ok(Some(chunk)) => chunk,
                Ok(None) => {
                    debug!("Stream ended without a done chunk");
                    return (Outcome::Completed, ingestion);
                }
                Err(e) => return (Outcome::Failed(e), ingestion),
            };

            debug!(kind = chunk.kind(), "Received chunk");

            match chunk {
                Chunk::Token { content } => {
                    ingestion.content.push_str(&content);
                    ingestion.progressed = true;

                    let first = !ingestion.saw_token;
                    ingestion.saw_token = true;
                    self.apply(
                        turn,
                        MessagePatch::default().content(ingestion.content.clone()),
                        first,
                    );
                }
                Chunk::ToolCall { tool } => {
                    ingestion
                        .tool_calls
                        .push(ToolCall::new(tool.name, tool.arguments));
                    ingestion.progressed = true;
                    self.apply(
                        turn,
                        MessagePatch::default().tool_calls(ingestion.tool_calls.clone()),
                        false,
                    );
                }
                Chunk::ToolResult { tool, content } => {
                    let result = tool.result.unwrap_or(Value::String(content));
                    if resolve_tool_call(&mut ingestion.tool_calls, &tool.name, result) {
                        self.apply(
                            turn,
                            MessagePatch::default().tool_calls(ingestion.tool_calls.clone()),
                            false,
                        );
                    } else {
                        warn!(tool = %tool.name, "Dropping tool result with no pending call");
                    }
                }
                Chunk::Error { content } => {
                    return (
                        Outcome::Failed(ConversationError::from_error_chunk(content)),
                        ingestion,
                    );
                }
                Chunk::Done => return (Outcome::Completed, ingestion),
                Chunk::Unknown => {}
            }
        }
    }

    async fn next_chunk(
        &self,
        stream: &mut ChunkStream,
    ) -> Result<Option<Chunk>, ConversationError> {
        let next = match self.settings.idle_timeout {
            Some(limit) => tokio::time::timeout(limit, stream.next())
                .await
                .map_err(|_| ConversationError::TimedOut(limit))?,
            None => stream.next().await,
        };

        next.transpose().map_err(ConversationError::from)
    }

    fn interrupted(&self, turn: &Turn) -> Outcome {
        if self.is_current(&self.lock(), turn.generation) {
            Outcome::Failed(ConversationError::Cancelled)
        } else {
            Outcome::Abandoned
        }
    }

    fn apply(&self, turn: &Turn, patch: MessagePatch, first_token: bool) {
        let mut state = self.lock();
        if !self.is_current(&state, turn.generation) {
            return;
        }

        state.transcript.update_by_id(&turn.message_id, patch);
        if first_token {
            state.activity = Activity::Streaming;
        }
        self.publish(&state);
    }

    /// Record the turn's outcome. Returns whether anything changed.
    fn settle(
        &self,
        message_id: &str,
        generation: u64,
        outcome: Outcome,
        ingestion: Ingestion,
    ) -> bool {
        let mut state = self.lock();
        if !self.is_current(&state, generation) {
            debug!(message_id = %message_id, "Discarding turn after reset");
            return false;
        }

        let completed = matches!(outcome, Outcome::Completed);
        let patch = match outcome {
            Outcome::Completed => MessagePatch::default()
                .content(ingestion.content)
                .tool_calls(ingestion.tool_calls)
                .settle(),
            Outcome::Failed(error) => {
                warn!(message_id = %message_id, error = %error, "Assistant turn failed");
                state.error = Some(error.to_string());
                MessagePatch::default()
                    .content(self.settings.apology.clone())
                    .settle()
            }
            Outcome::Abandoned => return false,
        };
        state.transcript.update_by_id(message_id, patch);

        if state.session.conversation_id.is_none() && (completed || ingestion.progressed) {
            let conversation_id = new_id();
            info!(conversation_id = %conversation_id, "Started conversation");
            state.session.conversation_id = Some(conversation_id);
        }

        state.activity = Activity::Idle;
        state.active = None;
        if completed {
            info!(message_id = %message_id, "Assistant turn completed");
        }
        self.publish(&state);
        true
    }

    /// Returns the revision the durable clear must carry
    fn reset(&self) -> u64 {
        let mut state = self.lock();
        state.generation += 1;
        if let Some(active) = state.active.take() {
            active.cancel.cancel();
        }

        state.transcript.clear();
        state.session = ConversationSession::default();
        state.error = None;
        state.activity = Activity::Idle;
        self.publish(&state);
        info!("Conversation cleared");
        state.next_revision()
    }
}

/// Settles a turn whose `send_message` future was dropped before finishing
struct Unsettled<'a> {
    manager: &'a ConversationManager,
    message_id: String,
    generation: u64,
    armed: bool,
}

impl Drop for Unsettled<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let settled = self.manager.settle(
            &self.message_id,
            self.generation,
            Outcome::Failed(ConversationError::Cancelled),
            Ingestion::new(),
        );
        if !settled {
            return;
        }

        // Best effort: outside a runtime the slot keeps the previous turn
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let capture = self.manager.lock().capture();
                let persistence = self.manager.persistence.clone();
                handle.spawn(async move { capture.write(&persistence).await });
            }
            Err(_) => debug!(message_id = %self.message_id, "No runtime to persist dropped turn"),
        }
    }
}

impl Drop for ConversationManager {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::Role;
    use crate::core::memory::{InMemoryStore, SnapshotStore, StoreError};
    use std::collections::VecDeque;
    use crate::providers::{ScriptedBackend, ToolOutcome};
    use async_trait::async_trait;
    use serde_json::{json, Map};
    use tokio::sync::mpsc;
    use tokio_test::{assert_pending, assert_ready};

    /// Backend whose streams are fed by the test through channels, one per turn
    struct ChannelBackend {
        rx: Mutex<VecDeque<mpsc::UnboundedReceiver<Chunk>>>,
    }

    impl ChannelBackend {
        fn new() -> (Arc<Self>, mpsc::UnboundedSender<Chunk>) {
            let (backend, mut senders) = Self::with_turns(1);
            (backend, senders.remove(0))
        }

        fn with_turns(turns: usize) -> (Arc<Self>, Vec<mpsc::UnboundedSender<Chunk>>) {
            let (senders, receivers): (Vec<_>, VecDeque<_>) =
                (0..turns).map(|_| mpsc::unbounded_channel()).unzip();
            let backend = Arc::new(Self {
                rx: Mutex::new(receivers),
            });
            (backend, senders)
        }
    }

    #[async_trait]
    impl AssistantBackend for ChannelBackend {
        async fn stream(&self, _request: StreamRequest) -> Result<ChunkStream, BackendError> {
            let mut rx = self
                .rx
                .lock()
                .unwrap()
                .pop_front()
                .ok_or_else(|| BackendError::Unavailable("no streams left".to_string()))?;

            Ok(Box::pin(async_stream::stream! {
                while let Some(chunk) = rx.recv().await {
                    yield Ok(chunk);
                }
            }))
        }
    }

    fn adapter(store: &Arc<InMemoryStore>) -> PersistenceAdapter {
        PersistenceAdapter::new(store.clone(), "portfolio-chat")
    }

    async fn manager_with(
        backend: Arc<dyn AssistantBackend>,
        store: &Arc<InMemoryStore>,
    ) -> ConversationManager {
        ConversationManager::new(backend, adapter(store), ManagerSettings::default()).await
    }

    fn no_args() -> Map<String, Value> {
        Map::new()
    }

    /// Store whose writes take a while to land
    struct SlowStore {
        inner: InMemoryStore,
        delay: Duration,
    }

    #[async_trait]
    impl SnapshotStore for SlowStore {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.set(key, value).await
        }

        async fn remove(&self, key: &str) -> Result<(), StoreError> {
            self.inner.remove(key).await
        }
    }

    #[tokio::test]
    async fn test_scenario_tokens_and_tool_call() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new(vec![
            Chunk::token("Hi "),
            Chunk::token("there"),
            Chunk::tool_call("lookup", no_args()),
            Chunk::tool_result("lookup", json!("ok")),
            Chunk::Done,
        ]));
        let manager = manager_with(backend, &store).await;

        manager.send_message("Hi").await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[0].role, Role::User);
        assert_eq!(snapshot.messages[0].content, "Hi");

        let assistant = &snapshot.messages[1];
        assert_eq!(assistant.role, Role::Assistant);
        assert_eq!(assistant.content, "Hi there");
        assert!(!assistant.streaming);

        let calls = assistant.tool_calls.as_ref().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "lookup");
        assert_eq!(calls[0].result, Some(json!("ok")));

        assert!(!snapshot.is_loading);
        assert!(!snapshot.is_streaming);
        assert!(snapshot.error.is_none());
        assert!(snapshot.conversation_id.is_some());
    }

    #[tokio::test]
    async fn test_tokens_accumulate_in_order() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new(vec![
            Chunk::token("Hel"),
            Chunk::token("lo"),
            Chunk::Done,
            Chunk::token(" ignored"),
        ]));
        let manager = manager_with(backend, &store).await;

        manager.send_message("greet me").await;

        let assistant = &manager.snapshot().messages[1];
        assert_eq!(assistant.content, "Hello");
        assert!(!assistant.streaming);
    }

    #[tokio::test]
    async fn test_tool_results_match_fifo_per_name() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new(vec![
            Chunk::tool_call("x", no_args()),
            Chunk::tool_call("x", no_args()),
            Chunk::tool_result("x", json!(1)),
            Chunk::tool_result("x", json!(2)),
            Chunk::tool_result("y", json!("orphan")),
            Chunk::Done,
        ]));
        let manager = manager_with(backend, &store).await;

        manager.send_message("run tools").await;

        let snapshot = manager.snapshot();
        let calls = snapshot.messages[1].tool_calls.clone().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].result, Some(json!(1)));
        assert_eq!(calls[1].result, Some(json!(2)));
        assert!(snapshot.error.is_none());
    }

    #[tokio::test]
    async fn test_tool_result_falls_back_to_content() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new(vec![
            Chunk::tool_call("get_price", no_args()),
            Chunk::ToolResult {
                tool: ToolOutcome {
                    name: "get_price".to_string(),
                    result: None,
                },
                content: "BTC 64000".to_string(),
            },
            Chunk::Done,
        ]));
        let manager = manager_with(backend, &store).await;

        manager.send_message("price?").await;

        let calls = manager.snapshot().messages[1].tool_calls.clone().unwrap();
        assert_eq!(calls[0].result, Some(json!("BTC 64000")));
    }

    #[tokio::test]
    async fn test_empty_message_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new(vec![Chunk::Done]));
        let manager = manager_with(backend.clone(), &store).await;

        manager.send_message("   \n\t").await;

        let snapshot = manager.snapshot();
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.error.as_deref(), Some("Message cannot be empty"));
        assert!(backend.requests().is_empty());
        assert!(manager.session().last_user_message.is_none());
    }

    #[tokio::test]
    async fn test_error_chunk_caps_message_with_apology() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new(vec![
            Chunk::token("Your portfolio"),
            Chunk::error("rate limited"),
        ]));
        let manager = manager_with(backend, &store).await;

        manager.send_message("How am I doing?").await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[1].content, DEFAULT_APOLOGY);
        assert!(!snapshot.messages[1].streaming);
        assert_eq!(snapshot.error.as_deref(), Some("Assistant error: rate limited"));
        assert!(!snapshot.is_loading);
        assert!(!snapshot.is_streaming);
        // partial progress still starts a conversation
        assert!(snapshot.conversation_id.is_some());
    }

    #[tokio::test]
    async fn test_unavailable_backend_is_captured() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(ScriptedBackend::default().then_unavailable("connection refused"));
        let manager = manager_with(backend, &store).await;

        manager.send_message("Hi").await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[1].content, DEFAULT_APOLOGY);
        assert!(snapshot.error.unwrap().contains("connection refused"));
        assert!(snapshot.conversation_id.is_none());
    }

    #[tokio::test]
    async fn test_retry_replaces_failed_turn() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(
            ScriptedBackend::default()
                .then(vec![Chunk::error("upstream timeout")])
                .then(vec![Chunk::token("All good"), Chunk::Done]),
        );
        let manager = manager_with(backend.clone(), &store).await;

        manager.send_message("Summarize my holdings").await;
        assert!(manager.snapshot().error.is_some());

        manager.retry_last_message().await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.messages.len(), 2);
        assert_eq!(snapshot.messages[0].content, "Summarize my holdings");
        assert_eq!(snapshot.messages[1].content, "All good");
        assert!(snapshot.error.is_none());

        let requests = backend.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].message, requests[1].message);
    }

    #[tokio::test]
    async fn test_retry_without_history() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new(vec![Chunk::Done]));
        let manager = manager_with(backend.clone(), &store).await;

        manager.retry_last_message().await;

        let snapshot = manager.snapshot();
        assert!(snapshot.messages.is_empty());
        assert_eq!(snapshot.error.as_deref(), Some("No message to retry"));
        assert!(backend.requests().is_empty());
    }

    #[tokio::test]
    async fn test_conversation_id_is_stable() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new(vec![Chunk::token("ok"), Chunk::Done]));
        let manager = manager_with(backend.clone(), &store).await;

        manager.send_message("first").await;
        let id = manager.snapshot().conversation_id;
        manager.send_message("second").await;

        assert_eq!(manager.snapshot().conversation_id, id);
        assert_eq!(manager.snapshot().messages.len(), 4);

        let requests = backend.requests();
        assert_eq!(requests[0].conversation_id, None);
        assert_eq!(requests[1].conversation_id, id);
    }

    #[tokio::test]
    async fn test_clear_is_idempotent() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new(vec![Chunk::token("ok"), Chunk::Done]));
        let manager = manager_with(backend, &store).await;
        manager.send_message("hello").await;

        manager.clear_conversation().await;
        let once = manager.snapshot();
        manager.clear_conversation().await;

        assert_eq!(manager.snapshot(), once);
        assert_eq!(once, ConversationSnapshot::default());
        assert_eq!(manager.session(), ConversationSession::default());
        assert!(store.get("portfolio-chat").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transcript_survives_reload() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new(vec![Chunk::token("42%"), Chunk::Done]));

        let first = manager_with(backend.clone(), &store).await;
        first.send_message("BTC share?").await;
        let saved = first.snapshot();
        drop(first);

        let second = manager_with(backend, &store).await;
        let restored = second.snapshot();
        assert_eq!(restored.messages, saved.messages);
        assert_eq!(restored.conversation_id, saved.conversation_id);
        assert_eq!(
            second.session().last_user_message.as_deref(),
            Some("BTC share?")
        );
    }

    #[tokio::test]
    async fn test_hydration_settles_streaming_messages() {
        let store = Arc::new(InMemoryStore::new());
        let mut transcript = Transcript::new();
        transcript.append(Message::user("half-finished"));
        transcript.append(Message::assistant_placeholder());
        adapter(&store)
            .save(1, transcript.messages(), Some("conv-7"))
            .await
            .unwrap();

        let backend = Arc::new(ScriptedBackend::new(vec![Chunk::Done]));
        let manager = manager_with(backend, &store).await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.messages.len(), 2);
        assert!(snapshot.messages.iter().all(|m| !m.streaming));
        assert_eq!(snapshot.conversation_id.as_deref(), Some("conv-7"));
        assert!(!snapshot.is_loading && !snapshot.is_streaming);
    }

    #[tokio::test]
    async fn test_malformed_snapshot_starts_empty() {
        let store = Arc::new(InMemoryStore::new());
        store.set("portfolio-chat", "{broken").await.unwrap();

        let backend = Arc::new(ScriptedBackend::new(vec![Chunk::Done]));
        let manager = manager_with(backend, &store).await;

        assert_eq!(manager.snapshot(), ConversationSnapshot::default());
    }

    #[tokio::test]
    async fn test_loading_then_streaming_status() {
        let store = Arc::new(InMemoryStore::new());
        let (backend, tx) = ChannelBackend::new();
        let manager = Arc::new(manager_with(backend, &store).await);

        let mut send = tokio_test::task::spawn({
            let manager = manager.clone();
            async move { manager.send_message("Hi").await }
        });

        assert_pending!(send.poll());
        let snapshot = manager.snapshot();
        assert!(snapshot.is_loading);
        assert!(!snapshot.is_streaming);
        assert!(snapshot.messages[1].streaming);

        tx.send(Chunk::tool_call("lookup", no_args())).unwrap();
        assert_pending!(send.poll());
        assert!(manager.snapshot().is_loading);

        tx.send(Chunk::token("Hel")).unwrap();
        assert_pending!(send.poll());
        let snapshot = manager.snapshot();
        assert!(!snapshot.is_loading);
        assert!(snapshot.is_streaming);
        assert_eq!(snapshot.messages[1].content, "Hel");

        tx.send(Chunk::Done).unwrap();
        assert_ready!(send.poll());
        let snapshot = manager.snapshot();
        assert!(!snapshot.is_loading && !snapshot.is_streaming);
        assert!(!snapshot.messages[1].streaming);
    }

    #[tokio::test]
    async fn test_overlapping_send_is_ignored() {
        let store = Arc::new(InMemoryStore::new());
        let (backend, tx) = ChannelBackend::new();
        let manager = Arc::new(manager_with(backend, &store).await);

        let mut send = tokio_test::task::spawn({
            let manager = manager.clone();
            async move { manager.send_message("first").await }
        });
        assert_pending!(send.poll());

        manager.send_message("second").await;
        manager.retry_last_message().await;
        assert_eq!(manager.snapshot().messages.len(), 2);
        assert_eq!(manager.session().last_user_message.as_deref(), Some("first"));

        tx.send(Chunk::Done).unwrap();
        assert_ready!(send.poll());
    }

    #[tokio::test]
    async fn test_dispose_mid_stream_freezes_transcript() {
        let store = Arc::new(InMemoryStore::new());
        let (backend, tx) = ChannelBackend::new();
        let manager = Arc::new(manager_with(backend, &store).await);
        let mut updates = manager.subscribe();

        let mut send = tokio_test::task::spawn({
            let manager = manager.clone();
            async move { manager.send_message("Hi").await }
        });

        tx.send(Chunk::token("Hel")).unwrap();
        assert_pending!(send.poll());
        let before = manager.snapshot();
        let _ = updates.borrow_and_update();

        manager.dispose();
        tx.send(Chunk::token("lo")).unwrap();
        tx.send(Chunk::Done).unwrap();
        assert_ready!(send.poll());

        assert_eq!(manager.snapshot(), before);
        assert!(!updates.has_changed().unwrap());
        assert!(store.get("portfolio-chat").await.unwrap().is_none());

        manager.send_message("after teardown").await;
        assert_eq!(manager.snapshot(), before);
    }

    #[tokio::test]
    async fn test_cancel_settles_as_failure() {
        let store = Arc::new(InMemoryStore::new());
        let (backend, tx) = ChannelBackend::new();
        let manager = Arc::new(manager_with(backend, &store).await);

        let mut send = tokio_test::task::spawn({
            let manager = manager.clone();
            async move { manager.send_message("Hi").await }
        });
        tx.send(Chunk::token("Hel")).unwrap();
        assert_pending!(send.poll());

        assert!(manager.cancel());
        assert_ready!(send.poll());

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.messages[1].content, DEFAULT_APOLOGY);
        assert!(!snapshot.messages[1].streaming);
        assert_eq!(snapshot.error.as_deref(), Some("Response cancelled"));
        assert!(!manager.cancel());
    }

    #[tokio::test]
    async fn test_dropped_send_settles_turn() {
        let store = Arc::new(InMemoryStore::new());
        let (backend, tx) = ChannelBackend::new();
        let manager = Arc::new(manager_with(backend, &store).await);

        let mut send = tokio_test::task::spawn({
            let manager = manager.clone();
            async move { manager.send_message("Hi").await }
        });
        tx.send(Chunk::token("Hel")).unwrap();
        assert_pending!(send.poll());

        drop(send);

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.error.as_deref(), Some("Response cancelled"));
        assert!(!snapshot.is_loading && !snapshot.is_streaming);
        assert_eq!(snapshot.messages[1].content, DEFAULT_APOLOGY);
        assert!(!snapshot.messages[1].streaming);

        for _ in 0..10 {
            if store.get("portfolio-chat").await.unwrap().is_some() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let restored = adapter(&store).load().await.unwrap();
        assert_eq!(restored.transcript.messages(), snapshot.messages.as_slice());
    }

    #[tokio::test]
    async fn test_clear_wins_over_slow_save() {
        let store = Arc::new(SlowStore {
            inner: InMemoryStore::new(),
            delay: Duration::from_millis(50),
        });
        let backend = Arc::new(ScriptedBackend::new(vec![Chunk::token("ok"), Chunk::Done]));
        let manager = Arc::new(
            ConversationManager::new(
                backend.clone(),
                PersistenceAdapter::new(store.clone(), "portfolio-chat"),
                ManagerSettings::default(),
            )
            .await,
        );
        let mut updates = manager.subscribe();

        let send = tokio::spawn({
            let manager = manager.clone();
            async move { manager.send_message("hello").await }
        });
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            if snapshot.messages.len() == 2 && !snapshot.messages[1].streaming {
                break;
            }
        }

        manager.clear_conversation().await;
        send.await.unwrap();

        assert!(manager.snapshot().messages.is_empty());
        assert!(store.get("portfolio-chat").await.unwrap().is_none());

        let reloaded = ConversationManager::new(
            backend,
            PersistenceAdapter::new(store.clone(), "portfolio-chat"),
            ManagerSettings::default(),
        )
        .await;
        assert!(reloaded.snapshot().messages.is_empty());
    }

    #[tokio::test]
    async fn test_retry_waits_for_turn_in_flight() {
        let store = Arc::new(InMemoryStore::new());
        let (backend, senders) = ChannelBackend::with_turns(2);
        let manager = Arc::new(manager_with(backend, &store).await);

        let mut first = tokio_test::task::spawn({
            let manager = manager.clone();
            async move { manager.send_message("first").await }
        });
        assert_pending!(first.poll());
        senders[0].send(Chunk::error("rate limited")).unwrap();
        assert_ready!(first.poll());
        assert!(manager.snapshot().error.is_some());

        let mut second = tokio_test::task::spawn({
            let manager = manager.clone();
            async move { manager.send_message("second").await }
        });
        assert_pending!(second.poll());

        manager.retry_last_message().await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.messages.len(), 4);
        assert_eq!(snapshot.messages[0].content, "first");
        assert_eq!(snapshot.messages[1].content, DEFAULT_APOLOGY);
        assert_eq!(snapshot.messages[2].content, "second");

        senders[1].send(Chunk::Done).unwrap();
        assert_ready!(second.poll());
    }

    #[tokio::test]
    async fn test_clear_mid_stream_discards_late_chunks() {
        let store = Arc::new(InMemoryStore::new());
        let (backend, tx) = ChannelBackend::new();
        let manager = Arc::new(manager_with(backend, &store).await);

        let mut send = tokio_test::task::spawn({
            let manager = manager.clone();
            async move { manager.send_message("Hi").await }
        });
        tx.send(Chunk::token("Hel")).unwrap();
        assert_pending!(send.poll());

        manager.clear_conversation().await;
        tx.send(Chunk::token("lo")).unwrap();
        tx.send(Chunk::Done).unwrap();
        assert_ready!(send.poll());

        assert_eq!(manager.snapshot(), ConversationSnapshot::default());
        assert!(store.get("portfolio-chat").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_idle_timeout_fails_turn() {
        let store = Arc::new(InMemoryStore::new());
        let (backend, _tx) = ChannelBackend::new();
        let settings = ManagerSettings {
            idle_timeout: Some(Duration::from_millis(20)),
            ..Default::default()
        };
        let manager = ConversationManager::new(backend, adapter(&store), settings).await;

        manager.send_message("Hi").await;

        let snapshot = manager.snapshot();
        assert!(snapshot.error.unwrap().starts_with("No response from the assistant"));
        assert_eq!(snapshot.messages[1].content, DEFAULT_APOLOGY);
    }

    #[tokio::test]
    async fn test_stream_end_without_done_completes() {
        let store = Arc::new(InMemoryStore::new());
        let backend = Arc::new(ScriptedBackend::new(vec![Chunk::token("partial answer")]));
        let manager = manager_with(backend, &store).await;

        manager.send_message("Hi").await;

        let snapshot = manager.snapshot();
        assert_eq!(snapshot.messages[1].content, "partial answer");
        assert!(!snapshot.messages[1].streaming);
        assert!(snapshot.error.is_none());
    }
}
