//! Conversation Sessions
//!
//! Drives generations for one conversation. A session runs at most one
//! generation at a time and makes sure whatever the client saw ends up in the
//! store, whichever way the stream ends.
//!
//! # Lifecycle
//!
//! ```text
//! Idle ──send/regenerate──► Sending ──placeholder stored──► Streaming
//!  ▲                                                            │
//!  └──────────── Completed | Cancelled | Failed ◄───────────────┘
//! ```
//!
//! The terminal status is recorded as [`ConversationSession::last_status`];
//! the session itself always returns to `Idle`.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{Connector, GenerationRequest};
use crate::error::{ErrorKind, GatewayError, Result};
use crate::events::{GenerationEvent, GenerationOutcome, RegenerateRequest, SendRequest};
use crate::messages::{now_ms, Message, MessageId, MessageRole, MessageStatus, ProviderConfig, SessionId};
use crate::prompt::{assemble_prompt, DEFAULT_HISTORY_WINDOW};
use crate::retrieval::{RetrievalInjector, RetrievalOptions};
use crate::store::MessageStore;
use crate::streaming::{
    CancellationRegistry, DispatcherConfig, Registration, StreamDispatcher, StreamStatus,
    TokenStream,
};

/// Longest derived session title, in characters
pub const MAX_TITLE_CHARS: usize = 48;

/// Default cap on one response
pub const DEFAULT_MAX_RESPONSE_BYTES: usize = 1024 * 1024;

// ============================================================================
// Configuration
// ============================================================================

/// Per-session behavior
#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Persisted messages included in a prompt
    pub history_window: usize,
    /// Transient system turn prepended to every prompt
    pub system_instructions: Option<String>,
    /// Cap on the accumulated response
    pub max_response_bytes: usize,
    /// Tokens between intermediate writes of the streaming message (0 = never)
    pub flush_every: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_window: DEFAULT_HISTORY_WINDOW,
            system_instructions: None,
            max_response_bytes: DEFAULT_MAX_RESPONSE_BYTES,
            flush_every: 32,
        }
    }
}

/// Shared collaborators of every session in a gateway
#[derive(Clone)]
pub struct Collaborators {
    /// Message persistence
    pub store: Arc<dyn MessageStore>,
    /// Vendor connections
    pub connector: Arc<dyn Connector>,
    /// Prompt augmentation
    pub retrieval: RetrievalInjector,
    /// Session to in-flight generation map
    pub registry: CancellationRegistry,
}

// ============================================================================
// State
// ============================================================================

/// Where a session is in its lifecycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Ready for a new generation
    #[default]
    Idle,
    /// Building the prompt
    Sending,
    /// Tokens are flowing
    Streaming,
}

/// A final write that has not reached the store yet
#[derive(Clone, Debug)]
enum PendingWrite {
    Commit {
        message_id: MessageId,
        content: String,
        status: MessageStatus,
    },
    Discard {
        message_id: MessageId,
    },
}

#[derive(Debug, Default)]
struct SessionState {
    phase: SessionPhase,
    last_status: Option<StreamStatus>,
    pending: Option<PendingWrite>,
}

/// Resets the phase (and releases the registry entry) however the
/// generation future ends, including when it is dropped mid-await
struct FlightGuard<'a> {
    session: &'a ConversationSession,
    registration: Option<Registration>,
}

impl FlightGuard<'_> {
    fn token(&self) -> CancellationToken {
        self.registration
            .as_ref()
            .map(|r| r.token.clone())
            .unwrap_or_default()
    }
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.session.state.lock().phase = SessionPhase::Idle;
        if let Some(registration) = &self.registration {
            self.session
                .deps
                .registry
                .release(&self.session.id, registration);
        }
    }
}

/// Everything one generation needs from the request and the stored session
struct Exchange {
    owner: String,
    title: Option<String>,
    provider: ProviderConfig,
    query: String,
    retrieval: Option<RetrievalOptions>,
    history: Vec<Message>,
}

// ============================================================================
// Session
// ============================================================================

/// Single-flight generation driver for one conversation
pub struct ConversationSession {
    id: SessionId,
    deps: Collaborators,
    config: SessionConfig,
    dispatcher: DispatcherConfig,
    state: Mutex<SessionState>,
}

impl ConversationSession {
    /// Create a session driver for an already stored session
    pub fn new(
        id: SessionId,
        deps: Collaborators,
        config: SessionConfig,
        dispatcher: DispatcherConfig,
    ) -> Self {
        Self {
            id,
            deps,
            config,
            dispatcher,
            state: Mutex::new(SessionState::default()),
        }
    }

    /// Session ID
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current lifecycle phase
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.state.lock().phase
    }

    /// How the most recent generation ended
    #[must_use]
    pub fn last_status(&self) -> Option<StreamStatus> {
        self.state.lock().last_status.clone()
    }

    /// Content of a final write that failed, if any
    #[must_use]
    pub fn pending_content(&self) -> Option<String> {
        match &self.state.lock().pending {
            Some(PendingWrite::Commit { content, .. }) => Some(content.clone()),
            _ => None,
        }
    }

    /// Whether a final write is waiting for [`retry_persist`](Self::retry_persist)
    #[must_use]
    pub fn has_pending_write(&self) -> bool {
        self.state.lock().pending.is_some()
    }

    /// Append a user message and stream the assistant reply into `events`
    ///
    /// Stream failures are reported through the returned outcome and an
    /// [`GenerationEvent::Error`]; `Err` is reserved for refused requests and
    /// store failures.
    pub async fn send(
        &self,
        request: SendRequest,
        events: mpsc::Sender<GenerationEvent>,
    ) -> Result<GenerationOutcome> {
        let guard = self.begin()?;
        let session = self.deps.store.load_session(&self.id).await?;

        let user = Message::user(request.content.clone(), request.attachments);
        let user = self.deps.store.append_message(&self.id, user).await?;

        let mut history = session.messages;
        history.push(user);

        let exchange = Exchange {
            owner: session.owner,
            title: session.title,
            provider: match request.provider {
                Some(provider) => provider.confined_to(&session.provider),
                None => session.provider,
            },
            query: request.content,
            retrieval: request.retrieval,
            history,
        };
        self.generate(guard, exchange, events).await
    }

    /// Replace everything after the nearest user message at or before
    /// `target_index` with a fresh reply
    pub async fn regenerate(
        &self,
        request: RegenerateRequest,
        events: mpsc::Sender<GenerationEvent>,
    ) -> Result<GenerationOutcome> {
        let guard = self.begin()?;
        let mut session = self.deps.store.load_session(&self.id).await?;

        let target = request.target_index;
        let user_index = session
            .messages
            .get(..=target)
            .and_then(|prefix| prefix.iter().rposition(|m| m.role == MessageRole::User))
            .ok_or(GatewayError::InvalidTarget(target))?;

        let removed = self.deps.store.truncate_after(&self.id, user_index).await?;
        session.messages.truncate(user_index + 1);
        tracing::debug!(
            session_id = %self.id,
            user_index,
            removed,
            "Truncated history for regeneration"
        );

        let query = session.messages[user_index].content.clone();
        let exchange = Exchange {
            owner: session.owner,
            title: session.title,
            provider: match request.provider {
                Some(provider) => provider.confined_to(&session.provider),
                None => session.provider,
            },
            query,
            retrieval: request.retrieval,
            history: session.messages,
        };
        self.generate(guard, exchange, events).await
    }

    /// Request cancellation of the in-flight generation
    ///
    /// Idempotent. Returns `false` when nothing was running.
    pub fn stop(&self) -> bool {
        if self.phase() == SessionPhase::Idle {
            return false;
        }
        let signalled = self.deps.registry.cancel(&self.id);
        if signalled {
            tracing::debug!(session_id = %self.id, "Stop requested");
        }
        signalled
    }

    /// Re-submit a final write that failed earlier
    ///
    /// Returns `false` when there was nothing to flush.
    pub async fn retry_persist(&self) -> Result<bool> {
        let (guard, write) = {
            let mut state = self.state.lock();
            if state.phase != SessionPhase::Idle {
                return Err(GatewayError::SessionBusy(self.id.clone()));
            }
            let Some(write) = state.pending.take() else {
                return Ok(false);
            };
            state.phase = SessionPhase::Sending;
            let guard = FlightGuard {
                session: self,
                registration: None,
            };
            (guard, write)
        };

        let result = self.apply(&write).await;
        if result.is_err() {
            self.state.lock().pending = Some(write);
        }
        drop(guard);

        match result {
            Ok(()) => {
                tracing::info!(session_id = %self.id, "Flushed pending write");
                Ok(true)
            }
            Err(e) => {
                tracing::error!(session_id = %self.id, error = %e, "Pending write failed again");
                Err(GatewayError::Persistence {
                    session_id: self.id.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }

    // ========================================================================
    // Generation
    // ========================================================================

    fn begin(&self) -> Result<FlightGuard<'_>> {
        let mut state = self.state.lock();
        if state.phase != SessionPhase::Idle {
            return Err(GatewayError::SessionBusy(self.id.clone()));
        }
        if state.pending.is_some() {
            return Err(GatewayError::PendingWrite(self.id.clone()));
        }

        // Registration happens under the state lock, so the single-flight
        // check and the registry insert cannot interleave with another send
        let registration = self
            .deps
            .registry
            .register(&self.id)
            .ok_or_else(|| GatewayError::SessionBusy(self.id.clone()))?;
        state.phase = SessionPhase::Sending;

        Ok(FlightGuard {
            session: self,
            registration: Some(registration),
        })
    }

    async fn generate(
        &self,
        guard: FlightGuard<'_>,
        exchange: Exchange,
        events: mpsc::Sender<GenerationEvent>,
    ) -> Result<GenerationOutcome> {
        let cancel = guard.token();

        let context = match &exchange.retrieval {
            Some(options) => {
                self.deps
                    .retrieval
                    .gather(&exchange.owner, &exchange.query, options)
                    .await
            }
            None => Vec::new(),
        };
        let turns = assemble_prompt(
            &exchange.history,
            self.config.history_window,
            self.config.system_instructions.as_deref(),
            &context,
        );

        if cancel.is_cancelled() {
            tracing::debug!(session_id = %self.id, "Stopped before streaming started");
            self.state.lock().last_status = Some(StreamStatus::Cancelled);
            return Ok(GenerationOutcome {
                status: StreamStatus::Cancelled,
                content: String::new(),
                tokens: 0,
                message_id: None,
            });
        }

        let placeholder = self
            .deps
            .store
            .append_message(&self.id, Message::streaming_placeholder())
            .await?;
        self.state.lock().phase = SessionPhase::Streaming;

        tracing::debug!(
            session_id = %self.id,
            provider = %exchange.provider.kind,
            model = %exchange.provider.model,
            turns = turns.len(),
            context_blocks = context.len(),
            "Starting generation"
        );

        let request = GenerationRequest::new(exchange.provider.model.clone(), turns);
        let stream = StreamDispatcher::new(
            Arc::clone(&self.deps.connector),
            exchange.provider,
            request,
            self.dispatcher.clone(),
        )
        .run(cancel.clone());

        let (status, content, tokens) = self
            .pump(stream, &cancel, &placeholder.id, &events)
            .await;

        tracing::debug!(
            session_id = %self.id,
            tokens,
            bytes = content.len(),
            status = ?status,
            "Generation ended"
        );

        let outcome = self
            .conclude(
                &exchange.history,
                exchange.title,
                placeholder.id,
                status,
                content,
                tokens,
                &events,
            )
            .await;
        drop(guard);
        outcome
    }

    /// Forward tokens to `events` until the stream ends
    ///
    /// A token is accumulated only once it has been handed to `events`, so the
    /// content always equals exactly what the client received.
    async fn pump(
        &self,
        mut stream: TokenStream,
        cancel: &CancellationToken,
        message_id: &MessageId,
        events: &mpsc::Sender<GenerationEvent>,
    ) -> (StreamStatus, String, usize) {
        let mut content = String::new();
        let mut delivered = 0usize;

        let status = loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break StreamStatus::Cancelled,
                () = events.closed() => {
                    tracing::debug!(session_id = %self.id, "Event receiver dropped while waiting");
                    cancel.cancel();
                    break StreamStatus::Cancelled;
                }
                next = stream.next() => next,
            };
            let Some(token) = next else {
                break stream.finish().await;
            };
            if token.content.is_empty() {
                continue;
            }

            if content.len() + token.content.len() > self.config.max_response_bytes {
                break StreamStatus::failed(&GatewayError::ResourceExceeded(format!(
                    "response exceeded {} bytes",
                    self.config.max_response_bytes
                )));
            }

            let sent = tokio::select! {
                biased;
                () = cancel.cancelled() => break StreamStatus::Cancelled,
                sent = events.send(GenerationEvent::Token(token.content.clone())) => sent,
            };
            if sent.is_err() {
                tracing::debug!(session_id = %self.id, "Event receiver dropped, stopping");
                cancel.cancel();
                break StreamStatus::Cancelled;
            }

            content.push_str(&token.content);
            delivered += 1;

            if self.config.flush_every > 0 && delivered % self.config.flush_every == 0 {
                if let Err(e) = self
                    .deps
                    .store
                    .update_streaming_message(&self.id, message_id, &content)
                    .await
                {
                    tracing::warn!(session_id = %self.id, error = %e, "Intermediate write failed");
                }
            }
        };

        (status, content, delivered)
    }

    #[allow(clippy::too_many_arguments)]
    async fn conclude(
        &self,
        history: &[Message],
        title: Option<String>,
        message_id: MessageId,
        status: StreamStatus,
        content: String,
        tokens: usize,
        events: &mpsc::Sender<GenerationEvent>,
    ) -> Result<GenerationOutcome> {
        let write = match (&status, content.is_empty()) {
            (StreamStatus::Completed, _) => PendingWrite::Commit {
                message_id: message_id.clone(),
                content: content.clone(),
                status: MessageStatus::Complete,
            },
            (_, true) => PendingWrite::Discard {
                message_id: message_id.clone(),
            },
            (StreamStatus::Cancelled, false) => PendingWrite::Commit {
                message_id: message_id.clone(),
                content: content.clone(),
                status: MessageStatus::Cancelled,
            },
            (StreamStatus::Failed { .. }, false) => PendingWrite::Commit {
                message_id: message_id.clone(),
                content: content.clone(),
                status: MessageStatus::Errored,
            },
        };
        let kept = matches!(write, PendingWrite::Commit { .. });

        if let Err(e) = self.write_with_retry(&write).await {
            tracing::error!(
                session_id = %self.id,
                error = %e,
                "Final write failed; keeping content in memory"
            );
            let error = GatewayError::Persistence {
                session_id: self.id.clone(),
                reason: e.to_string(),
            };
            {
                let mut state = self.state.lock();
                state.pending = Some(write);
                state.last_status = Some(status);
            }
            let _ = events
                .send(GenerationEvent::Error {
                    kind: ErrorKind::Persistence,
                    message: error.to_string(),
                })
                .await;
            return Err(error);
        }

        self.state.lock().last_status = Some(status.clone());

        match &status {
            StreamStatus::Completed => {
                if let Err(e) = self.deps.store.touch(&self.id, now_ms()).await {
                    tracing::warn!(session_id = %self.id, error = %e, "Failed to record activity");
                }
                if title.is_none() {
                    self.assign_title(history, events).await;
                }
                let _ = events.send(GenerationEvent::Done).await;
            }
            StreamStatus::Failed { kind, message } => {
                let _ = events
                    .send(GenerationEvent::Error {
                        kind: *kind,
                        message: message.clone(),
                    })
                    .await;
            }
            StreamStatus::Cancelled => {}
        }

        Ok(GenerationOutcome {
            status,
            content,
            tokens,
            message_id: kept.then_some(message_id),
        })
    }

    async fn assign_title(&self, history: &[Message], events: &mpsc::Sender<GenerationEvent>) {
        let Some(title) = history
            .iter()
            .find(|m| m.role == MessageRole::User)
            .and_then(|m| derive_title(&m.content))
        else {
            return;
        };

        match self.deps.store.set_title(&self.id, &title).await {
            Ok(()) => {
                let _ = events.send(GenerationEvent::Title(title)).await;
            }
            Err(e) => tracing::warn!(session_id = %self.id, error = %e, "Failed to store title"),
        }
    }

    async fn write_with_retry(&self, write: &PendingWrite) -> Result<()> {
        match self.apply(write).await {
            Ok(()) => Ok(()),
            Err(first) => {
                tracing::warn!(session_id = %self.id, error = %first, "Final write failed, retrying");
                self.apply(write).await
            }
        }
    }

    async fn apply(&self, write: &PendingWrite) -> Result<()> {
        match write {
            PendingWrite::Commit {
                message_id,
                content,
                status,
            } => {
                self.deps
                    .store
                    .finalize_message(&self.id, message_id, content, *status)
                    .await
            }
            PendingWrite::Discard { message_id } => {
                self.deps.store.remove_message(&self.id, message_id).await
            }
        }
    }
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("id", &self.id)
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

/// Title from the first line of a user message
///
/// Whitespace is collapsed and the text is cut at a word boundary so the
/// result has at most [`MAX_TITLE_CHARS`] characters.
#[must_use]
pub fn derive_title(text: &str) -> Option<String> {
    let line = text.lines().find(|l| !l.trim().is_empty())?;
    let collapsed = line.split_whitespace().collect::<Vec<_>>().join(" ");

    if collapsed.chars().count() <= MAX_TITLE_CHARS {
        return Some(collapsed);
    }

    let mut title = String::new();
    for word in collapsed.split(' ') {
        let extra = usize::from(!title.is_empty()) + word.chars().count();
        if title.chars().count() + extra > MAX_TITLE_CHARS {
            break;
        }
        if !title.is_empty() {
            title.push(' ');
        }
        title.push_str(word);
    }

    if title.is_empty() {
        // A single word longer than the limit
        title = collapsed.chars().take(MAX_TITLE_CHARS).collect();
    }
    Some(title)
}
