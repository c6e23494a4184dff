//! Chat Gateway
//!
//! Process-scoped service that owns one [`ConversationSession`] per session
//! id together with the shared collaborators. The cancellation registry lives
//! here, so a stop request can reach a generation that is being served on a
//! different connection.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::backend::Connector;
use crate::error::{GatewayError, Result};
use crate::events::{GenerationEvent, GenerationOutcome, RegenerateRequest, SendRequest};
use crate::messages::{ChatSession, ProviderConfig, SessionId};
use crate::retrieval::RetrievalInjector;
use crate::session::{Collaborators, ConversationSession, SessionConfig, SessionPhase};
use crate::store::MessageStore;
use crate::streaming::{CancellationRegistry, DispatcherConfig};

/// Entry point for all conversation operations
pub struct ChatGateway {
    deps: Collaborators,
    session_config: SessionConfig,
    dispatcher_config: DispatcherConfig,
    default_provider: ProviderConfig,
    sessions: DashMap<SessionId, Arc<ConversationSession>>,
}

impl ChatGateway {
    /// Create a gateway with default settings and no retrieval
    pub fn new(store: Arc<dyn MessageStore>, connector: Arc<dyn Connector>) -> Self {
        Self {
            deps: Collaborators {
                store,
                connector,
                retrieval: RetrievalInjector::disabled(),
                registry: CancellationRegistry::new(),
            },
            session_config: SessionConfig::default(),
            dispatcher_config: DispatcherConfig::default(),
            default_provider: ProviderConfig::default(),
            sessions: DashMap::new(),
        }
    }

    /// Use a retrieval injector
    #[must_use]
    pub fn with_retrieval(mut self, retrieval: RetrievalInjector) -> Self {
        self.deps.retrieval = retrieval;
        self
    }

    /// Use session settings
    #[must_use]
    pub fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session_config = config;
        self
    }

    /// Use dispatcher settings
    #[must_use]
    pub fn with_dispatcher_config(mut self, config: DispatcherConfig) -> Self {
        self.dispatcher_config = config;
        self
    }

    /// Provider for sessions created without one
    #[must_use]
    pub fn with_default_provider(mut self, provider: ProviderConfig) -> Self {
        self.default_provider = provider;
        self
    }

    /// Shared cancellation registry
    #[must_use]
    pub fn registry(&self) -> &CancellationRegistry {
        &self.deps.registry
    }

    /// Create and store a new session
    pub async fn create_session(
        &self,
        owner: impl Into<String>,
        provider: Option<ProviderConfig>,
        title: Option<String>,
    ) -> Result<ChatSession> {
        let provider = match provider {
            Some(provider) => provider.confined_to(&self.default_provider),
            None => self.default_provider.clone(),
        };
        let mut session = ChatSession::new(owner, provider);
        session.title = title.filter(|t| !t.trim().is_empty());
        self.deps.store.create_session(&session).await?;

        tracing::info!(
            session_id = %session.id,
            provider = %session.provider.kind,
            "Created session"
        );
        Ok(session)
    }

    /// Stored state of a session
    pub async fn snapshot(&self, session_id: &SessionId) -> Result<ChatSession> {
        self.deps.store.load_session(session_id).await
    }

    /// Session driver, loaded from the store on first use
    pub async fn session(&self, session_id: &SessionId) -> Result<Arc<ConversationSession>> {
        if let Some(session) = self.sessions.get(session_id) {
            return Ok(Arc::clone(session.value()));
        }

        // Fails with SessionNotFound for unknown ids
        self.deps.store.load_session(session_id).await?;
        let session = self
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| self.driver(session_id.clone()));
        Ok(Arc::clone(session.value()))
    }

    /// Refuse early when a session cannot start a generation right now
    ///
    /// Unlike [`session`](Self::session) this never caches a driver. The
    /// session re-checks under its own lock when the generation starts.
    pub async fn ensure_ready(&self, session_id: &SessionId) -> Result<()> {
        let cached = self.sessions.get(session_id).map(|s| Arc::clone(s.value()));
        let Some(session) = cached else {
            // Fails with SessionNotFound for unknown ids
            self.deps.store.load_session(session_id).await?;
            return Ok(());
        };
        if session.phase() != SessionPhase::Idle {
            return Err(GatewayError::SessionBusy(session_id.clone()));
        }
        if session.has_pending_write() {
            return Err(GatewayError::PendingWrite(session_id.clone()));
        }
        Ok(())
    }

    /// Send a user message, streaming the reply into `events`
    pub async fn send(
        &self,
        session_id: &SessionId,
        request: SendRequest,
        events: mpsc::Sender<GenerationEvent>,
    ) -> Result<GenerationOutcome> {
        let session = self.session(session_id).await?;
        let outcome = session.send(request, events).await;
        drop(session);
        self.evict_if_idle(session_id);
        outcome
    }

    /// Regenerate the reply to the user message at or before the target index
    pub async fn regenerate(
        &self,
        session_id: &SessionId,
        request: RegenerateRequest,
        events: mpsc::Sender<GenerationEvent>,
    ) -> Result<GenerationOutcome> {
        let session = self.session(session_id).await?;
        let outcome = session.regenerate(request, events).await;
        drop(session);
        self.evict_if_idle(session_id);
        outcome
    }

    /// Stop the in-flight generation of a session
    ///
    /// Returns `false` when nothing was running.
    pub fn stop(&self, session_id: &SessionId) -> bool {
        match self.sessions.get(session_id) {
            Some(session) => session.stop(),
            None => false,
        }
    }

    /// Flush a session's pending final write
    pub async fn retry_persist(&self, session_id: &SessionId) -> Result<bool> {
        let session = self.session(session_id).await?;
        let flushed = session.retry_persist().await;
        drop(session);
        self.evict_if_idle(session_id);
        flushed
    }

    /// Number of generations in flight
    #[must_use]
    pub fn active_generations(&self) -> usize {
        self.deps.registry.active_count()
    }

    /// Number of session drivers currently cached
    #[must_use]
    pub fn cached_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Forget the driver of a session that has nothing left to do
    ///
    /// A driver still held by another caller or holding a pending write
    /// stays cached. Evicted drivers are rebuilt from the store on next use.
    fn evict_if_idle(&self, session_id: &SessionId) {
        let evicted = self.sessions.remove_if(session_id, |_, session| {
            Arc::strong_count(session) == 1 && !session.has_pending_write()
        });
        if evicted.is_some() {
            tracing::trace!(session_id = %session_id, "Evicted idle session driver");
        }
    }

    fn driver(&self, session_id: SessionId) -> Arc<ConversationSession> {
        Arc::new(ConversationSession::new(
            session_id,
            self.deps.clone(),
            self.session_config.clone(),
            self.dispatcher_config.clone(),
        ))
    }
}

impl std::fmt::Debug for ChatGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatGateway")
            .field("sessions", &self.sessions.len())
            .field("active", &self.deps.registry.active_count())
            .finish_non_exhaustive()
    }
}
