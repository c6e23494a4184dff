//! Message Store
//!
//! Persistence seam for sessions and messages. The core only needs the
//! operations below; any schema beyond them belongs to the store.
//!
//! Committed messages are immutable. The only message whose content may
//! change is the newest assistant message while it is still `Streaming`.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{GatewayError, Result};
use crate::messages::{ChatSession, Message, MessageId, MessageStatus, SessionId};

/// Persistence operations used by the core
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Persist a new session
    async fn create_session(&self, session: &ChatSession) -> Result<()>;

    /// Load a session with its full history
    async fn load_session(&self, session_id: &SessionId) -> Result<ChatSession>;

    /// Append a message; the store assigns `created_order`
    async fn append_message(&self, session_id: &SessionId, message: Message) -> Result<Message>;

    /// Replace the content of a `Streaming` message
    async fn update_streaming_message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        content: &str,
    ) -> Result<()>;

    /// Commit a `Streaming` message with its final content and status
    async fn finalize_message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        content: &str,
        status: MessageStatus,
    ) -> Result<()>;

    /// Delete a message
    async fn remove_message(&self, session_id: &SessionId, message_id: &MessageId) -> Result<()>;

    /// Delete every message after `index`; returns how many were removed
    async fn truncate_after(&self, session_id: &SessionId, index: usize) -> Result<usize>;

    /// Record activity at `at_ms`
    async fn touch(&self, session_id: &SessionId, at_ms: u64) -> Result<()>;

    /// Set the display title
    async fn set_title(&self, session_id: &SessionId, title: &str) -> Result<()>;
}

// ============================================================================
// In-memory implementation
// ============================================================================

/// Process-memory store
///
/// Used by the daemon when no external store is configured and by tests,
/// which can make the next N commits fail with
/// [`fail_next_commits`](Self::fail_next_commits).
#[derive(Debug, Default)]
pub struct InMemoryStore {
    sessions: DashMap<SessionId, ChatSession>,
    next_order: AtomicU64,
    failing_commits: AtomicU32,
}

impl InMemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` finalize/remove calls fail
    pub fn fail_next_commits(&self, count: u32) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    /// Number of stored sessions
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    fn injected_failure(&self) -> Result<()> {
        let consumed = self
            .failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(GatewayError::Store("injected commit failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn with_session<T>(
        &self,
        session_id: &SessionId,
        f: impl FnOnce(&mut ChatSession) -> Result<T>,
    ) -> Result<T> {
        let mut session = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.clone()))?;
        f(session.value_mut())
    }
}

fn streaming_message<'a>(
    session: &'a mut ChatSession,
    message_id: &MessageId,
) -> Result<&'a mut Message> {
    let message = session
        .messages
        .iter_mut()
        .find(|m| &m.id == message_id)
        .ok_or_else(|| GatewayError::Store(format!("message {} not found", message_id.0)))?;

    if !message.is_streaming() {
        return Err(GatewayError::Store(format!(
            "message {} is already committed",
            message_id.0
        )));
    }
    Ok(message)
}

#[async_trait]
impl MessageStore for InMemoryStore {
    async fn create_session(&self, session: &ChatSession) -> Result<()> {
        self.sessions.insert(session.id.clone(), session.clone());
        Ok(())
    }

    async fn load_session(&self, session_id: &SessionId) -> Result<ChatSession> {
        self.sessions
            .get(session_id)
            .map(|s| s.clone())
            .ok_or_else(|| GatewayError::SessionNotFound(session_id.clone()))
    }

    async fn append_message(&self, session_id: &SessionId, mut message: Message) -> Result<Message> {
        self.with_session(session_id, |session| {
            message.created_order = self.next_order.fetch_add(1, Ordering::SeqCst);
            session.messages.push(message.clone());
            Ok(message)
        })
    }

    async fn update_streaming_message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        content: &str,
    ) -> Result<()> {
        self.with_session(session_id, |session| {
            streaming_message(session, message_id)?.content = content.to_string();
            Ok(())
        })
    }

    async fn finalize_message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        content: &str,
        status: MessageStatus,
    ) -> Result<()> {
        self.injected_failure()?;
        self.with_session(session_id, |session| {
            let message = streaming_message(session, message_id)?;
            message.content = content.to_string();
            message.status = status;
            Ok(())
        })
    }

    async fn remove_message(&self, session_id: &SessionId, message_id: &MessageId) -> Result<()> {
        self.injected_failure()?;
        self.with_session(session_id, |session| {
            session.messages.retain(|m| &m.id != message_id);
            Ok(())
        })
    }

    async fn truncate_after(&self, session_id: &SessionId, index: usize) -> Result<usize> {
        self.with_session(session_id, |session| {
            let keep = (index + 1).min(session.messages.len());
            let removed = session.messages.len() - keep;
            session.messages.truncate(keep);
            Ok(removed)
        })
    }

    async fn touch(&self, session_id: &SessionId, at_ms: u64) -> Result<()> {
        self.with_session(session_id, |session| {
            session.last_activity = at_ms;
            Ok(())
        })
    }

    async fn set_title(&self, session_id: &SessionId, title: &str) -> Result<()> {
        self.with_session(session_id, |session| {
            session.title = Some(title.to_string());
            Ok(())
        })
    }
}
