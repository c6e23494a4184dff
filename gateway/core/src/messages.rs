//! Gateway Data Model
//!
//! Identifiers, persisted conversation messages, sessions and provider
//! selection. These types cross every boundary of the core: the store keeps
//! them, the session mutates them, and the daemon serializes them.

use serde::{Deserialize, Serialize};

/// Session identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    /// Generate a new unique session ID
    #[must_use]
    pub fn new() -> Self {
        Self(format!("session_{}", uuid::Uuid::new_v4().simple()))
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Message identifier
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Generate a new unique message ID
    #[must_use]
    pub fn new() -> Self {
        use std::sync::atomic::{AtomicU64, Ordering};
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, Ordering::SeqCst);
        Self(format!("msg_{id}"))
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// Who sent a message
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    /// Instructions or injected context
    System,
    /// User input
    User,
    /// Model output
    Assistant,
}

impl MessageRole {
    /// Wire name shared by every supported vendor
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// Lifecycle of a persisted message
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// Assistant placeholder still receiving tokens
    Streaming,
    /// Committed normally
    #[default]
    Complete,
    /// Committed after a stop; holds exactly the delivered tokens
    Cancelled,
    /// Committed after a failure; holds the partial content
    Errored,
}

/// A message in the conversation
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Unique message ID
    pub id: MessageId,
    /// Who sent this message
    pub role: MessageRole,
    /// Message content
    pub content: String,
    /// Opaque attachment reference supplied by the client
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<serde_json::Value>,
    /// Monotonic creation order within the store
    pub created_order: u64,
    /// Lifecycle status
    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    /// Create a committed user message
    pub fn user(content: impl Into<String>, attachments: Option<serde_json::Value>) -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::User,
            content: content.into(),
            attachments,
            created_order: 0,
            status: MessageStatus::Complete,
        }
    }

    /// Create a committed assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            id: MessageId::new(),
            role: MessageRole::Assistant,
            content: content.into(),
            attachments: None,
            created_order: 0,
            status: MessageStatus::Complete,
        }
    }

    /// Create an empty assistant placeholder for a starting stream
    #[must_use]
    pub fn streaming_placeholder() -> Self {
        Self {
            status: MessageStatus::Streaming,
            ..Self::assistant(String::new())
        }
    }

    /// Whether the message is still receiving tokens
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.status == MessageStatus::Streaming
    }
}

/// Supported vendor families
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Ollama `/api/chat` (newline-delimited JSON)
    #[default]
    Ollama,
    /// OpenAI-compatible `/chat/completions` (SSE with `[DONE]` sentinel)
    #[serde(alias = "openai")]
    OpenAiCompatible,
    /// Anthropic `/v1/messages` (SSE with typed events)
    Anthropic,
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ollama => write!(f, "ollama"),
            Self::OpenAiCompatible => write!(f, "openai_compatible"),
            Self::Anthropic => write!(f, "anthropic"),
        }
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ollama" => Ok(Self::Ollama),
            "openai" | "openai_compatible" | "openai-compatible" => Ok(Self::OpenAiCompatible),
            "anthropic" => Ok(Self::Anthropic),
            other => Err(format!("unknown provider kind: {other}")),
        }
    }
}

/// Which vendor to call and how to reach it
///
/// `credential_env` names the environment variable holding the API key. The
/// secret itself never enters the data model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Vendor family (selects the wire format)
    pub kind: ProviderKind,
    /// Base URL of the vendor API
    pub endpoint: String,
    /// Model identifier
    pub model: String,
    /// Environment variable holding the credential
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_env: Option<String>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            kind: ProviderKind::Ollama,
            endpoint: "http://localhost:11434".to_string(),
            model: "llama3.2".to_string(),
            credential_env: None,
        }
    }
}

impl ProviderConfig {
    /// Create a provider configuration
    pub fn new(kind: ProviderKind, endpoint: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            kind,
            endpoint: endpoint.into(),
            model: model.into(),
            credential_env: None,
        }
    }

    /// Set the environment variable that holds the credential
    #[must_use]
    pub fn with_credential_env(mut self, var: impl Into<String>) -> Self {
        self.credential_env = Some(var.into());
        self
    }

    /// Restrict a client-supplied override to the credential of `trusted`
    ///
    /// The override keeps `trusted`'s credential reference only when it
    /// targets the same vendor family and endpoint. Any other reference is
    /// dropped, so a client can never name an environment variable itself.
    #[must_use]
    pub fn confined_to(mut self, trusted: &ProviderConfig) -> Self {
        self.credential_env = if self.kind == trusted.kind
            && self.endpoint.trim_end_matches('/') == trusted.endpoint.trim_end_matches('/')
        {
            trusted.credential_env.clone()
        } else {
            None
        };
        self
    }

    /// Resolve the credential from the environment
    #[must_use]
    pub fn resolve_credential(&self) -> Option<String> {
        self.credential_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|key| !key.is_empty())
    }
}

/// A conversation session as persisted by the store
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChatSession {
    /// Unique session ID
    pub id: SessionId,
    /// Owning user (scopes document retrieval)
    pub owner: String,
    /// Conversation history in creation order
    pub messages: Vec<Message>,
    /// When the session last completed a generation (Unix timestamp ms)
    pub last_activity: u64,
    /// Default provider for this session
    pub provider: ProviderConfig,
    /// Display title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

impl ChatSession {
    /// Create an empty session
    pub fn new(owner: impl Into<String>, provider: ProviderConfig) -> Self {
        Self {
            id: SessionId::new(),
            owner: owner.into(),
            messages: Vec::new(),
            last_activity: now_ms(),
            provider,
            title: None,
        }
    }

    /// Use a specific session ID
    #[must_use]
    pub fn with_id(mut self, id: SessionId) -> Self {
        self.id = id;
        self
    }
}

/// Get current timestamp in milliseconds
pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
