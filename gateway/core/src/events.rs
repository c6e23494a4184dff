//! Generation Events
//!
//! The canonical outbound event stream, plus the inbound request shapes the
//! edge deserializes. Every event renders as one SSE frame:
//!
//! ```text
//! data: {"content":"Hel"}
//!
//! data: {"title":"Weather in Lisbon"}
//!
//! data: [DONE]
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::messages::{MessageId, ProviderConfig};
use crate::retrieval::RetrievalOptions;
use crate::streaming::StreamStatus;

/// SSE terminator payload
pub const DONE_SENTINEL: &str = "[DONE]";

/// One event of a running generation
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GenerationEvent {
    /// Token text, in arrival order
    Token(String),
    /// The session got a title
    Title(String),
    /// The generation completed
    Done,
    /// The generation failed
    Error {
        /// Failure class
        kind: ErrorKind,
        /// Human-readable reason
        message: String,
    },
}

impl GenerationEvent {
    /// Payload of the SSE `data:` field
    #[must_use]
    pub fn sse_data(&self) -> String {
        match self {
            Self::Token(content) => serde_json::json!({ "content": content }).to_string(),
            Self::Title(title) => serde_json::json!({ "title": title }).to_string(),
            Self::Done => DONE_SENTINEL.to_string(),
            Self::Error { message, .. } => serde_json::json!({ "error": message }).to_string(),
        }
    }

    /// Full SSE frame, including the terminating blank line
    #[must_use]
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.sse_data())
    }

    /// Whether no further events follow this one
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error { .. })
    }
}

/// Body of a send request
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendRequest {
    /// User message text
    pub content: String,
    /// Opaque attachment reference stored with the user message
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<serde_json::Value>,
    /// Retrieval switches for this request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalOptions>,
    /// Provider override for this request
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConfig>,
}

impl SendRequest {
    /// A plain text request
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    /// Request retrieval for this message
    #[must_use]
    pub fn with_retrieval(mut self, retrieval: RetrievalOptions) -> Self {
        self.retrieval = Some(retrieval);
        self
    }

    /// Use a different provider for this message
    #[must_use]
    pub fn with_provider(mut self, provider: ProviderConfig) -> Self {
        self.provider = Some(provider);
        self
    }
}

/// Body of a regenerate request
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateRequest {
    /// Index of the message to regenerate from
    pub target_index: usize,
    /// Retrieval switches for the new generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retrieval: Option<RetrievalOptions>,
    /// Provider override for the new generation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<ProviderConfig>,
}

impl RegenerateRequest {
    /// Regenerate from `target_index`
    #[must_use]
    pub fn at(target_index: usize) -> Self {
        Self {
            target_index,
            ..Self::default()
        }
    }
}

/// Result of one generation
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationOutcome {
    /// Terminal status
    pub status: StreamStatus,
    /// Accumulated (and delivered) content
    pub content: String,
    /// Tokens delivered to the caller
    pub tokens: usize,
    /// The committed assistant message, if one was kept
    pub message_id: Option<MessageId>,
}
