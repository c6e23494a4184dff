//! Provider Backend Traits
//!
//! The canonical request/token types shared by every vendor adapter, and the
//! [`Connector`] seam that opens the vendor byte stream. Production uses
//! [`HttpConnector`](super::HttpConnector); tests replay scripted chunks.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use super::ProviderAdapter;
use crate::error::Result;
use crate::messages::{MessageRole, ProviderConfig};

/// A fragment of generated text in arrival order
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CanonicalToken {
    /// The text fragment (may be empty on the final token)
    pub content: String,
    /// Whether this token closes the stream
    pub is_final: bool,
}

impl CanonicalToken {
    /// A content token
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_final: false,
        }
    }

    /// The closing token, optionally carrying trailing text
    pub fn last(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_final: true,
        }
    }
}

/// One turn of the outbound prompt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChatTurn {
    /// Speaker
    pub role: MessageRole,
    /// Turn text
    pub content: String,
}

impl ChatTurn {
    /// Create a turn
    pub fn new(role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Vendor-independent generation request
#[derive(Clone, Debug)]
pub struct GenerationRequest {
    /// Model to use (vendor-specific identifier)
    pub model: String,
    /// Prompt turns in order (system and context turns first)
    pub turns: Vec<ChatTurn>,
    /// Whether to request a streamed response
    pub stream: bool,
    /// Maximum tokens in response (0 = vendor default)
    pub max_tokens: u32,
    /// Sampling temperature, when overridden
    pub temperature: Option<f32>,
}

impl GenerationRequest {
    /// Create a streaming request
    pub fn new(model: impl Into<String>, turns: Vec<ChatTurn>) -> Self {
        Self {
            model: model.into(),
            turns,
            stream: true,
            max_tokens: 0,
            temperature: None,
        }
    }

    /// Set streaming mode
    #[must_use]
    pub fn with_stream(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Set max tokens
    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Set temperature
    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature.clamp(0.0, 2.0));
        self
    }
}

/// Raw vendor bytes as they arrive from the network
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// Opens a vendor connection
///
/// Dropping the returned stream must release the underlying connection.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Send the request and return the response body as a byte stream
    ///
    /// Non-success responses are reported as `GatewayError::Upstream`.
    async fn connect(
        &self,
        provider: &ProviderConfig,
        adapter: &ProviderAdapter,
        request: &GenerationRequest,
    ) -> Result<ByteStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_request_builder() {
        let request = GenerationRequest::new("llama3.2", vec![ChatTurn::new(MessageRole::User, "Hi")])
            .with_stream(false)
            .with_temperature(5.0)
            .with_max_tokens(64);

        assert_eq!(request.model, "llama3.2");
        assert!(!request.stream);
        assert_eq!(request.max_tokens, 64);
        assert_eq!(request.temperature, Some(2.0));
        assert_eq!(request.turns.len(), 1);
    }

    #[test]
    fn test_token_constructors() {
        assert!(!CanonicalToken::text("a").is_final);
        assert!(CanonicalToken::last("").is_final);
    }
}
