//! LLM Provider Backends
//!
//! Translates canonical generation requests into vendor wire formats and
//! vendor stream bytes back into [`CanonicalToken`]s.
//!
//! # Available Framings
//!
//! - **Ollama**: newline-delimited JSON, `done: true` ends the stream
//! - **OpenAI-compatible**: SSE `data:` lines, `data: [DONE]` ends the stream
//! - **Anthropic**: SSE typed events, the stream ends on connection close
//!
//! The framing is fixed by [`ProviderKind`] when the [`ProviderAdapter`] is
//! built; it is never guessed from payload shape.
//!
//! # Usage
//!
//! ```ignore
//! use gateway_core::backend::{ChunkParser, ProviderAdapter};
//! use gateway_core::messages::ProviderKind;
//!
//! let adapter = ProviderAdapter::for_kind(ProviderKind::Ollama);
//! let mut parser = ChunkParser::new(adapter);
//! let tokens = parser.parse_chunk(b"{\"message\":{\"content\":\"Hi\"},\"done\":false}\n")?;
//! ```

mod anthropic;
mod frame;
mod http;
mod ollama;
mod openai;
mod traits;

pub use anthropic::AnthropicFrame;
pub use frame::{
    ChunkParser, FrameOutcome, LineBuffer, DEFAULT_MAX_CONSECUTIVE_BAD_FRAMES,
    DEFAULT_MAX_FRAME_BYTES,
};
pub use http::HttpConnector;
pub use ollama::OllamaFrame;
pub use openai::OpenAiCompatibleFrame;
pub use traits::{ByteStream, CanonicalToken, ChatTurn, Connector, GenerationRequest};

use crate::error::Result;
use crate::messages::{ProviderConfig, ProviderKind};

/// Longest vendor error text kept in an `Upstream` error
const MAX_ERROR_TEXT: usize = 512;

/// Vendor-specific request building and frame decoding
pub trait WireFormat {
    /// Human-readable vendor name for logs
    fn name(&self) -> &'static str;

    /// Full URL of the generation endpoint under `base`
    fn endpoint_url(&self, base: &str) -> String;

    /// JSON request body in vendor format
    fn request_body(&self, request: &GenerationRequest) -> serde_json::Value;

    /// Attach vendor authentication headers
    fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
        credential: Option<&str>,
    ) -> reqwest::RequestBuilder {
        match credential {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// Decode one complete, non-blank line
    fn decode_line(&self, line: &str) -> FrameOutcome;

    /// Whether a clean connection close is a normal end of stream
    fn ends_on_close(&self) -> bool {
        false
    }

    /// Extract the full text from a non-streaming response body
    fn parse_full_response(&self, body: &serde_json::Value) -> Result<String>;
}

/// The framing used for one provider, chosen up front by kind
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProviderAdapter {
    /// Newline-delimited JSON
    Ollama(OllamaFrame),
    /// SSE with `[DONE]` sentinel
    OpenAiCompatible(OpenAiCompatibleFrame),
    /// SSE with typed events
    Anthropic(AnthropicFrame),
}

impl ProviderAdapter {
    /// Build the adapter for a provider kind
    #[must_use]
    pub fn for_kind(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Ollama => Self::Ollama(OllamaFrame),
            ProviderKind::OpenAiCompatible => Self::OpenAiCompatible(OpenAiCompatibleFrame),
            ProviderKind::Anthropic => Self::Anthropic(AnthropicFrame),
        }
    }

    /// The provider kind this adapter speaks
    #[must_use]
    pub fn kind(&self) -> ProviderKind {
        match self {
            Self::Ollama(_) => ProviderKind::Ollama,
            Self::OpenAiCompatible(_) => ProviderKind::OpenAiCompatible,
            Self::Anthropic(_) => ProviderKind::Anthropic,
        }
    }

    fn format(&self) -> &dyn WireFormat {
        match self {
            Self::Ollama(f) => f,
            Self::OpenAiCompatible(f) => f,
            Self::Anthropic(f) => f,
        }
    }

    /// Vendor name for logs
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.format().name()
    }

    /// Full generation endpoint URL
    #[must_use]
    pub fn endpoint_url(&self, base: &str) -> String {
        self.format().endpoint_url(base)
    }

    /// Vendor JSON request body
    #[must_use]
    pub fn request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        self.format().request_body(request)
    }

    /// Decode one complete line
    #[must_use]
    pub fn decode_line(&self, line: &str) -> FrameOutcome {
        self.format().decode_line(line)
    }

    /// Whether connection close ends the stream normally
    #[must_use]
    pub fn ends_on_close(&self) -> bool {
        self.format().ends_on_close()
    }

    /// Extract the full text of a non-streaming response
    pub fn parse_full_response(&self, body: &serde_json::Value) -> Result<String> {
        self.format().parse_full_response(body)
    }

    /// Build the outbound HTTP request for `provider`
    #[must_use]
    pub fn build_request(
        &self,
        client: &reqwest::Client,
        provider: &ProviderConfig,
        request: &GenerationRequest,
    ) -> reqwest::RequestBuilder {
        let builder = client
            .post(self.endpoint_url(&provider.endpoint))
            .json(&self.request_body(request));
        let credential = provider.resolve_credential();
        self.format().authorize(builder, credential.as_deref())
    }
}

/// Classification of one SSE line
pub(crate) enum SseLine<'a> {
    /// `data:` payload with the single optional leading space removed
    Data(&'a str),
    /// `event:`, `id:`, `retry:` or a `:` comment
    Other,
    /// Not an SSE field at all
    Unknown,
}

pub(crate) fn sse_field(line: &str) -> SseLine<'_> {
    if let Some(data) = line.strip_prefix("data:") {
        return SseLine::Data(data.strip_prefix(' ').unwrap_or(data));
    }
    if line.starts_with(':')
        || line.starts_with("event:")
        || line.starts_with("id:")
        || line.starts_with("retry:")
    {
        return SseLine::Other;
    }
    SseLine::Unknown
}

/// Pull the human-readable message out of a vendor error body
///
/// Understands `{"error":{"message":..}}`, `{"error":".."}` and
/// `{"message":".."}`; anything else is returned as trimmed raw text.
#[must_use]
pub fn upstream_error_message(body: &str) -> String {
    let parsed = serde_json::from_str::<serde_json::Value>(body).ok();
    let extracted = parsed.as_ref().and_then(|v| {
        v.get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(serde_json::Value::as_str)
            .or_else(|| v.get("message").and_then(serde_json::Value::as_str))
            .map(String::from)
    });

    let text = extracted.unwrap_or_else(|| body.trim().to_string());
    if text.len() > MAX_ERROR_TEXT {
        let mut end = MAX_ERROR_TEXT;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_kind_roundtrip() {
        for kind in [
            ProviderKind::Ollama,
            ProviderKind::OpenAiCompatible,
            ProviderKind::Anthropic,
        ] {
            assert_eq!(ProviderAdapter::for_kind(kind).kind(), kind);
        }
    }

    #[test]
    fn test_only_typed_events_end_on_close() {
        assert!(!ProviderAdapter::for_kind(ProviderKind::Ollama).ends_on_close());
        assert!(!ProviderAdapter::for_kind(ProviderKind::OpenAiCompatible).ends_on_close());
        assert!(ProviderAdapter::for_kind(ProviderKind::Anthropic).ends_on_close());
    }

    #[test]
    fn test_sse_field() {
        assert!(matches!(sse_field("data: {}"), SseLine::Data("{}")));
        assert!(matches!(sse_field("data:{}"), SseLine::Data("{}")));
        assert!(matches!(sse_field(": ping"), SseLine::Other));
        assert!(matches!(sse_field("event: delta"), SseLine::Other));
        assert!(matches!(sse_field("{}"), SseLine::Unknown));
    }

    #[test]
    fn test_upstream_error_message() {
        assert_eq!(
            upstream_error_message(r#"{"error":{"message":"bad key","type":"auth"}}"#),
            "bad key"
        );
        assert_eq!(
            upstream_error_message(r#"{"error":"model 'x' not found"}"#),
            "model 'x' not found"
        );
        assert_eq!(upstream_error_message(r#"{"message":"nope"}"#), "nope");
        assert_eq!(upstream_error_message("  Bad Gateway \n"), "Bad Gateway");

        let long = "é".repeat(400);
        assert!(upstream_error_message(&long).ends_with("..."));
    }

    #[test]
    fn test_build_request_targets_vendor_endpoint() {
        let client = reqwest::Client::new();
        let provider = ProviderConfig::new(
            ProviderKind::Anthropic,
            "https://api.anthropic.com",
            "claude-sonnet",
        );
        let adapter = ProviderAdapter::for_kind(provider.kind);
        let request = adapter
            .build_request(&client, &provider, &GenerationRequest::new("claude-sonnet", vec![]))
            .build()
            .unwrap();

        assert_eq!(request.url().as_str(), "https://api.anthropic.com/v1/messages");
        assert_eq!(
            request.headers().get("anthropic-version").unwrap(),
            "2023-06-01"
        );
    }

    #[test]
    fn test_client_override_cannot_name_credential() {
        let trusted = ProviderConfig::new(
            ProviderKind::OpenAiCompatible,
            "https://api.openai.com/v1",
            "gpt-4o-mini",
        )
        .with_credential_env("OPENAI_API_KEY");
        let incoming: ProviderConfig = serde_json::from_value(serde_json::json!({
            "kind": "openai",
            "endpoint": "https://elsewhere.example",
            "model": "gpt-4o-mini",
            "credential_env": "PATH"
        }))
        .unwrap();

        let provider = incoming.confined_to(&trusted);
        assert!(provider.credential_env.is_none());

        let client = reqwest::Client::new();
        let adapter = ProviderAdapter::for_kind(provider.kind);
        let request = adapter
            .build_request(&client, &provider, &GenerationRequest::new("gpt-4o-mini", vec![]))
            .build()
            .unwrap();
        assert_eq!(request.url().as_str(), "https://elsewhere.example/chat/completions");
        assert!(request.headers().get("authorization").is_none());
    }
}
