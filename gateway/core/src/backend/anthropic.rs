//! Anthropic Wire Format
//!
//! `/v1/messages` streams typed server-sent events. Only `content_block_delta`
//! frames carry text (`delta.text`); every other event type is ignored. The
//! stream ends when the connection closes (`message_stop` is accepted as an
//! early end as well).
//!
//! ```text
//! event: content_block_delta
//! data: {"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hi"}}
//! ```

use serde::Deserialize;
use serde_json::json;

use super::frame::FrameOutcome;
use super::traits::GenerationRequest;
use super::{sse_field, SseLine, WireFormat};
use crate::error::{GatewayError, Result};
use crate::messages::MessageRole;

/// API version header value
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// `max_tokens` is mandatory for this vendor
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Event type that carries token text
const CONTENT_DELTA: &str = "content_block_delta";

/// Anthropic typed-event SSE framing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AnthropicFrame;

#[derive(Debug, Deserialize)]
struct StreamEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    delta: Option<EventDelta>,
    #[serde(default)]
    error: Option<EventError>,
}

#[derive(Debug, Deserialize)]
struct EventDelta {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct EventError {
    #[serde(default)]
    message: String,
}

impl WireFormat for AnthropicFrame {
    fn name(&self) -> &'static str {
        "Anthropic"
    }

    fn endpoint_url(&self, base: &str) -> String {
        format!("{}/v1/messages", base.trim_end_matches('/'))
    }

    fn request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let system: Vec<&str> = request
            .turns
            .iter()
            .filter(|turn| turn.role == MessageRole::System)
            .map(|turn| turn.content.as_str())
            .collect();

        // Consecutive same-role turns are merged; the API expects alternation
        let mut messages: Vec<(MessageRole, String)> = Vec::new();
        for turn in request.turns.iter().filter(|t| t.role != MessageRole::System) {
            match messages.last_mut() {
                Some((role, content)) if *role == turn.role => {
                    content.push_str("\n\n");
                    content.push_str(&turn.content);
                }
                _ => messages.push((turn.role, turn.content.clone())),
            }
        }
        let messages: Vec<_> = messages
            .into_iter()
            .map(|(role, content)| json!({ "role": role.as_str(), "content": content }))
            .collect();

        let max_tokens = if request.max_tokens > 0 {
            request.max_tokens
        } else {
            DEFAULT_MAX_TOKENS
        };

        let mut body = json!({
            "model": request.model,
            "max_tokens": max_tokens,
            "messages": messages,
            "stream": request.stream,
        });
        if !system.is_empty() {
            body["system"] = json!(system.join("\n\n"));
        }
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature.min(1.0));
        }
        body
    }

    fn authorize(
        &self,
        builder: reqwest::RequestBuilder,
        credential: Option<&str>,
    ) -> reqwest::RequestBuilder {
        let builder = builder.header("anthropic-version", ANTHROPIC_VERSION);
        match credential {
            Some(key) => builder.header("x-api-key", key),
            None => builder,
        }
    }

    fn decode_line(&self, line: &str) -> FrameOutcome {
        let data = match sse_field(line) {
            SseLine::Data(data) => data,
            SseLine::Other => return FrameOutcome::Skip,
            SseLine::Unknown => {
                return FrameOutcome::Malformed(format!("unexpected line: {line}"));
            }
        };

        let event: StreamEvent = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => return FrameOutcome::Malformed(e.to_string()),
        };

        match event.kind.as_str() {
            CONTENT_DELTA => match event.delta.and_then(|d| d.text) {
                Some(text) => FrameOutcome::Token(text),
                // input_json_delta and other non-text deltas
                None => FrameOutcome::Skip,
            },
            "message_stop" => FrameOutcome::Done(String::new()),
            "error" => FrameOutcome::Failed(GatewayError::Upstream {
                status: 0,
                message: event.error.map(|e| e.message).unwrap_or_default(),
            }),
            _ => FrameOutcome::Skip,
        }
    }

    fn ends_on_close(&self) -> bool {
        true
    }

    fn parse_full_response(&self, body: &serde_json::Value) -> Result<String> {
        let blocks = body
            .get("content")
            .and_then(serde_json::Value::as_array)
            .ok_or_else(|| GatewayError::Protocol("Anthropic response missing content".into()))?;

        Ok(blocks
            .iter()
            .filter(|b| b.get("type").and_then(serde_json::Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(serde_json::Value::as_str))
            .collect())
    }
}
