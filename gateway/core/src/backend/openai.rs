//! OpenAI-Compatible Wire Format
//!
//! `/chat/completions` with `"stream": true` answers with server-sent events.
//! Each event line is prefixed `data: `, carries a JSON delta with the token at
//! `choices[0].delta.content`, and the stream ends with the literal line
//! `data: [DONE]`.

use serde::Deserialize;
use serde_json::json;

use super::frame::FrameOutcome;
use super::traits::GenerationRequest;
use super::{sse_field, upstream_error_message, SseLine, WireFormat};
use crate::error::{GatewayError, Result};

/// End-of-stream sentinel payload
const DONE_SENTINEL: &str = "[DONE]";

/// OpenAI-compatible SSE framing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OpenAiCompatibleFrame;

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<Delta>,
}

#[derive(Debug, Deserialize)]
struct Delta {
    #[serde(default)]
    content: Option<String>,
}

impl WireFormat for OpenAiCompatibleFrame {
    fn name(&self) -> &'static str {
        "OpenAI-compatible"
    }

    fn endpoint_url(&self, base: &str) -> String {
        format!("{}/chat/completions", base.trim_end_matches('/'))
    }

    fn request_body(&self, request: &GenerationRequest) -> serde_json::Value {
        let messages: Vec<_> = request
            .turns
            .iter()
            .map(|turn| json!({ "role": turn.role.as_str(), "content": turn.content }))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "stream": request.stream,
        });
        if let Some(temperature) = request.temperature {
            body["temperature"] = json!(temperature);
        }
        if request.max_tokens > 0 {
            body["max_tokens"] = json!(request.max_tokens);
        }
        body
    }

    fn decode_line(&self, line: &str) -> FrameOutcome {
        let data = match sse_field(line) {
            SseLine::Data(data) => data,
            SseLine::Other => return FrameOutcome::Skip,
            SseLine::Unknown => {
                return FrameOutcome::Malformed(format!("unexpected line: {line}"));
            }
        };

        if data == DONE_SENTINEL {
            return FrameOutcome::Done(String::new());
        }

        let chunk: StreamChunk = match serde_json::from_str(data) {
            Ok(chunk) => chunk,
            Err(e) => return FrameOutcome::Malformed(e.to_string()),
        };

        if let Some(error) = chunk.error {
            return FrameOutcome::Failed(GatewayError::Upstream {
                status: 0,
                message: upstream_error_message(&error.to_string()),
            });
        }

        let text = chunk
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.delta)
            .and_then(|delta| delta.content);
        match text {
            Some(text) => FrameOutcome::Token(text),
            // Role-only deltas, finish_reason and usage chunks
            None => FrameOutcome::Skip,
        }
    }

    fn parse_full_response(&self, body: &serde_json::Value) -> Result<String> {
        body.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(serde_json::Value::as_str)
            .map(String::from)
            .ok_or_else(|| {
                GatewayError::Protocol("response missing choices[0].message.content".into())
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_url() {
        assert_eq!(
            OpenAiCompatibleFrame.endpoint_url("https://api.openai.com/v1"),
            "https://api.openai.com/v1/chat/completions"
        );
    }

    #[test]
    fn test_decode_delta() {
        match OpenAiCompatibleFrame
            .decode_line(r#"data: {"id":"c1","choices":[{"index":0,"delta":{"content":"Hel"}}]}"#)
        {
            FrameOutcome::Token(text) => assert_eq!(text, "Hel"),
            other => panic!("expected token, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_sentinel() {
        assert!(matches!(
            OpenAiCompatibleFrame.decode_line("data: [DONE]"),
            FrameOutcome::Done(_)
        ));
    }

    #[test]
    fn test_decode_non_content_frames_are_skipped() {
        for line in [
            r#"data: {"choices":[{"delta":{"role":"assistant"}}]}"#,
            r#"data: {"choices":[{"delta":{},"finish_reason":"stop"}]}"#,
            r#"data: {"choices":[],"usage":{"total_tokens":3}}"#,
            ": keep-alive",
            "event: message",
            "id: 7",
        ] {
            assert!(
                matches!(OpenAiCompatibleFrame.decode_line(line), FrameOutcome::Skip),
                "line should be skipped: {line}"
            );
        }
    }

    #[test]
    fn test_decode_malformed() {
        assert!(matches!(
            OpenAiCompatibleFrame.decode_line("data: {not json"),
            FrameOutcome::Malformed(_)
        ));
        assert!(matches!(
            OpenAiCompatibleFrame.decode_line("garbage"),
            FrameOutcome::Malformed(_)
        ));
    }

    #[test]
    fn test_decode_in_stream_error() {
        assert!(matches!(
            OpenAiCompatibleFrame
                .decode_line(r#"data: {"error":{"message":"overloaded","type":"server_error"}}"#),
            FrameOutcome::Failed(GatewayError::Upstream { .. })
        ));
    }

    #[test]
    fn test_parse_full_response() {
        let body = serde_json::json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Hello"}}]
        });
        assert_eq!(
            OpenAiCompatibleFrame.parse_full_response(&body).unwrap(),
            "Hello"
        );
    }
}
