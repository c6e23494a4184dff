//! Ollama Wire Format
//!
//! Ollama's `/api/chat` endpoint streams newline-delimited JSON: every line is
//! a complete object, token text lives at `message.content`, and the last
//! object carries `"done": true`. There is no separate sentinel line.
//!
//! ```text
//! {"model":"llama3.2","message":{"role":"assistant","content":"Hel"},"done":false}
//! {"model":"llama3.2","message":{"role":"assistant","content":"lo"},"done":false}
//! {"model":"llama3.2","message":{"role":"assistant","content":""},"done":true,"eval_count":2}
//! ```

use serde::Deserialize;
use serde_json::json;

use super::frame::FrameOutcome;
use super::traits::GenerationRequest;
use super::WireFormat;
use crate::error::{GatewayError, Result};

/// Ollama `/api/chat` framing
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct OllamaFrame;

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

impl WireFormat for OllamaFrame {
    fn name(&self) -> &'static str {
        "Ollama"
    }

    fn endpoint_url(&self, base: &str) -> String {
        format!("{}/api/chat", base.trim_end_matches('/'))
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

        let mut options = serde_json::Map::new();
        if let Some(temperature) = request.temperature {
            options.insert("temperature".to_string(), json!(temperature));
        }
        if request.max_tokens > 0 {
            options.insert("num_predict".to_string(), json!(request.max_tokens));
        }
        if !options.is_empty() {
            body["options"] = serde_json::Value::Object(options);
        }
        body
    }

    fn decode_line(&self, line: &str) -> FrameOutcome {
        let chunk: ChatChunk = match serde_json::from_str(line) {
            Ok(chunk) => chunk,
            Err(e) => return FrameOutcome::Malformed(e.to_string()),
        };

        if let Some(error) = chunk.error {
            return FrameOutcome::Failed(GatewayError::Upstream {
                status: 0,
                message: error,
            });
        }

        let text = chunk.message.map(|m| m.content).unwrap_or_default();
        if chunk.done {
            FrameOutcome::Done(text)
        } else {
            FrameOutcome::Token(text)
        }
    }

    fn parse_full_response(&self, body: &serde_json::Value) -> Result<String> {
        body.get("message")
            .and_then(|m| m.get("content"))
            .and_then(serde_json::Value::as_str)
            .map(String::from)
            .ok_or_else(|| GatewayError::Protocol("Ollama response missing message.content".into()))
    }
}
