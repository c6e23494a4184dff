//! Test Doubles
//!
//! Scripted collaborators for exercising the gateway without a network:
//! a [`ScriptedConnector`] that replays vendor bytes, plus fixed-answer
//! search and embedding backends.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;

use crate::backend::{ByteStream, Connector, GenerationRequest, ProviderAdapter};
use crate::error::{GatewayError, Result};
use crate::messages::ProviderConfig;
use crate::retrieval::{Embedder, SearchPayload, WebSearch};

// ============================================================================
// Scripted connector
// ============================================================================

#[derive(Clone, Debug)]
enum Step {
    Chunk(Bytes),
    Fail(String),
}

/// One scripted vendor response
#[derive(Clone, Debug, Default)]
pub struct Script {
    steps: Vec<Step>,
    refusal: Option<(u16, String)>,
    gate: Option<Arc<Semaphore>>,
    hang_at_end: bool,
}

impl Script {
    /// Response body delivered as the given chunks
    pub fn chunks<I, B>(chunks: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        Self {
            steps: chunks.into_iter().map(|c| Step::Chunk(c.into())).collect(),
            ..Self::default()
        }
    }

    /// Non-success HTTP response
    pub fn refused(status: u16, message: impl Into<String>) -> Self {
        Self {
            refusal: Some((status, message.into())),
            ..Self::default()
        }
    }

    /// Reset the connection after the scripted chunks
    #[must_use]
    pub fn then_fail(mut self, message: impl Into<String>) -> Self {
        self.steps.push(Step::Fail(message.into()));
        self
    }

    /// Keep the connection open without sending anything after the chunks
    #[must_use]
    pub fn then_hang(mut self) -> Self {
        self.hang_at_end = true;
        self
    }

    /// Release each chunk only when a permit is added to `gate`
    #[must_use]
    pub fn gated(mut self, gate: Arc<Semaphore>) -> Self {
        self.gate = Some(gate);
        self
    }
}

struct CloseSignal(Arc<AtomicUsize>);

impl Drop for CloseSignal {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

struct Playback {
    steps: VecDeque<Step>,
    gate: Option<Arc<Semaphore>>,
    hang_at_end: bool,
    _closed: CloseSignal,
}

/// Connector that replays scripted responses in order
#[derive(Default)]
pub struct ScriptedConnector {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<GenerationRequest>>,
    providers: Mutex<Vec<ProviderConfig>>,
    closed: Arc<AtomicUsize>,
}

impl ScriptedConnector {
    /// Replay `scripts`, one per connection
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into_iter().collect()),
            ..Self::default()
        }
    }

    /// A connector with a single scripted response
    #[must_use]
    pub fn single(script: Script) -> Self {
        Self::new([script])
    }

    /// Queue another response
    pub fn push(&self, script: Script) {
        self.scripts.lock().push_back(script);
    }

    /// Requests received so far
    #[must_use]
    pub fn requests(&self) -> Vec<GenerationRequest> {
        self.requests.lock().clone()
    }

    /// Provider settings each request was sent with
    #[must_use]
    pub fn providers(&self) -> Vec<ProviderConfig> {
        self.providers.lock().clone()
    }

    /// Number of response streams that have been dropped
    #[must_use]
    pub fn closed_connections(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for ScriptedConnector {
    async fn connect(
        &self,
        provider: &ProviderConfig,
        _adapter: &ProviderAdapter,
        request: &GenerationRequest,
    ) -> Result<ByteStream> {
        self.requests.lock().push(request.clone());
        self.providers.lock().push(provider.clone());

        let script = self
            .scripts
            .lock()
            .pop_front()
            .ok_or_else(|| GatewayError::Transport("no scripted response left".to_string()))?;

        if let Some((status, message)) = script.refusal {
            return Err(GatewayError::Upstream { status, message });
        }

        let playback = Playback {
            steps: script.steps.into(),
            gate: script.gate,
            hang_at_end: script.hang_at_end,
            _closed: CloseSignal(Arc::clone(&self.closed)),
        };

        let stream = futures::stream::unfold(playback, |mut playback| async move {
            if let (Some(gate), Some(Step::Chunk(_))) = (&playback.gate, playback.steps.front()) {
                gate.acquire().await.ok()?.forget();
            }
            match playback.steps.pop_front() {
                Some(Step::Chunk(chunk)) => Some((Ok(chunk), playback)),
                Some(Step::Fail(message)) => Some((Err(GatewayError::Transport(message)), playback)),
                None if playback.hang_at_end => {
                    futures::future::pending::<()>().await;
                    None
                }
                None => None,
            }
        });
        Ok(stream.boxed())
    }
}

// ============================================================================
// Retrieval doubles
// ============================================================================

/// Search backend with a fixed result
#[derive(Debug)]
pub struct StaticSearch {
    result: std::result::Result<SearchPayload, String>,
    queries: Mutex<Vec<String>>,
}

impl StaticSearch {
    /// Always return `payload`
    #[must_use]
    pub fn payload(payload: SearchPayload) -> Self {
        Self {
            result: Ok(payload),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Always return a direct answer
    pub fn answer(answer: impl Into<String>) -> Self {
        Self::payload(SearchPayload {
            answer: Some(answer.into()),
            ..SearchPayload::default()
        })
    }

    /// Always fail
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
            queries: Mutex::new(Vec::new()),
        }
    }

    /// Focused queries received so far
    #[must_use]
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl WebSearch for StaticSearch {
    async fn search(&self, query: &str) -> anyhow::Result<SearchPayload> {
        self.queries.lock().push(query.to_string());
        self.result.clone().map_err(anyhow::Error::msg)
    }
}

/// Embedder with a fixed vector
#[derive(Debug)]
pub struct StaticEmbedder {
    result: std::result::Result<Vec<f32>, String>,
}

impl StaticEmbedder {
    /// Always return `embedding`
    #[must_use]
    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            result: Ok(embedding),
        }
    }

    /// Always fail
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            result: Err(message.into()),
        }
    }
}

#[async_trait]
impl Embedder for StaticEmbedder {
    async fn embed(&self, _text: &str) -> anyhow::Result<Vec<f32>> {
        self.result.clone().map_err(anyhow::Error::msg)
    }
}
