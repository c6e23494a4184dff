//! Stream Dispatcher Implementation
//!
//! Owns one vendor connection. A spawned task pumps raw chunks through the
//! [`ChunkParser`] and forwards tokens over a bounded channel, so a slow
//! consumer stalls the vendor read loop instead of growing a buffer.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::backend::{
    ByteStream, CanonicalToken, ChunkParser, Connector, GenerationRequest, ProviderAdapter,
    DEFAULT_MAX_CONSECUTIVE_BAD_FRAMES, DEFAULT_MAX_FRAME_BYTES,
};
use crate::error::{ErrorKind, GatewayError};
use crate::messages::ProviderConfig;

// ============================================================================
// Configuration
// ============================================================================

/// Configuration for a dispatcher
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    /// Tokens buffered between the read loop and the consumer
    pub channel_capacity: usize,
    /// Longest wait for the connection or for the next chunk
    pub idle_timeout: Duration,
    /// Cap on a single unterminated frame
    pub max_frame_bytes: usize,
    /// Consecutive unparseable frames tolerated before aborting
    pub max_consecutive_bad_frames: u32,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 64,
            idle_timeout: Duration::from_secs(60),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            max_consecutive_bad_frames: DEFAULT_MAX_CONSECUTIVE_BAD_FRAMES,
        }
    }
}

// ============================================================================
// Terminal Status
// ============================================================================

/// How a stream ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StreamStatus {
    /// The vendor finished the response
    Completed,
    /// Cancellation was requested or the consumer went away
    Cancelled,
    /// The stream failed
    Failed {
        /// Failure class
        kind: ErrorKind,
        /// Human-readable reason
        message: String,
    },
}

impl StreamStatus {
    /// Build a failed status from an error
    #[must_use]
    pub fn failed(error: &GatewayError) -> Self {
        Self::Failed {
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    /// Whether this is a failure
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

// ============================================================================
// Token Stream
// ============================================================================

/// Pull side of a running dispatch
///
/// Call [`next`](Self::next) until it returns `None`, then
/// [`finish`](Self::finish) for the terminal status. Dropping the stream
/// early closes the vendor connection.
pub struct TokenStream {
    tokens: mpsc::Receiver<CanonicalToken>,
    status: oneshot::Receiver<StreamStatus>,
}

impl TokenStream {
    /// Next token in arrival order, or `None` once the stream has ended
    pub async fn next(&mut self) -> Option<CanonicalToken> {
        self.tokens.recv().await
    }

    /// Stop consuming and wait for the terminal status
    ///
    /// Any tokens not yet pulled are discarded.
    pub async fn finish(self) -> StreamStatus {
        drop(self.tokens);
        self.status.await.unwrap_or_else(|_| StreamStatus::Failed {
            kind: ErrorKind::Transport,
            message: "dispatcher task ended without a status".to_string(),
        })
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Drives one generation against one vendor
pub struct StreamDispatcher {
    connector: Arc<dyn Connector>,
    provider: ProviderConfig,
    request: GenerationRequest,
    config: DispatcherConfig,
}

impl StreamDispatcher {
    /// Create a dispatcher for a single request
    pub fn new(
        connector: Arc<dyn Connector>,
        provider: ProviderConfig,
        request: GenerationRequest,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            connector,
            provider,
            request,
            config,
        }
    }

    /// Start the generation
    ///
    /// The vendor connection is opened on a spawned task. Cancelling `cancel`
    /// drops the connection and is observed at the next chunk boundary at the
    /// latest.
    #[must_use]
    pub fn run(self, cancel: CancellationToken) -> TokenStream {
        let (token_tx, token_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (status_tx, status_rx) = oneshot::channel();

        tokio::spawn(async move {
            let started = Instant::now();
            let mut pump = Pump {
                tx: token_tx,
                cancel,
                config: self.config,
                delivered: 0,
            };
            let status = pump
                .run(self.connector.as_ref(), &self.provider, self.request)
                .await;

            tracing::debug!(
                provider = %self.provider.kind,
                tokens = pump.delivered,
                elapsed_ms = started.elapsed().as_millis() as u64,
                status = ?status,
                "Dispatch finished"
            );
            let _ = status_tx.send(status);
        });

        TokenStream {
            tokens: token_rx,
            status: status_rx,
        }
    }
}

/// State of the read loop
struct Pump {
    tx: mpsc::Sender<CanonicalToken>,
    cancel: CancellationToken,
    config: DispatcherConfig,
    delivered: u64,
}

/// Outcome of waiting for the next chunk
enum Read {
    Chunk(bytes::Bytes),
    Closed,
    Cancelled,
    Failed(GatewayError),
}

impl Pump {
    async fn run(
        &mut self,
        connector: &dyn Connector,
        provider: &ProviderConfig,
        request: GenerationRequest,
    ) -> StreamStatus {
        let adapter = ProviderAdapter::for_kind(provider.kind);

        let connect = tokio::time::timeout(
            self.config.idle_timeout,
            connector.connect(provider, &adapter, &request),
        );
        let mut bytes = tokio::select! {
            biased;
            () = self.cancel.cancelled() => return StreamStatus::Cancelled,
            () = self.tx.closed() => return StreamStatus::Cancelled,
            result = connect => match result {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => return StreamStatus::failed(&e),
                Err(_) => {
                    return StreamStatus::failed(&GatewayError::Transport(format!(
                        "no response from {} within {:?}",
                        adapter.name(),
                        self.config.idle_timeout
                    )));
                }
            },
        };

        let mut parser = ChunkParser::with_limits(
            adapter,
            self.config.max_frame_bytes,
            self.config.max_consecutive_bad_frames,
        );
        let mut tokens = Vec::new();

        loop {
            let read = self.read(&mut bytes).await;
            let result = match read {
                Read::Chunk(chunk) => parser.parse_chunk_into(&chunk, &mut tokens),
                Read::Closed => parser.finish_into(&mut tokens),
                Read::Cancelled => return StreamStatus::Cancelled,
                Read::Failed(e) => {
                    drop(bytes);
                    return StreamStatus::failed(&e);
                }
            };

            if let Err(e) = result {
                // Close the connection before handing over what was decoded
                drop(bytes);
                if !self.deliver(&mut tokens).await {
                    return StreamStatus::Cancelled;
                }
                return StreamStatus::failed(&e);
            }

            if parser.is_finished() {
                drop(bytes);
                if !self.deliver(&mut tokens).await {
                    return StreamStatus::Cancelled;
                }
                return StreamStatus::Completed;
            }

            if !self.deliver(&mut tokens).await {
                return StreamStatus::Cancelled;
            }
        }
    }

    async fn read(&self, bytes: &mut ByteStream) -> Read {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Read::Cancelled,
            () = self.tx.closed() => Read::Cancelled,
            next = tokio::time::timeout(self.config.idle_timeout, bytes.next()) => match next {
                Ok(Some(Ok(chunk))) => Read::Chunk(chunk),
                Ok(Some(Err(e))) => Read::Failed(e),
                Ok(None) => Read::Closed,
                Err(_) => Read::Failed(GatewayError::Transport(format!(
                    "no bytes received within {:?}",
                    self.config.idle_timeout
                ))),
            },
        }
    }

    /// Forward decoded tokens in order; `false` once the consumer is gone
    async fn deliver(&mut self, tokens: &mut Vec<CanonicalToken>) -> bool {
        for token in tokens.drain(..) {
            if self.tx.send(token).await.is_err() {
                return false;
            }
            self.delivered += 1;
        }
        true
    }
}
