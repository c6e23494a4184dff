//! Daemon Server Implementation
//!
//! HTTP/SSE edge over [`ChatGateway`]. Handlers only translate between HTTP
//! and core operations:
//!
//! ```text
//!   POST /sessions                        create
//!   GET  /sessions/{id}                   snapshot
//!   POST /sessions/{id}/messages          send        (text/event-stream)
//!   POST /sessions/{id}/regenerate        regenerate  (text/event-stream)
//!   POST /sessions/{id}/stop              stop        (204)
//!   POST /sessions/{id}/retry-persist     retry_persist
//!   GET  /health                          liveness
//! ```
//!
//! A generation runs on its own task and feeds the SSE body through a bounded
//! channel. When the client goes away the body is dropped, the session's next
//! event send fails, and the generation is cancelled like an explicit stop.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;
use tracing::{debug, error, info, warn};

use gateway_core::{
    ChatGateway, ChatSession, GatewayError, GenerationEvent, GenerationOutcome, ProviderConfig,
    RegenerateRequest, SendRequest, SessionId,
};

/// Events buffered between a generation and its SSE response
const EVENT_CHANNEL_CAPACITY: usize = 64;

// ============================================================================
// Errors
// ============================================================================

/// Core errors mapped onto HTTP responses
#[derive(Debug)]
pub struct ApiError(GatewayError);

impl From<GatewayError> for ApiError {
    fn from(error: GatewayError) -> Self {
        Self(error)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            GatewayError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidTarget(_) => StatusCode::UNPROCESSABLE_ENTITY,
            GatewayError::SessionBusy(_) | GatewayError::PendingWrite(_) => StatusCode::CONFLICT,
            GatewayError::Upstream { .. } | GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Persistence { .. }
            | GatewayError::Store(_)
            | GatewayError::Protocol(_)
            | GatewayError::ResourceExceeded(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        } else {
            debug!(error = %self.0, "Request refused");
        }
        let body = serde_json::json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// Request / response bodies
// ============================================================================

/// Body of `POST /sessions`
#[derive(Debug, Deserialize)]
pub struct CreateSession {
    /// Owning user
    pub owner: String,
    /// Provider for this session (server default when absent)
    #[serde(default)]
    pub provider: Option<ProviderConfig>,
    /// Initial title
    #[serde(default)]
    pub title: Option<String>,
}

/// Body of `POST /sessions/{id}/retry-persist`
#[derive(Debug, Serialize)]
pub struct RetryPersisted {
    /// Whether a pending write was flushed
    pub flushed: bool,
}

// ============================================================================
// Router
// ============================================================================

/// Build the HTTP router over `gateway`
pub fn router(gateway: Arc<ChatGateway>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", get(get_session))
        .route("/sessions/{id}/messages", post(send_message))
        .route("/sessions/{id}/regenerate", post(regenerate))
        .route("/sessions/{id}/stop", post(stop))
        .route("/sessions/{id}/retry-persist", post(retry_persist))
        .with_state(gateway)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    gateway: Arc<ChatGateway>,
    listener: tokio::net::TcpListener,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Listening for connections");
    }
    axum::serve(listener, router(gateway))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

// ============================================================================
// Handlers
// ============================================================================

async fn health(State(gateway): State<Arc<ChatGateway>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "activeGenerations": gateway.active_generations(),
    }))
}

async fn create_session(
    State(gateway): State<Arc<ChatGateway>>,
    Json(body): Json<CreateSession>,
) -> ApiResult<(StatusCode, Json<ChatSession>)> {
    let session = gateway
        .create_session(body.owner, body.provider, body.title)
        .await?;
    Ok((StatusCode::CREATED, Json(session)))
}

async fn get_session(
    State(gateway): State<Arc<ChatGateway>>,
    Path(id): Path<String>,
) -> ApiResult<Json<ChatSession>> {
    Ok(Json(gateway.snapshot(&SessionId(id)).await?))
}

async fn send_message(
    State(gateway): State<Arc<ChatGateway>>,
    Path(id): Path<String>,
    Json(request): Json<SendRequest>,
) -> ApiResult<Response> {
    let session_id = SessionId(id);
    gateway.ensure_ready(&session_id).await?;

    let stream = spawn_generation(session_id, move |session_id, events| async move {
        gateway.send(&session_id, request, events).await
    });
    Ok(sse_response(stream))
}

async fn regenerate(
    State(gateway): State<Arc<ChatGateway>>,
    Path(id): Path<String>,
    Json(request): Json<RegenerateRequest>,
) -> ApiResult<Response> {
    let session_id = SessionId(id);
    gateway.ensure_ready(&session_id).await?;

    // Reject an impossible target before committing to an event stream
    let snapshot = gateway.snapshot(&session_id).await?;
    let has_user_message = snapshot
        .messages
        .get(..=request.target_index)
        .is_some_and(|prefix| prefix.iter().any(|m| m.role == gateway_core::MessageRole::User));
    if !has_user_message {
        return Err(GatewayError::InvalidTarget(request.target_index).into());
    }

    let stream = spawn_generation(session_id, move |session_id, events| async move {
        gateway.regenerate(&session_id, request, events).await
    });
    Ok(sse_response(stream))
}

async fn stop(
    State(gateway): State<Arc<ChatGateway>>,
    Path(id): Path<String>,
) -> ApiResult<StatusCode> {
    let session_id = SessionId(id);
    gateway.snapshot(&session_id).await?;
    if !gateway.stop(&session_id) {
        debug!(session_id = %session_id, "Stop requested with nothing in flight");
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn retry_persist(
    State(gateway): State<Arc<ChatGateway>>,
    Path(id): Path<String>,
) -> ApiResult<Json<RetryPersisted>> {
    let flushed = gateway.retry_persist(&SessionId(id)).await?;
    Ok(Json(RetryPersisted { flushed }))
}

// ============================================================================
// Streaming helpers
// ============================================================================

/// Run a generation on its own task and return its event stream
fn spawn_generation<F, Fut>(session_id: SessionId, run: F) -> ReceiverStream<GenerationEvent>
where
    F: FnOnce(SessionId, mpsc::Sender<GenerationEvent>) -> Fut,
    Fut: Future<Output = gateway_core::Result<GenerationOutcome>> + Send + 'static,
{
    let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
    let report = tx.clone();
    let generation = run(session_id.clone(), tx);

    tokio::spawn(async move {
        match generation.await {
            Ok(outcome) => {
                info!(
                    session_id = %session_id,
                    status = ?outcome.status,
                    tokens = outcome.tokens,
                    "Generation finished"
                );
            }
            // Already reported to the client by the session
            Err(e @ GatewayError::Persistence { .. }) => {
                warn!(session_id = %session_id, error = %e, "Reply kept pending");
            }
            Err(e) => {
                warn!(session_id = %session_id, error = %e, "Generation refused");
                let _ = report
                    .send(GenerationEvent::Error {
                        kind: e.kind(),
                        message: e.to_string(),
                    })
                    .await;
            }
        }
    });

    ReceiverStream::new(rx)
}

fn sse_response<S>(events: S) -> Response
where
    S: Stream<Item = GenerationEvent> + Send + 'static,
{
    let frames = events.map(|event| Ok::<Event, Infallible>(Event::default().data(event.sse_data())));
    Sse::new(frames)
        .keep_alive(KeepAlive::default())
        .into_response()
}
