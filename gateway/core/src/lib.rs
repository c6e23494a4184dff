//! Gateway Core - Provider-Agnostic Streaming Chat
//!
//! This crate normalizes the streaming wire formats of several LLM vendors
//! into one canonical token stream, assembles bounded prompts from persisted
//! history, and drives one cancellable generation per conversation without
//! ever losing output the client has already seen.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                    Edge (HTTP/SSE daemon)                        │
//! │         SendRequest (in)            GenerationEvent (out)        │
//! └───────────────────────────┬──────────────────────────────────────┘
//!                             │
//! ┌───────────────────────────┼──────────────────────────────────────┐
//! │                     GATEWAY CORE                                 │
//! │  ┌────────────────────────┴────────────────────────────────────┐ │
//! │  │                      ChatGateway                             │ │
//! │  │  ┌──────────────┐  ┌───────────┐  ┌──────────────────────┐  │ │
//! │  │  │ Conversation │  │ Retrieval │  │  Cancellation        │  │ │
//! │  │  │ Session      │  │ Injector  │  │  Registry            │  │ │
//! │  │  └──────┬───────┘  └───────────┘  └──────────────────────┘  │ │
//! │  │         │                                                    │ │
//! │  │  ┌──────┴───────────┐   ┌─────────────────────────────────┐ │ │
//! │  │  │ StreamDispatcher │──►│ ProviderAdapter (Ollama/OpenAI/ │ │ │
//! │  │  │                  │   │ Anthropic) + ChunkParser        │ │ │
//! │  │  └──────────────────┘   └─────────────────────────────────┘ │ │
//! │  └─────────────────────────────────────────────────────────────┘ │
//! └──────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//!
//! use gateway_core::{backend::HttpConnector, ChatGateway, InMemoryStore, SendRequest};
//! use tokio::sync::mpsc;
//!
//! let gateway = ChatGateway::new(Arc::new(InMemoryStore::new()), Arc::new(HttpConnector::new()));
//! let session = gateway.create_session("alice", None, None).await?;
//!
//! let (tx, mut rx) = mpsc::channel(64);
//! tokio::spawn(async move {
//!     while let Some(event) = rx.recv().await {
//!         print!("{}", event.to_sse_frame());
//!     }
//! });
//! gateway.send(&session.id, SendRequest::text("Hello!"), tx).await?;
//! ```
//!
//! # Module Overview
//!
//! - [`backend`]: vendor wire formats, chunk reassembly, HTTP connector
//! - [`streaming`]: dispatcher and cancellation registry
//! - [`session`]: single-flight generation, persistence, regeneration, stop
//! - [`gateway`]: process-scoped owner of sessions and collaborators
//! - [`prompt`]: history window and prompt assembly
//! - [`retrieval`]: web search and document similarity context
//! - [`store`]: message persistence seam
//! - [`events`]: outbound events and inbound request shapes
//! - [`config`]: TOML/env/CLI configuration
//! - [`test_utils`]: scripted collaborators for tests

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod messages;
pub mod prompt;
pub mod retrieval;
pub mod session;
pub mod store;
pub mod streaming;
pub mod test_utils;

// Re-exports for convenience
pub use backend::{CanonicalToken, ChunkParser, Connector, HttpConnector, ProviderAdapter};
pub use error::{ErrorKind, GatewayError, Result};
pub use events::{GenerationEvent, GenerationOutcome, RegenerateRequest, SendRequest};
pub use gateway::ChatGateway;
pub use messages::{
    ChatSession, Message, MessageId, MessageRole, MessageStatus, ProviderConfig, ProviderKind,
    SessionId,
};
pub use retrieval::{RetrievalConfig, RetrievalInjector, RetrievalOptions, RetrievedContext};
pub use session::{ConversationSession, SessionConfig, SessionPhase};
pub use store::{InMemoryStore, MessageStore};
pub use streaming::{CancellationRegistry, DispatcherConfig, StreamDispatcher, StreamStatus};

// Config exports
pub use config::{
    default_config_path, load_config, load_config_from_path, ConfigError, ConfigOverrides,
    ConfigSource, GatewayConfig, GatewayToml,
};
