//! Streaming Infrastructure
//!
//! Turns one vendor connection into a pull-based, cancellable sequence of
//! canonical tokens with an explicit terminal status.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────┐
//! │                       StreamDispatcher                           │
//! │                                                                  │
//! │   Connector ──bytes──► ChunkParser ──tokens──► bounded mpsc ─────┼──► TokenStream::next()
//! │       ▲                 (carry buffer)                           │
//! │       │ dropped on cancel / idle timeout / consumer gone         │
//! │                                                                  │
//! │   terminal status ──► oneshot ───────────────────────────────────┼──► TokenStream::finish()
//! └──────────────────────────────────────────────────────────────────┘
//!                 ▲
//!                 │ cancel()
//!       CancellationRegistry (session id → handle)
//! ```
//!
//! # Features
//!
//! - **Backpressure**: the read loop blocks on the bounded channel when the
//!   consumer is slow
//! - **Prompt cancellation**: cancellation drops the vendor connection and is
//!   observed at the next chunk boundary at the latest
//! - **Idle timeout**: no bytes within the configured window is a transport
//!   failure

mod dispatcher;
mod registry;

pub use dispatcher::{DispatcherConfig, StreamDispatcher, StreamStatus, TokenStream};
pub use registry::{CancellationRegistry, Registration};

// Re-export CanonicalToken from backend for convenience
pub use crate::backend::CanonicalToken;
