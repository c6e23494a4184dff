//! Session tests
//!
//! End-to-end behavior of [`ChatGateway`] against a scripted vendor and the
//! in-memory store: persistence on every exit path, single flight, stop,
//! regeneration, and prompt assembly.

use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use tokio::sync::{mpsc, Semaphore};

use gateway_core::backend::ChatTurn;
use gateway_core::error::{ErrorKind, GatewayError};
use gateway_core::events::{GenerationEvent, RegenerateRequest, SendRequest};
use gateway_core::messages::{
    ChatSession, MessageRole, MessageStatus, ProviderConfig, ProviderKind, SessionId,
};
use gateway_core::retrieval::{focus_query, RetrievalInjector, RetrievalOptions};
use gateway_core::session::{SessionConfig, SessionPhase};
use gateway_core::store::{InMemoryStore, MessageStore};
use gateway_core::streaming::StreamStatus;
use gateway_core::test_utils::{Script, ScriptedConnector, StaticSearch};
use gateway_core::ChatGateway;

// =============================================================================
// Helpers
// =============================================================================

/// Newline-delimited JSON frames for `tokens`, ending with `done: true`
fn ollama_reply(tokens: &[&str]) -> Script {
    Script::chunks(ollama_frames(tokens, true))
}

fn ollama_frames(tokens: &[&str], done: bool) -> Vec<String> {
    let mut frames: Vec<String> = tokens
        .iter()
        .map(|t| {
            serde_json::json!({"message": {"role": "assistant", "content": t}, "done": false})
                .to_string()
                + "\n"
        })
        .collect();
    if done {
        frames.push("{\"message\":{\"content\":\"\"},\"done\":true}\n".to_string());
    }
    frames
}

struct Harness {
    gateway: Arc<ChatGateway>,
    store: Arc<InMemoryStore>,
    connector: Arc<ScriptedConnector>,
}

impl Harness {
    fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self::build(scripts, |gateway| gateway)
    }

    fn build(
        scripts: impl IntoIterator<Item = Script>,
        configure: impl FnOnce(ChatGateway) -> ChatGateway,
    ) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let connector = Arc::new(ScriptedConnector::new(scripts));
        let gateway = ChatGateway::new(store.clone(), connector.clone());
        Self {
            gateway: Arc::new(configure(gateway)),
            store,
            connector,
        }
    }

    async fn session(&self) -> SessionId {
        self.gateway
            .create_session("alice", None, None)
            .await
            .unwrap()
            .id
    }

    async fn stored(&self, id: &SessionId) -> ChatSession {
        self.store.load_session(id).await.unwrap()
    }
}

/// Run a send to completion and collect every event
async fn send_collect(
    gateway: &ChatGateway,
    id: &SessionId,
    request: SendRequest,
) -> (gateway_core::Result<gateway_core::GenerationOutcome>, Vec<GenerationEvent>) {
    let (tx, mut rx) = mpsc::channel(256);
    let result = gateway.send(id, request, tx).await;
    let mut events = Vec::new();
    while let Some(event) = rx.recv().await {
        events.push(event);
    }
    (result, events)
}

fn token_text(events: &[GenerationEvent]) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            GenerationEvent::Token(t) => Some(t.as_str()),
            _ => None,
        })
        .collect()
}

/// The dispatcher closes its connection on its own task
async fn wait_for_closed(connector: &ScriptedConnector, expected: usize) {
    for _ in 0..50 {
        if connector.closed_connections() == expected {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(connector.closed_connections(), expected);
}

fn roles(session: &ChatSession) -> Vec<MessageRole> {
    session.messages.iter().map(|m| m.role).collect()
}

fn user_turns(turns: &[ChatTurn]) -> Vec<&str> {
    turns
        .iter()
        .filter(|t| t.role == MessageRole::User)
        .map(|t| t.content.as_str())
        .collect()
}

// =============================================================================
// Completion
// =============================================================================

#[tokio::test]
async fn test_send_streams_and_commits_reply() {
    let h = Harness::new([ollama_reply(&["Hello", " there", "!"])]);
    let id = h.session().await;

    let (result, events) = send_collect(&h.gateway, &id, SendRequest::text("Say hello")).await;
    let outcome = result.unwrap();

    assert_eq!(outcome.status, StreamStatus::Completed);
    assert_eq!(outcome.content, "Hello there!");
    assert_eq!(outcome.tokens, 3);
    assert_eq!(
        events,
        vec![
            GenerationEvent::Token("Hello".into()),
            GenerationEvent::Token(" there".into()),
            GenerationEvent::Token("!".into()),
            GenerationEvent::Title("Say hello".into()),
            GenerationEvent::Done,
        ]
    );

    let stored = h.stored(&id).await;
    assert_eq!(roles(&stored), vec![MessageRole::User, MessageRole::Assistant]);
    let reply = &stored.messages[1];
    assert_eq!(reply.content, "Hello there!");
    assert_eq!(reply.status, MessageStatus::Complete);
    assert_eq!(Some(&reply.id), outcome.message_id.as_ref());
    assert_eq!(stored.title.as_deref(), Some("Say hello"));

    assert_eq!(h.gateway.active_generations(), 0);
    assert_eq!(h.gateway.session(&id).await.unwrap().phase(), SessionPhase::Idle);
}

#[tokio::test]
async fn test_existing_title_is_kept() {
    let h = Harness::new([ollama_reply(&["ok"])]);
    let id = h
        .gateway
        .create_session("alice", None, Some("Trip planning".into()))
        .await
        .unwrap()
        .id;

    let (_, events) = send_collect(&h.gateway, &id, SendRequest::text("Hi")).await;

    assert!(!events.iter().any(|e| matches!(e, GenerationEvent::Title(_))));
    assert_eq!(events.last(), Some(&GenerationEvent::Done));
    assert_eq!(h.stored(&id).await.title.as_deref(), Some("Trip planning"));
}

#[tokio::test]
async fn test_unknown_session_is_rejected() {
    let h = Harness::new(Vec::<Script>::new());
    let (result, events) =
        send_collect(&h.gateway, &SessionId::from("missing"), SendRequest::text("hi")).await;

    assert!(matches!(result, Err(GatewayError::SessionNotFound(_))));
    assert!(events.is_empty());
    assert!(!h.gateway.stop(&SessionId::from("missing")));
}

// =============================================================================
// Failure paths
// =============================================================================

#[tokio::test]
async fn test_failure_before_any_token_removes_placeholder() {
    let h = Harness::new([Script::refused(503, "model is loading")]);
    let id = h.session().await;

    let (result, events) = send_collect(&h.gateway, &id, SendRequest::text("hi")).await;
    let outcome = result.unwrap();

    assert!(outcome.status.is_failed());
    assert!(outcome.message_id.is_none());
    match events.as_slice() {
        [GenerationEvent::Error { kind, message }] => {
            assert_eq!(*kind, ErrorKind::Upstream);
            assert!(message.contains("model is loading"));
        }
        other => panic!("unexpected events: {other:?}"),
    }

    let stored = h.stored(&id).await;
    assert_eq!(roles(&stored), vec![MessageRole::User]);
    assert!(stored.title.is_none());
}

#[tokio::test]
async fn test_failure_after_tokens_keeps_partial_reply() {
    let h = Harness::new([
        Script::chunks(ollama_frames(&["The answer", " is"], false)).then_fail("connection reset"),
    ]);
    let id = h.session().await;

    let (result, events) = send_collect(&h.gateway, &id, SendRequest::text("hi")).await;
    let outcome = result.unwrap();

    assert!(outcome.status.is_failed());
    assert_eq!(token_text(&events), "The answer is");
    assert!(matches!(events.last(), Some(GenerationEvent::Error { .. })));

    let stored = h.stored(&id).await;
    let reply = &stored.messages[1];
    assert_eq!(reply.content, "The answer is");
    assert_eq!(reply.status, MessageStatus::Errored);
    assert_eq!(Some(&reply.id), outcome.message_id.as_ref());
}

#[tokio::test]
async fn test_response_size_cap() {
    let h = Harness::build([ollama_reply(&["12345", "67890", "abc"])], |g| {
        g.with_session_config(SessionConfig {
            max_response_bytes: 8,
            ..SessionConfig::default()
        })
    });
    let id = h.session().await;

    let (result, events) = send_collect(&h.gateway, &id, SendRequest::text("count")).await;
    let outcome = result.unwrap();

    match &outcome.status {
        StreamStatus::Failed { kind, .. } => assert_eq!(*kind, ErrorKind::ResourceExceeded),
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(outcome.content, "12345");
    assert_eq!(token_text(&events), "12345");
    assert_eq!(h.stored(&id).await.messages[1].status, MessageStatus::Errored);
}

// =============================================================================
// Stop and disconnect
// =============================================================================

#[tokio::test]
async fn test_stop_commits_exactly_what_was_delivered() {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::new([
        Script::chunks(ollama_frames(&["one ", "two ", "three ", "four "], true)).gated(gate.clone()),
    ]);
    let id = h.session().await;

    let (tx, mut rx) = mpsc::channel(256);
    let task = {
        let gateway = h.gateway.clone();
        let id = id.clone();
        tokio::spawn(async move { gateway.send(&id, SendRequest::text("count"), tx).await })
    };

    gate.add_permits(2);
    let mut received = Vec::new();
    while received.len() < 2 {
        received.push(rx.recv().await.unwrap());
    }
    assert_eq!(h.gateway.session(&id).await.unwrap().phase(), SessionPhase::Streaming);

    assert!(h.gateway.stop(&id));
    // Stop is idempotent while the flight winds down
    h.gateway.stop(&id);

    let outcome = task.await.unwrap().unwrap();
    while let Some(event) = rx.recv().await {
        received.push(event);
    }

    assert_eq!(outcome.status, StreamStatus::Cancelled);
    assert_eq!(token_text(&received), outcome.content);
    assert_eq!(outcome.content, "one two ");
    assert!(received.iter().all(|e| matches!(e, GenerationEvent::Token(_))));

    let stored = h.stored(&id).await;
    let reply = &stored.messages[1];
    assert_eq!(reply.status, MessageStatus::Cancelled);
    assert_eq!(reply.content, outcome.content);
    assert!(stored.title.is_none());

    wait_for_closed(&h.connector, 1).await;
    assert_eq!(h.gateway.active_generations(), 0);
    assert!(!h.gateway.stop(&id));
}

#[tokio::test]
async fn test_stop_before_first_token_leaves_no_reply() {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::new([ollama_reply(&["never"]).gated(gate)]);
    let id = h.session().await;

    let (tx, mut rx) = mpsc::channel(16);
    let task = {
        let gateway = h.gateway.clone();
        let id = id.clone();
        tokio::spawn(async move { gateway.send(&id, SendRequest::text("hi"), tx).await })
    };

    let session = h.gateway.session(&id).await.unwrap();
    while session.phase() != SessionPhase::Streaming {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    assert!(h.gateway.stop(&id));

    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.status, StreamStatus::Cancelled);
    assert!(outcome.message_id.is_none());
    assert!(rx.recv().await.is_none());
    assert_eq!(roles(&h.stored(&id).await), vec![MessageRole::User]);
}

#[tokio::test]
async fn test_client_disconnect_cancels_generation() {
    let h = Harness::new([Script::chunks(ollama_frames(&["a", "b"], false)).then_hang()]);
    let id = h.session().await;

    let (tx, rx) = mpsc::channel(16);
    drop(rx);
    let outcome = h
        .gateway
        .send(&id, SendRequest::text("hi"), tx)
        .await
        .unwrap();

    assert_eq!(outcome.status, StreamStatus::Cancelled);
    assert!(outcome.content.is_empty());
    assert_eq!(roles(&h.stored(&id).await), vec![MessageRole::User]);

    wait_for_closed(&h.connector, 1).await;
}

#[tokio::test]
async fn test_client_disconnect_while_vendor_is_silent() {
    let h = Harness::new([Script::chunks(ollama_frames(&["a"], false)).then_hang()]);
    let id = h.session().await;

    let (tx, mut rx) = mpsc::channel(16);
    let task = {
        let gateway = h.gateway.clone();
        let id = id.clone();
        tokio::spawn(async move { gateway.send(&id, SendRequest::text("hi"), tx).await })
    };
    assert_eq!(rx.recv().await, Some(GenerationEvent::Token("a".into())));
    drop(rx);

    let outcome = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("generation should end once the client is gone")
        .unwrap()
        .unwrap();
    assert_eq!(outcome.status, StreamStatus::Cancelled);
    assert_eq!(outcome.content, "a");

    let stored = h.stored(&id).await;
    assert_eq!(stored.messages[1].status, MessageStatus::Cancelled);
    assert_eq!(stored.messages[1].content, "a");

    wait_for_closed(&h.connector, 1).await;
    assert_eq!(h.gateway.session(&id).await.unwrap().phase(), SessionPhase::Idle);
    assert_eq!(h.gateway.active_generations(), 0);
}

// =============================================================================
// Single flight
// =============================================================================

#[tokio::test]
async fn test_concurrent_send_is_refused() {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::new([
        ollama_reply(&["first", " reply"]).gated(gate.clone()),
        ollama_reply(&["second"]),
    ]);
    let id = h.session().await;

    let (tx, mut rx) = mpsc::channel(16);
    let task = {
        let gateway = h.gateway.clone();
        let id = id.clone();
        tokio::spawn(async move { gateway.send(&id, SendRequest::text("one"), tx).await })
    };
    gate.add_permits(1);
    assert_eq!(rx.recv().await, Some(GenerationEvent::Token("first".into())));

    let (busy, events) = send_collect(&h.gateway, &id, SendRequest::text("two")).await;
    assert!(matches!(busy, Err(GatewayError::SessionBusy(_))));
    assert!(events.is_empty());

    let (tx2, _rx2) = mpsc::channel(16);
    let busy = h.gateway.regenerate(&id, RegenerateRequest::at(0), tx2).await;
    assert!(matches!(busy, Err(GatewayError::SessionBusy(_))));

    gate.add_permits(10);
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.content, "first reply");

    // The refused request never reached the store
    let stored = h.stored(&id).await;
    assert_eq!(roles(&stored), vec![MessageRole::User, MessageRole::Assistant]);

    let (result, _) = send_collect(&h.gateway, &id, SendRequest::text("two")).await;
    assert_eq!(result.unwrap().content, "second");
}

#[tokio::test]
async fn test_sessions_generate_independently() {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::new([ollama_reply(&["slow"]).gated(gate.clone()), ollama_reply(&["fast"])]);
    let slow = h.session().await;
    let fast = h.session().await;

    let (tx, _rx) = mpsc::channel(16);
    let task = {
        let gateway = h.gateway.clone();
        let slow = slow.clone();
        tokio::spawn(async move { gateway.send(&slow, SendRequest::text("hi"), tx).await })
    };
    // Make sure the slow session holds the gated script
    while h.connector.requests().is_empty() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let (result, _) = send_collect(&h.gateway, &fast, SendRequest::text("hi")).await;
    assert_eq!(result.unwrap().content, "fast");

    gate.add_permits(10);
    assert_eq!(task.await.unwrap().unwrap().content, "slow");
}

// =============================================================================
// Provider overrides
// =============================================================================

#[tokio::test]
async fn test_provider_override_cannot_choose_credential() {
    let trusted = ProviderConfig::new(ProviderKind::Ollama, "http://localhost:11434", "llama3.2")
        .with_credential_env("GATEWAY_TEST_VENDOR_KEY");
    let h = Harness::build([ollama_reply(&["one"]), ollama_reply(&["two"])], |gateway| {
        gateway.with_default_provider(trusted.clone())
    });

    let foreign = ProviderConfig::new(ProviderKind::Ollama, "http://elsewhere.example", "llama3.2")
        .with_credential_env("PATH");
    let created = h
        .gateway
        .create_session("mallory", Some(foreign.clone()), None)
        .await
        .unwrap();
    assert!(created.provider.credential_env.is_none());

    let id = h.session().await;
    let request = SendRequest::text("hi").with_provider(foreign);
    send_collect(&h.gateway, &id, request).await.0.unwrap();

    let same_vendor = ProviderConfig::new(ProviderKind::Ollama, "http://localhost:11434/", "qwen")
        .with_credential_env("PATH");
    let request = SendRequest::text("again").with_provider(same_vendor);
    send_collect(&h.gateway, &id, request).await.0.unwrap();

    let providers = h.connector.providers();
    assert_eq!(providers.len(), 2);
    assert_eq!(providers[0].endpoint, "http://elsewhere.example");
    assert!(providers[0].credential_env.is_none());
    assert!(providers[0].resolve_credential().is_none());
    assert_eq!(providers[1].model, "qwen");
    assert_eq!(
        providers[1].credential_env.as_deref(),
        Some("GATEWAY_TEST_VENDOR_KEY")
    );
}

// =============================================================================
// Regeneration
// =============================================================================

#[tokio::test]
async fn test_regenerate_replaces_tail_without_duplicating_user_message() {
    let h = Harness::new([
        ollama_reply(&["first answer"]),
        ollama_reply(&["second answer"]),
        ollama_reply(&["better answer"]),
    ]);
    let id = h.session().await;
    let attachments = serde_json::json!({"files": [{"name": "notes.pdf", "size": 1024}]});
    send_collect(&h.gateway, &id, SendRequest::text("first question")).await.0.unwrap();
    let with_attachment = SendRequest {
        attachments: Some(attachments.clone()),
        ..SendRequest::text("second question")
    };
    send_collect(&h.gateway, &id, with_attachment).await.0.unwrap();
    let original = h.stored(&id).await.messages[2].clone();
    assert_eq!(original.attachments.as_ref(), Some(&attachments));

    let (tx, mut rx) = mpsc::channel(16);
    let outcome = h
        .gateway
        .regenerate(&id, RegenerateRequest::at(3), tx)
        .await
        .unwrap();
    assert_eq!(outcome.content, "better answer");
    assert_eq!(rx.recv().await, Some(GenerationEvent::Token("better answer".into())));

    let stored = h.stored(&id).await;
    let contents: Vec<&str> = stored.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(
        contents,
        vec!["first question", "first answer", "second question", "better answer"]
    );

    // The regenerated-from user message is untouched and present once
    let kept: Vec<_> = stored.messages.iter().filter(|m| m.id == original.id).collect();
    assert_eq!(kept.len(), 1);
    assert_eq!(kept[0], &original);
    assert_eq!(kept[0].attachments.as_ref(), Some(&attachments));

    let requests = h.connector.requests();
    assert_eq!(requests.len(), 3);
    assert_eq!(
        user_turns(&requests[2].turns),
        vec!["first question", "second question"]
    );
    assert_eq!(requests[2].turns.last().unwrap().content, "second question");
}

#[tokio::test]
async fn test_regenerate_from_assistant_index_uses_preceding_user_message() {
    let h = Harness::new([
        ollama_reply(&["a1"]),
        ollama_reply(&["a2"]),
        ollama_reply(&["a1 again"]),
    ]);
    let id = h.session().await;
    send_collect(&h.gateway, &id, SendRequest::text("q1")).await.0.unwrap();
    send_collect(&h.gateway, &id, SendRequest::text("q2")).await.0.unwrap();

    let (tx, _rx) = mpsc::channel(16);
    h.gateway
        .regenerate(&id, RegenerateRequest::at(1), tx)
        .await
        .unwrap();

    let stored = h.stored(&id).await;
    let contents: Vec<&str> = stored.messages.iter().map(|m| m.content.as_str()).collect();
    assert_eq!(contents, vec!["q1", "a1 again"]);
}

#[tokio::test]
async fn test_regenerate_without_user_message_is_invalid() {
    let h = Harness::new([ollama_reply(&["unused"])]);
    let id = h.session().await;

    let (tx, _rx) = mpsc::channel(16);
    let result = h.gateway.regenerate(&id, RegenerateRequest::at(0), tx).await;
    assert!(matches!(result, Err(GatewayError::InvalidTarget(0))));
    assert!(h.connector.requests().is_empty());

    // The refusal leaves the session usable
    let (result, _) = send_collect(&h.gateway, &id, SendRequest::text("hi")).await;
    assert_eq!(result.unwrap().status, StreamStatus::Completed);
}

#[tokio::test]
async fn test_regenerate_past_end_is_invalid() {
    let h = Harness::new([ollama_reply(&["a"])]);
    let id = h.session().await;
    send_collect(&h.gateway, &id, SendRequest::text("q")).await.0.unwrap();

    let (tx, _rx) = mpsc::channel(16);
    let result = h.gateway.regenerate(&id, RegenerateRequest::at(5), tx).await;
    assert!(matches!(result, Err(GatewayError::InvalidTarget(5))));
    assert_eq!(h.stored(&id).await.messages.len(), 2);
}

// =============================================================================
// Persistence failures
// =============================================================================

#[tokio::test]
async fn test_single_commit_failure_is_retried() {
    let h = Harness::new([ollama_reply(&["saved"])]);
    let id = h.session().await;
    h.store.fail_next_commits(1);

    let (result, events) = send_collect(&h.gateway, &id, SendRequest::text("hi")).await;

    assert_eq!(result.unwrap().status, StreamStatus::Completed);
    assert_eq!(events.last(), Some(&GenerationEvent::Done));
    assert_eq!(h.stored(&id).await.messages[1].status, MessageStatus::Complete);
}

#[tokio::test]
async fn test_persistent_commit_failure_keeps_pending_write() {
    let h = Harness::new([ollama_reply(&["keep me"]), ollama_reply(&["next"])]);
    let id = h.session().await;
    h.store.fail_next_commits(2);

    let (result, events) = send_collect(&h.gateway, &id, SendRequest::text("hi")).await;

    assert!(matches!(result, Err(GatewayError::Persistence { .. })));
    assert_eq!(token_text(&events), "keep me");
    match events.last() {
        Some(GenerationEvent::Error { kind, .. }) => assert_eq!(*kind, ErrorKind::Persistence),
        other => panic!("expected persistence error, got {other:?}"),
    }

    let session = h.gateway.session(&id).await.unwrap();
    assert!(session.has_pending_write());
    assert_eq!(session.pending_content().as_deref(), Some("keep me"));
    assert_eq!(session.phase(), SessionPhase::Idle);
    assert!(h.stored(&id).await.messages[1].is_streaming());

    let (refused, _) = send_collect(&h.gateway, &id, SendRequest::text("again")).await;
    assert!(matches!(refused, Err(GatewayError::PendingWrite(_))));

    assert!(h.gateway.retry_persist(&id).await.unwrap());
    assert!(!session.has_pending_write());
    let reply = &h.stored(&id).await.messages[1];
    assert_eq!(reply.content, "keep me");
    assert_eq!(reply.status, MessageStatus::Complete);

    assert!(!h.gateway.retry_persist(&id).await.unwrap());

    let (result, _) = send_collect(&h.gateway, &id, SendRequest::text("again")).await;
    assert_eq!(result.unwrap().content, "next");
}

#[tokio::test]
async fn test_idle_drivers_are_evicted_unless_write_is_pending() {
    let h = Harness::new([ollama_reply(&["one"]), ollama_reply(&["two"]), ollama_reply(&["three"])]);
    let first = h.session().await;
    let second = h.session().await;
    assert_eq!(h.gateway.cached_sessions(), 0);

    send_collect(&h.gateway, &first, SendRequest::text("hi")).await.0.unwrap();
    assert_eq!(h.gateway.cached_sessions(), 0);

    h.store.fail_next_commits(2);
    let (result, _) = send_collect(&h.gateway, &second, SendRequest::text("hi")).await;
    assert!(matches!(result, Err(GatewayError::Persistence { .. })));
    assert_eq!(h.gateway.cached_sessions(), 1);
    assert!(matches!(
        h.gateway.ensure_ready(&second).await,
        Err(GatewayError::PendingWrite(_))
    ));

    assert!(h.gateway.retry_persist(&second).await.unwrap());
    assert_eq!(h.gateway.cached_sessions(), 0);
    h.gateway.ensure_ready(&second).await.unwrap();

    // A rebuilt driver starts from the stored history
    let (result, _) = send_collect(&h.gateway, &first, SendRequest::text("again")).await;
    assert_eq!(result.unwrap().content, "three");
    assert_eq!(roles(&h.stored(&first).await).len(), 4);
    assert_eq!(h.gateway.cached_sessions(), 0);
}

#[tokio::test]
async fn test_retry_persist_failure_keeps_write() {
    let h = Harness::new([ollama_reply(&["x"])]);
    let id = h.session().await;
    h.store.fail_next_commits(3);

    let (result, _) = send_collect(&h.gateway, &id, SendRequest::text("hi")).await;
    assert!(result.is_err());

    assert!(matches!(
        h.gateway.retry_persist(&id).await,
        Err(GatewayError::Persistence { .. })
    ));
    assert!(h.gateway.session(&id).await.unwrap().has_pending_write());
    assert!(h.gateway.retry_persist(&id).await.unwrap());
}

// =============================================================================
// Prompt assembly
// =============================================================================

#[tokio::test]
async fn test_prompt_uses_window_and_system_instructions() {
    let h = Harness::build([ollama_reply(&["a1"]), ollama_reply(&["a2"])], |g| {
        g.with_session_config(SessionConfig {
            history_window: 2,
            system_instructions: Some("Be brief.".into()),
            ..SessionConfig::default()
        })
    });
    let id = h.session().await;
    send_collect(&h.gateway, &id, SendRequest::text("u1")).await.0.unwrap();
    send_collect(&h.gateway, &id, SendRequest::text("u2")).await.0.unwrap();

    let requests = h.connector.requests();
    assert_eq!(
        requests[0].turns,
        vec![
            ChatTurn::new(MessageRole::System, "Be brief."),
            ChatTurn::new(MessageRole::User, "u1"),
        ]
    );
    assert_eq!(
        requests[1].turns,
        vec![
            ChatTurn::new(MessageRole::System, "Be brief."),
            ChatTurn::new(MessageRole::Assistant, "a1"),
            ChatTurn::new(MessageRole::User, "u2"),
        ]
    );

    // Instructions are never persisted
    let stored = h.stored(&id).await;
    assert!(stored.messages.iter().all(|m| m.role != MessageRole::System));
}

#[tokio::test]
async fn test_web_context_is_injected_with_focused_query() {
    let search = Arc::new(StaticSearch::answer("It is sunny, 24°C."));
    let h = Harness::build([ollama_reply(&["Sunny."])], |g| {
        g.with_retrieval(RetrievalInjector::disabled().with_web_search(search.clone()))
    });
    let id = h.session().await;

    let question = "please tell me the current weather in Lisbon";
    let request = SendRequest::text(question).with_retrieval(RetrievalOptions {
        web_search: true,
        ..RetrievalOptions::default()
    });
    let (result, _) = send_collect(&h.gateway, &id, request).await;
    assert_eq!(result.unwrap().status, StreamStatus::Completed);

    assert_eq!(search.queries(), vec![focus_query(question)]);
    assert_eq!(search.queries(), vec!["the current weather in Lisbon".to_string()]);

    let turns = &h.connector.requests()[0].turns;
    assert_eq!(turns.len(), 2);
    assert_eq!(turns[0].role, MessageRole::System);
    assert!(turns[0].content.contains("It is sunny, 24°C."));
    assert_eq!(turns[1], ChatTurn::new(MessageRole::User, question));

    // Context is transient
    let stored = h.stored(&id).await;
    assert!(stored.messages.iter().all(|m| !m.content.contains("sunny")));
}

#[tokio::test]
async fn test_retrieval_failure_does_not_fail_generation() {
    let h = Harness::build([ollama_reply(&["fine"])], |g| {
        g.with_retrieval(
            RetrievalInjector::disabled().with_web_search(Arc::new(StaticSearch::failing("offline"))),
        )
    });
    let id = h.session().await;

    let request = SendRequest::text("what is new in rust").with_retrieval(RetrievalOptions {
        web_search: true,
        search_documents: true,
        document_id: None,
    });
    let (result, events) = send_collect(&h.gateway, &id, request).await;

    assert_eq!(result.unwrap().status, StreamStatus::Completed);
    assert_eq!(events.last(), Some(&GenerationEvent::Done));
    assert_eq!(
        h.connector.requests()[0].turns,
        vec![ChatTurn::new(MessageRole::User, "what is new in rust")]
    );
}

#[tokio::test]
async fn test_streaming_message_is_flushed_periodically() {
    let gate = Arc::new(Semaphore::new(0));
    let h = Harness::build([ollama_reply(&["a", "b", "c"]).gated(gate.clone())], |g| {
        g.with_session_config(SessionConfig {
            flush_every: 2,
            ..SessionConfig::default()
        })
    });
    let id = h.session().await;

    let (tx, mut rx) = mpsc::channel(16);
    let task = {
        let gateway = h.gateway.clone();
        let id = id.clone();
        tokio::spawn(async move { gateway.send(&id, SendRequest::text("abc"), tx).await })
    };
    gate.add_permits(2);
    rx.recv().await.unwrap();
    rx.recv().await.unwrap();

    let mut flushed = String::new();
    for _ in 0..50 {
        flushed = h.stored(&id).await.messages[1].content.clone();
        if !flushed.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(flushed, "ab");
    assert!(h.stored(&id).await.messages[1].is_streaming());

    gate.add_permits(10);
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome.content, "abc");
    assert_eq!(h.stored(&id).await.messages[1].status, MessageStatus::Complete);
}
