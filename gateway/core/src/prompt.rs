//! Prompt Assembly
//!
//! Builds the outbound turn list from persisted history:
//!
//! ```text
//! [system instructions]?  [retrieved context]?  last min(M, W) messages
//! ```
//!
//! The system and context turns are transient. They are never counted
//! against the window and never written to the store.

use crate::backend::ChatTurn;
use crate::messages::{Message, MessageRole};
use crate::retrieval::{render_context, RetrievedContext};

/// Default number of persisted messages in a prompt
pub const DEFAULT_HISTORY_WINDOW: usize = 20;

/// Last `window` committed messages, oldest first
///
/// Messages still streaming are not part of the history.
#[must_use]
pub fn history_window(messages: &[Message], window: usize) -> Vec<&Message> {
    let committed: Vec<&Message> = messages.iter().filter(|m| !m.is_streaming()).collect();
    let skip = committed.len().saturating_sub(window);
    committed.into_iter().skip(skip).collect()
}

/// Assemble the full prompt for one generation
#[must_use]
pub fn assemble_prompt(
    messages: &[Message],
    window: usize,
    system_instructions: Option<&str>,
    context: &[RetrievedContext],
) -> Vec<ChatTurn> {
    let history = history_window(messages, window);
    let mut turns = Vec::with_capacity(history.len() + 2);

    if let Some(instructions) = system_instructions.filter(|s| !s.trim().is_empty()) {
        turns.push(ChatTurn::new(MessageRole::System, instructions));
    }

    if !context.is_empty() {
        turns.push(ChatTurn::new(MessageRole::System, render_context(context)));
    }

    turns.extend(
        history
            .into_iter()
            .map(|m| ChatTurn::new(m.role, m.content.clone())),
    );
    turns
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn conversation() -> Vec<Message> {
        vec![
            Message::user("u1", None),
            Message::assistant("a1"),
            Message::user("u2", None),
            Message::assistant("a2"),
            Message::user("u3", None),
        ]
    }

    fn rendered(turns: &[ChatTurn]) -> Vec<String> {
        turns
            .iter()
            .map(|t| format!("{}:{}", t.role.as_str(), t.content))
            .collect()
    }

    #[test]
    fn test_window_keeps_last_messages() {
        let turns = assemble_prompt(&conversation(), 3, None, &[]);
        assert_eq!(rendered(&turns), vec!["user:u2", "assistant:a2", "user:u3"]);
    }

    #[test]
    fn test_system_instructions_are_not_counted() {
        let turns = assemble_prompt(&conversation(), 3, Some("X"), &[]);
        assert_eq!(
            rendered(&turns),
            vec!["system:X", "user:u2", "assistant:a2", "user:u3"]
        );
    }

    #[test]
    fn test_blank_instructions_are_ignored() {
        let turns = assemble_prompt(&conversation(), 3, Some("   "), &[]);
        assert_eq!(turns.len(), 3);
        assert!(turns.iter().all(|t| t.role != MessageRole::System));
    }

    #[test]
    fn test_window_larger_than_history() {
        let turns = assemble_prompt(&conversation(), 20, None, &[]);
        assert_eq!(turns.len(), 5);
        assert_eq!(turns[0].content, "u1");
    }

    #[test]
    fn test_context_follows_system_turn() {
        let context = [RetrievedContext::new("web", "Lisbon is sunny.")];
        let turns = assemble_prompt(&conversation(), 1, Some("X"), &context);

        assert_eq!(turns.len(), 3);
        assert_eq!(turns[0].content, "X");
        assert!(turns[1].content.contains("Lisbon is sunny."));
        assert_eq!(turns[2].content, "u3");
    }

    #[test]
    fn test_context_leads_without_instructions() {
        let context = [RetrievedContext::new("doc.pdf", "chunk")];
        let turns = assemble_prompt(&conversation(), 2, None, &context);
        assert_eq!(turns[0].role, MessageRole::System);
        assert!(turns[0].content.contains("[doc.pdf]"));
        assert_eq!(turns.len(), 3);
    }

    #[test]
    fn test_streaming_placeholder_is_excluded() {
        let mut messages = conversation();
        messages.push(Message::streaming_placeholder());
        let turns = assemble_prompt(&messages, 3, None, &[]);
        assert_eq!(rendered(&turns), vec!["user:u2", "assistant:a2", "user:u3"]);
    }
}
