//! Conversation history for one logical generation call.
//!
//! History is an ordered sequence of (prompt, response) pairs. During a
//! module's critique loop it only grows: each correction round appends a
//! turn so the model sees its own flawed output plus the correction and
//! can self-repair instead of regenerating from scratch. A pipeline may
//! share one history buffer across all its modules; the pipeline asserts
//! after every step that the buffer did not shrink.

use crate::client::ChatMessage;

/// One prompt/response exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Turn {
    /// The prompt or correction message sent to the model.
    pub prompt: String,
    /// The raw model response.
    pub response: String,
}

/// Ordered, grow-only conversation history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct History {
    turns: Vec<Turn>,
}

impl History {
    /// Create an empty history.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a completed exchange.
    pub fn push(&mut self, prompt: impl Into<String>, response: impl Into<String>) {
        self.turns.push(Turn {
            prompt: prompt.into(),
            response: response.into(),
        });
    }

    /// Number of completed exchanges.
    pub fn len(&self) -> usize {
        self.turns.len()
    }

    /// Whether no exchanges have happened.
    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Borrow the turns in order.
    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    /// Remove and return the most recent turn.
    ///
    /// Exists for callers that deliberately rewind (e.g. discarding a probe
    /// exchange); inside a pipeline the monotonic-growth check will reject
    /// any step that leaves history shorter than it found it.
    pub fn pop(&mut self) -> Option<Turn> {
        self.turns.pop()
    }

    /// Flatten into the chat-message list for a follow-up call: every prior
    /// turn as a user/assistant pair, then `next_prompt` as the final user
    /// message. This exact sequence is what the transport sends and what
    /// the cache hashes.
    pub fn to_messages(&self, next_prompt: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(self.turns.len() * 2 + 1);
        for turn in &self.turns {
            messages.push(ChatMessage::user(turn.prompt.clone()));
            messages.push(ChatMessage::assistant(turn.response.clone()));
        }
        messages.push(ChatMessage::user(next_prompt.to_string()));
        messages
    }
}
