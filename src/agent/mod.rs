//! Reply generation
//!
//! The language model is an external collaborator behind
//! [`ReplyGenerator`]. Sessions keep a bounded [`Conversation`] so replies
//! can refer to earlier turns.

mod openai;

use std::collections::VecDeque;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use serde::{Deserialize, Serialize};

pub use openai::{OpenAiChat, SseLine, parse_sse_line};

use crate::Result;

/// Lazy, finite stream of reply text fragments
pub type ReplyStream = BoxStream<'static, Result<String>>;

/// Produces a streamed reply to recognized user text
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Start generating a reply to `text`, given prior exchanges
    ///
    /// # Errors
    ///
    /// Returns error if the request could not be started. Failures while
    /// streaming surface as stream items.
    async fn generate_stream(&self, history: &[ChatMessage], text: &str) -> Result<ReplyStream>;
}

/// Run a reply stream to completion and return the concatenated text
///
/// # Errors
///
/// Returns the first error produced by the stream
pub async fn collect_reply(mut stream: ReplyStream) -> Result<String> {
    let mut reply = String::new();
    while let Some(fragment) = stream.next().await {
        reply.push_str(&fragment?);
    }
    Ok(reply)
}

/// Chat message author
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of chat history
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    #[must_use]
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

/// Bounded history of completed user/assistant exchanges
#[derive(Debug, Clone)]
pub struct Conversation {
    messages: VecDeque<ChatMessage>,
    max_exchanges: usize,
}

impl Conversation {
    #[must_use]
    pub fn new(max_exchanges: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(max_exchanges * 2),
            max_exchanges,
        }
    }

    /// Record a finished exchange, evicting the oldest beyond the bound
    pub fn push_exchange(&mut self, user: &str, assistant: &str) {
        if self.max_exchanges == 0 || assistant.trim().is_empty() {
            return;
        }
        self.messages.push_back(ChatMessage::user(user));
        self.messages.push_back(ChatMessage::assistant(assistant));
        while self.messages.len() > self.max_exchanges * 2 {
            self.messages.pop_front();
        }
    }

    /// Snapshot of the history, oldest first
    #[must_use]
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.messages.iter().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}
