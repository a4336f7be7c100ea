//! OpenAI-compatible streaming chat client

use std::collections::VecDeque;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use super::{ChatMessage, ReplyGenerator, ReplyStream};
use crate::{Error, Result};

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ChatChunk {
    #[serde(default)]
    choices: Vec<ChunkChoice>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct ChunkChoice {
    #[serde(default)]
    delta: ChunkDelta,
}

#[derive(Deserialize, Default)]
struct ChunkDelta {
    content: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

/// One parsed server-sent-events line
#[derive(Debug, PartialEq, Eq)]
pub enum SseLine {
    /// Reply text
    Delta(String),
    /// `data: [DONE]`
    Done,
    /// Blank line, comment, non-data field or a chunk without content
    Skip,
}

/// Parse one line of a chat completion event stream
///
/// # Errors
///
/// Returns error if a data line is not a valid chunk or carries an API error
pub fn parse_sse_line(line: &str) -> Result<SseLine> {
    let line = line.trim();
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim_start();

    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let chunk: ChatChunk = serde_json::from_str(data)
        .map_err(|e| Error::Generation(format!("malformed stream chunk: {e}")))?;

    if let Some(error) = chunk.error {
        return Err(Error::Generation(error.message));
    }

    Ok(chunk
        .choices
        .into_iter()
        .next()
        .and_then(|choice| choice.delta.content)
        .filter(|content| !content.is_empty())
        .map_or(SseLine::Skip, SseLine::Delta))
}

/// Chat completion client for any OpenAI-compatible endpoint
pub struct OpenAiChat {
    client: reqwest::Client,
    base_url: String,
    api_key: SecretString,
    model: String,
    system_prompt: Option<String>,
    max_tokens: Option<u32>,
    temperature: Option<f32>,
}

impl OpenAiChat {
    #[must_use]
    pub fn new(base_url: impl Into<String>, api_key: SecretString, model: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
            model: model.into(),
            system_prompt: None,
            max_tokens: None,
            temperature: None,
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt.filter(|p| !p.trim().is_empty());
        self
    }

    #[must_use]
    pub const fn with_max_tokens(mut self, max_tokens: Option<u32>) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    #[must_use]
    pub const fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    fn build_messages(&self, history: &[ChatMessage], text: &str) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(history.len() + 2);
        if let Some(prompt) = &self.system_prompt {
            messages.push(ChatMessage::system(prompt.clone()));
        }
        messages.extend_from_slice(history);
        messages.push(ChatMessage::user(text));
        messages
    }
}

#[async_trait]
impl ReplyGenerator for OpenAiChat {
    async fn generate_stream(&self, history: &[ChatMessage], text: &str) -> Result<ReplyStream> {
        let request = ChatRequest {
            model: &self.model,
            messages: self.build_messages(history, text),
            stream: true,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        tracing::debug!(model = %self.model, history = history.len(), "requesting reply stream");

        let mut builder = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .json(&request);
        if !self.api_key.expose_secret().is_empty() {
            builder = builder.bearer_auth(self.api_key.expose_secret());
        }

        let response = builder.send().await.map_err(|e| {
            tracing::error!(error = %e, "chat request failed");
            Error::Generation(e.to_string())
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            tracing::error!(status = %status, body = %body, "chat API error");
            return Err(Error::Generation(format!("chat API error {status}: {body}")));
        }

        Ok(sse_fragments(response.bytes_stream().boxed()))
    }
}

struct SseState {
    body: BoxStream<'static, reqwest::Result<Bytes>>,
    buffer: Vec<u8>,
    pending: VecDeque<String>,
    failure: Option<Error>,
    finished: bool,
}

impl SseState {
    /// Parse every complete line in the buffer
    fn drain_lines(&mut self, flush: bool) -> Result<()> {
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.handle_line(&line)?;
            if self.finished {
                self.buffer.clear();
                return Ok(());
            }
        }
        if flush && !self.buffer.is_empty() {
            let line = std::mem::take(&mut self.buffer);
            self.handle_line(&line)?;
        }
        Ok(())
    }

    fn handle_line(&mut self, line: &[u8]) -> Result<()> {
        match parse_sse_line(&String::from_utf8_lossy(line))? {
            SseLine::Delta(text) => self.pending.push_back(text),
            SseLine::Done => self.finished = true,
            SseLine::Skip => {}
        }
        Ok(())
    }
}

/// Turn a raw event-stream body into reply fragments
fn sse_fragments(body: BoxStream<'static, reqwest::Result<Bytes>>) -> ReplyStream {
    let state = SseState {
        body,
        buffer: Vec::new(),
        pending: VecDeque::new(),
        failure: None,
        finished: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        loop {
            if let Some(fragment) = state.pending.pop_front() {
                return Some((Ok(fragment), state));
            }
            if let Some(e) = state.failure.take() {
                return Some((Err(e), state));
            }
            if state.finished {
                return None;
            }

            let step = match state.body.next().await {
                Some(Ok(chunk)) => {
                    state.buffer.extend_from_slice(&chunk);
                    state.drain_lines(false)
                }
                Some(Err(e)) => Err(Error::Generation(e.to_string())),
                None => {
                    let flushed = state.drain_lines(true);
                    state.finished = true;
                    flushed
                }
            };

            if let Err(e) = step {
                state.finished = true;
                state.failure = Some(e);
            }
        }
    })
    .boxed()
}
