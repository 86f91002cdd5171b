//! Provider clients.
//!
//! Epistemic foundation:
//! - K_i: Every backend answers "one chat turn in, one reply out" in some shape
//! - B_i: The backend will answer (might fail) → Result
//! - I^B: Transport details differ per backend and stay behind these traits
//!
//! Clients make exactly one request per call. Retrying is the executor's job.

mod anthropic;
mod gemini;
mod openai;
mod rate_limiter;
mod tokenizer;
mod vllm;

pub use anthropic::*;
pub use gemini::*;
pub use openai::*;
pub use rate_limiter::*;
pub use tokenizer::*;
pub use vllm::*;

use crate::models::{Message, ProviderError, Result, SamplingParams, TurnOutput};
use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;

/// One chat turn to send.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    /// Consolidated system instruction, kept out of `messages`
    pub system: Option<String>,
    pub messages: Vec<Message>,
    /// Merged verbatim into the backend request body
    pub sampling: SamplingParams,
}

/// Reply to one chat turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChatReply {
    pub text: String,
    pub reasoning: String,
    pub input_tokens: u32,
    pub reasoning_tokens: u32,
    pub response_tokens: u32,
}

impl ChatReply {
    pub fn into_output(self, elapsed: Duration) -> TurnOutput {
        TurnOutput {
            response: self.text,
            reasoning_text: self.reasoning,
            input_tokens: self.input_tokens,
            reasoning_tokens: self.reasoning_tokens,
            response_tokens: self.response_tokens,
            elapsed_time: elapsed.as_secs_f64(),
        }
    }
}

/// Hosted chat-completion API: one request, one reply.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send(&self, request: &ChatRequest) -> Result<ChatReply>;
}

/// Event decoded from a streaming reply.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    ThinkingDelta(String),
    Usage {
        input_tokens: Option<u32>,
        output_tokens: Option<u32>,
    },
    Error(String),
    Done,
}

/// Receiving end of a streaming reply.
pub struct StreamHandle {
    pub receiver: mpsc::Receiver<StreamEvent>,
}

impl StreamHandle {
    pub fn new(receiver: mpsc::Receiver<StreamEvent>) -> Self {
        Self { receiver }
    }

    /// Drain the stream into one reply.
    ///
    /// A stream that closes before `Done` is an error: the reply may be cut off.
    pub async fn collect_reply(mut self) -> Result<ChatReply> {
        let mut reply = ChatReply::default();

        while let Some(event) = self.receiver.recv().await {
            match event {
                StreamEvent::TextDelta(text) => reply.text.push_str(&text),
                StreamEvent::ThinkingDelta(text) => reply.reasoning.push_str(&text),
                StreamEvent::Usage {
                    input_tokens,
                    output_tokens,
                } => {
                    if let Some(n) = input_tokens {
                        reply.input_tokens = n;
                    }
                    if let Some(n) = output_tokens {
                        reply.response_tokens = n;
                    }
                }
                StreamEvent::Error(message) => {
                    return Err(ProviderError::Stream(message).into());
                }
                StreamEvent::Done => return Ok(reply),
            }
        }

        Err(ProviderError::Stream("stream closed before completion".to_string()).into())
    }
}

/// Streaming chat API: the reply arrives as a sequence of events.
#[async_trait]
pub trait StreamingClient: Send + Sync {
    async fn open_stream(&self, request: &ChatRequest) -> Result<StreamHandle>;
}

/// Stateful chat API: a session carries its system instruction and history.
#[async_trait]
pub trait SessionClient: Send + Sync {
    async fn open_session(
        &self,
        model: &str,
        system: Option<&str>,
        sampling: &SamplingParams,
    ) -> Result<Box<dyn ChatSession>>;
}

/// One open chat session.
#[async_trait]
pub trait ChatSession: Send {
    async fn send_message(&mut self, message: &str) -> Result<ChatReply>;
}

/// Local batch-inference engine.
#[async_trait]
pub trait BatchEngine: Send + Sync {
    /// Apply the chat template and return prompt token ids.
    async fn tokenize_chat(&self, messages: &[Message]) -> Result<Vec<u32>>;

    /// Count tokens of plain text, without special tokens.
    async fn count_tokens(&self, text: &str) -> Result<u32>;

    /// One vectorized generation call. Output `i` answers `prompts[i]`.
    async fn generate(
        &self,
        prompts: &[Vec<u32>],
        sampling: &SamplingParams,
    ) -> Result<Vec<String>>;
}

/// Map a non-success HTTP response to a provider error.
///
/// Prefers the `error.message` field of a JSON error body.
pub(crate) async fn api_error(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();

    let message = serde_json::from_str::<serde_json::Value>(&body)
        .ok()
        .and_then(|v| {
            v.pointer("/error/message")
                .or_else(|| v.pointer("/message"))
                .and_then(|m| m.as_str())
                .map(str::to_string)
        })
        .unwrap_or(body);

    ProviderError::Api { status, message }
}

/// Map a transport failure, separating timeouts.
pub(crate) fn transport_error(e: reqwest::Error, timeout: Duration) -> crate::models::EvalError {
    if e.is_timeout() {
        crate::models::EvalError::Timeout(timeout)
    } else {
        crate::models::EvalError::Network(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_reply_accumulates() {
        let (tx, rx) = mpsc::channel(16);
        for event in [
            StreamEvent::Usage {
                input_tokens: Some(12),
                output_tokens: None,
            },
            StreamEvent::ThinkingDelta("let me ".into()),
            StreamEvent::ThinkingDelta("think".into()),
            StreamEvent::TextDelta("Hello".into()),
            StreamEvent::TextDelta(", world".into()),
            StreamEvent::Usage {
                input_tokens: None,
                output_tokens: Some(5),
            },
            StreamEvent::Done,
        ] {
            tx.send(event).await.unwrap();
        }

        let reply = StreamHandle::new(rx).collect_reply().await.unwrap();
        assert_eq!(reply.text, "Hello, world");
        assert_eq!(reply.reasoning, "let me think");
        assert_eq!(reply.input_tokens, 12);
        assert_eq!(reply.response_tokens, 5);
        assert_eq!(reply.reasoning_tokens, 0);
    }

    #[tokio::test]
    async fn test_collect_reply_error_and_truncation() {
        let (tx, rx) = mpsc::channel(4);
        tx.send(StreamEvent::TextDelta("par".into())).await.unwrap();
        tx.send(StreamEvent::Error("overloaded".into())).await.unwrap();
        assert!(StreamHandle::new(rx).collect_reply().await.is_err());

        let (tx, rx) = mpsc::channel(4);
        tx.send(StreamEvent::TextDelta("par".into())).await.unwrap();
        drop(tx);
        assert!(StreamHandle::new(rx).collect_reply().await.is_err());
    }

    #[test]
    fn test_reply_into_output() {
        let reply = ChatReply {
            text: "hi".into(),
            input_tokens: 3,
            response_tokens: 1,
            ..ChatReply::default()
        };
        let output = reply.into_output(Duration::from_millis(1500));
        assert_eq!(output.response, "hi");
        assert_eq!(output.elapsed_time, 1.5);
        assert!(!output.is_failed());
    }
}
