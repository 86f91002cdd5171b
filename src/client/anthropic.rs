//! Anthropic Messages streaming client.
//!
//! Epistemic foundation:
//! - K_i: Replies arrive as server-sent events; text and thinking come in
//!   distinct content blocks
//! - B_i: The stream runs to `message_stop` (might be cut off) → StreamHandle errors
//! - I^R: Direct API or Vertex AI publisher endpoint, chosen by `project_id`

use super::{
    ChatRequest, RateLimiter, StreamEvent, StreamHandle, StreamingClient, api_error,
    transport_error,
};
use crate::models::{AnthropicConfig, ConfigError, EvalError, Result, Role, resolve_secret};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

const VERTEX_ANTHROPIC_VERSION: &str = "vertex-2023-10-16";

/// The Messages API rejects requests without `max_tokens`.
const DEFAULT_MAX_TOKENS: u32 = 4096;

#[derive(Debug, Clone)]
enum Endpoint {
    Direct {
        base_url: String,
        api_key: String,
        version: String,
    },
    Vertex {
        url_prefix: String,
        access_token: String,
    },
}

/// Streaming Messages API client.
pub struct AnthropicClient {
    client: reqwest::Client,
    endpoint: Endpoint,
    timeout: Duration,
    rate_limiter: Arc<RateLimiter>,
}

impl AnthropicClient {
    pub fn from_config(config: &AnthropicConfig) -> Result<Self> {
        let endpoint = match &config.project_id {
            Some(project_id) => {
                let access_token = resolve_secret(
                    "anthropic",
                    "anthropic.access_token",
                    config.access_token.as_deref(),
                    &config.access_token_env,
                )?;
                Endpoint::Vertex {
                    url_prefix: format!(
                        "https://{}/v1/projects/{}/locations/{}/publishers/anthropic/models",
                        vertex_host(&config.location),
                        project_id,
                        config.location
                    ),
                    access_token,
                }
            }
            None => Endpoint::Direct {
                base_url: config.base_url.trim_end_matches('/').to_string(),
                api_key: resolve_secret(
                    "anthropic",
                    "anthropic.api_key",
                    config.api_key.as_deref(),
                    &config.api_key_env,
                )?,
                version: config.anthropic_version.clone(),
            },
        };

        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(EvalError::Network)?;

        Ok(Self {
            client,
            endpoint,
            timeout,
            rate_limiter: Arc::new(RateLimiter::new()),
        })
    }

    fn url(&self, model: &str) -> String {
        match &self.endpoint {
            Endpoint::Direct { base_url, .. } => format!("{base_url}/messages"),
            Endpoint::Vertex { url_prefix, .. } => {
                format!("{url_prefix}/{model}:streamRawPredict")
            }
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let invalid = |_| EvalError::from(ConfigError::InvalidValue {
            field: "anthropic credentials",
            reason: "contains characters not allowed in a header".to_string(),
        });

        match &self.endpoint {
            Endpoint::Direct {
                api_key, version, ..
            } => {
                headers.insert("x-api-key", HeaderValue::from_str(api_key).map_err(invalid)?);
                headers.insert(
                    "anthropic-version",
                    HeaderValue::from_str(version).map_err(invalid)?,
                );
            }
            Endpoint::Vertex { access_token, .. } => {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {access_token}")).map_err(invalid)?,
                );
            }
        }

        Ok(headers)
    }

    /// Request body. The system instruction is a top-level field and the
    /// message list carries only user/assistant entries.
    fn body(&self, request: &ChatRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .filter(|m| m.role != Role::System)
            .map(|m| {
                let role = if m.role == Role::Assistant { "assistant" } else { "user" };
                json!({"role": role, "content": m.content})
            })
            .collect();

        let mut body = Map::new();
        match &self.endpoint {
            Endpoint::Direct { .. } => {
                body.insert("model".into(), Value::from(request.model.clone()));
            }
            Endpoint::Vertex { .. } => {
                body.insert(
                    "anthropic_version".into(),
                    Value::from(VERTEX_ANTHROPIC_VERSION),
                );
            }
        }
        body.insert("messages".into(), Value::Array(messages));
        if let Some(system) = &request.system {
            body.insert("system".into(), Value::from(system.clone()));
        }
        for (key, value) in &request.sampling {
            body.insert(key.clone(), value.clone());
        }
        body.entry("max_tokens")
            .or_insert_with(|| Value::from(DEFAULT_MAX_TOKENS));
        body.insert("stream".into(), Value::Bool(true));
        Value::Object(body)
    }
}

fn vertex_host(location: &str) -> String {
    if location == "global" {
        "aiplatform.googleapis.com".to_string()
    } else {
        format!("{location}-aiplatform.googleapis.com")
    }
}

#[async_trait]
impl StreamingClient for AnthropicClient {
    async fn open_stream(&self, request: &ChatRequest) -> Result<StreamHandle> {
        self.rate_limiter.wait_if_needed(&request.model).await;

        debug!(model = %request.model, messages = request.messages.len(), "Opening message stream");

        let response = self
            .client
            .post(self.url(&request.model))
            .headers(self.headers()?)
            .json(&self.body(request))
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        let status = response.status().as_u16();
        self.rate_limiter
            .record_response(&request.model, status, response.headers());

        if !response.status().is_success() {
            return Err(api_error(response).await.into());
        }

        let (tx, rx) = mpsc::channel(64);
        let mut bytes = response.bytes_stream();

        tokio::spawn(async move {
            let mut parser = SseParser::default();
            while let Some(chunk) = bytes.next().await {
                let events = match chunk {
                    Ok(chunk) => parser.push(&chunk),
                    Err(e) => vec![StreamEvent::Error(format!("stream read failed: {e}"))],
                };
                for event in events {
                    let terminal = matches!(event, StreamEvent::Done | StreamEvent::Error(_));
                    if tx.send(event).await.is_err() || terminal {
                        return;
                    }
                }
            }
        });

        Ok(StreamHandle::new(rx))
    }
}

/// Incremental server-sent-events decoder for the Messages API.
///
/// Bytes may split lines and UTF-8 sequences anywhere; only complete lines
/// are decoded.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: Vec<u8>,
    event_type: String,
}

impl SseParser {
    /// Feed raw bytes, returning every event completed by them.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            let line = line.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                self.event_type.clear();
            } else if let Some(event) = line.strip_prefix("event:") {
                self.event_type = event.trim().to_string();
            } else if let Some(data) = line.strip_prefix("data:") {
                if let Some(event) = self.decode(data.trim()) {
                    events.push(event);
                }
            }
        }
        events
    }

    fn decode(&self, data: &str) -> Option<StreamEvent> {
        let data: Value = serde_json::from_str(data).ok()?;
        let event_type = if self.event_type.is_empty() {
            data.get("type")?.as_str()?.to_string()
        } else {
            self.event_type.clone()
        };
        decode_event(&event_type, &data)
    }
}

fn as_u32(v: &Value) -> Option<u32> {
    v.as_u64().map(|n| n as u32)
}

/// Map one decoded SSE payload to a stream event. Unknown events are skipped.
fn decode_event(event_type: &str, data: &Value) -> Option<StreamEvent> {
    match event_type {
        "message_start" => Some(StreamEvent::Usage {
            input_tokens: as_u32(&data["message"]["usage"]["input_tokens"]),
            output_tokens: None,
        }),
        "content_block_start" => {
            let block = &data["content_block"];
            match block["type"].as_str()? {
                "thinking" => block["thinking"]
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .map(|s| StreamEvent::ThinkingDelta(s.to_string())),
                "text" => block["text"]
                    .as_str()
                    .filter(|s| !s.is_empty())
                    .map(|s| StreamEvent::TextDelta(s.to_string())),
                _ => None,
            }
        }
        "content_block_delta" => {
            let delta = &data["delta"];
            match delta["type"].as_str()? {
                "text_delta" => Some(StreamEvent::TextDelta(delta["text"].as_str()?.to_string())),
                "thinking_delta" => Some(StreamEvent::ThinkingDelta(
                    delta["thinking"].as_str()?.to_string(),
                )),
                _ => None,
            }
        }
        "message_delta" => Some(StreamEvent::Usage {
            input_tokens: None,
            output_tokens: as_u32(&data["usage"]["output_tokens"]),
        }),
        "message_stop" => Some(StreamEvent::Done),
        "error" => Some(StreamEvent::Error(
            data["error"]["message"]
                .as_str()
                .unwrap_or("unknown stream error")
                .to_string(),
        )),
        _ => None,
    }
}
