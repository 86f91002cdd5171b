//! OpenAI-compatible chat-completion client.
//!
//! Epistemic foundation:
//! - K_i: The chat-completions schema is shared by OpenAI, Azure OpenAI and
//!   most self-hosted servers
//! - B_i: API will respond within timeout (might fail)
//! - B_i: Response will be valid JSON (might fail)

use super::{ChatClient, ChatReply, ChatRequest, RateLimiter, api_error, transport_error};
use crate::models::{
    ConfigError, EvalError, Message, OPENAI_BASE_URL, OpenAiConfig, ProviderError, Result, Role,
    ServingType, resolve_secret,
};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    reasoning_content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: u32,
    #[serde(default)]
    completion_tokens: u32,
    #[serde(default)]
    completion_tokens_details: Option<CompletionTokensDetails>,
}

#[derive(Debug, Default, Deserialize)]
struct CompletionTokensDetails {
    #[serde(default)]
    reasoning_tokens: Option<u32>,
}

/// Where and how requests are addressed.
#[derive(Debug, Clone)]
enum Endpoint {
    OpenAi { url: String, api_key: Option<String> },
    Azure { url: String, api_key: String },
}

/// Chat-completion client for `openai` or `azure` serving.
pub struct OpenAiClient {
    client: reqwest::Client,
    endpoint: Endpoint,
    timeout: Duration,
    chat_template_kwargs: Option<Map<String, Value>>,
    rate_limiter: Arc<RateLimiter>,
}

impl OpenAiClient {
    /// Build from the `[openai]` section.
    ///
    /// The public OpenAI endpoint requires a key; custom `openai` endpoints
    /// (local servers) may run without one.
    pub fn from_config(model: &str, config: &OpenAiConfig) -> Result<Self> {
        let endpoint = match config.serving {
            ServingType::Openai => {
                let base = config.base_url.as_deref().unwrap_or(OPENAI_BASE_URL);
                let api_key = match resolve_secret(
                    "openai",
                    "openai.api_key",
                    config.api_key.as_deref(),
                    &config.api_key_env,
                ) {
                    Ok(key) => Some(key),
                    Err(ConfigError::MissingApiKey { .. }) if config.base_url.is_some() => None,
                    Err(e) => return Err(e.into()),
                };
                Endpoint::OpenAi {
                    url: format!("{}/chat/completions", base.trim_end_matches('/')),
                    api_key,
                }
            }
            ServingType::Azure => {
                let base = config
                    .base_url
                    .as_deref()
                    .ok_or(ConfigError::MissingField("openai.base_url"))?;
                let api_key = resolve_secret(
                    "azure",
                    "openai.api_key",
                    config.api_key.as_deref(),
                    &config.api_key_env,
                )?;
                Endpoint::Azure {
                    url: format!(
                        "{}/openai/deployments/{}/chat/completions?api-version={}",
                        base.trim_end_matches('/'),
                        model,
                        config.api_version
                    ),
                    api_key,
                }
            }
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
            chat_template_kwargs: config.chat_template_kwargs.clone(),
            rate_limiter: Arc::new(RateLimiter::new()),
        })
    }

    fn url(&self) -> &str {
        match &self.endpoint {
            Endpoint::OpenAi { url, .. } | Endpoint::Azure { url, .. } => url,
        }
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let invalid = |_| EvalError::from(ConfigError::InvalidValue {
            field: "openai.api_key",
            reason: "contains characters not allowed in a header".to_string(),
        });

        match &self.endpoint {
            Endpoint::OpenAi {
                api_key: Some(key), ..
            } => {
                headers.insert(
                    AUTHORIZATION,
                    HeaderValue::from_str(&format!("Bearer {key}")).map_err(invalid)?,
                );
            }
            Endpoint::OpenAi { api_key: None, .. } => {}
            Endpoint::Azure { api_key, .. } => {
                headers.insert("api-key", HeaderValue::from_str(api_key).map_err(invalid)?);
            }
        }

        Ok(headers)
    }

    /// Request body: model, messages with the system instruction first,
    /// then sampling parameters merged verbatim.
    fn body(&self, request: &ChatRequest) -> Value {
        let mut messages: Vec<Value> = Vec::with_capacity(request.messages.len() + 1);
        if let Some(system) = &request.system {
            messages.push(json!({"role": "system", "content": system}));
        }
        messages.extend(request.messages.iter().map(message_json));

        let mut body = Map::new();
        body.insert("model".into(), Value::from(request.model.clone()));
        body.insert("messages".into(), Value::Array(messages));
        for (key, value) in &request.sampling {
            body.insert(key.clone(), value.clone());
        }
        if let Some(kwargs) = &self.chat_template_kwargs {
            body.insert("chat_template_kwargs".into(), Value::Object(kwargs.clone()));
        }
        Value::Object(body)
    }
}

fn message_json(message: &Message) -> Value {
    let role = match message.role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
    };
    json!({"role": role, "content": message.content})
}

/// Extract the reply from a completion body.
///
/// Null content becomes `"error"`; response tokens exclude reasoning tokens.
fn parse_completion(body: CompletionResponse) -> Result<ChatReply> {
    let choice = body.choices.into_iter().next().ok_or_else(|| {
        ProviderError::InvalidResponse("no choices in completion response".to_string())
    })?;

    let usage = body.usage.unwrap_or_default();
    let reasoning_tokens = usage
        .completion_tokens_details
        .and_then(|d| d.reasoning_tokens)
        .unwrap_or(0);

    Ok(ChatReply {
        text: choice.message.content.unwrap_or_else(|| "error".to_string()),
        reasoning: choice.message.reasoning_content.unwrap_or_default(),
        input_tokens: usage.prompt_tokens,
        reasoning_tokens,
        response_tokens: usage.completion_tokens.saturating_sub(reasoning_tokens),
    })
}

#[async_trait]
impl ChatClient for OpenAiClient {
    async fn send(&self, request: &ChatRequest) -> Result<ChatReply> {
        self.rate_limiter.wait_if_needed(&request.model).await;

        debug!(model = %request.model, messages = request.messages.len(), "Sending chat completion");

        let response = self
            .client
            .post(self.url())
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

        let body: CompletionResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse response: {e}")))?;

        parse_completion(body)
    }
}
