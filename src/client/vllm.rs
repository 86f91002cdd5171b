//! vLLM server client for vectorized rounds.
//!
//! Epistemic foundation:
//! - K_i: The server applies the model's own chat template in `/tokenize`
//! - K_i: `/v1/completions` accepts a batch of token-id prompts in one call
//! - B_i: Every prompt in the batch gets exactly one choice (checked)

use super::{BatchEngine, api_error, transport_error};
use crate::models::{EvalError, Message, ProviderError, Result, SamplingParams, VllmConfig};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct TokenizeResponse {
    tokens: Vec<u32>,
}

#[derive(Debug, Deserialize)]
struct CompletionsResponse {
    #[serde(default)]
    choices: Vec<CompletionChoice>,
}

#[derive(Debug, Deserialize)]
struct CompletionChoice {
    index: usize,
    #[serde(default)]
    text: String,
}

/// Batch engine backed by a running vLLM OpenAI-compatible server.
pub struct VllmClient {
    client: reqwest::Client,
    base_url: String,
    model: String,
    template_kwargs: Map<String, Value>,
    timeout: Duration,
}

impl VllmClient {
    pub fn from_config(model: &str, config: &VllmConfig) -> Result<Self> {
        let mut template_kwargs = config.chat_template_kwargs.clone().unwrap_or_default();
        template_kwargs
            .entry("enable_thinking")
            .or_insert(Value::Bool(config.enable_thinking));

        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(EvalError::Network)?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            template_kwargs,
            timeout,
        })
    }

    async fn post<T: serde::de::DeserializeOwned>(&self, path: &str, body: &Value) -> Result<T> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        if !response.status().is_success() {
            return Err(api_error(response).await.into());
        }

        response.json().await.map_err(|e| {
            ProviderError::InvalidResponse(format!("failed to parse {path} response: {e}")).into()
        })
    }

    fn chat_tokenize_body(&self, messages: &[Message]) -> Value {
        json!({
            "model": self.model,
            "messages": messages,
            "add_generation_prompt": true,
            "chat_template_kwargs": self.template_kwargs,
        })
    }

    fn completions_body(&self, prompts: &[Vec<u32>], sampling: &SamplingParams) -> Value {
        let mut body = Map::new();
        body.insert("model".into(), Value::from(self.model.clone()));
        body.insert("prompt".into(), json!(prompts));
        for (key, value) in sampling {
            body.insert(key.clone(), value.clone());
        }
        Value::Object(body)
    }
}

/// Order choices by prompt index, requiring exactly one per prompt.
fn order_choices(mut choices: Vec<CompletionChoice>, expected: usize) -> Result<Vec<String>> {
    choices.sort_by_key(|c| c.index);
    let in_order = choices.iter().enumerate().all(|(i, c)| c.index == i);
    if choices.len() != expected || !in_order {
        return Err(ProviderError::InvalidResponse(format!(
            "expected {expected} choices indexed 0..{expected}, got {}",
            choices.len()
        ))
        .into());
    }
    Ok(choices.into_iter().map(|c| c.text).collect())
}

#[async_trait]
impl BatchEngine for VllmClient {
    async fn tokenize_chat(&self, messages: &[Message]) -> Result<Vec<u32>> {
        let response: TokenizeResponse = self
            .post("/tokenize", &self.chat_tokenize_body(messages))
            .await?;
        Ok(response.tokens)
    }

    async fn count_tokens(&self, text: &str) -> Result<u32> {
        if text.is_empty() {
            return Ok(0);
        }
        let body = json!({
            "model": self.model,
            "prompt": text,
            "add_special_tokens": false,
        });
        let response: TokenizeResponse = self.post("/tokenize", &body).await?;
        Ok(response.tokens.len() as u32)
    }

    async fn generate(
        &self,
        prompts: &[Vec<u32>],
        sampling: &SamplingParams,
    ) -> Result<Vec<String>> {
        if prompts.is_empty() {
            return Ok(Vec::new());
        }

        debug!(prompts = prompts.len(), "Submitting vectorized generation");

        let response: CompletionsResponse = self
            .post("/v1/completions", &self.completions_body(prompts, sampling))
            .await?;
        order_choices(response.choices, prompts.len())
    }
}
