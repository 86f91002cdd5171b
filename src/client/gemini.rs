//! Gemini chat sessions on Vertex AI.
//!
//! The REST API is stateless, so a session keeps its own history and
//! replays it on every call, the way chat SDKs do.

use super::{ChatReply, ChatSession, SessionClient, api_error, transport_error};
use crate::models::{
    ConfigError, EvalError, GeminiConfig, ProviderError, Result, SamplingParams, resolve_secret,
};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Deserialize;
use serde_json::{Value, json};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(default)]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
struct Part {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    #[serde(default)]
    prompt_token_count: Option<u32>,
    #[serde(default)]
    thoughts_token_count: Option<u32>,
    #[serde(default)]
    candidates_token_count: Option<u32>,
}

/// Opens Gemini chat sessions.
pub struct GeminiClient {
    client: reqwest::Client,
    url_prefix: String,
    headers: HeaderMap,
    timeout: Duration,
}

impl GeminiClient {
    pub fn from_config(config: &GeminiConfig) -> Result<Self> {
        let access_token = resolve_secret(
            "gemini",
            "gemini.access_token",
            config.access_token.as_deref(),
            &config.access_token_env,
        )?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {access_token}")).map_err(|_| {
                ConfigError::InvalidValue {
                    field: "gemini.access_token",
                    reason: "contains characters not allowed in a header".to_string(),
                }
            })?,
        );

        let host = if config.location == "global" {
            "aiplatform.googleapis.com".to_string()
        } else {
            format!("{}-aiplatform.googleapis.com", config.location)
        };

        let timeout = Duration::from_secs(config.http_timeout_secs);
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(EvalError::Network)?;

        Ok(Self {
            client,
            url_prefix: format!(
                "https://{host}/v1/projects/{}/locations/{}/publishers/google/models",
                config.project_id, config.location
            ),
            headers,
            timeout,
        })
    }
}

#[async_trait]
impl SessionClient for GeminiClient {
    async fn open_session(
        &self,
        model: &str,
        system: Option<&str>,
        sampling: &SamplingParams,
    ) -> Result<Box<dyn ChatSession>> {
        Ok(Box::new(GeminiSession {
            client: self.client.clone(),
            url: format!("{}/{model}:generateContent", self.url_prefix),
            headers: self.headers.clone(),
            timeout: self.timeout,
            system_instruction: system.map(|s| json!({"parts": [{"text": s}]})),
            generation_config: Value::Object(sampling.clone()),
            history: Vec::new(),
        }))
    }
}

/// One conversation against one model.
pub struct GeminiSession {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
    timeout: Duration,
    system_instruction: Option<Value>,
    generation_config: Value,
    history: Vec<Value>,
}

impl GeminiSession {
    async fn post(&self) -> Result<ChatReply> {
        let response = self
            .client
            .post(&self.url)
            .headers(self.headers.clone())
            .json(&self.body())
            .send()
            .await
            .map_err(|e| transport_error(e, self.timeout))?;

        if !response.status().is_success() {
            return Err(api_error(response).await.into());
        }

        let body: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("failed to parse response: {e}")))?;
        parse_generate(body)
    }

    fn body(&self) -> Value {
        let mut body = json!({
            "contents": self.history,
            "generationConfig": self.generation_config,
        });
        if let Some(system) = &self.system_instruction {
            body["systemInstruction"] = system.clone();
        }
        body
    }
}

/// Split parts into (reply text, thought text).
fn split_parts(parts: &[Part]) -> (String, String) {
    let mut text = String::new();
    let mut thought = String::new();
    for part in parts {
        if let Some(t) = &part.text {
            if part.thought {
                thought.push_str(t);
            } else {
                text.push_str(t);
            }
        }
    }
    (text, thought)
}

fn parse_generate(body: GenerateResponse) -> Result<ChatReply> {
    let content = body
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .ok_or_else(|| ProviderError::InvalidResponse("no candidates in response".to_string()))?;

    let (text, reasoning) = split_parts(&content.parts);
    let usage = body.usage_metadata.unwrap_or_default();

    Ok(ChatReply {
        text,
        reasoning,
        input_tokens: usage.prompt_token_count.unwrap_or(0),
        reasoning_tokens: usage.thoughts_token_count.unwrap_or(0),
        response_tokens: usage.candidates_token_count.unwrap_or(0),
    })
}

#[async_trait]
impl ChatSession for GeminiSession {
    async fn send_message(&mut self, message: &str) -> Result<ChatReply> {
        self.history
            .push(json!({"role": "user", "parts": [{"text": message}]}));

        debug!(turns = self.history.len(), "Sending session message");

        let result = self.post().await;

        match &result {
            Ok(reply) => self
                .history
                .push(json!({"role": "model", "parts": [{"text": reply.text}]})),
            Err(_) => {
                self.history.pop();
            }
        }
        result
    }
}
