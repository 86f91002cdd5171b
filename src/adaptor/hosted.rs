//! Hosted chat-completion adaptor.

use super::Adaptor;
use crate::client::{ChatClient, ChatRequest, OpenAiClient, TokenCounter};
use crate::executor::{BoundedRunner, CompletionCounter, RecordDriver, RetryPolicy};
use crate::models::{Config, ConversationRecord, Result, SamplingParams};
use async_trait::async_trait;
use std::sync::Arc;

/// One round trip per turn, with optional local re-tokenization.
pub struct HostedAdaptor {
    driver: Arc<HostedDriver>,
    concurrency: usize,
}

struct HostedDriver {
    client: Arc<dyn ChatClient>,
    model: String,
    sampling: SamplingParams,
    policy: RetryPolicy,
    token_counter: Option<TokenCounter>,
}

impl HostedAdaptor {
    pub fn from_config(config: &Config) -> Result<Self> {
        let section = config.openai_section()?;
        let client = OpenAiClient::from_config(&config.model_name, section)?;
        let token_counter = section
            .tokenizer
            .as_deref()
            .map(TokenCounter::load)
            .transpose()?;

        Ok(Self::build(
            Arc::new(client),
            config,
            RetryPolicy::from_config(config),
            token_counter,
        ))
    }

    /// Build around any chat client.
    pub fn with_client(client: Arc<dyn ChatClient>, config: &Config, policy: RetryPolicy) -> Self {
        Self::build(client, config, policy, None)
    }

    fn build(
        client: Arc<dyn ChatClient>,
        config: &Config,
        policy: RetryPolicy,
        token_counter: Option<TokenCounter>,
    ) -> Self {
        Self {
            driver: Arc::new(HostedDriver {
                client,
                model: config.model_name.clone(),
                sampling: config.sampling_params.clone(),
                policy,
                token_counter,
            }),
            concurrency: config.concurrency,
        }
    }
}

#[async_trait]
impl RecordDriver for HostedDriver {
    async fn drive(&self, mut record: ConversationRecord) -> ConversationRecord {
        let label = record.index.to_string();

        loop {
            record.advance_system_turns();
            if record.is_complete() {
                break;
            }

            let request = ChatRequest {
                model: self.model.clone(),
                system: record.system_instruction(),
                messages: record.pending_messages(),
                sampling: self.sampling.clone(),
            };

            let mut output = self
                .policy
                .execute(&label, || self.client.send(&request))
                .await;

            if let Some(counter) = &self.token_counter {
                if !output.is_failed() {
                    output.reasoning_tokens = counter.count(&output.reasoning_text);
                    output.response_tokens = counter.count(&output.response);
                }
            }

            record.advance(output);
        }

        record
    }
}

#[async_trait]
impl Adaptor for HostedAdaptor {
    fn name(&self) -> &'static str {
        "openai"
    }

    async fn run(&self, records: Vec<ConversationRecord>) -> Vec<ConversationRecord> {
        let counter = Arc::new(CompletionCounter::with_progress(records.len()));
        let runner = BoundedRunner::new(self.concurrency, Arc::clone(&counter));
        let done = runner.run(Arc::clone(&self.driver), records).await;
        counter.finish("inference complete");
        done
    }
}
