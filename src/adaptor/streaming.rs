//! Streaming messages adaptor.

use super::Adaptor;
use crate::client::{AnthropicClient, ChatRequest, StreamingClient};
use crate::executor::{BoundedRunner, CompletionCounter, RecordDriver, RetryPolicy};
use crate::models::{Config, ConversationRecord, Result, SamplingParams};
use async_trait::async_trait;
use std::sync::Arc;

/// Each turn opens a stream and drains it into one reply.
pub struct StreamingAdaptor {
    driver: Arc<StreamingDriver>,
    concurrency: usize,
}

struct StreamingDriver {
    client: Arc<dyn StreamingClient>,
    model: String,
    sampling: SamplingParams,
    policy: RetryPolicy,
}

impl StreamingAdaptor {
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = AnthropicClient::from_config(config.anthropic_section()?)?;
        Ok(Self::with_client(
            Arc::new(client),
            config,
            RetryPolicy::from_config(config),
        ))
    }

    pub fn with_client(client: Arc<dyn StreamingClient>, config: &Config, policy: RetryPolicy) -> Self {
        Self {
            driver: Arc::new(StreamingDriver {
                client,
                model: config.model_name.clone(),
                sampling: config.sampling_params.clone(),
                policy,
            }),
            concurrency: config.concurrency,
        }
    }
}

#[async_trait]
impl RecordDriver for StreamingDriver {
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

            let client = &self.client;
            let request = &request;
            let output = self
                .policy
                .execute(&label, move || async move {
                    client.open_stream(request).await?.collect_reply().await
                })
                .await;

            record.advance(output);
        }

        record
    }
}

#[async_trait]
impl Adaptor for StreamingAdaptor {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    async fn run(&self, records: Vec<ConversationRecord>) -> Vec<ConversationRecord> {
        let counter = Arc::new(CompletionCounter::with_progress(records.len()));
        let runner = BoundedRunner::new(self.concurrency, Arc::clone(&counter));
        let done = runner.run(Arc::clone(&self.driver), records).await;
        counter.finish("inference complete");
        done
    }
}
