//! Stateful chat-session adaptor.
//!
//! Epistemic foundation:
//! - I^B: A failed call can leave the remote session history inconsistent
//!   with the record → every retry restarts the record from turn zero
//! - K_i: After the last attempt the record is padded, so it still reaches
//!   the terminal state

use super::Adaptor;
use crate::client::{GeminiClient, SessionClient};
use crate::executor::{
    BoundedRunner, CompletionCounter, MAX_ATTEMPTS, RecordDriver, RetryPolicy, is_error_envelope,
};
use crate::models::{Config, ConversationRecord, EvalError, ProviderError, Result, SamplingParams};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub struct SessionAdaptor {
    driver: Arc<SessionDriver>,
    concurrency: usize,
}

struct SessionDriver {
    client: Arc<dyn SessionClient>,
    model: String,
    sampling: SamplingParams,
    /// Hard cap on one `send_message` call
    send_timeout: Duration,
    policy: RetryPolicy,
}

impl SessionAdaptor {
    pub fn from_config(config: &Config) -> Result<Self> {
        let section = config.gemini_section()?;
        let send_timeout = Duration::from_secs(section.send_timeout_secs);
        let client = GeminiClient::from_config(section)?;
        Ok(Self::with_client(
            Arc::new(client),
            config,
            RetryPolicy::from_config(config),
            send_timeout,
        ))
    }

    pub fn with_client(
        client: Arc<dyn SessionClient>,
        config: &Config,
        policy: RetryPolicy,
        send_timeout: Duration,
    ) -> Self {
        Self {
            driver: Arc::new(SessionDriver {
                client,
                model: config.model_name.clone(),
                sampling: config.sampling_params.clone(),
                send_timeout,
                policy,
            }),
            concurrency: config.concurrency,
        }
    }
}

impl SessionDriver {
    /// Run the record's remaining turns in one fresh session.
    async fn attempt_record(&self, record: &mut ConversationRecord) -> Result<()> {
        let system = record.system_instruction();
        let mut session = self
            .client
            .open_session(&self.model, system.as_deref(), &self.sampling)
            .await?;

        loop {
            record.advance_system_turns();
            let Some(turn) = record.next_turn() else {
                return Ok(());
            };
            let message = turn.message.clone();

            let start = Instant::now();
            let reply = tokio::time::timeout(self.send_timeout, session.send_message(&message))
                .await
                .map_err(|_| EvalError::Timeout(self.send_timeout))??;

            if is_error_envelope(&reply.text) {
                return Err(ProviderError::InvalidResponse(reply.text).into());
            }

            record.advance(reply.into_output(start.elapsed()));
        }
    }
}

#[async_trait]
impl RecordDriver for SessionDriver {
    async fn drive(&self, mut record: ConversationRecord) -> ConversationRecord {
        let label = record.index.to_string();

        for attempt in 1..=MAX_ATTEMPTS {
            let error = match self.attempt_record(&mut record).await {
                Ok(()) => {
                    debug!(record = %label, attempt, "Session completed");
                    return record;
                }
                Err(e) => e,
            };
            let message = format!("Exception occured : {error}");

            if attempt == MAX_ATTEMPTS {
                warn!(record = %label, error = %error, "Max retries reached, padding remaining turns");
                record.pad_failed(&message);
                return record;
            }

            warn!(
                record = %label,
                attempt,
                completed_turns = record.completed_turns(),
                error = %error,
                "Session failed, restarting record"
            );
            record.reset();
            tokio::time::sleep(self.policy.delay(attempt)).await;
        }

        record
    }
}

#[async_trait]
impl Adaptor for SessionAdaptor {
    fn name(&self) -> &'static str {
        "gemini"
    }

    async fn run(&self, records: Vec<ConversationRecord>) -> Vec<ConversationRecord> {
        let counter = Arc::new(CompletionCounter::with_progress(records.len()));
        let runner = BoundedRunner::new(self.concurrency, Arc::clone(&counter));
        let done = runner.run(Arc::clone(&self.driver), records).await;
        counter.finish("inference complete");
        done
    }
}
