//! Self-hosted batch adaptor.
//!
//! Epistemic foundation:
//! - K_i: One vectorized generate call per round, over every member's prompt
//! - K_i: Prompt length ≤ `max_input_tokens` after center truncation
//! - I^B: Tokenization may fail per record → only that record's turn degrades
//! - I^B: The generate call may fail or come back short → every member of
//!   the round degrades

use super::Adaptor;
use crate::client::{BatchEngine, VllmClient};
use crate::executor::CompletionCounter;
use crate::models::{Config, ConversationRecord, Message, Result, Role, SamplingParams, TurnOutput};
use crate::scheduler::{RoundScheduler, truncate_center};
use async_trait::async_trait;
use futures::future::join_all;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub struct BatchAdaptor {
    engine: Arc<dyn BatchEngine>,
    sampling: SamplingParams,
    max_input_tokens: usize,
    response_prefix: Option<String>,
}

impl BatchAdaptor {
    pub fn from_config(config: &Config) -> Result<Self> {
        let section = config.vllm_section()?;
        let engine = VllmClient::from_config(&config.model_name, section)?;
        Ok(Self::with_engine(
            Arc::new(engine),
            config,
            section.max_user_input_tokens,
            section.response_prefix.clone(),
        ))
    }

    pub fn with_engine(
        engine: Arc<dyn BatchEngine>,
        config: &Config,
        max_input_tokens: usize,
        response_prefix: Option<String>,
    ) -> Self {
        Self {
            engine,
            sampling: config.sampling_params.clone(),
            max_input_tokens,
            response_prefix,
        }
    }

    /// Chat-templated, truncated prompt for a member's next turn.
    async fn prompt(&self, record: &ConversationRecord) -> Result<Vec<u32>> {
        let mut messages = Vec::new();
        if let Some(system) = record.system_instruction() {
            messages.push(Message::new(Role::System, system));
        }
        messages.extend(record.pending_messages());

        let tokens = self.engine.tokenize_chat(&messages).await?;
        Ok(truncate_center(tokens, self.max_input_tokens))
    }

    /// Split generated text into (reasoning, response).
    ///
    /// Without the marker in the text, everything is the response.
    fn split_response(&self, text: &str) -> (String, String) {
        let split = self
            .response_prefix
            .as_deref()
            .and_then(|prefix| text.split_once(prefix));
        match split {
            Some((think, response)) => (think.trim().to_string(), response.trim().to_string()),
            None => (String::new(), text.trim().to_string()),
        }
    }

    async fn count_or_zero(&self, text: &str) -> u32 {
        match self.engine.count_tokens(text).await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "Token count failed, recording 0");
                0
            }
        }
    }

    /// Advance every member by exactly one turn.
    async fn run_round(&self, members: &mut [ConversationRecord]) {
        let prompts = join_all(members.iter().map(|record| self.prompt(record))).await;

        // Members whose prompt could be built take part in the generate call.
        let mut slots = Vec::new();
        let mut batch = Vec::new();
        for (i, prompt) in prompts.into_iter().enumerate() {
            match prompt {
                Ok(tokens) => {
                    slots.push(i);
                    batch.push(tokens);
                }
                Err(e) => {
                    warn!(index = %members[i].index, error = %e, "Tokenization failed, degrading turn");
                    members[i].advance(TurnOutput::failed(e.to_string()));
                }
            }
        }

        if batch.is_empty() {
            return;
        }

        let start = Instant::now();
        let generated = self.engine.generate(&batch, &self.sampling).await;
        let elapsed = start.elapsed().as_secs_f64();

        let generated = match generated {
            Ok(texts) if texts.len() == batch.len() => Ok(texts),
            Ok(texts) => Err(format!(
                "engine returned {} completions for {} prompts",
                texts.len(),
                batch.len()
            )),
            Err(e) => Err(e.to_string()),
        };
        let texts = match generated {
            Ok(texts) => texts,
            Err(message) => {
                warn!(members = slots.len(), error = %message, "Batch generate failed, degrading round");
                for &i in &slots {
                    members[i].advance(TurnOutput::failed(message.clone()));
                }
                return;
            }
        };

        let outputs = join_all(texts.iter().zip(&batch).map(|(text, prompt)| async move {
            let (think, response) = self.split_response(text);
            let reasoning_tokens = self.count_or_zero(&think).await;
            let response_tokens = self.count_or_zero(&response).await;
            TurnOutput {
                response,
                reasoning_text: think,
                input_tokens: prompt.len() as u32,
                reasoning_tokens,
                response_tokens,
                elapsed_time: elapsed,
            }
        }))
        .await;

        for (&i, output) in slots.iter().zip(outputs) {
            members[i].advance(output);
        }
    }
}

#[async_trait]
impl Adaptor for BatchAdaptor {
    fn name(&self) -> &'static str {
        "vllm"
    }

    async fn run(&self, records: Vec<ConversationRecord>) -> Vec<ConversationRecord> {
        let total = records.len();
        let counter = CompletionCounter::with_progress(total);
        let mut scheduler = RoundScheduler::new(records);

        while let Some(mut round) = scheduler.next_round() {
            info!(round = round.number, members = round.members.len(), "Running batch round");
            self.run_round(&mut round.members).await;

            for _ in round.members.iter().filter(|r| r.is_complete()) {
                counter.increment().await;
            }
            scheduler.requeue(round.members);
        }

        // Records that finished on system turns never joined a round's members.
        while counter.count().await < total {
            counter.increment().await;
        }

        info!(rounds = scheduler.rounds_run(), "Batch inference complete");
        counter.finish("inference complete");
        scheduler.into_done()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EvalError, FAILED_ELAPSED, ProviderError, Turn};
    use serde_json::json;
    use std::sync::Mutex;

    /// One token per character; generation echoes the prompt length.
    #[derive(Default)]
    struct StubEngine {
        batch_sizes: Mutex<Vec<usize>>,
        fail_generate: bool,
        fail_tokenize_for: Option<String>,
        reply: Option<String>,
        drop_last: bool,
    }

    #[async_trait]
    impl BatchEngine for StubEngine {
        async fn tokenize_chat(&self, messages: &[Message]) -> Result<Vec<u32>> {
            let text: String = messages.iter().map(|m| m.content.as_str()).collect();
            if let Some(bad) = &self.fail_tokenize_for {
                if text.contains(bad.as_str()) {
                    return Err(EvalError::from(ProviderError::Api {
                        status: 400,
                        message: "bad prompt".into(),
                    }));
                }
            }
            Ok(text.chars().map(|c| c as u32).collect())
        }

        async fn count_tokens(&self, text: &str) -> Result<u32> {
            Ok(text.split_whitespace().count() as u32)
        }

        async fn generate(&self, prompts: &[Vec<u32>], _sampling: &SamplingParams) -> Result<Vec<String>> {
            self.batch_sizes.lock().unwrap().push(prompts.len());
            if self.fail_generate {
                return Err(EvalError::from(ProviderError::Api {
                    status: 503,
                    message: "engine down".into(),
                }));
            }
            let mut texts: Vec<String> = prompts
                .iter()
                .map(|p| self.reply.clone().unwrap_or_else(|| format!("len {}", p.len())))
                .collect();
            if self.drop_last {
                texts.pop();
            }
            Ok(texts)
        }
    }

    fn config() -> Config {
        Config::from_json(
            r#"{"model_name": "qwen3", "backend": "vllm",
                "vllm": {"max_user_input_tokens": 8192}}"#,
        )
        .unwrap()
    }

    fn record(index: usize, turns: usize) -> ConversationRecord {
        let turns = (0..turns).map(|t| Turn::new(Role::User, format!("q{t}"))).collect();
        ConversationRecord::new(json!(index), turns)
    }

    #[tokio::test]
    async fn test_rounds_follow_turn_counts() {
        let engine = Arc::new(StubEngine::default());
        let adaptor = BatchAdaptor::with_engine(engine.clone(), &config(), 8192, None);

        let out = adaptor.run(vec![record(0, 1), record(1, 2), record(2, 3)]).await;

        assert_eq!(*engine.batch_sizes.lock().unwrap(), vec![3, 2, 1]);
        assert_eq!(out.len(), 3);
        assert!(out.iter().all(|r| r.is_complete() && r.failed_turns() == 0));

        // Turn 2's prompt carried turn 1's reply: "q0" + "len 2" + "q1".
        let longest = out.iter().find(|r| r.index == json!(2)).unwrap();
        assert_eq!(longest.outputs()[1].input_tokens, 9);
        assert_eq!(longest.outputs()[1].response, "len 9");
        assert!(longest.outputs().iter().all(|o| o.elapsed_time >= 0.0));
    }

    #[tokio::test]
    async fn test_long_prompt_is_center_truncated() {
        let engine = Arc::new(StubEngine::default());
        let adaptor = BatchAdaptor::with_engine(engine, &config(), 6, None);

        let long = ConversationRecord::new(json!(0), vec![Turn::new(Role::User, "x".repeat(50))]);
        let out = adaptor.run(vec![long]).await;

        assert_eq!(out[0].outputs()[0].input_tokens, 6);
        assert_eq!(out[0].outputs()[0].response, "len 6");
    }

    #[tokio::test]
    async fn test_response_prefix_splits_reasoning() {
        let engine = Arc::new(StubEngine {
            reply: Some("  weigh the options \n</think>\n  final answer ".into()),
            ..StubEngine::default()
        });
        let adaptor = BatchAdaptor::with_engine(engine, &config(), 8192, Some("</think>".into()));

        let out = adaptor.run(vec![record(0, 1)]).await;
        let output = &out[0].outputs()[0];

        assert_eq!(output.reasoning_text, "weigh the options");
        assert_eq!(output.response, "final answer");
        assert_eq!(output.reasoning_tokens, 3);
        assert_eq!(output.response_tokens, 2);
    }

    #[tokio::test]
    async fn test_missing_prefix_keeps_text_as_response() {
        let engine = Arc::new(StubEngine {
            reply: Some("  The answer is 42.  ".into()),
            ..StubEngine::default()
        });
        let adaptor = BatchAdaptor::with_engine(engine, &config(), 8192, Some("</think>".into()));

        let out = adaptor.run(vec![record(0, 1)]).await;
        let output = &out[0].outputs()[0];

        assert_eq!(output.response, "The answer is 42.");
        assert_eq!(output.reasoning_text, "");
        assert_eq!(output.reasoning_tokens, 0);
        assert_eq!(output.response_tokens, 4);
    }

    #[tokio::test]
    async fn test_short_generate_degrades_whole_round() {
        let engine = Arc::new(StubEngine {
            drop_last: true,
            ..StubEngine::default()
        });
        let adaptor = BatchAdaptor::with_engine(engine.clone(), &config(), 8192, None);

        let out = adaptor.run(vec![record(0, 1), record(1, 1)]).await;

        assert_eq!(*engine.batch_sizes.lock().unwrap(), vec![2]);
        for record in &out {
            assert!(record.is_complete());
            let output = &record.outputs()[0];
            assert!(output.is_failed());
            assert_eq!(output.response, "engine returned 1 completions for 2 prompts");
        }
    }

    #[tokio::test]
    async fn test_failures_degrade_round_or_record() {
        let engine = Arc::new(StubEngine {
            fail_generate: true,
            ..StubEngine::default()
        });
        let adaptor = BatchAdaptor::with_engine(engine.clone(), &config(), 8192, None);

        let out = adaptor.run(vec![record(0, 2), record(1, 1)]).await;
        assert_eq!(*engine.batch_sizes.lock().unwrap(), vec![2, 1]);
        for record in &out {
            assert!(record.is_complete());
            assert!(record.outputs().iter().all(|o| o.elapsed_time == FAILED_ELAPSED));
            assert_eq!(record.outputs()[0].response, "Error code: 503 - engine down");
        }

        let engine = Arc::new(StubEngine {
            fail_tokenize_for: Some("poison".into()),
            ..StubEngine::default()
        });
        let adaptor = BatchAdaptor::with_engine(engine.clone(), &config(), 8192, None);
        let poisoned = ConversationRecord::new(json!(1), vec![Turn::new(Role::User, "poison")]);

        let out = adaptor.run(vec![record(0, 1), poisoned]).await;
        assert_eq!(*engine.batch_sizes.lock().unwrap(), vec![1]);
        let bad = out.iter().find(|r| r.index == json!(1)).unwrap();
        assert!(bad.outputs()[0].is_failed());
        let good = out.iter().find(|r| r.index == json!(0)).unwrap();
        assert_eq!(good.outputs()[0].response, "len 2");
    }

    #[tokio::test]
    async fn test_system_turns_take_no_slot() {
        let engine = Arc::new(StubEngine::default());
        let adaptor = BatchAdaptor::with_engine(engine.clone(), &config(), 8192, None);

        let only_system = ConversationRecord::new(json!(0), vec![Turn::new(Role::System, "s")]);
        let mixed = ConversationRecord::new(
            json!(1),
            vec![Turn::new(Role::System, "sys"), Turn::new(Role::User, "hi")],
        );

        let out = adaptor.run(vec![only_system, mixed]).await;
        assert_eq!(*engine.batch_sizes.lock().unwrap(), vec![1]);

        let mixed = out.iter().find(|r| r.index == json!(1)).unwrap();
        assert_eq!(mixed.outputs()[0], TurnOutput::system_placeholder());
        // System instruction leads the prompt: "sys" + "hi".
        assert_eq!(mixed.outputs()[1].input_tokens, 5);
    }
}
