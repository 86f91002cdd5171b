//! Inference pipeline.
//!
//! Pipeline flow:
//! Dataset JSONL → ConversationRecords → Adaptor → sorted by index → JSONL

use super::{file_stem, read_jsonl, write_jsonl};
use crate::adaptor::{self, Adaptor};
use crate::models::{Config, ConversationRecord, Result, RunStats, compare_index};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::info;

/// Runs one dataset through the configured backend.
pub struct InferencePipeline {
    config: Config,
    /// Names the run in output file names
    label: String,
}

impl InferencePipeline {
    pub fn new(config: Config, label: impl Into<String>) -> Self {
        Self {
            config,
            label: label.into(),
        }
    }

    /// Run label for a `--config` argument: the file stem, or the model
    /// name for inline JSON.
    pub fn label_for(config_arg: &str, config: &Config) -> String {
        if config_arg.trim_start().starts_with('{') {
            config
                .model_name
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
                .collect()
        } else {
            file_stem(Path::new(config_arg))
        }
    }

    /// Load dataset records, keeping at most `sample_cnt`.
    pub fn load_dataset(path: &Path, sample_cnt: Option<usize>) -> Result<Vec<ConversationRecord>> {
        let records: Vec<ConversationRecord> = read_jsonl(path, sample_cnt)?;
        info!(count = records.len(), path = %path.display(), "Loaded dataset");
        Ok(records)
    }

    pub fn output_path(&self, output_dir: &Path, dataset: &Path) -> PathBuf {
        output_dir.join(format!("{}_{}.jsonl", self.label, file_stem(dataset)))
    }

    /// Load, run and write one dataset. Returns the run summary and output path.
    pub async fn run(
        &self,
        dataset: &Path,
        sample_cnt: Option<usize>,
        output_dir: &Path,
    ) -> Result<(RunStats, PathBuf)> {
        let records = Self::load_dataset(dataset, sample_cnt)?;
        let adaptor = adaptor::initialize(&self.config)?;

        let (records, stats) = self.infer(adaptor.as_ref(), records).await;
        adaptor.terminate();

        let path = self.output_path(output_dir, dataset);
        write_jsonl(&path, &records)?;
        info!(path = %path.display(), records = records.len(), "Wrote inference results");
        Ok((stats, path))
    }

    /// Drive every record to completion and restore input order.
    pub async fn infer(
        &self,
        adaptor: &dyn Adaptor,
        records: Vec<ConversationRecord>,
    ) -> (Vec<ConversationRecord>, RunStats) {
        let started_at = Utc::now();
        info!(
            records = records.len(),
            adaptor = adaptor.name(),
            model = %self.config.model_name,
            "Starting inference"
        );

        let mut done = adaptor.run(records).await;
        done.sort_by(|a, b| compare_index(&a.index, &b.index));

        let stats = RunStats {
            records: done.len(),
            turns: done.iter().map(|r| r.turns().len()).sum(),
            failed_turns: done.iter().map(ConversationRecord::failed_turns).sum(),
            passed_records: None,
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            records = stats.records,
            turns = stats.turns,
            failed_turns = stats.failed_turns,
            runtime_secs = stats.runtime_secs(),
            "Inference complete"
        );
        (done, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Role, TurnOutput};
    use async_trait::async_trait;
    use serde_json::{Value, json};

    /// Answers every turn with its own text reversed, finishing records in
    /// reverse order.
    struct Reverser;

    #[async_trait]
    impl Adaptor for Reverser {
        fn name(&self) -> &'static str {
            "reverser"
        }

        async fn run(&self, mut records: Vec<ConversationRecord>) -> Vec<ConversationRecord> {
            for record in &mut records {
                while let Some(turn) = record.next_turn() {
                    let response: String = turn.message.chars().rev().collect();
                    record.advance(TurnOutput {
                        response,
                        elapsed_time: 0.5,
                        ..TurnOutput::default()
                    });
                }
            }
            records.reverse();
            records
        }
    }

    fn config() -> Config {
        Config::from_json(r#"{"model_name": "org/model:v1", "backend": "vllm", "vllm": {"max_user_input_tokens": 64}}"#)
            .unwrap()
    }

    #[test]
    fn test_label_for_config_argument() {
        let config = config();
        assert_eq!(InferencePipeline::label_for("configs/qwen.toml", &config), "qwen");
        assert_eq!(InferencePipeline::label_for("{\"model_name\": \"x\"}", &config), "org_model_v1");
    }

    #[tokio::test]
    async fn test_infer_restores_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("bench.jsonl");
        std::fs::write(
            &dataset,
            concat!(
                "{\"index\": 2, \"input\": [\"sys\", \"abc\"], \"role\": [\"system\", \"user\"], \"category\": \"x\"}\n",
                "{\"index\": 0, \"input\": [\"hi\", \"yo\"]}\n",
                "{\"index\": 1, \"input\": [\"one\"]}\n",
            ),
        )
        .unwrap();

        let pipeline = InferencePipeline::new(config(), "qwen");
        let records = InferencePipeline::load_dataset(&dataset, None).unwrap();
        let (done, stats) = pipeline.infer(&Reverser, records).await;

        let order: Vec<Value> = done.iter().map(|r| r.index.clone()).collect();
        assert_eq!(order, vec![json!(0), json!(1), json!(2)]);
        assert_eq!(stats.records, 3);
        assert_eq!(stats.turns, 5);
        assert_eq!(stats.failed_turns, 0);

        let path = pipeline.output_path(&dir.path().join("results"), &dataset);
        assert!(path.ends_with("results/qwen_bench.jsonl"));
        write_jsonl(&path, &done).unwrap();

        let written: Vec<Value> = read_jsonl(&path, None).unwrap();
        let last = &written[2];
        assert_eq!(last["category"], "x");
        assert_eq!(last["role"], json!([Role::System, Role::User]));
        assert_eq!(last["response"], json!(["", "cba"]));
        assert_eq!(last["elapsed_time"], json!([0.0, 0.5]));
    }

    #[test]
    fn test_sample_cnt_limits_records() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = dir.path().join("d.jsonl");
        std::fs::write(&dataset, "{\"input\": [\"a\"]}\n{\"input\": [\"b\"]}\n{\"input\": [\"c\"]}\n").unwrap();

        let records = InferencePipeline::load_dataset(&dataset, Some(2)).unwrap();
        assert_eq!(records.len(), 2);
    }
}
