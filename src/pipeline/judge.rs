//! Judge pipeline.
//!
//! Pipeline flow:
//! Inference JSONL → 3 judge conversations per graded turn → Adaptor →
//! parse → vote → JSONL
//!
//! Epistemic foundation:
//! - K_i: Every judge conversation carries its position as index, so
//!   transcripts regroup exactly whatever order the adaptor returns
//! - B_i: A judge transcript is machine-readable → `JudgeParse::ParsingError`
//!   otherwise, absorbed by the vote

use super::{file_stem, read_jsonl, write_jsonl};
use crate::adaptor::{self, Adaptor};
use crate::judge::{JUDGES_PER_TURN, JudgePrompts, parse_transcript, vote};
use crate::models::{
    Config, ConfigError, ConversationRecord, JudgeParse, Result, Role, RunStats, TurnOutput,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// One line of an inference output file.
#[derive(Debug, Clone, Deserialize)]
pub struct EvaluatedRecord {
    #[serde(default)]
    pub index: Value,
    pub input: Vec<String>,
    #[serde(default)]
    pub role: Vec<Role>,
    pub response: Vec<String>,
    #[serde(default)]
    pub think: Vec<String>,
    #[serde(default)]
    pub input_tokens: Vec<u32>,
    #[serde(default)]
    pub think_tokens: Vec<u32>,
    #[serde(default)]
    pub response_tokens: Vec<u32>,
    #[serde(default)]
    pub elapsed_time: Vec<f64>,
    /// One entry per turn: a criteria string or a list of criteria
    #[serde(default)]
    pub criteria: Vec<Value>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EvaluatedRecord {
    fn is_system(&self, turn: usize) -> bool {
        self.role.get(turn).is_some_and(|r| *r == Role::System)
    }

    fn response_at(&self, turn: usize) -> &str {
        self.response.get(turn).map(String::as_str).unwrap_or_default()
    }
}

/// Judge results for one graded record.
#[derive(Debug, Clone, Serialize)]
pub struct JudgedRecord {
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    pub index: Value,
    pub criteria: Vec<Value>,
    pub input: Vec<String>,
    pub role: Vec<Role>,
    pub response: Vec<String>,
    pub think: Vec<String>,
    pub inference_input_tokens: Vec<u32>,
    pub inference_think_tokens: Vec<u32>,
    pub inference_response_tokens: Vec<u32>,
    pub inference_elapsed_time: Vec<f64>,
    /// Per turn, the three transcripts
    pub judge: Vec<Vec<String>>,
    pub judge_parsed: Vec<Vec<JudgeParse>>,
    /// Per turn, the consensus rationale
    pub vote_logs: Vec<String>,
    pub turn_pass: Vec<bool>,
    pub judge_input_tokens: Vec<Vec<u32>>,
    pub judge_think_tokens: Vec<Vec<u32>>,
    pub judge_response_tokens: Vec<Vec<u32>>,
    pub judge_elapsed_time: Vec<Vec<f64>>,
    pub pass: bool,
}

impl JudgedRecord {
    fn new(record: EvaluatedRecord) -> Self {
        let mut extra = record.extra;
        extra.remove("accumulated_conversations");
        Self {
            extra,
            index: record.index,
            criteria: record.criteria,
            input: record.input,
            role: record.role,
            response: record.response,
            think: record.think,
            inference_input_tokens: record.input_tokens,
            inference_think_tokens: record.think_tokens,
            inference_response_tokens: record.response_tokens,
            inference_elapsed_time: record.elapsed_time,
            judge: Vec::new(),
            judge_parsed: Vec::new(),
            vote_logs: Vec::new(),
            turn_pass: Vec::new(),
            judge_input_tokens: Vec::new(),
            judge_think_tokens: Vec::new(),
            judge_response_tokens: Vec::new(),
            judge_elapsed_time: Vec::new(),
            pass: true,
        }
    }

    /// System turns are not graded and never fail the record.
    fn push_ungraded(&mut self) {
        self.judge.push(Vec::new());
        self.judge_parsed.push(Vec::new());
        self.vote_logs.push("system turn, not graded".to_string());
        self.turn_pass.push(true);
        self.judge_input_tokens.push(Vec::new());
        self.judge_think_tokens.push(Vec::new());
        self.judge_response_tokens.push(Vec::new());
        self.judge_elapsed_time.push(Vec::new());
    }

    fn push_graded(&mut self, outputs: &[TurnOutput]) {
        let transcripts: Vec<String> = outputs.iter().map(|o| o.response.clone()).collect();
        let parsed: Vec<JudgeParse> = transcripts.iter().map(|t| parse_transcript(t)).collect();
        let decision = match <&[JudgeParse; JUDGES_PER_TURN]>::try_from(parsed.as_slice()) {
            Ok(three) => vote(three),
            Err(_) => vote(&[JudgeParse::ParsingError, JudgeParse::ParsingError, JudgeParse::ParsingError]),
        };

        self.pass &= decision.overall;
        self.turn_pass.push(decision.overall);
        self.vote_logs.push(decision.rationale);
        self.judge.push(transcripts);
        self.judge_parsed.push(parsed);
        self.judge_input_tokens.push(outputs.iter().map(|o| o.input_tokens).collect());
        self.judge_think_tokens.push(outputs.iter().map(|o| o.reasoning_tokens).collect());
        self.judge_response_tokens.push(outputs.iter().map(|o| o.response_tokens).collect());
        self.judge_elapsed_time.push(outputs.iter().map(|o| o.elapsed_time).collect());
    }
}

/// Grades inference output with three judge runs per turn.
pub struct JudgePipeline {
    config: Config,
    prompts: JudgePrompts,
}

impl JudgePipeline {
    /// B_i(judge templates readable) → Result
    pub fn new(config: Config) -> Result<Self> {
        let section = config.judge.as_ref().ok_or(ConfigError::MissingField("judge"))?;
        let prompts = JudgePrompts::load(section)?;
        Ok(Self::with_prompts(config, prompts))
    }

    pub fn with_prompts(config: Config, prompts: JudgePrompts) -> Self {
        Self { config, prompts }
    }

    pub fn load_evaluated(path: &Path) -> Result<Vec<EvaluatedRecord>> {
        let records: Vec<EvaluatedRecord> = read_jsonl(path, None)?;
        info!(count = records.len(), path = %path.display(), "Loaded inference results");
        Ok(records)
    }

    pub fn output_path(output_dir: &Path, eval_file: &Path) -> PathBuf {
        output_dir.join(format!("{}_eval_result.jsonl", file_stem(eval_file)))
    }

    /// Load, grade and write one inference output file.
    pub async fn run(&self, eval_file: &Path, output_dir: &Path) -> Result<(RunStats, PathBuf)> {
        let records = Self::load_evaluated(eval_file)?;
        let adaptor = adaptor::initialize(&self.config)?;

        let (judged, stats) = self.judge(adaptor.as_ref(), records).await;
        adaptor.terminate();

        let path = Self::output_path(output_dir, eval_file);
        write_jsonl(&path, &judged)?;
        info!(path = %path.display(), records = judged.len(), "Wrote judge results");
        Ok((stats, path))
    }

    /// (record, turn) pairs to grade, with their judge conversations.
    fn schedule(&self, records: &[EvaluatedRecord]) -> (Vec<(usize, usize)>, Vec<ConversationRecord>) {
        let mut jobs = Vec::new();
        let mut conversations = Vec::new();

        for (r, record) in records.iter().enumerate() {
            if record.criteria.len() < record.input.len() {
                warn!(
                    index = %record.index,
                    criteria = record.criteria.len(),
                    turns = record.input.len(),
                    "Missing criteria for some turns, grading them with empty criteria"
                );
            }

            let mut previous: Vec<(&str, &str)> = Vec::new();
            for (t, instruction) in record.input.iter().enumerate() {
                if record.is_system(t) {
                    continue;
                }
                let criteria = record.criteria.get(t).unwrap_or(&Value::Null);
                let response = record.response_at(t);
                let turns = self.prompts.build(criteria, &previous, instruction, response);
                previous.push((instruction, response));

                let job = jobs.len();
                jobs.push((r, t));
                for j in 0..JUDGES_PER_TURN {
                    conversations.push(ConversationRecord::new(
                        json!(job * JUDGES_PER_TURN + j),
                        turns.clone(),
                    ));
                }
            }
        }

        (jobs, conversations)
    }

    /// Run every judge conversation in one batch and vote per turn.
    pub async fn judge(
        &self,
        adaptor: &dyn Adaptor,
        records: Vec<EvaluatedRecord>,
    ) -> (Vec<JudgedRecord>, RunStats) {
        let started_at = Utc::now();
        let (jobs, conversations) = self.schedule(&records);
        info!(
            records = records.len(),
            graded_turns = jobs.len(),
            judge_calls = conversations.len(),
            adaptor = adaptor.name(),
            "Starting judge run"
        );

        let mut slots: Vec<Option<TurnOutput>> = vec![None; conversations.len()];
        for conversation in adaptor.run(conversations).await {
            let position = conversation.index.as_u64().map(|p| p as usize);
            match (position, conversation.outputs().last()) {
                (Some(p), Some(output)) if p < slots.len() => slots[p] = Some(output.clone()),
                _ => warn!(index = %conversation.index, "Dropping unexpected judge conversation"),
            }
        }
        let outputs: Vec<TurnOutput> = slots
            .into_iter()
            .map(|s| s.unwrap_or_else(|| TurnOutput::failed("judge conversation missing")))
            .collect();
        let failed_turns = outputs.iter().filter(|o| o.is_failed()).count();

        let mut judged: Vec<JudgedRecord> = records.into_iter().map(JudgedRecord::new).collect();
        let mut graded = jobs.iter().zip(outputs.chunks(JUDGES_PER_TURN)).peekable();

        for (r, record) in judged.iter_mut().enumerate() {
            for t in 0..record.input.len() {
                match graded.next_if(|((job_r, job_t), _)| *job_r == r && *job_t == t) {
                    Some((_, three)) => record.push_graded(three),
                    None => record.push_ungraded(),
                }
            }
        }

        let stats = RunStats {
            records: judged.len(),
            turns: jobs.len(),
            failed_turns,
            passed_records: Some(judged.iter().filter(|r| r.pass).count()),
            started_at,
            finished_at: Utc::now(),
        };

        info!(
            records = stats.records,
            passed = stats.passed_records,
            failed_judge_calls = stats.failed_turns,
            runtime_secs = stats.runtime_secs(),
            "Judge run complete"
        );
        (judged, stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    /// Replies to a judge prompt with the transcript keyed by its response text.
    struct ScriptedJudge {
        replies: Vec<(&'static str, [&'static str; 3])>,
    }

    #[async_trait]
    impl Adaptor for ScriptedJudge {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn run(&self, records: Vec<ConversationRecord>) -> Vec<ConversationRecord> {
            let mut done = Vec::new();
            for mut record in records {
                let judge = record.index.as_u64().unwrap() as usize % 3;
                record.advance_system_turns();
                let prompt = record.next_turn().unwrap().message.clone();
                let reply = self
                    .replies
                    .iter()
                    .find(|(marker, _)| prompt.contains(marker))
                    .map(|(_, r)| r[judge].to_string())
                    .unwrap_or_default();
                record.advance(TurnOutput {
                    response: reply,
                    input_tokens: 10,
                    elapsed_time: 1.0,
                    ..TurnOutput::default()
                });
                done.push(record);
            }
            // Out of order on purpose.
            done.reverse();
            done
        }
    }

    fn verdict(v: &str) -> &'static str {
        match v {
            "pass" => "ok\n```json\n{\"criteria_1\": \"PASS\"}\n```",
            "fail" => "no\n```json\n{\"criteria_1\": \"FAIL\"}\n```",
            _ => "I refuse to use the format",
        }
    }

    fn pipeline() -> JudgePipeline {
        let config = Config::from_json(
            r#"{"model_name": "judge-model", "backend": "openai", "openai": {"api_key": "k"}}"#,
        )
        .unwrap();
        let prompts = JudgePrompts {
            system: "judge".into(),
            user: "C:___CRITERIA___ R:___RESPONSE___".into(),
            user_multiturn: "C:___CRITERIA___ H:___CONVERSATIONS___ R:___RESPONSE___".into(),
        };
        JudgePipeline::with_prompts(config, prompts)
    }

    fn evaluated(line: Value) -> EvaluatedRecord {
        serde_json::from_value(line).unwrap()
    }

    #[tokio::test]
    async fn test_three_judges_per_turn_and_vote() {
        let records = vec![
            evaluated(json!({
                "index": 0, "category": "math",
                "input": ["q1", "q2"], "role": ["user", "user"],
                "response": ["resp-a", "resp-b"], "criteria": [["c"], "d"],
                "accumulated_conversations": []
            })),
            evaluated(json!({
                "index": 1,
                "input": ["sys", "q"], "role": ["system", "user"],
                "response": ["", "resp-c"], "criteria": ["", ["e"]]
            })),
        ];
        let adaptor = ScriptedJudge {
            replies: vec![
                ("R:resp-a", [verdict("pass"), verdict("fail"), verdict("pass")]),
                ("R:resp-b", [verdict("junk"), verdict("fail"), verdict("pass")]),
                ("R:resp-c", [verdict("pass"), verdict("pass"), verdict("junk")]),
            ],
        };

        let (judged, stats) = pipeline().judge(&adaptor, records).await;

        assert_eq!(stats.records, 2);
        assert_eq!(stats.turns, 3);
        assert_eq!(stats.passed_records, Some(1));

        let first = &judged[0];
        assert_eq!(first.judge.len(), 2);
        assert_eq!(first.judge[0].len(), 3);
        assert_eq!(first.turn_pass, vec![true, false]);
        assert!(!first.pass);
        assert!(first.vote_logs[1].contains("decided by judge 1"));
        assert_eq!(first.judge_parsed[1][0], JudgeParse::ParsingError);
        assert_eq!(first.judge_input_tokens[0], vec![10, 10, 10]);
        assert!(!first.extra.contains_key("accumulated_conversations"));

        let second = &judged[1];
        assert!(second.judge[0].is_empty());
        assert_eq!(second.turn_pass, vec![true, true]);
        assert!(second.pass);

        let line = serde_json::to_value(first).unwrap();
        assert_eq!(line["category"], "math");
        assert_eq!(line["judge_parsed"][1][0], "Parsing Error");
        assert_eq!(line["judge_parsed"][0][0], json!(["pass"]));
        assert_eq!(line["pass"], false);
    }

    #[test]
    fn test_schedule_builds_multiturn_prompts() {
        let pipeline = pipeline();
        let records = vec![evaluated(json!({
            "input": ["q1", "q2"], "response": ["r1", "r2"], "criteria": ["x", "y"]
        }))];

        let (jobs, conversations) = pipeline.schedule(&records);
        assert_eq!(jobs, vec![(0, 0), (0, 1)]);
        assert_eq!(conversations.len(), 6);
        assert_eq!(conversations[5].index, json!(5));
        assert_eq!(conversations[0].turns()[1].message, "C:x R:r1");
        assert_eq!(
            conversations[3].turns()[1].message,
            "C:y H:User: q1\nAssistant: r1\n R:r2"
        );
    }

    #[test]
    fn test_output_path() {
        let path = JudgePipeline::output_path(Path::new("eval_results"), Path::new("results/qwen_bench.jsonl"));
        assert_eq!(path, Path::new("eval_results/qwen_bench_eval_result.jsonl"));
    }
}
