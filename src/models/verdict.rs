//! Judge verdict and consensus types.
//!
//! Epistemic foundation:
//! - Verdict: one judge's B_i about one criterion
//! - JudgeParse: B_i(transcript is machine-readable) made explicit
//! - ConsensusDecision: three B_i combined into one decision

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Verdict on one criterion from one judge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Pass,
    Fail,
}

impl Verdict {
    /// Case-insensitive "pass" / "fail".
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("pass") {
            Some(Self::Pass)
        } else if s.eq_ignore_ascii_case("fail") {
            Some(Self::Fail)
        } else {
            None
        }
    }

    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

/// Outcome of parsing one judge transcript.
///
/// Serializes as a list of verdicts, or the string `"Parsing Error"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JudgeParse {
    Verdicts(Vec<Verdict>),
    ParsingError,
}

const PARSING_ERROR_TEXT: &str = "Parsing Error";

impl JudgeParse {
    pub fn verdicts(&self) -> Option<&[Verdict]> {
        match self {
            Self::Verdicts(v) => Some(v),
            Self::ParsingError => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::ParsingError)
    }
}

impl Serialize for JudgeParse {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Verdicts(v) => v.serialize(s),
            Self::ParsingError => s.serialize_str(PARSING_ERROR_TEXT),
        }
    }
}

impl<'de> Deserialize<'de> for JudgeParse {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Verdicts(Vec<Verdict>),
            Text(String),
        }

        match Wire::deserialize(d)? {
            Wire::Verdicts(v) => Ok(Self::Verdicts(v)),
            Wire::Text(t) if t == PARSING_ERROR_TEXT => Ok(Self::ParsingError),
            Wire::Text(t) => Err(serde::de::Error::custom(format!(
                "expected verdict list or '{PARSING_ERROR_TEXT}', got '{t}'"
            ))),
        }
    }
}

/// Consensus over three judge transcripts for one (criteria, instruction, response).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusDecision {
    pub overall: bool,
    pub verdicts: Vec<Verdict>,
    pub rationale: String,
}

/// Summary of one run, logged and printed at the end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStats {
    pub records: usize,
    pub turns: usize,
    pub failed_turns: usize,
    /// Judge runs only
    #[serde(skip_serializing_if = "Option::is_none")]
    pub passed_records: Option<usize>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunStats {
    pub fn pass_rate(&self) -> Option<f64> {
        let passed = self.passed_records?;
        if self.records == 0 {
            return Some(0.0);
        }
        Some(passed as f64 / self.records as f64)
    }

    pub fn runtime_secs(&self) -> f64 {
        (self.finished_at - self.started_at).num_milliseconds() as f64 / 1000.0
    }
}
