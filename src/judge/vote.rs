//! Three-judge consensus.
//!
//! Epistemic foundation:
//! - B_i: Each judge is noisy → per-criterion majority of three
//! - I^B: A transcript may not parse → fall back to the first valid judge
//! - K_i: `vote` is a pure function of its inputs

use crate::models::{ConsensusDecision, JudgeParse, Verdict};

/// Combine three parsed transcripts into one decision.
pub fn vote(parsed: &[JudgeParse; 3]) -> ConsensusDecision {
    let valid: Vec<(usize, &[Verdict])> = parsed
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.verdicts().map(|v| (i, v)))
        .collect();

    match valid.as_slice() {
        [] => ConsensusDecision {
            overall: false,
            verdicts: Vec::new(),
            rationale: "all three judges failed to parse".to_string(),
        },
        [(first, verdicts), ..] if valid.len() < parsed.len() => {
            let errored: Vec<String> = parsed
                .iter()
                .enumerate()
                .filter(|(_, p)| p.is_error())
                .map(|(i, _)| i.to_string())
                .collect();
            single_judge(
                verdicts,
                format!(
                    "judge {} failed to parse; decided by judge {first}",
                    errored.join(", ")
                ),
            )
        }
        [(_, v0), (_, v1), (_, v2)] if v0.len() != v1.len() || v0.len() != v2.len() => single_judge(
            v0,
            format!(
                "verdict count mismatch ({}, {}, {}); decided by judge 0",
                v0.len(),
                v1.len(),
                v2.len()
            ),
        ),
        [(_, v0), (_, v1), (_, v2)] => majority(v0, v1, v2),
        // Unreachable with three inputs; keep the fallback total.
        [(first, verdicts), ..] => single_judge(verdicts, format!("decided by judge {first}")),
    }
}

fn single_judge(verdicts: &[Verdict], rationale: String) -> ConsensusDecision {
    ConsensusDecision {
        overall: verdicts.iter().all(Verdict::is_pass),
        verdicts: verdicts.to_vec(),
        rationale,
    }
}

fn majority(v0: &[Verdict], v1: &[Verdict], v2: &[Verdict]) -> ConsensusDecision {
    let verdicts: Vec<Verdict> = v0
        .iter()
        .zip(v1)
        .zip(v2)
        .map(|((a, b), c)| {
            let passes = [a, b, c].iter().filter(|v| v.is_pass()).count();
            if passes >= 2 { Verdict::Pass } else { Verdict::Fail }
        })
        .collect();

    let failed: Vec<String> = verdicts
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_pass())
        .map(|(i, _)| (i + 1).to_string())
        .collect();

    let rationale = if failed.is_empty() {
        "pass".to_string()
    } else {
        format!("failed criteria {}", failed.join(","))
    };

    ConsensusDecision {
        overall: failed.is_empty(),
        verdicts,
        rationale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Verdict::{Fail, Pass};

    fn judge(v: &[Verdict]) -> JudgeParse {
        JudgeParse::Verdicts(v.to_vec())
    }

    #[test]
    fn test_majority_per_criterion() {
        // Criterion columns: [P,P,F], [P,F,F], [P,P,P]
        let parsed = [
            judge(&[Pass, Pass, Pass]),
            judge(&[Pass, Fail, Pass]),
            judge(&[Fail, Fail, Pass]),
        ];
        let decision = vote(&parsed);
        assert_eq!(decision.verdicts, vec![Pass, Fail, Pass]);
        assert!(!decision.overall);
        assert_eq!(decision.rationale, "failed criteria 2");
    }

    #[test]
    fn test_unanimous_pass() {
        let parsed = [judge(&[Pass, Pass]), judge(&[Pass, Fail]), judge(&[Pass, Pass])];
        let decision = vote(&parsed);
        assert!(decision.overall);
        assert_eq!(decision.rationale, "pass");
    }

    #[test]
    fn test_first_valid_judge_fallback() {
        let parsed = [JudgeParse::ParsingError, judge(&[Pass]), JudgeParse::ParsingError];
        let decision = vote(&parsed);
        assert_eq!(decision.verdicts, vec![Pass]);
        assert!(decision.overall);
        assert!(decision.rationale.contains("judge 1"));
        assert!(decision.rationale.starts_with("judge 0, 2 failed to parse"));

        // Two valid judges: still the first one, never a two-way majority.
        let parsed = [judge(&[Fail]), JudgeParse::ParsingError, judge(&[Pass])];
        let decision = vote(&parsed);
        assert_eq!(decision.verdicts, vec![Fail]);
        assert!(!decision.overall);
        assert!(decision.rationale.ends_with("decided by judge 0"));
    }

    #[test]
    fn test_all_errors_fail() {
        let parsed = [JudgeParse::ParsingError, JudgeParse::ParsingError, JudgeParse::ParsingError];
        let decision = vote(&parsed);
        assert!(!decision.overall);
        assert!(decision.verdicts.is_empty());
        assert_eq!(decision.rationale, "all three judges failed to parse");
    }

    #[test]
    fn test_length_mismatch_uses_judge_zero() {
        let parsed = [judge(&[Pass, Pass]), judge(&[Fail]), judge(&[Fail, Fail])];
        let decision = vote(&parsed);
        assert_eq!(decision.verdicts, vec![Pass, Pass]);
        assert!(decision.overall);
        assert!(decision.rationale.starts_with("verdict count mismatch (2, 1, 2)"));
    }

    #[test]
    fn test_vote_is_idempotent() {
        let parsed = [judge(&[Pass, Fail]), JudgeParse::ParsingError, judge(&[Fail, Fail])];
        assert_eq!(vote(&parsed), vote(&parsed));
    }
}
