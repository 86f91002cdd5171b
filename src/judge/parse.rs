//! Judge transcript parsing.

use crate::models::{JudgeParse, Verdict};
use serde_json::{Map, Value};

const FENCE_OPEN: &str = "```json";
const FENCE_CLOSE: &str = "```";

/// Parse the verdict block at the end of a judge transcript.
///
/// The last ```` ```json ```` fence wins. The block must be a JSON object of
/// criterion name to "pass"/"fail" (any case), in criterion order. Anything
/// else parses to `ParsingError`.
///
/// An empty `{}` block is also a `ParsingError` rather than a vacuous pass:
/// a judge that names no criteria has not graded the response.
pub fn parse_transcript(text: &str) -> JudgeParse {
    let Some(start) = text.rfind(FENCE_OPEN) else {
        return JudgeParse::ParsingError;
    };
    let block = &text[start + FENCE_OPEN.len()..];
    let block = block.split(FENCE_CLOSE).next().unwrap_or(block);

    let Ok(map) = serde_json::from_str::<Map<String, Value>>(block) else {
        return JudgeParse::ParsingError;
    };
    if map.is_empty() {
        return JudgeParse::ParsingError;
    }

    map.values()
        .map(|v| v.as_str().and_then(Verdict::parse))
        .collect::<Option<Vec<_>>>()
        .map_or(JudgeParse::ParsingError, JudgeParse::Verdicts)
}
