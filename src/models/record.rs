//! Conversation record types.
//!
//! K_i: A record's turns are fixed at creation. Its outputs grow by exactly
//! one entry per processed turn, in turn order.

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use tracing::warn;

/// Elapsed-time sentinel recorded for a turn that failed.
pub const FAILED_ELAPSED: f64 = -1.0;

/// Speaker of a turn or message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    #[default]
    User,
    Assistant,
}

/// One entry of the accumulated conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// One scripted turn of a record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Turn {
    pub role: Role,
    pub message: String,
}

impl Turn {
    pub fn new(role: Role, message: impl Into<String>) -> Self {
        Self {
            role,
            message: message.into(),
        }
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}

/// Outputs produced by one turn.
///
/// Keeping all per-turn fields in one struct means the parallel output
/// columns can never drift apart in length.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TurnOutput {
    pub response: String,
    pub reasoning_text: String,
    pub input_tokens: u32,
    pub reasoning_tokens: u32,
    pub response_tokens: u32,
    /// Seconds; `FAILED_ELAPSED` marks a degraded turn
    pub elapsed_time: f64,
}

impl TurnOutput {
    /// Empty output recorded for system-role turns.
    pub fn system_placeholder() -> Self {
        Self::default()
    }

    /// Degraded output: the error text becomes the response.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            response: message.into(),
            elapsed_time: FAILED_ELAPSED,
            ..Self::default()
        }
    }

    pub fn is_failed(&self) -> bool {
        self.elapsed_time < 0.0
    }
}

/// One multi-turn exchange and its accumulated results.
///
/// Lifecycle: created with turns only, advanced one turn at a time by the
/// executor that owns it, terminal once every turn has an output.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationRecord {
    /// Opaque ordering key carried through from the input
    pub index: Value,
    turns: Vec<Turn>,
    conversation: Vec<Message>,
    outputs: Vec<TurnOutput>,
    /// Input fields not interpreted here, written back verbatim
    extra: Map<String, Value>,
}

impl ConversationRecord {
    pub fn new(index: Value, turns: Vec<Turn>) -> Self {
        Self {
            index,
            turns,
            conversation: Vec::new(),
            outputs: Vec::new(),
            extra: Map::new(),
        }
    }

    pub fn with_extra(mut self, extra: Map<String, Value>) -> Self {
        self.extra = extra;
        self
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }

    pub fn outputs(&self) -> &[TurnOutput] {
        &self.outputs
    }

    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    pub fn completed_turns(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_complete(&self) -> bool {
        self.outputs.len() == self.turns.len()
    }

    /// The next unprocessed turn, if any.
    pub fn next_turn(&self) -> Option<&Turn> {
        self.turns.get(self.outputs.len())
    }

    /// All system turns consolidated into one instruction, joined by a blank line.
    pub fn system_instruction(&self) -> Option<String> {
        let prompts: Vec<&str> = self
            .turns
            .iter()
            .filter(|t| t.is_system())
            .map(|t| t.message.as_str())
            .collect();

        if prompts.is_empty() {
            None
        } else {
            Some(prompts.join("\n\n"))
        }
    }

    /// Message list for the next turn: prior non-system exchanges plus the
    /// next turn's message. System turns travel in `system_instruction`.
    pub fn pending_messages(&self) -> Vec<Message> {
        let mut messages: Vec<Message> = self
            .conversation
            .iter()
            .filter(|m| m.role != Role::System)
            .cloned()
            .collect();

        if let Some(turn) = self.next_turn() {
            messages.push(Message::new(turn.role, turn.message.clone()));
        }

        messages
    }

    /// Record the output of the next turn.
    ///
    /// System turns always store the empty placeholder, whatever is passed.
    /// Non-system turns also append the assistant reply to the conversation.
    pub fn advance(&mut self, output: TurnOutput) {
        let Some(turn) = self.turns.get(self.outputs.len()) else {
            warn!(index = %self.index, "Ignoring output for an already complete record");
            return;
        };

        self.conversation
            .push(Message::new(turn.role, turn.message.clone()));

        if turn.is_system() {
            self.outputs.push(TurnOutput::system_placeholder());
        } else {
            self.conversation
                .push(Message::new(Role::Assistant, output.response.clone()));
            self.outputs.push(output);
        }
    }

    /// Advance past consecutive system turns. Returns how many were skipped.
    pub fn advance_system_turns(&mut self) -> usize {
        let mut skipped = 0;
        while self.next_turn().is_some_and(Turn::is_system) {
            self.advance(TurnOutput::system_placeholder());
            skipped += 1;
        }
        skipped
    }

    /// Discard every output and the accumulated conversation.
    pub fn reset(&mut self) {
        self.conversation.clear();
        self.outputs.clear();
    }

    /// Fill every unprocessed turn with a degraded output.
    ///
    /// The first unprocessed non-system turn carries `message`; later ones
    /// point back at it. System turns keep the empty placeholder.
    pub fn pad_failed(&mut self, message: &str) {
        let mut first = true;
        while let Some(turn) = self.turns.get(self.outputs.len()) {
            if turn.is_system() {
                self.outputs.push(TurnOutput::system_placeholder());
            } else if first {
                self.outputs.push(TurnOutput::failed(message));
                first = false;
            } else {
                self.outputs.push(TurnOutput::failed(format!(
                    "Error on previous turns : {message}"
                )));
            }
        }
    }

    /// Number of turns that ended degraded.
    pub fn failed_turns(&self) -> usize {
        self.outputs.iter().filter(|o| o.is_failed()).count()
    }
}

/// Fields written by the executor; never copied from `extra`.
const OUTPUT_FIELDS: &[&str] = &[
    "index",
    "input",
    "role",
    "accumulated_conversations",
    "response",
    "think",
    "input_tokens",
    "think_tokens",
    "response_tokens",
    "elapsed_time",
];

/// One dataset line.
#[derive(Debug, Deserialize)]
struct DatasetLine {
    #[serde(default)]
    index: Value,
    input: Vec<String>,
    #[serde(default)]
    role: Option<Vec<Role>>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl From<DatasetLine> for ConversationRecord {
    fn from(line: DatasetLine) -> Self {
        let roles = line
            .role
            .unwrap_or_else(|| vec![Role::User; line.input.len()]);

        if roles.len() != line.input.len() {
            warn!(
                index = %line.index,
                roles = roles.len(),
                inputs = line.input.len(),
                "Malformed input: length of role and input mismatch"
            );
        }

        let turns = roles
            .into_iter()
            .zip(line.input)
            .map(|(role, message)| Turn { role, message })
            .collect();

        let mut extra = line.extra;
        for field in OUTPUT_FIELDS {
            extra.remove(*field);
        }

        ConversationRecord::new(line.index, turns).with_extra(extra)
    }
}

impl<'de> Deserialize<'de> for ConversationRecord {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        DatasetLine::deserialize(deserializer).map(Self::from)
    }
}

impl Serialize for ConversationRecord {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut map = serializer.serialize_map(None)?;
        for (key, value) in &self.extra {
            map.serialize_entry(key, value)?;
        }
        map.serialize_entry("index", &self.index)?;

        let inputs: Vec<&str> = self.turns.iter().map(|t| t.message.as_str()).collect();
        let roles: Vec<Role> = self.turns.iter().map(|t| t.role).collect();
        map.serialize_entry("input", &inputs)?;
        map.serialize_entry("role", &roles)?;
        map.serialize_entry("accumulated_conversations", &self.conversation)?;

        let column = |f: fn(&TurnOutput) -> Value| -> Vec<Value> {
            self.outputs.iter().map(f).collect()
        };
        map.serialize_entry("response", &column(|o| Value::from(o.response.as_str())))?;
        map.serialize_entry("think", &column(|o| Value::from(o.reasoning_text.as_str())))?;
        map.serialize_entry("input_tokens", &column(|o| Value::from(o.input_tokens)))?;
        map.serialize_entry("think_tokens", &column(|o| Value::from(o.reasoning_tokens)))?;
        map.serialize_entry("response_tokens", &column(|o| Value::from(o.response_tokens)))?;
        map.serialize_entry("elapsed_time", &column(|o| Value::from(o.elapsed_time)))?;
        map.end()
    }
}

/// Total order over opaque index values: nulls, booleans, numbers, strings, then the rest.
pub fn compare_index(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (x.as_f64().unwrap_or(0.0), y.as_f64().unwrap_or(0.0));
            x.total_cmp(&y)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ if rank(a) == rank(b) => a.to_string().cmp(&b.to_string()),
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(roles: &[Role]) -> ConversationRecord {
        let turns = roles
            .iter()
            .enumerate()
            .map(|(i, r)| Turn::new(*r, format!("turn {i}")))
            .collect();
        ConversationRecord::new(json!(0), turns)
    }

    fn reply(text: &str) -> TurnOutput {
        TurnOutput {
            response: text.to_string(),
            input_tokens: 10,
            response_tokens: 3,
            elapsed_time: 0.5,
            ..TurnOutput::default()
        }
    }

    #[test]
    fn test_advance_builds_conversation() {
        let mut rec = record(&[Role::System, Role::User, Role::User]);
        assert_eq!(rec.advance_system_turns(), 1);
        assert_eq!(rec.system_instruction().as_deref(), Some("turn 0"));

        let pending = rec.pending_messages();
        assert_eq!(pending, vec![Message::new(Role::User, "turn 1")]);

        rec.advance(reply("first"));
        let pending = rec.pending_messages();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[1], Message::new(Role::Assistant, "first"));
        assert_eq!(pending[2], Message::new(Role::User, "turn 2"));

        rec.advance(reply("second"));
        assert!(rec.is_complete());
        assert_eq!(rec.conversation().len(), 5);
        assert_eq!(rec.conversation()[0].role, Role::System);
    }

    #[test]
    fn test_system_turn_ignores_given_output() {
        let mut rec = record(&[Role::User, Role::System]);
        rec.advance(reply("hello"));
        rec.advance(reply("should not be stored"));
        assert_eq!(rec.outputs()[1], TurnOutput::system_placeholder());
        assert_eq!(rec.outputs()[1].elapsed_time, 0.0);
    }

    #[test]
    fn test_system_instructions_joined() {
        let rec = record(&[Role::System, Role::User, Role::System]);
        assert_eq!(
            rec.system_instruction().as_deref(),
            Some("turn 0\n\nturn 2")
        );
        assert!(record(&[Role::User]).system_instruction().is_none());
    }

    #[test]
    fn test_pad_failed_completes_record() {
        let mut rec = record(&[Role::User, Role::User, Role::User]);
        rec.advance(reply("ok"));
        rec.pad_failed("Exception occured : boom");

        assert!(rec.is_complete());
        assert_eq!(rec.failed_turns(), 2);
        assert_eq!(rec.outputs()[1].response, "Exception occured : boom");
        assert_eq!(
            rec.outputs()[2].response,
            "Error on previous turns : Exception occured : boom"
        );
        assert_eq!(rec.outputs()[2].elapsed_time, FAILED_ELAPSED);
        assert_eq!(rec.outputs()[2].input_tokens, 0);

        let mut rec = record(&[Role::User, Role::System, Role::User]);
        rec.pad_failed("Exception occured : boom");

        assert!(rec.is_complete());
        assert_eq!(rec.failed_turns(), 2);
        assert_eq!(rec.outputs()[0].response, "Exception occured : boom");
        assert_eq!(rec.outputs()[1], TurnOutput::system_placeholder());
        assert_eq!(
            rec.outputs()[2].response,
            "Error on previous turns : Exception occured : boom"
        );
    }

    #[test]
    fn test_reset_clears_progress() {
        let mut rec = record(&[Role::User, Role::User]);
        rec.advance(reply("ok"));
        rec.reset();
        assert_eq!(rec.completed_turns(), 0);
        assert!(rec.conversation().is_empty());
        assert_eq!(rec.next_turn().map(|t| t.message.as_str()), Some("turn 0"));
    }

    #[test]
    fn test_dataset_line_defaults_roles_to_user() {
        let rec: ConversationRecord = serde_json::from_value(json!({
            "index": 7,
            "input": ["a", "b"],
            "criteria": ["c1", "c2"]
        }))
        .unwrap();

        assert_eq!(rec.turns().len(), 2);
        assert!(rec.turns().iter().all(|t| t.role == Role::User));
        assert_eq!(rec.extra()["criteria"], json!(["c1", "c2"]));
    }

    #[test]
    fn test_dataset_line_length_mismatch_pairs_shorter() {
        let rec: ConversationRecord = serde_json::from_value(json!({
            "index": "x",
            "input": ["a", "b", "c"],
            "role": ["system", "user"]
        }))
        .unwrap();
        assert_eq!(rec.turns().len(), 2);
    }

    #[test]
    fn test_serialize_output_columns() {
        let mut rec: ConversationRecord = serde_json::from_value(json!({
            "index": 3,
            "input": ["sys", "hi"],
            "role": ["system", "user"],
            "category": "math",
            "response": ["stale"]
        }))
        .unwrap();
        rec.advance_system_turns();
        rec.advance(reply("hello"));

        let out = serde_json::to_value(&rec).unwrap();
        assert_eq!(out["category"], "math");
        assert_eq!(out["response"], json!(["", "hello"]));
        assert_eq!(out["think"], json!(["", ""]));
        assert_eq!(out["input_tokens"], json!([0, 10]));
        assert_eq!(out["elapsed_time"], json!([0.0, 0.5]));
        assert_eq!(out["role"], json!(["system", "user"]));
        assert_eq!(
            out["accumulated_conversations"][2],
            json!({"role": "assistant", "content": "hello"})
        );
    }

    #[test]
    fn test_compare_index() {
        let mut values = vec![json!("b"), json!(10), json!(null), json!(2), json!("a")];
        values.sort_by(compare_index);
        assert_eq!(
            values,
            vec![json!(null), json!(2), json!(10), json!("a"), json!("b")]
        );
    }
}
