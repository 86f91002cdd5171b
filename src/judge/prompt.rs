//! Judge prompt construction.

use crate::models::{EvalError, JudgePromptConfig, Result, Role, Turn};
use serde_json::Value;
use std::path::Path;
use tracing::warn;

const CRITERIA: &str = "___CRITERIA___";
const INSTRUCTION: &str = "___INSTRUCTION___";
const RESPONSE: &str = "___RESPONSE___";
const CONVERSATIONS: &str = "___CONVERSATIONS___";

/// Judge prompt templates, loaded once per judge run.
#[derive(Debug, Clone)]
pub struct JudgePrompts {
    pub system: String,
    pub user: String,
    /// Used from the second turn on; carries prior exchanges
    pub user_multiturn: String,
}

impl JudgePrompts {
    pub fn load(config: &JudgePromptConfig) -> Result<Self> {
        Ok(Self {
            system: read_template(&config.system_prompt)?,
            user: read_template(&config.user_prompt)?,
            user_multiturn: read_template(&config.user_prompt_multiturn)?,
        })
    }

    /// The two-turn judge conversation for one turn of a graded record.
    ///
    /// `previous` holds the (instruction, response) pairs before this turn.
    pub fn build(
        &self,
        criteria: &Value,
        previous: &[(&str, &str)],
        instruction: &str,
        response: &str,
    ) -> Vec<Turn> {
        let criteria = build_criteria(criteria);

        let user = if previous.is_empty() {
            self.user.clone()
        } else {
            let history: String = previous
                .iter()
                .map(|(i, r)| format!("User: {i}\nAssistant: {r}\n"))
                .collect();
            self.user_multiturn.replace(CONVERSATIONS, &history)
        };

        let user = user
            .replace(CRITERIA, &criteria)
            .replace(INSTRUCTION, instruction)
            .replace(RESPONSE, response);

        vec![
            Turn::new(Role::System, self.system.clone()),
            Turn::new(Role::User, user),
        ]
    }
}

fn read_template(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| EvalError::io(format!("Failed to read judge template {}", path.display()), e))
}

/// Render one turn's criteria as prompt text.
///
/// A list becomes a numbered list; a string is used as given.
pub fn build_criteria(criteria: &Value) -> String {
    let text = match criteria {
        Value::String(s) => s.clone(),
        Value::Array(items) => items
            .iter()
            .enumerate()
            .map(|(i, item)| match item {
                Value::String(s) => format!("{}. {s}\n", i + 1),
                other => format!("{}. {other}\n", i + 1),
            })
            .collect(),
        other => {
            warn!(criteria = %other, "Invalid criteria type, using empty criteria");
            return String::new();
        }
    };
    text.replace("\n\n", "\n").trim().to_string()
}
