//! Local BPE token counting.
//!
//! Hosted APIs count tokens in their own way. A local tokenizer makes
//! reasoning and response counts comparable across backends.

use crate::models::ConfigError;
use tiktoken_rs::CoreBPE;

/// Token counter backed by a tiktoken encoding.
pub struct TokenCounter {
    name: String,
    bpe: CoreBPE,
}

impl TokenCounter {
    /// Load by encoding name (`o200k_base`, `cl100k_base`, ...) or model name.
    pub fn load(name: &str) -> Result<Self, ConfigError> {
        let bpe = match name {
            "o200k_base" => tiktoken_rs::o200k_base(),
            "cl100k_base" => tiktoken_rs::cl100k_base(),
            "p50k_base" => tiktoken_rs::p50k_base(),
            "r50k_base" => tiktoken_rs::r50k_base(),
            model => tiktoken_rs::get_bpe_from_model(model),
        }
        .map_err(|e| ConfigError::Tokenizer {
            name: name.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            name: name.to_string(),
            bpe,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Count tokens, treating special-token text as ordinary text.
    pub fn count(&self, text: &str) -> u32 {
        self.bpe.encode_ordinary(text).len() as u32
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_by_encoding_and_model() {
        let counter = TokenCounter::load("cl100k_base").unwrap();
        assert_eq!(counter.count(""), 0);
        assert!(counter.count("hello world") >= 2);

        let by_model = TokenCounter::load("gpt-4o").unwrap();
        assert!(by_model.count("hello world") > 0);
    }

    #[test]
    fn test_unknown_tokenizer_is_config_error() {
        let err = TokenCounter::load("definitely-not-a-model").unwrap_err();
        assert!(matches!(err, ConfigError::Tokenizer { .. }));
    }
}
