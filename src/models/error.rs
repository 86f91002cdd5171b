//! Error types for turnjudge.
//!
//! Epistemic taxonomy:
//! - B_i falsified: Expected failures (bad config, malformed input)
//! - I^B materialized: Infrastructure failures (network, timeout, backend envelope)
//! - K_i violated: Internal invariant violations (bugs)

use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for turnjudge.
#[derive(Debug, Error)]
pub enum EvalError {
    // ═══════════════════════════════════════════════════════════════════
    // B_i FALSIFIED — Belief proven wrong (expected failures)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Parse error: {0}")]
    Parse(String),

    // ═══════════════════════════════════════════════════════════════════
    // I^B MATERIALIZED — Bounded ignorance became known-bad
    // ═══════════════════════════════════════════════════════════════════

    #[error("{0}")]
    Provider(#[from] ProviderError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("IO error: {context}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    // ═══════════════════════════════════════════════════════════════════
    // K_i VIOLATED — Invariant broken (bug, should not happen)
    // ═══════════════════════════════════════════════════════════════════

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Backend-level errors reported by a Provider Client.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Rendered the way hosted SDKs render HTTP failures, so the text matches
    /// the error envelope the retry policy looks for.
    #[error("Error code: {status} - {message}")]
    Api { status: u16, message: String },

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Session closed: {0}")]
    SessionClosed(String),
}

impl EvalError {
    /// Create an IO error with context.
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Check if this error is worth another attempt.
    ///
    /// Configuration and parse errors never are; everything that came back
    /// from the wire is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Provider(_) | Self::Network(_) | Self::Timeout(_)
        )
    }
}

/// Configuration errors. Always fatal at initialization, never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Failed to parse inline JSON config: {0}")]
    InlineJson(#[from] serde_json::Error),

    #[error("Missing required field '{0}'")]
    MissingField(&'static str),

    #[error("Backend '{backend}' selected but no [{backend}] section configured")]
    MissingSection { backend: String },

    #[error("Missing API key for backend '{backend}': set {env_var} env var or api_key in config")]
    MissingApiKey { backend: String, env_var: String },

    #[error("Field '{field}' still holds the sample value '{value}', please set a proper value")]
    Placeholder { field: &'static str, value: String },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Tokenizer '{name}' could not be loaded: {reason}")]
    Tokenizer { name: String, reason: String },
}

/// Result type alias for turnjudge.
pub type Result<T> = std::result::Result<T, EvalError>;
