//! Configuration models for turnjudge.
//!
//! All I^R (resolvable ignorance) is parameterized here.
//! One `Config` is supplied per run and is never mutated after an adaptor
//! has been initialized from it.

use super::ConfigError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

/// Free-form sampling parameters, merged verbatim into backend requests.
pub type SamplingParams = Map<String, Value>;

/// Top-level configuration for a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Model identifier sent to the backend
    pub model_name: String,

    /// Which backend variant drives the run
    pub backend: BackendKind,

    /// Maximum number of records with an in-flight call
    #[serde(default = "default_concurrency", alias = "semaphore_max_count")]
    pub concurrency: usize,

    /// Sampling parameters merged verbatim into every request
    #[serde(default)]
    pub sampling_params: SamplingParams,

    /// Base delay between retry attempts in milliseconds (doubles per attempt)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Hosted chat-completion backend
    #[serde(default)]
    pub openai: Option<OpenAiConfig>,

    /// Streaming chat backend
    #[serde(default)]
    pub anthropic: Option<AnthropicConfig>,

    /// Stateful chat-session backend
    #[serde(default)]
    pub gemini: Option<GeminiConfig>,

    /// Self-hosted batch-inference backend
    #[serde(default)]
    pub vllm: Option<VllmConfig>,

    /// Judge prompt templates (judge runs only)
    #[serde(default)]
    pub judge: Option<JudgePromptConfig>,
}

fn default_concurrency() -> usize {
    16
}

fn default_retry_backoff_ms() -> u64 {
    1000
}

/// Backend selector.
///
/// K_i: Exactly one variant per run, chosen from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Hosted chat-completion API (OpenAI / Azure OpenAI / compatible)
    Openai,
    /// Streaming Messages API (Anthropic, direct or on Vertex AI)
    Anthropic,
    /// Stateful chat sessions (Gemini on Vertex AI)
    Gemini,
    /// Self-hosted vLLM server driven in vectorized rounds
    Vllm,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Openai => "openai",
            Self::Anthropic => "anthropic",
            Self::Gemini => "gemini",
            Self::Vllm => "vllm",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the hosted chat-completion API is addressed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServingType {
    #[default]
    Openai,
    Azure,
}

/// Hosted chat-completion backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAiConfig {
    #[serde(default)]
    pub serving: ServingType,

    /// Base URL; defaults to the public OpenAI endpoint for `openai` serving.
    /// Required for `azure` serving.
    #[serde(default)]
    pub base_url: Option<String>,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_openai_api_key_env")]
    pub api_key_env: String,

    /// Azure API version
    #[serde(default = "default_azure_api_version")]
    pub api_version: String,

    #[serde(default = "default_openai_timeout")]
    pub timeout_secs: u64,

    /// Local tokenizer used to normalize token counts (encoding or model name)
    #[serde(default)]
    pub tokenizer: Option<String>,

    /// Forwarded verbatim as `chat_template_kwargs`
    #[serde(default)]
    pub chat_template_kwargs: Option<Map<String, Value>>,
}

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

fn default_openai_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_azure_api_version() -> String {
    "2025-03-01-preview".to_string()
}

fn default_openai_timeout() -> u64 {
    300
}

/// Streaming chat backend configuration.
///
/// With `project_id` set, requests go to the Vertex AI publisher endpoint
/// with a bearer token instead of the direct Messages API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnthropicConfig {
    #[serde(default = "default_anthropic_base_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_anthropic_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_anthropic_version")]
    pub anthropic_version: String,

    #[serde(default)]
    pub project_id: Option<String>,

    #[serde(default = "default_location")]
    pub location: String,

    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default = "default_access_token_env")]
    pub access_token_env: String,

    #[serde(default = "default_stream_timeout")]
    pub timeout_secs: u64,
}

fn default_anthropic_base_url() -> String {
    "https://api.anthropic.com/v1".to_string()
}

fn default_anthropic_api_key_env() -> String {
    "ANTHROPIC_API_KEY".to_string()
}

fn default_anthropic_version() -> String {
    "2023-06-01".to_string()
}

fn default_location() -> String {
    "global".to_string()
}

fn default_access_token_env() -> String {
    "GOOGLE_ACCESS_TOKEN".to_string()
}

fn default_stream_timeout() -> u64 {
    900
}

/// Stateful chat-session backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeminiConfig {
    pub project_id: String,

    #[serde(default = "default_location")]
    pub location: String,

    #[serde(default)]
    pub access_token: Option<String>,

    #[serde(default = "default_access_token_env")]
    pub access_token_env: String,

    /// Only validated; authentication itself is resolved through the access token
    #[serde(default)]
    pub credentials_path: Option<PathBuf>,

    /// Hard per-call timeout for one `send_message`
    #[serde(default = "default_send_timeout")]
    pub send_timeout_secs: u64,

    #[serde(default = "default_stream_timeout")]
    pub http_timeout_secs: u64,
}

fn default_send_timeout() -> u64 {
    5 * 60
}

/// Self-hosted batch-inference backend configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VllmConfig {
    #[serde(default = "default_vllm_base_url")]
    pub base_url: String,

    /// Prompts longer than this are center-truncated
    pub max_user_input_tokens: usize,

    #[serde(default = "default_true")]
    pub enable_thinking: bool,

    /// Marker separating reasoning from the final response in generated text
    #[serde(default)]
    pub response_prefix: Option<String>,

    #[serde(default)]
    pub chat_template_kwargs: Option<Map<String, Value>>,

    #[serde(default = "default_vllm_timeout")]
    pub timeout_secs: u64,
}

fn default_vllm_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_true() -> bool {
    true
}

fn default_vllm_timeout() -> u64 {
    3600
}

/// Judge prompt template files.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgePromptConfig {
    pub system_prompt: PathBuf,
    pub user_prompt: PathBuf,
    pub user_prompt_multiturn: PathBuf,
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// B_i(file exists) → Result
    /// B_i(file is valid TOML) → Result
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
            path: path.to_owned(),
            source: e,
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.to_owned(),
            source: e,
        })
    }

    /// Load configuration from an inline JSON object.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load from a CLI argument: an inline JSON object or a path to a TOML file.
    pub fn load(arg: &str) -> Result<Self, ConfigError> {
        if arg.trim_start().starts_with('{') {
            Self::from_json(arg)
        } else {
            Self::from_file(Path::new(arg))
        }
    }

    /// Validate required fields and reject sample values.
    ///
    /// Called by every adaptor before any request is sent.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_name.trim().is_empty() {
            return Err(ConfigError::MissingField("model_name"));
        }
        reject_placeholder("model_name", &self.model_name)?;

        if self.concurrency == 0 {
            return Err(ConfigError::InvalidValue {
                field: "concurrency",
                reason: "must be at least 1".to_string(),
            });
        }

        match self.backend {
            BackendKind::Openai => {
                let section = self.openai_section()?;
                if section.serving == ServingType::Azure && section.base_url.is_none() {
                    return Err(ConfigError::MissingField("openai.base_url"));
                }
                if let Some(url) = &section.base_url {
                    reject_placeholder("openai.base_url", url)?;
                }
            }
            BackendKind::Anthropic => {
                let section = self.anthropic_section()?;
                if let Some(project_id) = &section.project_id {
                    reject_placeholder("anthropic.project_id", project_id)?;
                }
            }
            BackendKind::Gemini => {
                let section = self.gemini_section()?;
                if section.project_id.trim().is_empty() {
                    return Err(ConfigError::MissingField("gemini.project_id"));
                }
                reject_placeholder("gemini.project_id", &section.project_id)?;
                if let Some(path) = &section.credentials_path {
                    reject_placeholder("gemini.credentials_path", &path.to_string_lossy())?;
                }
            }
            BackendKind::Vllm => {
                let section = self.vllm_section()?;
                if section.max_user_input_tokens < 2 {
                    return Err(ConfigError::InvalidValue {
                        field: "vllm.max_user_input_tokens",
                        reason: "must be at least 2".to_string(),
                    });
                }
            }
        }

        Ok(())
    }

    pub fn openai_section(&self) -> Result<&OpenAiConfig, ConfigError> {
        self.openai.as_ref().ok_or_else(|| self.missing_section())
    }

    pub fn anthropic_section(&self) -> Result<&AnthropicConfig, ConfigError> {
        self.anthropic.as_ref().ok_or_else(|| self.missing_section())
    }

    pub fn gemini_section(&self) -> Result<&GeminiConfig, ConfigError> {
        self.gemini.as_ref().ok_or_else(|| self.missing_section())
    }

    pub fn vllm_section(&self) -> Result<&VllmConfig, ConfigError> {
        self.vllm.as_ref().ok_or_else(|| self.missing_section())
    }

    fn missing_section(&self) -> ConfigError {
        ConfigError::MissingSection {
            backend: self.backend.to_string(),
        }
    }
}

/// Resolve a secret from an inline value or an environment variable.
///
/// B_i(secret available) → Result
pub fn resolve_secret(
    backend: &str,
    field: &'static str,
    inline: Option<&str>,
    env_var: &str,
) -> Result<String, ConfigError> {
    if let Some(value) = inline {
        let value = expand_env_vars(value);
        reject_placeholder(field, &value)?;
        return Ok(value);
    }

    std::env::var(env_var).map_err(|_| ConfigError::MissingApiKey {
        backend: backend.to_string(),
        env_var: env_var.to_string(),
    })
}

/// Sample values shipped in example configs.
const KNOWN_PLACEHOLDERS: &[&str] = &[
    "your-project-id",
    "/your/credentials/path/credentials.json",
    "sk-...",
    "changeme",
];

/// Whether a value is still a sample/placeholder value.
pub fn is_placeholder(value: &str) -> bool {
    let value = value.trim();
    KNOWN_PLACEHOLDERS.contains(&value)
        || value.starts_with("your-")
        || value.starts_with("YOUR_")
        || value.starts_with("/your/")
        || (value.starts_with('<') && value.ends_with('>'))
}

fn reject_placeholder(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if is_placeholder(value) {
        return Err(ConfigError::Placeholder {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

static ENV_VAR_PATTERN: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"\$\{([^}]+)\}").expect("env var pattern is valid"));

/// Expand environment variables in a string.
///
/// Supports ${VAR_NAME} syntax.
/// If the variable is not set, the placeholder is left unchanged.
pub fn expand_env_vars(s: &str) -> String {
    let mut result = s.to_string();

    for cap in ENV_VAR_PATTERN.captures_iter(s) {
        if let Ok(value) = std::env::var(&cap[1]) {
            result = result.replace(&cap[0], &value);
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn openai_config() -> Config {
        Config::from_json(
            r#"{
                "model_name": "gpt-4o",
                "backend": "openai",
                "sampling_params": {"temperature": 0.0, "max_tokens": 512},
                "openai": {"api_key": "sk-test"}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults_applied() {
        let config = openai_config();
        assert_eq!(config.concurrency, 16);
        assert_eq!(config.retry_backoff_ms, 1000);
        assert_eq!(config.sampling_params["max_tokens"], 512);
        let section = config.openai_section().unwrap();
        assert_eq!(section.serving, ServingType::Openai);
        assert_eq!(section.api_version, "2025-03-01-preview");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_semaphore_alias() {
        let config = Config::from_json(
            r#"{"model_name": "m", "backend": "vllm", "semaphore_max_count": 4,
                "vllm": {"max_user_input_tokens": 1024}}"#,
        )
        .unwrap();
        assert_eq!(config.concurrency, 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gemini.toml");
        std::fs::write(
            &path,
            r#"
model_name = "gemini-2.5-pro"
backend = "gemini"
concurrency = 8

[sampling_params]
temperature = 0.2

[gemini]
project_id = "eval-project"
"#,
        )
        .unwrap();

        let config = Config::load(path.to_str().unwrap()).unwrap();
        assert_eq!(config.backend, BackendKind::Gemini);
        assert_eq!(config.gemini_section().unwrap().send_timeout_secs, 300);
        assert_eq!(config.gemini_section().unwrap().location, "global");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_placeholder_project_rejected() {
        let config = Config::from_json(
            r#"{"model_name": "gemini", "backend": "gemini",
                "gemini": {"project_id": "your-project-id"}}"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Placeholder { field: "gemini.project_id", .. })
        ));
    }

    #[test]
    fn test_placeholder_credentials_rejected() {
        let config = Config::from_json(
            r#"{"model_name": "gemini", "backend": "gemini",
                "gemini": {"project_id": "real", "credentials_path": "/your/credentials/path/credentials.json"}}"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Placeholder { .. })
        ));
    }

    #[test]
    fn test_missing_section_and_fields() {
        let config =
            Config::from_json(r#"{"model_name": "claude", "backend": "anthropic"}"#).unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingSection { .. })
        ));

        let config = Config::from_json(
            r#"{"model_name": " ", "backend": "openai", "openai": {}}"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("model_name"))
        ));

        let config = Config::from_json(
            r#"{"model_name": "gpt", "backend": "openai", "openai": {"serving": "azure"}}"#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField("openai.base_url"))
        ));
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let mut config = openai_config();
        config.concurrency = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { field: "concurrency", .. })
        ));
    }

    #[test]
    fn test_is_placeholder() {
        assert!(is_placeholder("your-project-id"));
        assert!(is_placeholder("<API_KEY>"));
        assert!(is_placeholder("YOUR_KEY_HERE"));
        assert!(!is_placeholder("prod-eval-4411"));
    }

    #[test]
    fn test_resolve_secret_inline_and_missing() {
        let key = resolve_secret("openai", "openai.api_key", Some("sk-live"), "UNUSED").unwrap();
        assert_eq!(key, "sk-live");

        let missing = resolve_secret(
            "openai",
            "openai.api_key",
            None,
            "TURNJUDGE_TEST_SURELY_UNSET_VAR",
        );
        assert!(matches!(missing, Err(ConfigError::MissingApiKey { .. })));

        let placeholder = resolve_secret("openai", "openai.api_key", Some("sk-..."), "UNUSED");
        assert!(matches!(placeholder, Err(ConfigError::Placeholder { .. })));
    }

    #[test]
    fn test_expand_env_vars_leaves_unknown() {
        assert_eq!(
            expand_env_vars("Bearer ${TURNJUDGE_TEST_SURELY_UNSET_VAR}"),
            "Bearer ${TURNJUDGE_TEST_SURELY_UNSET_VAR}"
        );
    }
}
