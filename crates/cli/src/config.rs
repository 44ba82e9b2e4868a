//! `.forgeflow/config.toml` loading and validation.
//!
//! Every key is optional; a missing file yields the built-in defaults. Values
//! are checked once at load time so the process never starts with a config
//! the engine would have to second-guess.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use engine::{BudgetConfig, InFlightPolicy, OrchestratorConfig, RetryConfig};
use pipeline::{CostBudget, ModelName};

pub const DEFAULT_CONFIG_PATH: &str = ".forgeflow/config.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub budget: BudgetSection,
    pub timeouts: TimeoutSection,
    pub retry: RetrySection,
    pub completion: CompletionSection,
    pub generation: GenerationSection,
    pub telemetry: TelemetrySection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BudgetSection {
    pub cap_usd: f64,
    pub window_hours: u64,
}

impl Default for BudgetSection {
    fn default() -> Self {
        Self {
            cap_usd: engine::budget::DEFAULT_CAP_USD,
            window_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TimeoutSection {
    pub max_request_secs: u64,
    pub in_flight: InFlightPolicy,
}

impl Default for TimeoutSection {
    fn default() -> Self {
        Self {
            max_request_secs: 120,
            in_flight: InFlightPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySection {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: f64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
            jitter: 0.2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CompletionSection {
    pub model: String,
    pub api_key_env: String,
    pub base_url: String,
    pub max_tokens: u32,
    pub request_timeout_secs: u64,
}

impl Default for CompletionSection {
    fn default() -> Self {
        Self {
            model: llm::anthropic::DEFAULT_MODEL.into(),
            api_key_env: "ANTHROPIC_API_KEY".into(),
            base_url: llm::anthropic::DEFAULT_BASE_URL.into(),
            max_tokens: llm::anthropic::DEFAULT_MAX_TOKENS,
            request_timeout_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GenerationSection {
    pub base_url: String,
    pub api_key_env: String,
    pub request_timeout_secs: u64,
}

impl Default for GenerationSection {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8787".into(),
            api_key_env: "GENERATION_API_KEY".into(),
            request_timeout_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Json,
    Pretty,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TelemetrySection {
    pub format: LogFormat,
    pub otlp_endpoint: Option<String>,
}

impl Config {
    /// Loads `path`, or [`DEFAULT_CONFIG_PATH`] when `path` is `None`.
    ///
    /// A missing default file is not an error; a missing explicit file is.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default())
            }
            Err(source) => return Err(ConfigError::Read { path, source }),
        };
        let config: Self =
            toml::from_str(&text).map_err(|source| ConfigError::Parse { path, source })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if CostBudget::new(self.budget.cap_usd).is_none() {
            return Err(invalid("budget.cap_usd must be a positive amount"));
        }
        if self.budget.window_hours == 0 {
            return Err(invalid("budget.window_hours must be greater than zero"));
        }
        if self.timeouts.max_request_secs == 0 {
            return Err(invalid("timeouts.max_request_secs must be greater than zero"));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(invalid("retry.base_delay_ms must not exceed retry.max_delay_ms"));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(invalid("retry.jitter must be between 0.0 and 1.0"));
        }
        if ModelName::new(self.completion.model.as_str()).is_none() {
            return Err(invalid("completion.model must not be empty"));
        }
        if self.completion.max_tokens == 0 {
            return Err(invalid("completion.max_tokens must be greater than zero"));
        }
        if self.completion.request_timeout_secs == 0 || self.generation.request_timeout_secs == 0 {
            return Err(invalid("provider request timeouts must be greater than zero"));
        }
        if self.generation.base_url.trim().is_empty() {
            return Err(invalid("generation.base_url must not be empty"));
        }
        Ok(())
    }

    pub fn orchestrator(&self) -> Result<OrchestratorConfig, ConfigError> {
        let cap = CostBudget::new(self.budget.cap_usd)
            .ok_or_else(|| invalid("budget.cap_usd must be a positive amount"))?;
        Ok(OrchestratorConfig {
            budget: BudgetConfig {
                cap,
                window: Duration::from_secs(self.budget.window_hours * 60 * 60),
            },
            max_request_time: Duration::from_secs(self.timeouts.max_request_secs),
            in_flight: self.timeouts.in_flight,
            retry: RetryConfig {
                max_retries: self.retry.max_retries,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
                jitter_factor: self.retry.jitter,
            },
        })
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}
