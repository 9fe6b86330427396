//! Engine configuration.
//!
//! Values are layered with the `config` crate:
//! 1. built-in defaults ([`EngineConfig::default`])
//! 2. an optional TOML file
//! 3. environment variables prefixed `LLAMA_CHAT`, sections separated by `__`
//!    (e.g. `LLAMA_CHAT__CONTEXT__N_CTX=4096`)

use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use llama_engine::{ContextParams, ModelParams};
use llama_sampling::SamplerChain;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Prefix of configuration environment variables.
pub const ENV_PREFIX: &str = "LLAMA_CHAT";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub model: ModelParams,
    pub context: ContextParams,
    pub sampling: SamplerChain,
    pub generation: GenerationConfig,
    pub controller: ControllerConfig,
    pub telemetry: TelemetryConfig,
}

/// Per-request generation settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    /// Upper bound on generated tokens per request.
    pub max_new_tokens: usize,
    /// Token pieces accumulated before a fragment event is emitted.
    pub fragment_batch: usize,
    /// System preamble of the first turn.
    pub system_prompt: String,
    /// Turn terminator; stripped from emitted text.
    pub end_marker: String,
    /// Response reported when the model produced no text.
    pub empty_response: String,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_new_tokens: 2048,
            fragment_batch: 4,
            system_prompt: "You are a helpful assistant.".into(),
            end_marker: "<|im_end|>".into(),
            empty_response: "[no response generated]".into(),
        }
    }
}

/// Session controller settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Polls of the stop acknowledgement before giving up.
    pub stop_poll_retries: u32,
    pub stop_poll_interval_ms: u64,
    /// Bound of the command channel into the worker.
    pub command_capacity: usize,
    /// Bound of the worker's output channel.
    pub event_capacity: usize,
}

impl ControllerConfig {
    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }

    /// Total time spent waiting for the worker to acknowledge.
    pub fn stop_window(&self) -> Duration {
        self.stop_poll_interval() * self.stop_poll_retries
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            stop_poll_retries: 50,
            stop_poll_interval_ms: 10,
            command_capacity: 16,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Samples kept in the telemetry log.
    pub history_capacity: usize,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
        }
    }
}

impl EngineConfig {
    /// Load defaults, then `path` (if given), then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with_env(path, Environment::with_prefix(ENV_PREFIX))
    }

    fn load_with_env(path: Option<&Path>, env: Environment) -> Result<Self, ConfigError> {
        let mut builder = Config::builder().add_source(Config::try_from(&EngineConfig::default())?);
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).format(FileFormat::Toml).required(true));
        }
        builder = builder.add_source(env.separator("__").try_parsing(true));

        let config: EngineConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults, without the environment.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = Config::builder()
            .add_source(Config::try_from(&EngineConfig::default())?)
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));
        if self.context.n_ctx == 0 {
            return invalid("context.n_ctx must be > 0".into());
        }
        if self.context.n_batch == 0 {
            return invalid("context.n_batch must be > 0".into());
        }
        if self.context.n_batch > self.context.n_ctx {
            return invalid(format!(
                "context.n_batch ({}) exceeds context.n_ctx ({})",
                self.context.n_batch, self.context.n_ctx
            ));
        }
        if self.generation.max_new_tokens == 0 {
            return invalid("generation.max_new_tokens must be > 0".into());
        }
        if self.generation.fragment_batch == 0 {
            return invalid("generation.fragment_batch must be > 0".into());
        }
        if self.telemetry.history_capacity == 0 {
            return invalid("telemetry.history_capacity must be > 0".into());
        }
        self.sampling
            .validate()
            .map_err(|e| ConfigError::Invalid(format!("sampling: {e}")))
    }
}
