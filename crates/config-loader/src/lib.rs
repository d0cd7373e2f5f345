//! Runner configuration.
//!
//! Values are layered: built-in defaults, then an optional JSON file validated
//! against the embedded schema, then `RUNLOCAL_*` environment variables.
//! Command-line flags are applied on top by the binary.

use jsonschema::{Draft, JSONSchema};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument};

pub const DEFAULT_SANDBOX_ROOT: &str = "./sandbox";
pub const DEFAULT_CONTAINER_RUNTIME: &str = "docker";
pub const DEFAULT_ALGO_TAG: &str = "algo_run_local";
pub const DEFAULT_METRICS_TAG: &str = "metrics_run_local";

pub const ENV_CONFIG_FILE: &str = "RUNLOCAL_CONFIG";
pub const ENV_SANDBOX_ROOT: &str = "RUNLOCAL_SANDBOX_ROOT";
pub const ENV_CONTAINER_RUNTIME: &str = "RUNLOCAL_CONTAINER_RUNTIME";
pub const ENV_ALGO_TAG: &str = "RUNLOCAL_ALGO_TAG";
pub const ENV_METRICS_TAG: &str = "RUNLOCAL_METRICS_TAG";
pub const ENV_STAGE_TIMEOUT: &str = "RUNLOCAL_STAGE_TIMEOUT";
pub const ENV_MODEL_KEY_MODE: &str = "RUNLOCAL_MODEL_KEY_MODE";
pub const ENV_HOST_USERNS: &str = "RUNLOCAL_HOST_USERNS";

const RUNNER_CONFIG_SCHEMA: &str = r#"{
    "$schema": "http://json-schema.org/draft-07/schema#",
    "title": "Local runner configuration",
    "type": "object",
    "properties": {
        "sandboxRoot": { "type": "string", "minLength": 1 },
        "containerRuntime": { "type": "string", "minLength": 1 },
        "algoTag": { "type": "string", "pattern": "^[a-z0-9][a-z0-9_.:/-]*$" },
        "metricsTag": { "type": "string", "pattern": "^[a-z0-9][a-z0-9_.:/-]*$" },
        "stageTimeout": { "type": ["string", "null"], "minLength": 1 },
        "modelKeyMode": { "type": "string", "enum": ["path", "content"] },
        "hostUserns": { "type": "boolean" }
    },
    "additionalProperties": false
}"#;

static COMPILED_SCHEMA: OnceCell<JSONSchema> = OnceCell::new();

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {path}")]
    ConfigFileNotFound { path: String },

    #[error("Schema compilation failed: {message}")]
    SchemaCompilationFailed { message: String },

    #[error("Config validation failed: {}", summarize(.errors))]
    ValidationFailed { errors: Vec<ValidationError> },

    #[error("JSON parsing failed: {message}")]
    JsonParsingFailed { message: String },

    #[error("IO error: {message}")]
    IoError { message: String },

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

#[derive(Debug, Clone)]
pub struct ValidationError {
    pub json_pointer: String,
    pub message: String,
    pub schema_path: String,
}

fn summarize(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| {
            if e.json_pointer.is_empty() {
                e.message.clone()
            } else {
                format!("{}: {}", e.json_pointer, e.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// How input models are keyed when linked into the sandbox.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKeyMode {
    /// SHA-256 of the absolute source path string.
    #[default]
    Path,
    /// SHA-256 of the file contents.
    Content,
}

impl FromStr for ModelKeyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "path" => Ok(ModelKeyMode::Path),
            "content" => Ok(ModelKeyMode::Content),
            other => Err(format!(
                "unknown model key mode '{}', expected 'path' or 'content'",
                other
            )),
        }
    }
}

impl fmt::Display for ModelKeyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelKeyMode::Path => f.write_str("path"),
            ModelKeyMode::Content => f.write_str("content"),
        }
    }
}

/// Fully resolved runner settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerConfig {
    pub sandbox_root: PathBuf,
    pub container_runtime: String,
    pub algo_tag: String,
    pub metrics_tag: String,
    pub stage_timeout: Option<Duration>,
    pub model_key_mode: ModelKeyMode,
    pub host_userns: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            sandbox_root: PathBuf::from(DEFAULT_SANDBOX_ROOT),
            container_runtime: DEFAULT_CONTAINER_RUNTIME.to_string(),
            algo_tag: DEFAULT_ALGO_TAG.to_string(),
            metrics_tag: DEFAULT_METRICS_TAG.to_string(),
            stage_timeout: None,
            model_key_mode: ModelKeyMode::Path,
            host_userns: true,
        }
    }
}

/// One layer of optional overrides, as found in the config file.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigLayer {
    sandbox_root: Option<PathBuf>,
    container_runtime: Option<String>,
    algo_tag: Option<String>,
    metrics_tag: Option<String>,
    stage_timeout: Option<String>,
    model_key_mode: Option<ModelKeyMode>,
    host_userns: Option<bool>,
}

impl RunnerConfig {
    fn apply(&mut self, layer: ConfigLayer) -> Result<(), ConfigError> {
        if let Some(root) = layer.sandbox_root {
            self.sandbox_root = root;
        }
        if let Some(runtime) = layer.container_runtime {
            self.container_runtime = runtime;
        }
        if let Some(tag) = layer.algo_tag {
            self.algo_tag = tag;
        }
        if let Some(tag) = layer.metrics_tag {
            self.metrics_tag = tag;
        }
        if let Some(raw) = layer.stage_timeout {
            self.stage_timeout = Some(parse_timeout("stageTimeout", &raw)?);
        }
        if let Some(mode) = layer.model_key_mode {
            self.model_key_mode = mode;
        }
        if let Some(host_userns) = layer.host_userns {
            self.host_userns = host_userns;
        }
        Ok(())
    }
}

/// Parse a humantime duration; zero is rejected since every call would time out.
pub fn parse_timeout(key: &str, raw: &str) -> Result<Duration, ConfigError> {
    let limit = humantime::parse_duration(raw.trim()).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    if limit.is_zero() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: "timeout must be greater than zero".to_string(),
        });
    }
    Ok(limit)
}

pub struct ConfigManager {
    config_path: Option<PathBuf>,
    explicit: bool,
}

impl ConfigManager {
    /// Locate the config file from `RUNLOCAL_CONFIG` or the user config dir.
    pub fn new() -> Self {
        match std::env::var(ENV_CONFIG_FILE) {
            Ok(path) if !path.trim().is_empty() => Self::with_file(path),
            _ => Self {
                config_path: Self::find_user_config(),
                explicit: false,
            },
        }
    }

    /// Use exactly this file; it must exist.
    pub fn with_file<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
            explicit: true,
        }
    }

    /// Defaults and environment only.
    pub fn without_file() -> Self {
        Self {
            config_path: None,
            explicit: false,
        }
    }

    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    fn find_user_config() -> Option<PathBuf> {
        let path = dirs::config_dir()?.join("runlocal").join("config.json");
        path.is_file().then_some(path)
    }

    #[instrument(skip(self))]
    pub fn load(&self) -> Result<RunnerConfig, ConfigError> {
        self.load_with_env(|key| std::env::var(key).ok())
    }

    /// Load using `lookup` in place of the process environment.
    pub fn load_with_env<F>(&self, lookup: F) -> Result<RunnerConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = RunnerConfig::default();

        if let Some(path) = &self.config_path {
            if path.exists() {
                config.apply(self.load_config_file(path)?)?;
            } else if self.explicit {
                return Err(ConfigError::ConfigFileNotFound {
                    path: path.to_string_lossy().to_string(),
                });
            }
        }

        config.apply(env_layer(lookup)?)?;
        debug!(?config, "Resolved runner config");
        Ok(config)
    }

    #[instrument(skip(self))]
    pub fn validate_config_file(&self, config_path: &Path) -> Result<(), ConfigError> {
        if !config_path.exists() {
            return Err(ConfigError::ConfigFileNotFound {
                path: config_path.to_string_lossy().to_string(),
            });
        }
        let value = read_json(config_path)?;
        validate_config(&value)
    }

    fn load_config_file(&self, config_path: &Path) -> Result<ConfigLayer, ConfigError> {
        debug!("Loading config from: {:?}", config_path);

        let value = read_json(config_path)?;
        validate_config(&value)?;

        serde_json::from_value(value).map_err(|e| ConfigError::JsonParsingFailed {
            message: e.to_string(),
        })
    }
}

impl Default for ConfigManager {
    fn default() -> Self {
        Self::new()
    }
}

fn read_json(path: &Path) -> Result<Value, ConfigError> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::IoError {
        message: format!("Failed to read config file {}: {}", path.display(), e),
    })?;

    serde_json::from_str(&content).map_err(|e| ConfigError::JsonParsingFailed {
        message: e.to_string(),
    })
}

fn validate_config(config: &Value) -> Result<(), ConfigError> {
    let schema = compiled_schema()?;

    if let Err(errors) = schema.validate(config) {
        let validation_errors: Vec<ValidationError> = errors
            .map(|error| ValidationError {
                json_pointer: error.instance_path.to_string(),
                message: error.to_string(),
                schema_path: error.schema_path.to_string(),
            })
            .collect();

        return Err(ConfigError::ValidationFailed {
            errors: validation_errors,
        });
    }

    Ok(())
}

fn compiled_schema() -> Result<&'static JSONSchema, ConfigError> {
    COMPILED_SCHEMA.get_or_try_init(|| {
        let schema_value: Value = serde_json::from_str(RUNNER_CONFIG_SCHEMA).map_err(|e| {
            ConfigError::JsonParsingFailed {
                message: e.to_string(),
            }
        })?;

        JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema_value)
            .map_err(|e| ConfigError::SchemaCompilationFailed {
                message: e.to_string(),
            })
    })
}

fn env_layer<F>(lookup: F) -> Result<ConfigLayer, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

    let model_key_mode = match get(ENV_MODEL_KEY_MODE) {
        Some(raw) => Some(raw.parse().map_err(|message| ConfigError::InvalidValue {
            key: ENV_MODEL_KEY_MODE.to_string(),
            message,
        })?),
        None => None,
    };

    let host_userns = match get(ENV_HOST_USERNS) {
        Some(raw) => Some(parse_bool(&raw).ok_or_else(|| ConfigError::InvalidValue {
            key: ENV_HOST_USERNS.to_string(),
            message: format!("expected a boolean, got '{}'", raw),
        })?),
        None => None,
    };

    // Timeouts are parsed in `apply`, so report the env key if they are bad.
    let stage_timeout = match get(ENV_STAGE_TIMEOUT) {
        Some(raw) => {
            parse_timeout(ENV_STAGE_TIMEOUT, &raw)?;
            Some(raw)
        }
        None => None,
    };

    Ok(ConfigLayer {
        sandbox_root: get(ENV_SANDBOX_ROOT).map(PathBuf::from),
        container_runtime: get(ENV_CONTAINER_RUNTIME),
        algo_tag: get(ENV_ALGO_TAG),
        metrics_tag: get(ENV_METRICS_TAG),
        stage_timeout,
        model_key_mode,
        host_userns,
    })
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
