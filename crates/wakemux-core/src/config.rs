use crate::error::ConfigError;
use crate::types::BackendConfig;
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(default)]
    pub model: Vec<BackendConfig>,

    #[serde(default)]
    pub recorder: RecorderConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GeneralConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelsConfig {
    #[serde(default = "default_ttl_seconds")]
    pub ttl_seconds: f64,

    #[serde(default)]
    pub default: Option<String>,

    #[serde(default)]
    pub preload: Vec<String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            ttl_seconds: default_ttl_seconds(),
            default: None,
            preload: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecorderConfig {
    #[serde(default)]
    pub start_model: Option<String>,

    #[serde(default)]
    pub stop_model: Option<String>,

    #[serde(default = "default_device_name")]
    pub device_name: String,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            start_model: None,
            stop_model: None,
            device_name: default_device_name(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    10400
}

fn default_ttl_seconds() -> f64 {
    300.0
}

fn default_device_name() -> String {
    "default".to_string()
}

fn default_queue_capacity() -> usize {
    64
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").expect("static regex is valid"))
}

/// Interpolate `${VAR}` patterns with environment variable values.
fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut result = input.to_string();

    for cap in env_var_pattern().captures_iter(input) {
        let var_name = &cap[1];
        let value = std::env::var(var_name)
            .map_err(|_| ConfigError::EnvVarNotFound(var_name.to_string()))?;
        result = result.replace(&cap[0], &value);
    }

    Ok(result)
}

impl AppConfig {
    /// Load configuration from a TOML file, with environment variable interpolation.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let interpolated = interpolate_env_vars(s)?;
        let config: AppConfig = toml::from_str(&interpolated)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for model in &self.model {
            model.validate()?;
        }
        if Duration::try_from_secs_f64(self.models.ttl_seconds).is_err() {
            return Err(ConfigError::InvalidModel {
                name: "[models]".to_string(),
                reason: format!(
                    "ttl_seconds must be a non-negative, representable duration, got {}",
                    self.models.ttl_seconds
                ),
            });
        }
        Ok(())
    }
}
