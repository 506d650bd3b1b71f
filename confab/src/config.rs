use crate::logging::{parse_log_level, LogFormat};
use anyhow::Result;
use confab_sfu::SfuConfig;
use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sfu: SfuConfig,
    pub signaling: SignalingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3016,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

/// Limits of one signaling connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    /// Outbound events queued per connection before new ones are dropped
    pub channel_capacity: usize,
    /// Largest accepted inbound frame, in bytes
    pub max_message_size: usize,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 256,
            max_message_size: 64 * 1024,
        }
    }
}

impl AppConfig {
    /// Load configuration with priority:
    /// 1. Environment variables (`CONFAB_SERVER__PORT`, `CONFAB_SFU__NUM_WORKERS`, ...)
    /// 2. Config file (if provided)
    /// 3. Defaults
    pub fn load(config_file: Option<&Path>) -> Result<Self, ConfigError> {
        Self::load_with(config_file, environment())
    }

    fn load_with(config_file: Option<&Path>, environment: Environment) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(File::from(path));
        }
        builder.add_source(environment).build()?.try_deserialize()
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Collect every configuration problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.server.port == 0 {
            errors.push("server.port must be non-zero".to_string());
        }
        if let Err(e) = parse_log_level(&self.logging.level) {
            errors.push(format!("logging.level: {e}"));
        }
        if let Err(e) = self.logging.format.parse::<LogFormat>() {
            errors.push(format!("logging.format: {e}"));
        }
        if let Err(sfu_errors) = self.sfu.validate() {
            errors.extend(sfu_errors);
        }
        if self.signaling.channel_capacity == 0 {
            errors.push("signaling.channel_capacity must be at least 1".to_string());
        }
        if self.signaling.max_message_size == 0 {
            errors.push("signaling.max_message_size must be non-zero".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn environment() -> Environment {
    Environment::with_prefix("CONFAB")
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}

/// Load configuration from a config file and environment variables
///
/// Config file search order:
/// 1. `path` (from `--config` or `CONFAB_CONFIG_PATH`); must exist
/// 2. ./config.yaml (current working directory)
/// 3. Environment variables and defaults only
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let config_path = match path {
        Some(path) if !path.exists() => {
            anyhow::bail!("Config file not found: {}", path.display());
        }
        Some(path) => Some(path),
        None => Some(Path::new("config.yaml")).filter(|p| p.exists()),
    };

    match config_path {
        Some(path) => eprintln!("Loading config from {}", path.display()),
        None => eprintln!("No config file found, using environment variables"),
    }

    AppConfig::load(config_path).map_err(|e| anyhow::anyhow!("Failed to load config: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    fn no_env() -> Environment {
        environment().source(Some(HashMap::new()))
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http_address(), "0.0.0.0:3016");
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  port: 4000\nsfu:\n  num_workers: 2\n  max_participants_per_room: 8\nlogging:\n  format: json"
        )
        .unwrap();

        let config = AppConfig::load_with(Some(file.path()), no_env()).unwrap();
        assert_eq!(config.server.port, 4000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.sfu.num_workers, Some(2));
        assert_eq!(config.sfu.max_participants_per_room, 8);
        assert_eq!(config.logging.format, "json");
        assert!(!config.sfu.media_codecs.is_empty());
    }

    #[test]
    fn test_environment_overrides_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "server:\n  port: 4000").unwrap();

        let env = HashMap::from([
            ("CONFAB_SERVER__PORT".to_string(), "5000".to_string()),
            ("CONFAB_SIGNALING__CHANNEL_CAPACITY".to_string(), "32".to_string()),
        ]);
        let config =
            AppConfig::load_with(Some(file.path()), environment().source(Some(env))).unwrap();
        assert_eq!(config.server.port, 5000);
        assert_eq!(config.signaling.channel_capacity, 32);
    }

    #[test]
    fn test_validation_collects_errors() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        config.logging.level = "loud".to_string();
        config.logging.format = "xml".to_string();
        config.sfu.media_codecs.clear();
        config.signaling.channel_capacity = 0;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 5);
        assert!(errors.iter().any(|e| e.contains("media_codecs")));
    }

    #[test]
    fn test_missing_explicit_path_fails() {
        assert!(load_config(Some(Path::new("/nonexistent/confab.yaml"))).is_err());
    }
}
