//! Layered configuration resolution: defaults <- config file <- environment
//! <- CLI flags. A missing config file is fine; an unreadable one is not.

use std::env;
use std::path::{Path, PathBuf};

use crate::schema::MonitorConfig;
use crate::ConfigError;

/// Flag-level overrides collected by the CLI. Everything optional; `None`
/// keeps the value from the lower layers.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub api_endpoint: Option<String>,
    pub api_key: Option<String>,
    pub buffer_size: Option<usize>,
    pub batch_size: Option<usize>,
    pub flush_interval_secs: Option<u64>,
    pub log_level: Option<String>,
    pub debug: bool,
}

pub struct ConfigLoader {
    config: MonitorConfig,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            config: MonitorConfig::default(),
        }
    }

    /// Default config file location: `~/.config/kilometers/config.json`.
    pub fn default_config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("kilometers").join("config.json"))
    }

    pub fn load_default_file(&mut self) -> Result<&mut Self, ConfigError> {
        if let Some(path) = Self::default_config_path() {
            self.load_file(&path)?;
        }
        Ok(self)
    }

    pub fn load_file(&mut self, path: &Path) -> Result<&mut Self, ConfigError> {
        if !path.exists() {
            return Ok(self);
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {e}", path.display())))?;
        let config: MonitorConfig = serde_json::from_str(&content)
            .map_err(|e| ConfigError::Parse(format!("{}: {e}", path.display())))?;
        self.config = config;
        Ok(self)
    }

    /// Apply `KM_*` environment variables.
    pub fn load_env(&mut self) -> &mut Self {
        if let Ok(value) = env::var("KM_API_ENDPOINT") {
            self.config.api_endpoint = value;
        }
        if let Ok(value) = env::var("KM_API_KEY") {
            self.config.api_key = Some(value);
        }
        if let Some(value) = parse_env("KM_BUFFER_SIZE") {
            self.config.buffer_size = value;
        }
        if let Some(value) = parse_env("KM_BATCH_SIZE") {
            self.config.batch_size = value;
        }
        if let Ok(value) = env::var("KM_LOG_LEVEL") {
            self.config.log_level = value;
        }
        if let Ok(value) = env::var("KM_DEBUG") {
            self.config.debug = matches!(value.trim(), "1" | "true" | "yes");
        }
        if let Some(value) = parse_env("KM_TIMEOUT") {
            self.config.timeout_secs = value;
        }
        self
    }

    pub fn apply_overrides(&mut self, overrides: &CliOverrides) -> &mut Self {
        if let Some(value) = &overrides.api_endpoint {
            self.config.api_endpoint = value.clone();
        }
        if let Some(value) = &overrides.api_key {
            self.config.api_key = Some(value.clone());
        }
        if let Some(value) = overrides.buffer_size {
            self.config.buffer_size = value;
        }
        if let Some(value) = overrides.batch_size {
            self.config.batch_size = value;
        }
        if let Some(value) = overrides.flush_interval_secs {
            self.config.flush_interval_secs = value;
        }
        if let Some(value) = &overrides.log_level {
            self.config.log_level = value.clone();
        }
        if overrides.debug {
            self.config.debug = true;
        }
        self
    }

    /// Validate and hand out the resolved configuration. Must fail before
    /// any child process is spawned.
    pub fn finish(&self) -> Result<MonitorConfig, ConfigError> {
        let config = self.config.clone();
        config.endpoint()?;
        if config.api_key.as_deref().unwrap_or("").is_empty() {
            return Err(ConfigError::MissingApiKey);
        }
        if config.batch_size == 0 {
            return Err(ConfigError::Invalid("batch_size must be at least 1".into()));
        }
        if config.buffer_size == 0 {
            return Err(ConfigError::Invalid("buffer_size must be nonzero".into()));
        }
        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str) -> Option<T> {
    match env::var(key) {
        Ok(value) => match value.trim().parse() {
            Ok(parsed) => Some(parsed),
            Err(_) => {
                tracing::warn!(key, value, "ignoring unparsable environment variable");
                None
            }
        },
        Err(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_is_fine() {
        let mut loader = ConfigLoader::new();
        loader
            .load_file(Path::new("/definitely/not/here.json"))
            .unwrap();
        loader.apply_overrides(&CliOverrides {
            api_key: Some("k".into()),
            ..Default::default()
        });
        loader.finish().unwrap();
    }

    #[test]
    fn file_then_overrides_layering() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{"api_key":"file-key","batch_size":7,"flush_interval_secs":9}"#,
        )
        .unwrap();

        let mut loader = ConfigLoader::new();
        loader.load_file(&path).unwrap();
        loader.apply_overrides(&CliOverrides {
            batch_size: Some(3),
            debug: true,
            ..Default::default()
        });
        let config = loader.finish().unwrap();
        assert_eq!(config.api_key.as_deref(), Some("file-key"));
        assert_eq!(config.batch_size, 3);
        assert_eq!(config.flush_interval_secs, 9);
        assert!(config.debug);
    }

    #[test]
    fn unparsable_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ nope").unwrap();
        let mut loader = ConfigLoader::new();
        assert!(loader.load_file(&path).is_err());
    }

    #[test]
    fn missing_api_key_fails_validation() {
        let loader = ConfigLoader::new();
        assert!(matches!(
            loader.finish().unwrap_err(),
            ConfigError::MissingApiKey
        ));
    }

    #[test]
    fn zero_batch_size_fails_validation() {
        let mut loader = ConfigLoader::new();
        loader.apply_overrides(&CliOverrides {
            api_key: Some("k".into()),
            batch_size: Some(0),
            ..Default::default()
        });
        assert!(loader.finish().is_err());
    }
}
