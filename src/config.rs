//! Driver configuration.
//!
//! A [`Config`] names a driver and carries a free-form option map so the
//! registry can construct engines it has never heard of. Each driver parses
//! `options` into its own typed struct (see [`Config::options_as`]).

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Storage engine configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Driver name: `"local"`, `"sharded"`, `"s3"`, ...
    #[serde(rename = "type")]
    pub driver: String,

    /// Root directory (or bucket) for path-rooted drivers.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub base_path: String,

    /// Driver-specific options.
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub options: serde_json::Map<String, Value>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse config: {0}")]
    Parse(String),
}

impl Config {
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            ..Default::default()
        }
    }

    pub fn with_base_path(mut self, base_path: impl Into<String>) -> Self {
        self.base_path = base_path.into();
        self
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Load a configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Deserialize the option map into a driver's typed options.
    pub fn options_as<T: DeserializeOwned>(&self) -> Result<T, ConfigError> {
        serde_json::from_value(Value::Object(self.options.clone()))
            .map_err(|e| ConfigError::Parse(e.to_string()))
    }
}

impl From<ConfigError> for std::io::Error {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Io(e) => e,
            ConfigError::Parse(msg) => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase", default)]
    struct DemoOptions {
        chunk_size: u64,
        label: Option<String>,
    }

    impl Default for DemoOptions {
        fn default() -> Self {
            Self {
                chunk_size: 64,
                label: None,
            }
        }
    }

    #[test]
    fn test_builder_and_typed_options() {
        let cfg = Config::new("sharded")
            .with_base_path("/tmp/data")
            .with_option("chunkSize", 1024)
            .with_option("label", "alpha");

        let opts: DemoOptions = cfg.options_as().unwrap();
        assert_eq!(opts.chunk_size, 1024);
        assert_eq!(opts.label.as_deref(), Some("alpha"));
    }

    #[test]
    fn test_defaults_when_options_empty() {
        let cfg = Config::new("sharded");
        let opts: DemoOptions = cfg.options_as().unwrap();
        assert_eq!(opts.chunk_size, 64);
    }

    #[test]
    fn test_yaml_round_trip() {
        let yaml = "type: sharded\nbasePath: ./data\noptions:\n  chunkSize: 512\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.driver, "sharded");
        assert_eq!(cfg.base_path, "./data");
        assert_eq!(cfg.options["chunkSize"], 512);
    }
}
