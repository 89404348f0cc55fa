//! Configuration management for jtunnel

mod gateway;
pub mod serde_utils;

pub use gateway::{CodecConfig, ExecutorConfig, GatewayConfig, ListenerConfig, RemoteConfig};

use crate::error::ConfigError;
use std::path::{Path, PathBuf};

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("jtunnel")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_path_is_namespaced() {
        let path = default_config_path();
        assert!(path.ends_with("jtunnel/config.toml"));
    }

    #[test]
    fn test_load_missing_file() {
        let result: Result<GatewayConfig, _> =
            load_config(Path::new("/nonexistent/jtunnel/config.toml"));
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[gateway]\nstream_bind = \"127.0.0.1:9000\"\n\n[remote]\nhost = \"db\"\nport = 5432"
        )
        .unwrap();

        let config: GatewayConfig = load_config(file.path()).unwrap();
        assert_eq!(config.remote.host.as_deref(), Some("db"));
        assert_eq!(config.remote.port, Some(5432));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_invalid_toml() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[gateway\nstream_bind = ").unwrap();

        let result: Result<GatewayConfig, _> = load_config(file.path());
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }
}
