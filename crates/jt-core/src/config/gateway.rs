//! Gateway configuration

use jt_protocol::codec::DEFAULT_MAX_LINE_LENGTH;
use jt_protocol::{CodecOptions, DEFAULT_SENTINEL};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;
use crate::error::ConfigError;

/// Configuration for the gateway daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Local listeners and limits
    pub gateway: ListenerConfig,

    /// Destination reached from inside the executor
    pub remote: RemoteConfig,

    /// How to reach and prepare the executor
    pub executor: ExecutorConfig,

    /// Frame codec settings
    pub codec: CodecConfig,
}

impl GatewayConfig {
    /// Check that the configuration describes something runnable
    pub fn validate(&self) -> Result<(), ConfigError> {
        let gateway = &self.gateway;

        if gateway.stream_bind.is_none() && gateway.http_bind.is_none() {
            return Err(ConfigError::Invalid(
                "at least one of gateway.stream_bind or gateway.http_bind is required".into(),
            ));
        }

        if gateway.stream_bind.is_some() {
            if self.remote.host.is_none() {
                return Err(ConfigError::MissingField("remote.host".into()));
            }
            if self.remote.port.is_none() {
                return Err(ConfigError::MissingField("remote.port".into()));
            }
        }

        if gateway.http_bind.is_some() && self.remote.base_url.is_none() {
            return Err(ConfigError::MissingField("remote.base_url".into()));
        }

        if gateway.request_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "gateway.request_timeout must be greater than zero".into(),
            ));
        }

        if gateway.read_chunk_size == 0
            || gateway.command_queue == 0
            || gateway.max_peer_buffer == 0
        {
            return Err(ConfigError::Invalid(
                "gateway.read_chunk_size, gateway.command_queue and gateway.max_peer_buffer must be non-zero"
                    .into(),
            ));
        }

        if self.codec.sentinel.trim().is_empty() {
            return Err(ConfigError::Invalid("codec.sentinel must not be empty".into()));
        }

        Ok(())
    }
}

/// Local listeners and per-exchange limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Address of the raw TCP listener, if any
    pub stream_bind: Option<String>,

    /// Address of the HTTP listener, if any
    pub http_bind: Option<String>,

    /// Deadline for every HTTP exchange
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,

    /// Largest accepted HTTP request body in bytes
    pub max_body_size: usize,

    /// Upper bound on the whole shutdown sequence
    #[serde(with = "duration_secs")]
    pub shutdown_grace: Duration,

    /// Bytes read from a local peer per `forwardData`
    pub read_chunk_size: usize,

    /// Capacity of the outbound command queue
    pub command_queue: usize,

    /// Most remote bytes queued for one slow local peer before it is dropped
    pub max_peer_buffer: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            stream_bind: None,
            http_bind: None,
            request_timeout: Duration::from_secs(60),
            max_body_size: 50 * 1024 * 1024,
            shutdown_grace: Duration::from_secs(5),
            read_chunk_size: 16 * 1024,
            command_queue: 256,
            max_peer_buffer: 8 * 1024 * 1024,
        }
    }
}

/// Destination as seen from inside the executor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Host for stream connections
    pub host: Option<String>,

    /// Port for stream connections
    pub port: Option<u16>,

    /// Base URL prefixed to every forwarded HTTP path
    pub base_url: Option<String>,
}

/// Executor connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Jupyter server URL (e.g. `http://127.0.0.1:8888`)
    pub proxy_url: Option<String>,

    /// Kernel spec to start; the server default when unset
    pub kernel_name: Option<String>,

    /// Jupyter API token
    pub token: Option<String>,

    /// Executor-side source sent once after the prelude
    pub bootstrap: Option<PathBuf>,

    /// Deadline for starting the kernel and connecting its channel
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            proxy_url: None,
            kernel_name: None,
            token: None,
            bootstrap: None,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

/// Frame codec settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    /// Prefix marking tunnel frame lines
    pub sentinel: String,

    /// Treat kernel errors as executor faults
    pub surface_executor_errors: bool,

    /// Log untagged executor output at info instead of debug
    pub log_diagnostics: bool,

    /// Longest unterminated output line kept for reassembly
    pub max_line_length: usize,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            sentinel: DEFAULT_SENTINEL.to_string(),
            surface_executor_errors: true,
            log_diagnostics: false,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
        }
    }
}

impl CodecConfig {
    /// Options for a [`jt_protocol::FrameCodec`]
    pub fn to_options(&self) -> CodecOptions {
        CodecOptions {
            sentinel: self.sentinel.clone(),
            surface_executor_errors: self.surface_executor_errors,
            max_line_length: self.max_line_length,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream_only() -> GatewayConfig {
        let mut config = GatewayConfig::default();
        config.gateway.stream_bind = Some("127.0.0.1:9000".into());
        config.remote.host = Some("10.0.0.5".into());
        config.remote.port = Some(5432);
        config
    }

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.gateway.request_timeout, Duration::from_secs(60));
        assert_eq!(config.gateway.max_body_size, 50 * 1024 * 1024);
        assert_eq!(config.gateway.max_peer_buffer, 8 * 1024 * 1024);
        assert_eq!(config.codec.sentinel, DEFAULT_SENTINEL);
        assert!(config.codec.surface_executor_errors);
    }

    #[test]
    fn test_validate_rejects_zero_peer_buffer() {
        let mut config = stream_only();
        assert!(config.validate().is_ok());

        config.gateway.max_peer_buffer = 0;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_parse_partial_toml() {
        let config: GatewayConfig = toml::from_str(
            r#"
            [gateway]
            http_bind = "127.0.0.1:8080"
            request_timeout = 5

            [remote]
            base_url = "http://internal:3000"

            [codec]
            sentinel = "FORWARDER_MSG:"
            "#,
        )
        .unwrap();

        assert_eq!(config.gateway.http_bind.as_deref(), Some("127.0.0.1:8080"));
        assert_eq!(config.gateway.request_timeout, Duration::from_secs(5));
        assert_eq!(config.gateway.shutdown_grace, Duration::from_secs(5));
        assert_eq!(config.codec.sentinel, "FORWARDER_MSG:");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_requires_a_listener() {
        let config = GatewayConfig::default();
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_stream_needs_remote_target() {
        let mut config = stream_only();
        assert!(config.validate().is_ok());

        config.remote.port = None;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField(field)) if field == "remote.port"
        ));
    }

    #[test]
    fn test_validate_http_needs_base_url() {
        let mut config = stream_only();
        config.gateway.http_bind = Some("127.0.0.1:8080".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingField(field)) if field == "remote.base_url"
        ));
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let mut config = stream_only();
        config.gateway.request_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_codec_options() {
        let mut config = CodecConfig::default();
        config.surface_executor_errors = false;
        let options = config.to_options();
        assert_eq!(options.sentinel, DEFAULT_SENTINEL);
        assert!(!options.surface_executor_errors);
    }
}
