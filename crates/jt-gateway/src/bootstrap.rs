//! Executor preparation
//!
//! Sent once, right after the channel opens and before any tunnel command:
//!
//! 1. the codec prelude defining the argument helper,
//! 2. `__jt_config`, the gateway settings the executor needs (remote target,
//!    base URL, sentinel),
//! 3. the configured bootstrap source, verbatim.

use serde_json::{json, Value};

use jt_core::config::GatewayConfig;
use jt_core::GatewayError;
use jt_protocol::FrameCodec;

use crate::channel::ChannelAdapter;

/// Executor-side name bound to the gateway settings
pub const CONFIG_BINDING: &str = "__jt_config";

/// Settings handed to the executor
pub fn executor_settings(config: &GatewayConfig) -> Value {
    json!({
        "remote_host": config.remote.host,
        "remote_port": config.remote.port,
        "base_url": config.remote.base_url,
        "sentinel": config.codec.sentinel,
    })
}

/// Send the prelude, settings and bootstrap source
pub async fn prepare_executor(
    channel: &ChannelAdapter,
    config: &GatewayConfig,
) -> Result<(), GatewayError> {
    channel.send_raw(FrameCodec::prelude()).await?;
    channel
        .send_raw(FrameCodec::encode_assignment(
            CONFIG_BINDING,
            &executor_settings(config),
        ))
        .await?;

    if let Some(path) = &config.executor.bootstrap {
        let source = tokio::fs::read_to_string(path).await?;
        tracing::info!(
            "Sending executor bootstrap from {:?} ({} bytes)",
            path,
            source.len()
        );
        channel.send_raw(source).await?;
    }

    Ok(())
}
