//! Jupyter kernel channel
//!
//! Starts a kernel through the Jupyter server's REST API and uses the
//! kernel's WebSocket as the executor channel. Outbound text is wrapped in
//! `execute_request` messages on the shell channel; inbound WebSocket text
//! messages are passed through untouched for the frame codec.

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use jt_core::config::ExecutorConfig;
use jt_core::traits::{ChannelFactory, ExecutorLifecycle, OpenedChannel};
use jt_core::ChannelError;

/// Jupyter messaging protocol version spoken on the kernel channel
pub const PROTOCOL_VERSION: &str = "5.3";

/// Username reported in message headers
const USERNAME: &str = "jtunnel";

/// Opens a kernel channel on a Jupyter server and shuts the kernel down later
pub struct JupyterChannelFactory {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    kernel_name: Option<String>,
    connect_timeout: Duration,
    kernel_id: Mutex<Option<String>>,
}

impl JupyterChannelFactory {
    /// Create a factory for the server at `config.proxy_url`
    pub fn new(config: &ExecutorConfig) -> Result<Self, ChannelError> {
        let base_url = config
            .proxy_url
            .as_deref()
            .ok_or_else(|| ChannelError::Open("executor.proxy_url is not set".into()))?
            .trim_end_matches('/')
            .to_string();

        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ChannelError::Open(format!(
                "executor.proxy_url must be an http(s) URL, got {}",
                base_url
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(config.connect_timeout)
            .build()
            .map_err(|e| ChannelError::Open(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            token: config.token.clone(),
            kernel_name: config.kernel_name.clone(),
            connect_timeout: config.connect_timeout,
            kernel_id: Mutex::new(None),
        })
    }

    /// Id of the kernel started by [`open`](ChannelFactory::open), if any
    pub async fn kernel_id(&self) -> Option<String> {
        self.kernel_id.lock().await.clone()
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.header(reqwest::header::AUTHORIZATION, format!("token {}", token)),
            None => builder,
        }
    }

    async fn default_kernel_name(&self) -> Result<String, ChannelError> {
        let specs: Value = self
            .request(reqwest::Method::GET, "/api/kernelspecs")
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ChannelError::Open(format!("Failed to list kernel specs: {}", e)))?
            .json()
            .await
            .map_err(|e| ChannelError::Open(format!("Invalid kernel spec listing: {}", e)))?;

        specs["default"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChannelError::Open("Jupyter server reports no default kernel".into()))
    }

    async fn start_kernel(&self) -> Result<String, ChannelError> {
        let name = match &self.kernel_name {
            Some(name) => name.clone(),
            None => self.default_kernel_name().await?,
        };
        tracing::info!("Starting {} kernel on {}", name, self.base_url);

        let kernel: Value = self
            .request(reqwest::Method::POST, "/api/kernels")
            .json(&json!({ "name": name }))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| ChannelError::Open(format!("Failed to start kernel: {}", e)))?
            .json()
            .await
            .map_err(|e| ChannelError::Open(format!("Invalid kernel description: {}", e)))?;

        kernel["id"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| ChannelError::Open("Kernel description has no id".into()))
    }

    async fn connect(&self, kernel_id: &str) -> Result<OpenedChannel, ChannelError> {
        let session = Uuid::new_v4().to_string();
        let url = websocket_url(&self.base_url, kernel_id, &session);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ChannelError::Open(format!("Invalid kernel channel URL: {}", e)))?;
        if let Some(token) = &self.token {
            let value = HeaderValue::from_str(&format!("token {}", token))
                .map_err(|e| ChannelError::Open(format!("Invalid token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| ChannelError::Open(format!("Kernel channel handshake failed: {}", e)))?;
        let (ws_sink, ws_stream) = ws.split();

        let sink = ws_sink
            .sink_map_err(|e| ChannelError::Transport(e.to_string()))
            .with(move |code: String| {
                let message = execute_request(&code, &session);
                futures::future::ready(Ok::<_, ChannelError>(Message::Text(message.to_string())))
            });

        let stream = ws_stream.filter_map(|message| async move {
            match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(frame)) => Some(Err(ChannelError::Closed(match frame {
                    Some(frame) => format!("kernel closed the channel: {}", frame.reason),
                    None => "kernel closed the channel".to_string(),
                }))),
                Ok(_) => None,
                Err(e) => Some(Err(ChannelError::Transport(e.to_string()))),
            }
        });

        Ok(OpenedChannel {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
            label: format!("kernel {}", kernel_id),
        })
    }
}

#[async_trait]
impl ChannelFactory for JupyterChannelFactory {
    async fn open(&self) -> Result<OpenedChannel, ChannelError> {
        let kernel_id = tokio::time::timeout(self.connect_timeout, self.start_kernel())
            .await
            .map_err(|_| ChannelError::Open("Timed out starting kernel".into()))??;
        *self.kernel_id.lock().await = Some(kernel_id.clone());
        tracing::info!("Kernel {} started", kernel_id);

        tokio::time::timeout(self.connect_timeout, self.connect(&kernel_id))
            .await
            .map_err(|_| ChannelError::Open("Timed out connecting to kernel channel".into()))?
    }
}

#[async_trait]
impl ExecutorLifecycle for JupyterChannelFactory {
    async fn terminate(&self) -> Result<(), ChannelError> {
        let Some(kernel_id) = self.kernel_id.lock().await.take() else {
            return Ok(());
        };

        tracing::info!("Requesting shutdown of kernel {}", kernel_id);
        self.request(
            reqwest::Method::DELETE,
            &format!("/api/kernels/{}", kernel_id),
        )
        .send()
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| ChannelError::Lifecycle(format!("Kernel {} shutdown failed: {}", kernel_id, e)))?;

        Ok(())
    }
}

/// WebSocket URL of a kernel's channels endpoint
fn websocket_url(base_url: &str, kernel_id: &str, session: &str) -> String {
    let ws_base = if let Some(rest) = base_url.strip_prefix("https://") {
        format!("wss://{}", rest)
    } else if let Some(rest) = base_url.strip_prefix("http://") {
        format!("ws://{}", rest)
    } else {
        base_url.to_string()
    };
    format!(
        "{}/api/kernels/{}/channels?session_id={}",
        ws_base, kernel_id, session
    )
}

/// Shell-channel message asking the kernel to run `code`
fn execute_request(code: &str, session: &str) -> Value {
    json!({
        "header": {
            "msg_id": Uuid::new_v4().to_string(),
            "username": USERNAME,
            "session": session,
            "msg_type": "execute_request",
            "version": PROTOCOL_VERSION,
        },
        "parent_header": {},
        "metadata": {},
        "content": {
            "code": code,
            "silent": false,
            "store_history": false,
            "user_expressions": {},
            "allow_stdin": false,
            // A failing command must not abort the ones queued behind it
            "stop_on_error": false,
        },
        "channel": "shell",
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: &str) -> ExecutorConfig {
        ExecutorConfig {
            proxy_url: Some(url.to_string()),
            ..ExecutorConfig::default()
        }
    }

    #[test]
    fn test_websocket_url() {
        assert_eq!(
            websocket_url("http://127.0.0.1:8888", "k1", "s1"),
            "ws://127.0.0.1:8888/api/kernels/k1/channels?session_id=s1"
        );
        assert_eq!(
            websocket_url("https://hub.example/user/x", "k1", "s1"),
            "wss://hub.example/user/x/api/kernels/k1/channels?session_id=s1"
        );
    }

    #[test]
    fn test_execute_request_envelope() {
        let message = execute_request("print(1)", "session-1");
        assert_eq!(message["header"]["msg_type"], "execute_request");
        assert_eq!(message["header"]["version"], PROTOCOL_VERSION);
        assert_eq!(message["header"]["session"], "session-1");
        assert_eq!(message["content"]["code"], "print(1)");
        assert_eq!(message["content"]["store_history"], false);
        assert_eq!(message["channel"], "shell");
    }

    #[test]
    fn test_failed_command_does_not_abort_queue() {
        let message = execute_request("forwardData()", "session-1");
        assert_eq!(message["content"]["stop_on_error"], false);
    }

    #[test]
    fn test_message_ids_are_unique() {
        let a = execute_request("a", "s");
        let b = execute_request("a", "s");
        assert_ne!(a["header"]["msg_id"], b["header"]["msg_id"]);
    }

    #[test]
    fn test_new_requires_http_url() {
        assert!(JupyterChannelFactory::new(&ExecutorConfig::default()).is_err());
        assert!(JupyterChannelFactory::new(&config("ftp://host")).is_err());

        let factory = JupyterChannelFactory::new(&config("http://127.0.0.1:8888/")).unwrap();
        assert_eq!(factory.base_url, "http://127.0.0.1:8888");
    }

    #[tokio::test]
    async fn test_terminate_without_kernel_is_noop() {
        let factory = JupyterChannelFactory::new(&config("http://127.0.0.1:1")).unwrap();
        assert_eq!(factory.kernel_id().await, None);
        assert!(factory.terminate().await.is_ok());
    }
}
