//! Server configuration.

use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Required `X-API-Key` value for job routes, if any.
    pub api_key: Option<String>,
    /// Interval between SSE keep-alive comments.
    pub heartbeat_interval: Duration,
    /// Body limit for job submission.
    pub max_upload_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            api_key: None,
            heartbeat_interval: Duration::from_secs(5),
            max_upload_bytes: 512 * 1024 * 1024,
        }
    }
}

impl ServerConfig {
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
