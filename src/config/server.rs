use std::net::IpAddr;

use serde::{Deserialize, Serialize};

/// HTTP server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// Address to bind to.
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Maximum accepted request body, in bytes. Image payloads arrive
    /// base64-encoded, so this must sit above `limits.max_image_bytes`.
    #[serde(default = "default_body_limit")]
    pub body_limit_bytes: usize,

    /// Log output format.
    #[serde(default)]
    pub log_format: LogFormat,

    /// Default tracing filter directive (overridden by `RUST_LOG`).
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            body_limit_bytes: default_body_limit(),
            log_format: LogFormat::default(),
            log_filter: default_log_filter(),
        }
    }
}

fn default_host() -> IpAddr {
    "127.0.0.1".parse().expect("valid literal")
}

fn default_port() -> u16 {
    8080
}

fn default_body_limit() -> usize {
    8 * 1024 * 1024
}

fn default_log_filter() -> String {
    "info".to_string()
}
