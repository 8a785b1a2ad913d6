//! Vault health probing
//!
//! A node is the primary when `GET /v1/sys/health` reports `"standby": false`.

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

pub const DEFAULT_HEALTH_PATH: &str = "/v1/sys/health";
pub const DEFAULT_SCHEME: &str = "https";
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    #[error("Health request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Invalid health document from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid boolean value '{value}' for {name}")]
    InvalidBool { name: String, value: String },
}

/// Parse a boolean flag value, accepting the usual spellings
/// (`1`, `t`, `true`, `TRUE`, `True` and their false counterparts).
pub fn parse_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value {
        "1" | "t" | "T" | "true" | "TRUE" | "True" => Ok(true),
        "0" | "f" | "F" | "false" | "FALSE" | "False" => Ok(false),
        _ => Err(ConfigError::InvalidBool {
            name: name.to_string(),
            value: value.to_string(),
        }),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthStatus {
    Primary,
    Standby,
}

/// The subset of Vault's health document we care about.
#[derive(Debug, Clone, Deserialize)]
pub struct HealthResponse {
    pub standby: bool,
    #[serde(default)]
    pub initialized: Option<bool>,
    #[serde(default)]
    pub sealed: Option<bool>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub cluster_name: Option<String>,
}

impl HealthResponse {
    pub fn status(&self) -> HealthStatus {
        if self.standby {
            HealthStatus::Standby
        } else {
            HealthStatus::Primary
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProbeConfig {
    pub scheme: String,
    pub host: String,
    pub path: String,
    pub tls_skip_verify: bool,
    pub timeout: Duration,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            scheme: DEFAULT_SCHEME.to_string(),
            host: "127.0.0.1".to_string(),
            path: DEFAULT_HEALTH_PATH.to_string(),
            tls_skip_verify: false,
            timeout: PROBE_TIMEOUT,
        }
    }
}

/// Issues one health request per probe over a tunnel's local port.
#[derive(Debug, Clone)]
pub struct HealthProber {
    client: reqwest::Client,
    config: ProbeConfig,
}

impl HealthProber {
    pub fn new(config: ProbeConfig) -> Result<Self, ProbeError> {
        // The node is always reached through a loopback tunnel, never a proxy.
        let client = reqwest::Client::builder()
            .no_proxy()
            .danger_accept_invalid_certs(config.tls_skip_verify)
            .timeout(config.timeout)
            .build()
            .map_err(ProbeError::Client)?;

        Ok(Self { client, config })
    }

    pub fn config(&self) -> &ProbeConfig {
        &self.config
    }

    /// `scheme://host:port` for a tunnel bound on `local_port`.
    pub fn url_prefix(&self, local_port: u16) -> String {
        format!("{}://{}:{}", self.config.scheme, self.config.host, local_port)
    }

    pub async fn probe(&self, local_port: u16) -> Result<HealthResponse, ProbeError> {
        self.probe_url(&self.url_prefix(local_port)).await
    }

    /// GET `{prefix}{health path}` and decode the health document.
    ///
    /// The status code is ignored: Vault answers standby with 429 and sealed
    /// with 503, both with a valid body.
    pub async fn probe_url(&self, prefix: &str) -> Result<HealthResponse, ProbeError> {
        let url = format!("{}{}", prefix, self.config.path);

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|source| ProbeError::Request {
                url: url.clone(),
                source,
            })?;
        let status = response.status();

        let body = response
            .bytes()
            .await
            .map_err(|source| ProbeError::Request {
                url: url.clone(),
                source,
            })?;

        let health: HealthResponse =
            serde_json::from_slice(&body).map_err(|source| ProbeError::Decode {
                url: url.clone(),
                source,
            })?;

        debug!(
            url = %url,
            status = status.as_u16(),
            standby = health.standby,
            sealed = ?health.sealed,
            "Health probe answered"
        );
        Ok(health)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// One-shot HTTP server answering any request with `status` and `body`.
    async fn serve_once(status: &'static str, body: &'static str) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = socket.read(&mut buf).await.unwrap();
                if n == 0 {
                    return;
                }
                request.extend_from_slice(&buf[..n]);
            }
            assert!(request.starts_with(b"GET /v1/sys/health HTTP/1.1\r\n"));

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = socket.shutdown().await;
        });

        port
    }

    fn prober() -> HealthProber {
        HealthProber::new(ProbeConfig {
            scheme: "http".to_string(),
            timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn test_parse_bool() {
        for value in ["1", "t", "T", "true", "TRUE", "True"] {
            assert!(parse_bool("TLS_SKIP_VERIFY", value).unwrap());
        }
        for value in ["0", "f", "F", "false", "FALSE", "False"] {
            assert!(!parse_bool("TLS_SKIP_VERIFY", value).unwrap());
        }

        let err = parse_bool("TLS_SKIP_VERIFY", "yes").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid boolean value 'yes' for TLS_SKIP_VERIFY"
        );
        assert!(parse_bool("TLS_SKIP_VERIFY", "").is_err());
    }

    #[test]
    fn test_default_config() {
        let config = ProbeConfig::default();
        assert_eq!(config.scheme, "https");
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.path, "/v1/sys/health");
        assert!(!config.tls_skip_verify);
    }

    #[test]
    fn test_url_prefix() {
        assert_eq!(prober().url_prefix(40123), "http://127.0.0.1:40123");
    }

    #[test]
    fn test_decode_vault_health() {
        let body = r#"{"initialized":true,"sealed":false,"standby":true,
            "performance_standby":false,"server_time_utc":1700000000,
            "version":"1.15.2","cluster_name":"vault-cluster-1"}"#;
        let health: HealthResponse = serde_json::from_str(body).unwrap();
        assert_eq!(health.status(), HealthStatus::Standby);
        assert_eq!(health.version.as_deref(), Some("1.15.2"));

        // The standby field is required.
        assert!(serde_json::from_str::<HealthResponse>(r#"{"sealed":false}"#).is_err());
    }

    #[tokio::test]
    async fn test_probe_primary() {
        let port = serve_once("200 OK", r#"{"initialized":true,"sealed":false,"standby":false}"#).await;
        let health = prober().probe(port).await.unwrap();
        assert_eq!(health.status(), HealthStatus::Primary);
    }

    #[tokio::test]
    async fn test_probe_standby_uses_body_not_status() {
        let port = serve_once("429 Too Many Requests", r#"{"standby":true}"#).await;
        let health = prober().probe(port).await.unwrap();
        assert_eq!(health.status(), HealthStatus::Standby);
    }

    #[tokio::test]
    async fn test_probe_garbage_is_error_not_standby() {
        let port = serve_once("200 OK", "<html>not vault</html>").await;
        assert!(matches!(
            prober().probe(port).await,
            Err(ProbeError::Decode { .. })
        ));
    }

    #[tokio::test]
    async fn test_probe_refused_is_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        assert!(matches!(
            prober().probe(port).await,
            Err(ProbeError::Request { .. })
        ));
    }
}
