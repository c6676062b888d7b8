//! Connectivity probing through HTTP CONNECT
//!
//! A probe opens a TCP connection to the proxy and asks it to tunnel to a
//! known target. The proxy is reachable if it answers the CONNECT with 200.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, instrument};

use crate::error::{PoolError, Result};
use crate::models::Proxy;

pub const CONNECTION_FAILED: &str = "CONNECTION_FAILED";
pub const PROXY_AUTH_FAILED: &str = "PROXY_AUTH_FAILED";
pub const PROXY_REJECTED: &str = "PROXY_REJECTED";
pub const BAD_RESPONSE: &str = "BAD_RESPONSE";

const DEFAULT_TARGET_HOST: &str = "www.google.com";
const DEFAULT_TARGET_PORT: u16 = 80;

/// Checks whether a proxy can carry traffic.
///
/// Implementations return `PoolError::Connectivity` on failure. Timeouts are
/// imposed by the caller.
#[async_trait]
pub trait ConnectivityProbe: Send + Sync {
    async fn probe(&self, proxy: &Proxy) -> Result<()>;
}

/// Probe that tunnels to a fixed target with HTTP CONNECT
#[derive(Debug, Clone)]
pub struct HttpConnectProbe {
    target_host: String,
    target_port: u16,
}

impl HttpConnectProbe {
    pub fn new(target_host: impl Into<String>, target_port: u16) -> Self {
        Self {
            target_host: target_host.into(),
            target_port,
        }
    }

    /// Derive the tunnel target from a check URL, falling back to
    /// `www.google.com:80` when the URL has no usable host
    pub fn from_url(check_url: &str) -> Self {
        match url::Url::parse(check_url)
            .ok()
            .and_then(|u| Some((u.host_str()?.to_string(), u.port_or_known_default()?)))
        {
            Some((host, port)) => Self::new(host, port),
            None => Self::new(DEFAULT_TARGET_HOST, DEFAULT_TARGET_PORT),
        }
    }

    pub fn target(&self) -> String {
        format!("{}:{}", self.target_host, self.target_port)
    }

    fn build_connect_request(&self, proxy: &Proxy) -> String {
        let target = self.target();
        let credentials = format!("{}:{}", proxy.endpoint.username, proxy.endpoint.password);
        format!(
            "CONNECT {target} HTTP/1.1\r\nHost: {target}\r\nProxy-Authorization: Basic {}\r\n\r\n",
            BASE64.encode(credentials.as_bytes())
        )
    }
}

impl Default for HttpConnectProbe {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_HOST, DEFAULT_TARGET_PORT)
    }
}

fn connectivity(code: &str, message: impl Into<String>) -> PoolError {
    PoolError::Connectivity {
        code: code.to_string(),
        message: message.into(),
    }
}

/// Map the status line of a CONNECT reply to a probe outcome
fn classify_response(status_line: &str) -> Result<()> {
    let mut parts = status_line.split_whitespace();
    let version = parts.next().unwrap_or_default();
    if !version.starts_with("HTTP/") {
        return Err(connectivity(
            BAD_RESPONSE,
            format!("unexpected reply: {}", status_line),
        ));
    }

    match parts.next().and_then(|code| code.parse::<u16>().ok()) {
        Some(200) => Ok(()),
        Some(407) => Err(connectivity(
            PROXY_AUTH_FAILED,
            "proxy rejected the supplied credentials",
        )),
        Some(code) => Err(connectivity(
            PROXY_REJECTED,
            format!("CONNECT refused with status {}", code),
        )),
        None => Err(connectivity(
            BAD_RESPONSE,
            format!("unexpected reply: {}", status_line),
        )),
    }
}

#[async_trait]
impl ConnectivityProbe for HttpConnectProbe {
    #[instrument(skip(self, proxy), fields(proxy_id = %proxy.id, address = %proxy.address()))]
    async fn probe(&self, proxy: &Proxy) -> Result<()> {
        let mut stream = TcpStream::connect(proxy.address())
            .await
            .map_err(|e| connectivity(CONNECTION_FAILED, format!("TCP connect failed: {}", e)))?;

        stream
            .write_all(self.build_connect_request(proxy).as_bytes())
            .await
            .map_err(|e| connectivity(CONNECTION_FAILED, format!("Failed to send CONNECT: {}", e)))?;

        let mut response = vec![0u8; 1024];
        let n = stream.read(&mut response).await.map_err(|e| {
            connectivity(
                CONNECTION_FAILED,
                format!("Failed to read CONNECT response: {}", e),
            )
        })?;
        if n == 0 {
            return Err(connectivity(
                CONNECTION_FAILED,
                "proxy closed the connection without replying",
            ));
        }

        let reply = String::from_utf8_lossy(&response[..n]);
        classify_response(reply.lines().next().unwrap_or_default())?;

        debug!(target = %self.target(), "CONNECT tunnel established");
        Ok(())
    }
}
