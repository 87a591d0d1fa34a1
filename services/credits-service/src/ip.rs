//! Public IP discovery for the anonymous identity key.

use crate::config::IpLookupConfig;
use crate::error::IpDiscoveryError;
use async_trait::async_trait;
use serde::Deserialize;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{debug, warn};

/// Source of the caller's public IP address.
#[async_trait]
pub trait IpDiscovery: Send + Sync {
    /// Discover the public IP address.
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be determined.
    async fn discover(&self) -> Result<IpAddr, IpDiscoveryError>;
}

#[derive(Debug, Deserialize)]
struct IpLookupResponse {
    ip: String,
}

/// Looks up the public IP address over HTTP.
///
/// Accepts either a JSON body `{"ip": "..."}` or a plain-text address.
#[derive(Debug, Clone)]
pub struct HttpIpDiscovery {
    client: reqwest::Client,
    url: String,
}

impl HttpIpDiscovery {
    /// Create a discovery client from configuration.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built.
    pub fn new(config: &IpLookupConfig) -> Result<Self, IpDiscoveryError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()?;
        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    /// Extract the address from a lookup response body.
    fn parse_body(body: &str) -> Result<IpAddr, IpDiscoveryError> {
        let trimmed = body.trim();
        let candidate = serde_json::from_str::<IpLookupResponse>(trimmed)
            .map_or_else(|_| trimmed.to_string(), |parsed| parsed.ip);

        candidate
            .trim()
            .parse()
            .map_err(|_| IpDiscoveryError::InvalidAddress(candidate.clone()))
    }
}

#[async_trait]
impl IpDiscovery for HttpIpDiscovery {
    async fn discover(&self) -> Result<IpAddr, IpDiscoveryError> {
        let body = self
            .client
            .get(&self.url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                warn!(error = %e, url = %self.url, "IP lookup failed");
                IpDiscoveryError::from(e)
            })?
            .text()
            .await?;

        let ip = Self::parse_body(&body)?;
        debug!(%ip, "Discovered public IP address");
        Ok(ip)
    }
}

/// Discovery that always answers with a fixed address, or always fails.
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticIpDiscovery {
    ip: Option<IpAddr>,
}

impl StaticIpDiscovery {
    /// Always discover `ip`.
    #[must_use]
    pub const fn new(ip: IpAddr) -> Self {
        Self { ip: Some(ip) }
    }

    /// Never discover an address.
    #[must_use]
    pub const fn unavailable() -> Self {
        Self { ip: None }
    }
}

#[async_trait]
impl IpDiscovery for StaticIpDiscovery {
    async fn discover(&self) -> Result<IpAddr, IpDiscoveryError> {
        self.ip
            .ok_or_else(|| IpDiscoveryError::InvalidAddress("no address configured".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, Ipv6Addr};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Serve one canned HTTP response on a local port and return its URL.
    async fn lookup_endpoint(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.expect("accept");
            let mut request = [0_u8; 1024];
            let _ = socket.read(&mut request).await;
            let response = format!(
                "HTTP/1.1 {status}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                body.len()
            );
            socket.write_all(response.as_bytes()).await.expect("write");
        });
        format!("http://{addr}/")
    }

    fn discovery(url: String) -> HttpIpDiscovery {
        HttpIpDiscovery::new(&IpLookupConfig {
            url,
            timeout_seconds: 2,
        })
        .unwrap()
    }

    #[test]
    fn test_parse_json_body() {
        let ip = HttpIpDiscovery::parse_body(r#"{"ip":"198.51.100.23"}"#).unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(198, 51, 100, 23)));
    }

    #[test]
    fn test_parse_plain_body() {
        let ip = HttpIpDiscovery::parse_body("2001:db8::1\n").unwrap();
        assert_eq!(ip, IpAddr::V6(Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1)));
    }

    #[test]
    fn test_parse_garbage_body() {
        assert!(matches!(
            HttpIpDiscovery::parse_body("<html>rate limited</html>"),
            Err(IpDiscoveryError::InvalidAddress(_))
        ));
        assert!(HttpIpDiscovery::parse_body(r#"{"ip":"nope"}"#).is_err());
    }

    #[tokio::test]
    async fn test_static_discovery() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(StaticIpDiscovery::new(ip).discover().await.unwrap(), ip);
        assert!(StaticIpDiscovery::unavailable().discover().await.is_err());
    }

    #[tokio::test]
    async fn test_discover_json_response() {
        let url = lookup_endpoint("200 OK", r#"{"ip":"203.0.113.7"}"#).await;
        let ip = discovery(url).discover().await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 7)));
    }

    #[tokio::test]
    async fn test_discover_plain_text_response() {
        let url = lookup_endpoint("200 OK", "203.0.113.8\n").await;
        let ip = discovery(url).discover().await.unwrap();
        assert_eq!(ip, IpAddr::V4(Ipv4Addr::new(203, 0, 113, 8)));
    }

    #[tokio::test]
    async fn test_discover_error_status() {
        let url = lookup_endpoint("500 Internal Server Error", r#"{"ip":"203.0.113.9"}"#).await;
        assert!(matches!(
            discovery(url).discover().await,
            Err(IpDiscoveryError::Request(_))
        ));
    }

    #[tokio::test]
    async fn test_discover_unreachable_endpoint() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        assert!(matches!(
            discovery(format!("http://{addr}/")).discover().await,
            Err(IpDiscoveryError::Request(_))
        ));
    }

    #[test]
    fn test_http_discovery_builds_from_default_config() {
        let discovery = HttpIpDiscovery::new(&IpLookupConfig::default()).unwrap();
        assert_eq!(discovery.url, "https://api.ipify.org?format=json");
    }
}
