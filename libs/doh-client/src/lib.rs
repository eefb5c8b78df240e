#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use bytes::Bytes;
use http_body_util::{BodyExt as _, Full};
use socket_factory::Protect;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::TlsConnector;
use url::Url;

const CONTENT_TYPE: &str = "application/dns-message";

/// An upper bound nobody reaches with DNS; guards the body collect.
const MAX_RESPONSE_SIZE: usize = 65_535;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// IPs for well-known DoH hosts, consulted before the system resolver so
/// that bootstrapping does not depend on working clear-text DNS.
const KNOWN_HOSTS: &[(&str, &[Ipv4Addr])] = &[
    (
        "dns.google",
        &[Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
    ),
    (
        "cloudflare-dns.com",
        &[Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(1, 0, 0, 1)],
    ),
    (
        "dns.quad9.net",
        &[Ipv4Addr::new(9, 9, 9, 9), Ipv4Addr::new(149, 112, 112, 112)],
    ),
];

/// POSTs `application/dns-message` queries over HTTP/2.
///
/// The TLS+h2 machinery is generic over the underlying byte stream, so the
/// same client serves both the direct path and the
/// everything-must-ride-the-carrier fallback.
#[derive(Clone)]
pub struct DohClient {
    url: Url,
    host: String,
    port: u16,
    tls: TlsConnector,
    protect: Protect,
}

impl DohClient {
    pub fn new(url: Url, protect: Protect) -> Result<Self> {
        anyhow::ensure!(url.scheme() == "https", "DoH url must use https");

        let host = url
            .host_str()
            .context("DoH url has no host")?
            .to_ascii_lowercase();
        let port = url.port().unwrap_or(443);

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let mut config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();
        config.alpn_protocols = vec![b"h2".to_vec()];

        Ok(Self {
            url,
            host,
            port,
            tls: TlsConnector::from(Arc::new(config)),
            protect,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Resolves the DoH host (static table first, system resolver second)
    /// and sends one query over a fresh protected connection.
    pub async fn query(&self, message: &[u8]) -> Result<Vec<u8>> {
        let mut last_error = anyhow::anyhow!("no candidate address for {}", self.host);

        for addr in self.resolve().await? {
            let stream = match socket_factory::connect_tcp(&self.protect, addr, CONNECT_TIMEOUT)
                .await
            {
                Ok(stream) => stream,
                Err(e) => {
                    last_error = anyhow::Error::new(e).context(format!("connect to {addr}"));
                    continue;
                }
            };

            return self.query_over(stream, message).await;
        }

        Err(last_error)
    }

    /// Sends one query over `io`, e.g. a stream already tunnelled through a
    /// covert carrier.
    pub async fn query_over<S>(&self, io: S, message: &[u8]) -> Result<Vec<u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let server_name = rustls_pki_types::ServerName::try_from(self.host.clone())
            .context("DoH host is not a valid server name")?;

        let tls_stream = self
            .tls
            .connect(server_name, io)
            .await
            .context("TLS handshake with DoH server failed")?;

        let (mut sender, connection) = hyper::client::conn::http2::handshake(
            hyper_util::rt::TokioExecutor::new(),
            hyper_util::rt::TokioIo::new(tls_stream),
        )
        .await
        .context("HTTP/2 handshake with DoH server failed")?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("DoH connection task ended: {e}");
            }
        });

        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(self.url.as_str())
            .header(http::header::CONTENT_TYPE, CONTENT_TYPE)
            .header(http::header::ACCEPT, CONTENT_TYPE)
            .body(Full::new(Bytes::copy_from_slice(message)))
            .context("Failed to build DoH request")?;

        let response = sender
            .send_request(request)
            .await
            .context("DoH request failed")?;

        if !response.status().is_success() {
            bail!("DoH server answered {}", response.status());
        }

        let body = http_body_util::Limited::new(response.into_body(), MAX_RESPONSE_SIZE)
            .collect()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read DoH response: {e}"))?
            .to_bytes();

        Ok(body.to_vec())
    }

    async fn resolve(&self) -> Result<Vec<SocketAddr>> {
        if let Some((_, ips)) = KNOWN_HOSTS.iter().find(|(name, _)| *name == self.host) {
            return Ok(ips
                .iter()
                .map(|ip| SocketAddr::new(IpAddr::V4(*ip), self.port))
                .collect());
        }

        // Not a known host; fall back to the system resolver.
        let addrs = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await
            .with_context(|| format!("Failed to resolve {}", self.host))?
            .collect::<Vec<_>>();

        anyhow::ensure!(!addrs.is_empty(), "{} resolved to nothing", self.host);

        Ok(addrs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(url: &str) -> Result<DohClient> {
        DohClient::new(url.parse().unwrap(), Protect::none())
    }

    #[test]
    fn plain_http_is_rejected() {
        assert!(client("http://dns.google/dns-query").is_err());
    }

    #[tokio::test]
    async fn known_hosts_resolve_without_system_dns() {
        let client = client("https://dns.google/dns-query").unwrap();

        let addrs = client.resolve().await.unwrap();

        assert!(addrs.contains(&"8.8.8.8:443".parse().unwrap()));
    }

    #[tokio::test]
    async fn unknown_port_is_preserved() {
        let client = client("https://cloudflare-dns.com:8443/dns-query").unwrap();

        let addrs = client.resolve().await.unwrap();

        assert!(addrs.iter().all(|a| a.port() == 8443));
    }
}
