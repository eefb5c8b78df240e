#![cfg_attr(test, allow(clippy::unwrap_used))]

mod http;
mod tls;

pub use http::host as http_host;
pub use tls::sni as tls_sni;

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt as _};

/// Upper bound on the bytes we peek from a flow.
pub const MAX_SNIFF_LEN: usize = 4096;

/// How long we wait for the client's first bytes.
const SNIFF_READ_BUDGET: Duration = Duration::from_millis(300);

/// The outcome of peeking into a just-opened flow.
///
/// `buffered` holds everything that was read off the stream and MUST be
/// re-prepended before any forwarding, whether or not a domain was found.
#[derive(Debug, Default)]
pub struct Sniffed {
    pub domain: Option<String>,
    pub buffered: Vec<u8>,
}

/// Attempts to recover a host name from the first bytes of a client stream.
///
/// Tries TLS ClientHello SNI first, then an HTTP Host header. A single read
/// of up to [`MAX_SNIFF_LEN`] bytes is issued; if the client sends nothing
/// within the budget, no domain is reported and nothing needs re-injection.
pub async fn peek<S>(stream: &mut S) -> Sniffed
where
    S: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; MAX_SNIFF_LEN];

    let n = match tokio::time::timeout(SNIFF_READ_BUDGET, stream.read(&mut buf)).await {
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            tracing::debug!("Sniff read failed: {e}");
            0
        }
        Err(_) => 0,
    };

    buf.truncate(n);

    let domain = sniff_domain(&buf);

    Sniffed {
        domain,
        buffered: buf,
    }
}

/// Pure-function variant of [`peek`] over an already-captured prefix.
pub fn sniff_domain(buf: &[u8]) -> Option<String> {
    tls::sni(buf).or_else(|| http::host(buf))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assembles a minimal but well-formed TLS 1.2 ClientHello carrying a
    /// single server_name extension.
    pub(crate) fn client_hello(host: &str) -> Vec<u8> {
        let host = host.as_bytes();

        let server_name_list = {
            let mut v = Vec::new();
            v.push(0x00); // name_type host_name
            v.extend_from_slice(&(host.len() as u16).to_be_bytes());
            v.extend_from_slice(host);
            v
        };

        let mut extension = Vec::new();
        extension.extend_from_slice(&[0x00, 0x00]); // server_name
        extension.extend_from_slice(&((server_name_list.len() + 2) as u16).to_be_bytes());
        extension.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
        extension.extend_from_slice(&server_name_list);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client_version
        body.extend_from_slice(&[0xab; 32]); // random
        body.push(0); // session_id
        body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]); // one cipher suite
        body.extend_from_slice(&[0x01, 0x00]); // null compression
        body.extend_from_slice(&(extension.len() as u16).to_be_bytes());
        body.extend_from_slice(&extension);

        let mut handshake = vec![0x01];
        handshake.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);

        record
    }

    #[test]
    fn sni_from_client_hello() {
        assert_eq!(
            sniff_domain(&client_hello("Example.IR")),
            Some("example.ir".to_owned())
        );
    }

    #[test]
    fn http_host_takes_over_for_plain_requests() {
        let req = b"GET / HTTP/1.1\r\nHost: Example.com:8080\r\nAccept: */*\r\n\r\n";

        assert_eq!(sniff_domain(req), Some("example.com".to_owned()));
    }

    #[test]
    fn garbage_yields_no_domain() {
        assert_eq!(sniff_domain(b"\x00\x01\x02\x03"), None);
        assert_eq!(sniff_domain(b""), None);
    }

    #[test]
    fn truncated_client_hello_is_safe() {
        let hello = client_hello("example.com");

        for cut in 0..hello.len() {
            // Must not panic, and must not invent a name from a partial walk.
            let _ = sniff_domain(&hello[..cut]);
        }
    }

    #[tokio::test]
    async fn peek_returns_exact_bytes_for_reinjection() {
        let hello = client_hello("example.ir");
        let mut stream = std::io::Cursor::new(hello.clone());

        let sniffed = peek(&mut stream).await;

        assert_eq!(sniffed.domain.as_deref(), Some("example.ir"));
        assert_eq!(sniffed.buffered, hello);
    }
}
