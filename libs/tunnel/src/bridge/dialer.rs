//! Stream dialers: how a CONNECT reaches the far side of each carrier.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use socket_factory::Protect;
use socks5_proto::client::{Auth, ConnectError};
use socks5_proto::{Dest, ReplyCode};

use crate::pool::ConnectionPool;

use super::{BoxedStream, StreamDialer};

#[derive(Debug, thiserror::Error)]
pub enum DialError {
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Socks(#[from] ConnectError),
    #[error("{0} did not resolve")]
    Unreachable(String),
    #[error("{0}")]
    Carrier(String),
}

impl DialError {
    pub fn reply_code(&self) -> ReplyCode {
        match self {
            DialError::Io(e) => ReplyCode::for_connect_error(e),
            DialError::Socks(ConnectError::Refused(code)) => *code,
            DialError::Socks(ConnectError::Io(e)) => ReplyCode::for_connect_error(e),
            DialError::Socks(_) => ReplyCode::GeneralFailure,
            DialError::Unreachable(_) => ReplyCode::HostUnreachable,
            DialError::Carrier(_) => ReplyCode::GeneralFailure,
        }
    }
}

/// Chains a CONNECT through a carrier that terminates at a SOCKS5 server:
/// the raw-TCP tunnel of a DNS carrier, a local Tor daemon, or a remote
/// SOCKS5 behind a covert stream.
pub struct SocksChainDialer {
    /// The local TCP endpoint of the carrier.
    pub endpoint: SocketAddr,
    pub auth: Option<Auth>,
    /// Pre-warmed sockets towards `endpoint`; each is used for one CONNECT.
    pub pool: Option<Arc<ConnectionPool>>,
    pub protect: Protect,
    /// SOCKS5 handshake budget. Lengthened for slow carriers such as DNS
    /// tunnels.
    pub handshake_timeout: Duration,
    /// Handshake attempts; DNS-tunnel carriers retry twice more at 1 s.
    pub attempts: u32,
    pub retry_delay: Duration,
}

impl SocksChainDialer {
    async fn carrier_socket(&self) -> Result<tokio::net::TcpStream, DialError> {
        if let Some(pool) = &self.pool {
            if let Some(stream) = pool.take().await {
                return Ok(stream);
            }
        }

        let stream =
            socket_factory::connect_tcp(&self.protect, self.endpoint, self.handshake_timeout)
                .await?;

        Ok(stream)
    }

    async fn connect_once(&self, dest: &Dest) -> Result<BoxedStream, DialError> {
        let mut stream = self.carrier_socket().await?;

        tokio::time::timeout(
            self.handshake_timeout,
            socks5_proto::client::connect(&mut stream, dest, self.auth.as_ref()),
        )
        .await
        .map_err(|_| {
            DialError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "carrier SOCKS5 handshake timed out",
            ))
        })??;

        Ok(Box::new(stream))
    }
}

#[async_trait::async_trait]
impl StreamDialer for SocksChainDialer {
    async fn open_stream(&self, dest: &Dest) -> Result<BoxedStream, DialError> {
        let mut last = None;

        for attempt in 1..=self.attempts.max(1) {
            match self.connect_once(dest).await {
                Ok(stream) => return Ok(stream),
                // A definitive refusal will not improve on retry.
                Err(DialError::Socks(ConnectError::Refused(code))) => {
                    return Err(DialError::Socks(ConnectError::Refused(code)));
                }
                Err(e) => {
                    tracing::debug!(%dest, attempt, "Carrier CONNECT failed: {e}");
                    last = Some(e);
                }
            }

            if attempt < self.attempts {
                tokio::time::sleep(self.retry_delay).await;
            }
        }

        Err(last.unwrap_or_else(|| DialError::Carrier("no connect attempt ran".to_owned())))
    }
}

/// Plain protected sockets; used by the DoH bridge, whose carrier only
/// covers DNS.
pub struct DirectDialer {
    pub protect: Protect,
    pub connect_timeout: Duration,
}

#[async_trait::async_trait]
impl StreamDialer for DirectDialer {
    async fn open_stream(&self, dest: &Dest) -> Result<BoxedStream, DialError> {
        let addr = match dest.socket_addr() {
            Some(addr) => addr,
            None => tokio::net::lookup_host((dest.host(), dest.port))
                .await?
                .next()
                .ok_or_else(|| DialError::Unreachable(dest.to_string()))?,
        };

        let stream = socket_factory::connect_tcp(&self.protect, addr, self.connect_timeout).await?;

        Ok(Box::new(stream))
    }
}
