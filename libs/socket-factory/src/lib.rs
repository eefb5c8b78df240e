#![cfg_attr(test, allow(clippy::unwrap_used))]

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};

#[cfg(unix)]
use std::os::fd::{AsRawFd as _, RawFd};
#[cfg(not(unix))]
type RawFd = i32;

/// How often and how long we retry a listener bind on EADDRINUSE.
const BIND_ATTEMPTS: u32 = 10;
const BIND_RETRY_INTERVAL: Duration = Duration::from_millis(200);

/// Marks a socket as bypassing the VPN.
///
/// On platforms with a captive default route, every socket that must reach
/// the network directly (carrier sockets, bypassed flows, direct DNS) has to
/// be protected before `connect`. The platform supplies the callback; absent
/// one, protection is a no-op.
#[derive(Clone)]
pub struct Protect {
    inner: Option<Arc<dyn Fn(RawFd) -> io::Result<()> + Send + Sync>>,
}

impl Protect {
    pub fn new(f: impl Fn(RawFd) -> io::Result<()> + Send + Sync + 'static) -> Self {
        Self {
            inner: Some(Arc::new(f)),
        }
    }

    pub fn none() -> Self {
        Self { inner: None }
    }

    pub fn apply(&self, fd: RawFd) -> io::Result<()> {
        match &self.inner {
            Some(f) => f(fd),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for Protect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Protect")
            .field("installed", &self.inner.is_some())
            .finish()
    }
}

/// Opens a protected TCP connection to `dst` within `timeout`.
pub async fn connect_tcp(
    protect: &Protect,
    dst: SocketAddr,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let socket = match dst {
        SocketAddr::V4(_) => tokio::net::TcpSocket::new_v4()?,
        SocketAddr::V6(_) => tokio::net::TcpSocket::new_v6()?,
    };
    socket.set_nodelay(true)?;

    #[cfg(unix)]
    protect.apply(socket.as_raw_fd())?;
    #[cfg(not(unix))]
    let _ = protect;

    tokio::time::timeout(timeout, socket.connect(dst))
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, format!("connect to {dst}")))?
}

/// Binds a protected UDP socket on an ephemeral local port.
pub fn bind_udp(protect: &Protect, local: SocketAddr) -> io::Result<UdpSocket> {
    let addr = socket2::SockAddr::from(local);
    let socket = socket2::Socket::new(addr.domain(), socket2::Type::DGRAM, None)?;
    socket.set_nonblocking(true)?;

    #[cfg(unix)]
    protect.apply(socket.as_raw_fd())?;
    #[cfg(not(unix))]
    let _ = protect;

    socket.bind(&addr)?;

    UdpSocket::try_from(std::net::UdpSocket::from(socket))
}

/// Binds a TCP listener with SO_REUSEADDR, retrying EADDRINUSE up to 10
/// times at 200 ms intervals.
pub async fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let mut attempt = 0;

    loop {
        attempt += 1;

        match try_bind_listener(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == io::ErrorKind::AddrInUse && attempt < BIND_ATTEMPTS => {
                tracing::debug!(%addr, attempt, "Listen port still in use, retrying");
                tokio::time::sleep(BIND_RETRY_INTERVAL).await;
            }
            Err(e) => return Err(e),
        }
    }
}

fn try_bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let sock_addr = socket2::SockAddr::from(addr);
    let socket = socket2::Socket::new(sock_addr.domain(), socket2::Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&sock_addr)?;
    socket.listen(1024)?;

    TcpListener::from_std(std::net::TcpListener::from(socket))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[tokio::test]
    async fn bind_listener_succeeds_while_port_briefly_held() {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let first = bind_listener(addr).await.unwrap();
        let taken = first.local_addr().unwrap();

        // Release the port shortly after the second bind starts retrying.
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(350)).await;
            drop(first);
        });

        let second = bind_listener(taken).await.unwrap();

        assert_eq!(second.local_addr().unwrap(), taken);
    }

    #[tokio::test]
    async fn protect_callback_sees_the_fd() {
        let protect = Protect::new(|fd| {
            assert!(fd >= 0);
            Ok(())
        });

        let socket = bind_udp(
            &protect,
            SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0)),
        )
        .unwrap();

        assert!(socket.local_addr().unwrap().port() != 0);
    }
}
