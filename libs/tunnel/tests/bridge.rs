//! Bridge-level scenarios exercised straight over the SOCKS5 endpoint, the
//! way the TUN-to-SOCKS5 shim drives it.

#![allow(clippy::unwrap_used)]

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Result;
use domain_router::{Router, RouterConfig};
use socks5_proto::{Cmd, Dest};
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use veilnet_tunnel::bridge::{
    BoxedStream, BridgeConfig, BridgeHandle, DialError, DnsResolver, StreamDialer,
};

struct CountingDialer {
    used: AtomicUsize,
}

#[async_trait::async_trait]
impl StreamDialer for CountingDialer {
    async fn open_stream(&self, _dest: &Dest) -> Result<BoxedStream, DialError> {
        self.used.fetch_add(1, Ordering::Relaxed);

        Err(DialError::Carrier("carrier must not be used".to_owned()))
    }
}

struct NoDns;

#[async_trait::async_trait]
impl DnsResolver for NoDns {
    async fn query(&self, _message: &[u8]) -> Result<Vec<u8>> {
        anyhow::bail!("no DNS in this test")
    }
}

/// Builds a TLS ClientHello carrying the given SNI, the way a browser's
/// first flight looks to the sniffer.
fn client_hello(host: &str) -> Vec<u8> {
    let host = host.as_bytes();

    let mut server_name_list = vec![0x00];
    server_name_list.extend_from_slice(&(host.len() as u16).to_be_bytes());
    server_name_list.extend_from_slice(host);

    let mut extension = vec![0x00, 0x00];
    extension.extend_from_slice(&((server_name_list.len() + 2) as u16).to_be_bytes());
    extension.extend_from_slice(&(server_name_list.len() as u16).to_be_bytes());
    extension.extend_from_slice(&server_name_list);

    let mut body = vec![0x03, 0x03];
    body.extend_from_slice(&[0x5a; 32]);
    body.push(0);
    body.extend_from_slice(&[0x00, 0x02, 0x13, 0x01]);
    body.extend_from_slice(&[0x01, 0x00]);
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

#[tokio::test(flavor = "multi_thread")]
async fn sniffed_geo_domain_bypasses_the_carrier() {
    // The "origin" stands in for the censored-country server the router
    // must route around the tunnel.
    let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin_addr = origin.local_addr().unwrap();

    let (origin_tx, mut origin_rx) = tokio::sync::mpsc::channel::<Vec<u8>>(1);
    tokio::spawn(async move {
        let (mut stream, _) = origin.accept().await.unwrap();
        let mut received = vec![0u8; 4096];
        let n = stream.read(&mut received).await.unwrap();
        received.truncate(n);
        origin_tx.send(received).await.unwrap();
    });

    let router = Router::new(RouterConfig {
        enabled: true,
        geo_enabled: true,
        geo_domains: vec![".ir".into()],
        ..Default::default()
    })
    .unwrap();

    let dialer = Arc::new(CountingDialer {
        used: AtomicUsize::new(0),
    });

    let bridge = BridgeHandle::start(
        BridgeConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            router: Arc::new(router),
            protect: socket_factory::Protect::none(),
        },
        Arc::clone(&dialer) as Arc<dyn StreamDialer>,
        Arc::new(NoDns),
        tokio_util::sync::CancellationToken::new(),
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(bridge.local_addr()).await.unwrap();

    let dest = match origin_addr {
        std::net::SocketAddr::V4(v4) => Dest::ipv4(*v4.ip(), v4.port()),
        std::net::SocketAddr::V6(_) => unreachable!(),
    };

    socks5_proto::client::connect(&mut client, &dest, None)
        .await
        .unwrap();

    let hello = client_hello("example.ir");
    client.write_all(&hello).await.unwrap();

    // The origin receives the ClientHello byte-for-byte over a direct
    // socket; the carrier was never dialled.
    let received = tokio::time::timeout(Duration::from_secs(5), origin_rx.recv())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(received, hello);
    assert_eq!(dialer.used.load(Ordering::Relaxed), 0);

    bridge.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn fwd_udp_frames_round_trip_on_the_wire() {
    struct EchoDns;

    #[async_trait::async_trait]
    impl DnsResolver for EchoDns {
        async fn query(&self, message: &[u8]) -> Result<Vec<u8>> {
            Ok(message.to_vec())
        }
    }

    let bridge = BridgeHandle::start(
        BridgeConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            router: Arc::new(Router::new(RouterConfig::default()).unwrap()),
            protect: socket_factory::Protect::none(),
        },
        Arc::new(CountingDialer {
            used: AtomicUsize::new(0),
        }),
        Arc::new(EchoDns),
        tokio_util::sync::CancellationToken::new(),
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(bridge.local_addr()).await.unwrap();
    let dest = Dest::ipv4(Ipv4Addr::new(8, 8, 8, 8), 53);

    socks5_proto::client::request(&mut client, Cmd::FwdUdp, &dest, None)
        .await
        .unwrap();

    let query = [0x42u8; 32];
    socks5_proto::fwd_udp::write_frame(&mut client, &dest, &query)
        .await
        .unwrap();

    let frame = socks5_proto::fwd_udp::read_frame(&mut client)
        .await
        .unwrap()
        .unwrap();

    // The reply echoes the request's address block and carries a
    // well-formed payload.
    assert_eq!(frame.dest, dest);
    assert_eq!(frame.payload, query);

    // Non-DNS frames are swallowed, the session stays up.
    let other = Dest::ipv4(Ipv4Addr::new(1, 2, 3, 4), 4444);
    socks5_proto::fwd_udp::write_frame(&mut client, &other, b"not dns")
        .await
        .unwrap();
    socks5_proto::fwd_udp::write_frame(&mut client, &dest, b"\x00\x01")
        .await
        .unwrap();

    let frame = socks5_proto::fwd_udp::read_frame(&mut client)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.payload, b"\x00\x01");

    bridge.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn unsupported_command_gets_the_right_reply() {
    let bridge = BridgeHandle::start(
        BridgeConfig {
            listen: "127.0.0.1:0".parse().unwrap(),
            router: Arc::new(Router::new(RouterConfig::default()).unwrap()),
            protect: socket_factory::Protect::none(),
        },
        Arc::new(CountingDialer {
            used: AtomicUsize::new(0),
        }),
        Arc::new(NoDns),
        tokio_util::sync::CancellationToken::new(),
    )
    .await
    .unwrap();

    let mut client = TcpStream::connect(bridge.local_addr()).await.unwrap();

    // BIND (0x02) is not implemented.
    client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut method = [0u8; 2];
    client.read_exact(&mut method).await.unwrap();

    let mut request = vec![0x05, 0x02, 0x00];
    Dest::ipv4(Ipv4Addr::LOCALHOST, 80).encode(&mut request);
    client.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    client.read_exact(&mut reply).await.unwrap();

    assert_eq!(reply[1], 0x07); // command not supported

    bridge.stop().await;
}
