//! Server side of the SOCKS5 handshake, shared by every egress bridge.
//!
//! The downstream client is the trusted TUN-to-SOCKS5 shim on localhost, so
//! we always advertise no-auth.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::{Cmd, Dest, METHOD_NO_AUTH, ReplyCode, VERSION};

#[derive(Debug)]
pub struct Request {
    pub cmd: Cmd,
    pub dest: Dest,
}

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("client sent version {0:#04x}")]
    BadVersion(u8),
    #[error("client offered no auth methods")]
    NoMethods,
    #[error("unsupported command {0:#04x}")]
    UnsupportedCommand(u8),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Performs method negotiation and reads the client's request.
///
/// On `UnsupportedCommand` the caller still owes the client a
/// `CommandNotSupported` reply; the request's destination has been consumed
/// off the stream by then.
pub async fn handshake<S>(stream: &mut S) -> Result<Request, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let version = stream.read_u8().await?;

    if version != VERSION {
        return Err(HandshakeError::BadVersion(version));
    }

    let n_methods = stream.read_u8().await? as usize;

    if n_methods == 0 {
        return Err(HandshakeError::NoMethods);
    }

    let mut methods = vec![0u8; n_methods];
    stream.read_exact(&mut methods).await?;

    stream.write_all(&[VERSION, METHOD_NO_AUTH]).await?;

    let mut request = [0u8; 3];
    stream.read_exact(&mut request).await?;

    if request[0] != VERSION {
        return Err(HandshakeError::BadVersion(request[0]));
    }

    let dest = Dest::read(stream).await?;

    let Some(cmd) = Cmd::from_wire(request[1]) else {
        return Err(HandshakeError::UnsupportedCommand(request[1]));
    };

    Ok(Request { cmd, dest })
}

/// Writes a CONNECT-style reply with a zeroed IPv4 bind address.
pub async fn send_reply<S>(stream: &mut S, code: ReplyCode) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[VERSION, code.to_wire(), 0x00, 0x01, 0, 0, 0, 0, 0, 0])
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DestAddr;
    use hex_literal::hex;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn greeting_and_connect_request() {
        let (mut client, mut server) = tokio::io::duplex(256);

        // 05 01 00 | 05 01 00 01 5d b8 d8 22 01 bb
        client
            .write_all(&hex!("05 01 00 05 01 00 01 5d b8 d8 22 01 bb"))
            .await
            .unwrap();

        let request = handshake(&mut server).await.unwrap();

        assert_eq!(request.cmd, Cmd::Connect);
        assert_eq!(
            request.dest,
            Dest::ipv4(Ipv4Addr::new(93, 184, 216, 34), 443)
        );

        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);
    }

    #[tokio::test]
    async fn fwd_udp_request_with_domain() {
        let (mut client, mut server) = tokio::io::duplex(256);

        let mut bytes = hex!("05 01 00 05 05 00").to_vec();
        Dest::domain("dns.example", 53).encode(&mut bytes);
        client.write_all(&bytes).await.unwrap();

        let request = handshake(&mut server).await.unwrap();

        assert_eq!(request.cmd, Cmd::FwdUdp);
        assert_eq!(request.dest.addr, DestAddr::Domain("dns.example".into()));
        assert_eq!(request.dest.port, 53);
    }

    #[tokio::test]
    async fn non_socks_version_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(256);

        client.write_all(&[0x04, 0x01]).await.unwrap();

        assert!(matches!(
            handshake(&mut server).await,
            Err(HandshakeError::BadVersion(0x04))
        ));
    }

    #[tokio::test]
    async fn reply_wire_format() {
        let (mut client, mut server) = tokio::io::duplex(64);

        send_reply(&mut server, ReplyCode::ConnectionRefused)
            .await
            .unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, hex!("05 05 00 01 00 00 00 00 00 00"));
    }
}
