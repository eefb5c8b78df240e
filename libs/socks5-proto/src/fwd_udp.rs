//! The non-standard FWD_UDP (0x05) framing: datagrams over a SOCKS5 TCP
//! session, one direction at a time, as consumed by the TUN-to-SOCKS5 shim.
//!
//! ```text
//! [ datLen_hi | datLen_lo | hdrLen ] [ ATYP + addr + port ] [ payload ]
//!     1 byte      1 byte    1 byte       (hdrLen - 3)         datLen
//! ```

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::Dest;

/// Framing bytes preceding the address block.
const FRAME_OVERHEAD: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdpFrame {
    pub dest: Dest,
    pub payload: Vec<u8>,
}

/// Reads one frame; `Ok(None)` on clean EOF before the first byte.
pub async fn read_frame<S>(stream: &mut S) -> io::Result<Option<UdpFrame>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_OVERHEAD];

    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let payload_len = u16::from_be_bytes([header[0], header[1]]) as usize;
    let header_len = header[2] as usize;

    let addr_len = header_len.checked_sub(FRAME_OVERHEAD).ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "FWD_UDP header length < 3")
    })?;

    let mut addr = vec![0u8; addr_len];
    stream.read_exact(&mut addr).await?;
    let dest = Dest::parse(&addr)?;

    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await?;

    Ok(Some(UdpFrame { dest, payload }))
}

/// Writes one frame, echoing `dest` in the address block.
pub async fn write_frame<S>(stream: &mut S, dest: &Dest, payload: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    if payload.len() > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "FWD_UDP payload exceeds 64 KiB",
        ));
    }

    let header_len = FRAME_OVERHEAD + dest.encoded_len();

    if header_len > u8::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "FWD_UDP address does not fit the header",
        ));
    }

    let mut frame = Vec::with_capacity(header_len + payload.len());
    frame.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    frame.push(header_len as u8);
    dest.encode(&mut frame);
    frame.extend_from_slice(payload);

    stream.write_all(&frame).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use std::net::Ipv4Addr;

    #[tokio::test]
    async fn dns_query_frame_round_trip() {
        // 32-byte DNS query to 8.8.8.8:53, header structure from the shim:
        // 00 20 0a | 01 08 08 08 08 00 35 | <payload>
        let dest = Dest::ipv4(Ipv4Addr::new(8, 8, 8, 8), 53);
        let payload = [0x42u8; 32];

        let mut buf = Vec::new();
        write_frame(&mut buf, &dest, &payload).await.unwrap();

        assert_eq!(&buf[..10], &hex!("00 20 0a 01 08 08 08 08 00 35"));
        assert_eq!(buf.len(), 10 + 32);

        let frame = read_frame(&mut buf.as_slice()).await.unwrap().unwrap();
        assert_eq!(frame.dest, dest);
        assert_eq!(frame.payload, payload);
    }

    #[tokio::test]
    async fn eof_before_first_byte_is_clean() {
        let mut empty: &[u8] = &[];

        assert!(read_frame(&mut empty).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn short_header_is_invalid() {
        let mut bytes: &[u8] = &hex!("00 01 02 aa");

        let err = read_frame(&mut bytes).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn domain_address_frames() {
        let dest = Dest::domain("resolver.example", 53);
        let payload = b"\x12\x34query";

        let mut buf = Vec::new();
        write_frame(&mut buf, &dest, payload).await.unwrap();

        let frame = read_frame(&mut buf.as_slice()).await.unwrap().unwrap();
        assert_eq!(frame.dest, dest);
        assert_eq!(frame.payload, payload);
    }
}
