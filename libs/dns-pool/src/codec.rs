//! DNS-over-TCP message framing.
//!
//! TCP's stream-oriented nature requires a length prefix before each DNS
//! message: a big-endian u16, per RFC 1035, section 4.2.2.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

pub async fn send_message<S>(stream: &mut S, message: &[u8]) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    if message.len() > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "DNS message exceeds 64 KiB",
        ));
    }

    let mut framed = Vec::with_capacity(2 + message.len());
    framed.extend_from_slice(&(message.len() as u16).to_be_bytes());
    framed.extend_from_slice(message);

    stream.write_all(&framed).await
}

pub async fn recv_message<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_u16().await? as usize;

    let mut message = vec![0u8; len];
    stream.read_exact(&mut message).await?;

    Ok(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn framing_round_trip() {
        let message = b"\x12\x34rest of the query";

        let mut buf = Vec::new();
        send_message(&mut buf, message).await.unwrap();

        assert_eq!(buf[..2], (message.len() as u16).to_be_bytes());
        assert_eq!(recv_message(&mut buf.as_slice()).await.unwrap(), message);
    }
}
