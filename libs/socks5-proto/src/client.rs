//! Client side of the SOCKS5 handshake, used when chaining a flow into a
//! carrier's own SOCKS5 endpoint.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt as _, AsyncWrite, AsyncWriteExt as _};

use crate::{
    Cmd, Dest, METHOD_NO_ACCEPTABLE, METHOD_NO_AUTH, METHOD_USER_PASS, ReplyCode, VERSION,
    addr::{ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6},
};

#[derive(Debug, Clone)]
pub struct Auth {
    pub username: String,
    pub password: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("carrier SOCKS5 sent version {0:#04x}")]
    BadVersion(u8),
    #[error("carrier SOCKS5 accepted none of our auth methods")]
    NoAcceptableMethod,
    #[error("carrier SOCKS5 selected unsupported method {0:#04x}")]
    UnexpectedMethod(u8),
    #[error("carrier SOCKS5 rejected our credentials")]
    AuthFailed,
    #[error("carrier SOCKS5 refused CONNECT: {0}")]
    Refused(ReplyCode),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Performs the full client-side handshake: greeting, optional RFC 1929
/// user/pass sub-negotiation, CONNECT, reply parse.
///
/// On success the stream is connected end-to-end to `dest`.
pub async fn connect<S>(stream: &mut S, dest: &Dest, auth: Option<&Auth>) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    request(stream, Cmd::Connect, dest, auth).await
}

/// Like [`connect`] but with an explicit command, e.g. FWD_UDP.
pub async fn request<S>(
    stream: &mut S,
    cmd: Cmd,
    dest: &Dest,
    auth: Option<&Auth>,
) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    negotiate_method(stream, auth).await?;
    send_request(stream, cmd, dest).await?;
    read_reply(stream).await?;

    Ok(())
}

async fn negotiate_method<S>(stream: &mut S, auth: Option<&Auth>) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match auth {
        Some(_) => stream.write_all(&[VERSION, 2, METHOD_NO_AUTH, METHOD_USER_PASS]).await?,
        None => stream.write_all(&[VERSION, 1, METHOD_NO_AUTH]).await?,
    }

    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await?;

    if choice[0] != VERSION {
        return Err(ConnectError::BadVersion(choice[0]));
    }

    match (choice[1], auth) {
        (METHOD_NO_AUTH, _) => Ok(()),
        (METHOD_USER_PASS, Some(auth)) => authenticate(stream, auth).await,
        (METHOD_NO_ACCEPTABLE, _) => Err(ConnectError::NoAcceptableMethod),
        (other, _) => Err(ConnectError::UnexpectedMethod(other)),
    }
}

async fn authenticate<S>(stream: &mut S, auth: &Auth) -> Result<(), ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let user = auth.username.as_bytes();
    let pass = auth.password.as_bytes();

    if user.len() > 255 || pass.len() > 255 {
        return Err(ConnectError::AuthFailed);
    }

    let mut msg = Vec::with_capacity(3 + user.len() + pass.len());
    msg.push(0x01); // sub-negotiation version
    msg.push(user.len() as u8);
    msg.extend_from_slice(user);
    msg.push(pass.len() as u8);
    msg.extend_from_slice(pass);

    stream.write_all(&msg).await?;

    let mut status = [0u8; 2];
    stream.read_exact(&mut status).await?;

    if status[1] != 0x00 {
        return Err(ConnectError::AuthFailed);
    }

    Ok(())
}

async fn send_request<S>(stream: &mut S, cmd: Cmd, dest: &Dest) -> Result<(), ConnectError>
where
    S: AsyncWrite + Unpin,
{
    let mut request = Vec::with_capacity(3 + dest.encoded_len());
    request.extend_from_slice(&[VERSION, cmd.to_wire(), 0x00]);
    dest.encode(&mut request);

    stream.write_all(&request).await?;

    Ok(())
}

async fn read_reply<S>(stream: &mut S) -> Result<(), ConnectError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    stream.read_exact(&mut header).await?;

    if header[0] != VERSION {
        return Err(ConnectError::BadVersion(header[0]));
    }

    // Consume the bound address regardless of the reply code.
    let bound_len = match header[3] {
        ATYP_IPV4 => 4,
        ATYP_DOMAIN => stream.read_u8().await? as usize,
        ATYP_IPV6 => 16,
        _ => {
            return Err(ConnectError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "unknown ATYP in reply",
            )));
        }
    };

    let mut bound = vec![0u8; bound_len + 2];
    stream.read_exact(&mut bound).await?;

    match ReplyCode::from_wire(header[1]) {
        ReplyCode::Succeeded => Ok(()),
        code => Err(ConnectError::Refused(code)),
    }
}
