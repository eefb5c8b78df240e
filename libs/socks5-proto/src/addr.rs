use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt as _};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestAddr {
    Ipv4(Ipv4Addr),
    Domain(String),
    Ipv6(Ipv6Addr),
}

/// A SOCKS5 destination: address plus big-endian port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dest {
    pub addr: DestAddr,
    pub port: u16,
}

impl Dest {
    pub fn ipv4(addr: Ipv4Addr, port: u16) -> Self {
        Self {
            addr: DestAddr::Ipv4(addr),
            port,
        }
    }

    pub fn domain(name: impl Into<String>, port: u16) -> Self {
        Self {
            addr: DestAddr::Domain(name.into()),
            port,
        }
    }

    /// The host as passed to the router: IP literal string or domain name.
    pub fn host(&self) -> String {
        match &self.addr {
            DestAddr::Ipv4(ip) => ip.to_string(),
            DestAddr::Domain(name) => name.clone(),
            DestAddr::Ipv6(ip) => ip.to_string(),
        }
    }

    /// The socket address, if the destination is an IP literal.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        match self.addr {
            DestAddr::Ipv4(ip) => Some(SocketAddr::new(IpAddr::V4(ip), self.port)),
            DestAddr::Ipv6(ip) => Some(SocketAddr::new(IpAddr::V6(ip), self.port)),
            DestAddr::Domain(_) => None,
        }
    }

    /// Appends `ATYP + addr + port` to `buf`.
    pub fn encode(&self, buf: &mut Vec<u8>) {
        match &self.addr {
            DestAddr::Ipv4(ip) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            DestAddr::Domain(name) => {
                debug_assert!(name.len() <= 255);

                buf.push(ATYP_DOMAIN);
                buf.push(name.len() as u8);
                buf.extend_from_slice(name.as_bytes());
            }
            DestAddr::Ipv6(ip) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
        }

        buf.extend_from_slice(&self.port.to_be_bytes());
    }

    pub fn encoded_len(&self) -> usize {
        let addr = match &self.addr {
            DestAddr::Ipv4(_) => 4,
            DestAddr::Domain(name) => 1 + name.len(),
            DestAddr::Ipv6(_) => 16,
        };

        1 + addr + 2
    }

    /// Reads `ATYP + addr + port` from `stream`.
    pub async fn read<S>(stream: &mut S) -> io::Result<Self>
    where
        S: AsyncRead + Unpin,
    {
        let atyp = stream.read_u8().await?;

        let addr = match atyp {
            ATYP_IPV4 => {
                let mut octets = [0u8; 4];
                stream.read_exact(&mut octets).await?;

                DestAddr::Ipv4(octets.into())
            }
            ATYP_DOMAIN => {
                let len = stream.read_u8().await? as usize;
                let mut name = vec![0u8; len];
                stream.read_exact(&mut name).await?;

                DestAddr::Domain(String::from_utf8(name).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidData, "domain is not UTF-8")
                })?)
            }
            ATYP_IPV6 => {
                let mut octets = [0u8; 16];
                stream.read_exact(&mut octets).await?;

                DestAddr::Ipv6(octets.into())
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown ATYP {other:#04x}"),
                ));
            }
        };

        let port = stream.read_u16().await?;

        Ok(Self { addr, port })
    }

    /// Parses `ATYP + addr + port` from an in-memory buffer, requiring the
    /// buffer to be exactly consumed.
    pub fn parse(buf: &[u8]) -> io::Result<Self> {
        let err = |msg: &str| io::Error::new(io::ErrorKind::InvalidData, msg.to_owned());

        let (&atyp, rest) = buf.split_first().ok_or_else(|| err("empty address"))?;

        let addr_len = match atyp {
            ATYP_IPV4 => 4,
            ATYP_DOMAIN => {
                1 + *rest.first().ok_or_else(|| err("missing domain length"))? as usize
            }
            ATYP_IPV6 => 16,
            _ => return Err(err("unknown ATYP")),
        };

        if rest.len() != addr_len + 2 {
            return Err(err("address length mismatch"));
        }

        let (addr_bytes, port_bytes) = rest.split_at(addr_len);

        let addr = match atyp {
            ATYP_IPV4 => DestAddr::Ipv4(<[u8; 4]>::try_from(addr_bytes).map_err(|_| err("bad IPv4"))?.into()),
            ATYP_DOMAIN => DestAddr::Domain(
                String::from_utf8(addr_bytes[1..].to_vec())
                    .map_err(|_| err("domain is not UTF-8"))?,
            ),
            _ => DestAddr::Ipv6(<[u8; 16]>::try_from(addr_bytes).map_err(|_| err("bad IPv6"))?.into()),
        };

        Ok(Self {
            addr,
            port: u16::from_be_bytes([port_bytes[0], port_bytes[1]]),
        })
    }
}

impl fmt::Display for Dest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.addr {
            DestAddr::Ipv4(ip) => write!(f, "{ip}:{}", self.port),
            DestAddr::Domain(name) => write!(f, "{name}:{}", self.port),
            DestAddr::Ipv6(ip) => write!(f, "[{ip}]:{}", self.port),
        }
    }
}
