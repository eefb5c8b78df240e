//! Builders for the packets we synthesise towards the TUN device.

use std::net::SocketAddrV4;

use anyhow::{Context as _, Result};
use etherparse::{IpNumber, Ipv4Header, TcpHeader, UdpHeader};

use crate::{IpPacket, MAX_TCP_PAYLOAD, TTL};

#[derive(Debug, Default, Clone, Copy)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

impl TcpFlags {
    pub const SYN_ACK: Self = Self {
        syn: true,
        ack: true,
        fin: false,
        rst: false,
        psh: false,
    };

    pub const ACK: Self = Self {
        syn: false,
        ack: true,
        fin: false,
        rst: false,
        psh: false,
    };

    pub const FIN_ACK: Self = Self {
        syn: false,
        ack: true,
        fin: true,
        rst: false,
        psh: false,
    };

    pub const RST: Self = Self {
        syn: false,
        ack: false,
        fin: false,
        rst: true,
        psh: false,
    };
}

/// Builds an IPv4/TCP packet: 20-byte IPv4 header, DF set, TTL 64, checksums
/// over the IPv4 pseudo-header.
pub fn tcp(
    src: SocketAddrV4,
    dst: SocketAddrV4,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
) -> Result<IpPacket> {
    anyhow::ensure!(
        payload.len() <= MAX_TCP_PAYLOAD,
        "TCP payload exceeds one segment (len: {})",
        payload.len()
    );

    let mut ip = Ipv4Header::new(
        (TcpHeader::MIN_LEN + payload.len()) as u16,
        TTL,
        IpNumber::TCP,
        src.ip().octets(),
        dst.ip().octets(),
    )
    .context("IPv4 payload too big")?;
    ip.dont_fragment = true;
    ip.header_checksum = ip.calc_header_checksum();

    let mut tcp = TcpHeader::new(src.port(), dst.port(), seq, window);
    tcp.acknowledgment_number = ack;
    tcp.syn = flags.syn;
    tcp.ack = flags.ack;
    tcp.fin = flags.fin;
    tcp.rst = flags.rst;
    tcp.psh = flags.psh;
    tcp.checksum = tcp
        .calc_checksum_ipv4(&ip, payload)
        .context("Failed to compute TCP checksum")?;

    let mut buf = Vec::with_capacity(Ipv4Header::MIN_LEN + TcpHeader::MIN_LEN + payload.len());
    ip.write(&mut buf).context("Failed to write IPv4 header")?;
    tcp.write(&mut buf).context("Failed to write TCP header")?;
    buf.extend_from_slice(payload);

    IpPacket::parse(buf).context("Built an unparseable TCP packet")
}

/// Builds an IPv4/UDP packet. A computed checksum of zero is transmitted as
/// 0xFFFF per RFC 768.
pub fn udp(src: SocketAddrV4, dst: SocketAddrV4, payload: &[u8]) -> Result<IpPacket> {
    let mut ip = Ipv4Header::new(
        (UdpHeader::LEN + payload.len()) as u16,
        TTL,
        IpNumber::UDP,
        src.ip().octets(),
        dst.ip().octets(),
    )
    .context("IPv4 payload too big")?;
    ip.dont_fragment = true;
    ip.header_checksum = ip.calc_header_checksum();

    let udp = UdpHeader::with_ipv4_checksum(src.port(), dst.port(), &ip, payload)
        .context("Failed to compute UDP checksum")?;

    let mut buf = Vec::with_capacity(Ipv4Header::MIN_LEN + UdpHeader::LEN + payload.len());
    ip.write(&mut buf).context("Failed to write IPv4 header")?;
    udp.write(&mut buf).context("Failed to write UDP header")?;
    buf.extend_from_slice(payload);

    IpPacket::parse(buf).context("Built an unparseable UDP packet")
}
