#![cfg_attr(test, allow(clippy::unwrap_used))]

pub mod make;

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use etherparse::{IpNumber, Ipv4Slice, TcpSlice, UdpSlice};

/// The MTU of the TUN device.
pub const MTU: usize = 1500;

/// The largest TCP payload we emit in a single segment.
///
/// 1500 bytes MTU minus a 20-byte IPv4 header (we never emit options) and a
/// 20-byte TCP header.
pub const MAX_TCP_PAYLOAD: usize = MTU - 20 - 20;

/// The TTL of every packet we synthesise towards the TUN device.
pub const TTL: u8 = 64;

/// The TCP 4-tuple identifying a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub src: SocketAddrV4,
    pub dst: SocketAddrV4,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The version nibble was 6. Recognised so the caller can drop it silently.
    #[error("IPv6 packet")]
    Ipv6,
    #[error("empty packet")]
    Empty,
    #[error("IP version {0} is neither 4 nor 6")]
    UnknownVersion(u8),
    #[error("malformed IPv4 packet: {0}")]
    Ipv4(#[from] etherparse::err::ipv4::SliceError),
    #[error("malformed TCP segment: {0}")]
    Tcp(#[from] etherparse::err::tcp::HeaderSliceError),
    #[error("malformed UDP datagram: {0}")]
    Udp(#[from] etherparse::err::LenError),
    #[error("fragmented IPv4 packet")]
    Fragmented,
}

/// A validated IPv4 packet as read from (or written to) the TUN device.
///
/// The bytes are kept as-is; all accessors re-slice on demand.
#[derive(Clone, PartialEq, Eq)]
pub struct IpPacket {
    buf: Vec<u8>,
}

impl IpPacket {
    /// Parses and validates `buf` as an IPv4 packet.
    ///
    /// TCP and UDP payloads are length-checked here so that later accessors
    /// cannot fail.
    pub fn parse(buf: Vec<u8>) -> Result<Self, ParseError> {
        let Some(first) = buf.first() else {
            return Err(ParseError::Empty);
        };

        match first >> 4 {
            4 => {}
            6 => return Err(ParseError::Ipv6),
            v => return Err(ParseError::UnknownVersion(v)),
        }

        let ip = Ipv4Slice::from_slice(&buf)?;

        if ip.is_payload_fragmented() {
            return Err(ParseError::Fragmented);
        }

        match ip.payload_ip_number() {
            IpNumber::TCP => {
                TcpSlice::from_slice(ip.payload().payload)?;
            }
            IpNumber::UDP => {
                UdpSlice::from_slice(ip.payload().payload)?;
            }
            _ => {}
        }

        Ok(Self { buf })
    }

    pub fn source(&self) -> Ipv4Addr {
        self.ipv4().header().source_addr()
    }

    pub fn destination(&self) -> Ipv4Addr {
        self.ipv4().header().destination_addr()
    }

    pub fn protocol(&self) -> IpNumber {
        self.ipv4().payload_ip_number()
    }

    pub fn as_tcp(&self) -> Option<TcpSlice<'_>> {
        let ip = self.ipv4();

        if ip.payload_ip_number() != IpNumber::TCP {
            return None;
        }

        TcpSlice::from_slice(self.l4_bytes()).ok()
    }

    pub fn as_udp(&self) -> Option<UdpSlice<'_>> {
        let ip = self.ipv4();

        if ip.payload_ip_number() != IpNumber::UDP {
            return None;
        }

        UdpSlice::from_slice(self.l4_bytes()).ok()
    }

    /// The flow key of a TCP or UDP packet, `None` for other protocols.
    pub fn flow_key(&self) -> Option<FlowKey> {
        let (sport, dport) = if let Some(tcp) = self.as_tcp() {
            (tcp.source_port(), tcp.destination_port())
        } else if let Some(udp) = self.as_udp() {
            (udp.source_port(), udp.destination_port())
        } else {
            return None;
        };

        Some(FlowKey {
            src: SocketAddrV4::new(self.source(), sport),
            dst: SocketAddrV4::new(self.destination(), dport),
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    #[allow(clippy::expect_used)]
    fn ipv4(&self) -> Ipv4Slice<'_> {
        Ipv4Slice::from_slice(&self.buf).expect("validated in `parse`")
    }

    fn l4_bytes(&self) -> &[u8] {
        let ihl = (self.buf[0] & 0x0f) as usize * 4;

        &self.buf[ihl..]
    }
}

impl fmt::Debug for IpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = f.debug_struct("IpPacket");

        dbg.field("src", &self.source()).field("dst", &self.destination());

        if let Some(tcp) = self.as_tcp() {
            dbg.field("sport", &tcp.source_port())
                .field("dport", &tcp.destination_port())
                .field("seq", &tcp.sequence_number())
                .field("ack", &tcp.acknowledgment_number())
                .field("len", &tcp.payload().len());

            if tcp.syn() {
                dbg.field("syn", &true);
            }

            if tcp.fin() {
                dbg.field("fin", &true);
            }

            if tcp.rst() {
                dbg.field("rst", &true);
            }
        }

        if let Some(udp) = self.as_udp() {
            dbg.field("sport", &udp.source_port())
                .field("dport", &udp.destination_port())
                .field("len", &udp.payload().len());
        }

        dbg.finish()
    }
}

/// Recomputes the IPv4 header checksum and the TCP/UDP checksum and compares
/// them against the transmitted ones.
pub fn verify_checksums(packet: &IpPacket) -> bool {
    let Ok(ip) = Ipv4Slice::from_slice(packet.as_bytes()) else {
        return false;
    };
    let header = ip.header().to_header();

    if header.calc_header_checksum() != ip.header().header_checksum() {
        return false;
    }

    if let Some(tcp) = packet.as_tcp() {
        let computed = tcp
            .to_header()
            .calc_checksum_ipv4(&header, tcp.payload())
            .ok();

        return computed == Some(tcp.checksum());
    }

    if let Some(udp) = packet.as_udp() {
        let computed = etherparse::UdpHeader::with_ipv4_checksum(
            udp.source_port(),
            udp.destination_port(),
            &header,
            udp.payload(),
        )
        .map(|h| h.checksum)
        .ok();

        return computed == Some(udp.to_header().checksum);
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::make::TcpFlags;
    use hex_literal::hex;

    fn key() -> FlowKey {
        FlowKey {
            src: SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40000),
            dst: SocketAddrV4::new(Ipv4Addr::new(93, 184, 216, 34), 443),
        }
    }

    #[test]
    fn tcp_build_then_parse_recovers_fields() {
        let packet = make::tcp(
            key().src,
            key().dst,
            1000,
            2000,
            TcpFlags {
                syn: true,
                ack: true,
                ..Default::default()
            },
            65535,
            b"hello",
        )
        .unwrap();

        assert_eq!(packet.source(), *key().src.ip());
        assert_eq!(packet.destination(), *key().dst.ip());

        let tcp = packet.as_tcp().unwrap();
        assert_eq!(tcp.source_port(), 40000);
        assert_eq!(tcp.destination_port(), 443);
        assert_eq!(tcp.sequence_number(), 1000);
        assert_eq!(tcp.acknowledgment_number(), 2000);
        assert!(tcp.syn());
        assert!(tcp.ack());
        assert!(!tcp.fin());
        assert_eq!(tcp.payload(), b"hello");

        assert!(verify_checksums(&packet));
    }

    #[test]
    fn tcp_header_is_20_bytes_with_df_and_ttl_64() {
        let packet = make::tcp(
            key().src,
            key().dst,
            1,
            0,
            TcpFlags::default(),
            1024,
            b"",
        )
        .unwrap();

        let bytes = packet.as_bytes();
        assert_eq!(bytes[0], 0x45); // version 4, IHL 5
        assert_eq!(bytes[6] & 0x40, 0x40); // DF
        assert_eq!(bytes[8], TTL);
        assert_eq!(bytes.len(), 40);
    }

    #[test]
    fn udp_empty_payload_checksum_is_ffff() {
        // The pseudo-header sum for this particular tuple folds to zero,
        // which RFC 768 requires to be transmitted as 0xFFFF:
        // 0xFFDE (dst) + 0x0011 (proto) + 2 * 0x0008 (len) = 0xFFFF.
        let src = SocketAddrV4::new(Ipv4Addr::new(0, 0, 0, 0), 0);
        let dst = SocketAddrV4::new(Ipv4Addr::new(255, 222, 0, 0), 0);

        let packet = make::udp(src, dst, b"").unwrap();
        let udp = packet.as_udp().unwrap();

        assert_eq!(udp.to_header().checksum, 0xFFFF);
        assert!(verify_checksums(&packet));
    }

    #[test]
    fn udp_build_then_parse() {
        let packet = make::udp(key().src, key().dst, &[1, 2, 3, 4]).unwrap();
        let udp = packet.as_udp().unwrap();

        assert_eq!(udp.source_port(), 40000);
        assert_eq!(udp.destination_port(), 443);
        assert_eq!(udp.payload(), &[1, 2, 3, 4]);
        assert!(verify_checksums(&packet));
    }

    #[test]
    fn ipv6_is_recognised() {
        // Version nibble 6, rest irrelevant.
        let buf = hex!("60 00 00 00 00 00 3b 40").to_vec();

        assert!(matches!(IpPacket::parse(buf), Err(ParseError::Ipv6)));
    }

    #[test]
    fn empty_and_garbage_are_rejected() {
        assert!(matches!(IpPacket::parse(vec![]), Err(ParseError::Empty)));
        assert!(matches!(
            IpPacket::parse(vec![0x15, 0x00]),
            Err(ParseError::UnknownVersion(1))
        ));
        assert!(IpPacket::parse(vec![0x45, 0x00, 0x00]).is_err());
    }

    #[test]
    fn flow_key_of_tcp_packet() {
        let packet = make::tcp(
            key().src,
            key().dst,
            1,
            0,
            TcpFlags::default(),
            1024,
            b"x",
        )
        .unwrap();

        assert_eq!(packet.flow_key(), Some(key()));
    }

    #[test]
    fn max_tcp_payload_is_1460() {
        assert_eq!(MAX_TCP_PAYLOAD, 1460);
    }

    #[test]
    fn payload_larger_than_one_segment_is_rejected_by_builder() {
        let payload = vec![0u8; MAX_TCP_PAYLOAD + 1];

        assert!(
            make::tcp(key().src, key().dst, 1, 0, TcpFlags::default(), 1024, &payload).is_err()
        );
    }
}
