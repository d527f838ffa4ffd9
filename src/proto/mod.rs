//! Application protocol rewriters
//!
//! Each rewriter patches addresses, ports or call IDs carried inside the
//! payload of a flow that already has a link. Binary fields are patched in
//! place with a differential checksum update; text fields are re-rendered,
//! which may change the segment length, so the TCP checksum is recomputed
//! and the shift recorded in the link's sequence ring.
//!
//! A rewriter failure only skips that rewrite; address and port translation
//! of the packet goes ahead.

pub mod cuseeme;
pub mod ftp;
pub mod irc;
pub mod nbt;
pub mod pptp;
pub mod rtsp;

use std::net::Ipv4Addr;

use crate::checksum::{adjust_optional_checksum, transport_checksum};
use crate::engine::PacketAlias;
use crate::error::{AliasError, Result};
use crate::link::LinkId;
use crate::packet::{
    get_addr, get_u16, get_u32, put_u16, set_total_len, IP_DST, IP_SRC, PROTO_TCP, TCP_CHECKSUM,
    TCP_MIN_HEADER_LEN, TCP_SEQ, UDP_CHECKSUM, UDP_HEADER_LEN,
};

pub const FTP_CONTROL_PORT: u16 = 21;
pub const IRC_CONTROL_PORTS: [u16; 2] = [6667, 6668];
pub const RTSP_CONTROL_PORTS: [u16; 2] = [554, 7070];
pub const PPTP_CONTROL_PORT: u16 = 1723;
pub const NETBIOS_NS_PORT: u16 = 137;
pub const NETBIOS_DGM_PORT: u16 = 138;
pub const CUSEEME_PORT: u16 = 7648;

/// Application protocols with a payload rewriter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppProtocol {
    Ftp,
    Irc,
    Rtsp,
    Pptp,
    NetbiosDgm,
    NetbiosNs,
    CuSeeMe,
}

impl AppProtocol {
    /// Rewriter for an outbound TCP segment, by its original ports
    pub fn tcp_outbound(src_port: u16, dst_port: u16) -> Option<Self> {
        let either = |p: u16| src_port == p || dst_port == p;
        if either(FTP_CONTROL_PORT) {
            Some(AppProtocol::Ftp)
        } else if IRC_CONTROL_PORTS.contains(&dst_port) {
            Some(AppProtocol::Irc)
        } else if RTSP_CONTROL_PORTS.iter().any(|&p| either(p)) {
            Some(AppProtocol::Rtsp)
        } else if either(PPTP_CONTROL_PORT) {
            Some(AppProtocol::Pptp)
        } else {
            None
        }
    }

    /// Rewriter for an inbound TCP segment, `dst_port` already de-aliased
    pub fn tcp_inbound(src_port: u16, dst_port: u16) -> Option<Self> {
        if src_port == PPTP_CONTROL_PORT || dst_port == PPTP_CONTROL_PORT {
            Some(AppProtocol::Pptp)
        } else {
            None
        }
    }

    /// Rewriter for a UDP datagram in either direction, by its original ports
    pub fn udp(src_port: u16, dst_port: u16) -> Option<Self> {
        let either = |p: u16| src_port == p || dst_port == p;
        if dst_port == CUSEEME_PORT {
            Some(AppProtocol::CuSeeMe)
        } else if either(NETBIOS_DGM_PORT) {
            Some(AppProtocol::NetbiosDgm)
        } else if either(NETBIOS_NS_PORT) {
            Some(AppProtocol::NetbiosNs)
        } else {
            None
        }
    }
}

/// Offsets of a TCP segment inside an IPv4 datagram
#[derive(Debug, Clone, Copy)]
pub(crate) struct TcpSegment {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    /// Start of the TCP header
    pub tcp: usize,
    /// Start of the payload
    pub data: usize,
    /// End of the datagram
    pub end: usize,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
}

impl TcpSegment {
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < 20 {
            return None;
        }
        let ip_hl = (packet[0] & 0x0f) as usize * 4;
        let end = get_u16(packet, 2) as usize;
        let tcp = ip_hl;
        if end > packet.len() || tcp + TCP_MIN_HEADER_LEN > end {
            return None;
        }
        let data = tcp + (packet[tcp + 12] >> 4) as usize * 4;
        if data < tcp + TCP_MIN_HEADER_LEN || data > end {
            return None;
        }
        Some(Self {
            src: get_addr(packet, IP_SRC),
            dst: get_addr(packet, IP_DST),
            tcp,
            data,
            end,
            src_port: get_u16(packet, tcp),
            dst_port: get_u16(packet, tcp + 2),
            seq: get_u32(packet, tcp + TCP_SEQ),
        })
    }

    pub fn payload<'a>(&self, packet: &'a [u8]) -> &'a [u8] {
        &packet[self.data..self.end]
    }

    pub fn payload_len(&self) -> usize {
        self.end - self.data
    }
}

/// Offsets of a UDP datagram inside an IPv4 datagram
#[derive(Debug, Clone, Copy)]
pub(crate) struct UdpDatagram {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub udp: usize,
    pub data: usize,
    /// End of the UDP datagram per its own length field
    pub end: usize,
}

impl UdpDatagram {
    pub fn parse(packet: &[u8]) -> Option<Self> {
        if packet.len() < 20 {
            return None;
        }
        let udp = (packet[0] & 0x0f) as usize * 4;
        let total = (get_u16(packet, 2) as usize).min(packet.len());
        if udp + UDP_HEADER_LEN > total {
            return None;
        }
        let end = udp + get_u16(packet, udp + 4) as usize;
        if end > total || end < udp + UDP_HEADER_LEN {
            return None;
        }
        Some(Self {
            src: get_addr(packet, IP_SRC),
            dst: get_addr(packet, IP_DST),
            udp,
            data: udp + UDP_HEADER_LEN,
            end,
        })
    }

    pub fn checksum_offset(&self) -> usize {
        self.udp + UDP_CHECKSUM
    }

    /// Fold an `old - new` accumulator into the UDP checksum, if present
    pub fn adjust_checksum(&self, packet: &mut [u8], accumulate: i32) {
        let off = self.checksum_offset();
        let sum = adjust_optional_checksum(accumulate, get_u16(packet, off));
        put_u16(packet, off, sum);
    }
}

/// Replace the whole TCP payload with `payload`.
///
/// Updates the IP total length, records the length change in the link's
/// sequence ring and recomputes the TCP checksum. Fails without touching
/// the packet if the result would not fit in `capacity`.
pub(crate) fn replace_tcp_payload(
    alias: &mut PacketAlias,
    packet: &mut [u8],
    capacity: usize,
    seg: &TcpSegment,
    link: LinkId,
    payload: &[u8],
) -> Result<()> {
    let needed = seg.data + payload.len();
    let capacity = capacity.min(packet.len()).min(u16::MAX as usize);
    if needed > capacity {
        return Err(AliasError::PacketTooLarge { needed, capacity });
    }
    let tcp = alias
        .table
        .get_mut(link)
        .and_then(|l| l.tcp_mut())
        .ok_or(AliasError::Rewrite("control link has no TCP state"))?;

    let old_len = seg.payload_len();
    let delta = tcp.delta_seq_out(seg.seq) + payload.len() as i32 - old_len as i32;
    tcp.add_seq(seg.seq, old_len, delta);

    packet[seg.data..needed].copy_from_slice(payload);
    set_total_len(packet, needed as u16);
    put_u16(packet, seg.tcp + TCP_CHECKSUM, 0);
    let sum = transport_checksum(seg.src, seg.dst, PROTO_TCP, &packet[seg.tcp..needed]);
    put_u16(packet, seg.tcp + TCP_CHECKSUM, sum);
    Ok(())
}

/// Byte cursor for the text protocol parsers
pub(crate) struct Scanner<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Scanner<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn at(data: &'a [u8], pos: usize) -> Self {
        Self { data, pos }
    }

    pub fn pos(&self) -> usize {
        self.pos
    }

    pub fn peek(&self) -> Option<u8> {
        self.data.get(self.pos).copied()
    }

    pub fn next(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    /// Consume `literal` or fail
    pub fn expect(&mut self, literal: &[u8]) -> Option<()> {
        if self.data[self.pos.min(self.data.len())..].starts_with(literal) {
            self.pos += literal.len();
            Some(())
        } else {
            None
        }
    }

    /// Consume byte `b` or fail
    pub fn byte(&mut self, b: u8) -> Option<()> {
        (self.next()? == b).then_some(())
    }

    pub fn skip_while(&mut self, pred: impl Fn(u8) -> bool) {
        while self.peek().map_or(false, &pred) {
            self.pos += 1;
        }
    }

    pub fn skip_spaces(&mut self) {
        self.skip_while(|b| b == b' ' || b == b'\t');
    }

    /// Unsigned decimal number, at least one digit, at most `max`
    pub fn number(&mut self, max: u64) -> Option<u64> {
        let start = self.pos;
        let mut value: u64 = 0;
        while let Some(b) = self.peek().filter(u8::is_ascii_digit) {
            value = value.checked_mul(10)?.checked_add((b - b'0') as u64)?;
            if value > max {
                return None;
            }
            self.pos += 1;
        }
        (self.pos > start).then_some(value)
    }
}

/// Position of the first occurrence of `needle` in `haystack`
pub(crate) fn find_bytes(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Last line of `payload` ended with CRLF
pub(crate) fn ends_with_crlf(payload: &[u8]) -> bool {
    payload.ends_with(b"\r\n")
}
