//! Packet Parsing Module
//!
//! This module provides IPv4 header parsing and TCP/UDP header views over a
//! raw datagram buffer, plus the small field accessors the translation code
//! uses to rewrite headers in place.

use std::net::Ipv4Addr;

use crate::checksum::{adjust_checksum, differential_checksum, differential_checksum_addr, word_sum32};
use crate::error::AliasError;

/// Minimum IPv4 header length
pub const IPV4_MIN_HEADER_LEN: usize = 20;
/// TCP header minimum length
pub const TCP_MIN_HEADER_LEN: usize = 20;
/// UDP header length
pub const UDP_HEADER_LEN: usize = 8;
/// ICMP header length (type, code, checksum, id, sequence)
pub const ICMP_HEADER_LEN: usize = 8;

/// Protocol numbers
pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_GRE: u8 = 47;

/// IPv4 header field offsets
pub const IP_TOTAL_LEN: usize = 2;
pub const IP_CHECKSUM: usize = 10;
pub const IP_SRC: usize = 12;
pub const IP_DST: usize = 16;

/// TCP header field offsets, relative to the TCP header
pub const TCP_SEQ: usize = 4;
pub const TCP_ACK: usize = 8;
pub const TCP_CHECKSUM: usize = 16;

/// UDP checksum offset, relative to the UDP header
pub const UDP_CHECKSUM: usize = 6;

const IP_MF: u16 = 0x2000;
const IP_OFFMASK: u16 = 0x1fff;

/// Transport protocol type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Tcp,
    Udp,
    Icmp,
    Other(u8),
}

impl TransportProtocol {
    /// Create from protocol number
    pub fn from_proto(proto: u8) -> Self {
        match proto {
            PROTO_TCP => TransportProtocol::Tcp,
            PROTO_UDP => TransportProtocol::Udp,
            PROTO_ICMP => TransportProtocol::Icmp,
            other => TransportProtocol::Other(other),
        }
    }

    /// Get protocol number
    pub fn to_proto(&self) -> u8 {
        match self {
            TransportProtocol::Tcp => PROTO_TCP,
            TransportProtocol::Udp => PROTO_UDP,
            TransportProtocol::Icmp => PROTO_ICMP,
            TransportProtocol::Other(p) => *p,
        }
    }
}

#[inline]
pub fn get_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

#[inline]
pub fn put_u16(data: &mut [u8], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn get_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([data[offset], data[offset + 1], data[offset + 2], data[offset + 3]])
}

#[inline]
pub fn put_u32(data: &mut [u8], offset: usize, value: u32) {
    data[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

#[inline]
pub fn get_addr(data: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[offset], data[offset + 1], data[offset + 2], data[offset + 3])
}

#[inline]
pub fn put_addr(data: &mut [u8], offset: usize, addr: Ipv4Addr) {
    data[offset..offset + 4].copy_from_slice(&addr.octets());
}

/// Parsed IPv4 header information
#[derive(Debug, Clone)]
pub struct IpPacketInfo {
    /// Source IP address
    pub src_ip: Ipv4Addr,
    /// Destination IP address
    pub dst_ip: Ipv4Addr,
    /// IP protocol number
    pub protocol: u8,
    /// Total datagram length from the header
    pub total_len: usize,
    /// IP header length
    pub header_len: usize,
    /// Identification field
    pub id: u16,
    /// Fragment offset in 8-byte units
    pub fragment_offset: u16,
    /// More-fragments flag
    pub more_fragments: bool,
}

impl IpPacketInfo {
    /// Parse and sanity check an IPv4 header
    pub fn parse(data: &[u8]) -> Result<Self, AliasError> {
        if data.len() < IPV4_MIN_HEADER_LEN {
            return Err(AliasError::InvalidPacket("IPv4 packet too short".into()));
        }

        let version = data[0] >> 4;
        if version != 4 {
            return Err(AliasError::InvalidPacket(format!(
                "Unknown IP version: {}",
                version
            )));
        }

        let ihl = (data[0] & 0x0F) as usize * 4;
        if ihl < IPV4_MIN_HEADER_LEN || data.len() < ihl {
            return Err(AliasError::InvalidPacket("Invalid IPv4 IHL".into()));
        }

        let total_len = get_u16(data, IP_TOTAL_LEN) as usize;
        if total_len < ihl || total_len > data.len() {
            return Err(AliasError::InvalidPacket(format!(
                "Invalid IPv4 total length {} (header {}, buffer {})",
                total_len,
                ihl,
                data.len()
            )));
        }

        let frag = get_u16(data, 6);

        Ok(Self {
            src_ip: get_addr(data, IP_SRC),
            dst_ip: get_addr(data, IP_DST),
            protocol: data[9],
            total_len,
            header_len: ihl,
            id: get_u16(data, 4),
            fragment_offset: frag & IP_OFFMASK,
            more_fragments: frag & IP_MF != 0,
        })
    }

    /// Transport layer bytes of the datagram
    pub fn get_payload<'a>(&self, data: &'a [u8]) -> &'a [u8] {
        &data[self.header_len..self.total_len]
    }

    /// Transport layer payload length
    pub fn payload_len(&self) -> usize {
        self.total_len - self.header_len
    }
}

/// Parsed TCP header information
#[derive(Debug, Clone)]
pub struct TcpPacketInfo {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Sequence number
    pub seq_num: u32,
    /// Acknowledgment number
    pub ack_num: u32,
    /// Data offset in bytes
    pub data_offset: usize,
    /// TCP flags
    pub flags: TcpFlags,
}

/// TCP flags
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFlags {
    pub fin: bool,
    pub syn: bool,
    pub rst: bool,
    pub psh: bool,
    pub ack: bool,
    pub urg: bool,
}

impl TcpFlags {
    /// Parse TCP flags from the flags byte
    pub fn from_byte(flags: u8) -> Self {
        Self {
            fin: flags & 0x01 != 0,
            syn: flags & 0x02 != 0,
            rst: flags & 0x04 != 0,
            psh: flags & 0x08 != 0,
            ack: flags & 0x10 != 0,
            urg: flags & 0x20 != 0,
        }
    }
}

impl TcpPacketInfo {
    /// Parse TCP header from transport layer data
    pub fn parse(data: &[u8]) -> Result<Self, AliasError> {
        if data.len() < TCP_MIN_HEADER_LEN {
            return Err(AliasError::InvalidPacket("TCP header too short".into()));
        }

        let data_offset = ((data[12] >> 4) as usize) * 4;
        if data_offset < TCP_MIN_HEADER_LEN || data.len() < data_offset {
            return Err(AliasError::InvalidPacket("Invalid TCP data offset".into()));
        }

        Ok(Self {
            src_port: get_u16(data, 0),
            dst_port: get_u16(data, 2),
            seq_num: get_u32(data, TCP_SEQ),
            ack_num: get_u32(data, TCP_ACK),
            data_offset,
            flags: TcpFlags::from_byte(data[13]),
        })
    }

    /// Payload length given the transport segment length
    pub fn payload_len(&self, segment_len: usize) -> usize {
        segment_len.saturating_sub(self.data_offset)
    }
}

/// Parsed UDP header information
#[derive(Debug, Clone)]
pub struct UdpPacketInfo {
    /// Source port
    pub src_port: u16,
    /// Destination port
    pub dst_port: u16,
    /// Total length (header + payload)
    pub length: u16,
    /// Checksum
    pub checksum: u16,
}

impl UdpPacketInfo {
    /// Parse UDP header from transport layer data
    pub fn parse(data: &[u8]) -> Result<Self, AliasError> {
        if data.len() < UDP_HEADER_LEN {
            return Err(AliasError::InvalidPacket("UDP header too short".into()));
        }

        let length = get_u16(data, 4);
        if (length as usize) < UDP_HEADER_LEN || length as usize > data.len() {
            return Err(AliasError::InvalidPacket("Invalid UDP length".into()));
        }

        Ok(Self {
            src_port: get_u16(data, 0),
            dst_port: get_u16(data, 2),
            length,
            checksum: get_u16(data, UDP_CHECKSUM),
        })
    }

    /// Get payload length
    pub fn payload_len(&self) -> usize {
        self.length as usize - UDP_HEADER_LEN
    }
}

/// Replace the source address, keeping the IP header checksum valid
pub fn rewrite_src_addr(packet: &mut [u8], addr: Ipv4Addr) {
    let old = get_addr(packet, IP_SRC);
    let sum = differential_checksum_addr(get_u16(packet, IP_CHECKSUM), addr, old);
    put_u16(packet, IP_CHECKSUM, sum);
    put_addr(packet, IP_SRC, addr);
}

/// Replace the destination address, keeping the IP header checksum valid
pub fn rewrite_dst_addr(packet: &mut [u8], addr: Ipv4Addr) {
    let old = get_addr(packet, IP_DST);
    let sum = differential_checksum_addr(get_u16(packet, IP_CHECKSUM), addr, old);
    put_u16(packet, IP_CHECKSUM, sum);
    put_addr(packet, IP_DST, addr);
}

/// Replace the total length field, keeping the IP header checksum valid
pub fn set_total_len(packet: &mut [u8], len: u16) {
    let old = get_u16(packet, IP_TOTAL_LEN);
    let sum = differential_checksum(get_u16(packet, IP_CHECKSUM), &[len], &[old]);
    put_u16(packet, IP_CHECKSUM, sum);
    put_u16(packet, IP_TOTAL_LEN, len);
}

/// Accumulator contribution of a 32-bit field changing from `old` to `new`
#[inline]
pub fn accumulate_u32(old: u32, new: u32) -> i32 {
    word_sum32(old) - word_sum32(new)
}

/// Rewrite a 16-bit field that is covered by the checksum at `sum_offset`
pub fn rewrite_u16_covered(packet: &mut [u8], offset: usize, value: u16, sum_offset: usize) {
    let old = get_u16(packet, offset);
    let sum = adjust_checksum(old as i32 - value as i32, get_u16(packet, sum_offset));
    put_u16(packet, sum_offset, sum);
    put_u16(packet, offset, value);
}
