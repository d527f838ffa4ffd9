//! Link records
//!
//! A link is one tracked translation. The same record is indexed from the
//! outbound side by `(src_addr, dst_addr, src_port, dst_port, type)` and from
//! the inbound side by `(alias_addr, alias_port, type)`.

use std::net::Ipv4Addr;

use bitflags::bitflags;

use crate::packet::{PROTO_ICMP, PROTO_TCP, PROTO_UDP};
use crate::socket::ReservedSocket;

slotmap::new_key_type! {
    /// Stable handle to a link; stale handles never alias a newer link
    pub struct LinkId;
}

/// Link type tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LinkType {
    Icmp,
    Udp,
    Tcp,
    /// Any other IP protocol, aliased by address only
    Proto(u8),
    /// Header fragment seen, remembers the original destination
    FragmentId,
    /// Fragment that arrived before its header fragment
    FragmentPtr,
    /// Static one-to-one address mapping
    StaticAddress,
    /// PPTP call, ports hold call IDs
    Pptp,
}

impl LinkType {
    /// Numeric tag mixed into the bucket hashes
    pub fn code(&self) -> u32 {
        match self {
            LinkType::Icmp => PROTO_ICMP as u32,
            LinkType::Udp => PROTO_UDP as u32,
            LinkType::Tcp => PROTO_TCP as u32,
            LinkType::Proto(p) => *p as u32,
            LinkType::FragmentId => 257,
            LinkType::FragmentPtr => 258,
            LinkType::StaticAddress => 259,
            LinkType::Pptp => 260,
        }
    }

    /// Link type for a TCP/UDP transport protocol
    pub fn transport(proto: u8) -> Option<Self> {
        match proto {
            PROTO_TCP => Some(LinkType::Tcp),
            PROTO_UDP => Some(LinkType::Udp),
            _ => None,
        }
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct LinkFlags: u8 {
        const UNKNOWN_DEST_PORT = 0x01;
        const UNKNOWN_DEST_ADDR = 0x02;
        const PERMANENT = 0x04;
        const PARTIALLY_SPECIFIED = Self::UNKNOWN_DEST_PORT.bits() | Self::UNKNOWN_DEST_ADDR.bits();
    }
}

/// One direction of the TCP connection tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TcpState {
    #[default]
    NotConnected,
    Connected,
    Disconnected,
}

impl TcpState {
    /// Next state after a segment with the given flags
    pub fn next(self, syn: bool, fin: bool, rst: bool) -> TcpState {
        match self {
            TcpState::NotConnected if rst => TcpState::Disconnected,
            TcpState::NotConnected if syn => TcpState::Connected,
            TcpState::Connected if fin || rst => TcpState::Disconnected,
            state => state,
        }
    }
}

pub const ACK_RING_SIZE: usize = 3;

/// Sequence shift introduced by a length-changing payload rewrite
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AckDelta {
    /// Sequence number following the rewritten segment, sender's numbering
    pub old_seq: u32,
    /// The same position in the rewritten stream
    pub new_seq: u32,
    /// Cumulative shift from this point on
    pub delta: i32,
    pub active: bool,
}

/// TCP specific link state
#[derive(Debug, Clone, Default)]
pub struct TcpData {
    pub state_in: TcpState,
    pub state_out: TcpState,
    ring: [AckDelta; ACK_RING_SIZE],
    index: usize,
    ack_modified: bool,
    /// Previous control stream packet ended with CRLF
    pub last_line_crlf_terminated: bool,
}

impl TcpData {
    pub fn new() -> Self {
        Self {
            last_line_crlf_terminated: true,
            ..Default::default()
        }
    }

    pub fn ack_modified(&self) -> bool {
        self.ack_modified
    }

    /// Record that the segment at `seq` carrying `payload_len` bytes was
    /// rewritten so the stream from its end on is shifted by `delta`.
    pub fn add_seq(&mut self, seq: u32, payload_len: usize, delta: i32) {
        let old_seq = seq.wrapping_add(payload_len as u32);
        self.ring[self.index] = AckDelta {
            old_seq,
            new_seq: old_seq.wrapping_add(delta as u32),
            delta,
            active: true,
        };
        self.index = (self.index + 1) % ACK_RING_SIZE;
        self.ack_modified = true;
    }

    /// Shift to apply to an outbound sequence number
    pub fn delta_seq_out(&self, seq: u32) -> i32 {
        closest_delta(&self.ring, seq, |x| x.old_seq)
    }

    /// Shift to remove from an inbound acknowledgment number
    pub fn delta_ack_in(&self, ack: u32) -> i32 {
        closest_delta(&self.ring, ack, |x| x.new_seq)
    }

    pub fn records(&self) -> &[AckDelta] {
        &self.ring
    }
}

/// Delta of the active record closest below `value` in sequence space
fn closest_delta(ring: &[AckDelta], value: u32, anchor: impl Fn(&AckDelta) -> u32) -> i32 {
    let mut delta = 0;
    let mut best: Option<i32> = None;
    for record in ring.iter().filter(|r| r.active) {
        let diff = value.wrapping_sub(anchor(record)) as i32;
        if diff >= 0 && best.map_or(true, |b| diff < b) {
            delta = record.delta;
            best = Some(diff);
        }
    }
    delta
}

/// Link type specific state
#[derive(Debug, Default)]
pub enum LinkData {
    #[default]
    None,
    Tcp(TcpData),
    /// Saved copy of an early fragment
    FragmentPtr(Option<Vec<u8>>),
    /// Original destination recorded from the header fragment
    FragmentAddr(Ipv4Addr),
}

/// One NAT translation entry
#[derive(Debug)]
pub struct Link {
    pub(crate) src_addr: Ipv4Addr,
    pub(crate) dst_addr: Ipv4Addr,
    pub(crate) alias_addr: Ipv4Addr,
    pub(crate) src_port: u16,
    pub(crate) dst_port: u16,
    pub(crate) alias_port: u16,
    pub(crate) link_type: LinkType,
    pub(crate) flags: LinkFlags,
    pub(crate) timestamp: u64,
    pub(crate) expire_time: u64,
    pub(crate) socket: Option<ReservedSocket>,
    pub(crate) data: LinkData,
}

impl Link {
    pub fn src_addr(&self) -> Ipv4Addr {
        self.src_addr
    }

    pub fn dst_addr(&self) -> Ipv4Addr {
        self.dst_addr
    }

    /// Alias address as stored; `0.0.0.0` stands for the default alias address
    pub fn alias_addr(&self) -> Ipv4Addr {
        self.alias_addr
    }

    pub fn src_port(&self) -> u16 {
        self.src_port
    }

    pub fn dst_port(&self) -> u16 {
        self.dst_port
    }

    pub fn alias_port(&self) -> u16 {
        self.alias_port
    }

    pub fn link_type(&self) -> LinkType {
        self.link_type
    }

    pub fn flags(&self) -> LinkFlags {
        self.flags
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn expire_time(&self) -> u64 {
        self.expire_time
    }

    pub fn is_permanent(&self) -> bool {
        self.flags.contains(LinkFlags::PERMANENT)
    }

    pub fn is_partially_specified(&self) -> bool {
        self.flags.intersects(LinkFlags::PARTIALLY_SPECIFIED)
    }

    pub fn has_socket(&self) -> bool {
        self.socket.is_some()
    }

    pub fn tcp(&self) -> Option<&TcpData> {
        match &self.data {
            LinkData::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    pub fn tcp_mut(&mut self) -> Option<&mut TcpData> {
        match &mut self.data {
            LinkData::Tcp(tcp) => Some(tcp),
            _ => None,
        }
    }

    /// Seconds since the last matching packet
    pub fn idle(&self, now: u64) -> u64 {
        now.saturating_sub(self.timestamp)
    }

    pub fn is_expired(&self, now: u64) -> bool {
        self.idle(now) > self.expire_time
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tcp_state_transitions() {
        let s = TcpState::NotConnected;
        assert_eq!(s.next(true, false, false), TcpState::Connected);
        assert_eq!(s.next(false, false, true), TcpState::Disconnected);
        assert_eq!(s.next(false, true, false), TcpState::NotConnected);

        let c = TcpState::Connected;
        assert_eq!(c.next(false, true, false), TcpState::Disconnected);
        assert_eq!(c.next(false, false, true), TcpState::Disconnected);
        assert_eq!(c.next(true, false, false), TcpState::Connected);

        let d = TcpState::Disconnected;
        assert_eq!(d.next(true, false, false), TcpState::Disconnected);
    }

    #[test]
    fn test_ack_ring_picks_latest_applicable_delta() {
        let mut tcp = TcpData::new();
        assert!(!tcp.ack_modified());
        assert_eq!(tcp.delta_seq_out(1000), 0);

        // Segment 1000..1020 grew by 3 bytes
        tcp.add_seq(1000, 20, 3);
        assert!(tcp.ack_modified());
        assert_eq!(tcp.delta_seq_out(1000), 0);
        assert_eq!(tcp.delta_seq_out(1020), 3);
        assert_eq!(tcp.delta_ack_in(1023), 3);
        assert_eq!(tcp.delta_ack_in(1020), 0);

        // Segment 1020..1040 grew by 2 more
        tcp.add_seq(1020, 20, 5);
        assert_eq!(tcp.delta_seq_out(1030), 3);
        assert_eq!(tcp.delta_seq_out(1040), 5);
        assert_eq!(tcp.delta_ack_in(1045), 5);
    }

    #[test]
    fn test_ack_ring_wraps_around_sequence_space() {
        let mut tcp = TcpData::new();
        tcp.add_seq(u32::MAX - 5, 10, -2);
        assert_eq!(tcp.delta_seq_out(4), -2);
        assert_eq!(tcp.delta_ack_in(2), -2);
    }

    #[test]
    fn test_ack_ring_keeps_three_records() {
        let mut tcp = TcpData::new();
        for i in 0..4u32 {
            tcp.add_seq(i * 100, 10, i as i32 + 1);
        }
        assert_eq!(tcp.records().iter().filter(|r| r.active).count(), ACK_RING_SIZE);
        // The first record (old_seq 10) was overwritten
        assert_eq!(tcp.delta_seq_out(50), 0);
    }

    #[test]
    fn test_partial_flags() {
        let flags = LinkFlags::UNKNOWN_DEST_PORT;
        assert!(flags.intersects(LinkFlags::PARTIALLY_SPECIFIED));
        assert!(!LinkFlags::PERMANENT.intersects(LinkFlags::PARTIALLY_SPECIFIED));
    }
}
