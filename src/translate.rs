//! Packet translation
//!
//! Outbound packets have their source address and port (or ICMP id)
//! replaced with the alias, inbound packets have their destination restored
//! to the internal host. Every rewrite keeps the IP header checksum and the
//! transport checksum valid with differential updates.

use std::net::Ipv4Addr;

use crate::checksum::{addr_words, adjust_checksum, adjust_optional_checksum, differential_checksum_addr};
use crate::config::Mode;
use crate::engine::{PacketAlias, Status};
use crate::error::Result;
use crate::link::{LinkData, LinkId, LinkType};
use crate::packet::{
    accumulate_u32, get_addr, get_u16, put_addr, put_u16, put_u32, rewrite_dst_addr,
    rewrite_src_addr, rewrite_u16_covered, IpPacketInfo, TcpPacketInfo, UdpPacketInfo,
    ICMP_HEADER_LEN, IPV4_MIN_HEADER_LEN, IP_CHECKSUM, IP_DST, IP_SRC, PROTO_GRE, PROTO_ICMP,
    PROTO_TCP, PROTO_UDP, TCP_ACK, TCP_CHECKSUM, TCP_SEQ, UDP_CHECKSUM,
};
use crate::proto::{cuseeme, ftp, irc, nbt, pptp, rtsp, AppProtocol};

const ICMP_ECHOREPLY: u8 = 0;
const ICMP_UNREACH: u8 = 3;
const ICMP_SOURCEQUENCH: u8 = 4;
const ICMP_ECHO: u8 = 8;
const ICMP_TIMXCEED: u8 = 11;
const ICMP_PARAMPROB: u8 = 12;
const ICMP_TSTAMP: u8 = 13;
const ICMP_TSTAMPREPLY: u8 = 14;

const ICMP_CHECKSUM: usize = 2;
const ICMP_ID: usize = 4;

/// Bytes of the quoted transport header an ICMP error must carry
const QUOTED_TRANSPORT_LEN: usize = 8;

/// Datagram quoted in the payload of an ICMP error message
#[derive(Debug, Clone, Copy)]
struct Quoted {
    /// Start of the quoted IP header
    ip: usize,
    /// Start of the quoted transport header
    transport: usize,
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
}

impl Quoted {
    fn parse(packet: &[u8], icmp: usize, end: usize) -> Option<Self> {
        let ip = icmp + ICMP_HEADER_LEN;
        if ip + IPV4_MIN_HEADER_LEN > end {
            return None;
        }
        let hl = (packet[ip] & 0x0f) as usize * 4;
        let transport = ip + hl;
        if hl < IPV4_MIN_HEADER_LEN || transport + QUOTED_TRANSPORT_LEN > end {
            return None;
        }
        Some(Self {
            ip,
            transport,
            src: get_addr(packet, ip + IP_SRC),
            dst: get_addr(packet, ip + IP_DST),
            protocol: packet[ip + 9],
        })
    }

    /// Whether the quoted datagram is an echo or timestamp request
    fn is_icmp_query(&self, packet: &[u8]) -> bool {
        self.protocol == PROTO_ICMP && matches!(packet[self.transport], ICMP_ECHO | ICMP_TSTAMP)
    }

    /// Replace one address and one 16-bit field of the quoted datagram,
    /// keeping its header checksum and the ICMP checksum valid
    fn rewrite(
        &self,
        packet: &mut [u8],
        icmp: usize,
        addr_at: usize,
        addr: Ipv4Addr,
        field_at: usize,
        value: u16,
    ) {
        let old_addr = get_addr(packet, addr_at);
        let old_value = get_u16(packet, field_at);
        let old_sum = get_u16(packet, self.ip + IP_CHECKSUM);
        let new_sum = differential_checksum_addr(old_sum, addr, old_addr);

        let acc = addr_words(old_addr) - addr_words(addr) + old_value as i32 - value as i32
            + old_sum as i32
            - new_sum as i32;
        put_addr(packet, addr_at, addr);
        put_u16(packet, field_at, value);
        put_u16(packet, self.ip + IP_CHECKSUM, new_sum);
        let sum = adjust_checksum(acc, get_u16(packet, icmp + ICMP_CHECKSUM));
        put_u16(packet, icmp + ICMP_CHECKSUM, sum);
    }
}

/// Map a lookup result onto the link or the status to return
fn resolve(found: Result<Option<LinkId>>) -> std::result::Result<LinkId, Status> {
    match found {
        Ok(Some(id)) => Ok(id),
        Ok(None) => Err(Status::Ignored),
        Err(e) => {
            log::debug!("no link: {}", e);
            Err(Status::Error)
        }
    }
}

macro_rules! link_or_return {
    ($found:expr) => {
        match resolve($found) {
            Ok(id) => id,
            Err(status) => return status,
        }
    };
}

impl PacketAlias {
    /// Alias an outbound datagram in place.
    ///
    /// The datagram occupies the first `total_length` bytes of `packet`; a
    /// payload rewrite may grow it up to `min(max_packet_size, packet.len())`.
    pub fn translate_outbound(&mut self, packet: &mut [u8], max_packet_size: usize) -> Status {
        self.translate_outbound_try(packet, max_packet_size, true)
    }

    /// Outbound translation that only uses existing links when `create` is
    /// false. No protocol rewriter runs in that case.
    pub fn translate_outbound_try(
        &mut self,
        packet: &mut [u8],
        max_packet_size: usize,
        create: bool,
    ) -> Status {
        self.begin_transaction();
        let capacity = max_packet_size.min(packet.len());
        let packet = &mut packet[..capacity];
        let ip = match IpPacketInfo::parse(packet) {
            Ok(ip) => ip,
            Err(e) => {
                log::trace!("outbound ignored: {}", e);
                return Status::Ignored;
            }
        };

        let saved_alias = self.alias_address;
        if self.mode.contains(Mode::UNREGISTERED_ONLY) && !ip.src_ip.is_private() {
            self.alias_address = ip.src_ip;
        }

        let status = if ip.fragment_offset != 0 {
            self.fragment_out(packet, &ip)
        } else {
            match ip.protocol {
                PROTO_ICMP => self.icmp_out(packet, &ip, create),
                PROTO_UDP => self.udp_out(packet, &ip, create),
                PROTO_TCP => self.tcp_out(packet, &ip, create),
                PROTO_GRE if pptp::gre_out(self, packet) => Status::Ok,
                protocol => self.proto_out(packet, &ip, protocol, create),
            }
        };

        self.alias_address = saved_alias;
        log::trace!(
            "outbound {} -> {} proto {}: {:?}",
            ip.src_ip,
            ip.dst_ip,
            ip.protocol,
            status
        );
        status
    }

    /// De-alias an inbound datagram in place
    pub fn translate_inbound(&mut self, packet: &mut [u8], max_packet_size: usize) -> Status {
        self.begin_transaction();
        let capacity = max_packet_size.min(packet.len());
        let packet = &mut packet[..capacity];
        let ip = match IpPacketInfo::parse(packet) {
            Ok(ip) => ip,
            Err(e) => {
                log::trace!("inbound ignored: {}", e);
                return Status::Ignored;
            }
        };

        if ip.fragment_offset != 0 {
            return self.fragment_in_tail(packet, &ip);
        }

        let mut status = match ip.protocol {
            PROTO_ICMP => self.icmp_in(packet, &ip),
            PROTO_UDP => self.udp_in(packet, &ip),
            PROTO_TCP => self.tcp_in(packet, &ip),
            PROTO_GRE if self.mode.contains(Mode::PROXY_ONLY) => Status::Ok,
            PROTO_GRE if pptp::gre_in(self, packet) => Status::Ok,
            protocol => self.proto_in(packet, &ip, protocol),
        };

        if ip.more_fragments {
            status = match self.find_fragment_in1(ip.src_ip, ip.dst_ip, ip.id) {
                Ok(id) => {
                    let original = get_addr(packet, IP_DST);
                    if let Some(link) = self.table.get_mut(id) {
                        link.data = LinkData::FragmentAddr(original);
                    }
                    Status::FoundHeaderFragment
                }
                Err(e) => {
                    log::warn!("cannot record header fragment {} from {}: {}", ip.id, ip.src_ip, e);
                    Status::Error
                }
            };
        }

        log::trace!(
            "inbound {} -> {} proto {}: {:?}",
            ip.src_ip,
            ip.dst_ip,
            ip.protocol,
            status
        );
        status
    }

    fn begin_transaction(&mut self) {
        let now = self.clock.now_secs();
        self.housekeeping_at(now);
        self.new_default_link = false;
    }

    fn fragment_out(&mut self, packet: &mut [u8], ip: &IpPacketInfo) -> Status {
        let alias_addr = self.find_alias_address(ip.src_ip);
        rewrite_src_addr(packet, alias_addr);
        Status::Ok
    }

    fn fragment_in_tail(&mut self, packet: &mut [u8], ip: &IpPacketInfo) -> Status {
        let found = self
            .find_fragment_in2(ip.src_ip, ip.dst_ip, ip.id)
            .ok()
            .flatten()
            .and_then(|id| match self.table.get(id).map(|l| &l.data) {
                Some(LinkData::FragmentAddr(addr)) => Some(*addr),
                _ => None,
            });
        match found {
            Some(original) => {
                rewrite_dst_addr(packet, original);
                Status::Ok
            }
            None => Status::UnresolvedFragment,
        }
    }

    // ICMP

    fn icmp_out(&mut self, packet: &mut [u8], ip: &IpPacketInfo, create: bool) -> Status {
        let icmp = ip.header_len;
        if icmp + ICMP_HEADER_LEN > ip.total_len {
            return Status::Ignored;
        }
        match (packet[icmp], packet[icmp + 1]) {
            (ICMP_ECHO | ICMP_TSTAMP, 0) => self.icmp_query_out(packet, ip, create),
            (ICMP_ECHOREPLY | ICMP_TSTAMPREPLY, _) => self.icmp_query_out(packet, ip, false),
            (ICMP_UNREACH | ICMP_SOURCEQUENCH | ICMP_TIMXCEED | ICMP_PARAMPROB, _) => {
                self.icmp_error_out(packet, ip)
            }
            _ => Status::Ignored,
        }
    }

    fn icmp_query_out(&mut self, packet: &mut [u8], ip: &IpPacketInfo, create: bool) -> Status {
        let icmp = ip.header_len;
        let id = get_u16(packet, icmp + ICMP_ID);
        let link = link_or_return!(self.find_icmp_out(ip.src_ip, ip.dst_ip, id, create));
        let Some(alias_id) = self.table.get(link).map(|l| l.alias_port) else {
            return Status::Ignored;
        };
        let alias_addr = self.alias_address_of(link);
        rewrite_u16_covered(packet, icmp + ICMP_ID, alias_id, icmp + ICMP_CHECKSUM);
        rewrite_src_addr(packet, alias_addr);
        Status::Ok
    }

    /// Error about a datagram the internal host received: the quoted
    /// datagram is inbound traffic that must get its alias back
    fn icmp_error_out(&mut self, packet: &mut [u8], ip: &IpPacketInfo) -> Status {
        let icmp = ip.header_len;
        let Some(quoted) = Quoted::parse(packet, icmp, ip.total_len) else {
            return Status::Ignored;
        };
        let t = quoted.transport;
        let (found, field_at) = match quoted.protocol {
            PROTO_UDP | PROTO_TCP => {
                let link_type = if quoted.protocol == PROTO_UDP {
                    LinkType::Udp
                } else {
                    LinkType::Tcp
                };
                let found = self.find_udp_tcp_out(
                    quoted.dst,
                    quoted.src,
                    get_u16(packet, t + 2),
                    get_u16(packet, t),
                    link_type,
                    false,
                );
                (found, t + 2)
            }
            _ if quoted.is_icmp_query(packet) => {
                let id = get_u16(packet, t + ICMP_ID);
                (self.find_icmp_out(quoted.dst, quoted.src, id, false), t + ICMP_ID)
            }
            _ => return Status::Ignored,
        };
        let link = link_or_return!(found);
        let Some(alias_port) = self.table.get(link).map(|l| l.alias_port) else {
            return Status::Ignored;
        };
        let alias_addr = self.alias_address_of(link);

        if ip.src_ip == quoted.dst {
            rewrite_src_addr(packet, alias_addr);
        }
        quoted.rewrite(packet, icmp, quoted.ip + IP_DST, alias_addr, field_at, alias_port);
        Status::Ok
    }

    fn icmp_in(&mut self, packet: &mut [u8], ip: &IpPacketInfo) -> Status {
        let icmp = ip.header_len;
        if icmp + ICMP_HEADER_LEN > ip.total_len {
            return Status::Ignored;
        }
        match (packet[icmp], packet[icmp + 1]) {
            (ICMP_ECHOREPLY | ICMP_TSTAMPREPLY, 0) | (ICMP_ECHO | ICMP_TSTAMP, _) => {
                self.icmp_query_in(packet, ip)
            }
            (ICMP_UNREACH | ICMP_SOURCEQUENCH | ICMP_TIMXCEED | ICMP_PARAMPROB, _) => {
                self.icmp_error_in(packet, ip)
            }
            _ => Status::Ignored,
        }
    }

    fn icmp_query_in(&mut self, packet: &mut [u8], ip: &IpPacketInfo) -> Status {
        let icmp = ip.header_len;
        let alias_id = get_u16(packet, icmp + ICMP_ID);
        let create = !self.mode.contains(Mode::PROXY_ONLY);
        let link = link_or_return!(self.find_icmp_in(ip.src_ip, ip.dst_ip, alias_id, create));
        let Some(original_id) = self.table.get(link).map(|l| l.src_port) else {
            return Status::Ignored;
        };
        let original = self.original_address_of(link);
        rewrite_u16_covered(packet, icmp + ICMP_ID, original_id, icmp + ICMP_CHECKSUM);
        rewrite_dst_addr(packet, original);
        Status::Ok
    }

    /// Error about a datagram we sent: the quoted datagram carries the
    /// alias and is restored to the internal host
    fn icmp_error_in(&mut self, packet: &mut [u8], ip: &IpPacketInfo) -> Status {
        let icmp = ip.header_len;
        let Some(quoted) = Quoted::parse(packet, icmp, ip.total_len) else {
            return Status::Ignored;
        };
        let t = quoted.transport;
        let (found, field_at) = match quoted.protocol {
            PROTO_UDP | PROTO_TCP => {
                let link_type = if quoted.protocol == PROTO_UDP {
                    LinkType::Udp
                } else {
                    LinkType::Tcp
                };
                let found = self.find_udp_tcp_in(
                    quoted.dst,
                    quoted.src,
                    get_u16(packet, t + 2),
                    get_u16(packet, t),
                    link_type,
                    false,
                );
                (found, t)
            }
            _ if quoted.is_icmp_query(packet) => {
                let id = get_u16(packet, t + ICMP_ID);
                (self.find_icmp_in(quoted.dst, quoted.src, id, false), t + ICMP_ID)
            }
            _ => return Status::Ignored,
        };
        let link = link_or_return!(found);
        let Some(original_port) = self.table.get(link).map(|l| l.src_port) else {
            return Status::Ignored;
        };
        let original = self.original_address_of(link);

        rewrite_dst_addr(packet, original);
        quoted.rewrite(packet, icmp, quoted.ip + IP_SRC, original, field_at, original_port);
        Status::Ok
    }

    // UDP

    fn udp_out(&mut self, packet: &mut [u8], ip: &IpPacketInfo, create: bool) -> Status {
        let Ok(udp) = UdpPacketInfo::parse(ip.get_payload(packet)) else {
            return Status::Ignored;
        };
        let link = link_or_return!(self.find_udp_tcp_out(
            ip.src_ip,
            ip.dst_ip,
            udp.src_port,
            udp.dst_port,
            LinkType::Udp,
            create
        ));
        let Some(alias_port) = self.table.get(link).map(|l| l.alias_port) else {
            return Status::Ignored;
        };
        let alias_addr = self.alias_address_of(link);

        if create {
            let rewritten = match AppProtocol::udp(udp.src_port, udp.dst_port) {
                Some(AppProtocol::CuSeeMe) => cuseeme::alias_out(self, packet, link),
                Some(AppProtocol::NetbiosDgm) => {
                    nbt::handle_datagram(packet, None, alias_addr, alias_port)
                }
                Some(AppProtocol::NetbiosNs) => {
                    nbt::handle_name_service(packet, ip.src_ip, alias_addr)
                }
                _ => Ok(()),
            };
            if let Err(e) = rewritten {
                log::debug!("udp {}:{} rewrite skipped: {}", ip.src_ip, udp.src_port, e);
            }
        }

        let h = ip.header_len;
        let acc = udp.src_port as i32 - alias_port as i32 + addr_words(ip.src_ip)
            - addr_words(alias_addr);
        let sum = adjust_optional_checksum(acc, get_u16(packet, h + UDP_CHECKSUM));
        put_u16(packet, h + UDP_CHECKSUM, sum);
        put_u16(packet, h, alias_port);
        rewrite_src_addr(packet, alias_addr);
        Status::Ok
    }

    fn udp_in(&mut self, packet: &mut [u8], ip: &IpPacketInfo) -> Status {
        let Ok(udp) = UdpPacketInfo::parse(ip.get_payload(packet)) else {
            return Status::Ignored;
        };
        let create = !self.mode.contains(Mode::PROXY_ONLY);
        let link = link_or_return!(self.find_udp_tcp_in(
            ip.src_ip,
            ip.dst_ip,
            udp.src_port,
            udp.dst_port,
            LinkType::Udp,
            create
        ));
        let Some(original_port) = self.table.get(link).map(|l| l.src_port) else {
            return Status::Ignored;
        };
        let original = self.original_address_of(link);
        let alias_addr = ip.dst_ip;

        let h = ip.header_len;
        put_u16(packet, h + 2, original_port);
        let rewritten = match AppProtocol::udp(udp.src_port, original_port) {
            Some(AppProtocol::CuSeeMe) => cuseeme::alias_in(packet, alias_addr, original),
            Some(AppProtocol::NetbiosDgm) => {
                nbt::handle_datagram(packet, Some(alias_addr), original, original_port)
            }
            Some(AppProtocol::NetbiosNs) => nbt::handle_name_service(packet, alias_addr, original),
            _ => Ok(()),
        };
        if let Err(e) = rewritten {
            log::debug!("udp {}:{} rewrite skipped: {}", ip.src_ip, udp.src_port, e);
        }

        let acc = udp.dst_port as i32 - original_port as i32 + addr_words(alias_addr)
            - addr_words(original);
        let sum = adjust_optional_checksum(acc, get_u16(packet, h + UDP_CHECKSUM));
        put_u16(packet, h + UDP_CHECKSUM, sum);
        rewrite_dst_addr(packet, original);
        Status::Ok
    }

    // TCP

    fn tcp_out(&mut self, packet: &mut [u8], ip: &IpPacketInfo, create: bool) -> Status {
        let Ok(tcp) = TcpPacketInfo::parse(ip.get_payload(packet)) else {
            return Status::Ignored;
        };
        let link = link_or_return!(self.find_udp_tcp_out(
            ip.src_ip,
            ip.dst_ip,
            tcp.src_port,
            tcp.dst_port,
            LinkType::Tcp,
            create
        ));

        if let Some(state) = self.table.get(link).and_then(|l| l.tcp()).map(|t| t.state_out) {
            let next = state.next(tcp.flags.syn, tcp.flags.fin, tcp.flags.rst);
            if next != state {
                self.set_state_out(link, next);
            }
        }

        if create {
            let capacity = packet.len();
            let rewritten = match AppProtocol::tcp_outbound(tcp.src_port, tcp.dst_port) {
                Some(AppProtocol::Ftp) => ftp::alias_out(self, packet, capacity, link),
                Some(AppProtocol::Irc) => irc::alias_out(self, packet, capacity, link),
                Some(AppProtocol::Rtsp) => rtsp::alias_out(self, packet, capacity, link),
                Some(AppProtocol::Pptp) => pptp::alias_out(self, packet, link),
                _ => Ok(()),
            };
            if let Err(e) = rewritten {
                log::debug!("tcp {}:{} rewrite skipped: {}", ip.src_ip, tcp.src_port, e);
            }
        }

        let Some((alias_port, delta)) = self.table.get(link).map(|l| {
            let delta = l
                .tcp()
                .filter(|t| t.ack_modified())
                .map_or(0, |t| t.delta_seq_out(tcp.seq_num));
            (l.alias_port, delta)
        }) else {
            return Status::Ignored;
        };
        let alias_addr = self.alias_address_of(link);

        let h = ip.header_len;
        let mut acc = tcp.src_port as i32 - alias_port as i32 + addr_words(ip.src_ip)
            - addr_words(alias_addr);
        if delta != 0 {
            let seq = tcp.seq_num.wrapping_add(delta as u32);
            acc += accumulate_u32(tcp.seq_num, seq);
            put_u32(packet, h + TCP_SEQ, seq);
        }
        put_u16(packet, h, alias_port);
        let sum = adjust_checksum(acc, get_u16(packet, h + TCP_CHECKSUM));
        put_u16(packet, h + TCP_CHECKSUM, sum);
        rewrite_src_addr(packet, alias_addr);
        Status::Ok
    }

    fn tcp_in(&mut self, packet: &mut [u8], ip: &IpPacketInfo) -> Status {
        let Ok(tcp) = TcpPacketInfo::parse(ip.get_payload(packet)) else {
            return Status::Ignored;
        };
        let create = !self.mode.contains(Mode::PROXY_ONLY);
        let link = link_or_return!(self.find_udp_tcp_in(
            ip.src_ip,
            ip.dst_ip,
            tcp.src_port,
            tcp.dst_port,
            LinkType::Tcp,
            create
        ));
        let Some(original_port) = self.table.get(link).map(|l| l.src_port) else {
            return Status::Ignored;
        };
        let original = self.original_address_of(link);
        let alias_addr = ip.dst_ip;

        let h = ip.header_len;
        put_u16(packet, h + 2, original_port);
        if AppProtocol::tcp_inbound(tcp.src_port, original_port) == Some(AppProtocol::Pptp) {
            if let Err(e) = pptp::alias_in(self, packet, link) {
                log::debug!("tcp {}:{} rewrite skipped: {}", ip.src_ip, tcp.src_port, e);
            }
        }

        let delta = self
            .table
            .get(link)
            .and_then(|l| l.tcp())
            .filter(|t| t.ack_modified())
            .map_or(0, |t| t.delta_ack_in(tcp.ack_num));
        let mut acc = tcp.dst_port as i32 - original_port as i32 + addr_words(alias_addr)
            - addr_words(original);
        if delta != 0 {
            let ack = tcp.ack_num.wrapping_sub(delta as u32);
            acc += accumulate_u32(tcp.ack_num, ack);
            put_u32(packet, h + TCP_ACK, ack);
        }
        let sum = adjust_checksum(acc, get_u16(packet, h + TCP_CHECKSUM));
        put_u16(packet, h + TCP_CHECKSUM, sum);
        rewrite_dst_addr(packet, original);

        if let Some(state) = self.table.get(link).and_then(|l| l.tcp()).map(|t| t.state_in) {
            let next = state.next(tcp.flags.syn, tcp.flags.fin, tcp.flags.rst);
            if next != state {
                self.set_state_in(link, next);
            }
        }
        Status::Ok
    }

    // Other protocols

    fn proto_out(&mut self, packet: &mut [u8], ip: &IpPacketInfo, protocol: u8, create: bool) -> Status {
        if self.mode.contains(Mode::PROXY_ONLY) {
            return Status::Ok;
        }
        let link = link_or_return!(self.find_proto_out(ip.src_ip, ip.dst_ip, protocol, create));
        let alias_addr = self.alias_address_of(link);
        rewrite_src_addr(packet, alias_addr);
        Status::Ok
    }

    fn proto_in(&mut self, packet: &mut [u8], ip: &IpPacketInfo, protocol: u8) -> Status {
        if self.mode.contains(Mode::PROXY_ONLY) {
            return Status::Ok;
        }
        let link = link_or_return!(self.find_proto_in(ip.src_ip, ip.dst_ip, protocol));
        let original = self.original_address_of(link);
        rewrite_dst_addr(packet, original);
        Status::Ok
    }
}
