//! CU-SeeMe conferencing
//!
//! Every datagram starts with a fixed header that repeats the sender's
//! address. Reflector "open continue" messages (type 101) list the
//! conference members, the receiving host among them.

use std::net::Ipv4Addr;

use crate::checksum::addr_words;
use crate::engine::PacketAlias;
use crate::error::{AliasError, Result};
use crate::link::{LinkId, LinkType};
use crate::packet::{get_addr, get_u16, put_addr};

use super::UdpDatagram;

const CU_HEADER_LEN: usize = 26;
const CU_DEST_ADDR: usize = 4;
const CU_ADDR: usize = 12;
const CU_DATA_TYPE: usize = 22;

/// `client_count` then padded sequence number, name and callsign
const OC_HEADER_LEN: usize = 48;
const CLIENT_INFO_LEN: usize = 12;

const OPEN_CONTINUE: u16 = 101;

/// Replace the sender address in an outbound header and open a UDP link
/// towards the reflector for its replies
pub(crate) fn alias_out(alias: &mut PacketAlias, packet: &mut [u8], link: LinkId) -> Result<()> {
    let udp = UdpDatagram::parse(packet).ok_or(AliasError::Rewrite("short CU-SeeMe datagram"))?;
    if udp.data + CU_HEADER_LEN <= udp.end {
        let at = udp.data + CU_ADDR;
        let current = get_addr(packet, at);
        if !current.is_unspecified() {
            let alias_addr = alias.alias_address_of(link);
            udp.adjust_checksum(packet, addr_words(current) - addr_words(alias_addr));
            put_addr(packet, at, alias_addr);
        }
    }

    let (dst, dst_port) = alias
        .table
        .get(link)
        .map(|l| (l.dst_addr, l.dst_port))
        .ok_or(AliasError::NoSuchLink)?;
    let src_port = get_u16(packet, udp.udp);
    alias.find_udp_tcp_out(udp.src, dst, src_port, 0, LinkType::Udp, true)?;
    log::debug!("cuseeme: reflector {}:{} for {}", dst, dst_port, udp.src);
    Ok(())
}

/// Restore the internal host in an inbound header and in the member list
/// of an open continue message. `alias_addr` is the datagram's destination
/// before de-aliasing.
pub(crate) fn alias_in(packet: &mut [u8], alias_addr: Ipv4Addr, original: Ipv4Addr) -> Result<()> {
    let udp = UdpDatagram::parse(packet).ok_or(AliasError::Rewrite("short CU-SeeMe datagram"))?;
    let cu = udp.data;
    if cu + CU_HEADER_LEN > udp.end {
        return Ok(());
    }

    let mut acc = 0i32;
    let dest = get_addr(packet, cu + CU_DEST_ADDR);
    if !dest.is_unspecified() {
        acc += addr_words(dest) - addr_words(original);
        put_addr(packet, cu + CU_DEST_ADDR, original);
    }

    if get_u16(packet, cu + CU_DATA_TYPE) == OPEN_CONTINUE {
        let oc = cu + CU_HEADER_LEN;
        if oc + OC_HEADER_LEN <= udp.end {
            let count = get_u16(packet, oc) as usize;
            let first = oc + OC_HEADER_LEN;
            for i in 0..count {
                let ci = first + i * CLIENT_INFO_LEN;
                if ci + CLIENT_INFO_LEN > udp.end {
                    break;
                }
                if get_addr(packet, ci) == alias_addr {
                    acc += addr_words(alias_addr) - addr_words(original);
                    put_addr(packet, ci, original);
                    break;
                }
            }
        }
    }

    if acc != 0 {
        udp.adjust_checksum(packet, acc);
    }
    Ok(())
}
