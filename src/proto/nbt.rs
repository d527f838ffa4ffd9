//! NetBIOS over TCP/IP
//!
//! The datagram service (port 138) repeats the sender's address and port in
//! its own header. The name service (port 137) carries host addresses in
//! `NB` and `A` resource records. Both are fixed-width fields, patched in
//! place with a UDP checksum adjustment.

use std::net::Ipv4Addr;

use crate::checksum::addr_words;
use crate::error::{AliasError, Result};
use crate::packet::{get_addr, get_u16, put_addr, put_u16};

use super::UdpDatagram;

const DGM_HEADER_LEN: usize = 14;
const DGM_SOURCE_IP: usize = 4;
const DGM_SOURCE_PORT: usize = 8;

const DGM_DIRECT_UNIQUE: u8 = 0x10;
const DGM_DIRECT_GROUP: u8 = 0x11;
const DGM_BROADCAST: u8 = 0x12;
const DGM_ERROR: u8 = 0x13;
const DGM_QUERY_REQUEST: u8 = 0x14;
const DGM_POSITIVE_RESPONSE: u8 = 0x15;
const DGM_NEGATIVE_RESPONSE: u8 = 0x16;

const NS_HEADER_LEN: usize = 12;
const QUESTION_TAIL: usize = 4;
/// type, class, ttl, rdlength
const RR_TAIL: usize = 10;
const NB_ENTRY_LEN: usize = 6;
const A_ENTRY_LEN: usize = 4;

const RR_TYPE_A: u16 = 0x0001;
const RR_TYPE_NB: u16 = 0x0020;

/// Skip an encoded NetBIOS name starting at `pos` in `data[..end]`
fn skip_name(data: &[u8], pos: usize, end: usize) -> Option<usize> {
    if pos >= end {
        return None;
    }
    if data[pos] & 0xc0 == 0xc0 {
        let next = pos + 2;
        return (next <= end).then_some(next);
    }
    let mut p = pos;
    while data[p] & 0x3f != 0 {
        p += (data[p] & 0x3f) as usize + 1;
        if p >= end {
            return None;
        }
    }
    let next = p + 1;
    (next <= end).then_some(next)
}

/// Checksum contribution of `bytes` placed `offset` bytes into the
/// checksummed data; names make record fields land on odd offsets
fn lane_sum(bytes: &[u8], offset: usize) -> i32 {
    bytes
        .iter()
        .enumerate()
        .map(|(i, &b)| if (offset + i) % 2 == 0 { (b as i32) << 8 } else { b as i32 })
        .sum()
}

/// Rewrite the source address and port of a datagram service header.
///
/// Outbound: `old` is ignored and the header always takes `new`.
/// Inbound `new` is written only where the header holds `old`.
pub(crate) fn handle_datagram(
    packet: &mut [u8],
    old: Option<Ipv4Addr>,
    new_addr: Ipv4Addr,
    new_port: u16,
) -> Result<()> {
    let udp = UdpDatagram::parse(packet).ok_or(AliasError::Rewrite("short NetBIOS datagram"))?;
    let h = udp.data;
    let end = udp.end;
    if h + DGM_HEADER_LEN > end {
        return Err(AliasError::Rewrite("short NetBIOS datagram header"));
    }

    let names_end = match packet[h] {
        DGM_DIRECT_UNIQUE | DGM_DIRECT_GROUP | DGM_BROADCAST => {
            skip_name(packet, h + 14, end).and_then(|p| skip_name(packet, p, end))
        }
        DGM_ERROR => Some(h + 11),
        DGM_QUERY_REQUEST | DGM_POSITIVE_RESPONSE | DGM_NEGATIVE_RESPONSE => {
            skip_name(packet, h + 10, end)
        }
        _ => None,
    };
    if names_end.map_or(true, |p| p > end) {
        return Err(AliasError::Rewrite("malformed NetBIOS datagram"));
    }

    let current = get_addr(packet, h + DGM_SOURCE_IP);
    if old.map_or(false, |old| old != current) {
        return Ok(());
    }
    let current_port = get_u16(packet, h + DGM_SOURCE_PORT);
    let acc = addr_words(current) - addr_words(new_addr) + current_port as i32 - new_port as i32;
    udp.adjust_checksum(packet, acc);
    put_addr(packet, h + DGM_SOURCE_IP, new_addr);
    put_u16(packet, h + DGM_SOURCE_PORT, new_port);
    Ok(())
}

/// Replace every `old` host address in the name service records with `new`
pub(crate) fn handle_name_service(packet: &mut [u8], old: Ipv4Addr, new: Ipv4Addr) -> Result<()> {
    let udp = UdpDatagram::parse(packet).ok_or(AliasError::Rewrite("short NetBIOS NS packet"))?;
    let h = udp.data;
    let end = udp.end;
    if h + NS_HEADER_LEN > end {
        return Err(AliasError::Rewrite("short NetBIOS NS header"));
    }
    let questions = get_u16(packet, h + 4);
    let records = get_u16(packet, h + 6) as usize
        + get_u16(packet, h + 8) as usize
        + get_u16(packet, h + 10) as usize;

    let malformed = AliasError::Rewrite("malformed NetBIOS NS record");
    let mut p = h + NS_HEADER_LEN;
    for _ in 0..questions {
        p = skip_name(packet, p, end).ok_or(AliasError::Rewrite("malformed NetBIOS NS question"))?;
        p += QUESTION_TAIL;
        if p > end {
            return Err(AliasError::Rewrite("malformed NetBIOS NS question"));
        }
    }

    let mut acc = 0i32;
    let udp_start = udp.udp;
    let mut replace = |packet: &mut [u8], at: usize| {
        if get_addr(packet, at) == old {
            let lane = at - udp_start;
            acc += lane_sum(&old.octets(), lane) - lane_sum(&new.octets(), lane);
            put_addr(packet, at, new);
        }
    };

    for _ in 0..records {
        p = match skip_name(packet, p, end) {
            Some(p) if p + RR_TAIL <= end => p,
            _ => return Err(malformed),
        };
        let rr_type = get_u16(packet, p);
        let rdlen = get_u16(packet, p + 8) as usize;
        let rdata = p + RR_TAIL;
        if rdata + rdlen > end {
            return Err(malformed);
        }
        match rr_type {
            RR_TYPE_NB => {
                for entry in (rdata..rdata + rdlen).step_by(NB_ENTRY_LEN) {
                    if entry + NB_ENTRY_LEN <= rdata + rdlen {
                        replace(packet, entry + 2);
                    }
                }
            }
            RR_TYPE_A => {
                for entry in (rdata..rdata + rdlen).step_by(A_ENTRY_LEN) {
                    if entry + A_ENTRY_LEN <= rdata + rdlen {
                        replace(packet, entry);
                    }
                }
            }
            // NULL, NS, NBSTAT and unknown records carry no address to patch
            _ => {}
        }
        p = rdata + rdlen;
    }

    if acc != 0 {
        udp.adjust_checksum(packet, acc);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::transport_checksum;
    use crate::packet::PROTO_UDP;

    const HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const ALIAS: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);

    /// Encoded name "A" padded, as 32 label bytes
    fn encoded_name() -> Vec<u8> {
        let mut name = vec![0x20];
        name.extend(std::iter::repeat(b'C').take(32));
        name.push(0);
        name
    }

    fn udp_packet(src: Ipv4Addr, dst: Ipv4Addr, port: u16, payload: &[u8]) -> Vec<u8> {
        let total = 28 + payload.len();
        let mut packet = vec![0u8; total];
        packet[0] = 0x45;
        put_u16(&mut packet, 2, total as u16);
        packet[9] = PROTO_UDP;
        put_addr(&mut packet, 12, src);
        put_addr(&mut packet, 16, dst);
        put_u16(&mut packet, 20, port);
        put_u16(&mut packet, 22, port);
        put_u16(&mut packet, 24, (8 + payload.len()) as u16);
        packet[28..].copy_from_slice(payload);
        let sum = transport_checksum(src, dst, PROTO_UDP, &packet[20..]);
        put_u16(&mut packet, 26, sum);
        packet
    }

    fn udp_valid(packet: &[u8]) -> bool {
        let src = get_addr(packet, 12);
        let dst = get_addr(packet, 16);
        transport_checksum(src, dst, PROTO_UDP, &packet[20..]) == 0
    }

    #[test]
    fn test_skip_name() {
        let name = encoded_name();
        assert_eq!(skip_name(&name, 0, name.len()), Some(34));
        assert_eq!(skip_name(&[0xc0, 0x0c], 0, 2), Some(2));
        assert_eq!(skip_name(&name, 0, 20), None);
    }

    #[test]
    fn test_datagram_source_rewritten() {
        let mut payload = vec![DGM_DIRECT_GROUP, 0x02, 0x12, 0x34];
        payload.extend_from_slice(&HOST.octets());
        payload.extend_from_slice(&138u16.to_be_bytes());
        payload.extend_from_slice(&[0, 0, 0, 0]);
        payload.extend(encoded_name());
        payload.extend(encoded_name());
        let mut packet = udp_packet(HOST, Ipv4Addr::new(10, 0, 0, 255), 138, &payload);

        handle_datagram(&mut packet, None, ALIAS, 40000).unwrap();
        assert_eq!(get_addr(&packet, 28 + DGM_SOURCE_IP), ALIAS);
        assert_eq!(get_u16(&packet, 28 + DGM_SOURCE_PORT), 40000);
        assert!(udp_valid(&packet));
    }

    #[test]
    fn test_datagram_truncated_name_rejected() {
        let mut payload = vec![DGM_DIRECT_UNIQUE, 0x02, 0x12, 0x34];
        payload.extend_from_slice(&HOST.octets());
        payload.extend_from_slice(&[0, 138, 0, 0, 0, 0]);
        payload.push(0x20);
        payload.extend(std::iter::repeat(b'C').take(10));
        let mut packet = udp_packet(HOST, ALIAS, 138, &payload);
        assert!(handle_datagram(&mut packet, None, ALIAS, 40000).is_err());
        assert_eq!(get_addr(&packet, 28 + DGM_SOURCE_IP), HOST);
    }

    #[test]
    fn test_lane_sum_matches_aligned_words() {
        assert_eq!(lane_sum(&HOST.octets(), 0), addr_words(HOST));
        assert_eq!(lane_sum(&[0x12, 0x34], 1), 0x3412);
    }

    #[test]
    fn test_name_service_odd_offset_checksum() {
        let mut payload = vec![0x12, 0x34, 0x85, 0x00, 0, 0, 0, 1, 0, 0, 0, 0];
        // Odd length name pushes the record data onto an odd offset
        payload.extend_from_slice(&[0x01, b'X', 0x00]);
        payload.extend_from_slice(&RR_TYPE_A.to_be_bytes());
        payload.extend_from_slice(&[0, 1, 0, 0, 0x0e, 0x10, 0, 4]);
        payload.extend_from_slice(&HOST.octets());
        let mut packet = udp_packet(HOST, Ipv4Addr::new(10, 0, 0, 1), 137, &payload);

        handle_name_service(&mut packet, HOST, ALIAS).unwrap();
        assert_eq!(get_addr(&packet[28..], 12 + 3 + 10), ALIAS);
        assert!(udp_valid(&packet));
    }

    #[test]
    fn test_name_service_records_rewritten() {
        let mut payload = vec![0x12, 0x34, 0x85, 0x00, 0, 0, 0, 1, 0, 0, 0, 1];
        // Answer: NB record with one entry for HOST
        payload.extend(encoded_name());
        payload.extend_from_slice(&RR_TYPE_NB.to_be_bytes());
        payload.extend_from_slice(&[0, 1, 0, 0, 0x0e, 0x10, 0, 6, 0x60, 0x00]);
        payload.extend_from_slice(&HOST.octets());
        // Additional: A record pointing at a compressed name
        payload.extend_from_slice(&[0xc0, 0x0c]);
        payload.extend_from_slice(&RR_TYPE_A.to_be_bytes());
        payload.extend_from_slice(&[0, 1, 0, 0, 0x0e, 0x10, 0, 4]);
        payload.extend_from_slice(&HOST.octets());

        let mut packet = udp_packet(HOST, Ipv4Addr::new(10, 0, 0, 1), 137, &payload);
        handle_name_service(&mut packet, HOST, ALIAS).unwrap();

        let text = &packet[28..];
        let nb_addr = 12 + 34 + 10 + 2;
        assert_eq!(get_addr(text, nb_addr), ALIAS);
        let a_addr = nb_addr + 4 + 2 + 10;
        assert_eq!(get_addr(text, a_addr), ALIAS);
        assert!(udp_valid(&packet));
    }
}
