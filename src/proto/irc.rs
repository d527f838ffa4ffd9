//! IRC DCC offers
//!
//! A CTCP `DCC` request names the sender's address as a decimal number and
//! a listening port: `\x01DCC SEND file 167772165 4000\x01`. Each offer made
//! by the packet's own host gets a wildcard TCP link and is rewritten to
//! the alias address and port.

use std::net::Ipv4Addr;

use crate::engine::PacketAlias;
use crate::error::{AliasError, Result};
use crate::link::{LinkId, LinkType};

use super::{find_bytes, replace_tcp_payload, Scanner, TcpSegment};

/// Shortest payload that can carry a DCC offer
const MIN_MESSAGE: usize = ":A!a@n.n PRIVMSG A :aDCC 1 1a".len();

const CTCP_DCC: &[u8] = b"\x01DCC ";

/// Location of the address and port of one DCC offer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DccOffer {
    /// Byte range holding `<addr> <port>`
    pub start: usize,
    pub end: usize,
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// Parse the offer following a `\x01DCC ` marker that ends at `pos`
fn parse_offer(payload: &[u8], pos: usize) -> Option<DccOffer> {
    let mut s = Scanner::at(payload, pos);
    // Command name
    s.skip_while(|b| b != b' ' && b != 0x01);
    s.byte(b' ')?;
    // Argument, possibly quoted
    if s.peek()? == b'"' {
        s.next();
        s.skip_while(|b| b != b'"');
        s.byte(b'"')?;
    } else {
        s.skip_while(|b| b != b' ' && b != 0x01);
    }
    s.byte(b' ')?;
    s.skip_spaces();

    let start = s.pos();
    let addr = s.number(u32::MAX as u64)? as u32;
    s.byte(b' ')?;
    s.skip_spaces();
    let port = s.number(u16::MAX as u64)? as u16;
    Some(DccOffer {
        start,
        end: s.pos(),
        addr: Ipv4Addr::from(addr),
        port,
    })
}

/// Every DCC offer in `payload`
pub fn find_offers(payload: &[u8]) -> Vec<DccOffer> {
    let mut offers = Vec::new();
    let mut from = 0;
    while let Some(at) = find_bytes(&payload[from..], CTCP_DCC) {
        let pos = from + at + CTCP_DCC.len();
        if let Some(offer) = parse_offer(payload, pos) {
            from = offer.end;
            offers.push(offer);
        } else {
            from = pos;
        }
    }
    offers
}

pub(crate) fn alias_out(
    alias: &mut PacketAlias,
    packet: &mut [u8],
    capacity: usize,
    link: LinkId,
) -> Result<()> {
    let seg = TcpSegment::parse(packet).ok_or(AliasError::Rewrite("short IRC segment"))?;
    if seg.payload_len() < MIN_MESSAGE {
        return Ok(());
    }
    let payload = seg.payload(packet).to_vec();
    let offers = find_offers(&payload);
    if offers.is_empty() {
        return Ok(());
    }

    let alias_addr = alias.alias_address_of(link);
    let mut rewritten = Vec::with_capacity(payload.len() + 16);
    let mut copied = 0;
    let mut changed = false;

    for offer in offers {
        if offer.addr != seg.src || offer.port < 1024 {
            log::debug!("irc: ignoring DCC offer for {}:{}", offer.addr, offer.port);
            continue;
        }
        let dcc_link = match alias.find_udp_tcp_out(
            offer.addr,
            Ipv4Addr::UNSPECIFIED,
            offer.port,
            0,
            LinkType::Tcp,
            true,
        ) {
            Ok(Some(id)) => id,
            Ok(None) => continue,
            Err(e) => {
                log::debug!("irc: no DCC link for {}:{}: {}", offer.addr, offer.port, e);
                continue;
            }
        };
        let Some(alias_port) = alias.table.get(dcc_link).map(|l| l.alias_port) else {
            continue;
        };

        rewritten.extend_from_slice(&payload[copied..offer.start]);
        rewritten.extend_from_slice(format!("{} {}", u32::from(alias_addr), alias_port).as_bytes());
        copied = offer.end;
        changed = true;
        log::debug!(
            "irc: DCC {}:{} -> {}:{}",
            offer.addr,
            offer.port,
            alias_addr,
            alias_port
        );
    }

    if !changed {
        return Ok(());
    }
    rewritten.extend_from_slice(&payload[copied..]);
    replace_tcp_payload(alias, packet, capacity, &seg, link, &rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_send_offer() {
        let payload = b":nick!u@h PRIVMSG bob :\x01DCC SEND notes.txt 167772165 4000 1234\x01\r\n";
        let offers = find_offers(payload);
        assert_eq!(offers.len(), 1);
        let offer = offers[0];
        assert_eq!(offer.addr, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(offer.port, 4000);
        assert_eq!(&payload[offer.start..offer.end], b"167772165 4000");
    }

    #[test]
    fn test_find_quoted_argument() {
        let payload = b"PRIVMSG bob :\x01DCC SEND \"my file.txt\" 167772165 4001\x01\r\n";
        let offers = find_offers(payload);
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].port, 4001);
    }

    #[test]
    fn test_chat_and_garbage() {
        let payload = b"PRIVMSG a :\x01DCC CHAT chat 167772165 5000\x01 \x01DCC junk\x01";
        let offers = find_offers(payload);
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0].port, 5000);
        assert!(find_offers(b"PRIVMSG a :hello there, no offers here\r\n").is_empty());
    }
}
