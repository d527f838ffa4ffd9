//! FTP control channel
//!
//! Outbound `PORT`/`EPRT` commands and `227`/`229` passive replies
//! announce a data connection endpoint. The endpoint gets its own link and
//! the message is re-rendered with the alias address and port.

use std::net::Ipv4Addr;

use crate::engine::PacketAlias;
use crate::error::{AliasError, Result};
use crate::link::{LinkId, LinkType};

use super::{ends_with_crlf, replace_tcp_payload, Scanner, TcpSegment, FTP_CONTROL_PORT};

/// Longest control message considered for rewriting
pub const MAX_MESSAGE_SIZE: usize = 128;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FtpMessage {
    Port { addr: Ipv4Addr, port: u16 },
    Eprt { addr: Ipv4Addr, port: u16 },
    Passive { addr: Ipv4Addr, port: u16 },
    ExtendedPassive { port: u16 },
}

fn octets(s: &mut Scanner<'_>, sep: u8) -> Option<Ipv4Addr> {
    let mut addr = [0u8; 4];
    for (i, slot) in addr.iter_mut().enumerate() {
        if i > 0 {
            s.byte(sep)?;
        }
        *slot = s.number(255)? as u8;
    }
    Some(Ipv4Addr::from(addr))
}

fn port_pair(s: &mut Scanner<'_>) -> Option<u16> {
    let hi = s.number(255)? as u16;
    s.byte(b',')?;
    let lo = s.number(255)? as u16;
    Some(hi << 8 | lo)
}

/// `PORT a,b,c,d,p1,p2`
pub fn parse_port(payload: &[u8]) -> Option<FtpMessage> {
    if payload.len() < 18 {
        return None;
    }
    let mut s = Scanner::new(payload);
    s.expect(b"PORT")?;
    s.skip_spaces();
    let addr = octets(&mut s, b',')?;
    s.byte(b',')?;
    let port = port_pair(&mut s)?;
    s.next()?;
    Some(FtpMessage::Port { addr, port })
}

/// `EPRT |1|a.b.c.d|port|`, any delimiter
pub fn parse_eprt(payload: &[u8]) -> Option<FtpMessage> {
    if payload.len() < 18 {
        return None;
    }
    let mut s = Scanner::new(payload);
    s.expect(b"EPRT")?;
    s.skip_spaces();
    let delim = s.next()?;
    s.byte(b'1')?;
    s.byte(delim)?;
    let addr = octets(&mut s, b'.')?;
    s.byte(delim)?;
    let port = s.number(u16::MAX as u64)? as u16;
    s.byte(delim)?;
    Some(FtpMessage::Eprt { addr, port })
}

/// `227 Entering Passive Mode (a,b,c,d,p1,p2)`
pub fn parse_227(payload: &[u8]) -> Option<FtpMessage> {
    if payload.len() < 17 {
        return None;
    }
    let mut s = Scanner::new(payload);
    s.expect(b"227")?;
    s.skip_while(|b| b != b'(');
    s.byte(b'(')?;
    let addr = octets(&mut s, b',')?;
    s.byte(b',')?;
    let port = port_pair(&mut s)?;
    s.byte(b')')?;
    Some(FtpMessage::Passive { addr, port })
}

/// `229 Entering Extended Passive Mode (|||port|)`
pub fn parse_229(payload: &[u8]) -> Option<FtpMessage> {
    if payload.len() < 11 {
        return None;
    }
    let mut s = Scanner::new(payload);
    s.expect(b"229")?;
    s.skip_while(|b| b != b'(');
    s.byte(b'(')?;
    let delim = s.next()?;
    s.byte(delim)?;
    s.byte(delim)?;
    let port = s.number(u16::MAX as u64)? as u16;
    s.byte(delim)?;
    s.byte(b')')?;
    Some(FtpMessage::ExtendedPassive { port })
}

/// Render the aliased form of `message`
pub fn render(message: &FtpMessage, alias_addr: Ipv4Addr, alias_port: u16) -> String {
    let [a1, a2, a3, a4] = alias_addr.octets();
    let (p1, p2) = (alias_port >> 8, alias_port & 0xff);
    match message {
        FtpMessage::Port { .. } => format!("PORT {},{},{},{},{},{}\r\n", a1, a2, a3, a4, p1, p2),
        FtpMessage::Eprt { .. } => format!("EPRT |1|{}|{}|\r\n", alias_addr, alias_port),
        FtpMessage::Passive { .. } => format!(
            "227 Entering Passive Mode ({},{},{},{},{},{})\r\n",
            a1, a2, a3, a4, p1, p2
        ),
        FtpMessage::ExtendedPassive { .. } => {
            format!("229 Entering Extended Passive Mode (|||{}|)\r\n", alias_port)
        }
    }
}

fn parse(payload: &[u8], to_server: bool) -> Option<FtpMessage> {
    if to_server {
        parse_port(payload).or_else(|| parse_eprt(payload))
    } else {
        parse_227(payload).or_else(|| parse_229(payload))
    }
}

/// Rewrite an outbound control segment on `link`
pub(crate) fn alias_out(
    alias: &mut PacketAlias,
    packet: &mut [u8],
    capacity: usize,
    link: LinkId,
) -> Result<()> {
    let seg = TcpSegment::parse(packet).ok_or(AliasError::Rewrite("short FTP segment"))?;
    let dlen = seg.payload_len();
    let line_start = alias
        .table
        .get(link)
        .and_then(|l| l.tcp())
        .map_or(false, |tcp| tcp.last_line_crlf_terminated);

    let mut result = Ok(());
    if line_start && dlen <= MAX_MESSAGE_SIZE {
        let message = parse(seg.payload(packet), seg.dst_port == FTP_CONTROL_PORT);
        if let Some(message) = message {
            result = rewrite(alias, packet, capacity, &seg, link, message);
        }
    }

    if let Some(seg) = TcpSegment::parse(packet) {
        if seg.payload_len() > 0 {
            let crlf = ends_with_crlf(seg.payload(packet));
            if let Some(tcp) = alias.table.get_mut(link).and_then(|l| l.tcp_mut()) {
                tcp.last_line_crlf_terminated = crlf;
            }
        }
    }
    result
}

fn rewrite(
    alias: &mut PacketAlias,
    packet: &mut [u8],
    capacity: usize,
    seg: &TcpSegment,
    link: LinkId,
    message: FtpMessage,
) -> Result<()> {
    let (true_addr, true_port) = match message {
        FtpMessage::Port { addr, port }
        | FtpMessage::Eprt { addr, port }
        | FtpMessage::Passive { addr, port } => (addr, port),
        FtpMessage::ExtendedPassive { port } => (seg.src, port),
    };
    if true_addr != seg.src {
        return Err(AliasError::Rewrite("FTP endpoint is not the sending host"));
    }

    let remote = alias
        .table
        .get(link)
        .map(|l| l.dst_addr)
        .ok_or(AliasError::NoSuchLink)?;
    let data_link = alias
        .find_udp_tcp_out(true_addr, remote, true_port, 0, LinkType::Tcp, true)?
        .ok_or(AliasError::Rewrite("no FTP data link"))?;
    let alias_port = alias
        .table
        .get(data_link)
        .map(|l| l.alias_port)
        .ok_or(AliasError::NoSuchLink)?;
    let alias_addr = alias.alias_address_of(link);

    let text = render(&message, alias_addr, alias_port);
    log::debug!(
        "ftp {:?} {}:{} -> {}:{}",
        message,
        true_addr,
        true_port,
        alias_addr,
        alias_port
    );
    replace_tcp_payload(alias, packet, capacity, seg, link, text.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_port() {
        let msg = parse_port(b"PORT 10,0,0,5,15,160\r\n").unwrap();
        assert_eq!(
            msg,
            FtpMessage::Port {
                addr: Ipv4Addr::new(10, 0, 0, 5),
                port: 4000
            }
        );
        assert!(parse_port(b"PORT 10,0,0,5,15\r\n").is_none());
        assert!(parse_port(b"PORT 10,0,0,300,15,160\r\n").is_none());
        assert!(parse_port(b"LIST 10,0,0,5,15,160\r\n").is_none());
        assert!(parse_port(b"PORT 1,2,3,4\r\n").is_none());
    }

    #[test]
    fn test_parse_eprt() {
        let msg = parse_eprt(b"EPRT |1|10.0.0.5|4000|\r\n").unwrap();
        assert_eq!(
            msg,
            FtpMessage::Eprt {
                addr: Ipv4Addr::new(10, 0, 0, 5),
                port: 4000
            }
        );
        assert!(parse_eprt(b"EPRT |2|::1|4000|\r\n\r\n").is_none());
    }

    #[test]
    fn test_parse_replies() {
        let msg = parse_227(b"227 Entering Passive Mode (10,0,0,5,19,137)\r\n").unwrap();
        assert_eq!(
            msg,
            FtpMessage::Passive {
                addr: Ipv4Addr::new(10, 0, 0, 5),
                port: 19 * 256 + 137
            }
        );
        let msg = parse_229(b"229 Entering Extended Passive Mode (|||6446|)\r\n").unwrap();
        assert_eq!(msg, FtpMessage::ExtendedPassive { port: 6446 });
        assert!(parse_229(b"230 Logged in (|||6446|)\r\n").is_none());
    }

    #[test]
    fn test_render() {
        let alias = Ipv4Addr::new(203, 0, 113, 9);
        let port = FtpMessage::Port {
            addr: Ipv4Addr::UNSPECIFIED,
            port: 0,
        };
        assert_eq!(render(&port, alias, 0x9c41), "PORT 203,0,113,9,156,65\r\n");
        let eprt = FtpMessage::Eprt {
            addr: Ipv4Addr::UNSPECIFIED,
            port: 0,
        };
        assert_eq!(render(&eprt, alias, 40001), "EPRT |1|203.0.113.9|40001|\r\n");
        let epsv = FtpMessage::ExtendedPassive { port: 0 };
        assert_eq!(
            render(&epsv, alias, 40001),
            "229 Entering Extended Passive Mode (|||40001|)\r\n"
        );
    }
}
