//! RTSP session setup
//!
//! A client `SETUP` request announces the UDP ports it will receive media
//! on in its `Transport:` header, as `client_port=a` or `client_port=a-b`.
//! Each port gets a UDP link towards the server and the header is rewritten
//! to the alias ports.

use crate::engine::PacketAlias;
use crate::error::{AliasError, Result};
use crate::link::{LinkId, LinkType};

use super::{find_bytes, replace_tcp_payload, Scanner, TcpSegment, RTSP_CONTROL_PORTS};

const SETUP: &[u8] = b"SETUP";
const TRANSPORT: &[u8] = b"Transport:";
const CLIENT_PORT: &[u8] = b"client_port=";

/// Port range found in a `client_port=` parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientPorts {
    /// Byte range of the port text
    pub start: usize,
    pub end: usize,
    pub first: u16,
    pub last: Option<u16>,
}

/// Locate the client port parameter of a SETUP request
pub fn find_client_ports(payload: &[u8]) -> Option<ClientPorts> {
    if !payload.starts_with(SETUP) {
        return None;
    }
    let transport = find_bytes(payload, TRANSPORT)?;
    let line_end = find_bytes(&payload[transport..], b"\r\n")
        .map_or(payload.len(), |n| transport + n);
    let param = transport + find_bytes(&payload[transport..line_end], CLIENT_PORT)?;

    let start = param + CLIENT_PORT.len();
    let mut s = Scanner::at(&payload[..line_end], start);
    let first = s.number(u16::MAX as u64)? as u16;
    let mut last = None;
    if s.peek() == Some(b'-') {
        s.next();
        last = Some(s.number(u16::MAX as u64)? as u16);
    }
    match s.peek() {
        None | Some(b';') | Some(b',') | Some(b'\r') | Some(b' ') => {}
        Some(_) => return None,
    }
    Some(ClientPorts {
        start,
        end: s.pos(),
        first,
        last,
    })
}

pub(crate) fn alias_out(
    alias: &mut PacketAlias,
    packet: &mut [u8],
    capacity: usize,
    link: LinkId,
) -> Result<()> {
    let seg = TcpSegment::parse(packet).ok_or(AliasError::Rewrite("short RTSP segment"))?;
    if !RTSP_CONTROL_PORTS.contains(&seg.dst_port) {
        return Ok(());
    }
    let payload = seg.payload(packet).to_vec();
    let Some(ports) = find_client_ports(&payload) else {
        return Ok(());
    };

    let server = alias
        .table
        .get(link)
        .map(|l| l.dst_addr)
        .ok_or(AliasError::NoSuchLink)?;
    let mut media_port = |port: u16| -> Result<u16> {
        let id = alias
            .find_udp_tcp_out(seg.src, server, port, 0, LinkType::Udp, true)?
            .ok_or(AliasError::Rewrite("no RTSP media link"))?;
        alias
            .table
            .get(id)
            .map(|l| l.alias_port)
            .ok_or(AliasError::NoSuchLink)
    };

    let first = media_port(ports.first)?;
    let text = match ports.last {
        Some(last) => format!("{}-{}", first, media_port(last)?),
        None => first.to_string(),
    };
    log::debug!("rtsp: client_port {:?} -> {}", ports, text);

    let mut rewritten = Vec::with_capacity(payload.len() + 8);
    rewritten.extend_from_slice(&payload[..ports.start]);
    rewritten.extend_from_slice(text.as_bytes());
    rewritten.extend_from_slice(&payload[ports.end..]);
    replace_tcp_payload(alias, packet, capacity, &seg, link, &rewritten)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_find_client_port_range() {
        let payload = b"SETUP rtsp://example.com/media RTSP/1.0\r\nCSeq: 3\r\nTransport: RTP/AVP;unicast;client_port=5004-5005\r\n\r\n";
        let ports = find_client_ports(payload).unwrap();
        assert_eq!(ports.first, 5004);
        assert_eq!(ports.last, Some(5005));
        assert_eq!(&payload[ports.start..ports.end], b"5004-5005");
    }

    #[test]
    fn test_find_single_client_port() {
        let payload = b"SETUP rtsp://h/a RTSP/1.0\r\nTransport: RTP/AVP;client_port=6970;mode=play\r\n\r\n";
        let ports = find_client_ports(payload).unwrap();
        assert_eq!(ports.first, 6970);
        assert_eq!(ports.last, None);
    }

    #[test]
    fn test_non_setup_ignored() {
        assert!(find_client_ports(b"PLAY rtsp://h/a RTSP/1.0\r\nTransport: client_port=1-2\r\n").is_none());
        assert!(find_client_ports(b"SETUP rtsp://h/a RTSP/1.0\r\nCSeq: 1\r\n\r\n").is_none());
        assert!(find_client_ports(b"SETUP x\r\nTransport: client_port=12x\r\n").is_none());
    }
}
