//! Host sockets reserved for alias ports
//!
//! With `Mode::USE_SOCKETS`, a partially specified TCP/UDP link binds a real
//! socket on its alias port so the host stack never hands the same port to
//! one of its own connections. The socket lives exactly as long as the link.

use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, TcpListener, UdpSocket};

use crate::link::LinkType;

#[derive(Debug)]
pub enum ReservedSocket {
    Tcp(TcpListener),
    Udp(UdpSocket),
}

impl ReservedSocket {
    /// Bind `port` on all local addresses for the link's transport
    pub fn bind(port: u16, link_type: LinkType) -> io::Result<Self> {
        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);
        match link_type {
            LinkType::Tcp => Ok(ReservedSocket::Tcp(TcpListener::bind(addr)?)),
            LinkType::Udp => Ok(ReservedSocket::Udp(UdpSocket::bind(addr)?)),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("no socket type for {:?} links", other),
            )),
        }
    }

    pub fn local_port(&self) -> io::Result<u16> {
        match self {
            ReservedSocket::Tcp(s) => s.local_addr().map(|a| a.port()),
            ReservedSocket::Udp(s) => s.local_addr().map(|a| a.port()),
        }
    }
}
