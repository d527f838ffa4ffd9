//! Alias Core - IPv4 packet aliasing engine
//!
//! This crate rewrites IPv4 TCP/UDP/ICMP headers in both directions so
//! many internal hosts can share one or more external addresses. Per-flow
//! state lives in a flow table of links, and protocol-aware rewriters patch
//! the addresses carried inside FTP, IRC, RTSP, PPTP, NetBIOS and CU-SeeMe
//! payloads.
//!
//! The engine does no I/O on packets: the host hands each datagram to
//! [`PacketAlias::translate_outbound`] or [`PacketAlias::translate_inbound`]
//! and forwards, drops or reassembles according to the returned [`Status`].

// Public modules
pub mod checksum;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod link;
pub mod packet;
pub mod proto;
pub mod socket;
pub mod table;
pub mod translate;

// Re-exports for convenience
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AliasConfig, Mode, Timeouts};
pub use engine::{LinkStats, PacketAlias, Status};
pub use error::{AliasError, Result};
pub use lifecycle::AliasPort;
pub use link::{Link, LinkFlags, LinkId, LinkType, TcpState};
pub use packet::{IpPacketInfo, TcpFlags, TcpPacketInfo, TransportProtocol, UdpPacketInfo};
pub use table::FlowTable;

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn test_packet_alias_creation() {
        let config = AliasConfig::new(Ipv4Addr::new(203, 0, 113, 9));
        let alias = PacketAlias::with_clock(config, Box::new(ManualClock::new(0)));

        assert_eq!(alias.default_alias_address(), Ipv4Addr::new(203, 0, 113, 9));
        assert!(alias.mode().contains(Mode::SAME_PORTS));
        assert!(alias.table().is_empty());
        assert_eq!(alias.stats(), LinkStats::default());
    }

    #[test]
    fn test_from_toml_config() {
        let config = AliasConfig::from_toml_str(
            r#"
alias_address = "198.51.100.1"
deny_incoming = true

[timeouts]
udp = 30
"#,
        )
        .unwrap();

        let alias = PacketAlias::new(config);
        assert!(alias.mode().contains(Mode::DENY_INCOMING));
        assert_eq!(alias.default_alias_address(), Ipv4Addr::new(198, 51, 100, 1));
    }
}
