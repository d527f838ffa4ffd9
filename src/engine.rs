//! Aliasing engine instance
//!
//! `PacketAlias` owns one flow table together with the default alias
//! address, the mode flags and the housekeeping clock. Every entry point
//! takes the instance by mutable reference; independent instances share
//! nothing.

use std::net::Ipv4Addr;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::checksum::differential_checksum_addr;
use crate::clock::{Clock, SystemClock};
use crate::config::{AliasConfig, Mode, Timeouts};
use crate::error::{AliasError, Result};
use crate::lifecycle::AliasPort;
use crate::link::{Link, LinkData, LinkFlags, LinkId, LinkType};
use crate::packet::{get_u16, put_addr, put_u16, IpPacketInfo, TransportProtocol, IP_CHECKSUM, IP_DST};
use crate::table::FlowTable;

/// Outcome of one packet translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Packet was translated
    Ok,
    /// Not handled by the engine, or malformed; left unmodified
    Ignored,
    /// Non-initial fragment whose header fragment has not been seen
    UnresolvedFragment,
    /// Header fragment of a datagram with saved fragments pending
    FoundHeaderFragment,
    /// Link allocation failed; left unmodified
    Error,
}

/// Live link counts by type
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub icmp: usize,
    pub udp: usize,
    pub tcp: usize,
    pub pptp: usize,
    pub proto: usize,
    pub fragment_id: usize,
    pub fragment_ptr: usize,
    pub sockets: usize,
}

impl LinkStats {
    pub(crate) fn count(&mut self, link_type: LinkType, added: bool) {
        let slot = match link_type {
            LinkType::Icmp => &mut self.icmp,
            LinkType::Udp => &mut self.udp,
            LinkType::Tcp => &mut self.tcp,
            LinkType::Pptp => &mut self.pptp,
            LinkType::FragmentId => &mut self.fragment_id,
            LinkType::FragmentPtr => &mut self.fragment_ptr,
            LinkType::Proto(_) => &mut self.proto,
            LinkType::StaticAddress => return,
        };
        if added {
            *slot += 1;
        } else {
            *slot = slot.saturating_sub(1);
        }
    }
}

/// One NAT instance
pub struct PacketAlias {
    pub(crate) table: FlowTable,
    pub(crate) mode: Mode,
    pub(crate) alias_address: Ipv4Addr,
    pub(crate) target_address: Ipv4Addr,
    pub(crate) timeouts: Timeouts,
    pub(crate) max_links: usize,
    pub(crate) port_attempts: usize,
    pub(crate) cleanup_interval: u64,
    pub(crate) cleanup_max_spokes: usize,
    pub(crate) clock: Box<dyn Clock>,
    pub(crate) rng: StdRng,
    /// Time of the current transaction, seconds
    pub(crate) time_stamp: u64,
    pub(crate) last_cleanup: u64,
    pub(crate) cleanup_residual: u64,
    pub(crate) cleanup_cursor: usize,
    pub(crate) new_default_link: bool,
    pub(crate) stats: LinkStats,
}

impl PacketAlias {
    /// Create an instance driven by the system clock
    pub fn new(config: AliasConfig) -> Self {
        Self::with_clock(config, Box::new(SystemClock))
    }

    pub fn with_clock(config: AliasConfig, clock: Box<dyn Clock>) -> Self {
        let now = clock.now_secs();
        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        log::debug!(
            "packet alias instance: alias {} mode {:?}",
            config.alias_address,
            config.mode()
        );
        Self {
            table: FlowTable::new(config.out_table_size, config.in_table_size),
            mode: config.mode(),
            alias_address: config.alias_address,
            target_address: config.target_address,
            timeouts: config.timeouts,
            max_links: config.max_links,
            port_attempts: config.port_attempts.max(1),
            cleanup_interval: config.cleanup_interval_secs.max(1),
            cleanup_max_spokes: config.cleanup_max_spokes,
            clock,
            rng,
            time_stamp: now,
            last_cleanup: now,
            cleanup_residual: 0,
            cleanup_cursor: 0,
            new_default_link: false,
            stats: LinkStats::default(),
        }
    }

    /// Change the default alias address.
    ///
    /// With `RESET_ON_ADDR_CHANGE` a real change flushes every link.
    pub fn set_default_alias_address(&mut self, addr: Ipv4Addr) {
        if self.alias_address != addr && self.mode.contains(Mode::RESET_ON_ADDR_CHANGE) {
            log::info!("alias address {} -> {}, flushing links", self.alias_address, addr);
            self.cleanup_all();
        }
        self.alias_address = addr;
    }

    pub fn default_alias_address(&self) -> Ipv4Addr {
        self.alias_address
    }

    /// Destination for unmatched inbound flows
    pub fn set_target_address(&mut self, addr: Ipv4Addr) {
        self.target_address = addr;
    }

    pub fn target_address(&self) -> Ipv4Addr {
        self.target_address
    }

    /// Set the flags selected by `mask` to their values in `flags`,
    /// returning the previous mode
    pub fn set_mode(&mut self, flags: Mode, mask: Mode) -> Mode {
        let old = self.mode;
        self.mode = (old & !mask) | (flags & mask);
        if old != self.mode {
            log::debug!("mode {:?} -> {:?}", old, self.mode);
        }
        old
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Permanent port forward. A zero `remote` address or port leaves that
    /// side unknown until the first matching inbound packet.
    #[allow(clippy::too_many_arguments)]
    pub fn redirect_port(
        &mut self,
        local: Ipv4Addr,
        local_port: u16,
        remote: Ipv4Addr,
        remote_port: u16,
        alias: Ipv4Addr,
        alias_port: u16,
        protocol: TransportProtocol,
    ) -> Result<LinkId> {
        let link_type = match protocol {
            TransportProtocol::Tcp => LinkType::Tcp,
            TransportProtocol::Udp => LinkType::Udp,
            other => return Err(AliasError::UnsupportedProtocol(other.to_proto())),
        };
        let id = self.add_link(
            local,
            remote,
            alias,
            local_port,
            remote_port,
            AliasPort::Fixed(alias_port),
            link_type,
        )?;
        self.make_permanent(id);
        log::info!(
            "redirect {:?} {}:{} <- {}:{}",
            link_type,
            local,
            local_port,
            alias,
            alias_port
        );
        Ok(id)
    }

    /// Static one-to-one address mapping
    pub fn redirect_address(&mut self, local: Ipv4Addr, alias: Ipv4Addr) -> Result<LinkId> {
        let id = self.add_link(
            local,
            Ipv4Addr::UNSPECIFIED,
            alias,
            0,
            0,
            AliasPort::Fixed(0),
            LinkType::StaticAddress,
        )?;
        self.make_permanent(id);
        log::info!("redirect address {} <- {}", local, alias);
        Ok(id)
    }

    /// Permanent mapping for a portless IP protocol
    pub fn redirect_proto(
        &mut self,
        local: Ipv4Addr,
        remote: Ipv4Addr,
        alias: Ipv4Addr,
        protocol: u8,
    ) -> Result<LinkId> {
        let id = self.add_link(
            local,
            remote,
            alias,
            0,
            0,
            AliasPort::Fixed(0),
            LinkType::Proto(protocol),
        )?;
        self.make_permanent(id);
        log::info!("redirect proto {} {} <- {}", protocol, local, alias);
        Ok(id)
    }

    /// Remove a redirect, permanent or not
    pub fn delete_redirect(&mut self, id: LinkId) -> Result<()> {
        if !self.table.contains(id) {
            return Err(AliasError::NoSuchLink);
        }
        self.delete_link(id, true);
        Ok(())
    }

    fn make_permanent(&mut self, id: LinkId) {
        if let Some(link) = self.table.get_mut(id) {
            link.flags |= LinkFlags::PERMANENT;
        }
    }

    /// Keep a copy of a fragment that arrived before its header fragment
    pub fn save_fragment(&mut self, packet: &[u8]) -> Status {
        let ip = match IpPacketInfo::parse(packet) {
            Ok(ip) => ip,
            Err(_) => return Status::Ignored,
        };
        match self.add_link(
            Ipv4Addr::UNSPECIFIED,
            ip.src_ip,
            Ipv4Addr::UNSPECIFIED,
            0,
            0,
            AliasPort::Fixed(ip.id),
            LinkType::FragmentPtr,
        ) {
            Ok(id) => {
                if let Some(link) = self.table.get_mut(id) {
                    link.data = LinkData::FragmentPtr(Some(packet[..ip.total_len].to_vec()));
                }
                Status::Ok
            }
            Err(e) => {
                log::warn!("cannot save fragment {} from {}: {}", ip.id, ip.src_ip, e);
                Status::Error
            }
        }
    }

    /// Take back one saved fragment belonging to the datagram of `header`.
    ///
    /// Call repeatedly until `None` after a `FoundHeaderFragment`.
    pub fn get_fragment(&mut self, header: &[u8]) -> Option<Vec<u8>> {
        let ip = IpPacketInfo::parse(header).ok()?;
        let id = self
            .find_link_in(
                ip.src_ip,
                Ipv4Addr::UNSPECIFIED,
                0,
                ip.id,
                LinkType::FragmentPtr,
                false,
            )
            .ok()
            .flatten()?;
        let saved = match self.table.get_mut(id).map(|l| std::mem::take(&mut l.data)) {
            Some(LinkData::FragmentPtr(saved)) => saved,
            _ => None,
        };
        self.expire_now(id);
        saved
    }

    /// Give a saved fragment the destination address of its translated
    /// header fragment
    pub fn fragment_in(&self, header: &[u8], fragment: &mut [u8]) -> Result<()> {
        let ip = IpPacketInfo::parse(header)?;
        let frag = IpPacketInfo::parse(fragment)?;
        if frag.dst_ip != ip.dst_ip {
            let sum = differential_checksum_addr(get_u16(fragment, IP_CHECKSUM), ip.dst_ip, frag.dst_ip);
            put_u16(fragment, IP_CHECKSUM, sum);
            put_addr(fragment, IP_DST, ip.dst_ip);
        }
        Ok(())
    }

    /// Whether the last translation created a link towards the target
    /// address rather than a configured redirect
    pub fn check_new_link(&self) -> bool {
        self.new_default_link
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn link(&self, id: LinkId) -> Option<&Link> {
        self.table.get(id)
    }

    pub fn links(&self) -> impl Iterator<Item = (LinkId, &Link)> {
        self.table.iter()
    }

    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    /// Exact outbound lookup; refreshes the link's timestamp
    pub fn lookup_outbound(
        &mut self,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        link_type: LinkType,
    ) -> Option<LinkId> {
        let id = self.table.find_out(src_addr, dst_addr, src_port, dst_port, link_type)?;
        self.touch(id);
        Some(id)
    }

    /// Inbound lookup through the specificity ladder. With `replace_partial`
    /// a partially specified match is replaced by a fully specified link
    /// that keeps its alias port.
    pub fn lookup_inbound(
        &mut self,
        dst_addr: Ipv4Addr,
        alias_addr: Ipv4Addr,
        dst_port: u16,
        alias_port: u16,
        link_type: LinkType,
        replace_partial: bool,
    ) -> Result<Option<LinkId>> {
        self.find_link_in(dst_addr, alias_addr, dst_port, alias_port, link_type, replace_partial)
    }

    /// Create a link and index it in both directions
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        alias_addr: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        alias_port: AliasPort,
        link_type: LinkType,
    ) -> Result<LinkId> {
        self.add_link(src_addr, dst_addr, alias_addr, src_port, dst_port, alias_port, link_type)
    }

    /// Delete a link unless it is permanent. Returns whether it is gone.
    pub fn remove(&mut self, id: LinkId) -> bool {
        self.delete_link(id, false);
        !self.table.contains(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::internet_checksum;
    use crate::clock::ManualClock;

    const ALIAS: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);

    fn engine() -> PacketAlias {
        let config = AliasConfig::new(ALIAS).with_seed(1);
        PacketAlias::with_clock(config, Box::new(ManualClock::new(1000)))
    }

    fn fragment(src: Ipv4Addr, dst: Ipv4Addr, id: u16, offset: u16) -> Vec<u8> {
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45;
        put_u16(&mut packet, 2, 28);
        put_u16(&mut packet, 4, id);
        put_u16(&mut packet, 6, offset);
        packet[8] = 64;
        packet[9] = 17;
        put_addr(&mut packet, 12, src);
        put_addr(&mut packet, 16, dst);
        let sum = internet_checksum(&packet[..20]);
        put_u16(&mut packet, IP_CHECKSUM, sum);
        packet
    }

    #[test]
    fn test_set_mode_returns_previous() {
        let mut alias = engine();
        let before = alias.mode();
        let old = alias.set_mode(Mode::DENY_INCOMING, Mode::DENY_INCOMING | Mode::SAME_PORTS);
        assert_eq!(old, before);
        assert!(alias.mode().contains(Mode::DENY_INCOMING));
        assert!(!alias.mode().contains(Mode::SAME_PORTS));
        assert!(alias.mode().contains(Mode::RESET_ON_ADDR_CHANGE));
    }

    #[test]
    fn test_address_change_flushes_links() {
        let mut alias = engine();
        alias
            .redirect_address(Ipv4Addr::new(10, 0, 0, 7), Ipv4Addr::new(203, 0, 113, 50))
            .unwrap();
        assert_eq!(alias.table().len(), 1);

        alias.set_default_alias_address(ALIAS);
        assert_eq!(alias.table().len(), 1);

        alias.set_default_alias_address(Ipv4Addr::new(203, 0, 113, 10));
        assert!(alias.table().is_empty());
    }

    #[test]
    fn test_redirect_rejects_icmp() {
        let mut alias = engine();
        let result = alias.redirect_port(
            Ipv4Addr::new(10, 0, 0, 5),
            80,
            Ipv4Addr::UNSPECIFIED,
            0,
            ALIAS,
            8080,
            TransportProtocol::Icmp,
        );
        assert!(matches!(result, Err(AliasError::UnsupportedProtocol(1))));
    }

    #[test]
    fn test_redirect_survives_plain_remove() {
        let mut alias = engine();
        let id = alias
            .redirect_port(
                Ipv4Addr::new(10, 0, 0, 5),
                80,
                Ipv4Addr::UNSPECIFIED,
                0,
                ALIAS,
                8080,
                TransportProtocol::Tcp,
            )
            .unwrap();
        assert!(alias.link(id).unwrap().is_permanent());
        assert!(!alias.remove(id));
        assert!(alias.delete_redirect(id).is_ok());
        assert!(alias.link(id).is_none());
        assert!(matches!(alias.delete_redirect(id), Err(AliasError::NoSuchLink)));
    }

    #[test]
    fn test_fragment_save_and_restore() {
        let mut alias = engine();
        let remote = Ipv4Addr::new(198, 51, 100, 1);
        let early = fragment(remote, ALIAS, 0x4242, 0x0010);
        assert_eq!(alias.save_fragment(&early), Status::Ok);
        assert_eq!(alias.stats().fragment_ptr, 1);

        let mut header = fragment(remote, ALIAS, 0x4242, 0x2000);
        crate::packet::rewrite_dst_addr(&mut header, Ipv4Addr::new(10, 0, 0, 5));

        let mut saved = alias.get_fragment(&header).unwrap();
        assert_eq!(saved, early);
        assert!(alias.get_fragment(&header).is_none());
        assert_eq!(alias.stats().fragment_ptr, 0);

        alias.fragment_in(&header, &mut saved).unwrap();
        let ip = IpPacketInfo::parse(&saved).unwrap();
        assert_eq!(ip.dst_ip, Ipv4Addr::new(10, 0, 0, 5));
        assert_eq!(internet_checksum(&saved[..20]), 0);
    }
}
