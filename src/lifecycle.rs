//! Link lifecycle
//!
//! Creation with alias port allocation, replacement of partially specified
//! links, deletion, incremental garbage collection and the lookup wrappers
//! that the translation code goes through.

use std::net::Ipv4Addr;

use rand::Rng;

use crate::config::Mode;
use crate::engine::PacketAlias;
use crate::error::{AliasError, Result};
use crate::link::{Link, LinkData, LinkFlags, LinkId, LinkType, TcpData, TcpState};
use crate::socket::ReservedSocket;
use crate::table::Specificity;

const ALIAS_PORT_BASE: u16 = 0x8000;
const ALIAS_PORT_MASK: u32 = 0x7fff;

/// Alias port request for a new link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AliasPort {
    /// Search for a free port
    Auto,
    /// Use exactly this port, no collision check
    Fixed(u16),
}

impl PacketAlias {
    /// Expire time for a fresh link of `link_type`
    fn initial_expire(&self, link_type: LinkType) -> u64 {
        let t = &self.timeouts;
        match link_type {
            LinkType::Icmp => t.icmp,
            LinkType::Udp => t.udp,
            LinkType::Tcp => t.tcp_initial,
            LinkType::FragmentId => t.fragment_id,
            LinkType::FragmentPtr => t.fragment_ptr,
            LinkType::StaticAddress => 0,
            LinkType::Pptp | LinkType::Proto(_) => t.proto,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn add_link(
        &mut self,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        alias_addr: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        alias_port: AliasPort,
        link_type: LinkType,
    ) -> Result<LinkId> {
        if self.table.len() >= self.max_links {
            log::warn!("link table full ({} links)", self.table.len());
            return Err(AliasError::TableFull);
        }

        let mut flags = LinkFlags::empty();
        if dst_addr.is_unspecified() {
            flags |= LinkFlags::UNKNOWN_DEST_ADDR;
        }
        if dst_port == 0 {
            flags |= LinkFlags::UNKNOWN_DEST_PORT;
        }

        let data = match link_type {
            LinkType::Tcp => LinkData::Tcp(TcpData::new()),
            LinkType::FragmentPtr => LinkData::FragmentPtr(None),
            LinkType::FragmentId => LinkData::FragmentAddr(Ipv4Addr::UNSPECIFIED),
            _ => LinkData::None,
        };

        let mut link = Link {
            src_addr,
            dst_addr,
            alias_addr,
            src_port,
            dst_port,
            alias_port: 0,
            link_type,
            flags,
            timestamp: self.time_stamp,
            expire_time: self.initial_expire(link_type),
            socket: None,
            data,
        };
        self.get_new_port(&mut link, alias_port)?;

        let has_socket = link.socket.is_some();
        let id = self.table.insert(link);
        self.stats.count(link_type, true);
        if has_socket {
            self.stats.sockets += 1;
        }
        log::debug!(
            "add {:?} link {}:{} -> {}:{} alias {}:{}",
            link_type,
            src_addr,
            src_port,
            dst_addr,
            dst_port,
            alias_addr,
            self.table.get(id).map_or(0, |l| l.alias_port)
        );
        self.show_stats();
        Ok(id)
    }

    /// Pick the alias port of a link that is not in the table yet
    fn get_new_port(&mut self, link: &mut Link, request: AliasPort) -> Result<()> {
        if let AliasPort::Fixed(port) = request {
            link.alias_port = port;
            return Ok(());
        }

        let mut candidate = if self.mode.contains(Mode::SAME_PORTS) {
            link.src_port
        } else {
            self.random_port()
        };

        for _ in 0..self.port_attempts {
            let go_ahead = match self.find_link_in(
                link.dst_addr,
                link.alias_addr,
                link.dst_port,
                candidate,
                link.link_type,
                false,
            )? {
                None => true,
                Some(found) => {
                    !link.is_partially_specified()
                        && self.table.get(found).map_or(false, |l| l.is_partially_specified())
                }
            };

            if go_ahead {
                let wants_socket = self.mode.contains(Mode::USE_SOCKETS)
                    && link.is_partially_specified()
                    && matches!(link.link_type, LinkType::Tcp | LinkType::Udp);
                if !wants_socket {
                    link.alias_port = candidate;
                    return Ok(());
                }
                match ReservedSocket::bind(candidate, link.link_type) {
                    Ok(socket) => {
                        link.alias_port = candidate;
                        link.socket = Some(socket);
                        return Ok(());
                    }
                    Err(e) => log::trace!("alias port {} busy on host: {}", candidate, e),
                }
            }
            candidate = self.random_port();
        }

        log::warn!(
            "no free alias port for {:?} link from {}:{}",
            link.link_type,
            link.src_addr,
            link.src_port
        );
        Err(AliasError::PortExhausted(self.port_attempts))
    }

    fn random_port(&mut self) -> u16 {
        (self.rng.gen::<u32>() & ALIAS_PORT_MASK) as u16 + ALIAS_PORT_BASE
    }

    /// Replace `old` by a new link, then delete `old`.
    ///
    /// The old link stays untouched if the new one cannot be created.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn relink(
        &mut self,
        old: LinkId,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        alias_addr: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        alias_port: AliasPort,
        link_type: LinkType,
    ) -> Result<LinkId> {
        let new = self.add_link(
            src_addr, dst_addr, alias_addr, src_port, dst_port, alias_port, link_type,
        )?;
        self.delete_link(old, false);
        Ok(new)
    }

    /// Unlink and free a link. Permanent links need `force`.
    pub(crate) fn delete_link(&mut self, id: LinkId, force: bool) {
        match self.table.get(id) {
            Some(link) if link.is_permanent() && !force => return,
            Some(_) => {}
            None => return,
        }
        if let Some(link) = self.table.remove(id) {
            self.stats.count(link.link_type, false);
            if link.socket.is_some() {
                self.stats.sockets = self.stats.sockets.saturating_sub(1);
            }
            log::debug!(
                "delete {:?} link {}:{} alias {}:{}",
                link.link_type,
                link.src_addr,
                link.src_port,
                link.alias_addr,
                link.alias_port
            );
            self.show_stats();
        }
    }

    /// Delete now, permanent or not
    pub(crate) fn expire_now(&mut self, id: LinkId) {
        if let Some(link) = self.table.get_mut(id) {
            link.flags.remove(LinkFlags::PERMANENT);
        }
        self.delete_link(id, true);
    }

    fn show_stats(&self) {
        if self.mode.contains(Mode::LOG) {
            let s = &self.stats;
            log::info!(
                "icmp={} udp={} tcp={} pptp={} proto={} frag_id={} frag_ptr={} sockets={} total={}",
                s.icmp,
                s.udp,
                s.tcp,
                s.pptp,
                s.proto,
                s.fragment_id,
                s.fragment_ptr,
                s.sockets,
                self.table.len()
            );
        }
    }

    pub(crate) fn touch(&mut self, id: LinkId) {
        let now = self.time_stamp;
        if let Some(link) = self.table.get_mut(id) {
            link.timestamp = now;
        }
    }

    /// Advance the clock and sweep the share of outbound buckets due since
    /// the last call
    pub fn housekeeping(&mut self) {
        let now = self.clock.now_secs();
        self.housekeeping_at(now);
    }

    pub(crate) fn housekeeping_at(&mut self, now: u64) {
        self.time_stamp = now;
        if now < self.last_cleanup {
            log::warn!("clock went backwards ({} < {})", now, self.last_cleanup);
            self.last_cleanup = now;
            self.cleanup_residual = 0;
            return;
        }

        let elapsed = now - self.last_cleanup;
        let n100 = (self.table.out_bucket_count() as u64 * 100 + self.cleanup_residual)
            .saturating_mul(elapsed)
            / self.cleanup_interval;
        let mut spokes = n100 / 100;

        if spokes > self.cleanup_max_spokes as u64 {
            spokes = self.cleanup_max_spokes as u64;
            self.last_cleanup = now;
            self.cleanup_residual = 0;
        } else if spokes > 0 {
            self.last_cleanup = now;
            self.cleanup_residual = n100 - 100 * spokes;
        }
        for _ in 0..spokes {
            self.incremental_cleanup();
        }
    }

    /// Reap expired links in the next outbound bucket
    pub fn incremental_cleanup(&mut self) {
        let count = self.table.out_bucket_count();
        let index = self.cleanup_cursor % count;
        self.cleanup_cursor = (index + 1) % count;

        let now = self.time_stamp;
        let expired: Vec<LinkId> = self
            .table
            .out_bucket(index)
            .iter()
            .copied()
            .filter(|&id| self.table.get(id).map_or(false, |l| l.is_expired(now)))
            .collect();
        for id in expired {
            self.delete_link(id, false);
        }
    }

    /// Delete every link, permanent ones included
    pub fn cleanup_all(&mut self) {
        for id in self.table.ids() {
            self.delete_link(id, true);
        }
        self.cleanup_cursor = 0;
    }

    /// Outbound lookup with default-address fallback and, when
    /// `replace_partial` is set, adoption of a partial link
    pub(crate) fn find_link_out(
        &mut self,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        link_type: LinkType,
        replace_partial: bool,
    ) -> Result<Option<LinkId>> {
        let found = self.find_link_out_exact(src_addr, dst_addr, src_port, dst_port, link_type, replace_partial)?;
        if found.is_some() {
            return Ok(found);
        }
        if !self.alias_address.is_unspecified() && src_addr == self.alias_address {
            return self.find_link_out_exact(
                Ipv4Addr::UNSPECIFIED,
                dst_addr,
                src_port,
                dst_port,
                link_type,
                replace_partial,
            );
        }
        Ok(None)
    }

    fn find_link_out_exact(
        &mut self,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        link_type: LinkType,
        replace_partial: bool,
    ) -> Result<Option<LinkId>> {
        if let Some(id) = self.lookup_outbound(src_addr, dst_addr, src_port, dst_port, link_type) {
            return Ok(Some(id));
        }
        if !replace_partial || dst_port == 0 || dst_addr.is_unspecified() {
            return Ok(None);
        }

        let partial = self
            .table
            .find_out(src_addr, dst_addr, src_port, 0, link_type)
            .or_else(|| {
                self.table
                    .find_out(src_addr, Ipv4Addr::UNSPECIFIED, src_port, dst_port, link_type)
            });
        let Some(old) = partial else {
            return Ok(None);
        };
        let (alias_addr, alias_port) = match self.table.get(old) {
            Some(l) => (l.alias_addr, l.alias_port),
            None => return Ok(None),
        };
        self.relink(
            old,
            src_addr,
            dst_addr,
            alias_addr,
            src_port,
            dst_port,
            AliasPort::Fixed(alias_port),
            link_type,
        )
        .map(Some)
    }

    /// Inbound lookup with default-address fallback
    pub(crate) fn find_link_in(
        &mut self,
        dst_addr: Ipv4Addr,
        alias_addr: Ipv4Addr,
        dst_port: u16,
        alias_port: u16,
        link_type: LinkType,
        replace_partial: bool,
    ) -> Result<Option<LinkId>> {
        let found = self.find_link_in_exact(dst_addr, alias_addr, dst_port, alias_port, link_type, replace_partial)?;
        if found.is_some() {
            return Ok(found);
        }
        if !self.alias_address.is_unspecified() && alias_addr == self.alias_address {
            return self.find_link_in_exact(
                dst_addr,
                Ipv4Addr::UNSPECIFIED,
                dst_port,
                alias_port,
                link_type,
                replace_partial,
            );
        }
        Ok(None)
    }

    fn find_link_in_exact(
        &mut self,
        dst_addr: Ipv4Addr,
        alias_addr: Ipv4Addr,
        dst_port: u16,
        alias_port: u16,
        link_type: LinkType,
        replace_partial: bool,
    ) -> Result<Option<LinkId>> {
        let Some(found) = self.table.find_in(dst_addr, alias_addr, dst_port, alias_port, link_type) else {
            return Ok(None);
        };
        if found.specificity == Specificity::Exact {
            self.touch(found.id);
        }

        let partial = self
            .table
            .get(found.id)
            .map_or(false, |l| l.is_partially_specified());
        if !replace_partial || !partial {
            return Ok(Some(found.id));
        }

        let (src_addr, src_port) = match self.table.get(found.id) {
            Some(l) => (l.src_addr, l.src_port),
            None => return Ok(None),
        };
        self.relink(
            found.id,
            src_addr,
            dst_addr,
            alias_addr,
            src_port,
            dst_port,
            AliasPort::Fixed(alias_port),
            link_type,
        )
        .map(Some)
    }

    /// Alias address for traffic from `original`
    pub(crate) fn find_alias_address(&mut self, original: Ipv4Addr) -> Ipv4Addr {
        let fallback = if self.alias_address.is_unspecified() {
            original
        } else {
            self.alias_address
        };
        let found = self
            .table
            .find_out(original, Ipv4Addr::UNSPECIFIED, 0, 0, LinkType::StaticAddress);
        match found.and_then(|id| self.table.get(id)) {
            Some(link) if !link.alias_addr.is_unspecified() => link.alias_addr,
            _ => fallback,
        }
    }

    /// Internal host for an unmatched inbound flow to `alias`
    pub(crate) fn find_original_address(&mut self, alias: Ipv4Addr) -> Ipv4Addr {
        let default_or_alias = if self.alias_address.is_unspecified() {
            alias
        } else {
            self.alias_address
        };
        let found = self
            .find_link_in(Ipv4Addr::UNSPECIFIED, alias, 0, 0, LinkType::StaticAddress, false)
            .ok()
            .flatten();
        match found.and_then(|id| self.table.get(id)) {
            Some(link) if link.src_addr.is_unspecified() => default_or_alias,
            Some(link) => link.src_addr,
            None => {
                self.new_default_link = true;
                if self.target_address.is_unspecified() {
                    alias
                } else if self.target_address == Ipv4Addr::BROADCAST {
                    default_or_alias
                } else {
                    self.target_address
                }
            }
        }
    }

    /// Address the link presents on the outside
    pub(crate) fn alias_address_of(&self, id: LinkId) -> Ipv4Addr {
        match self.table.get(id) {
            Some(l) if !l.alias_addr.is_unspecified() => l.alias_addr,
            _ => self.alias_address,
        }
    }

    /// Internal address the link delivers to
    pub(crate) fn original_address_of(&self, id: LinkId) -> Ipv4Addr {
        match self.table.get(id) {
            Some(l) if !l.src_addr.is_unspecified() => l.src_addr,
            _ => self.alias_address,
        }
    }

    pub(crate) fn find_udp_tcp_out(
        &mut self,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        link_type: LinkType,
        create: bool,
    ) -> Result<Option<LinkId>> {
        if let Some(id) = self.find_link_out(src_addr, dst_addr, src_port, dst_port, link_type, create)? {
            return Ok(Some(id));
        }
        if !create {
            return Ok(None);
        }
        let alias_addr = self.find_alias_address(src_addr);
        self.add_link(
            src_addr,
            dst_addr,
            alias_addr,
            src_port,
            dst_port,
            AliasPort::Auto,
            link_type,
        )
        .map(Some)
    }

    pub(crate) fn find_udp_tcp_in(
        &mut self,
        dst_addr: Ipv4Addr,
        alias_addr: Ipv4Addr,
        dst_port: u16,
        alias_port: u16,
        link_type: LinkType,
        create: bool,
    ) -> Result<Option<LinkId>> {
        if let Some(id) = self.find_link_in(dst_addr, alias_addr, dst_port, alias_port, link_type, create)? {
            return Ok(Some(id));
        }
        if !create || self.mode.contains(Mode::DENY_INCOMING) {
            return Ok(None);
        }
        let target = self.find_original_address(alias_addr);
        self.add_link(
            target,
            dst_addr,
            alias_addr,
            alias_port,
            dst_port,
            AliasPort::Fixed(alias_port),
            link_type,
        )
        .map(Some)
    }

    pub(crate) fn find_icmp_out(
        &mut self,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        id: u16,
        create: bool,
    ) -> Result<Option<LinkId>> {
        if let Some(link) = self.find_link_out(src_addr, dst_addr, id, 0, LinkType::Icmp, false)? {
            return Ok(Some(link));
        }
        if !create {
            return Ok(None);
        }
        let alias_addr = self.find_alias_address(src_addr);
        self.add_link(src_addr, dst_addr, alias_addr, id, 0, AliasPort::Auto, LinkType::Icmp)
            .map(Some)
    }

    pub(crate) fn find_icmp_in(
        &mut self,
        dst_addr: Ipv4Addr,
        alias_addr: Ipv4Addr,
        alias_id: u16,
        create: bool,
    ) -> Result<Option<LinkId>> {
        if let Some(link) = self.find_link_in(dst_addr, alias_addr, 0, alias_id, LinkType::Icmp, false)? {
            return Ok(Some(link));
        }
        if !create || self.mode.contains(Mode::DENY_INCOMING) {
            return Ok(None);
        }
        let target = self.find_original_address(alias_addr);
        self.add_link(
            target,
            dst_addr,
            alias_addr,
            alias_id,
            0,
            AliasPort::Fixed(alias_id),
            LinkType::Icmp,
        )
        .map(Some)
    }

    pub(crate) fn find_proto_out(
        &mut self,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        protocol: u8,
        create: bool,
    ) -> Result<Option<LinkId>> {
        let link_type = LinkType::Proto(protocol);
        if let Some(id) = self.find_link_out(src_addr, dst_addr, 0, 0, link_type, false)? {
            return Ok(Some(id));
        }
        if !create {
            return Ok(None);
        }
        let alias_addr = self.find_alias_address(src_addr);
        self.add_link(src_addr, dst_addr, alias_addr, 0, 0, AliasPort::Fixed(0), link_type)
            .map(Some)
    }

    pub(crate) fn find_proto_in(
        &mut self,
        dst_addr: Ipv4Addr,
        alias_addr: Ipv4Addr,
        protocol: u8,
    ) -> Result<Option<LinkId>> {
        let link_type = LinkType::Proto(protocol);
        if let Some(id) = self.find_link_in(dst_addr, alias_addr, 0, 0, link_type, false)? {
            return Ok(Some(id));
        }
        if self.mode.contains(Mode::DENY_INCOMING) {
            return Ok(None);
        }
        let target = self.find_original_address(alias_addr);
        self.add_link(target, dst_addr, alias_addr, 0, 0, AliasPort::Fixed(0), link_type)
            .map(Some)
    }

    /// Header fragment record, created on first sight
    pub(crate) fn find_fragment_in1(
        &mut self,
        dst_addr: Ipv4Addr,
        alias_addr: Ipv4Addr,
        ip_id: u16,
    ) -> Result<LinkId> {
        if let Some(id) = self.find_link_in(dst_addr, alias_addr, 0, ip_id, LinkType::FragmentId, false)? {
            return Ok(id);
        }
        self.add_link(
            Ipv4Addr::UNSPECIFIED,
            dst_addr,
            alias_addr,
            0,
            0,
            AliasPort::Fixed(ip_id),
            LinkType::FragmentId,
        )
    }

    pub(crate) fn find_fragment_in2(
        &mut self,
        dst_addr: Ipv4Addr,
        alias_addr: Ipv4Addr,
        ip_id: u16,
    ) -> Result<Option<LinkId>> {
        self.find_link_in(dst_addr, alias_addr, 0, ip_id, LinkType::FragmentId, false)
    }

    /// Apply an inbound TCP state transition and its expire time
    pub(crate) fn set_state_in(&mut self, id: LinkId, state: TcpState) {
        let t = self.timeouts;
        if let Some(link) = self.table.get_mut(id) {
            let Some(out) = link.tcp().map(|tcp| tcp.state_out) else {
                return;
            };
            link.expire_time = tcp_expire(state, out, link.expire_time, &t);
            if let Some(tcp) = link.tcp_mut() {
                tcp.state_in = state;
            }
        }
    }

    pub(crate) fn set_state_out(&mut self, id: LinkId, state: TcpState) {
        let t = self.timeouts;
        if let Some(link) = self.table.get_mut(id) {
            let Some(inb) = link.tcp().map(|tcp| tcp.state_in) else {
                return;
            };
            link.expire_time = tcp_expire(state, inb, link.expire_time, &t);
            if let Some(tcp) = link.tcp_mut() {
                tcp.state_out = state;
            }
        }
    }
}

fn tcp_expire(state: TcpState, other: TcpState, current: u64, t: &crate::config::Timeouts) -> u64 {
    match state {
        TcpState::Disconnected if other != TcpState::Connected => t.tcp_dead,
        TcpState::Disconnected => t.tcp_single_dead,
        TcpState::Connected if other == TcpState::Connected => t.tcp_connected,
        _ => current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{AliasConfig, Timeouts};

    const ALIAS: Ipv4Addr = Ipv4Addr::new(203, 0, 113, 9);
    const HOST: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 5);
    const REMOTE: Ipv4Addr = Ipv4Addr::new(198, 51, 100, 1);

    fn engine_with(config: AliasConfig) -> (PacketAlias, ManualClock) {
        let clock = ManualClock::new(1000);
        let alias = PacketAlias::with_clock(config, Box::new(clock.clone()));
        (alias, clock)
    }

    fn engine() -> (PacketAlias, ManualClock) {
        engine_with(AliasConfig::new(ALIAS).with_seed(42))
    }

    #[test]
    fn test_same_ports_preferred() {
        let (mut alias, _) = engine();
        let id = alias
            .find_udp_tcp_out(HOST, REMOTE, 5000, 53, LinkType::Udp, true)
            .unwrap()
            .unwrap();
        assert_eq!(alias.link(id).unwrap().alias_port(), 5000);

        // A second host using the same source port gets a different alias port
        let other = alias
            .find_udp_tcp_out(Ipv4Addr::new(10, 0, 0, 6), REMOTE, 5000, 53, LinkType::Udp, true)
            .unwrap()
            .unwrap();
        let port = alias.link(other).unwrap().alias_port();
        assert_ne!(port, 5000);
        assert!(port >= ALIAS_PORT_BASE);
        assert!(alias.table().verify_indices());
    }

    #[test]
    fn test_random_ports_without_same_ports() {
        let config = AliasConfig::new(ALIAS).with_seed(3).with_mode(Mode::empty());
        let (mut alias, _) = engine_with(config);
        let id = alias
            .find_udp_tcp_out(HOST, REMOTE, 5000, 53, LinkType::Udp, true)
            .unwrap()
            .unwrap();
        assert!(alias.link(id).unwrap().alias_port() >= ALIAS_PORT_BASE);
    }

    #[test]
    fn test_port_exhaustion() {
        let mut config = AliasConfig::new(ALIAS).with_seed(5);
        config.port_attempts = 1;
        let (mut alias, _) = engine_with(config);
        alias
            .add_link(HOST, REMOTE, ALIAS, 7000, 53, AliasPort::Fixed(7000), LinkType::Udp)
            .unwrap();
        let result = alias.add_link(
            Ipv4Addr::new(10, 0, 0, 6),
            REMOTE,
            ALIAS,
            7000,
            53,
            AliasPort::Auto,
            LinkType::Udp,
        );
        assert!(matches!(result, Err(AliasError::PortExhausted(1))));
        assert_eq!(alias.table().len(), 1);
    }

    #[test]
    fn test_table_full() {
        let mut config = AliasConfig::new(ALIAS).with_seed(5);
        config.max_links = 1;
        let (mut alias, _) = engine_with(config);
        alias
            .find_udp_tcp_out(HOST, REMOTE, 5000, 53, LinkType::Udp, true)
            .unwrap();
        let result = alias.find_udp_tcp_out(HOST, REMOTE, 5001, 53, LinkType::Udp, true);
        assert!(matches!(result, Err(AliasError::TableFull)));
    }

    #[test]
    fn test_inbound_replaces_partial_link() {
        let (mut alias, _) = engine();
        let template = alias
            .add_link(HOST, Ipv4Addr::UNSPECIFIED, ALIAS, 80, 0, AliasPort::Fixed(8080), LinkType::Tcp)
            .unwrap();

        let id = alias
            .find_udp_tcp_in(REMOTE, ALIAS, 3333, 8080, LinkType::Tcp, true)
            .unwrap()
            .unwrap();
        assert_ne!(id, template);
        assert!(alias.link(template).is_none());
        let link = alias.link(id).unwrap();
        assert_eq!(link.alias_port(), 8080);
        assert_eq!(link.src_addr(), HOST);
        assert_eq!(link.src_port(), 80);
        assert_eq!(link.dst_addr(), REMOTE);
        assert_eq!(link.dst_port(), 3333);
        assert!(!link.is_partially_specified());
        assert!(alias.table().verify_indices());
    }

    #[test]
    fn test_outbound_adopts_partial_link() {
        let (mut alias, _) = engine();
        let partial = alias
            .add_link(HOST, REMOTE, ALIAS, 4000, 0, AliasPort::Fixed(40000), LinkType::Tcp)
            .unwrap();
        let id = alias
            .find_udp_tcp_out(HOST, REMOTE, 4000, 20, LinkType::Tcp, true)
            .unwrap()
            .unwrap();
        assert_ne!(id, partial);
        assert_eq!(alias.link(id).unwrap().alias_port(), 40000);
        assert_eq!(alias.table().len(), 1);
    }

    #[test]
    fn test_default_address_fallback() {
        let (mut alias, _) = engine();
        // Redirect bound to whatever the default alias address is
        alias
            .add_link(
                HOST,
                Ipv4Addr::UNSPECIFIED,
                Ipv4Addr::UNSPECIFIED,
                22,
                0,
                AliasPort::Fixed(2222),
                LinkType::Tcp,
            )
            .unwrap();
        let found = alias
            .find_link_in(REMOTE, ALIAS, 5555, 2222, LinkType::Tcp, false)
            .unwrap();
        assert!(found.is_some());
    }

    #[test]
    fn test_original_address_resolution() {
        let (mut alias, _) = engine();
        assert_eq!(alias.find_original_address(ALIAS), ALIAS);
        assert!(alias.check_new_link());

        alias.set_target_address(Ipv4Addr::BROADCAST);
        assert_eq!(alias.find_original_address(Ipv4Addr::new(203, 0, 113, 77)), ALIAS);

        alias.set_target_address(Ipv4Addr::new(10, 0, 0, 99));
        assert_eq!(alias.find_original_address(ALIAS), Ipv4Addr::new(10, 0, 0, 99));

        let static_alias = Ipv4Addr::new(203, 0, 113, 50);
        alias.redirect_address(HOST, static_alias).unwrap();
        assert_eq!(alias.find_original_address(static_alias), HOST);
        assert_eq!(alias.find_alias_address(HOST), static_alias);
        assert_eq!(alias.find_alias_address(Ipv4Addr::new(10, 0, 0, 6)), ALIAS);
    }

    #[test]
    fn test_expiration_sweep() {
        let timeouts = Timeouts {
            udp: 30,
            ..Timeouts::default()
        };
        let (mut alias, clock) = engine_with(AliasConfig::new(ALIAS).with_seed(1).with_timeouts(timeouts));
        let id = alias
            .find_udp_tcp_out(HOST, REMOTE, 5000, 53, LinkType::Udp, true)
            .unwrap()
            .unwrap();

        clock.advance(30);
        alias.housekeeping();
        for _ in 0..alias.table().out_bucket_count() {
            alias.incremental_cleanup();
        }
        assert!(alias.link(id).is_some());

        clock.advance(1);
        alias.housekeeping();
        for _ in 0..alias.table().out_bucket_count() {
            alias.incremental_cleanup();
        }
        assert!(alias.link(id).is_none());
        assert!(alias.table().verify_indices());
    }

    #[test]
    fn test_housekeeping_spoke_budget() {
        let (mut alias, clock) = engine();
        // 101 buckets over 60s: one second covers one spoke and some residual
        clock.advance(1);
        alias.housekeeping();
        assert_eq!(alias.cleanup_cursor, 1);
        assert_eq!(alias.cleanup_residual, 68);

        // A long pause is capped at the spoke limit
        clock.advance(3600);
        alias.housekeeping();
        assert_eq!(alias.cleanup_cursor, 31);
        assert_eq!(alias.cleanup_residual, 0);
    }

    #[test]
    fn test_permanent_links_survive_sweep() {
        let (mut alias, clock) = engine();
        let id = alias.redirect_address(HOST, Ipv4Addr::new(203, 0, 113, 50)).unwrap();
        clock.advance(10_000);
        alias.housekeeping();
        for _ in 0..alias.table().out_bucket_count() {
            alias.incremental_cleanup();
        }
        assert!(alias.link(id).is_some());
        alias.cleanup_all();
        assert!(alias.table().is_empty());
    }

    #[test]
    fn test_tcp_state_expire_times() {
        let (mut alias, _) = engine();
        let id = alias
            .find_udp_tcp_out(HOST, REMOTE, 4000, 80, LinkType::Tcp, true)
            .unwrap()
            .unwrap();
        let t = Timeouts::default();
        assert_eq!(alias.link(id).unwrap().expire_time(), t.tcp_initial);

        alias.set_state_out(id, TcpState::Connected);
        assert_eq!(alias.link(id).unwrap().expire_time(), t.tcp_initial);
        alias.set_state_in(id, TcpState::Connected);
        assert_eq!(alias.link(id).unwrap().expire_time(), t.tcp_connected);

        alias.set_state_out(id, TcpState::Disconnected);
        assert_eq!(alias.link(id).unwrap().expire_time(), t.tcp_single_dead);
        alias.set_state_in(id, TcpState::Disconnected);
        assert_eq!(alias.link(id).unwrap().expire_time(), t.tcp_dead);
    }

    #[test]
    fn test_stats_track_types() {
        let (mut alias, _) = engine();
        alias.find_icmp_out(HOST, REMOTE, 77, true).unwrap();
        alias
            .find_udp_tcp_out(HOST, REMOTE, 5000, 53, LinkType::Udp, true)
            .unwrap();
        alias.find_proto_out(HOST, REMOTE, 50, true).unwrap();
        let stats = alias.stats();
        assert_eq!(stats.icmp, 1);
        assert_eq!(stats.udp, 1);
        assert_eq!(stats.proto, 1);
        assert_eq!(stats.tcp, 0);
    }
}
