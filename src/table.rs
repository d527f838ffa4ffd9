//! Flow table
//!
//! Links live in a slot arena. Two bucket arrays index them: the outbound
//! buckets hash the full outbound tuple, the inbound buckets hash only
//! `(alias_addr, alias_port, type)` so that partially specified links share
//! a bucket with the fully specified lookups that may match them. PPTP links
//! leave ports out of both hashes, since call IDs are searched on either side.
//! The newest link in a bucket is scanned first.

use std::net::Ipv4Addr;

use slotmap::SlotMap;

use crate::link::{Link, LinkFlags, LinkId, LinkType};

/// How closely an inbound lookup matched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Specificity {
    Exact,
    UnknownDestPort,
    UnknownDestAddr,
    UnknownAll,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundMatch {
    pub id: LinkId,
    pub specificity: Specificity,
}

pub struct FlowTable {
    links: SlotMap<LinkId, Link>,
    out_buckets: Vec<Vec<LinkId>>,
    in_buckets: Vec<Vec<LinkId>>,
}

impl FlowTable {
    pub fn new(out_size: usize, in_size: usize) -> Self {
        Self {
            links: SlotMap::with_key(),
            out_buckets: vec![Vec::new(); out_size.max(1)],
            in_buckets: vec![Vec::new(); in_size.max(1)],
        }
    }

    pub fn out_index(
        &self,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        link_type: LinkType,
    ) -> usize {
        let mut n = u32::from(src_addr) as u64 + u32::from(dst_addr) as u64;
        if link_type != LinkType::Pptp {
            n += src_port as u64 + dst_port as u64;
        }
        n += link_type.code() as u64;
        (n % self.out_buckets.len() as u64) as usize
    }

    pub fn in_index(&self, alias_addr: Ipv4Addr, alias_port: u16, link_type: LinkType) -> usize {
        let mut n = u32::from(alias_addr) as u64;
        if link_type != LinkType::Pptp {
            n += alias_port as u64;
        }
        n += link_type.code() as u64;
        (n % self.in_buckets.len() as u64) as usize
    }

    fn link_out_index(&self, link: &Link) -> usize {
        self.out_index(
            link.src_addr,
            link.dst_addr,
            link.src_port,
            link.dst_port,
            link.link_type,
        )
    }

    fn link_in_index(&self, link: &Link) -> usize {
        self.in_index(link.alias_addr, link.alias_port, link.link_type)
    }

    /// Store a link and anchor it in both indices
    pub fn insert(&mut self, link: Link) -> LinkId {
        let out = self.link_out_index(&link);
        let inb = self.link_in_index(&link);
        let id = self.links.insert(link);
        self.out_buckets[out].push(id);
        self.in_buckets[inb].push(id);
        id
    }

    /// Unlink from both indices and hand the link back
    pub fn remove(&mut self, id: LinkId) -> Option<Link> {
        let link = self.links.remove(id)?;
        let out = self.link_out_index(&link);
        let inb = self.link_in_index(&link);
        self.out_buckets[out].retain(|&k| k != id);
        self.in_buckets[inb].retain(|&k| k != id);
        Some(link)
    }

    pub fn get(&self, id: LinkId) -> Option<&Link> {
        self.links.get(id)
    }

    pub fn get_mut(&mut self, id: LinkId) -> Option<&mut Link> {
        self.links.get_mut(id)
    }

    pub fn contains(&self, id: LinkId) -> bool {
        self.links.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (LinkId, &Link)> {
        self.links.iter()
    }

    pub fn ids(&self) -> Vec<LinkId> {
        self.links.keys().collect()
    }

    pub fn out_bucket_count(&self) -> usize {
        self.out_buckets.len()
    }

    pub fn out_bucket(&self, index: usize) -> &[LinkId] {
        &self.out_buckets[index]
    }

    fn scan_out<'a>(&'a self, index: usize) -> impl Iterator<Item = (LinkId, &'a Link)> + 'a {
        self.out_buckets[index]
            .iter()
            .rev()
            .filter_map(move |&id| self.links.get(id).map(|l| (id, l)))
    }

    fn scan_in<'a>(&'a self, index: usize) -> impl Iterator<Item = (LinkId, &'a Link)> + 'a {
        self.in_buckets[index]
            .iter()
            .rev()
            .filter_map(move |&id| self.links.get(id).map(|l| (id, l)))
    }

    /// Exact outbound match
    pub fn find_out(
        &self,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        link_type: LinkType,
    ) -> Option<LinkId> {
        let index = self.out_index(src_addr, dst_addr, src_port, dst_port, link_type);
        self.scan_out(index)
            .find(|(_, l)| {
                l.link_type == link_type
                    && l.src_addr == src_addr
                    && l.dst_addr == dst_addr
                    && l.src_port == src_port
                    && l.dst_port == dst_port
            })
            .map(|(id, _)| id)
    }

    /// Inbound match, most specific first.
    ///
    /// A zero `dst_addr` or `dst_port` in the query acts as a wildcard the
    /// same way the unknown flags of a stored link do.
    pub fn find_in(
        &self,
        dst_addr: Ipv4Addr,
        alias_addr: Ipv4Addr,
        dst_port: u16,
        alias_port: u16,
        link_type: LinkType,
    ) -> Option<InboundMatch> {
        let mut query_flags = LinkFlags::empty();
        if dst_addr.is_unspecified() {
            query_flags |= LinkFlags::UNKNOWN_DEST_ADDR;
        }
        if dst_port == 0 {
            query_flags |= LinkFlags::UNKNOWN_DEST_PORT;
        }

        let mut unknown_port = None;
        let mut unknown_addr = None;
        let mut unknown_all = None;

        let index = self.in_index(alias_addr, alias_port, link_type);
        for (id, l) in self.scan_in(index) {
            if l.alias_addr != alias_addr || l.alias_port != alias_port || l.link_type != link_type {
                continue;
            }
            let flags = (query_flags | l.flags) & LinkFlags::PARTIALLY_SPECIFIED;
            if flags.is_empty() {
                if l.dst_addr == dst_addr && l.dst_port == dst_port {
                    return Some(InboundMatch {
                        id,
                        specificity: Specificity::Exact,
                    });
                }
            } else if flags == LinkFlags::UNKNOWN_DEST_PORT {
                if l.dst_addr == dst_addr && unknown_port.is_none() {
                    unknown_port = Some(id);
                }
            } else if flags == LinkFlags::UNKNOWN_DEST_ADDR {
                if l.dst_port == dst_port && unknown_addr.is_none() {
                    unknown_addr = Some(id);
                }
            } else if unknown_all.is_none() {
                unknown_all = Some(id);
            }
        }

        let best = unknown_port
            .map(|id| (id, Specificity::UnknownDestPort))
            .or_else(|| unknown_addr.map(|id| (id, Specificity::UnknownDestAddr)))
            .or_else(|| unknown_all.map(|id| (id, Specificity::UnknownAll)));
        best.map(|(id, specificity)| InboundMatch { id, specificity })
    }

    /// PPTP link by the internal host's own call ID
    pub fn find_pptp_out_by_call_id(
        &self,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        call_id: u16,
    ) -> Option<LinkId> {
        let index = self.out_index(src_addr, dst_addr, 0, 0, LinkType::Pptp);
        self.scan_out(index)
            .find(|(_, l)| {
                l.link_type == LinkType::Pptp
                    && l.src_addr == src_addr
                    && l.dst_addr == dst_addr
                    && l.src_port == call_id
            })
            .map(|(id, _)| id)
    }

    /// PPTP link by the peer's call ID
    pub fn find_pptp_out_by_peer_call_id(
        &self,
        src_addr: Ipv4Addr,
        dst_addr: Ipv4Addr,
        peer_call_id: u16,
    ) -> Option<LinkId> {
        let index = self.out_index(src_addr, dst_addr, 0, 0, LinkType::Pptp);
        self.scan_out(index)
            .find(|(_, l)| {
                l.link_type == LinkType::Pptp
                    && l.src_addr == src_addr
                    && l.dst_addr == dst_addr
                    && !l.flags.contains(LinkFlags::UNKNOWN_DEST_PORT)
                    && l.dst_port == peer_call_id
            })
            .map(|(id, _)| id)
    }

    /// PPTP link seen from outside, by the peer's call ID
    pub fn find_pptp_in_by_call_id(
        &self,
        dst_addr: Ipv4Addr,
        alias_addr: Ipv4Addr,
        peer_call_id: u16,
    ) -> Option<LinkId> {
        let index = self.in_index(alias_addr, 0, LinkType::Pptp);
        self.scan_in(index)
            .find(|(_, l)| {
                l.link_type == LinkType::Pptp
                    && l.dst_addr == dst_addr
                    && l.alias_addr == alias_addr
                    && !l.flags.contains(LinkFlags::UNKNOWN_DEST_PORT)
                    && l.dst_port == peer_call_id
            })
            .map(|(id, _)| id)
    }

    /// Record the peer's call ID of a PPTP link.
    ///
    /// PPTP hashes do not cover ports, so the link stays in its buckets.
    pub fn set_pptp_peer_call_id(&mut self, id: LinkId, peer_call_id: u16) {
        if let Some(link) = self.links.get_mut(id) {
            link.dst_port = peer_call_id;
            link.flags.remove(LinkFlags::UNKNOWN_DEST_PORT);
        }
    }

    /// Every live link sits in exactly one outbound and one inbound bucket,
    /// each the one its key hashes to, and no bucket holds a dead handle.
    pub fn verify_indices(&self) -> bool {
        let out_total: usize = self.out_buckets.iter().map(Vec::len).sum();
        let in_total: usize = self.in_buckets.iter().map(Vec::len).sum();
        if out_total != self.links.len() || in_total != self.links.len() {
            return false;
        }
        self.links.iter().all(|(id, link)| {
            let out = &self.out_buckets[self.link_out_index(link)];
            let inb = &self.in_buckets[self.link_in_index(link)];
            out.iter().filter(|&&k| k == id).count() == 1
                && inb.iter().filter(|&&k| k == id).count() == 1
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkData;

    fn addr(d: u8) -> Ipv4Addr {
        Ipv4Addr::new(10, 0, 0, d)
    }

    fn make_link(
        src: Ipv4Addr,
        dst: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        alias_port: u16,
        link_type: LinkType,
    ) -> Link {
        let mut flags = LinkFlags::empty();
        if dst.is_unspecified() {
            flags |= LinkFlags::UNKNOWN_DEST_ADDR;
        }
        if dst_port == 0 {
            flags |= LinkFlags::UNKNOWN_DEST_PORT;
        }
        Link {
            src_addr: src,
            dst_addr: dst,
            alias_addr: Ipv4Addr::new(203, 0, 113, 9),
            src_port,
            dst_port,
            alias_port,
            link_type,
            flags,
            timestamp: 0,
            expire_time: 60,
            socket: None,
            data: LinkData::None,
        }
    }

    #[test]
    fn test_insert_and_find_out() {
        let mut table = FlowTable::new(101, 4001);
        let id = table.insert(make_link(addr(5), addr(200), 5000, 53, 40000, LinkType::Udp));

        assert_eq!(table.find_out(addr(5), addr(200), 5000, 53, LinkType::Udp), Some(id));
        assert_eq!(table.find_out(addr(5), addr(200), 5000, 53, LinkType::Tcp), None);
        assert_eq!(table.find_out(addr(5), addr(200), 5001, 53, LinkType::Udp), None);
        assert!(table.verify_indices());
    }

    #[test]
    fn test_remove_unlinks_both_indices() {
        let mut table = FlowTable::new(7, 11);
        let a = table.insert(make_link(addr(5), addr(200), 5000, 53, 40000, LinkType::Udp));
        let b = table.insert(make_link(addr(6), addr(200), 5000, 53, 40001, LinkType::Udp));
        assert_eq!(table.len(), 2);

        assert!(table.remove(a).is_some());
        assert!(table.remove(a).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.contains(b));
        assert!(table.verify_indices());
    }

    #[test]
    fn test_find_in_specificity_ladder() {
        let mut table = FlowTable::new(101, 4001);
        let remote = Ipv4Addr::new(198, 51, 100, 1);
        let alias = Ipv4Addr::new(203, 0, 113, 9);

        let all = table.insert(make_link(
            addr(5),
            Ipv4Addr::UNSPECIFIED,
            80,
            0,
            8080,
            LinkType::Tcp,
        ));
        let m = table.find_in(remote, alias, 3333, 8080, LinkType::Tcp).unwrap();
        assert_eq!(m.id, all);
        assert_eq!(m.specificity, Specificity::UnknownAll);

        let addr_only = table.insert(make_link(
            addr(5),
            Ipv4Addr::UNSPECIFIED,
            80,
            3333,
            8080,
            LinkType::Tcp,
        ));
        let m = table.find_in(remote, alias, 3333, 8080, LinkType::Tcp).unwrap();
        assert_eq!(m.id, addr_only);
        assert_eq!(m.specificity, Specificity::UnknownDestAddr);

        let port_only = table.insert(make_link(addr(5), remote, 80, 0, 8080, LinkType::Tcp));
        let m = table.find_in(remote, alias, 3333, 8080, LinkType::Tcp).unwrap();
        assert_eq!(m.id, port_only);
        assert_eq!(m.specificity, Specificity::UnknownDestPort);

        let exact = table.insert(make_link(addr(5), remote, 80, 3333, 8080, LinkType::Tcp));
        let m = table.find_in(remote, alias, 3333, 8080, LinkType::Tcp).unwrap();
        assert_eq!(m.id, exact);
        assert_eq!(m.specificity, Specificity::Exact);

        assert!(table.find_in(remote, alias, 3333, 8081, LinkType::Tcp).is_none());
        assert!(table.verify_indices());
    }

    #[test]
    fn test_wildcard_query_matches_specific_link() {
        let mut table = FlowTable::new(101, 4001);
        let remote = Ipv4Addr::new(198, 51, 100, 1);
        let alias = Ipv4Addr::new(203, 0, 113, 9);
        let id = table.insert(make_link(addr(5), remote, 4000, 21, 4000, LinkType::Tcp));

        let m = table.find_in(remote, alias, 0, 4000, LinkType::Tcp).unwrap();
        assert_eq!(m.id, id);
        assert_eq!(m.specificity, Specificity::UnknownDestPort);
    }

    #[test]
    fn test_pptp_lookups_ignore_ports_in_hash() {
        let mut table = FlowTable::new(101, 4001);
        let remote = Ipv4Addr::new(198, 51, 100, 7);
        let alias = Ipv4Addr::new(203, 0, 113, 9);
        let id = table.insert(make_link(addr(5), remote, 0x1111, 0, 0x9999, LinkType::Pptp));

        assert_eq!(table.find_pptp_out_by_call_id(addr(5), remote, 0x1111), Some(id));
        assert_eq!(table.find_pptp_out_by_peer_call_id(addr(5), remote, 0), None);
        assert_eq!(table.find_pptp_in_by_call_id(remote, alias, 0), None);
        let by_alias = table.find_in(remote, alias, 0, 0x9999, LinkType::Pptp).unwrap();
        assert_eq!(by_alias.id, id);

        table.set_pptp_peer_call_id(id, 0x2222);
        assert_eq!(table.find_pptp_out_by_peer_call_id(addr(5), remote, 0x2222), Some(id));
        assert_eq!(table.find_pptp_in_by_call_id(remote, alias, 0x2222), Some(id));
        assert!(table.verify_indices());
    }
}
