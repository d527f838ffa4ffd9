//! PPTP call ID aliasing
//!
//! The TCP control channel (port 1723) negotiates a call ID per side. Each
//! call gets a `Pptp` link whose ports hold the call IDs: `src_port` is the
//! internal host's ID, `alias_port` the ID shown to the peer and `dst_port`
//! the peer's own ID once known. Enhanced GRE data packets carry the
//! receiver's call ID and are matched against those links.

use std::net::Ipv4Addr;

use crate::engine::PacketAlias;
use crate::error::{AliasError, Result};
use crate::lifecycle::AliasPort;
use crate::link::{LinkId, LinkType};
use crate::packet::{
    get_addr, get_u16, get_u32, put_u16, rewrite_dst_addr, rewrite_src_addr, rewrite_u16_covered,
    IP_DST, IP_SRC, TCP_CHECKSUM,
};

use super::TcpSegment;

const PPTP_MAGIC: u32 = 0x1a2b_3c4d;
const PPTP_CTRL_MSG_TYPE: u16 = 1;
const MSG_HEADER_LEN: usize = 12;
const CALL_IDS_LEN: usize = 4;
const CODES_LEN: usize = 2;

const GRE_INIT_MASK: u32 = 0xef7f_ffff;
const GRE_INIT_VALUE: u32 = 0x2001_880b;
const GRE_HEADER_LEN: usize = 8;
const GRE_CALL_ID: usize = 6;

/// Control message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    StartCtrlConnRequest,
    StartCtrlConnReply,
    StopCtrlConnRequest,
    StopCtrlConnReply,
    EchoRequest,
    EchoReply,
    OutCallRequest,
    OutCallReply,
    InCallRequest,
    InCallReply,
    InCallConnected,
    CallClearRequest,
    CallDiscNotify,
    WanErrorNotify,
    SetLinkInfo,
}

impl ControlMessage {
    pub fn from_code(code: u16) -> Option<Self> {
        use ControlMessage::*;
        Some(match code {
            1 => StartCtrlConnRequest,
            2 => StartCtrlConnReply,
            3 => StopCtrlConnRequest,
            4 => StopCtrlConnReply,
            5 => EchoRequest,
            6 => EchoReply,
            7 => OutCallRequest,
            8 => OutCallReply,
            9 => InCallRequest,
            10 => InCallReply,
            11 => InCallConnected,
            12 => CallClearRequest,
            13 => CallDiscNotify,
            14 => WanErrorNotify,
            15 => SetLinkInfo,
            _ => return None,
        })
    }

    fn is_reply(self) -> bool {
        matches!(self, ControlMessage::OutCallReply | ControlMessage::InCallReply)
    }
}

/// A verified control message with the offsets of its call ID fields
#[derive(Debug, Clone, Copy)]
struct Control {
    kind: ControlMessage,
    /// Offset of the first call ID
    cid1: usize,
    /// Offset of the second call ID
    cid2: usize,
    /// Result code of a reply, 1 means the call is up
    result: Option<u8>,
}

fn verify(packet: &[u8], seg: &TcpSegment) -> Option<Control> {
    let dlen = seg.payload_len();
    if dlen < MSG_HEADER_LEN + CALL_IDS_LEN {
        return None;
    }
    let d = seg.data;
    if get_u16(packet, d + 2) != PPTP_CTRL_MSG_TYPE || get_u32(packet, d + 4) != PPTP_MAGIC {
        return None;
    }
    let kind = ControlMessage::from_code(get_u16(packet, d + 8))?;
    let result = if kind.is_reply() {
        if dlen < MSG_HEADER_LEN + CALL_IDS_LEN + CODES_LEN {
            return None;
        }
        Some(packet[d + MSG_HEADER_LEN + CALL_IDS_LEN])
    } else {
        None
    };
    Some(Control {
        kind,
        cid1: d + MSG_HEADER_LEN,
        cid2: d + MSG_HEADER_LEN + 2,
        result,
    })
}

/// Outbound control message: alias the internal host's call ID
pub(crate) fn alias_out(alias: &mut PacketAlias, packet: &mut [u8], link: LinkId) -> Result<()> {
    let seg = TcpSegment::parse(packet).ok_or(AliasError::Rewrite("short PPTP segment"))?;
    let Some(ctl) = verify(packet, &seg) else {
        return Ok(());
    };
    let original = alias.original_address_of(link);
    let alias_addr = alias.alias_address_of(link);
    let remote = alias
        .table
        .get(link)
        .map(|l| l.dst_addr)
        .ok_or(AliasError::NoSuchLink)?;
    let call_id = get_u16(packet, ctl.cid1);

    use ControlMessage::*;
    let call = match ctl.kind {
        OutCallRequest | OutCallReply | InCallRequest | InCallReply => Some(alias.add_link(
            original,
            remote,
            alias_addr,
            call_id,
            0,
            AliasPort::Auto,
            LinkType::Pptp,
        )?),
        CallClearRequest | CallDiscNotify => {
            alias.table.find_pptp_out_by_call_id(original, remote, call_id)
        }
        _ => return Ok(()),
    };
    let Some(call) = call else {
        return Ok(());
    };

    let alias_call_id = alias
        .table
        .get(call)
        .map(|l| l.alias_port)
        .ok_or(AliasError::NoSuchLink)?;
    rewrite_u16_covered(packet, ctl.cid1, alias_call_id, seg.tcp + TCP_CHECKSUM);
    log::debug!("pptp {:?}: call id {} -> {}", ctl.kind, call_id, alias_call_id);

    match (ctl.kind, ctl.result) {
        (OutCallReply | InCallReply, Some(1)) => {
            let peer = get_u16(packet, ctl.cid2);
            alias.table.set_pptp_peer_call_id(call, peer);
        }
        (OutCallReply | InCallReply, _) | (CallDiscNotify, _) => alias.expire_now(call),
        _ => {}
    }
    Ok(())
}

/// Inbound control message: restore the internal host's call ID
pub(crate) fn alias_in(alias: &mut PacketAlias, packet: &mut [u8], link: LinkId) -> Result<()> {
    let seg = TcpSegment::parse(packet).ok_or(AliasError::Rewrite("short PPTP segment"))?;
    let Some(ctl) = verify(packet, &seg) else {
        return Ok(());
    };
    let alias_addr = alias.alias_address_of(link);
    let remote = alias
        .table
        .get(link)
        .map(|l| l.dst_addr)
        .ok_or(AliasError::NoSuchLink)?;

    use ControlMessage::*;
    let field = match ctl.kind {
        InCallConnected | WanErrorNotify | SetLinkInfo => ctl.cid1,
        OutCallReply | InCallReply => ctl.cid2,
        CallDiscNotify => {
            let peer = get_u16(packet, ctl.cid1);
            if let Some(call) = alias.table.find_pptp_in_by_call_id(remote, alias_addr, peer) {
                alias.expire_now(call);
            }
            return Ok(());
        }
        _ => return Ok(()),
    };

    let alias_call_id = get_u16(packet, field);
    let Some(call) = alias.find_link_in(remote, alias_addr, 0, alias_call_id, LinkType::Pptp, false)? else {
        return Ok(());
    };
    let original_call_id = alias
        .table
        .get(call)
        .map(|l| l.src_port)
        .ok_or(AliasError::NoSuchLink)?;
    rewrite_u16_covered(packet, field, original_call_id, seg.tcp + TCP_CHECKSUM);
    log::debug!(
        "pptp {:?}: call id {} -> {}",
        ctl.kind,
        alias_call_id,
        original_call_id
    );

    if ctl.kind.is_reply() {
        if ctl.result == Some(1) {
            let peer = get_u16(packet, ctl.cid1);
            alias.table.set_pptp_peer_call_id(call, peer);
        } else {
            alias.expire_now(call);
        }
    }
    Ok(())
}

/// Call ID of a PPTP enhanced GRE packet, `None` for other GRE traffic
fn gre_call_id(packet: &[u8]) -> Option<(usize, u16)> {
    let hl = (packet[0] & 0x0f) as usize * 4;
    let total = get_u16(packet, 2) as usize;
    if hl + GRE_HEADER_LEN > total.min(packet.len()) {
        return None;
    }
    if get_u32(packet, hl) & GRE_INIT_MASK != GRE_INIT_VALUE {
        return None;
    }
    Some((hl, get_u16(packet, hl + GRE_CALL_ID)))
}

/// Outbound GRE. Returns `false` if the packet is not PPTP GRE.
pub(crate) fn gre_out(alias: &mut PacketAlias, packet: &mut [u8]) -> bool {
    let Some((_, call_id)) = gre_call_id(packet) else {
        return false;
    };
    let src: Ipv4Addr = get_addr(packet, IP_SRC);
    let dst: Ipv4Addr = get_addr(packet, IP_DST);
    if let Some(call) = alias.table.find_pptp_out_by_peer_call_id(src, dst, call_id) {
        let alias_addr = alias.alias_address_of(call);
        rewrite_src_addr(packet, alias_addr);
    }
    true
}

/// Inbound GRE. Returns `false` if the packet is not PPTP GRE.
pub(crate) fn gre_in(alias: &mut PacketAlias, packet: &mut [u8]) -> bool {
    let Some((hl, call_id)) = gre_call_id(packet) else {
        return false;
    };
    let src = get_addr(packet, IP_SRC);
    let dst = get_addr(packet, IP_DST);
    let found = alias
        .find_link_in(src, dst, 0, call_id, LinkType::Pptp, false)
        .ok()
        .flatten();
    if let Some(call) = found {
        let original_call_id = alias.table.get(call).map_or(call_id, |l| l.src_port);
        let original = alias.original_address_of(call);
        put_u16(packet, hl + GRE_CALL_ID, original_call_id);
        rewrite_dst_addr(packet, original);
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_codes() {
        assert_eq!(ControlMessage::from_code(7), Some(ControlMessage::OutCallRequest));
        assert_eq!(ControlMessage::from_code(13), Some(ControlMessage::CallDiscNotify));
        assert_eq!(ControlMessage::from_code(0), None);
        assert_eq!(ControlMessage::from_code(16), None);
        assert!(ControlMessage::OutCallReply.is_reply());
        assert!(!ControlMessage::OutCallRequest.is_reply());
    }

    #[test]
    fn test_gre_header_check() {
        let mut packet = vec![0u8; 28];
        packet[0] = 0x45;
        put_u16(&mut packet, 2, 28);
        packet[9] = 47;
        // Key present, version 1, protocol 0x880b
        packet[20..24].copy_from_slice(&[0x30, 0x01, 0x88, 0x0b]);
        put_u16(&mut packet, 26, 0x1234);
        assert_eq!(gre_call_id(&packet), Some((20, 0x1234)));

        // Plain GRE carrying IPv4
        packet[20..24].copy_from_slice(&[0x00, 0x00, 0x08, 0x00]);
        assert_eq!(gre_call_id(&packet), None);
    }
}
