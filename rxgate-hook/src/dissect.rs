//! Classification-key extraction from IPv4 frames.

use crate::view::PacketView;

pub const ETH_HDR_LEN: usize = 14;
pub const ETH_P_IP: u16 = 0x0800;
pub const IPV4_HDR_MIN_LEN: usize = 20;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;

/// The fields a rule key can match on.
///
/// Addresses keep the packet's byte order; ports are host order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowFields {
    pub src_ip: u32,
    pub dst_ip: u32,
    /// 0 when the frame carries no reachable TCP/UDP header.
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

/// Extract the classification fields, or `None` if the frame is not a
/// well-formed IPv4 frame (too short, other EtherType, undersized IHL).
#[inline(always)]
pub fn dissect(view: &PacketView) -> Option<FlowFields> {
    let ethertype = view.read_u16_be(12)?;
    if ethertype != ETH_P_IP {
        return None;
    }

    let version_ihl = view.read_u8(ETH_HDR_LEN)?;
    let ihl = ((version_ihl & 0x0f) as usize) * 4;
    if ihl < IPV4_HDR_MIN_LEN {
        return None;
    }
    // The whole IP header must be present, options included.
    view.read_u8(ETH_HDR_LEN + ihl - 1)?;

    let protocol = view.read_u8(ETH_HDR_LEN + 9)?;
    let src_ip = view.read::<u32>(ETH_HDR_LEN + 12)?;
    let dst_ip = view.read::<u32>(ETH_HDR_LEN + 16)?;

    let (src_port, dst_port) = ports(view, ETH_HDR_LEN + ihl, protocol);

    Some(FlowFields { src_ip, dst_ip, src_port, dst_port, protocol })
}

/// TCP and UDP keep the port pair at the same offsets. Anything else, or
/// a frame cut short of its transport header, reports (0, 0).
#[inline(always)]
fn ports(view: &PacketView, transport: usize, protocol: u8) -> (u16, u16) {
    if protocol != IPPROTO_TCP && protocol != IPPROTO_UDP {
        return (0, 0);
    }
    match (view.read_u16_be(transport), view.read_u16_be(transport + 2)) {
        (Some(src), Some(dst)) => (src, dst),
        _ => (0, 0),
    }
}
