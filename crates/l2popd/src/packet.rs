//! Ethernet / 802.1Q / ARP frame parsing and synthesis.
//!
//! Only the layers the packet classifier needs are modeled. Parsing is
//! tolerant: a layer that is absent or truncated yields `None` for that
//! layer rather than an error, so the classifier can fall back to its
//! flood/forward paths.

use std::net::Ipv4Addr;

use l2pop_types::MacAddress;

pub const ETH_TYPE_8021Q: u16 = 0x8100;
pub const ETH_TYPE_ARP: u16 = 0x0806;

pub const ARP_HTYPE_ETHERNET: u16 = 0x0001;
pub const ARP_PTYPE_IPV4: u16 = 0x0800;
pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

const ETH_HDR_LEN: usize = 14;
const VLAN_TAG_LEN: usize = 4;
const ARP_PKT_LEN: usize = 28;

/// Ethernet header, without any VLAN tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EthernetHeader {
    pub dst: MacAddress,
    pub src: MacAddress,
    pub eth_type: u16,
}

/// 802.1Q tag: the 12-bit VLAN id plus the encapsulated ethertype.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanTag {
    pub vid: u16,
    pub inner_eth_type: u16,
}

/// IPv4-over-ethernet ARP packet body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub opcode: u16,
    pub sender_mac: MacAddress,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddress,
    pub target_ip: Ipv4Addr,
}

/// A packet-in frame decomposed into the layers the classifier inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedFrame {
    pub ethernet: EthernetHeader,
    pub vlan: Option<VlanTag>,
    pub arp: Option<ArpPacket>,
}

fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([data[off], data[off + 1]])
}

fn read_mac(data: &[u8], off: usize) -> MacAddress {
    let mut octets = [0u8; 6];
    octets.copy_from_slice(&data[off..off + 6]);
    MacAddress::from(octets)
}

fn read_ipv4(data: &[u8], off: usize) -> Ipv4Addr {
    Ipv4Addr::new(data[off], data[off + 1], data[off + 2], data[off + 3])
}

/// Parses a raw frame. `None` means the data is too short to even carry
/// an ethernet header.
pub fn parse(data: &[u8]) -> Option<ParsedFrame> {
    if data.len() < ETH_HDR_LEN {
        return None;
    }
    let ethernet = EthernetHeader {
        dst: read_mac(data, 0),
        src: read_mac(data, 6),
        eth_type: read_u16(data, 12),
    };

    let (vlan, payload_off) = if ethernet.eth_type == ETH_TYPE_8021Q {
        if data.len() < ETH_HDR_LEN + VLAN_TAG_LEN {
            return Some(ParsedFrame {
                ethernet,
                vlan: None,
                arp: None,
            });
        }
        let tag = VlanTag {
            vid: read_u16(data, ETH_HDR_LEN) & 0x0fff,
            inner_eth_type: read_u16(data, ETH_HDR_LEN + 2),
        };
        (Some(tag), ETH_HDR_LEN + VLAN_TAG_LEN)
    } else {
        (None, ETH_HDR_LEN)
    };

    let inner_type = vlan
        .as_ref()
        .map_or(ethernet.eth_type, |t| t.inner_eth_type);
    let arp = if inner_type == ETH_TYPE_ARP {
        parse_arp(&data[payload_off..])
    } else {
        None
    };

    Some(ParsedFrame {
        ethernet,
        vlan,
        arp,
    })
}

fn parse_arp(data: &[u8]) -> Option<ArpPacket> {
    if data.len() < ARP_PKT_LEN {
        return None;
    }
    // Only IPv4-over-ethernet ARP is classified; anything else passes
    // through as a non-ARP payload.
    if read_u16(data, 0) != ARP_HTYPE_ETHERNET
        || read_u16(data, 2) != ARP_PTYPE_IPV4
        || data[4] != 6
        || data[5] != 4
    {
        return None;
    }
    Some(ArpPacket {
        opcode: read_u16(data, 6),
        sender_mac: read_mac(data, 8),
        sender_ip: read_ipv4(data, 14),
        target_mac: read_mac(data, 18),
        target_ip: read_ipv4(data, 22),
    })
}

/// Synthesizes an ARP reply frame for a request: source and destination
/// addresses swap, the opcode flips to REPLY, and the answering MAC comes
/// from the resolver cache. The 802.1Q tag of the request, if any, is
/// mirrored so the reply stays on the requester's VLAN.
pub fn build_arp_reply(frame: &ParsedFrame, request: &ArpPacket, answer_mac: MacAddress) -> Vec<u8> {
    let tag_len = if frame.vlan.is_some() { VLAN_TAG_LEN } else { 0 };
    let mut out = vec![0u8; ETH_HDR_LEN + tag_len + ARP_PKT_LEN];

    out[0..6].copy_from_slice(request.sender_mac.as_bytes());
    out[6..12].copy_from_slice(answer_mac.as_bytes());
    let mut off = 12;
    if let Some(tag) = &frame.vlan {
        out[off..off + 2].copy_from_slice(&ETH_TYPE_8021Q.to_be_bytes());
        out[off + 2..off + 4].copy_from_slice(&tag.vid.to_be_bytes());
        off += 4;
    }
    out[off..off + 2].copy_from_slice(&ETH_TYPE_ARP.to_be_bytes());
    off += 2;

    out[off..off + 2].copy_from_slice(&ARP_HTYPE_ETHERNET.to_be_bytes());
    out[off + 2..off + 4].copy_from_slice(&ARP_PTYPE_IPV4.to_be_bytes());
    out[off + 4] = 6;
    out[off + 5] = 4;
    out[off + 6..off + 8].copy_from_slice(&ARP_OP_REPLY.to_be_bytes());
    out[off + 8..off + 14].copy_from_slice(answer_mac.as_bytes());
    out[off + 14..off + 18].copy_from_slice(&request.target_ip.octets());
    out[off + 18..off + 24].copy_from_slice(request.sender_mac.as_bytes());
    out[off + 24..off + 28].copy_from_slice(&request.sender_ip.octets());
    out
}
