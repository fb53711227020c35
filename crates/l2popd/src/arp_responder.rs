//! ARP proxy: cache of `ip -> mac` per local VLAN, plus the packet-in
//! classifier that answers ARP requests from it.
//!
//! Once remote mappings are known there is no reason to flood ARP
//! broadcasts across the tunnel mesh; the classifier answers directly on
//! the ingress port. Whenever the cache cannot answer it falls back to
//! forwarding, with a short-lived bypass flow so the same traffic does
//! not keep hitting the controller.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use l2pop_common::{L2PopError, L2PopResult};
use l2pop_types::{MacAddress, VlanId};
use tracing::{debug, warn};

use crate::openflow::{BypassMatch, OpenFlowApi, OutputPort, PacketIn};
use crate::packet::{self, ARP_OP_REQUEST};

/// Per-VLAN `ip -> mac` resolver cache.
///
/// Mutated only through [`add_entry`](ArpTable::add_entry) and
/// [`del_entry`](ArpTable::del_entry); the classifier reads it.
#[derive(Debug, Default)]
pub struct ArpTable {
    entries: HashMap<VlanId, HashMap<Ipv4Addr, MacAddress>>,
}

impl ArpTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts a mapping.
    pub fn add_entry(&mut self, vlan: VlanId, ip: Ipv4Addr, mac: MacAddress) {
        debug!(%vlan, %ip, %mac, "ARP cache add");
        self.entries.entry(vlan).or_default().insert(ip, mac);
    }

    /// Removes a mapping, pruning the VLAN's submap when it empties.
    ///
    /// Deleting a key that was never added is caller misuse and is
    /// reported as [`L2PopError::UnknownArpCacheKey`].
    pub fn del_entry(&mut self, vlan: VlanId, ip: Ipv4Addr) -> L2PopResult<()> {
        let submap = self
            .entries
            .get_mut(&vlan)
            .ok_or_else(|| L2PopError::unknown_arp_cache_key(vlan.to_string(), ip.to_string()))?;
        if submap.remove(&ip).is_none() {
            return Err(L2PopError::unknown_arp_cache_key(
                vlan.to_string(),
                ip.to_string(),
            ));
        }
        if submap.is_empty() {
            self.entries.remove(&vlan);
        }
        debug!(%vlan, %ip, "ARP cache delete");
        Ok(())
    }

    pub fn lookup(&self, vlan: VlanId, ip: Ipv4Addr) -> Option<MacAddress> {
        self.entries.get(&vlan)?.get(&ip).copied()
    }

    /// True when the VLAN has at least one cached mapping.
    pub fn has_network(&self, vlan: VlanId) -> bool {
        self.entries.contains_key(&vlan)
    }
}

/// Packet-in classifier. Processes one event at a time; every path ends
/// in exactly one terminal action on the switch.
pub struct ArpResponder<C> {
    table: ArpTable,
    api: C,
}

impl<C: OpenFlowApi> ArpResponder<C> {
    pub fn new(api: C) -> Self {
        Self {
            table: ArpTable::new(),
            api,
        }
    }

    pub fn table(&self) -> &ArpTable {
        &self.table
    }

    pub fn table_mut(&mut self) -> &mut ArpTable {
        &mut self.table
    }

    pub fn api(&self) -> &C {
        &self.api
    }

    /// Classifies one packet-in and performs its terminal action.
    pub async fn handle_packet_in(&mut self, event: PacketIn) -> L2PopResult<()> {
        let Some(frame) = packet::parse(&event.data) else {
            // Not even an ethernet header. Let the switch flood it.
            warn!(in_port = event.in_port, "Unparseable packet-in, flooding");
            return self
                .api
                .send_packet(event.in_port, &event.data, OutputPort::Flood)
                .await;
        };

        let Some(tag) = frame.vlan.clone() else {
            // Untagged traffic carries no network context; pass it on.
            return self
                .api
                .send_packet(event.in_port, &event.data, OutputPort::Pipeline)
                .await;
        };
        let Ok(vlan) = VlanId::new(tag.vid) else {
            debug!(vid = tag.vid, "Packet-in with out-of-range vid, flooding");
            return self
                .api
                .send_packet(event.in_port, &event.data, OutputPort::Flood)
                .await;
        };

        let Some(arp) = frame.arp.clone() else {
            // Non-ARP payload on a known VLAN: nothing for us in this
            // traffic, keep it away from the controller for a while.
            self.api
                .install_bypass_flow(&BypassMatch::Vlan { vlan })
                .await?;
            return self
                .api
                .send_packet(event.in_port, &event.data, OutputPort::Pipeline)
                .await;
        };

        let answer = if arp.opcode == ARP_OP_REQUEST {
            self.table.lookup(vlan, arp.target_ip)
        } else {
            None
        };
        match answer {
            Some(mac) => {
                debug!(%vlan, target_ip = %arp.target_ip, %mac, "Answering ARP from cache");
                let reply = packet::build_arp_reply(&frame, &arp, mac);
                self.api
                    .send_packet(event.in_port, &reply, OutputPort::Port(event.in_port))
                    .await
            }
            None => {
                self.api
                    .install_bypass_flow(&BypassMatch::ArpRequest {
                        vlan,
                        target_ip: arp.target_ip,
                    })
                    .await?;
                self.api
                    .send_packet(event.in_port, &event.data, OutputPort::Pipeline)
                    .await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    fn vlan(id: u16) -> VlanId {
        VlanId::new(id).unwrap()
    }

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    #[derive(Debug, PartialEq, Eq)]
    enum ApiCall {
        Bypass(BypassMatch),
        Send(u32, Vec<u8>, OutputPort),
    }

    #[derive(Default)]
    struct RecordingApi {
        calls: Vec<ApiCall>,
    }

    #[async_trait]
    impl OpenFlowApi for RecordingApi {
        async fn install_bypass_flow(&mut self, bypass: &BypassMatch) -> L2PopResult<()> {
            self.calls.push(ApiCall::Bypass(bypass.clone()));
            Ok(())
        }

        async fn send_packet(
            &mut self,
            in_port: u32,
            data: &[u8],
            output: OutputPort,
        ) -> L2PopResult<()> {
            self.calls.push(ApiCall::Send(in_port, data.to_vec(), output));
            Ok(())
        }
    }

    fn arp_request_frame(vid: u16, target_ip: Ipv4Addr) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&[0xff; 6]);
        f.extend_from_slice(mac("fa:16:3e:00:00:01").as_bytes());
        f.extend_from_slice(&packet::ETH_TYPE_8021Q.to_be_bytes());
        f.extend_from_slice(&vid.to_be_bytes());
        f.extend_from_slice(&packet::ETH_TYPE_ARP.to_be_bytes());
        f.extend_from_slice(&packet::ARP_HTYPE_ETHERNET.to_be_bytes());
        f.extend_from_slice(&packet::ARP_PTYPE_IPV4.to_be_bytes());
        f.push(6);
        f.push(4);
        f.extend_from_slice(&ARP_OP_REQUEST.to_be_bytes());
        f.extend_from_slice(mac("fa:16:3e:00:00:01").as_bytes());
        f.extend_from_slice(&ip("10.0.0.5").octets());
        f.extend_from_slice(&[0u8; 6]);
        f.extend_from_slice(&target_ip.octets());
        f
    }

    fn untagged_ip_frame() -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(mac("fa:16:3e:00:00:02").as_bytes());
        f.extend_from_slice(mac("fa:16:3e:00:00:01").as_bytes());
        f.extend_from_slice(&0x0800u16.to_be_bytes());
        f.extend_from_slice(&[0u8; 20]);
        f
    }

    fn tagged_ip_frame(vid: u16) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(mac("fa:16:3e:00:00:02").as_bytes());
        f.extend_from_slice(mac("fa:16:3e:00:00:01").as_bytes());
        f.extend_from_slice(&packet::ETH_TYPE_8021Q.to_be_bytes());
        f.extend_from_slice(&vid.to_be_bytes());
        f.extend_from_slice(&0x0800u16.to_be_bytes());
        f.extend_from_slice(&[0u8; 20]);
        f
    }

    #[test]
    fn test_arp_table_add_lookup_del() {
        let mut table = ArpTable::new();
        table.add_entry(vlan(100), ip("10.0.0.9"), mac("fa:16:3e:aa:bb:cc"));
        assert_eq!(
            table.lookup(vlan(100), ip("10.0.0.9")),
            Some(mac("fa:16:3e:aa:bb:cc"))
        );

        // Upsert replaces.
        table.add_entry(vlan(100), ip("10.0.0.9"), mac("fa:16:3e:aa:bb:dd"));
        assert_eq!(
            table.lookup(vlan(100), ip("10.0.0.9")),
            Some(mac("fa:16:3e:aa:bb:dd"))
        );

        table.del_entry(vlan(100), ip("10.0.0.9")).unwrap();
        assert_eq!(table.lookup(vlan(100), ip("10.0.0.9")), None);
        // Submap pruned once empty.
        assert!(!table.has_network(vlan(100)));
    }

    #[test]
    fn test_arp_table_del_unknown_key_propagates() {
        let mut table = ArpTable::new();
        let err = table.del_entry(vlan(100), ip("10.0.0.9")).unwrap_err();
        assert!(matches!(err, L2PopError::UnknownArpCacheKey { .. }));

        // Known network, unknown ip is equally misuse.
        table.add_entry(vlan(100), ip("10.0.0.1"), mac("fa:16:3e:00:00:01"));
        let err = table.del_entry(vlan(100), ip("10.0.0.9")).unwrap_err();
        assert!(matches!(err, L2PopError::UnknownArpCacheKey { .. }));
    }

    #[tokio::test]
    async fn test_untagged_packet_forwarded_without_flow() {
        let mut responder = ArpResponder::new(RecordingApi::default());
        let data = untagged_ip_frame();
        responder
            .handle_packet_in(PacketIn { in_port: 3, data: data.clone() })
            .await
            .unwrap();

        assert_eq!(
            responder.api().calls,
            vec![ApiCall::Send(3, data, OutputPort::Pipeline)]
        );
    }

    #[tokio::test]
    async fn test_tagged_non_arp_installs_vlan_bypass() {
        let mut responder = ArpResponder::new(RecordingApi::default());
        let data = tagged_ip_frame(100);
        responder
            .handle_packet_in(PacketIn { in_port: 3, data: data.clone() })
            .await
            .unwrap();

        assert_eq!(
            responder.api().calls,
            vec![
                ApiCall::Bypass(BypassMatch::Vlan { vlan: vlan(100) }),
                ApiCall::Send(3, data, OutputPort::Pipeline),
            ]
        );
    }

    #[tokio::test]
    async fn test_cached_arp_request_answered_on_ingress() {
        let mut responder = ArpResponder::new(RecordingApi::default());
        responder
            .table_mut()
            .add_entry(vlan(100), ip("10.0.0.9"), mac("fa:16:3e:aa:bb:cc"));

        responder
            .handle_packet_in(PacketIn {
                in_port: 3,
                data: arp_request_frame(100, ip("10.0.0.9")),
            })
            .await
            .unwrap();

        // One reply on the ingress port, no flow installed.
        assert_eq!(responder.api().calls.len(), 1);
        let ApiCall::Send(in_port, reply, output) = &responder.api().calls[0] else {
            panic!("expected a packet-out");
        };
        assert_eq!(*in_port, 3);
        assert_eq!(*output, OutputPort::Port(3));

        let parsed = packet::parse(reply).unwrap();
        let arp = parsed.arp.unwrap();
        assert_eq!(arp.opcode, packet::ARP_OP_REPLY);
        assert_eq!(arp.sender_mac, mac("fa:16:3e:aa:bb:cc"));
        assert_eq!(arp.sender_ip, ip("10.0.0.9"));
        assert_eq!(arp.target_ip, ip("10.0.0.5"));
    }

    #[tokio::test]
    async fn test_uncached_arp_request_installs_arp_bypass() {
        let mut responder = ArpResponder::new(RecordingApi::default());
        let data = arp_request_frame(100, ip("10.0.0.9"));
        responder
            .handle_packet_in(PacketIn { in_port: 3, data: data.clone() })
            .await
            .unwrap();

        assert_eq!(
            responder.api().calls,
            vec![
                ApiCall::Bypass(BypassMatch::ArpRequest {
                    vlan: vlan(100),
                    target_ip: ip("10.0.0.9"),
                }),
                ApiCall::Send(3, data, OutputPort::Pipeline),
            ]
        );
    }

    #[tokio::test]
    async fn test_non_request_opcode_not_answered() {
        let mut responder = ArpResponder::new(RecordingApi::default());
        responder
            .table_mut()
            .add_entry(vlan(100), ip("10.0.0.9"), mac("fa:16:3e:aa:bb:cc"));

        let mut data = arp_request_frame(100, ip("10.0.0.9"));
        // Flip the opcode to REPLY; the ARP body starts after the 18-byte
        // tagged ethernet header, opcode at body offset 6.
        data[25] = 2;
        responder
            .handle_packet_in(PacketIn { in_port: 3, data })
            .await
            .unwrap();

        assert!(matches!(responder.api().calls[0], ApiCall::Bypass(_)));
    }

    #[tokio::test]
    async fn test_runt_frame_is_flooded() {
        let mut responder = ArpResponder::new(RecordingApi::default());
        responder
            .handle_packet_in(PacketIn { in_port: 3, data: vec![0u8; 8] })
            .await
            .unwrap();

        assert_eq!(
            responder.api().calls,
            vec![ApiCall::Send(3, vec![0u8; 8], OutputPort::Flood)]
        );
    }
}
