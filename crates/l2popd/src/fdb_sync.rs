//! FdbSync - FDB synchronization dispatcher.
//!
//! Receives broadcast add/remove/update FDB messages, filters them by
//! target host, resolves each network to this agent's local VLAN context
//! and drives the flow backend: tunnel ports are brought up lazily, per-MAC
//! flows installed or removed, and tunnel ports reclaimed when a remote
//! agent's flooding entry goes away.

use std::collections::HashMap;

use l2pop_common::L2PopResult;
use tracing::{debug, info, instrument, warn};

use crate::flow_backend::FlowBackend;
use crate::types::{
    ChgIpPayload, FdbEntriesMessage, FdbUpdate, FdbUpdateMessage, LocalVlanMapping, NetworkId,
    OfPort, PortEntry, RpcContext,
};

/// FDB synchronization dispatcher.
///
/// Owns the local VLAN map and a flow backend. All mutation of FDB-derived
/// switch state goes through the three host-scoped entry points; the local
/// VLAN map itself is maintained by the bridge-management layer through
/// [`register_network`](FdbSync::register_network) /
/// [`unregister_network`](FdbSync::unregister_network).
pub struct FdbSync<B> {
    /// This agent's host identity, for host-scoped message filtering.
    host: String,

    /// This agent's tunnel endpoint IP, stripped from remote-port listings.
    local_ip: String,

    /// network_id -> local VLAN context, for networks hosted here.
    local_vlan_map: HashMap<NetworkId, LocalVlanMapping>,

    backend: B,
}

impl<B: FlowBackend> FdbSync<B> {
    pub fn new(host: impl Into<String>, local_ip: impl Into<String>, backend: B) -> Self {
        Self {
            host: host.into(),
            local_ip: local_ip.into(),
            local_vlan_map: HashMap::new(),
            backend,
        }
    }

    /// Registers a network's local VLAN context. Called by the bridge layer
    /// on the first local port binding.
    pub fn register_network(&mut self, network_id: NetworkId, lvm: LocalVlanMapping) {
        info!(%network_id, vlan = %lvm.vlan, "Registered local VLAN mapping");
        self.local_vlan_map.insert(network_id, lvm);
    }

    /// Unregisters a network's local VLAN context. Called when the last
    /// local port is removed.
    pub fn unregister_network(&mut self, network_id: &str) -> Option<LocalVlanMapping> {
        let lvm = self.local_vlan_map.remove(network_id);
        if lvm.is_some() {
            info!(network_id, "Unregistered local VLAN mapping");
        }
        lvm
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Returns true when a host-scoped message applies to this agent.
    fn is_for_this_host(&self, target_host: Option<&str>) -> bool {
        target_host.map_or(true, |h| h == self.host)
    }

    /// Host-scoped entry point: install FDB entries.
    #[instrument(skip(self, ctx, entries))]
    pub async fn add_fdb_entries(
        &mut self,
        ctx: &RpcContext,
        entries: FdbEntriesMessage,
        target_host: Option<&str>,
    ) -> L2PopResult<()> {
        if !self.is_for_this_host(target_host) {
            return Ok(());
        }
        self.fdb_add(ctx, entries).await
    }

    /// Host-scoped entry point: remove FDB entries.
    #[instrument(skip(self, ctx, entries))]
    pub async fn remove_fdb_entries(
        &mut self,
        ctx: &RpcContext,
        entries: FdbEntriesMessage,
        target_host: Option<&str>,
    ) -> L2PopResult<()> {
        if !self.is_for_this_host(target_host) {
            return Ok(());
        }
        self.fdb_remove(ctx, entries).await
    }

    /// Host-scoped entry point: apply FDB update actions.
    #[instrument(skip(self, ctx, updates))]
    pub async fn update_fdb_entries(
        &mut self,
        ctx: &RpcContext,
        updates: FdbUpdateMessage,
        target_host: Option<&str>,
    ) -> L2PopResult<()> {
        if !self.is_for_this_host(target_host) {
            return Ok(());
        }
        self.fdb_update(ctx, updates).await
    }

    /// Installs tunnel ports and flows for every network in the message
    /// that is hosted on this agent.
    pub async fn fdb_add(&mut self, _ctx: &RpcContext, entries: FdbEntriesMessage) -> L2PopResult<()> {
        for (network_id, fdb) in entries {
            let Some(lvm) = self.local_vlan_map.get(&network_id).cloned() else {
                debug!(%network_id, "Network not hosted here, skipping");
                continue;
            };

            self.backend.defer_apply_on();
            for (agent_ip, ports) in &fdb.ports {
                if *agent_ip == self.local_ip {
                    continue;
                }

                let ofport = match self.resolve_tunnel(agent_ip, &lvm).await? {
                    Some(ofport) => ofport,
                    None => continue,
                };
                for entry in ports {
                    self.backend.add_fdb_flow(entry, &lvm, ofport).await?;
                }
            }
            if let Err(e) = self.backend.defer_apply_off().await {
                warn!(%network_id, "Failed to commit flow batch: {}", e);
            }
        }
        Ok(())
    }

    /// Removes flows for every network in the message that is hosted on
    /// this agent, reclaiming tunnel ports whose flooding entry went away.
    pub async fn fdb_remove(
        &mut self,
        _ctx: &RpcContext,
        entries: FdbEntriesMessage,
    ) -> L2PopResult<()> {
        for (network_id, fdb) in entries {
            let Some(lvm) = self.local_vlan_map.get(&network_id).cloned() else {
                debug!(%network_id, "Network not hosted here, skipping");
                continue;
            };

            self.backend.defer_apply_on();
            let mut reclaim = Vec::new();
            for (agent_ip, ports) in &fdb.ports {
                if *agent_ip == self.local_ip {
                    continue;
                }

                let Some(ofport) = self.backend.tunnel_ofport(lvm.network_type, agent_ip) else {
                    debug!(%agent_ip, "No tunnel to remote agent, skipping");
                    continue;
                };
                for entry in ports {
                    self.backend.del_fdb_flow(entry, &lvm, ofport).await?;
                    if entry.is_flooding() {
                        reclaim.push(ofport);
                    }
                }
            }
            if let Err(e) = self.backend.defer_apply_off().await {
                warn!(%network_id, "Failed to commit flow batch: {}", e);
            }

            // Reclaim attempts run after the batch so the flood-membership
            // state they consult is already committed.
            for ofport in reclaim {
                self.backend
                    .cleanup_tunnel_port(ofport, lvm.network_type)
                    .await?;
            }
        }
        Ok(())
    }

    /// Decodes and dispatches update actions. An unknown action tag fails
    /// the whole call; a protocol mismatch must be visible.
    pub async fn fdb_update(
        &mut self,
        ctx: &RpcContext,
        updates: FdbUpdateMessage,
    ) -> L2PopResult<()> {
        for (action, payload) in updates {
            match FdbUpdate::decode(&action, payload)? {
                FdbUpdate::ChgIp(payload) => self.fdb_chg_ip(ctx, payload).await?,
            }
        }
        Ok(())
    }

    /// `chg_ip` handler: a remote port's IP moved while its MAC stayed;
    /// swap the old flows for the new ones over the existing tunnel.
    async fn fdb_chg_ip(&mut self, _ctx: &RpcContext, payload: ChgIpPayload) -> L2PopResult<()> {
        for (network_id, agents) in payload {
            let Some(lvm) = self.local_vlan_map.get(&network_id).cloned() else {
                debug!(%network_id, "Network not hosted here, skipping");
                continue;
            };

            self.backend.defer_apply_on();
            for (agent_ip, diff) in &agents {
                let Some(ofport) = self.backend.tunnel_ofport(lvm.network_type, agent_ip) else {
                    warn!(%agent_ip, "No tunnel to remote agent for chg_ip, skipping");
                    continue;
                };
                for entry in &diff.before {
                    self.backend.del_fdb_flow(entry, &lvm, ofport).await?;
                }
                for entry in &diff.after {
                    self.backend.add_fdb_flow(entry, &lvm, ofport).await?;
                }
            }
            if let Err(e) = self.backend.defer_apply_off().await {
                warn!(%network_id, "Failed to commit flow batch: {}", e);
            }
        }
        Ok(())
    }

    /// Looks up or lazily creates the tunnel to a remote agent. `None`
    /// means the tunnel is unavailable and the agent's ports are skipped.
    async fn resolve_tunnel(
        &mut self,
        agent_ip: &str,
        lvm: &LocalVlanMapping,
    ) -> L2PopResult<Option<OfPort>> {
        if let Some(ofport) = self.backend.tunnel_ofport(lvm.network_type, agent_ip) {
            return Ok(Some(ofport));
        }
        let ofport = self
            .backend
            .setup_tunnel_port(agent_ip, lvm.network_type)
            .await?;
        if ofport.is_none() {
            warn!(agent_ip, "Tunnel unavailable, skipping remote agent");
        }
        Ok(ofport)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use l2pop_common::L2PopError;
    use l2pop_types::{MacAddress, TunnelType, VlanId};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::collections::HashMap as StdHashMap;

    /// Backend double recording every call, in the style of the mock-mode
    /// command capture used by the OVS backend tests.
    #[derive(Default)]
    struct RecordingBackend {
        tunnel_ports: StdHashMap<(TunnelType, String), OfPort>,
        setup_replies: StdHashMap<String, Option<OfPort>>,
        setup_calls: Vec<(String, TunnelType)>,
        cleanup_calls: Vec<(OfPort, TunnelType)>,
        add_flow_calls: Vec<(PortEntry, VlanId, OfPort)>,
        del_flow_calls: Vec<(PortEntry, VlanId, OfPort)>,
        defer_depth: u32,
        defer_commits: u32,
    }

    impl RecordingBackend {
        fn with_tunnel(mut self, t: TunnelType, ip: &str, ofport: OfPort) -> Self {
            self.tunnel_ports.insert((t, ip.to_string()), ofport);
            self
        }

        fn with_setup_reply(mut self, ip: &str, reply: Option<OfPort>) -> Self {
            self.setup_replies.insert(ip.to_string(), reply);
            self
        }
    }

    #[async_trait]
    impl FlowBackend for RecordingBackend {
        fn tunnel_ofport(&self, network_type: TunnelType, remote_ip: &str) -> Option<OfPort> {
            self.tunnel_ports
                .get(&(network_type, remote_ip.to_string()))
                .copied()
        }

        async fn setup_tunnel_port(
            &mut self,
            remote_ip: &str,
            network_type: TunnelType,
        ) -> L2PopResult<Option<OfPort>> {
            self.setup_calls.push((remote_ip.to_string(), network_type));
            let reply = self
                .setup_replies
                .get(remote_ip)
                .copied()
                .unwrap_or(None);
            if let Some(ofport) = reply {
                self.tunnel_ports
                    .insert((network_type, remote_ip.to_string()), ofport);
            }
            Ok(reply)
        }

        async fn cleanup_tunnel_port(
            &mut self,
            ofport: OfPort,
            network_type: TunnelType,
        ) -> L2PopResult<()> {
            self.cleanup_calls.push((ofport, network_type));
            Ok(())
        }

        async fn add_fdb_flow(
            &mut self,
            entry: &PortEntry,
            lvm: &LocalVlanMapping,
            ofport: OfPort,
        ) -> L2PopResult<()> {
            self.add_flow_calls.push((entry.clone(), lvm.vlan, ofport));
            Ok(())
        }

        async fn del_fdb_flow(
            &mut self,
            entry: &PortEntry,
            lvm: &LocalVlanMapping,
            ofport: OfPort,
        ) -> L2PopResult<()> {
            self.del_flow_calls.push((entry.clone(), lvm.vlan, ofport));
            Ok(())
        }

        fn defer_apply_on(&mut self) {
            self.defer_depth += 1;
        }

        async fn defer_apply_off(&mut self) -> L2PopResult<()> {
            self.defer_commits += 1;
            Ok(())
        }
    }

    const LOCAL_IP: &str = "10.0.0.1";

    fn sync_with(backend: RecordingBackend) -> FdbSync<RecordingBackend> {
        FdbSync::new("compute-1", LOCAL_IP, backend)
    }

    fn lvm(vlan: u16, segid: u32) -> LocalVlanMapping {
        LocalVlanMapping::new(VlanId::new(vlan).unwrap(), TunnelType::Gre, segid)
    }

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    fn entries(networks: serde_json::Value) -> FdbEntriesMessage {
        serde_json::from_value(networks).unwrap()
    }

    fn ctx() -> RpcContext {
        RpcContext::default()
    }

    #[tokio::test]
    async fn test_host_filter_skips_other_hosts() {
        let mut sync = sync_with(RecordingBackend::default());
        sync.register_network("net1".to_string(), lvm(100, 7));

        let msg = entries(json!({
            "net1": {
                "network_type": "gre",
                "segment_id": 7,
                "ports": { "10.1.0.1": [["fa:16:3e:00:00:01", "1.1.1.1"]] },
            },
        }));

        sync.add_fdb_entries(&ctx(), msg.clone(), Some("other-host"))
            .await
            .unwrap();
        assert!(sync.backend().add_flow_calls.is_empty());
        assert!(sync.backend().setup_calls.is_empty());

        // Absent host means "apply everywhere".
        let mut sync = sync_with(RecordingBackend::default().with_setup_reply("10.1.0.1", Some(3)));
        sync.register_network("net1".to_string(), lvm(100, 7));
        sync.add_fdb_entries(&ctx(), msg, None).await.unwrap();
        assert_eq!(sync.backend().add_flow_calls.len(), 1);
    }

    #[tokio::test]
    async fn test_unmapped_network_makes_no_calls() {
        let mut sync = sync_with(RecordingBackend::default());

        let msg = entries(json!({
            "unknown-net": {
                "network_type": "gre",
                "segment_id": 7,
                "ports": { "10.1.0.1": [["fa:16:3e:00:00:01", "1.1.1.1"]] },
            },
        }));

        sync.fdb_add(&ctx(), msg.clone()).await.unwrap();
        sync.fdb_remove(&ctx(), msg).await.unwrap();

        let backend = sync.backend();
        assert!(backend.setup_calls.is_empty());
        assert!(backend.add_flow_calls.is_empty());
        assert!(backend.del_flow_calls.is_empty());
        assert!(backend.cleanup_calls.is_empty());
        assert_eq!(backend.defer_commits, 0);
    }

    #[tokio::test]
    async fn test_one_setup_call_per_remote_agent() {
        let mut sync = sync_with(RecordingBackend::default().with_setup_reply("10.1.0.1", Some(3)));
        sync.register_network("net1".to_string(), lvm(100, 7));

        // Two ports behind one remote agent: one tunnel setup, two flows.
        let msg = entries(json!({
            "net1": {
                "network_type": "gre",
                "segment_id": 7,
                "ports": {
                    "10.1.0.1": [
                        ["fa:16:3e:00:00:01", "1.1.1.1"],
                        ["fa:16:3e:00:00:02", "1.1.1.2"],
                    ],
                },
            },
        }));
        sync.fdb_add(&ctx(), msg).await.unwrap();

        let backend = sync.backend();
        assert_eq!(backend.setup_calls.len(), 1);
        assert_eq!(
            backend.setup_calls[0],
            ("10.1.0.1".to_string(), TunnelType::Gre)
        );
        assert_eq!(backend.add_flow_calls.len(), 2);
        assert!(backend
            .add_flow_calls
            .iter()
            .all(|(_, _, ofport)| *ofport == 3));
    }

    #[tokio::test]
    async fn test_existing_tunnel_skips_setup() {
        let mut sync =
            sync_with(RecordingBackend::default().with_tunnel(TunnelType::Gre, "10.1.0.1", 3));
        sync.register_network("net1".to_string(), lvm(100, 7));

        let msg = entries(json!({
            "net1": {
                "network_type": "gre",
                "segment_id": 7,
                "ports": { "10.1.0.1": [["fa:16:3e:00:00:01", "1.1.1.1"]] },
            },
        }));
        sync.fdb_add(&ctx(), msg).await.unwrap();

        assert!(sync.backend().setup_calls.is_empty());
        assert_eq!(sync.backend().add_flow_calls.len(), 1);
    }

    #[tokio::test]
    async fn test_unavailable_tunnel_skips_agent_without_error() {
        let backend = RecordingBackend::default()
            .with_setup_reply("10.1.0.1", None)
            .with_setup_reply("10.2.0.1", Some(5));
        let mut sync = sync_with(backend);
        sync.register_network("net1".to_string(), lvm(100, 7));

        let msg = entries(json!({
            "net1": {
                "network_type": "gre",
                "segment_id": 7,
                "ports": {
                    "10.1.0.1": [["fa:16:3e:00:00:01", "1.1.1.1"]],
                    "10.2.0.1": [["fa:16:3e:00:00:02", "2.2.2.2"]],
                },
            },
        }));
        sync.fdb_add(&ctx(), msg).await.unwrap();

        // Only the reachable agent got a flow; nothing propagated.
        let backend = sync.backend();
        assert_eq!(backend.add_flow_calls.len(), 1);
        assert_eq!(backend.add_flow_calls[0].2, 5);
    }

    #[tokio::test]
    async fn test_local_agent_ports_are_stripped() {
        let mut sync = sync_with(RecordingBackend::default().with_setup_reply("10.1.0.1", Some(3)));
        sync.register_network("net1".to_string(), lvm(100, 7));

        let msg = entries(json!({
            "net1": {
                "network_type": "gre",
                "segment_id": 7,
                "ports": {
                    LOCAL_IP: [["fa:16:3e:00:00:09", "9.9.9.9"]],
                    "10.1.0.1": [["fa:16:3e:00:00:01", "1.1.1.1"]],
                },
            },
        }));
        sync.fdb_add(&ctx(), msg).await.unwrap();

        let backend = sync.backend();
        assert_eq!(backend.add_flow_calls.len(), 1);
        assert!(!backend
            .setup_calls
            .iter()
            .any(|(ip, _)| ip == LOCAL_IP));
    }

    #[tokio::test]
    async fn test_flooding_entry_removal_triggers_one_cleanup() {
        let mut sync =
            sync_with(RecordingBackend::default().with_tunnel(TunnelType::Gre, "10.1.0.1", 3));
        sync.register_network("net1".to_string(), lvm(100, 7));

        let msg = entries(json!({
            "net1": {
                "network_type": "gre",
                "segment_id": 7,
                "ports": {
                    "10.1.0.1": [
                        ["fa:16:3e:00:00:01", "1.1.1.1"],
                        ["00:00:00:00:00:00", "0.0.0.0"],
                    ],
                },
            },
        }));
        sync.fdb_remove(&ctx(), msg).await.unwrap();

        let backend = sync.backend();
        assert_eq!(backend.del_flow_calls.len(), 2);
        assert_eq!(backend.cleanup_calls, vec![(3, TunnelType::Gre)]);
    }

    #[tokio::test]
    async fn test_non_flooding_removal_triggers_no_cleanup() {
        let mut sync =
            sync_with(RecordingBackend::default().with_tunnel(TunnelType::Gre, "10.1.0.1", 3));
        sync.register_network("net1".to_string(), lvm(100, 7));

        let msg = entries(json!({
            "net1": {
                "network_type": "gre",
                "segment_id": 7,
                "ports": { "10.1.0.1": [["fa:16:3e:00:00:01", "1.1.1.1"]] },
            },
        }));
        sync.fdb_remove(&ctx(), msg).await.unwrap();

        assert_eq!(sync.backend().del_flow_calls.len(), 1);
        assert!(sync.backend().cleanup_calls.is_empty());
    }

    #[tokio::test]
    async fn test_remove_without_tunnel_skips_agent() {
        let mut sync = sync_with(RecordingBackend::default());
        sync.register_network("net1".to_string(), lvm(100, 7));

        let msg = entries(json!({
            "net1": {
                "network_type": "gre",
                "segment_id": 7,
                "ports": { "10.1.0.1": [["00:00:00:00:00:00", "0.0.0.0"]] },
            },
        }));
        sync.fdb_remove(&ctx(), msg).await.unwrap();

        assert!(sync.backend().del_flow_calls.is_empty());
        assert!(sync.backend().cleanup_calls.is_empty());
    }

    #[tokio::test]
    async fn test_chg_ip_swaps_flows_over_existing_tunnel() {
        let mut sync =
            sync_with(RecordingBackend::default().with_tunnel(TunnelType::Gre, "10.1.0.1", 3));
        sync.register_network("net1".to_string(), lvm(100, 7));

        let updates: FdbUpdateMessage = serde_json::from_value(json!({
            "chg_ip": {
                "net1": {
                    "10.1.0.1": {
                        "before": [["fa:16:3e:00:00:01", "1.1.1.1"]],
                        "after": [["fa:16:3e:00:00:01", "2.2.2.2"]],
                    },
                },
            },
        }))
        .unwrap();
        sync.fdb_update(&ctx(), updates).await.unwrap();

        let backend = sync.backend();
        assert_eq!(
            backend.del_flow_calls,
            vec![(
                PortEntry::unicast(mac("fa:16:3e:00:00:01"), "1.1.1.1"),
                VlanId::new(100).unwrap(),
                3
            )]
        );
        assert_eq!(
            backend.add_flow_calls,
            vec![(
                PortEntry::unicast(mac("fa:16:3e:00:00:01"), "2.2.2.2"),
                VlanId::new(100).unwrap(),
                3
            )]
        );
    }

    #[tokio::test]
    async fn test_unknown_update_action_is_fatal() {
        let mut sync = sync_with(RecordingBackend::default());

        let updates: FdbUpdateMessage =
            serde_json::from_value(json!({ "chg_mac": {} })).unwrap();
        let err = sync.fdb_update(&ctx(), updates).await.unwrap_err();
        assert!(matches!(
            err,
            L2PopError::UnsupportedAction { ref action } if action == "chg_mac"
        ));
    }

    #[tokio::test]
    async fn test_flow_batch_brackets_each_network() {
        let mut sync = sync_with(RecordingBackend::default().with_setup_reply("10.1.0.1", Some(3)));
        sync.register_network("net1".to_string(), lvm(100, 7));
        sync.register_network("net2".to_string(), lvm(200, 8));

        let msg = entries(json!({
            "net1": {
                "network_type": "gre",
                "segment_id": 7,
                "ports": { "10.1.0.1": [["fa:16:3e:00:00:01", "1.1.1.1"]] },
            },
            "net2": {
                "network_type": "gre",
                "segment_id": 8,
                "ports": { "10.1.0.1": [["fa:16:3e:00:00:02", "2.2.2.2"]] },
            },
        }));
        sync.fdb_add(&ctx(), msg).await.unwrap();

        assert_eq!(sync.backend().defer_depth, 2);
        assert_eq!(sync.backend().defer_commits, 2);
    }
}
