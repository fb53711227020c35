//! Tunnel/flow lifecycle backend for the tunnel bridge.
//!
//! The [`FlowBackend`] trait is the capability set the FDB dispatcher
//! drives: tunnel port lookup/creation/reclaim, per-MAC flow install and
//! removal, and deferred-apply bracketing. [`OvsFlowBackend`] implements it
//! against Open vSwitch through shell command builders.

use std::collections::{BTreeSet, HashMap};

use async_trait::async_trait;
use l2pop_common::{shell, L2PopResult};
use l2pop_types::{TunnelType, VlanId};
use tracing::{debug, info, warn};

use crate::commands::{
    build_add_flow_cmd, build_add_tunnel_port_cmd, build_del_flows_cmd, build_del_port_cmd,
    build_flow_bundle_cmd, build_get_ofport_cmd, flood_flow_spec, flood_match_spec,
    tunnel_port_name, unicast_flow_spec, unicast_match_spec,
};
use crate::types::{LocalVlanMapping, OfPort, PortEntry};

/// Switch-programming capability consumed by the FDB dispatcher.
///
/// `setup_tunnel_port` is idempotent per `(network_type, remote_ip)`; the
/// dispatcher checks `tunnel_ofport` first and implementations re-check
/// their own table. A `None` ofport means the tunnel is unavailable and the
/// remote agent's ports are skipped non-fatally. `cleanup_tunnel_port` is
/// advisory: the implementation confirms no VLAN still floods through the
/// port before removing it.
#[async_trait]
pub trait FlowBackend {
    /// Looks up an existing tunnel ofport without side effects.
    fn tunnel_ofport(&self, network_type: TunnelType, remote_ip: &str) -> Option<OfPort>;

    /// Ensures a tunnel port to the remote agent exists, returning its
    /// ofport, or `None` when the tunnel cannot be brought up.
    async fn setup_tunnel_port(
        &mut self,
        remote_ip: &str,
        network_type: TunnelType,
    ) -> L2PopResult<Option<OfPort>>;

    /// Reclaims a tunnel port if nothing floods through it anymore.
    async fn cleanup_tunnel_port(
        &mut self,
        ofport: OfPort,
        network_type: TunnelType,
    ) -> L2PopResult<()>;

    /// Installs the flow(s) for one remote port entry.
    async fn add_fdb_flow(
        &mut self,
        entry: &PortEntry,
        lvm: &LocalVlanMapping,
        ofport: OfPort,
    ) -> L2PopResult<()>;

    /// Removes the flow(s) for one remote port entry.
    async fn del_fdb_flow(
        &mut self,
        entry: &PortEntry,
        lvm: &LocalVlanMapping,
        ofport: OfPort,
    ) -> L2PopResult<()>;

    /// Starts buffering flow mutations instead of applying them one by one.
    fn defer_apply_on(&mut self);

    /// Commits all buffered flow mutations as one transaction.
    async fn defer_apply_off(&mut self) -> L2PopResult<()>;
}

/// One buffered or immediate flow mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FlowOp {
    Add(String),
    Delete(String),
}

/// Open vSwitch implementation of [`FlowBackend`].
///
/// Owns the tunnel port table and the per-VLAN flood output sets; flooding
/// entries drive both the FLOOD_TO_TUN flow for their VLAN and tunnel-port
/// liveness.
pub struct OvsFlowBackend {
    /// Tunnel bridge name.
    bridge: String,

    /// This agent's tunnel endpoint IP.
    local_ip: String,

    /// (network_type, remote_agent_ip) -> ofport, populated lazily.
    tunnel_ports: HashMap<(TunnelType, String), OfPort>,

    /// Per-VLAN flood output set. A tunnel port is reclaimable only when
    /// it appears in none of these sets.
    flood_ofports: HashMap<VlanId, BTreeSet<OfPort>>,

    /// Buffered flow mutations while deferred apply is on.
    deferred: Option<Vec<FlowOp>>,

    #[cfg(test)]
    mock_mode: bool,

    #[cfg(test)]
    captured_commands: Vec<String>,

    #[cfg(test)]
    mock_query_replies: std::collections::VecDeque<String>,
}

impl OvsFlowBackend {
    /// Creates a backend for the given tunnel bridge and local endpoint.
    pub fn new(bridge: impl Into<String>, local_ip: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
            local_ip: local_ip.into(),
            tunnel_ports: HashMap::new(),
            flood_ofports: HashMap::new(),
            deferred: None,
            #[cfg(test)]
            mock_mode: false,
            #[cfg(test)]
            captured_commands: Vec::new(),
            #[cfg(test)]
            mock_query_replies: std::collections::VecDeque::new(),
        }
    }

    #[cfg(test)]
    pub fn new_mock() -> Self {
        let mut backend = Self::new("br-tun", "10.0.0.1");
        backend.mock_mode = true;
        backend
    }

    #[cfg(test)]
    pub fn captured_commands(&self) -> &[String] {
        &self.captured_commands
    }

    #[cfg(test)]
    pub fn push_mock_query_reply(&mut self, reply: impl Into<String>) {
        self.mock_query_replies.push_back(reply.into());
    }

    #[cfg(test)]
    pub fn flood_ofports(&self, vlan: VlanId) -> Option<&BTreeSet<OfPort>> {
        self.flood_ofports.get(&vlan)
    }

    /// Execute a command, ignoring its output (or capture in mock mode).
    async fn exec(&mut self, cmd: &str) -> L2PopResult<()> {
        #[cfg(test)]
        if self.mock_mode {
            self.captured_commands.push(cmd.to_string());
            return Ok(());
        }

        shell::exec_or_throw(cmd).await?;
        Ok(())
    }

    /// Execute a command and return its stdout (or a canned reply in mock
    /// mode; an exhausted reply queue simulates command failure).
    async fn query(&mut self, cmd: &str) -> L2PopResult<String> {
        #[cfg(test)]
        if self.mock_mode {
            self.captured_commands.push(cmd.to_string());
            return self.mock_query_replies.pop_front().ok_or_else(|| {
                l2pop_common::L2PopError::ShellCommandFailed {
                    command: cmd.to_string(),
                    exit_code: 1,
                    output: "mock query exhausted".to_string(),
                }
            });
        }

        shell::exec_or_throw(cmd).await
    }

    /// Applies or buffers one flow mutation.
    async fn emit(&mut self, op: FlowOp) -> L2PopResult<()> {
        if let Some(buffer) = &mut self.deferred {
            buffer.push(op);
            return Ok(());
        }

        let cmd = match &op {
            FlowOp::Add(spec) => build_add_flow_cmd(&self.bridge, spec),
            FlowOp::Delete(matcher) => build_del_flows_cmd(&self.bridge, matcher),
        };
        self.exec(&cmd).await
    }
}

#[async_trait]
impl FlowBackend for OvsFlowBackend {
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
        if let Some(ofport) = self.tunnel_ofport(network_type, remote_ip) {
            return Ok(Some(ofport));
        }

        let port_name = match tunnel_port_name(network_type, remote_ip) {
            Ok(name) => name,
            Err(e) => {
                warn!("Skipping tunnel: {}", e);
                return Ok(None);
            }
        };

        let cmd = build_add_tunnel_port_cmd(
            &self.bridge,
            &port_name,
            network_type,
            &self.local_ip,
            remote_ip,
        );
        if let Err(e) = self.exec(&cmd).await {
            warn!(remote_ip, %port_name, "Failed to create tunnel port: {}", e);
            return Ok(None);
        }

        let reply = match self.query(&build_get_ofport_cmd(&port_name)).await {
            Ok(reply) => reply,
            Err(e) => {
                warn!(remote_ip, %port_name, "Failed to read ofport: {}", e);
                return Ok(None);
            }
        };
        // ovs-vsctl reports -1 for a port with no ofport; anything that is
        // not a positive u32 is equally unusable.
        let parsed = reply
            .trim()
            .parse::<i64>()
            .ok()
            .and_then(|n| OfPort::try_from(n).ok());
        let ofport = match parsed {
            Some(n) if n > 0 => n,
            _ => {
                warn!(remote_ip, %port_name, %reply, "Tunnel port has no usable ofport");
                return Ok(None);
            }
        };

        self.tunnel_ports
            .insert((network_type, remote_ip.to_string()), ofport);
        info!(remote_ip, %port_name, ofport, "Tunnel port created");
        Ok(Some(ofport))
    }

    async fn cleanup_tunnel_port(
        &mut self,
        ofport: OfPort,
        network_type: TunnelType,
    ) -> L2PopResult<()> {
        if self.flood_ofports.values().any(|s| s.contains(&ofport)) {
            debug!(ofport, "Tunnel port still flooded to, keeping");
            return Ok(());
        }

        let key = self
            .tunnel_ports
            .iter()
            .find(|((t, _), p)| *t == network_type && **p == ofport)
            .map(|(k, _)| k.clone());
        let Some(key) = key else {
            debug!(ofport, "No tunnel port registered for ofport");
            return Ok(());
        };

        self.tunnel_ports.remove(&key);
        let (_, remote_ip) = key;
        if let Ok(port_name) = tunnel_port_name(network_type, &remote_ip) {
            let cmd = build_del_port_cmd(&self.bridge, &port_name);
            self.exec(&cmd).await?;
            info!(%remote_ip, ofport, "Tunnel port reclaimed");
        }
        Ok(())
    }

    async fn add_fdb_flow(
        &mut self,
        entry: &PortEntry,
        lvm: &LocalVlanMapping,
        ofport: OfPort,
    ) -> L2PopResult<()> {
        match entry {
            PortEntry::Unicast { mac, .. } => {
                let spec = unicast_flow_spec(lvm.vlan, mac, lvm.segmentation_id, ofport);
                self.emit(FlowOp::Add(spec)).await
            }
            PortEntry::Flooding => {
                self.flood_ofports.entry(lvm.vlan).or_default().insert(ofport);
                let ports = self.flood_ofports[&lvm.vlan].clone();
                let spec = flood_flow_spec(lvm.vlan, lvm.segmentation_id, ports.iter());
                self.emit(FlowOp::Add(spec)).await
            }
        }
    }

    async fn del_fdb_flow(
        &mut self,
        entry: &PortEntry,
        lvm: &LocalVlanMapping,
        ofport: OfPort,
    ) -> L2PopResult<()> {
        match entry {
            PortEntry::Unicast { mac, .. } => {
                let matcher = unicast_match_spec(lvm.vlan, mac);
                self.emit(FlowOp::Delete(matcher)).await
            }
            PortEntry::Flooding => {
                let remaining = match self.flood_ofports.get_mut(&lvm.vlan) {
                    Some(set) => {
                        set.remove(&ofport);
                        set.clone()
                    }
                    None => BTreeSet::new(),
                };
                if remaining.is_empty() {
                    self.flood_ofports.remove(&lvm.vlan);
                    self.emit(FlowOp::Delete(flood_match_spec(lvm.vlan))).await
                } else {
                    let spec = flood_flow_spec(lvm.vlan, lvm.segmentation_id, remaining.iter());
                    self.emit(FlowOp::Add(spec)).await
                }
            }
        }
    }

    fn defer_apply_on(&mut self) {
        if self.deferred.is_none() {
            self.deferred = Some(Vec::new());
        }
    }

    async fn defer_apply_off(&mut self) -> L2PopResult<()> {
        let Some(ops) = self.deferred.take() else {
            return Ok(());
        };
        if ops.is_empty() {
            return Ok(());
        }

        let lines: Vec<String> = ops
            .iter()
            .map(|op| match op {
                FlowOp::Add(spec) => format!("add {}", spec),
                FlowOp::Delete(matcher) => format!("delete {}", matcher),
            })
            .collect();
        let cmd = build_flow_bundle_cmd(&self.bridge, &lines);
        self.exec(&cmd).await
    }
}
