//! Controller-side OpenFlow primitives consumed by the packet classifier.
//!
//! The classifier only needs two switch operations: install a short-lived
//! controller-bypass flow, and push a raw frame out with a chosen output
//! action. Both are behind [`OpenFlowApi`] so classifier tests can record
//! calls instead of shelling out.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use l2pop_common::{shell, L2PopResult};
use l2pop_types::VlanId;
use tracing::debug;

use crate::commands;
use crate::types::OfPort;

/// A packet delivered to the controller after missing every flow rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketIn {
    pub in_port: OfPort,
    pub data: Vec<u8>,
}

/// Match of a controller-bypass flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassMatch {
    /// All traffic of one VLAN, matched on `0x8100` plus the OpenFlow
    /// vid with its presence bit.
    Vlan { vlan: VlanId },

    /// Repeat ARP requests for one target IP the cache could not answer.
    ArpRequest { vlan: VlanId, target_ip: Ipv4Addr },
}

impl BypassMatch {
    pub fn to_flow_spec(&self) -> String {
        match self {
            BypassMatch::Vlan { vlan } => commands::vlan_bypass_flow_spec(*vlan),
            BypassMatch::ArpRequest { vlan, target_ip } => {
                commands::arp_bypass_flow_spec(*vlan, *target_ip)
            }
        }
    }
}

/// Where a packet-out frame goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputPort {
    /// A specific switch port, used for synthesized ARP replies.
    Port(OfPort),

    /// Rerun the packet through the full flow pipeline from table 0
    /// (the OFPP_TABLE reserved port), so unicast steering and flood
    /// flows all get their chance to match.
    Pipeline,

    /// Flood out all ports; last resort for frames that do not parse.
    Flood,
}

impl OutputPort {
    fn to_actions(self) -> String {
        match self {
            OutputPort::Port(ofport) => format!("output:{}", ofport),
            OutputPort::Pipeline => "table".to_string(),
            OutputPort::Flood => "flood".to_string(),
        }
    }
}

#[async_trait]
pub trait OpenFlowApi: Send {
    /// Installs a short-idle-timeout flow that lets matching traffic skip
    /// the controller and continue down the pipeline.
    async fn install_bypass_flow(&mut self, bypass: &BypassMatch) -> L2PopResult<()>;

    /// Pushes a raw frame out with the given output action, attributed to
    /// the original ingress port.
    async fn send_packet(
        &mut self,
        in_port: OfPort,
        data: &[u8],
        output: OutputPort,
    ) -> L2PopResult<()>;
}

/// [`OpenFlowApi`] implementation driving `ovs-ofctl` on the tunnel bridge.
pub struct OvsOpenFlowApi {
    bridge: String,

    #[cfg(test)]
    mock_mode: bool,
    #[cfg(test)]
    captured_commands: Vec<String>,
}

impl OvsOpenFlowApi {
    pub fn new(bridge: impl Into<String>) -> Self {
        Self {
            bridge: bridge.into(),
            #[cfg(test)]
            mock_mode: false,
            #[cfg(test)]
            captured_commands: Vec::new(),
        }
    }

    #[cfg(test)]
    pub fn new_mock(bridge: impl Into<String>) -> Self {
        let mut api = Self::new(bridge);
        api.mock_mode = true;
        api
    }

    #[cfg(test)]
    pub fn captured_commands(&self) -> &[String] {
        &self.captured_commands
    }

    async fn exec(&mut self, cmd: &str) -> L2PopResult<()> {
        #[cfg(test)]
        if self.mock_mode {
            self.captured_commands.push(cmd.to_string());
            return Ok(());
        }
        shell::exec_or_throw(cmd).await?;
        Ok(())
    }
}

#[async_trait]
impl OpenFlowApi for OvsOpenFlowApi {
    async fn install_bypass_flow(&mut self, bypass: &BypassMatch) -> L2PopResult<()> {
        let cmd = commands::build_add_flow_cmd(&self.bridge, &bypass.to_flow_spec());
        debug!(cmd, "Installing controller-bypass flow");
        self.exec(&cmd).await
    }

    async fn send_packet(
        &mut self,
        in_port: OfPort,
        data: &[u8],
        output: OutputPort,
    ) -> L2PopResult<()> {
        let cmd =
            commands::build_packet_out_cmd(&self.bridge, in_port, &output.to_actions(), data);
        self.exec(&cmd).await
    }
}
