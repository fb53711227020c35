//! Message and mapping types for FDB synchronization.

use std::collections::HashMap;

use l2pop_common::{L2PopError, L2PopResult};
use l2pop_types::{MacAddress, TunnelType, VlanId};
use serde::{Deserialize, Serialize};

/// Opaque key identifying a tenant network/segment.
pub type NetworkId = String;

/// OpenFlow port number on the tunnel bridge.
pub type OfPort = u32;

/// Delivery context of one FDB message, carried through to handlers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RpcContext {
    /// Request correlation id assigned by the delivery layer.
    pub request_id: Option<String>,
}

/// This agent's local context for one tenant network.
///
/// Created by the bridge-management layer on the first local port binding
/// and destroyed when the last local port goes away. The dispatcher treats
/// it as an immutable lookup value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalVlanMapping {
    /// Local VLAN tag the network is wired to on this host.
    pub vlan: VlanId,
    /// Overlay encapsulation used to reach remote agents.
    pub network_type: TunnelType,
    /// Physical network name, unset for pure overlay networks.
    pub physical_network: Option<String>,
    /// Tunnel key (GRE key / VXLAN VNI) of the segment.
    pub segmentation_id: u32,
    /// Locally bound port names.
    pub local_ports: Vec<String>,
}

impl LocalVlanMapping {
    pub fn new(vlan: VlanId, network_type: TunnelType, segmentation_id: u32) -> Self {
        Self {
            vlan,
            network_type,
            physical_network: None,
            segmentation_id,
            local_ports: Vec::new(),
        }
    }
}

/// One remote port reachable through a given remote agent.
///
/// The flooding variant is the broadcast pseudo-port used to track tunnel
/// liveness; on the wire it is the `["00:00:00:00:00:00", "0.0.0.0"]` pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "(String, String)", into = "(String, String)")]
pub enum PortEntry {
    /// A real remote port with its MAC and IP.
    Unicast { mac: MacAddress, ip: String },
    /// The broadcast pseudo-port.
    Flooding,
}

/// Wire IP of the flooding pseudo-entry.
const FLOODING_IP: &str = "0.0.0.0";

impl PortEntry {
    pub fn unicast(mac: MacAddress, ip: impl Into<String>) -> Self {
        PortEntry::Unicast { mac, ip: ip.into() }
    }

    pub fn is_flooding(&self) -> bool {
        matches!(self, PortEntry::Flooding)
    }
}

impl TryFrom<(String, String)> for PortEntry {
    type Error = l2pop_types::ParseError;

    fn try_from((mac, ip): (String, String)) -> Result<Self, Self::Error> {
        let mac: MacAddress = mac.parse()?;
        if mac.is_zero() && ip == FLOODING_IP {
            Ok(PortEntry::Flooding)
        } else {
            Ok(PortEntry::Unicast { mac, ip })
        }
    }
}

impl From<PortEntry> for (String, String) {
    fn from(entry: PortEntry) -> (String, String) {
        match entry {
            PortEntry::Unicast { mac, ip } => (mac.to_string(), ip),
            PortEntry::Flooding => (MacAddress::ZERO.to_string(), FLOODING_IP.to_string()),
        }
    }
}

/// Per-network payload of an FDB add/remove message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkFdb {
    pub network_type: TunnelType,
    pub segment_id: u32,
    /// Remote agent tunnel IP -> port entries reachable through it.
    #[serde(default)]
    pub ports: HashMap<String, Vec<PortEntry>>,
}

/// The add/remove FDB message: network id -> per-network payload.
pub type FdbEntriesMessage = HashMap<NetworkId, NetworkFdb>;

/// Before/after port listing for one remote agent in a `chg_ip` update.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortDiff {
    #[serde(default)]
    pub before: Vec<PortEntry>,
    #[serde(default)]
    pub after: Vec<PortEntry>,
}

/// Payload of the `chg_ip` update action:
/// network id -> remote agent IP -> before/after entries.
pub type ChgIpPayload = HashMap<NetworkId, HashMap<String, PortDiff>>;

/// Wire form of an FDB update message: action tag -> action payload.
pub type FdbUpdateMessage = HashMap<String, serde_json::Value>;

/// A decoded FDB update action.
///
/// The action vocabulary is closed here on purpose: an unknown tag is a
/// protocol/version mismatch and fails the whole call instead of being
/// silently dropped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FdbUpdate {
    /// A remote port's IP changed while its MAC/network stayed the same.
    ChgIp(ChgIpPayload),
}

impl FdbUpdate {
    /// Decodes one `(action, payload)` pair from an update message.
    pub fn decode(action: &str, payload: serde_json::Value) -> L2PopResult<Self> {
        match action {
            "chg_ip" => {
                let payload: ChgIpPayload = serde_json::from_value(payload)
                    .map_err(|e| L2PopError::malformed_message(e.to_string()))?;
                Ok(FdbUpdate::ChgIp(payload))
            }
            other => Err(L2PopError::unsupported_action(other)),
        }
    }
}
