//! OVS command and flow-spec builders for the tunnel bridge.

use std::net::Ipv4Addr;

use l2pop_common::shell::{shellquote, OVS_OFCTL_CMD, OVS_VSCTL_CMD};
use l2pop_common::{L2PopError, L2PopResult};
use l2pop_types::{MacAddress, TunnelType, VlanId};

use crate::tables::{
    BYPASS_FLOW_PRIORITY, BYPASS_IDLE_TIMEOUT, FLOOD_FLOW_PRIORITY, FLOOD_TO_TUN,
    PATCH_LV_TO_TUN, UCAST_FLOW_PRIORITY, UCAST_TO_TUN,
};
use crate::types::OfPort;

/// Derives the tunnel port name for a remote agent: `<type>-<ip-in-hex>`.
///
/// A remote address that is not a dotted-quad IPv4 address yields
/// `InvalidRemoteAddress`; callers treat it the same as
/// tunnel-unavailable.
pub fn tunnel_port_name(tunnel_type: TunnelType, remote_ip: &str) -> L2PopResult<String> {
    let hex =
        ip_in_hex(remote_ip).ok_or_else(|| L2PopError::invalid_remote_address(remote_ip))?;
    Ok(format!("{}-{}", tunnel_type, hex))
}

/// Formats a dotted-quad IPv4 address as eight hex digits (`10.1.0.1`
/// becomes `0a010001`).
pub fn ip_in_hex(ip: &str) -> Option<String> {
    let addr: std::net::Ipv4Addr = ip.parse().ok()?;
    let octets = addr.octets();
    Some(format!(
        "{:02x}{:02x}{:02x}{:02x}",
        octets[0], octets[1], octets[2], octets[3]
    ))
}

/// Build the tunnel port creation command.
///
/// Sets the interface type and remote endpoint in the same transaction so
/// a half-created port is never visible.
pub fn build_add_tunnel_port_cmd(
    bridge: &str,
    port_name: &str,
    tunnel_type: TunnelType,
    local_ip: &str,
    remote_ip: &str,
) -> String {
    format!(
        "{} --timeout=10 --may-exist add-port {} {} \
         -- set Interface {} type={} options:local_ip={} options:remote_ip={} options:in_key=flow options:out_key=flow",
        OVS_VSCTL_CMD,
        shellquote(bridge),
        shellquote(port_name),
        shellquote(port_name),
        tunnel_type,
        shellquote(local_ip),
        shellquote(remote_ip),
    )
}

/// Build the ofport lookup command for a tunnel port.
pub fn build_get_ofport_cmd(port_name: &str) -> String {
    format!(
        "{} --timeout=10 get Interface {} ofport",
        OVS_VSCTL_CMD,
        shellquote(port_name)
    )
}

/// Build the tunnel port deletion command.
pub fn build_del_port_cmd(bridge: &str, port_name: &str) -> String {
    format!(
        "{} --timeout=10 --if-exists del-port {} {}",
        OVS_VSCTL_CMD,
        shellquote(bridge),
        shellquote(port_name)
    )
}

/// Build a single add-flow command.
pub fn build_add_flow_cmd(bridge: &str, flow_spec: &str) -> String {
    format!(
        "{} add-flow {} {}",
        OVS_OFCTL_CMD,
        shellquote(bridge),
        shellquote(flow_spec)
    )
}

/// Build a single del-flows command.
pub fn build_del_flows_cmd(bridge: &str, match_spec: &str) -> String {
    format!(
        "{} del-flows {} {}",
        OVS_OFCTL_CMD,
        shellquote(bridge),
        shellquote(match_spec)
    )
}

/// Build a batched flow-mutation command committing all lines as one
/// bundle transaction.
///
/// Lines are `add <spec>` / `delete <match>` directives in `ovs-ofctl
/// bundle` syntax, fed on stdin so one network's mutations apply
/// atomically.
pub fn build_flow_bundle_cmd(bridge: &str, lines: &[String]) -> String {
    format!(
        "printf '%s\\n' {} | {} bundle {} -",
        lines
            .iter()
            .map(|l| shellquote(l))
            .collect::<Vec<_>>()
            .join(" "),
        OVS_OFCTL_CMD,
        shellquote(bridge),
    )
}

/// Flow spec steering a known unicast MAC into its tunnel.
pub fn unicast_flow_spec(vlan: VlanId, mac: &MacAddress, segment_id: u32, ofport: OfPort) -> String {
    format!(
        "table={},priority={},dl_vlan={},dl_dst={},actions=strip_vlan,set_tunnel:{},output:{}",
        UCAST_TO_TUN, UCAST_FLOW_PRIORITY, vlan, mac, segment_id, ofport
    )
}

/// Match spec of a unicast steering flow, for deletion.
pub fn unicast_match_spec(vlan: VlanId, mac: &MacAddress) -> String {
    format!("table={},dl_vlan={},dl_dst={}", UCAST_TO_TUN, vlan, mac)
}

/// Flow spec flooding a VLAN out every live tunnel port.
pub fn flood_flow_spec<'a>(
    vlan: VlanId,
    segment_id: u32,
    ofports: impl IntoIterator<Item = &'a OfPort>,
) -> String {
    let outputs = ofports
        .into_iter()
        .map(|p| format!("output:{}", p))
        .collect::<Vec<_>>()
        .join(",");
    format!(
        "table={},priority={},dl_vlan={},actions=strip_vlan,set_tunnel:{},{}",
        FLOOD_TO_TUN, FLOOD_FLOW_PRIORITY, vlan, segment_id, outputs
    )
}

/// Match spec of a VLAN's flood flow, for deletion.
pub fn flood_match_spec(vlan: VlanId) -> String {
    format!("table={},dl_vlan={}", FLOOD_TO_TUN, vlan)
}

/// Short-lived flow letting an already-classified VLAN's traffic skip
/// the controller and continue down the pipeline.
pub fn vlan_bypass_flow_spec(vlan: VlanId) -> String {
    format!(
        "table={},priority={},idle_timeout={},dl_type=0x8100,vlan_tci={:#06x}/0x1fff,actions=resubmit(,{})",
        PATCH_LV_TO_TUN,
        BYPASS_FLOW_PRIORITY,
        BYPASS_IDLE_TIMEOUT,
        vlan.as_ofp_vid(),
        FLOOD_TO_TUN
    )
}

/// Short-lived flow letting repeat ARP requests for one unanswerable
/// target IP skip the controller.
pub fn arp_bypass_flow_spec(vlan: VlanId, target_ip: Ipv4Addr) -> String {
    format!(
        "table={},priority={},idle_timeout={},arp,dl_vlan={},arp_op=1,arp_tpa={},actions=resubmit(,{})",
        PATCH_LV_TO_TUN,
        BYPASS_FLOW_PRIORITY,
        BYPASS_IDLE_TIMEOUT,
        vlan,
        target_ip,
        FLOOD_TO_TUN
    )
}

/// Build a packet-out command re-injecting a raw frame with the given
/// output actions.
pub fn build_packet_out_cmd(bridge: &str, in_port: OfPort, actions: &str, data: &[u8]) -> String {
    let hex: String = data.iter().map(|b| format!("{:02x}", b)).collect();
    let request = format!("in_port={},packet={},actions={}", in_port, hex, actions);
    format!(
        "{} packet-out {} {}",
        OVS_OFCTL_CMD,
        shellquote(bridge),
        shellquote(&request)
    )
}
