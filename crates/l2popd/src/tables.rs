//! Tunnel bridge flow pipeline constants.
//!
//! Table numbering follows the standard overlay bridge pipeline: packets
//! from the integration patch port enter PATCH_LV_TO_TUN, known unicast
//! destinations are steered in UCAST_TO_TUN, and everything unknown falls
//! through to FLOOD_TO_TUN.

/// Entry table for traffic arriving from the integration bridge.
pub const PATCH_LV_TO_TUN: u8 = 1;

/// MAC-learning table fed from tunnel ingress.
pub const LEARN_FROM_TUN: u8 = 10;

/// Known-unicast-to-tunnel steering table.
pub const UCAST_TO_TUN: u8 = 20;

/// Broadcast/unknown flood table.
pub const FLOOD_TO_TUN: u8 = 21;

/// Priority of per-MAC unicast steering flows.
pub const UCAST_FLOW_PRIORITY: u16 = 2;

/// Priority of per-VLAN flood flows.
pub const FLOOD_FLOW_PRIORITY: u16 = 1;

/// Priority of controller-bypass flows installed by the packet classifier.
pub const BYPASS_FLOW_PRIORITY: u16 = 20;

/// Idle timeout (seconds) of controller-bypass flows. Short on purpose:
/// the flow only has to throttle repeat packet-ins for traffic that was
/// already classified.
pub const BYPASS_IDLE_TIMEOUT: u16 = 5;
