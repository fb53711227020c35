//! Common types for the L2 population agent.
//!
//! This crate provides type-safe representations of the network primitives
//! the agent passes between its FDB dispatcher, flow backend and ARP
//! responder:
//!
//! - [`MacAddress`]: 48-bit Ethernet MAC addresses
//! - [`VlanId`]: IEEE 802.1Q VLAN identifiers
//! - [`TunnelType`]: overlay tunnel encapsulations

mod mac;
mod tunnel;
mod vlan;

pub use mac::MacAddress;
pub use tunnel::TunnelType;
pub use vlan::{VlanId, OFPVID_PRESENT};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(u16),

    #[error("invalid tunnel type: {0}")]
    InvalidTunnelType(String),
}
