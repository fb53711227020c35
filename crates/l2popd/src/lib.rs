//! L2 population agent - distributed FDB synchronization for overlay bridges
//!
//! l2popd keeps the tunnel bridge of one virtual-switch agent consistent
//! with the fabric-wide forwarding table, handling:
//! - Tunnel port lifecycle towards remote agents (lazy create, reclaim)
//! - Per-MAC unicast steering and per-VLAN flood flows
//! - ARP proxying from cached reachability data, with controller-bypass
//!   flows for traffic the cache cannot answer

pub mod agent;
pub mod arp_responder;
pub mod commands;
pub mod fdb_sync;
pub mod flow_backend;
pub mod openflow;
pub mod packet;
pub mod tables;
pub mod types;

pub use agent::{Agent, AgentEvent};
pub use arp_responder::{ArpResponder, ArpTable};
pub use fdb_sync::FdbSync;
pub use flow_backend::{FlowBackend, OvsFlowBackend};
pub use openflow::{OpenFlowApi, OvsOpenFlowApi, PacketIn};
