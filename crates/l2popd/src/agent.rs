//! Agent event loop.
//!
//! All FDB, ARP-cache and packet-in state is owned by one [`Agent`] task
//! consuming an mpsc channel, so every cache has exactly one writer and
//! events apply in arrival order. Producers (the RPC consumer, the
//! bridge-management layer, the packet-in listener) only hold a sender.

use l2pop_common::{L2PopError, L2PopResult};
use l2pop_types::{MacAddress, VlanId};
use std::net::Ipv4Addr;
use tokio::sync::mpsc;
use tracing::{error, info};

use crate::arp_responder::ArpResponder;
use crate::fdb_sync::FdbSync;
use crate::flow_backend::FlowBackend;
use crate::openflow::{OpenFlowApi, PacketIn};
use crate::types::{FdbEntriesMessage, FdbUpdateMessage, LocalVlanMapping, NetworkId, RpcContext};

/// One unit of work for the agent task.
#[derive(Debug)]
pub enum AgentEvent {
    RegisterNetwork {
        network_id: NetworkId,
        lvm: LocalVlanMapping,
    },
    UnregisterNetwork {
        network_id: NetworkId,
    },
    AddFdbEntries {
        ctx: RpcContext,
        entries: FdbEntriesMessage,
        target_host: Option<String>,
    },
    RemoveFdbEntries {
        ctx: RpcContext,
        entries: FdbEntriesMessage,
        target_host: Option<String>,
    },
    UpdateFdbEntries {
        ctx: RpcContext,
        updates: FdbUpdateMessage,
        target_host: Option<String>,
    },
    PacketIn(PacketIn),
    AddArpEntry {
        vlan: VlanId,
        ip: Ipv4Addr,
        mac: MacAddress,
    },
    DelArpEntry {
        vlan: VlanId,
        ip: Ipv4Addr,
    },
}

pub struct Agent<B, C> {
    fdb: FdbSync<B>,
    responder: ArpResponder<C>,
    rx: mpsc::Receiver<AgentEvent>,
}

impl<B: FlowBackend, C: OpenFlowApi> Agent<B, C> {
    pub fn new(fdb: FdbSync<B>, responder: ArpResponder<C>, rx: mpsc::Receiver<AgentEvent>) -> Self {
        Self { fdb, responder, rx }
    }

    /// Runs until every sender is dropped. Protocol violations abort the
    /// loop; switch-level failures are logged and the loop continues.
    pub async fn run(mut self) -> L2PopResult<()> {
        while let Some(event) = self.rx.recv().await {
            match self.handle_event(event).await {
                Ok(()) => {}
                Err(
                    e @ (L2PopError::UnsupportedAction { .. }
                    | L2PopError::UnknownArpCacheKey { .. }
                    | L2PopError::MalformedMessage { .. }),
                ) => {
                    error!("Protocol violation, stopping agent: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("Event handling failed: {}", e);
                }
            }
        }
        info!("Event channel closed, agent exiting");
        Ok(())
    }

    async fn handle_event(&mut self, event: AgentEvent) -> L2PopResult<()> {
        match event {
            AgentEvent::RegisterNetwork { network_id, lvm } => {
                self.fdb.register_network(network_id, lvm);
                Ok(())
            }
            AgentEvent::UnregisterNetwork { network_id } => {
                self.fdb.unregister_network(&network_id);
                Ok(())
            }
            AgentEvent::AddFdbEntries {
                ctx,
                entries,
                target_host,
            } => {
                self.fdb
                    .add_fdb_entries(&ctx, entries, target_host.as_deref())
                    .await
            }
            AgentEvent::RemoveFdbEntries {
                ctx,
                entries,
                target_host,
            } => {
                self.fdb
                    .remove_fdb_entries(&ctx, entries, target_host.as_deref())
                    .await
            }
            AgentEvent::UpdateFdbEntries {
                ctx,
                updates,
                target_host,
            } => {
                self.fdb
                    .update_fdb_entries(&ctx, updates, target_host.as_deref())
                    .await
            }
            AgentEvent::PacketIn(packet_in) => self.responder.handle_packet_in(packet_in).await,
            AgentEvent::AddArpEntry { vlan, ip, mac } => {
                self.responder.table_mut().add_entry(vlan, ip, mac);
                Ok(())
            }
            AgentEvent::DelArpEntry { vlan, ip } => self.responder.table_mut().del_entry(vlan, ip),
        }
    }
}
