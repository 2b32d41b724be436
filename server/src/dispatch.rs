//! Routing of decoded packets on the server
//!
//! Heartbeats are consumed by the acknowledgment path; every other packet is
//! handed to the application's [`ServerPacketHandler`], which is free to
//! mutate the registry through the [`Server`] handle it receives.

use crate::heartbeat::Acknowledgement;
use crate::network::Server;
use log::{debug, info, warn};
use shared::{ClientId, Packet};
use std::net::SocketAddr;

/// Application hook for non-heartbeat traffic
pub trait ServerPacketHandler: Send + Sync {
    fn handle(&self, addr: SocketAddr, packet: &Packet, server: &Server);
}

impl<F> ServerPacketHandler for F
where
    F: Fn(SocketAddr, &Packet, &Server) + Send + Sync,
{
    fn handle(&self, addr: SocketAddr, packet: &Packet, server: &Server) {
        self(addr, packet, server)
    }
}

/// Called once for each peer the heartbeat sweep evicts
pub trait TimeoutHandler: Send + Sync {
    fn on_timeout(&self, client_id: ClientId);
}

impl<F> TimeoutHandler for F
where
    F: Fn(ClientId) + Send + Sync,
{
    fn on_timeout(&self, client_id: ClientId) {
        self(client_id)
    }
}

/// Decodes one datagram and sends it where it belongs.
pub(crate) fn route(server: &Server, bytes: &[u8], addr: SocketAddr) {
    let Some(packet) = Packet::decode(bytes) else {
        debug!("Dropped malformed packet ({} bytes) from {}", bytes.len(), addr);
        return;
    };

    if let Packet::Heartbeat { .. } = packet {
        if server.acknowledge_heartbeat(addr) == Acknowledgement::Unknown {
            debug!("Heartbeat from unregistered address {}", addr);
        }
        return;
    }

    if let Some(handler) = server.handler() {
        handler.handle(addr, &packet, server);
    }
}

/// Chat relay policy
///
/// - Connect from an unknown address registers it and echoes the Connect back
/// - Connect from a known address is ignored; the first registration stands
/// - Disconnect evicts the sender and tells everyone else it left
/// - Message is relayed to every other peer, prefixed with the sender's address
#[derive(Debug, Default, Clone, Copy)]
pub struct ChatRelay;

impl ServerPacketHandler for ChatRelay {
    fn handle(&self, addr: SocketAddr, packet: &Packet, server: &Server) {
        match (server.client_id(addr), packet) {
            (None, Packet::Connect { player_name }) => {
                let Some(client_id) = server.add_client(addr) else {
                    return;
                };
                info!("{} joined as client {} from {}", player_name, client_id, addr);

                if let Err(e) = server.send(client_id, packet) {
                    warn!("Failed to acknowledge connect from {}: {}", addr, e);
                }
            }
            (Some(client_id), Packet::Connect { .. }) => {
                debug!("Ignoring repeated connect from client {}", client_id);
            }
            (Some(client_id), Packet::Disconnect) => {
                server.remove_client(client_id);
                info!("Client {} at {} left", client_id, addr);

                let notice = Packet::Message {
                    text: format!("Client left! {}", addr),
                };
                server.broadcast(&notice, None);
            }
            (Some(client_id), Packet::Message { text }) => {
                let relay = Packet::Message {
                    text: format!("{} :{}", addr, text),
                };
                server.broadcast(&relay, Some(client_id));
            }
            (None, other) => {
                debug!(
                    "Ignoring {:?} from unregistered address {}",
                    other.packet_type(),
                    addr
                );
            }
            (Some(_), _) => {}
        }
    }
}
