//! Registry of connected peers
//!
//! This module holds the server-side bookkeeping for every session:
//! - Id assignment in strictly increasing order, never reused
//! - One entry per source address
//! - Heartbeat state consumed by the scheduler in [`crate::heartbeat`]
//!
//! The registry itself does no I/O and no locking. The server keeps it
//! behind a single lock together with its virtual clock and socket.

use log::info;
use shared::{ClientId, VirtualClock};
use std::collections::HashMap;
use std::net::SocketAddr;

/// Server's knowledge of one connected client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Source address the client talks from
    pub addr: SocketAddr,
    /// Virtual time at which the client was registered
    pub registered_at: i64,
    /// Baseline for timeout and probe pacing, moved on the first probe of a sequence
    pub last_heartbeat: i64,
    /// When the current probe sequence started; latency is measured from here
    pub heartbeat_sent: i64,
    /// A probe is outstanding
    pub heartbeat_waiting: bool,
    /// Probes sent since the last acknowledgment
    pub heartbeat_retry: u32,
    /// Last measured round trip, in virtual milliseconds
    pub latency: i64,
}

impl PeerInfo {
    /// Creates a fresh entry with zeroed heartbeat bookkeeping.
    pub fn new(addr: SocketAddr, now: i64) -> Self {
        Self {
            addr,
            registered_at: now,
            last_heartbeat: now,
            heartbeat_sent: now,
            heartbeat_waiting: false,
            heartbeat_retry: 0,
            latency: 0,
        }
    }
}

/// Maps session ids to peers
pub struct ClientManager {
    clients: HashMap<ClientId, PeerInfo>,
    /// Next id to hand out
    next_client_id: u32,
}

impl ClientManager {
    pub fn new() -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 0,
        }
    }

    /// Registers a peer at `addr`.
    ///
    /// Returns None without touching the registry if the address is already
    /// known, or if the id space is exhausted.
    pub fn add_client(&mut self, addr: SocketAddr, now: i64) -> Option<ClientId> {
        if self.contains_addr(addr) {
            return None;
        }

        let client_id = ClientId(self.next_client_id);
        self.next_client_id = self.next_client_id.checked_add(1)?;

        info!("Client {} registered from {}", client_id, addr);
        self.clients.insert(client_id, PeerInfo::new(addr, now));

        Some(client_id)
    }

    pub fn remove_client(&mut self, client_id: ClientId) -> Option<PeerInfo> {
        let removed = self.clients.remove(&client_id);
        if removed.is_some() {
            info!("Client {} removed", client_id);
        }
        removed
    }

    pub fn remove_client_by_addr(&mut self, addr: SocketAddr) -> Option<(ClientId, PeerInfo)> {
        let client_id = self.find_client_by_addr(addr)?;
        self.remove_client(client_id).map(|peer| (client_id, peer))
    }

    /// Finds the id registered for a source address
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<ClientId> {
        self.clients
            .iter()
            .find(|(_, peer)| peer.addr == addr)
            .map(|(id, _)| *id)
    }

    pub fn get(&self, client_id: ClientId) -> Option<&PeerInfo> {
        self.clients.get(&client_id)
    }

    pub fn get_by_addr_mut(&mut self, addr: SocketAddr) -> Option<(ClientId, &mut PeerInfo)> {
        self.clients
            .iter_mut()
            .find(|(_, peer)| peer.addr == addr)
            .map(|(id, peer)| (*id, peer))
    }

    pub fn contains(&self, client_id: ClientId) -> bool {
        self.clients.contains_key(&client_id)
    }

    pub fn contains_addr(&self, addr: SocketAddr) -> bool {
        self.clients.values().any(|peer| peer.addr == addr)
    }

    /// All ids with their addresses, ordered by id
    pub fn get_client_addrs(&self) -> Vec<(ClientId, SocketAddr)> {
        let mut addrs: Vec<(ClientId, SocketAddr)> = self
            .clients
            .iter()
            .map(|(id, peer)| (*id, peer.addr))
            .collect();
        addrs.sort_by_key(|(id, _)| *id);
        addrs
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&ClientId, &mut PeerInfo)> {
        self.clients.iter_mut()
    }

    /// Carries every stored timestamp across a clock wrap.
    pub fn rebase_timestamps(&mut self, clock: &VirtualClock) {
        for peer in self.clients.values_mut() {
            peer.registered_at = clock.rebase(peer.registered_at);
            peer.last_heartbeat = clock.rebase(peer.last_heartbeat);
            peer.heartbeat_sent = clock.rebase(peer.heartbeat_sent);
        }
    }

    pub fn clear(&mut self) {
        self.clients.clear();
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}

impl Default for ClientManager {
    fn default() -> Self {
        Self::new()
    }
}
