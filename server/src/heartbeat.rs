//! Liveness probing for registered peers
//!
//! UDP gives no signal when a peer goes away, so the server probes every
//! client with a Heartbeat and waits for it to be echoed. Unanswered probes
//! are retried with linear backoff (`interval * (retry + 1)` since the first
//! probe of the sequence). A peer is evicted once the retry budget is spent
//! or the hard timeout has passed since that first probe.
//!
//! The scheduler only mutates the registry and reports what to send; the
//! server performs the I/O while still holding its lock.

use crate::client_manager::ClientManager;
use log::{debug, warn};
use shared::{ClientId, CLIENT_TIMEOUT_MS, HEARTBEAT_INTERVAL_MS, HEARTBEAT_RETRIES};
use std::net::SocketAddr;

/// A probe the server must send this tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub client_id: ClientId,
    pub addr: SocketAddr,
}

/// Outcome of one sweep over the registry
#[derive(Debug, Default)]
pub struct Sweep {
    pub probes: Vec<Probe>,
    pub evicted: Vec<(ClientId, SocketAddr)>,
}

/// Outcome of an incoming Heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    /// No peer is registered at the source address
    Unknown,
    /// The peer had no probe outstanding
    Unsolicited(ClientId),
    Accepted { client_id: ClientId, latency: i64 },
}

#[derive(Debug, Clone, Copy)]
pub struct HeartbeatScheduler {
    /// Virtual ms between probes
    pub interval: i64,
    /// Probes tolerated without an answer
    pub max_retries: u32,
    /// Virtual ms after the first unanswered probe before eviction
    pub timeout: i64,
}

impl HeartbeatScheduler {
    pub fn new(interval: i64, max_retries: u32, timeout: i64) -> Self {
        Self {
            interval: interval.max(1),
            max_retries,
            timeout,
        }
    }

    /// Walks every peer once: evicts the dead ones and schedules probes.
    pub fn sweep(&self, clients: &mut ClientManager, now: i64) -> Sweep {
        let mut sweep = Sweep::default();
        let mut expired = Vec::new();

        for (client_id, peer) in clients.iter_mut() {
            let elapsed = now - peer.last_heartbeat;

            if elapsed >= self.timeout || peer.heartbeat_retry > self.max_retries {
                expired.push(*client_id);
                continue;
            }

            if elapsed < self.interval {
                continue;
            }

            let backoff = self.interval * (i64::from(peer.heartbeat_retry) + 1);
            if !peer.heartbeat_waiting || elapsed >= backoff {
                if peer.heartbeat_retry == 0 {
                    peer.last_heartbeat = now;
                    peer.heartbeat_sent = now;
                } else {
                    debug!(
                        "Retrying heartbeat ({}) for client {}",
                        peer.heartbeat_retry, client_id
                    );
                }
                peer.heartbeat_waiting = true;
                peer.heartbeat_retry += 1;

                sweep.probes.push(Probe {
                    client_id: *client_id,
                    addr: peer.addr,
                });
            }
        }

        for client_id in expired {
            if let Some(peer) = clients.remove_client(client_id) {
                warn!("Client {} at {} timed out", client_id, peer.addr);
                sweep.evicted.push((client_id, peer.addr));
            }
        }

        sweep
    }

    /// Applies a Heartbeat echoed by the peer at `addr`.
    pub fn acknowledge(
        &self,
        clients: &mut ClientManager,
        addr: SocketAddr,
        now: i64,
    ) -> Acknowledgement {
        let Some((client_id, peer)) = clients.get_by_addr_mut(addr) else {
            return Acknowledgement::Unknown;
        };

        if !peer.heartbeat_waiting {
            warn!("Unsolicited heartbeat from client {} at {}", client_id, addr);
            return Acknowledgement::Unsolicited(client_id);
        }

        peer.latency = now - peer.heartbeat_sent;
        peer.heartbeat_sent = now;
        peer.heartbeat_waiting = false;
        peer.heartbeat_retry = 0;

        debug!(
            "Heartbeat from client {} at {} ({} ms)",
            client_id, addr, peer.latency
        );

        Acknowledgement::Accepted {
            client_id,
            latency: peer.latency,
        }
    }
}

impl Default for HeartbeatScheduler {
    fn default() -> Self {
        Self::new(HEARTBEAT_INTERVAL_MS, HEARTBEAT_RETRIES, CLIENT_TIMEOUT_MS)
    }
}
