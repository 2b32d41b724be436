//! Protocol pieces shared by the session server and its clients.
//!
//! Both sides speak the same datagram format ([`packet`]) and keep their own
//! [`clock::VirtualClock`], which the server periodically pushes to clients
//! inside heartbeat probes.

pub mod clock;
pub mod error;
pub mod packet;

pub use clock::VirtualClock;
pub use error::NetError;
pub use packet::{Packet, PacketType};

use std::fmt;

/// Well-known port the server listens on for inbound traffic.
pub const SERVER_PORT: u16 = 5600;
/// Virtual clocks wrap when they reach this value.
pub const HIGHEST_TIMESTAMP: i64 = i32::MAX as i64;
/// Silence (in virtual milliseconds) after which either side gives up on its peer.
pub const CLIENT_TIMEOUT_MS: i64 = 10_000;
/// Default time a client waits for the server to answer a Connect.
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;
/// Virtual milliseconds between heartbeat probes to one peer.
pub const HEARTBEAT_INTERVAL_MS: i64 = 1_000;
/// Unanswered probes tolerated before a peer is evicted.
pub const HEARTBEAT_RETRIES: u32 = 5;
/// Upper bound for a single datagram, in bytes.
pub const MAX_PACKET_SIZE: usize = 2048;

/// Server-assigned handle for a connected peer
///
/// Ids are handed out in increasing order and are never reused while the
/// server process is alive. The absence of a peer is `Option::None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u32);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
