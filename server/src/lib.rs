//! # Session Server Library
//!
//! Server side of the datagram session protocol. It keeps a registry of
//! connected clients, probes each of them with heartbeats to find out who is
//! still alive, and hands all other traffic to an application handler.
//!
//! ## Core Responsibilities
//!
//! ### Client Registry
//! One entry per source address, identified by a [`shared::ClientId`] handed
//! out in increasing order. Registration, removal, lookup and listing all go
//! through a single lock shared with the heartbeat sweep.
//!
//! ### Liveness
//! UDP never reports a vanished peer. The server sends periodic Heartbeat
//! probes carrying its virtual time, retries unanswered ones with linear
//! backoff, and evicts peers that exhaust the retry budget or stay silent
//! past the hard timeout.
//!
//! ### Dispatch
//! Heartbeat echoes feed the latency measurement. Connect, Disconnect,
//! Message and the reserved kinds go to the registered handler, which may
//! register, evict or relay. [`dispatch::ChatRelay`] is the stock policy.
//!
//! ## Module Organization
//!
//! ### Client Manager Module (`client_manager`)
//! Peer bookkeeping: addresses, registration time, heartbeat state, latency.
//!
//! ### Heartbeat Module (`heartbeat`)
//! Probe scheduling, retry budget, eviction and acknowledgment handling.
//!
//! ### Dispatch Module (`dispatch`)
//! Handler traits and the router used by the receive task.
//!
//! ### Network Module (`network`)
//! Sockets, the receive task, the tick, and the synchronized registry API.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use server::dispatch::ChatRelay;
//! use server::network::{Server, ServerConfig};
//! use shared::ClientId;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = Server::new(ServerConfig::default());
//!     server.set_handler(ChatRelay);
//!     server.set_timeout_handler(|client_id: ClientId| println!("client {} timed out", client_id));
//!
//!     server.start().await?;
//!     // Sweeps heartbeats every tick until `stop` is called
//!     server.run(Duration::from_millis(16)).await;
//!
//!     Ok(())
//! }
//! ```

pub mod client_manager;
pub mod dispatch;
pub mod heartbeat;
pub mod network;
