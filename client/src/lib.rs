//! # Session Client Library
//!
//! Client side of the datagram session protocol. A [`network::Client`] opens
//! one session with a server, answers its heartbeat probes, follows its
//! virtual clock, and gives up on the server when the probes stop.
//!
//! ## Module Organization
//!
//! ### Network Module (`network`)
//! Handshake, the receive task, the timeout tick and sends to the server.
//!
//! ### Dispatch Module (`dispatch`)
//! The handler trait, the router used by the receive task, and
//! [`dispatch::ChatPrinter`] for terminal chat.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::dispatch::ChatPrinter;
//! use client::network::Client;
//! use shared::Packet;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::new();
//!     client.set_handler(ChatPrinter);
//!
//!     let server = "127.0.0.1:5600".parse()?;
//!     client.connect(server, "alice", Duration::from_secs(10)).await?;
//!     client.send(&Packet::Message { text: "hello".to_string() })?;
//!
//!     let mut tick = tokio::time::interval(Duration::from_millis(16));
//!     while client.is_connected() {
//!         tick.tick().await;
//!         client.update(Duration::from_millis(16));
//!     }
//!
//!     Ok(())
//! }
//! ```

pub mod dispatch;
pub mod network;
