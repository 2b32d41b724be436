use crate::ClientId;
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

/// Failures reported by session and registry operations.
///
/// Malformed datagrams never show up here: decoding drops them silently.
#[derive(Debug, Error)]
pub enum NetError {
    #[error("no handshake response from {server} within {timeout:?}")]
    HandshakeTimeout {
        server: SocketAddr,
        timeout: Duration,
    },

    #[error("transport failure: {0}")]
    Transport(#[from] std::io::Error),

    #[error("failed to encode packet: {0}")]
    Encode(#[from] bincode::Error),

    #[error("session is not connected")]
    NotConnected,

    #[error("session is already connected")]
    AlreadyConnected,

    #[error("server is not running")]
    NotRunning,

    #[error("server is already running")]
    AlreadyRunning,

    #[error("unknown client {0}")]
    UnknownClient(ClientId),
}
