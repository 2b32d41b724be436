//! Integration tests for the session server and client
//!
//! These run real sockets on the loopback interface and drive the virtual
//! clocks by hand through `update`.

use client::network::{Client, ConnectionState};
use server::dispatch::ChatRelay;
use server::network::{Server, ServerConfig};
use shared::{ClientId, NetError, Packet, MAX_PACKET_SIZE};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::sleep;
use tokio_test::{assert_err, assert_ok};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

async fn start_server() -> (Server, SocketAddr) {
    init_logging();
    let server = Server::new(ServerConfig {
        bind_addr: "127.0.0.1:0".parse().unwrap(),
        ..ServerConfig::default()
    });
    server.set_handler(ChatRelay);
    let addr = server.start().await.expect("server failed to start");
    (server, addr)
}

async fn connect_client(server_addr: SocketAddr, name: &str) -> Client {
    let client = Client::new();
    client
        .connect(server_addr, name, Duration::from_secs(2))
        .await
        .expect("handshake failed");
    client
}

/// Address the server sees for a client bound to the wildcard address
fn loopback(client: &Client) -> SocketAddr {
    let port = client.local_addr().expect("client has no socket").port();
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

async fn raw_peer() -> UdpSocket {
    UdpSocket::bind("127.0.0.1:0").await.unwrap()
}

async fn recv_packet(socket: &UdpSocket, wait: Duration) -> Option<Packet> {
    let mut buffer = [0u8; MAX_PACKET_SIZE];
    let (len, _) = tokio::time::timeout(wait, socket.recv_from(&mut buffer))
        .await
        .ok()?
        .ok()?;
    Packet::decode(&buffer[..len])
}

async fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(10)).await;
    }
    condition()
}

fn message_log(client: &Client) -> Arc<Mutex<Vec<String>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    client.set_handler(move |packet: &Packet, _: &Client| {
        if let Packet::Message { text } = packet {
            sink.lock().unwrap().push(text.clone());
        }
    });
    log
}

/// HANDSHAKE TESTS
mod handshake_tests {
    use super::*;

    /// A successful Connect leaves exactly one registry entry for the client
    #[tokio::test]
    async fn handshake_registers_client() {
        let (server, addr) = start_server().await;
        let client = connect_client(addr, "alice").await;

        assert_eq!(client.state(), ConnectionState::Connected);
        assert_eq!(client.server_addr(), Some(addr));
        assert_eq!(server.client_list(), vec![(ClientId(0), loopback(&client))]);

        client.disconnect();
        server.stop();
    }

    /// Repeating Connect from the same address neither re-registers nor re-acks
    #[tokio::test]
    async fn duplicate_connect_is_ignored() {
        let (server, addr) = start_server().await;
        let peer = raw_peer().await;
        let connect = Packet::Connect {
            player_name: "bob".to_string(),
        }
        .encode()
        .unwrap();

        peer.send_to(&connect, addr).await.unwrap();
        let ack = recv_packet(&peer, Duration::from_secs(2)).await;
        assert!(matches!(ack, Some(Packet::Connect { .. })));

        peer.send_to(&connect, addr).await.unwrap();
        assert_eq!(recv_packet(&peer, Duration::from_millis(300)).await, None);
        assert_eq!(server.client_count(), 1);

        server.stop();
    }

    /// A silent endpoint makes the handshake fail after the requested wait
    #[tokio::test]
    async fn handshake_times_out_against_silent_port() {
        init_logging();
        let silent = raw_peer().await;
        let client = Client::new();

        let started = Instant::now();
        let result = client
            .connect(
                silent.local_addr().unwrap(),
                "carol",
                Duration::from_millis(1000),
            )
            .await;
        let waited = started.elapsed();

        let error = assert_err!(result);
        assert!(matches!(error, NetError::HandshakeTimeout { .. }));
        assert!(waited >= Duration::from_millis(950));
        assert!(waited < Duration::from_secs(3));
        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(client.local_addr().is_none());
    }

    /// Garbage sent to the server never creates a registry entry
    #[tokio::test]
    async fn malformed_packets_leave_registry_empty() {
        let (server, addr) = start_server().await;
        let peer = raw_peer().await;

        for junk in [&[][..], &[7][..], &[0x7F, 1, 2, 3][..], &[0, 0, 0][..]] {
            peer.send_to(junk, addr).await.unwrap();
        }
        // Connect whose name claims more bytes than were sent
        assert_ok!(peer.send_to(&[0, 0, 0, 0, 50, b'x'], addr).await);

        assert!(wait_until(|| server.stats().bytes_received() > 0).await);
        sleep(Duration::from_millis(100)).await;
        assert_eq!(server.client_count(), 0);

        server.stop();
    }
}

/// RELAY TESTS
mod relay_tests {
    use super::*;

    /// Chat goes to every other client, prefixed with the sender's address
    #[tokio::test]
    async fn message_relay_excludes_sender() {
        let (server, addr) = start_server().await;
        let alice = connect_client(addr, "alice").await;
        let bob = connect_client(addr, "bob").await;
        let alice_log = message_log(&alice);
        let bob_log = message_log(&bob);

        assert_ok!(alice.send(&Packet::Message {
            text: "hello".to_string(),
        }));

        let expected = format!("{} :hello", loopback(&alice));
        assert!(wait_until(|| bob_log.lock().unwrap().contains(&expected)).await);

        sleep(Duration::from_millis(100)).await;
        assert!(alice_log.lock().unwrap().is_empty());

        alice.disconnect();
        bob.disconnect();
        server.stop();
    }

    /// Leaving announces the departure to the remaining clients
    #[tokio::test]
    async fn disconnect_is_announced() {
        let (server, addr) = start_server().await;
        let alice = connect_client(addr, "alice").await;
        let bob = connect_client(addr, "bob").await;
        let bob_log = message_log(&bob);
        let alice_addr = loopback(&alice);

        assert!(alice.disconnect());

        assert!(wait_until(|| server.client_count() == 1).await);
        let expected = format!("Client left! {}", alice_addr);
        assert!(wait_until(|| bob_log.lock().unwrap().contains(&expected)).await);

        bob.disconnect();
        server.stop();
    }

    /// One unreachable peer does not stop the others from receiving
    #[tokio::test]
    async fn broadcast_skips_failed_peer() {
        let (server, _) = start_server().await;
        let first = raw_peer().await;
        let second = raw_peer().await;

        server.add_client(first.local_addr().unwrap()).unwrap();
        // IPv6 target from an IPv4 socket cannot be sent to
        server.add_client("[::1]:9".parse().unwrap()).unwrap();
        server.add_client(second.local_addr().unwrap()).unwrap();

        let notice = Packet::Message {
            text: "maintenance".to_string(),
        };
        assert_eq!(server.broadcast(&notice, None), 2);
        assert_eq!(server.stats().failed_sends(), 1);

        assert_eq!(
            recv_packet(&first, Duration::from_secs(2)).await,
            Some(notice.clone())
        );
        assert_eq!(
            recv_packet(&second, Duration::from_secs(2)).await,
            Some(notice)
        );

        server.stop();
    }
}

/// LIVENESS TESTS
mod liveness_tests {
    use super::*;

    /// A probe is answered, the client adopts the server clock and the peer
    /// is no longer waiting
    #[tokio::test]
    async fn heartbeat_round_trip() {
        let (server, addr) = start_server().await;
        let client = connect_client(addr, "alice").await;
        let client_id = server.client_id(loopback(&client)).unwrap();

        server.update(Duration::from_millis(1000));
        assert!(server.client_info(client_id).unwrap().heartbeat_waiting);

        assert!(wait_until(|| client.time() == 1000).await);
        assert_eq!(client.last_heartbeat(), 1000);
        assert!(
            wait_until(|| {
                server
                    .client_info(client_id)
                    .map_or(false, |peer| !peer.heartbeat_waiting && peer.heartbeat_retry == 0)
            })
            .await
        );

        client.disconnect();
        server.stop();
    }

    /// Latency is the virtual time between the probe and its echo
    #[tokio::test]
    async fn latency_is_measured_in_virtual_time() {
        let (server, addr) = start_server().await;
        let peer = raw_peer().await;
        let client_id = server.add_client(peer.local_addr().unwrap()).unwrap();

        server.update(Duration::from_millis(1000));
        let probe = recv_packet(&peer, Duration::from_secs(2)).await;
        assert_eq!(probe, Some(Packet::Heartbeat { timestamp: 1000 }));

        server.update(Duration::from_millis(250));
        let echo = Packet::Heartbeat { timestamp: 1000 }.encode().unwrap();
        peer.send_to(&echo, addr).await.unwrap();

        assert!(
            wait_until(|| {
                server
                    .client_info(client_id)
                    .map_or(false, |info| !info.heartbeat_waiting)
            })
            .await
        );
        assert_eq!(server.client_info(client_id).unwrap().latency, 250);

        server.stop();
    }

    /// A peer that never answers is evicted and reported once
    #[tokio::test]
    async fn silent_peer_is_evicted() {
        let (server, _) = start_server().await;
        let peer = raw_peer().await;
        let client_id = server.add_client(peer.local_addr().unwrap()).unwrap();

        let timeouts = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&timeouts);
        server.set_timeout_handler(move |id: ClientId| sink.lock().unwrap().push(id));

        for _ in 0..6 {
            server.update(Duration::from_millis(1000));
            assert!(server.has_client(client_id));
        }
        server.update(Duration::from_millis(5000));

        assert!(!server.has_client(client_id));
        assert_eq!(*timeouts.lock().unwrap(), vec![client_id]);

        server.update(Duration::from_millis(1000));
        assert_eq!(timeouts.lock().unwrap().len(), 1);

        server.stop();
    }

    /// Without heartbeats the client drops the session on its own
    #[tokio::test]
    async fn client_times_out_without_heartbeats() {
        let (server, addr) = start_server().await;
        let client = connect_client(addr, "alice").await;

        client.update(Duration::from_secs(10));

        assert_eq!(client.state(), ConnectionState::Disconnected);
        assert!(wait_until(|| server.client_count() == 0).await);

        server.stop();
    }

    /// Disconnect from the server ends the client's session when its
    /// handler chooses to leave
    #[tokio::test]
    async fn server_disconnect_all_reaches_client() {
        let (server, addr) = start_server().await;
        let client = connect_client(addr, "alice").await;
        client.set_handler(|packet: &Packet, client: &Client| {
            if *packet == Packet::Disconnect {
                client.disconnect();
            }
        });

        server.disconnect_all();

        assert_eq!(server.client_count(), 0);
        assert!(wait_until(|| !client.is_connected()).await);

        server.stop();
    }
}
