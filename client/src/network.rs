use crate::dispatch::{self, ClientPacketHandler};
use log::{debug, error, info, warn};
use shared::{NetError, Packet, VirtualClock, CLIENT_TIMEOUT_MS, MAX_PACKET_SIZE};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::sleep;

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// State shared by the host tick and the receive task
struct Session {
    state: ConnectionState,
    server_addr: Option<SocketAddr>,
    player_name: String,
    clock: VirtualClock,
    /// Virtual time of the last heartbeat from the server
    last_heartbeat: i64,
    socket: Option<Arc<UdpSocket>>,
    shutdown: Option<watch::Sender<bool>>,
}

struct Inner {
    session: Mutex<Session>,
    handler: Mutex<Option<Arc<dyn ClientPacketHandler>>>,
    timeout: i64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One logical connection to a session server
///
/// Cloning yields another handle to the same session, which is what the
/// packet handler receives.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new() -> Self {
        Self::with_timeout(Duration::from_millis(CLIENT_TIMEOUT_MS as u64))
    }

    /// Creates a session that gives up after `timeout` of virtual time
    /// without a heartbeat.
    pub fn with_timeout(timeout: Duration) -> Self {
        Client {
            inner: Arc::new(Inner {
                session: Mutex::new(Session {
                    state: ConnectionState::Disconnected,
                    server_addr: None,
                    player_name: String::new(),
                    clock: VirtualClock::new(),
                    last_heartbeat: 0,
                    socket: None,
                    shutdown: None,
                }),
                handler: Mutex::new(None),
                timeout: i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX),
            }),
        }
    }

    fn session(&self) -> MutexGuard<'_, Session> {
        lock(&self.inner.session)
    }

    pub fn set_handler<H: ClientPacketHandler + 'static>(&self, handler: H) {
        *lock(&self.inner.handler) = Some(Arc::new(handler));
    }

    pub fn clear_handler(&self) {
        *lock(&self.inner.handler) = None;
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn ClientPacketHandler>> {
        lock(&self.inner.handler).clone()
    }

    /// Performs the handshake with the server at `server_addr`.
    ///
    /// Waits up to `timeout` for the server to echo the Connect. On failure
    /// the local socket is released and the session stays disconnected.
    pub async fn connect(
        &self,
        server_addr: SocketAddr,
        player_name: &str,
        timeout: Duration,
    ) -> Result<(), NetError> {
        {
            let mut session = self.session();
            if session.state != ConnectionState::Disconnected {
                return Err(NetError::AlreadyConnected);
            }
            session.state = ConnectionState::Connecting;
            session.server_addr = Some(server_addr);
            session.player_name = player_name.to_string();
        }

        info!("Connecting to {} as {}", server_addr, player_name);

        let (socket, ack) = match handshake(server_addr, player_name, timeout).await {
            Ok(established) => established,
            Err(e) => {
                self.session().state = ConnectionState::Disconnected;
                warn!("Connection attempt to {} failed: {}", server_addr, e);
                return Err(e);
            }
        };

        let socket = Arc::new(socket);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut session = self.session();
            let now = session.clock.now();
            session.state = ConnectionState::Connected;
            session.last_heartbeat = now;
            session.socket = Some(Arc::clone(&socket));
            session.shutdown = Some(shutdown_tx);
        }

        info!("Connected to server {}", server_addr);

        let client = self.clone();
        tokio::spawn(async move {
            client.listen(socket, server_addr, shutdown_rx).await;
        });

        dispatch::route(self, ack);
        Ok(())
    }

    /// Leaves the session: best-effort Disconnect to the server, then the
    /// receive task is stopped and the socket released.
    ///
    /// Returns false if there was no session to leave.
    pub fn disconnect(&self) -> bool {
        let (socket, shutdown, server_addr) = {
            let mut session = self.session();
            if session.state != ConnectionState::Connected {
                return false;
            }
            session.state = ConnectionState::Disconnected;
            (
                session.socket.take(),
                session.shutdown.take(),
                session.server_addr,
            )
        };

        if let (Some(socket), Some(addr)) = (&socket, server_addr) {
            match Packet::Disconnect.encode() {
                Ok(data) => {
                    if let Err(e) = socket.try_send_to(&data, addr) {
                        debug!("Disconnect to {} not delivered: {}", addr, e);
                    }
                }
                Err(e) => error!("Failed to encode disconnect: {}", e),
            }
        }

        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }

        info!("Disconnected from server");
        true
    }

    /// Single send to the server, no retry.
    pub fn send(&self, packet: &Packet) -> Result<(), NetError> {
        let session = self.session();
        if session.state != ConnectionState::Connected {
            return Err(NetError::NotConnected);
        }
        let (Some(socket), Some(addr)) = (&session.socket, session.server_addr) else {
            return Err(NetError::NotConnected);
        };

        let data = packet.encode()?;
        socket.try_send_to(&data, addr)?;
        Ok(())
    }

    /// Advances the virtual clock and drops the session if the server has
    /// been silent for too long.
    pub fn update(&self, delta: Duration) {
        let timed_out = {
            let mut guard = self.session();
            let session = &mut *guard;

            if session.state != ConnectionState::Connected {
                return;
            }

            if session.clock.advance(delta) {
                session.last_heartbeat = session.clock.rebase(session.last_heartbeat);
            }

            session.clock.elapsed_since(session.last_heartbeat) >= self.inner.timeout
        };

        if timed_out {
            warn!("Server connection timed out");
            self.disconnect();
        }
    }

    /// Echoes a server probe and adopts the server's clock.
    pub(crate) fn answer_heartbeat(&self, timestamp: i32) {
        let mut session = self.session();

        if let (Some(socket), Some(addr)) = (&session.socket, session.server_addr) {
            let reply = Packet::Heartbeat { timestamp };
            match reply.encode() {
                Ok(data) => {
                    if let Err(e) = socket.try_send_to(&data, addr) {
                        warn!("Failed to answer heartbeat: {}", e);
                    }
                }
                Err(e) => error!("Failed to encode heartbeat: {}", e),
            }
        }

        session.clock.set(i64::from(timestamp));
        let now = session.clock.now();
        session.last_heartbeat = now;
    }

    async fn listen(
        self,
        socket: Arc<UdpSocket>,
        server_addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buffer = [0u8; MAX_PACKET_SIZE];

        loop {
            let (len, addr) = tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = socket.recv_from(&mut buffer) => match result {
                    Ok(received) => received,
                    Err(e) => {
                        if !self.is_connected() {
                            break;
                        }
                        error!("Failed to receive a packet: {}", e);
                        sleep(Duration::from_millis(10)).await;
                        continue;
                    }
                },
            };

            // Replies come from the server's outgoing port, so only the IP is checked
            if addr.ip() != server_addr.ip() {
                continue;
            }

            let Some(packet) = Packet::decode(&buffer[..len]) else {
                debug!("Dropped malformed packet ({} bytes) from {}", len, addr);
                continue;
            };

            dispatch::route(&self, packet);
        }

        debug!("Receive task finished");
    }

    pub fn state(&self) -> ConnectionState {
        self.session().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Current virtual time, in milliseconds
    pub fn time(&self) -> i64 {
        self.session().clock.now()
    }

    pub fn set_time(&self, millis: i64) {
        self.session().clock.set(millis);
    }

    pub fn last_heartbeat(&self) -> i64 {
        self.session().last_heartbeat
    }

    pub fn server_addr(&self) -> Option<SocketAddr> {
        self.session().server_addr
    }

    /// Local endpoint while a session is open
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.session()
            .socket
            .as_ref()
            .and_then(|socket| socket.local_addr().ok())
    }

    pub fn player_name(&self) -> String {
        self.session().player_name.clone()
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// Binds an ephemeral socket, sends Connect and waits for the echo.
async fn handshake(
    server_addr: SocketAddr,
    player_name: &str,
    timeout: Duration,
) -> Result<(UdpSocket, Packet), NetError> {
    let local_addr = if server_addr.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(local_addr).await?;

    let request = Packet::Connect {
        player_name: player_name.to_string(),
    };
    socket.send_to(&request.encode()?, server_addr).await?;

    let mut buffer = [0u8; MAX_PACKET_SIZE];
    let wait_for_ack = async {
        loop {
            match socket.recv_from(&mut buffer).await {
                Ok((len, addr)) if addr.ip() == server_addr.ip() => {
                    if let Some(ack @ Packet::Connect { .. }) = Packet::decode(&buffer[..len]) {
                        return ack;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("Receive failed during handshake: {}", e);
                    sleep(Duration::from_millis(10)).await;
                }
            }
        }
    };

    let result = tokio::time::timeout(timeout, wait_for_ack).await;
    match result {
        Ok(ack) => Ok((socket, ack)),
        Err(_) => Err(NetError::HandshakeTimeout {
            server: server_addr,
            timeout,
        }),
    }
}
