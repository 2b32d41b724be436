//! Server network layer: sockets, receive task, registry operations and the tick

use crate::client_manager::{ClientManager, PeerInfo};
use crate::dispatch::{self, ServerPacketHandler, TimeoutHandler};
use crate::heartbeat::{Acknowledgement, HeartbeatScheduler};
use log::{debug, error, info, warn};
use shared::{
    ClientId, NetError, Packet, VirtualClock, CLIENT_TIMEOUT_MS, HEARTBEAT_INTERVAL_MS,
    HEARTBEAT_RETRIES, MAX_PACKET_SIZE, SERVER_PORT,
};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};

/// Tunables for one server instance
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Well-known address for inbound traffic. Outbound traffic uses an
    /// ephemeral port on the same IP.
    pub bind_addr: SocketAddr,
    pub heartbeat_interval: Duration,
    pub heartbeat_retries: u32,
    /// Hard limit on silence from a peer before it is evicted
    pub client_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, SERVER_PORT)),
            heartbeat_interval: Duration::from_millis(HEARTBEAT_INTERVAL_MS as u64),
            heartbeat_retries: HEARTBEAT_RETRIES,
            client_timeout: Duration::from_millis(CLIENT_TIMEOUT_MS as u64),
        }
    }
}

/// Byte counters for everything that went through the server's sockets
#[derive(Debug, Default)]
pub struct TrafficStats {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    failed_sends: AtomicU64,
}

impl TrafficStats {
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn failed_sends(&self) -> u64 {
        self.failed_sends.load(Ordering::Relaxed)
    }

    fn record_sent(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_received(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn record_failure(&self) {
        self.failed_sends.fetch_add(1, Ordering::Relaxed);
    }
}

/// Everything guarded by the server's single coarse lock
struct ServerState {
    clock: VirtualClock,
    clients: ClientManager,
    /// Blocking socket: a send goes straight to the kernel, waiting only
    /// while the send buffer is full
    outgoing: Option<Socket>,
    local_addr: Option<SocketAddr>,
    shutdown: Option<watch::Sender<bool>>,
}

impl ServerState {
    fn send_to(&self, stats: &TrafficStats, data: &[u8], addr: SocketAddr) -> Result<(), NetError> {
        let socket = self.outgoing.as_ref().ok_or(NetError::NotRunning)?;

        match socket.send_to(data, &addr.into()) {
            Ok(sent) => {
                stats.record_sent(sent);
                Ok(())
            }
            Err(e) => {
                stats.record_failure();
                Err(NetError::Transport(e))
            }
        }
    }

    fn send_packet(
        &self,
        stats: &TrafficStats,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), NetError> {
        let data = packet.encode()?;
        self.send_to(stats, &data, addr)
    }

    /// Sends to every registered peer except `exclude`. A failed send is
    /// logged and counted; the remaining peers are still tried.
    fn broadcast(&self, stats: &TrafficStats, data: &[u8], exclude: Option<ClientId>) -> usize {
        let mut delivered = 0;

        for (client_id, addr) in self.clients.get_client_addrs() {
            if Some(client_id) == exclude {
                continue;
            }

            match self.send_to(stats, data, addr) {
                Ok(()) => delivered += 1,
                Err(e) => error!("Failed to send to client {} at {}: {}", client_id, addr, e),
            }
        }

        delivered
    }

    /// Tells every peer goodbye and forgets them.
    fn disconnect_all(&mut self, stats: &TrafficStats) {
        match Packet::Disconnect.encode() {
            Ok(data) => {
                self.broadcast(stats, &data, None);
            }
            Err(e) => error!("Failed to encode disconnect: {}", e),
        }
        self.clients.clear();
    }
}

struct Inner {
    config: ServerConfig,
    scheduler: HeartbeatScheduler,
    state: Mutex<ServerState>,
    handler: Mutex<Option<Arc<dyn ServerPacketHandler>>>,
    timeout_handler: Mutex<Option<Arc<dyn TimeoutHandler>>>,
    stats: TrafficStats,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Session server
///
/// Cloning yields another handle to the same server. Registry operations
/// take the single state lock for their whole duration, so they are safe to
/// call from handlers, the tick and any other task.
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub fn new(config: ServerConfig) -> Self {
        let scheduler = HeartbeatScheduler::new(
            millis(config.heartbeat_interval),
            config.heartbeat_retries,
            millis(config.client_timeout),
        );

        Server {
            inner: Arc::new(Inner {
                config,
                scheduler,
                state: Mutex::new(ServerState {
                    clock: VirtualClock::new(),
                    clients: ClientManager::new(),
                    outgoing: None,
                    local_addr: None,
                    shutdown: None,
                }),
                handler: Mutex::new(None),
                timeout_handler: Mutex::new(None),
                stats: TrafficStats::default(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        lock(&self.inner.state)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn stats(&self) -> &TrafficStats {
        &self.inner.stats
    }

    /// Registers the handler for every packet other than heartbeats.
    pub fn set_handler<H: ServerPacketHandler + 'static>(&self, handler: H) {
        *lock(&self.inner.handler) = Some(Arc::new(handler));
    }

    pub fn clear_handler(&self) {
        *lock(&self.inner.handler) = None;
    }

    /// Registers a callback invoked for every peer evicted by the heartbeat sweep.
    pub fn set_timeout_handler<T: TimeoutHandler + 'static>(&self, handler: T) {
        *lock(&self.inner.timeout_handler) = Some(Arc::new(handler));
    }

    pub(crate) fn handler(&self) -> Option<Arc<dyn ServerPacketHandler>> {
        lock(&self.inner.handler).clone()
    }

    /// Binds the inbound and outbound sockets and spawns the receive task.
    ///
    /// Returns the address the server listens on.
    pub async fn start(&self) -> Result<SocketAddr, NetError> {
        if self.is_running() {
            return Err(NetError::AlreadyRunning);
        }

        let bind_addr = self.inner.config.bind_addr;
        let incoming = UdpSocket::bind(bind_addr).await?;
        let outgoing = bind_outgoing(bind_addr.ip())?;
        let local_addr = incoming.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        {
            let mut state = self.state();
            if state.shutdown.is_some() {
                return Err(NetError::AlreadyRunning);
            }
            state.outgoing = Some(outgoing);
            state.local_addr = Some(local_addr);
            state.shutdown = Some(shutdown_tx);
        }

        info!("Server listening on {}", local_addr);

        let server = self.clone();
        tokio::spawn(async move {
            server.listen(incoming, shutdown_rx).await;
        });

        Ok(local_addr)
    }

    /// Disconnects every peer, stops the receive task and releases the sockets.
    ///
    /// Returns false if the server was not running.
    pub fn stop(&self) -> bool {
        let shutdown = {
            let mut state = self.state();
            let Some(shutdown) = state.shutdown.take() else {
                return false;
            };
            state.disconnect_all(&self.inner.stats);
            state.outgoing = None;
            state.local_addr = None;
            shutdown
        };

        let _ = shutdown.send(true);
        info!("Server stopped");
        true
    }

    pub fn is_running(&self) -> bool {
        self.state().shutdown.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state().local_addr
    }

    /// Current virtual time, in milliseconds
    pub fn time(&self) -> i64 {
        self.state().clock.now()
    }

    async fn listen(self, socket: UdpSocket, mut shutdown: watch::Receiver<bool>) {
        let mut buffer = [0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                biased;
                _ = shutdown.changed() => break,
                result = socket.recv_from(&mut buffer) => match result {
                    Ok((len, addr)) => {
                        self.inner.stats.record_received(len);
                        dispatch::route(&self, &buffer[..len], addr);
                    }
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                },
            }
        }

        debug!("Receive task on {:?} finished", socket.local_addr().ok());
    }

    /// Advances the virtual clock and runs one heartbeat sweep.
    pub fn update(&self, delta: Duration) {
        let evicted = {
            let mut guard = self.state();
            let state = &mut *guard;

            if state.clock.advance(delta) {
                debug!("Virtual clock wrapped");
                state.clients.rebase_timestamps(&state.clock);
            }

            if state.shutdown.is_none() {
                return;
            }

            let now = state.clock.now();
            let sweep = self.inner.scheduler.sweep(&mut state.clients, now);

            if !sweep.probes.is_empty() {
                let probe = Packet::Heartbeat {
                    timestamp: i32::try_from(now).unwrap_or(i32::MAX),
                };
                match probe.encode() {
                    Ok(data) => {
                        for target in &sweep.probes {
                            if let Err(e) = state.send_to(&self.inner.stats, &data, target.addr) {
                                warn!("Failed to probe client {}: {}", target.client_id, e);
                            }
                        }
                    }
                    Err(e) => error!("Failed to encode heartbeat: {}", e),
                }
            }

            sweep.evicted
        };

        if evicted.is_empty() {
            return;
        }

        let handler = lock(&self.inner.timeout_handler).clone();
        if let Some(handler) = handler {
            for (client_id, _) in evicted {
                handler.on_timeout(client_id);
            }
        }
    }

    /// Ticks `update` at the given rate until the server is stopped.
    pub async fn run(&self, tick: Duration) {
        let mut tick_interval = interval(tick);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_tick = Instant::now();

        while self.is_running() {
            tick_interval.tick().await;

            let now = Instant::now();
            self.update(now.duration_since(last_tick));
            last_tick = now;
        }
    }

    pub(crate) fn acknowledge_heartbeat(&self, addr: SocketAddr) -> Acknowledgement {
        let mut state = self.state();
        let now = state.clock.now();
        self.inner.scheduler.acknowledge(&mut state.clients, addr, now)
    }

    /// Registers a peer. None if the address is already registered.
    pub fn add_client(&self, addr: SocketAddr) -> Option<ClientId> {
        let mut state = self.state();
        let now = state.clock.now();
        state.clients.add_client(addr, now)
    }

    /// Sends the peer a Disconnect (best effort) and evicts it.
    pub fn remove_client(&self, client_id: ClientId) -> bool {
        let mut state = self.state();
        let Some(addr) = state.clients.get(client_id).map(|peer| peer.addr) else {
            return false;
        };

        if let Err(e) = state.send_packet(&self.inner.stats, &Packet::Disconnect, addr) {
            debug!("Disconnect to client {} not delivered: {}", client_id, e);
        }
        state.clients.remove_client(client_id).is_some()
    }

    pub fn remove_client_by_addr(&self, addr: SocketAddr) -> bool {
        let mut state = self.state();
        if !state.clients.contains_addr(addr) {
            return false;
        }

        if let Err(e) = state.send_packet(&self.inner.stats, &Packet::Disconnect, addr) {
            debug!("Disconnect to {} not delivered: {}", addr, e);
        }
        state.clients.remove_client_by_addr(addr).is_some()
    }

    pub fn client_id(&self, addr: SocketAddr) -> Option<ClientId> {
        self.state().clients.find_client_by_addr(addr)
    }

    pub fn has_client(&self, client_id: ClientId) -> bool {
        self.state().clients.contains(client_id)
    }

    pub fn has_client_addr(&self, addr: SocketAddr) -> bool {
        self.state().clients.contains_addr(addr)
    }

    /// Snapshot of one peer's bookkeeping, including its measured latency.
    pub fn client_info(&self, client_id: ClientId) -> Option<PeerInfo> {
        self.state().clients.get(client_id).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.state().clients.len()
    }

    pub fn client_list(&self) -> Vec<(ClientId, SocketAddr)> {
        self.state().clients.get_client_addrs()
    }

    /// Single send to a registered peer, no retry.
    pub fn send(&self, client_id: ClientId, packet: &Packet) -> Result<(), NetError> {
        let state = self.state();
        let addr = state
            .clients
            .get(client_id)
            .map(|peer| peer.addr)
            .ok_or(NetError::UnknownClient(client_id))?;
        state.send_packet(&self.inner.stats, packet, addr)
    }

    /// Single send to any address, registered or not.
    pub fn send_to_addr(&self, addr: SocketAddr, packet: &Packet) -> Result<(), NetError> {
        self.state().send_packet(&self.inner.stats, packet, addr)
    }

    /// Sends to every registered peer except `exclude`.
    ///
    /// Returns how many peers the packet was handed to.
    pub fn broadcast(&self, packet: &Packet, exclude: Option<ClientId>) -> usize {
        let data = match packet.encode() {
            Ok(data) => data,
            Err(e) => {
                error!("Failed to encode broadcast: {}", e);
                return 0;
            }
        };

        self.state().broadcast(&self.inner.stats, &data, exclude)
    }

    pub fn disconnect_all(&self) {
        let mut state = self.state();
        if state.shutdown.is_none() {
            return;
        }
        state.disconnect_all(&self.inner.stats);
    }
}

/// Ephemeral-port sender on the same IP as the listener.
fn bind_outgoing(ip: IpAddr) -> io::Result<Socket> {
    let domain = if ip.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.bind(&SocketAddr::new(ip, 0).into())?;
    Ok(socket)
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
