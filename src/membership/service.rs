use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::config::Config;
use super::delegate::Delegate;
use super::error::{JoinError, MembershipError, Result, SeedFailure, ShutdownStatus};
use super::protocol::{
    Message, PACKET_OVERHEAD, PART_OVERHEAD, Packet, USER_MESSAGE_OVERHEAD, decode_message,
    decode_packet, encode_message, encode_packet,
};
use super::state::{ClusterState, Effects, SuspicionTimer};
use super::types::{META_MAX_SIZE, MembershipEvent, Node, NodeName};

/// Buffered membership events per subscriber before the oldest are dropped.
const EVENT_CHANNEL_CAPACITY: usize = 256;

const RECV_BUFFER_SIZE: usize = 65536;

pub struct MembershipService {
    pub(crate) config: Config,
    pub(crate) delegate: Arc<dyn Delegate>,
    pub(crate) state: Mutex<ClusterState>,
    local: Node,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    ack_handlers: DashMap<u32, oneshot::Sender<()>>,
    sequence: AtomicU32,
    events: broadcast::Sender<MembershipEvent>,
    shutdown_tx: watch::Sender<bool>,
    is_shutdown: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MembershipService {
    /// Binds both transports, announces the local node and starts the
    /// background tasks.
    pub async fn create(config: Config, delegate: Arc<dyn Delegate>) -> Result<Arc<Self>> {
        config.validate()?;

        let udp_addr = config.udp_bind_addr();
        let socket = UdpSocket::bind(udp_addr)
            .await
            .map(Arc::new)
            .map_err(|source| MembershipError::BindFailure {
                transport: "udp",
                addr: udp_addr,
                source,
            })?;

        let tcp_addr = config.tcp_bind_addr();
        let listener = TcpListener::bind(tcp_addr)
            .await
            .map_err(|source| MembershipError::BindFailure {
                transport: "tcp",
                addr: tcp_addr,
                source,
            })?;

        let meta = delegate.node_meta(META_MAX_SIZE);
        if meta.len() > META_MAX_SIZE {
            return Err(MembershipError::MetaTooLarge {
                size: meta.len(),
                limit: META_MAX_SIZE,
            });
        }

        let name = config
            .name
            .clone()
            .map(NodeName)
            .unwrap_or_else(NodeName::random);

        let local = Node {
            name,
            gossip_addr: config.advertised(socket.local_addr()?),
            stream_addr: config.advertised(listener.local_addr()?),
            meta,
            version: config.version(),
        };

        if local.gossip_addr.ip().is_unspecified() {
            warn!(
                "Advertising unspecified address {}; set advertise_addr so peers can reach it",
                local.gossip_addr
            );
        }

        let mut state = ClusterState::new(local.clone(), &config);
        state.announce_local();

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);

        let service = Arc::new(Self {
            config,
            delegate,
            state: Mutex::new(state),
            local,
            socket: Mutex::new(Some(socket.clone())),
            ack_handlers: DashMap::new(),
            sequence: AtomicU32::new(0),
            events,
            shutdown_tx,
            is_shutdown: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        });

        service.start(socket, listener);

        info!(
            "Membership service {} listening on udp {} / tcp {}",
            service.local.name, service.local.gossip_addr, service.local.stream_addr
        );

        Ok(service)
    }

    /// Every loop gets its shutdown receiver here, before it is spawned, so
    /// a shutdown issued before a task first runs is still observed.
    fn start(self: &Arc<Self>, socket: Arc<UdpSocket>, listener: TcpListener) {
        let mut tasks = vec![
            tokio::spawn(self.clone().receive_loop(socket, self.shutdown_signal())),
            tokio::spawn(self.clone().accept_loop(listener, self.shutdown_signal())),
            tokio::spawn(self.clone().probe_loop(self.shutdown_signal())),
            tokio::spawn(self.clone().gossip_loop(self.shutdown_signal())),
        ];

        if !self.config.push_pull_interval.is_zero() {
            tasks.push(tokio::spawn(
                self.clone().push_pull_loop(self.shutdown_signal()),
            ));
        }

        debug!("Started {} background tasks", tasks.len());
        self.tasks.lock().extend(tasks);
    }

    /// Live members (neither Dead nor Left), in registry order.
    pub fn members(&self) -> Vec<Node> {
        self.state.lock().registry.members()
    }

    pub fn num_members(&self) -> usize {
        self.state.lock().registry.num_members()
    }

    pub fn local_node(&self) -> &Node {
        &self.local
    }

    pub fn gossip_addr(&self) -> SocketAddr {
        self.local.gossip_addr
    }

    pub fn stream_addr(&self) -> SocketAddr {
        self.local.stream_addr
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MembershipEvent> {
        self.events.subscribe()
    }

    pub fn is_shutdown(&self) -> bool {
        self.is_shutdown.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(MembershipError::UseAfterShutdown);
        }
        Ok(())
    }

    /// Runs one push/pull against every seed's stream address.
    ///
    /// Returns how many seeds were reached. Unreachable seeds are collected
    /// into the `JoinError`, which does not make the call fail.
    pub async fn join(
        self: &Arc<Self>,
        seeds: &[SocketAddr],
    ) -> Result<(usize, Option<JoinError>)> {
        self.ensure_running()?;

        let mut joined = 0;
        let mut failures = Vec::new();

        for &addr in seeds {
            match self.push_pull_node(addr, true).await {
                Ok(()) => {
                    info!("Joined cluster via seed {}", addr);
                    joined += 1;
                }
                Err(error) => {
                    warn!("Failed to join via seed {}: {}", addr, error);
                    failures.push(SeedFailure { addr, error });
                }
            }
        }

        let error = if failures.is_empty() {
            None
        } else {
            Some(JoinError { failures })
        };

        Ok((joined, error))
    }

    /// Broadcasts the local departure, waits up to `timeout` for it to
    /// propagate, then shuts down. Running out of time is not an error.
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        self.ensure_running()?;

        let (finished, has_peers) = {
            let mut state = self.state.lock();
            let finished = state.leave_local(Instant::now());
            (finished, state.has_live_peers())
        };

        match finished {
            Some(finished) if has_peers => {
                match tokio::time::timeout(timeout, finished).await {
                    Ok(_) => info!("Leave broadcast propagated"),
                    Err(_) => warn!(
                        "Leave broadcast still pending after {:?}, shutting down anyway",
                        timeout
                    ),
                }
            }
            _ => debug!("No peers to notify of departure"),
        }

        self.shutdown().await;
        Ok(())
    }

    /// Stops every background task and releases both ports. Calling it
    /// again is harmless.
    pub async fn shutdown(&self) -> ShutdownStatus {
        if self.is_shutdown.swap(true, Ordering::SeqCst) {
            debug!("Shutdown requested again, nothing to do");
            return ShutdownStatus::AlreadyShutdown;
        }

        info!("Shutting down membership service {}", self.local.name);
        self.shutdown_tx.send_replace(true);

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {}", e);
            }
        }

        // The listener died with the accept loop; the socket goes with the
        // last sender holding a clone.
        self.socket.lock().take();
        self.ack_handlers.clear();
        self.state.lock().broadcasts.reset();

        ShutdownStatus::Completed
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn next_seq(&self) -> u32 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    /// Registers a one-shot handler fired by the Ack carrying `seq`.
    pub(crate) fn register_ack(&self, seq: u32) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.ack_handlers.insert(seq, tx);
        rx
    }

    pub(crate) fn clear_ack(&self, seq: u32) {
        self.ack_handlers.remove(&seq);
    }

    /// Publishes events and starts the suspicion timers of a transition.
    pub(crate) fn apply_effects(self: &Arc<Self>, effects: Effects) {
        for event in effects.events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }

        for timer in effects.timers {
            self.spawn_suspicion_timer(timer);
        }
    }

    fn spawn_suspicion_timer(self: &Arc<Self>, timer: SuspicionTimer) {
        let service = self.clone();
        let mut shutdown = self.shutdown_signal();

        tokio::spawn(async move {
            loop {
                if *shutdown.borrow() {
                    return;
                }

                let deadline = service
                    .state
                    .lock()
                    .suspicion_deadline(&timer.node, timer.incarnation);
                let Some(deadline) = deadline else {
                    trace!("Suspicion of {} resolved", timer.node);
                    return;
                };

                tokio::select! {
                    _ = tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)) => {
                        let effects = service
                            .state
                            .lock()
                            .expire_suspicion(&timer.node, timer.incarnation, Instant::now());
                        service.apply_effects(effects);
                        return;
                    }
                    _ = timer.wake.notified() => {
                        trace!("Suspicion of {} corroborated, re-arming timer", timer.node);
                    }
                    _ = shutdown.changed() => return,
                }
            }
        });
    }

    /// Gossip parts for a packet with `limit` bytes left: the delegate's
    /// payloads are queued first, then the queue is drained.
    pub(crate) fn gossip_parts(&self, limit: usize) -> Vec<Vec<u8>> {
        let user = self
            .delegate
            .get_broadcasts(PART_OVERHEAD + USER_MESSAGE_OVERHEAD, limit);

        self.state.lock().fill_packet(user, limit)
    }

    pub(crate) async fn send_packet(
        &self,
        addr: SocketAddr,
        parts: Vec<Vec<u8>>,
    ) -> anyhow::Result<()> {
        let Some(socket) = self.socket.lock().clone() else {
            anyhow::bail!(MembershipError::UseAfterShutdown);
        };

        let packet = Packet::new(self.config.version(), parts);
        let encoded = encode_packet(&packet)?;
        socket.send_to(&encoded, addr).await?;
        Ok(())
    }

    /// Sends `msg` with as much queued gossip as fits behind it.
    pub(crate) async fn send_with_piggyback(
        &self,
        addr: SocketAddr,
        msg: Message,
    ) -> anyhow::Result<()> {
        let first = encode_message(&msg)?;
        let used = PACKET_OVERHEAD + first.len() + PART_OVERHEAD;
        let room = self.config.packet_size.saturating_sub(used);

        let mut parts = vec![first];
        parts.extend(self.gossip_parts(room));

        self.send_packet(addr, parts).await
    }

    async fn receive_loop(
        self: Arc<Self>,
        socket: Arc<UdpSocket>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];

        loop {
            let (len, src) = tokio::select! {
                received = socket.recv_from(&mut buf) => match received {
                    Ok(received) => received,
                    Err(e) => {
                        error!("Failed to receive UDP packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            };

            if let Err(e) = self.handle_packet(&buf[..len], src).await {
                warn!("Dropping packet from {}: {}", src, e);
            }
        }

        debug!("Receive loop stopped");
    }

    async fn handle_packet(
        self: &Arc<Self>,
        buf: &[u8],
        src: SocketAddr,
    ) -> anyhow::Result<()> {
        let packet = decode_packet(buf)?;

        let max = self.config.protocol_max;
        if packet.version.current > max {
            anyhow::bail!(
                "protocol version {} above supported max {}",
                packet.version.current,
                max
            );
        }

        for part in packet.parts {
            let msg = match decode_message(&part) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!("Skipping malformed message from {}: {}", src, e);
                    continue;
                }
            };

            if let Err(e) = self.handle_message(msg, src).await {
                warn!("Error handling message from {}: {}", src, e);
            }
        }

        Ok(())
    }

    async fn handle_message(
        self: &Arc<Self>,
        msg: Message,
        src: SocketAddr,
    ) -> anyhow::Result<()> {
        match msg {
            Message::Ping { seq, target } => {
                self.handle_ping(seq, target, src).await?;
            }

            Message::IndirectPing {
                seq,
                target,
                target_name,
            } => {
                let service = self.clone();
                tokio::spawn(async move {
                    service.relay_probe(seq, target, target_name, src).await;
                });
            }

            Message::Ack { seq } => self.handle_ack(seq),

            Message::User { payload } => self.delegate.notify_msg(&payload),

            Message::PushPull { .. } => {
                warn!("Ignoring push/pull sent over UDP by {}", src);
            }

            fact => {
                let effects = self.state.lock().apply_message(fact, Instant::now());
                self.apply_effects(effects);
            }
        }

        Ok(())
    }

    async fn handle_ping(
        &self,
        seq: u32,
        target: NodeName,
        src: SocketAddr,
    ) -> anyhow::Result<()> {
        if target != self.local.name {
            debug!(
                "Ignoring ping from {} meant for {}, not {}",
                src, target, self.local.name
            );
            return Ok(());
        }

        trace!("Received ping {} from {}", seq, src);
        self.send_with_piggyback(src, Message::Ack { seq }).await
    }

    fn handle_ack(&self, seq: u32) {
        match self.ack_handlers.remove(&seq) {
            Some((_, handler)) => {
                let _ = handler.send(());
            }
            None => trace!("Late or unknown ack {}", seq),
        }
    }
}
