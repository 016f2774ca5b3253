//! Anti-Entropy Exchange
//!
//! Periodically syncs full state with one random Alive peer over TCP. Both
//! sides send every registry entry plus the delegate's opaque state, then
//! replay the peer's entries through the gossip transitions.
//!
//! ## Exchange
//! The initiator writes its frame and reads the reply. The responder reads,
//! replies with its own state and only then merges, so each side receives the
//! other's view from before the exchange.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, trace, warn};

use super::error::{MembershipError, Result};
use super::protocol::{Message, Packet, decode_message, encode_message, read_frame, write_frame};
use super::service::MembershipService;

/// Runs `fut` with the stream timeout, mapping expiry to `Timeout`.
async fn bounded<T, F>(timeout: Duration, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| MembershipError::Timeout(timeout))?
}

impl MembershipService {
    pub(crate) async fn push_pull_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.push_pull_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // The first tick completes immediately; join covers startup.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.changed() => break,
            }

            let target = self.state.lock().push_pull_target();
            let Some(addr) = target else {
                continue;
            };

            if let Err(e) = self.push_pull_node(addr, false).await {
                warn!("Push/pull with {} failed: {}", addr, e);
            }
        }

        debug!("Push/pull loop stopped");
    }

    /// Initiates one exchange with the peer listening on `addr`.
    pub(crate) async fn push_pull_node(
        self: &Arc<Self>,
        addr: SocketAddr,
        join: bool,
    ) -> Result<()> {
        let timeout = self.config.tcp_timeout;

        let connect = async { TcpStream::connect(addr).await.map_err(MembershipError::from) };
        let mut stream = bounded(timeout, connect).await?;

        let local = self.push_pull_packet(join)?;
        bounded(timeout, write_frame(&mut stream, &local)).await?;
        let remote = bounded(timeout, read_frame(&mut stream)).await?;

        trace!("Completed push/pull with {}", addr);
        self.merge_push_pull(remote)
    }

    pub(crate) async fn accept_loop(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) {

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let service = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = service.handle_stream(stream).await {
                                warn!("Push/pull from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept TCP connection: {}", e);
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = shutdown.changed() => break,
            }
        }

        debug!("Accept loop stopped");
    }

    async fn handle_stream(self: &Arc<Self>, mut stream: TcpStream) -> Result<()> {
        let timeout = self.config.tcp_timeout;

        let remote = bounded(timeout, read_frame(&mut stream)).await?;
        let local = self.push_pull_packet(false)?;
        bounded(timeout, write_frame(&mut stream, &local)).await?;

        self.merge_push_pull(remote)
    }

    fn push_pull_packet(&self, join: bool) -> Result<Packet> {
        let user_state = self.delegate.local_state();
        let nodes = self.state.lock().snapshot();

        let msg = Message::PushPull {
            join,
            from: self.local_node().name.clone(),
            nodes,
            user_state,
        };

        Ok(Packet::new(self.config.version(), vec![encode_message(&msg)?]))
    }

    fn merge_push_pull(self: &Arc<Self>, packet: Packet) -> Result<()> {
        let local = self.config.version();
        if !local.overlaps(&packet.version) {
            return Err(MembershipError::VersionMismatch {
                version: packet.version.current,
                min: local.min,
                max: local.max,
            });
        }

        let Some(part) = packet.parts.first() else {
            return Err(MembershipError::MalformedMessage(
                "empty push/pull frame".into(),
            ));
        };

        let Message::PushPull {
            join,
            from,
            nodes,
            user_state,
        } = decode_message(part)?
        else {
            return Err(MembershipError::MalformedMessage(
                "expected a push/pull message on the stream".into(),
            ));
        };

        debug!(
            "Merging {} entries from {}{}",
            nodes.len(),
            from,
            if join { " (join)" } else { "" }
        );

        let effects = self.state.lock().merge_remote(nodes, &from, Instant::now());
        self.apply_effects(effects);
        self.delegate.merge_remote_state(&user_state);

        Ok(())
    }
}
