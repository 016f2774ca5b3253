use clap::Parser;
use gossip_membership::membership::{Config, Delegate, MembershipEvent, MembershipService};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Runs a single gossip membership node.
#[derive(Debug, Parser)]
#[command(name = "gossip-node", version)]
struct Args {
    /// TOML configuration file; flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Unique node name. Random when omitted.
    #[arg(long)]
    name: Option<String>,

    #[arg(long)]
    bind: Option<IpAddr>,

    /// Address peers should use to reach this node.
    #[arg(long)]
    advertise: Option<IpAddr>,

    #[arg(long)]
    udp_port: Option<u16>,

    #[arg(long)]
    tcp_port: Option<u16>,

    /// Stream (TCP) address of an existing member. Repeatable.
    #[arg(long = "seed")]
    seeds: Vec<SocketAddr>,

    /// Opaque metadata advertised to peers.
    #[arg(long, default_value = "")]
    meta: String,

    /// Seconds between cluster stats reports.
    #[arg(long, default_value_t = 5)]
    stats_interval: u64,

    /// Seconds to wait for the leave broadcast on Ctrl+C.
    #[arg(long, default_value_t = 3)]
    leave_timeout: u64,
}

/// Advertises the configured metadata and logs application traffic.
struct NodeDelegate {
    meta: Vec<u8>,
}

impl Delegate for NodeDelegate {
    fn node_meta(&self, limit: usize) -> Vec<u8> {
        self.meta.iter().take(limit).copied().collect()
    }

    fn notify_msg(&self, msg: &[u8]) {
        tracing::info!("Received user message: {}", String::from_utf8_lossy(msg));
    }

    fn merge_remote_state(&self, buf: &[u8]) {
        tracing::debug!("Merged {} bytes of remote state", buf.len());
    }
}

fn build_config(args: &Args) -> anyhow::Result<Config> {
    let mut config = match &args.config {
        Some(path) => Config::from_toml_file(path)?,
        None => Config::default(),
    };

    if let Some(name) = &args.name {
        config.name = Some(name.clone());
    }
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(advertise) = args.advertise {
        config.advertise_addr = Some(advertise);
    }
    if let Some(port) = args.udp_port {
        config.udp_port = port;
    }
    if let Some(port) = args.tcp_port {
        config.tcp_port = port;
    }

    Ok(config)
}

fn describe(event: &MembershipEvent) -> String {
    match event {
        MembershipEvent::NodeJoined(node) => {
            format!("{} joined at {}", node.name, node.gossip_addr)
        }
        MembershipEvent::NodeUpdated(node) => format!("{} updated", node.name),
        MembershipEvent::NodeSuspected(name) => format!("{} is suspected", name),
        MembershipEvent::NodeFailed(node) => format!("{} failed", node.name),
        MembershipEvent::NodeLeft(node) => format!("{} left", node.name),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = build_config(&args)?;

    let delegate = Arc::new(NodeDelegate {
        meta: args.meta.clone().into_bytes(),
    });

    // 1. Membership:
    let membership = MembershipService::create(config, delegate).await?;
    tracing::info!(
        "Node {} gossip={} stream={}",
        membership.local_node().name,
        membership.gossip_addr(),
        membership.stream_addr()
    );

    // 2. Join:
    if args.seeds.is_empty() {
        tracing::info!("Starting as seed node (founder)");
    } else {
        tracing::info!("Seed nodes: {:?}", args.seeds);
        let (joined, error) = membership.join(&args.seeds).await?;
        tracing::info!("Reached {} of {} seed(s)", joined, args.seeds.len());
        if let Some(error) = error {
            tracing::warn!("Join incomplete: {}", error);
        }
    }

    // 3. Spawn event logger:
    let mut events = membership.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            tracing::info!("Membership event: {}", describe(&event));
        }
    });

    // 4. Spawn stats reporter:
    let stats_service = membership.clone();
    let stats_interval = Duration::from_secs(args.stats_interval.max(1));
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(stats_interval);

        loop {
            interval.tick().await;
            let members = stats_service.members();
            tracing::info!("Cluster stats: {} live nodes", members.len());
            for node in members {
                tracing::info!(
                    "  - {} gossip={} stream={} meta={}",
                    node.name,
                    node.gossip_addr,
                    node.stream_addr,
                    String::from_utf8_lossy(&node.meta)
                );
            }
        }
    });

    tracing::info!("Press Ctrl+C to leave the cluster");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Leaving cluster...");
    membership
        .leave(Duration::from_secs(args.leave_timeout))
        .await?;

    Ok(())
}
