//! Membership Configuration
//!
//! Every protocol timer and fan-out knob lives here. `Config::default()` is
//! tuned for a LAN; `Config::local()` shortens timers for loopback clusters
//! and tests. Files are loaded from TOML with durations given in milliseconds.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::time::Duration;

use super::error::{MembershipError, Result};
use super::types::{PROTOCOL_VERSION_MAX, PROTOCOL_VERSION_MIN, ProtocolVersion};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Unique node name. A random one is generated when unset.
    pub name: Option<String>,
    pub bind_addr: IpAddr,
    /// Address advertised to peers. Defaults to `bind_addr`, which must then
    /// be routable.
    pub advertise_addr: Option<IpAddr>,
    /// UDP port for probes and gossip. `0` picks an ephemeral port.
    pub udp_port: u16,
    /// TCP port for push/pull. `0` picks an ephemeral port.
    pub tcp_port: u16,

    pub protocol_version: u8,
    pub protocol_min: u8,
    pub protocol_max: u8,

    #[serde(with = "duration_ms")]
    pub probe_interval: Duration,
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,
    pub indirect_checks: usize,
    pub suspicion_mult: u32,
    pub suspicion_max_timeout_mult: u32,
    pub retransmit_mult: u32,

    #[serde(with = "duration_ms")]
    pub gossip_interval: Duration,
    pub gossip_nodes: usize,
    /// Dead nodes keep receiving gossip for this long so they can refute.
    #[serde(with = "duration_ms")]
    pub gossip_to_the_dead_time: Duration,

    /// Zero disables periodic push/pull; join still uses it.
    #[serde(with = "duration_ms")]
    pub push_pull_interval: Duration,
    #[serde(with = "duration_ms")]
    pub tcp_timeout: Duration,

    /// How long Dead/Left entries are retained before being reaped.
    #[serde(with = "duration_ms")]
    pub dead_node_retention: Duration,

    /// Maximum UDP packet size assembled by the gossip layer.
    pub packet_size: usize,

    /// Seed for peer selection and probe shuffling. Entropy when unset.
    pub rng_seed: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            name: None,
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            advertise_addr: None,
            udp_port: 7946,
            tcp_port: 7946,
            protocol_version: PROTOCOL_VERSION_MIN,
            protocol_min: PROTOCOL_VERSION_MIN,
            protocol_max: PROTOCOL_VERSION_MAX,
            probe_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_millis(500),
            indirect_checks: 3,
            suspicion_mult: 4,
            suspicion_max_timeout_mult: 6,
            retransmit_mult: 4,
            gossip_interval: Duration::from_millis(200),
            gossip_nodes: 3,
            gossip_to_the_dead_time: Duration::from_secs(30),
            push_pull_interval: Duration::from_secs(30),
            tcp_timeout: Duration::from_secs(10),
            dead_node_retention: Duration::from_secs(30),
            packet_size: 1400,
            rng_seed: None,
        }
    }
}

impl Config {
    /// Loopback configuration with short timers and ephemeral ports.
    pub fn local() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::LOCALHOST),
            udp_port: 0,
            tcp_port: 0,
            probe_interval: Duration::from_millis(100),
            probe_timeout: Duration::from_millis(50),
            suspicion_mult: 3,
            retransmit_mult: 2,
            gossip_interval: Duration::from_millis(20),
            push_pull_interval: Duration::from_secs(15),
            tcp_timeout: Duration::from_secs(1),
            gossip_to_the_dead_time: Duration::from_secs(15),
            dead_node_retention: Duration::from_secs(15),
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| MembershipError::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn version(&self) -> ProtocolVersion {
        ProtocolVersion {
            min: self.protocol_min,
            max: self.protocol_max,
            current: self.protocol_version,
        }
    }

    pub fn udp_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.udp_port)
    }

    pub fn tcp_bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.tcp_port)
    }

    /// Replaces the IP of a bound socket address with the advertised one.
    pub fn advertised(&self, bound: SocketAddr) -> SocketAddr {
        SocketAddr::new(self.advertise_addr.unwrap_or(bound.ip()), bound.port())
    }

    /// Checks version bounds and timer relationships before any socket is bound.
    pub fn validate(&self) -> Result<()> {
        if self.protocol_min < PROTOCOL_VERSION_MIN || self.protocol_max > PROTOCOL_VERSION_MAX {
            return Err(MembershipError::Config(format!(
                "protocol bounds [{}, {}] outside supported [{}, {}]",
                self.protocol_min, self.protocol_max, PROTOCOL_VERSION_MIN, PROTOCOL_VERSION_MAX
            )));
        }

        if self.protocol_version < self.protocol_min || self.protocol_version > self.protocol_max {
            return Err(MembershipError::VersionMismatch {
                version: self.protocol_version,
                min: self.protocol_min,
                max: self.protocol_max,
            });
        }

        if self.probe_interval <= self.probe_timeout {
            return Err(MembershipError::Config(format!(
                "probe_interval {:?} must exceed probe_timeout {:?}",
                self.probe_interval, self.probe_timeout
            )));
        }

        if self.gossip_interval.is_zero() {
            return Err(MembershipError::Config("gossip_interval must be non-zero".into()));
        }

        if self.packet_size < 64 {
            return Err(MembershipError::Config(format!(
                "packet_size {} is too small",
                self.packet_size
            )));
        }

        Ok(())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
