use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, MembershipError>;

/// Errors surfaced by the membership service.
#[derive(Debug, Error)]
pub enum MembershipError {
    /// A listener address is unusable. Fatal to `create`; the caller may retry
    /// with different ports.
    #[error("failed to bind {transport} listener on {addr}: {source}")]
    BindFailure {
        transport: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Protocol version ranges are incompatible.
    #[error("protocol version {version} not within [{min}, {max}]")]
    VersionMismatch { version: u8, min: u8, max: u8 },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("membership service has been shut down")]
    UseAfterShutdown,

    #[error("message of {size} bytes does not fit the {limit} byte packet budget")]
    MessageTooLarge { size: usize, limit: usize },

    #[error("node metadata of {size} bytes exceeds the {limit} byte limit")]
    MetaTooLarge { size: usize, limit: usize },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<bincode::Error> for MembershipError {
    fn from(err: bincode::Error) -> Self {
        MembershipError::MalformedMessage(err.to_string())
    }
}

/// A seed that could not be used during `join`.
#[derive(Debug)]
pub struct SeedFailure {
    pub addr: SocketAddr,
    pub error: MembershipError,
}

/// Aggregate of every seed `join` failed to reach.
#[derive(Debug, Error)]
#[error("{} seed(s) unreachable{}", .failures.len(), describe_failures(.failures))]
pub struct JoinError {
    pub failures: Vec<SeedFailure>,
}

fn describe_failures(failures: &[SeedFailure]) -> String {
    failures
        .iter()
        .map(|failure| format!("; {}: {}", failure.addr, failure.error))
        .collect()
}

/// Outcome of `MembershipService::shutdown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownStatus {
    Completed,
    AlreadyShutdown,
}
