use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};

use crate::registry::SlotPolicy;

const DEFAULT_PORT: u16 = 5000;

/// How frames reach the other seat of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RelayMode {
    /// Peers must land on the same process; frames are handed over in memory.
    /// Frames for a peer whose outbound queue is full are dropped and counted.
    Direct,
    /// Frames fan out through Redis pub/sub so any process can serve either peer.
    /// A peer with a full outbound queue slows only its own downlink; nothing
    /// is dropped on the relay side.
    Scaled,
}

impl RelayMode {
    pub fn label(self) -> &'static str {
        match self {
            RelayMode::Direct => "direct",
            RelayMode::Scaled => "scaled",
        }
    }
}

#[derive(Debug, Parser)]
#[command(
    name = "beach-ferry-server",
    author,
    version,
    about = "Beach Ferry session relay (client <-> helper)"
)]
pub struct Cli {
    /// Address to bind the websocket listener to. Defaults to 0.0.0.0:$PORT.
    #[arg(long, env = "BEACH_FERRY_LISTEN_ADDR")]
    pub listen_addr: Option<String>,

    /// Port used when no listen address is given (set by most PaaS hosts).
    #[arg(long, env = "PORT", hide = true)]
    pub port: Option<u16>,

    /// Relay strategy.
    #[arg(long, env = "BEACH_FERRY_MODE", value_enum, default_value_t = RelayMode::Direct)]
    pub mode: RelayMode,

    /// Redis connection URI used for pub/sub fan-out in scaled mode.
    #[arg(
        long,
        env = "BEACH_FERRY_REDIS_URL",
        default_value = "redis://127.0.0.1:6379"
    )]
    pub redis_url: String,

    /// What happens when a role slot is already taken.
    #[arg(long, env = "BEACH_FERRY_SLOT_POLICY", value_enum, default_value_t = SlotPolicy::Replace)]
    pub slot_policy: SlotPolicy,

    /// Maximum time a new connection has to send its handshake.
    #[arg(long, env = "BEACH_FERRY_HANDSHAKE_TIMEOUT_SECS", default_value_t = 10)]
    pub handshake_timeout_secs: u64,

    /// How often the reaper sweeps for idle sessions.
    #[arg(long, env = "BEACH_FERRY_REAP_INTERVAL_SECS", default_value_t = 60)]
    pub reap_interval_secs: u64,

    /// Sessions without traffic for this long are evicted.
    #[arg(long, env = "BEACH_FERRY_IDLE_TIMEOUT_SECS", default_value_t = 300)]
    pub idle_timeout_secs: u64,

    /// Frames queued per connection before relaying to it starts dropping.
    #[arg(long, env = "BEACH_FERRY_OUTBOUND_BUFFER", default_value_t = 256)]
    pub outbound_buffer: usize,

    /// Grace period applied during shutdown.
    #[arg(long, env = "BEACH_FERRY_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub mode: RelayMode,
    pub redis_url: String,
    pub slot_policy: SlotPolicy,
    pub handshake_timeout: Duration,
    pub reap_interval: Duration,
    pub idle_timeout: Duration,
    pub outbound_buffer: usize,
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT)),
            mode: RelayMode::Direct,
            redis_url: "redis://127.0.0.1:6379".to_string(),
            slot_policy: SlotPolicy::Replace,
            handshake_timeout: Duration::from_secs(10),
            reap_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(300),
            outbound_buffer: 256,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr = resolve_listen_addr(cli.listen_addr.as_deref(), cli.port)?;
        if cli.handshake_timeout_secs == 0 {
            bail!("handshake timeout must be greater than zero");
        }
        if cli.reap_interval_secs == 0 || cli.idle_timeout_secs == 0 {
            bail!("reap interval and idle timeout must be greater than zero");
        }
        if cli.outbound_buffer == 0 {
            bail!("outbound buffer must hold at least one frame");
        }
        Ok(ServerConfig {
            listen_addr,
            mode: cli.mode,
            redis_url: cli.redis_url,
            slot_policy: cli.slot_policy,
            handshake_timeout: Duration::from_secs(cli.handshake_timeout_secs),
            reap_interval: Duration::from_secs(cli.reap_interval_secs),
            idle_timeout: Duration::from_secs(cli.idle_timeout_secs),
            outbound_buffer: cli.outbound_buffer,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
        })
    }
}

fn resolve_listen_addr(listen_addr: Option<&str>, port: Option<u16>) -> Result<SocketAddr> {
    match listen_addr {
        Some(raw) => raw
            .parse()
            .with_context(|| format!("invalid listen address: {raw}")),
        None => Ok(SocketAddr::from((
            [0, 0, 0, 0],
            port.unwrap_or(DEFAULT_PORT),
        ))),
    }
}
