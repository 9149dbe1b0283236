use std::{net::SocketAddr, time::Duration};

use anyhow::Context;
use clap::Parser;

use crate::presence::RegistryConfig;

const DEFAULT_CHANNEL_DEPTH: usize = 64;

#[derive(Debug, Parser)]
#[command(
    name = "tripteller-presence-server",
    author,
    version,
    about = "TripTeller live location presence server"
)]
pub struct Cli {
    /// Address to bind the HTTP/WebSocket listener to.
    #[arg(
        long,
        env = "TRIPTELLER_PRESENCE_LISTEN_ADDR",
        default_value = "127.0.0.1:5000"
    )]
    pub listen_addr: String,

    /// Reject sockets that do not present a valid identity token.
    #[arg(long, env = "TRIPTELLER_PRESENCE_REQUIRE_IDENTITY", default_value_t = false)]
    pub require_identity: bool,

    /// How often the staleness reaper sweeps the registry.
    #[arg(long, env = "TRIPTELLER_PRESENCE_REAP_INTERVAL_SECS", default_value_t = 120)]
    pub reap_interval_secs: u64,

    /// Subjects silent for longer than this are reaped.
    #[arg(
        long,
        env = "TRIPTELLER_PRESENCE_SUBJECT_STALE_SECS",
        default_value_t = 300
    )]
    pub subject_stale_secs: u64,

    /// Observers that send no frame for longer than this are dropped.
    #[arg(
        long,
        env = "TRIPTELLER_PRESENCE_OBSERVER_IDLE_SECS",
        default_value_t = 90
    )]
    pub observer_idle_secs: u64,

    /// Minimum spacing between accepted samples of one subject.
    #[arg(
        long,
        env = "TRIPTELLER_PRESENCE_MIN_SAMPLE_INTERVAL_MS",
        default_value_t = 500
    )]
    pub min_sample_interval_ms: u64,

    /// Outbound frames buffered per socket before deliveries start dropping.
    #[arg(
        long,
        env = "TRIPTELLER_PRESENCE_CONNECTION_BUFFER",
        default_value_t = DEFAULT_CHANNEL_DEPTH
    )]
    pub connection_buffer: usize,

    /// Consecutive dropped deliveries after which an observer is evicted.
    #[arg(
        long,
        env = "TRIPTELLER_PRESENCE_MAX_DELIVERY_FAILURES",
        default_value_t = 3
    )]
    pub max_delivery_failures: u32,

    /// Grace period applied during shutdown.
    #[arg(long, env = "TRIPTELLER_PRESENCE_SHUTDOWN_GRACE_SECS", default_value_t = 5)]
    pub shutdown_grace_secs: u64,

    /// Export tracing spans to stdout through OpenTelemetry.
    #[arg(long, env = "TRIPTELLER_PRESENCE_OTEL_STDOUT", default_value_t = false)]
    pub otel_stdout: bool,
}

/// Tunables shared by the registry, dispatcher and reaper.
#[derive(Debug, Clone)]
pub struct PresenceConfig {
    pub connection_buffer: usize,
    pub max_delivery_failures: u32,
    pub min_sample_interval: Duration,
    pub reap_interval: Duration,
    pub subject_stale_timeout: Duration,
    pub observer_idle_timeout: Duration,
    pub require_identity: bool,
}

impl Default for PresenceConfig {
    fn default() -> Self {
        Self {
            connection_buffer: DEFAULT_CHANNEL_DEPTH,
            max_delivery_failures: 3,
            min_sample_interval: Duration::from_millis(500),
            reap_interval: Duration::from_secs(120),
            subject_stale_timeout: Duration::from_secs(300),
            observer_idle_timeout: Duration::from_secs(90),
            require_identity: false,
        }
    }
}

impl From<&PresenceConfig> for RegistryConfig {
    fn from(config: &PresenceConfig) -> Self {
        RegistryConfig {
            max_delivery_failures: config.max_delivery_failures,
            min_sample_interval_ms: config.min_sample_interval.as_millis() as u64,
            observer_idle_ms: config.observer_idle_timeout.as_millis() as u64,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    pub shutdown_grace: Duration,
    pub otel_stdout: bool,
    pub presence: PresenceConfig,
}

impl TryFrom<Cli> for ServerConfig {
    type Error = anyhow::Error;

    fn try_from(cli: Cli) -> Result<Self, Self::Error> {
        let listen_addr: SocketAddr = cli
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address: {}", cli.listen_addr))?;
        if cli.connection_buffer == 0 {
            anyhow::bail!("connection buffer must be greater than zero");
        }
        if cli.reap_interval_secs == 0 {
            anyhow::bail!("reap interval must be greater than zero");
        }
        if cli.observer_idle_secs == 0 {
            anyhow::bail!("observer idle timeout must be greater than zero");
        }
        Ok(ServerConfig {
            listen_addr,
            shutdown_grace: Duration::from_secs(cli.shutdown_grace_secs),
            otel_stdout: cli.otel_stdout,
            presence: PresenceConfig {
                connection_buffer: cli.connection_buffer,
                max_delivery_failures: cli.max_delivery_failures.max(1),
                min_sample_interval: Duration::from_millis(cli.min_sample_interval_ms),
                reap_interval: Duration::from_secs(cli.reap_interval_secs),
                subject_stale_timeout: Duration::from_secs(cli.subject_stale_secs),
                observer_idle_timeout: Duration::from_secs(cli.observer_idle_secs),
                require_identity: cli.require_identity,
            },
        })
    }
}
