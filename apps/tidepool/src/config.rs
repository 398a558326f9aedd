use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use once_cell::sync::Lazy;
use tracing::warn;

/// Interval between silent keepalive frames on an idle channel.
pub const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_millis(250);
/// How long the server waits for each of the two kernel connections
/// (and for the channel tag on each) before giving up on startup.
pub const DEFAULT_ACCEPT_TIMEOUT: Duration = Duration::from_secs(180);
/// Grace period between asking the kernel to exit and killing it.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

const ENV_KEEPALIVE_MS: &str = "TIDEPOOL_KEEPALIVE_MS";
const ENV_ACCEPT_TIMEOUT_MS: &str = "TIDEPOOL_ACCEPT_TIMEOUT_MS";
const ENV_SHUTDOWN_GRACE_MS: &str = "TIDEPOOL_SHUTDOWN_GRACE_MS";
const ENV_FORCE_SERVER_ADDRESS: &str = "TIDEPOOL_FORCE_SERVER_ADDRESS";

/// Tuning knobs for the kernel transport.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub keepalive_interval: Duration,
    pub accept_timeout: Duration,
    pub shutdown_grace: Duration,
    /// Address to bind the kernel listener on instead of loopback.
    pub force_server_address: Option<IpAddr>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: DEFAULT_KEEPALIVE_INTERVAL,
            accept_timeout: DEFAULT_ACCEPT_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
            force_server_address: None,
        }
    }
}

impl TransportConfig {
    pub fn from_env() -> Self {
        Self {
            keepalive_interval: parse_duration_env(ENV_KEEPALIVE_MS, DEFAULT_KEEPALIVE_INTERVAL),
            accept_timeout: parse_duration_env(ENV_ACCEPT_TIMEOUT_MS, DEFAULT_ACCEPT_TIMEOUT),
            shutdown_grace: parse_duration_env(ENV_SHUTDOWN_GRACE_MS, DEFAULT_SHUTDOWN_GRACE),
            force_server_address: parse_addr_env(ENV_FORCE_SERVER_ADDRESS),
        }
    }

    /// The address the kernel listener binds on, port 0 (ephemeral).
    pub fn bind_address(&self) -> SocketAddr {
        let ip = self
            .force_server_address
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        SocketAddr::new(ip, 0)
    }
}

/// Process-wide transport config, read from the environment once.
pub fn runtime_config() -> &'static TransportConfig {
    static CONFIG: Lazy<TransportConfig> = Lazy::new(TransportConfig::from_env);
    &CONFIG
}

fn parse_duration_env(var: &str, default: Duration) -> Duration {
    match env::var(var) {
        Ok(value) => match value.trim().parse::<u64>() {
            Ok(ms) => Duration::from_millis(ms),
            Err(err) => {
                warn!(
                    target = "tidepool::config",
                    var,
                    error = %err,
                    default_ms = default.as_millis(),
                    "invalid duration env; using default"
                );
                default
            }
        },
        Err(_) => default,
    }
}

fn parse_addr_env(var: &str) -> Option<IpAddr> {
    let value = env::var(var).ok()?;
    match value.trim().parse::<IpAddr>() {
        Ok(addr) => Some(addr),
        Err(err) => {
            warn!(
                target = "tidepool::config",
                var,
                error = %err,
                "invalid server address env; binding loopback"
            );
            None
        }
    }
}
