//! This module defines types used to configure the engine and its parts.

use std::time::Duration;

use serde::Deserialize;

/// The protocol version advertised during login.
pub const PROTOCOL_VERSION: u32 = 160;

/// The minor protocol version advertised during login.
pub const PROTOCOL_MINOR_VERSION: u32 = 1;

/// The global configuration for the engine and all its parts.
#[derive(Clone, Debug, Deserialize)]
pub struct Conf {
    pub server: ServerConf,
    #[serde(default)]
    pub pool: PoolConf,
    #[serde(default)]
    pub peer: PeerConf,
}

impl Conf {
    /// Returns the configuration with reasonable defaults, except for the
    /// server endpoint, as it is not sensible to guess that for the user.
    pub fn new(server_host: impl Into<String>, server_port: u16) -> Self {
        Self {
            server: ServerConf::new(server_host, server_port),
            pool: PoolConf::default(),
            peer: PeerConf::default(),
        }
    }
}

/// Configuration of the central server control channel.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerConf {
    /// The central server hostname.
    pub host: String,

    /// The central server port.
    pub port: u16,

    /// The TCP port this client accepts inbound peer connections on. It is
    /// also advertised to the server so peers behind NAT can be told to
    /// connect back to us.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// The server receive buffer is torn down if it grows beyond this.
    #[serde(default = "default_server_receive_buffer")]
    pub max_receive_buffer_bytes: usize,

    /// How long a connect attempt to the server may take.
    #[serde(default = "default_connect_timeout", with = "serde_secs")]
    pub connect_timeout: Duration,
}

impl ServerConf {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            listen_port: default_listen_port(),
            max_receive_buffer_bytes: default_server_receive_buffer(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

/// Configuration of the peer connection pool.
#[derive(Clone, Debug, Deserialize)]
pub struct PoolConf {
    /// The global cap on concurrently live peer connections.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// The cap on concurrently live connections from a single remote IP.
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,

    /// The number of inbound attempts a single IP may make within
    /// `rate_limit_window` before further attempts are rejected.
    #[serde(default = "default_max_attempts_per_window")]
    pub max_attempts_per_window: usize,

    /// The sliding window over which inbound attempts are counted.
    #[serde(default = "default_rate_limit_window", with = "serde_secs")]
    pub rate_limit_window: Duration,

    /// How long a connect attempt, or a pending indirect-connection entry,
    /// may be outstanding before it is abandoned.
    #[serde(default = "default_connect_timeout", with = "serde_secs")]
    pub connect_timeout: Duration,

    /// A connection with no traffic for this long is garbage collected.
    #[serde(default = "default_idle_timeout", with = "serde_secs")]
    pub idle_timeout: Duration,

    /// A connection that completed TCP connect but produced no traffic at
    /// all within this long is treated as a ghost and dropped.
    #[serde(default = "default_ghost_timeout", with = "serde_secs")]
    pub ghost_timeout: Duration,

    /// The period of the pool's sweep timer.
    #[serde(default = "default_sweep_interval", with = "serde_secs")]
    pub sweep_interval: Duration,

    /// Whether outbound addresses are validated against the loopback,
    /// multicast and reserved ranges. Disabled only for LAN and test
    /// setups that dial loopback peers.
    #[serde(default = "default_validate_addresses")]
    pub validate_addresses: bool,
}

impl Default for PoolConf {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_connections_per_ip: default_max_connections_per_ip(),
            max_attempts_per_window: default_max_attempts_per_window(),
            rate_limit_window: default_rate_limit_window(),
            connect_timeout: default_connect_timeout(),
            idle_timeout: default_idle_timeout(),
            ghost_timeout: default_ghost_timeout(),
            sweep_interval: default_sweep_interval(),
            validate_addresses: default_validate_addresses(),
        }
    }
}

/// Configuration of individual peer connections.
#[derive(Clone, Debug, Deserialize)]
pub struct PeerConf {
    /// The peer receive buffer is torn down if it grows beyond this.
    ///
    /// A correctly framed message never comes close to this; a buffer this
    /// large means a hostile or badly broken peer.
    #[serde(default = "default_peer_receive_buffer")]
    pub max_receive_buffer_bytes: usize,

    /// Payloads that inflate beyond this are rejected as decompression
    /// failures.
    #[serde(default = "default_max_decompressed_bytes")]
    pub max_decompressed_bytes: usize,

    /// Payloads whose decompressed-to-compressed ratio exceeds this are
    /// rejected as decompression failures.
    #[serde(default = "default_max_compression_ratio")]
    pub max_compression_ratio: u64,
}

impl Default for PeerConf {
    fn default() -> Self {
        Self {
            max_receive_buffer_bytes: default_peer_receive_buffer(),
            max_decompressed_bytes: default_max_decompressed_bytes(),
            max_compression_ratio: default_max_compression_ratio(),
        }
    }
}

fn default_listen_port() -> u16 {
    2234
}

fn default_server_receive_buffer() -> usize {
    50 * 1024 * 1024
}

fn default_max_connections() -> usize {
    50
}

fn default_max_connections_per_ip() -> usize {
    30
}

fn default_max_attempts_per_window() -> usize {
    10
}

fn default_rate_limit_window() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_idle_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_ghost_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_sweep_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_validate_addresses() -> bool {
    true
}

fn default_peer_receive_buffer() -> usize {
    150 * 1024 * 1024
}

fn default_max_decompressed_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_max_compression_ratio() -> u64 {
    1000
}

/// Durations are configured as whole seconds.
mod serde_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let conf = Conf::new("server.slsknet.org", 2242);
        assert_eq!(conf.pool.max_connections, 50);
        assert_eq!(conf.pool.max_connections_per_ip, 30);
        assert_eq!(conf.pool.max_attempts_per_window, 10);
        assert_eq!(conf.pool.rate_limit_window, Duration::from_secs(60));
        assert_eq!(conf.pool.connect_timeout, Duration::from_secs(30));
        assert_eq!(conf.peer.max_receive_buffer_bytes, 150 * 1024 * 1024);
        assert_eq!(conf.server.max_receive_buffer_bytes, 50 * 1024 * 1024);
        assert_eq!(conf.peer.max_decompressed_bytes, 50 * 1024 * 1024);
        assert_eq!(conf.peer.max_compression_ratio, 1000);
    }
}
