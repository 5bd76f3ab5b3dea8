//! Chain-service configuration.

use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use spvd_consensus::constants::{NODE_CF, NODE_NETWORK};
use spvd_consensus::ChainParams;

#[derive(Debug)]
pub enum ConfigError {
    UnresolvableAddress(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::UnresolvableAddress(addr) => {
                write!(f, "cannot resolve peer address {addr}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Runtime knobs with network-wide defaults. Tests shrink the ban duration
/// and peer limits.
#[derive(Clone, Debug)]
pub struct Tunables {
    /// Base wait between dial retries to persistent peers; scaled by the
    /// retry count for backoff.
    pub connection_retry_interval: Duration,
    pub user_agent_name: String,
    pub user_agent_version: String,
    /// Services we advertise.
    pub services: u64,
    /// Services outbound peers must advertise to be dialed.
    pub required_services: u64,
    pub ban_threshold: u32,
    pub ban_duration: Duration,
    pub target_outbound: usize,
    pub max_peers: usize,
    pub disable_dns_seed: bool,
    /// Per-peer answer window during multi-peer queries.
    pub query_timeout: Duration,
    /// How long to collect conflicting cfheaders evidence before resolving
    /// by majority.
    pub wait_for_more_cf_headers: Duration,
}

impl Default for Tunables {
    fn default() -> Self {
        Self {
            connection_retry_interval: Duration::from_secs(5),
            user_agent_name: "spvd".to_string(),
            user_agent_version: "0.1.0".to_string(),
            services: NODE_CF,
            required_services: NODE_NETWORK | NODE_CF,
            ban_threshold: 100,
            ban_duration: Duration::from_secs(24 * 60 * 60),
            target_outbound: 8,
            max_peers: 125,
            disable_dns_seed: false,
            query_timeout: Duration::from_secs(5),
            wait_for_more_cf_headers: Duration::from_secs(1),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub data_dir: PathBuf,
    pub chain_params: ChainParams,
    /// Exclusive outbound set; a non-empty list disables DNS seeding and
    /// address-book dialing.
    pub connect_peers: Vec<String>,
    /// Persistent peers dialed alongside discovered ones.
    pub add_peers: Vec<String>,
    pub tunables: Tunables,
}

impl Config {
    pub fn new(data_dir: impl Into<PathBuf>, chain_params: ChainParams) -> Self {
        Self {
            data_dir: data_dir.into(),
            chain_params,
            connect_peers: Vec::new(),
            add_peers: Vec::new(),
            tunables: Tunables::default(),
        }
    }
}

/// Resolves `host[:port]` to a socket address, filling in the network's
/// default port.
pub fn resolve_peer_addr(addr: &str, default_port: u16) -> Result<SocketAddr, ConfigError> {
    if let Ok(parsed) = addr.parse::<SocketAddr>() {
        return Ok(parsed);
    }
    let with_port = if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{addr}:{default_port}")
    };
    with_port
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .ok_or_else(|| ConfigError::UnresolvableAddress(addr.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_addresses_resolve_without_dns() {
        let addr = resolve_peer_addr("10.1.2.3:18555", 18555).unwrap();
        assert_eq!(addr, "10.1.2.3:18555".parse().unwrap());
    }

    #[test]
    fn default_port_is_appended() {
        let addr = resolve_peer_addr("10.1.2.3", 18555).unwrap();
        assert_eq!(addr.port(), 18555);
    }

    #[test]
    fn garbage_fails() {
        assert!(resolve_peer_addr("not an address", 18555).is_err());
    }
}
