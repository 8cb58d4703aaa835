//! Main module for the p2p engine. Everything that touches the Bitcoin gossip network lives in
//! here: message framing, per-peer connections, supervisors, the pool and consensus queries.

use std::time::Duration;

use bitcoin::p2p::ServiceFlags;
use bitcoin::Network;

pub mod address;
pub mod codec;
pub mod connection;
pub mod consensus;
pub mod discovery;
pub mod error;
pub mod pending;
pub mod pool;
pub mod random;
pub mod supervisor;
pub mod transport;

#[cfg(test)]
mod tests;

/// The user agent we announce in our `version` message
pub const DEFAULT_USER_AGENT: &str = concat!("/peerpool:", env!("CARGO_PKG_VERSION"), "/");

/// Returns the well-known p2p port for a network
pub fn get_port(network: Network) -> u16 {
    match network {
        Network::Bitcoin => 8333,
        Network::Testnet => 18333,
        Network::Signet => 38333,
        Network::Regtest => 18444,
        _ => 8333,
    }
}

#[derive(Debug, Clone)]
/// Settings for a single peer connection.
pub struct ConnectionConfig {
    /// Which network we are talking to, this decides the magic bits in every frame.
    /// Defaults to Bitcoin.
    pub network: Network,
    /// The user agent we send in our `version` message
    pub user_agent: String,
    /// Services we announce. Defaults to none, we are a client and don't serve data.
    pub services: ServiceFlags,
    /// The height we claim to be at. Defaults to 0.
    pub start_height: i32,
    /// How long a single request may wait for its response. Defaults to 5 seconds.
    pub request_timeout: Duration,
    /// While we have requests in flight, how long the peer may stay silent before we give up on
    /// the whole connection. Defaults to 10 seconds.
    pub idle_timeout: Duration,
    /// How long the version/verack exchange may take. Defaults to 10 seconds.
    pub handshake_timeout: Duration,
    /// How long establishing the transport may take. Defaults to 10 seconds.
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            network: Network::Bitcoin,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            services: ServiceFlags::NONE,
            start_height: 0,
            request_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
/// Configuration for the connection pool.
pub struct PoolConfig {
    /// Below this many live connections, running out of candidate addresses is an error.
    /// Defaults to 1.
    pub min_size: usize,
    /// We never keep more than this many connections, live or being established.
    /// Defaults to 10.
    pub max_size: usize,
    /// How many times a supervisor may reconnect before its address is blacklisted.
    /// Defaults to 2.
    ///
    /// The counter is only cleared the first time a connection becomes ready, so a peer that
    /// keeps accepting and then dropping us will still be abandoned eventually.
    pub max_retries: u32,
    /// How many distinct peers must agree on a consensus query. Defaults to 3.
    pub consensus_size: usize,
    /// Port used for addresses learned without one. Defaults to the network's well-known port.
    pub default_port: u16,
    /// Settings applied to every connection the pool opens
    pub connection: ConnectionConfig,
}

impl PoolConfig {
    /// Creates a default configuration for a given network
    pub fn new(network: Network) -> Self {
        PoolConfig {
            default_port: get_port(network),
            connection: ConnectionConfig {
                network,
                ..Default::default()
            },
            ..Default::default()
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        PoolConfig {
            min_size: 1,
            max_size: 10,
            max_retries: 2,
            consensus_size: 3,
            default_port: get_port(Network::Bitcoin),
            connection: ConnectionConfig::default(),
        }
    }
}
