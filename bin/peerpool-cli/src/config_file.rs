use std::time::Duration;

use peerpool_wire::PoolConfig;
use serde::Deserialize;

use crate::error::CliError;

#[derive(Default, Debug, Deserialize, PartialEq)]
pub struct Pool {
    pub min_size: Option<usize>,
    pub max_size: Option<usize>,
    pub max_retries: Option<u32>,
    pub consensus_size: Option<usize>,
    /// Peers to use instead of the DNS seeds
    pub peers: Option<Vec<String>>,
}

#[derive(Default, Debug, Deserialize, PartialEq)]
/// Timeouts are in seconds
pub struct Connection {
    pub user_agent: Option<String>,
    pub request_timeout: Option<u64>,
    pub idle_timeout: Option<u64>,
    pub handshake_timeout: Option<u64>,
    pub connect_timeout: Option<u64>,
}

#[derive(Default, Debug, Deserialize, PartialEq)]
pub struct ConfigFile {
    #[serde(default)]
    pub pool: Pool,
    #[serde(default)]
    pub connection: Connection,
}

impl ConfigFile {
    pub fn from_file(filename: &str) -> Result<Self, CliError> {
        let file = std::fs::read_to_string(filename)?;
        Ok(toml::from_str(&file)?)
    }

    /// Overwrites every setting of `config` this file sets
    pub fn apply(&self, config: &mut PoolConfig) {
        let pool = &self.pool;
        if let Some(min_size) = pool.min_size {
            config.min_size = min_size;
        }
        if let Some(max_size) = pool.max_size {
            config.max_size = max_size;
        }
        if let Some(max_retries) = pool.max_retries {
            config.max_retries = max_retries;
        }
        if let Some(consensus_size) = pool.consensus_size {
            config.consensus_size = consensus_size;
        }

        let connection = &self.connection;
        if let Some(user_agent) = &connection.user_agent {
            config.connection.user_agent = user_agent.clone();
        }
        if let Some(secs) = connection.request_timeout {
            config.connection.request_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = connection.idle_timeout {
            config.connection.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = connection.handshake_timeout {
            config.connection.handshake_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = connection.connect_timeout {
            config.connection.connect_timeout = Duration::from_secs(secs);
        }
    }
}
