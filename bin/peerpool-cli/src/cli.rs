use bitcoin::Network;
use clap::Parser;
use clap::Subcommand;
use peerpool_common::Hash256;

#[derive(Debug, Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Sets a custom config file. Defaults to `$HOME/.peerpool/config.toml`, if it exists.
    #[arg(short, long, value_name = "FILE")]
    pub config_file: Option<String>,

    /// Which network should we use
    #[arg(short, long, default_value_t = Network::Bitcoin)]
    pub network: Network,

    /// Turn debugging information on
    #[arg(short, long, default_value_t = false)]
    pub debug: bool,

    /// Only connect to these peers (`ip`, `ip:port` or `[ipv6]:port`), DNS seeds are skipped
    #[arg(long, value_name = "ADDRESS")]
    pub connect: Vec<String>,

    /// Ask `consensus_size` peers and only print an answer they all agree on
    #[arg(long, default_value_t = false)]
    pub consensus: bool,

    /// Overrides the maximum number of connections
    #[arg(long)]
    pub max_size: Option<usize>,

    /// Overrides how many peers must agree on a consensus query
    #[arg(long)]
    pub consensus_size: Option<usize>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Commands {
    /// Lists the inventory of blocks following a locator
    #[command(name = "getblocks")]
    GetBlocks {
        /// Locator hashes, most recent first. Defaults to the genesis block.
        locator: Vec<Hash256>,
    },

    /// Fetches the headers following a locator
    #[command(name = "getheaders")]
    GetHeaders {
        /// Locator hashes, most recent first. Defaults to the genesis block.
        locator: Vec<Hash256>,
    },

    /// Fetches blocks by hash, all from the same peer
    #[command(name = "getblock")]
    GetBlock {
        #[arg(required = true)]
        hashes: Vec<Hash256>,
    },

    /// Fetches transactions by id. Peers only serve mempool transactions.
    #[command(name = "gettransaction")]
    GetTransaction {
        #[arg(required = true)]
        txids: Vec<Hash256>,
    },

    /// Lists the transactions in a peer's mempool
    #[command(name = "mempool")]
    Mempool,

    /// Asks a peer for more addresses
    #[command(name = "getpeers")]
    GetPeers,

    /// Shows the pool after bootstrapping
    #[command(name = "status")]
    Status,
}

#[cfg(test)]
mod tests {
    use clap::Parser;
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn test_parse_getheaders() {
        let cli = Cli::try_parse_from([
            "peerpool",
            "--network",
            "signet",
            "--connect",
            "127.0.0.1:38333",
            "--consensus",
            "getheaders",
            "0x0a",
        ])
        .unwrap();

        assert_eq!(cli.network, Network::Signet);
        assert_eq!(cli.connect, vec!["127.0.0.1:38333".to_string()]);
        assert!(cli.consensus);
        match cli.command {
            Commands::GetHeaders { locator } => assert_eq!(locator, vec![Hash256::from(10u64)]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_parse_getblock_batch() {
        let cli = Cli::try_parse_from(["peerpool", "getblock", "0x01", "0x02"]).unwrap();

        match cli.command {
            Commands::GetBlock { hashes } => {
                assert_eq!(hashes, vec![Hash256::from(1u64), Hash256::from(2u64)])
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_rejects_bad_hash() {
        assert!(Cli::try_parse_from(["peerpool", "getblock", "not-a-hash"]).is_err());
        assert!(Cli::try_parse_from(["peerpool", "getblock"]).is_err());
    }
}
