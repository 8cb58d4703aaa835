//! Where candidate peers come from before we have any connection to ask.

use std::collections::HashSet;
use std::sync::Arc;

use bitcoin::Network;
use futures::future::join_all;
use futures::future::BoxFuture;
use log::debug;
use log::info;
use log::warn;

use super::address::PeerAddress;
use super::get_port;
use super::random::shuffle;
use super::random::RandomSource;

/// Something that yields addresses we may try to connect to, in no particular order
pub trait PeerDiscovery: Send + Sync + 'static {
    fn find(&self) -> BoxFuture<'_, Vec<PeerAddress>>;
}

/// Returns the DNS seeds of a network
pub fn get_chain_dns_seeds(network: Network) -> Vec<&'static str> {
    let mut seeds = Vec::new();
    // DNS seeds taken from Bitcoin Core at commit 382b692a503355df7347efd9c128aff465b5583e
    match network {
        Network::Bitcoin => {
            seeds.push("seed.bitcoin.sipa.be."); // Pieter Wuille
            seeds.push("dnsseed.bluematt.me."); // Matt Corallo
            seeds.push("dnsseed.bitcoin.dashjr.org."); // Luke Dashjr
            seeds.push("seed.bitcoinstats.com."); // Christian Decker
            seeds.push("seed.bitcoin.jonasschnelli.ch."); // Jonas Schnelli
            seeds.push("seed.btc.petertodd.org."); // Peter Todd
            seeds.push("seed.bitcoin.sprovoost.nl."); // Sjors Provoost
            seeds.push("dnsseed.emzy.de."); // Stephan Oeste
            seeds.push("seed.bitcoin.wiz.biz."); // Jason Maurice
        }
        Network::Testnet => {
            seeds.push("testnet-seed.bitcoin.jonasschnelli.ch.");
            seeds.push("seed.tbtc.petertodd.org.");
            seeds.push("seed.testnet.bitcoin.sprovoost.nl.");
            seeds.push("testnet-seed.bluematt.me.");
        }
        Network::Signet => {
            seeds.push("seed.signet.bitcoin.sprovoost.nl.");
        }
        // no seeds for regtest
        _ => {}
    }
    seeds
}

/// Resolves the DNS seeds of a network
pub struct DnsSeedDiscovery {
    seeds: Vec<String>,
    port: u16,
    random: Arc<dyn RandomSource>,
}

impl DnsSeedDiscovery {
    pub fn new(network: Network, random: Arc<dyn RandomSource>) -> Self {
        DnsSeedDiscovery {
            seeds: get_chain_dns_seeds(network)
                .into_iter()
                .map(String::from)
                .collect(),
            port: get_port(network),
            random,
        }
    }

    /// Uses a custom list of seeds, whose peers listen on `port`
    pub fn with_seeds(seeds: Vec<String>, port: u16, random: Arc<dyn RandomSource>) -> Self {
        DnsSeedDiscovery {
            seeds,
            port,
            random,
        }
    }

    async fn lookup(seed: String, port: u16) -> Vec<PeerAddress> {
        let lookup_seed = seed.clone();
        let result = tokio::task::spawn_blocking(move || dns_lookup::lookup_host(&lookup_seed)).await;

        match result {
            Ok(Ok(ips)) => {
                debug!("Got {} addresses from {seed}", ips.len());
                ips.into_iter()
                    .map(|ip| PeerAddress::new(ip, port))
                    .collect()
            }
            Ok(Err(e)) => {
                warn!("Couldn't resolve seed {seed}: {e}");
                Vec::new()
            }
            Err(e) => {
                warn!("DNS lookup task for {seed} failed: {e}");
                Vec::new()
            }
        }
    }
}

impl PeerDiscovery for DnsSeedDiscovery {
    fn find(&self) -> BoxFuture<'_, Vec<PeerAddress>> {
        Box::pin(async move {
            let lookups = self
                .seeds
                .iter()
                .map(|seed| DnsSeedDiscovery::lookup(seed.clone(), self.port));

            let mut seen = HashSet::new();
            let addresses: Vec<PeerAddress> = join_all(lookups)
                .await
                .into_iter()
                .flatten()
                .filter(|address| seen.insert(*address))
                .collect();

            info!(
                "Found {} addresses from {} DNS seeds",
                addresses.len(),
                self.seeds.len()
            );
            shuffle(self.random.as_ref(), addresses)
        })
    }
}

#[derive(Debug, Clone, Default)]
/// A fixed list of addresses, handed out as is
pub struct StaticDiscovery {
    addresses: Vec<PeerAddress>,
}

impl StaticDiscovery {
    pub fn new(addresses: Vec<PeerAddress>) -> Self {
        StaticDiscovery { addresses }
    }
}

impl PeerDiscovery for StaticDiscovery {
    fn find(&self) -> BoxFuture<'_, Vec<PeerAddress>> {
        let addresses = self.addresses.clone();
        Box::pin(async move { addresses })
    }
}
