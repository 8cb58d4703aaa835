use std::sync::Arc;

use bitcoin::Network;
use peerpool_common::assert_err;
use peerpool_common::assert_ok;
use peerpool_common::Hash256;
use pretty_assertions::assert_eq;

use super::utils::address;
use super::utils::eventually;
use super::utils::genesis_header;
use super::utils::mock_pool;
use super::utils::serving;
use super::utils::Behavior;
use super::utils::MockConnector;
use crate::address::PeerAddress;
use crate::connection::ConnectionState;
use crate::discovery::StaticDiscovery;
use crate::error::WireError;
use crate::pool::Pool;
use crate::random::SeededRandom;
use crate::PoolConfig;

fn config(max_size: usize) -> PoolConfig {
    PoolConfig {
        max_size,
        ..PoolConfig::new(Network::Bitcoin)
    }
}

fn live_addresses(pool: &Pool) -> Vec<PeerAddress> {
    let mut addresses: Vec<_> = pool
        .clients()
        .unwrap()
        .iter()
        .map(|client| client.address())
        .collect();
    addresses.sort();
    addresses
}

#[tokio::test]
async fn test_fills_up_to_max_size() {
    let candidates: Vec<_> = (1..=5).map(address).collect();
    let connector = candidates.iter().fold(MockConnector::new(), |connector, peer| {
        connector.with_peer(*peer, serving(Vec::new(), Vec::new()))
    });
    let pool = mock_pool(config(3), Arc::new(connector));

    assert_ok!(pool.connect(candidates).await);

    assert_eq!(pool.len().unwrap(), 3);
    assert_eq!(pool.queued_addresses().unwrap(), vec![address(4), address(5)]);
    eventually(|| pool.clients().unwrap().len() == 3).await;
    assert_eq!(live_addresses(&pool), vec![address(1), address(2), address(3)]);
}

#[tokio::test]
async fn test_full_pool_ignores_new_addresses() {
    let connector = MockConnector::new()
        .with_peer(address(1), serving(Vec::new(), Vec::new()))
        .with_peer(address(2), serving(Vec::new(), Vec::new()));
    let connector = Arc::new(connector);
    let pool = mock_pool(config(1), connector.clone());

    assert_ok!(pool.connect(vec![address(1)]).await);
    assert_ok!(pool.connect(vec![address(2)]).await);

    assert_eq!(pool.len().unwrap(), 1);
    assert!(pool.queued_addresses().unwrap().is_empty());
    assert_eq!(connector.attempts(&address(2)), 0);
}

#[tokio::test]
async fn test_empty_discovery() {
    let pool = Pool::new(
        PoolConfig::default(),
        Arc::new(MockConnector::new()),
        Arc::new(StaticDiscovery::default()),
        Arc::new(SeededRandom::new(1)),
    );

    assert!(matches!(
        pool.bootstrap().await,
        Err(WireError::NoPeersAvailable)
    ));
    assert!(pool.is_empty().unwrap());
}

#[tokio::test]
async fn test_bootstrap_from_discovery() {
    let connector = MockConnector::new().with_peer(address(1), serving(Vec::new(), Vec::new()));
    let pool = Pool::new(
        PoolConfig::default(),
        Arc::new(connector),
        Arc::new(StaticDiscovery::new(vec![address(1)])),
        Arc::new(SeededRandom::new(1)),
    );

    assert_ok!(pool.bootstrap().await);
    eventually(|| live_addresses(&pool) == vec![address(1)]).await;
}

#[tokio::test]
async fn test_every_candidate_fails() {
    let connector = Arc::new(
        MockConnector::new()
            .with_peer(address(1), Behavior::Refuse)
            .with_peer(address(2), Behavior::Refuse),
    );
    let pool = mock_pool(config(2), connector.clone());

    assert!(matches!(
        pool.connect(vec![address(1), address(2)]).await,
        Err(WireError::NoPeersAvailable)
    ));

    for peer in [address(1), address(2)] {
        assert!(pool.is_blacklisted(&peer).unwrap());
        assert_eq!(connector.attempts(&peer), 3);
    }
    assert!(pool.is_empty().unwrap());
}

#[tokio::test]
async fn test_failed_peer_is_replaced() {
    // address(1) works and knows about a dead peer and a good one
    let connector = Arc::new(
        MockConnector::new()
            .with_peer(address(1), serving(Vec::new(), vec![address(2), address(3)]))
            .with_peer(address(2), Behavior::Refuse)
            .with_peer(address(3), serving(Vec::new(), Vec::new())),
    );
    let pool = mock_pool(config(2), connector.clone());

    assert_ok!(pool.connect(vec![address(1), address(2)]).await);

    eventually(|| pool.is_blacklisted(&address(2)).unwrap()).await;
    eventually(|| live_addresses(&pool) == vec![address(1), address(3)]).await;

    // The dead peer was advertised again, but never retried
    assert_eq!(connector.attempts(&address(2)), 3);
    assert!(!pool.queued_addresses().unwrap().contains(&address(2)));
}

#[tokio::test]
async fn test_blacklist_covers_every_port() {
    let connector = Arc::new(MockConnector::new().with_peer(address(1), Behavior::Refuse));
    let pool = mock_pool(config(1), connector.clone());

    assert_err!(pool.connect(vec![address(1)]).await);
    assert!(pool.is_blacklisted(&address(1)).unwrap());

    // Same host on another port is still the same peer
    let other_port = PeerAddress::new(address(1).ip, 18333);
    assert!(pool.is_blacklisted(&other_port).unwrap());
    assert!(matches!(
        pool.connect(vec![other_port]).await,
        Err(WireError::NoPeersAvailable)
    ));

    assert_eq!(connector.attempts(&other_port), 0);
    assert_eq!(connector.attempts(&address(1)), 3);
    assert!(pool.queued_addresses().unwrap().is_empty());
}

#[tokio::test]
async fn test_learned_addresses_use_default_port() {
    let advertised = vec![
        PeerAddress::new(address(7).ip, 18444),
        PeerAddress::new(address(7).ip, 8334),
        PeerAddress::new(address(8).ip, 38333),
    ];
    let connector = MockConnector::new().with_peer(address(1), serving(Vec::new(), advertised));
    let pool = mock_pool(config(1), Arc::new(connector));

    assert_ok!(pool.connect(vec![address(1)]).await);

    assert_eq!(pool.get_peers().await, vec![address(7), address(8)]);
}

#[tokio::test]
async fn test_rediscovered_host_on_new_port_is_not_retried() {
    // address(1) advertises the dead peer again, on another port
    let connector = Arc::new(
        MockConnector::new()
            .with_peer(
                address(1),
                serving(
                    Vec::new(),
                    vec![PeerAddress::new(address(2).ip, 18333), address(3)],
                ),
            )
            .with_peer(address(2), Behavior::Refuse)
            .with_peer(address(3), serving(Vec::new(), Vec::new())),
    );
    let pool = mock_pool(config(2), connector.clone());

    assert_ok!(pool.connect(vec![address(1), address(2)]).await);

    eventually(|| live_addresses(&pool) == vec![address(1), address(3)]).await;
    assert_eq!(connector.attempts(&address(2)), 3);
    assert_eq!(connector.attempts(&PeerAddress::new(address(2).ip, 18333)), 0);
}

#[tokio::test]
async fn test_lost_peer_is_retried_then_blacklisted() {
    let connector = Arc::new(
        MockConnector::new().with_peer(address(1), serving(Vec::new(), Vec::new())),
    );
    let pool = mock_pool(config(1), connector.clone());

    assert_ok!(pool.connect(vec![address(1)]).await);
    eventually(|| pool.clients().unwrap().len() == 1).await;

    connector.set_behavior(address(1), Behavior::Refuse);
    pool.random_client().unwrap().disconnect();

    eventually(|| pool.is_blacklisted(&address(1)).unwrap()).await;
    assert!(pool.clients().unwrap().is_empty());
    assert_eq!(connector.attempts(&address(1)), 3);
    assert_err!(pool.random_client());
}

#[tokio::test]
async fn test_disconnect() {
    let connector = MockConnector::new()
        .with_peer(address(1), serving(Vec::new(), Vec::new()))
        .with_peer(address(2), serving(Vec::new(), Vec::new()));
    let pool = mock_pool(config(2), Arc::new(connector));

    assert_ok!(pool.connect(vec![address(1), address(2)]).await);
    eventually(|| pool.clients().unwrap().len() == 2).await;
    let clients = pool.clients().unwrap();

    assert_ok!(pool.disconnect());

    assert!(pool.is_empty().unwrap());
    assert!(pool.clients().unwrap().is_empty());
    for client in clients {
        assert_ok!(client.wait_for(ConnectionState::Closed).await);
    }
    assert!(!pool.is_blacklisted(&address(1)).unwrap());
}

#[tokio::test]
async fn test_requests_through_pool() {
    let header = genesis_header(Network::Bitcoin);
    let connector =
        MockConnector::new().with_peer(address(1), serving(vec![header], vec![address(9)]));
    let pool = mock_pool(config(1), Arc::new(connector));

    assert_ok!(pool.connect(vec![address(1)]).await);

    assert_eq!(pool.get_headers(&[Hash256::ZERO]).await.unwrap(), vec![header]);
    assert_eq!(pool.get_peers().await, vec![address(9)]);
    assert!(pool.get_blocks(&[]).await.unwrap().is_empty());
    assert!(pool.get_transactions(&[]).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_requests_without_peers() {
    let pool = mock_pool(config(1), Arc::new(MockConnector::new()));

    assert!(matches!(
        pool.get_headers(&[Hash256::ZERO]).await,
        Err(WireError::NoPeersAvailable)
    ));
    assert!(pool.get_peers().await.is_empty());
}
