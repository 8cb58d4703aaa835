//! A bounded pool of peer connections.
//!
//! The pool keeps a queue of candidate addresses, one [`ConnectionSupervisor`] per address it is
//! currently trying to keep connected, the handles of connections that are ready, and a
//! blacklist of addresses whose supervisor ran out of retries. All of it lives behind one mutex
//! that is never held across an await. Supervisor events are applied by a single maintenance
//! task, in the order supervisors sent them.
//!
//! Peers are identified by host: addresses learned from other peers are moved to the network's
//! default port, and blacklisting a host covers every port it may be advertised on.
//!
//! Whenever a supervisor gives up, its host is blacklisted and the pool tries to fill the
//! slot: from the queue if it has anything, otherwise by asking a random live peer for more
//! addresses.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::sync::Weak;

use bitcoin::block::Header;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::Block;
use bitcoin::Transaction;
use futures::future::select_ok;
use futures::future::BoxFuture;
use log::debug;
use log::info;
use log::warn;
use peerpool_common::Hash256;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;

use super::address::PeerAddress;
use super::connection::ConnectionHandle;
use super::discovery::PeerDiscovery;
use super::error::WireError;
use super::random::RandomSource;
use super::supervisor::ConnectionSupervisor;
use super::supervisor::FirstReady;
use super::supervisor::PoolEvent;
use super::transport::Connector;
use super::PoolConfig;

#[derive(Default)]
struct PoolState {
    /// Addresses we may connect to, oldest first
    queue: VecDeque<PeerAddress>,
    /// Hosts whose supervisor gave up. They are never queued again, on any port.
    blacklist: HashSet<IpAddr>,
    /// Every address we are connected, or trying to connect, to
    supervisors: HashMap<PeerAddress, AbortHandle>,
    /// Connections that finished their handshake
    live: BTreeMap<PeerAddress, ConnectionHandle>,
}

impl PoolState {
    /// Queues the addresses we don't know about yet, returns how many were added
    fn enqueue(&mut self, addresses: impl IntoIterator<Item = PeerAddress>) -> usize {
        let mut added = 0;
        for address in addresses {
            if self.blacklist.contains(&address.ip)
                || self.supervisors.contains_key(&address)
                || self.queue.contains(&address)
            {
                continue;
            }

            self.queue.push_back(address);
            added += 1;
        }

        added
    }

    fn clients(&self) -> Vec<ConnectionHandle> {
        self.live
            .values()
            .filter(|handle| handle.is_ready())
            .cloned()
            .collect()
    }

    /// Forgets everything about `address` but the fact that it is blacklisted. Returns whether
    /// it still had a supervisor.
    fn blacklist(&mut self, address: PeerAddress) -> bool {
        self.live.remove(&address);
        self.queue.retain(|queued| queued.ip != address.ip);
        self.blacklist.insert(address.ip);
        self.supervisors.remove(&address).is_some()
    }
}

pub(crate) struct PoolInner {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    discovery: Arc<dyn PeerDiscovery>,
    random: Arc<dyn RandomSource>,
    state: Mutex<PoolState>,
    events: mpsc::UnboundedSender<PoolEvent>,
}

#[derive(Clone)]
/// A handle to the pool. Clones share the same connections.
pub struct Pool {
    pub(crate) inner: Arc<PoolInner>,
}

impl Pool {
    /// Creates an empty pool. Must be called from within a tokio runtime, since it spawns the
    /// task that applies supervisor events.
    pub fn new(
        config: PoolConfig,
        connector: Arc<dyn Connector>,
        discovery: Arc<dyn PeerDiscovery>,
        random: Arc<dyn RandomSource>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(PoolInner {
            config,
            connector,
            discovery,
            random,
            state: Mutex::new(PoolState::default()),
            events: events_tx,
        });

        tokio::spawn(PoolInner::maintenance(Arc::downgrade(&inner), events_rx));

        Pool { inner }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// Asks peer discovery for candidates and connects to them
    pub async fn bootstrap(&self) -> Result<(), WireError> {
        let candidates = self.inner.discovery.find().await;
        info!("Bootstrapping pool with {} candidates", candidates.len());
        self.connect(candidates).await
    }

    /// Queues `new_addresses` and opens connections until the pool is full or we run out of
    /// candidates. Returns as soon as one new connection is ready, the rest keep going in the
    /// background.
    pub async fn connect(&self, new_addresses: Vec<PeerAddress>) -> Result<(), WireError> {
        self.inner.connect(new_addresses).await
    }

    /// Asks a random live peer for addresses, moved to the default port. Never fails, a failure
    /// just means no addresses.
    pub async fn get_peers(&self) -> Vec<PeerAddress> {
        self.inner.get_peers().await
    }

    /// Every connection that is ready to take requests
    pub fn clients(&self) -> Result<Vec<ConnectionHandle>, WireError> {
        Ok(self.inner.state.lock()?.clients())
    }

    /// How many supervisors we have, that is, live connections plus the ones being attempted
    pub fn len(&self) -> Result<usize, WireError> {
        Ok(self.inner.state.lock()?.supervisors.len())
    }

    pub fn is_empty(&self) -> Result<bool, WireError> {
        Ok(self.len()? == 0)
    }

    pub fn is_blacklisted(&self, address: &PeerAddress) -> Result<bool, WireError> {
        Ok(self.inner.state.lock()?.blacklist.contains(&address.ip))
    }

    pub fn queued_addresses(&self) -> Result<Vec<PeerAddress>, WireError> {
        Ok(self.inner.state.lock()?.queue.iter().copied().collect())
    }

    /// Stops every supervisor and closes every connection. Queued and blacklisted addresses
    /// are kept.
    pub fn disconnect(&self) -> Result<(), WireError> {
        let live = {
            let mut state = self.inner.state.lock()?;
            for (_, supervisor) in state.supervisors.drain() {
                supervisor.abort();
            }
            std::mem::take(&mut state.live)
        };

        info!("Disconnecting from {} peers", live.len());
        for handle in live.values() {
            handle.disconnect();
        }

        Ok(())
    }

    /// A random connection that is ready
    pub fn random_client(&self) -> Result<ConnectionHandle, WireError> {
        self.inner.random_client()
    }

    /// Asks a random peer for the inventory of blocks after `locator`
    pub async fn get_block_list(&self, locator: &[Hash256]) -> Result<Vec<Inventory>, WireError> {
        self.connect(Vec::new()).await?;
        self.random_client()?.get_block_list(locator).await
    }

    /// Asks a random peer for the headers after `locator`
    pub async fn get_headers(&self, locator: &[Hash256]) -> Result<Vec<Header>, WireError> {
        self.connect(Vec::new()).await?;
        self.random_client()?.get_headers(locator).await
    }

    /// Asks a random peer for its mempool inventory
    pub async fn get_mem_pool(&self) -> Result<Vec<Inventory>, WireError> {
        self.connect(Vec::new()).await?;
        self.random_client()?.get_mem_pool().await
    }

    /// Downloads `hashes` from a random peer with one `getdata`. Blocks it doesn't have are
    /// `None`.
    pub async fn get_blocks(&self, hashes: &[Hash256]) -> Result<Vec<Option<Block>>, WireError> {
        self.connect(Vec::new()).await?;
        self.random_client()?.get_blocks(hashes).await
    }

    /// Downloads `txids` from a random peer's mempool with one `getdata`
    pub async fn get_transactions(
        &self,
        txids: &[Hash256],
    ) -> Result<Vec<Option<Transaction>>, WireError> {
        self.connect(Vec::new()).await?;
        self.random_client()?.get_transactions(txids).await
    }
}

impl PoolInner {
    async fn maintenance(pool: Weak<PoolInner>, mut events: mpsc::UnboundedReceiver<PoolEvent>) {
        while let Some(event) = events.recv().await {
            let Some(pool) = pool.upgrade() else {
                break;
            };

            if let Err(e) = pool.handle_event(event) {
                warn!("Couldn't apply pool event: {e}");
            }
        }

        debug!("Pool maintenance task stopped");
    }

    fn handle_event(self: &Arc<Self>, event: PoolEvent) -> Result<(), WireError> {
        match event {
            PoolEvent::Ready(address, handle) => self.register_live(address, handle),
            PoolEvent::Lost(address) => {
                self.state.lock()?.live.remove(&address);
                Ok(())
            }
            PoolEvent::GaveUp(address) => self.connection_failed(address),
        }
    }

    /// Records a ready connection, unless its supervisor was already dropped or it closed in
    /// the meantime
    fn register_live(&self, address: PeerAddress, handle: ConnectionHandle) -> Result<(), WireError> {
        let mut state = self.state.lock()?;
        if state.supervisors.contains_key(&address) && handle.is_ready() {
            state.live.insert(address, handle);
        }

        Ok(())
    }

    /// Called when a supervisor gives up: blacklists its address and tries to fill the slot in
    /// the background
    fn connection_failed(self: &Arc<Self>, address: PeerAddress) -> Result<(), WireError> {
        let was_supervised = self.state.lock()?.blacklist(address);
        info!("Connection to {address} failed for good, blacklisting it");

        // Nothing to fill if whoever removed the supervisor already took care of it
        if was_supervised {
            tokio::spawn(self.clone().backfill());
        }

        Ok(())
    }

    fn backfill(self: Arc<Self>) -> BoxFuture<'static, ()> {
        Box::pin(async move {
            let queue_is_empty = self
                .state
                .lock()
                .map(|state| state.queue.is_empty())
                .unwrap_or(true);

            let peers = if queue_is_empty {
                self.get_peers().await
            } else {
                Vec::new()
            };

            if let Err(e) = self.connect(peers).await {
                warn!("Couldn't backfill the pool: {e}");
            }
        })
    }

    async fn connect(self: &Arc<Self>, new_addresses: Vec<PeerAddress>) -> Result<(), WireError> {
        let mut new_addresses = new_addresses;
        loop {
            let batch = {
                let mut state = self.state.lock()?;
                if state.supervisors.len() >= self.config.max_size {
                    return Ok(());
                }

                state.enqueue(new_addresses.drain(..));
                if state.queue.is_empty() && state.live.len() < self.config.min_size {
                    return Err(WireError::NoPeersAvailable);
                }

                let room = self.config.max_size - state.supervisors.len();
                let batch: Vec<_> = (0..room).map_while(|_| state.queue.pop_front()).collect();
                batch
                    .into_iter()
                    .map(|address| self.spawn_supervisor(&mut state, address))
                    .collect::<Vec<_>>()
            };

            if batch.is_empty() {
                // The queue is empty, but we have enough peers to ask for more
                let found = self.get_peers().await;
                let added = self.state.lock()?.enqueue(found);
                if added == 0 {
                    debug!("No new addresses to connect to, pool can't grow right now");
                    return Ok(());
                }
                continue;
            }

            let addresses: Vec<_> = batch.iter().map(FirstReady::address).collect();
            match select_ok(batch).await {
                Ok((handle, _)) => {
                    self.register_live(handle.address(), handle)?;
                    if self.state.lock()?.supervisors.len() < self.config.max_size {
                        tokio::spawn(self.clone().backfill());
                    }
                    return Ok(());
                }
                Err(_) => {
                    // Every supervisor in this batch gave up, try the next one
                    let mut state = self.state.lock()?;
                    for address in addresses {
                        // Supervisors stopped by `disconnect` aren't in the map anymore
                        if state.supervisors.contains_key(&address) {
                            state.blacklist(address);
                        }
                    }
                }
            }
        }
    }

    fn spawn_supervisor(&self, state: &mut PoolState, address: PeerAddress) -> FirstReady {
        info!("Establishing a connection in pool to {address}");
        let (supervisor, first_ready) = ConnectionSupervisor::new(
            address,
            self.config.max_retries,
            self.connector.clone(),
            self.config.connection.clone(),
            self.events.clone(),
        );

        let task = tokio::spawn(supervisor.run());
        state.supervisors.insert(address, task.abort_handle());
        first_ready
    }

    async fn get_peers(&self) -> Vec<PeerAddress> {
        let client = match self.random_client() {
            Ok(client) => client,
            Err(e) => {
                debug!("Can't ask for peers: {e}");
                return Vec::new();
            }
        };

        match client.get_peers().await {
            Ok(peers) => {
                debug!("{} sent us {} addresses", client.address(), peers.len());
                let mut normalized = Vec::with_capacity(peers.len());
                for peer in peers {
                    let peer = PeerAddress::new(peer.ip, self.config.default_port);
                    if !normalized.contains(&peer) {
                        normalized.push(peer);
                    }
                }
                normalized
            }
            Err(e) => {
                warn!("Couldn't get peers from {}: {e}", client.address());
                Vec::new()
            }
        }
    }

    fn random_client(&self) -> Result<ConnectionHandle, WireError> {
        let clients = self.state.lock()?.clients();
        if clients.is_empty() {
            return Err(WireError::NoPeersAvailable);
        }

        let index = self.random.index(clients.len());
        Ok(clients[index].clone())
    }

    /// Picks `amount` distinct ready connections at random
    pub(crate) fn sample_clients(&self, amount: usize) -> Result<Vec<ConnectionHandle>, WireError> {
        let clients = self.state.lock()?.clients();
        if clients.len() < amount {
            return Err(WireError::InsufficientPeersForConsensus {
                required: amount,
                available: clients.len(),
            });
        }

        Ok(self
            .random
            .sample(clients.len(), amount)
            .into_iter()
            .map(|index| clients[index].clone())
            .collect())
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for (_, supervisor) in state.supervisors.drain() {
            supervisor.abort();
        }
    }
}
