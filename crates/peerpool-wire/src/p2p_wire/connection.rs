//! A connection to a single peer.
//!
//! Each connection is one task that owns the stream and the table of pending requests. The rest
//! of the crate talks to it through a [`ConnectionHandle`], which is cheap to clone. The task
//! multiplexes three things:
//!
//! - requests coming from handles,
//! - bytes coming from the peer,
//! - a single timer, armed at the earliest of the handshake deadline, the idle deadline and the
//!   deadline of the oldest pending request.
//!
//! Once the connection dies, for whatever reason, every request still in flight fails with
//! [`WireError::ConnectionLost`] and the owner gets a [`ConnectionEvent::Closed`].

use std::fmt;
use std::fmt::Debug;
use std::fmt::Formatter;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

use bitcoin::block::Header;
use bitcoin::hashes::Hash;
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_blockdata::GetBlocksMessage;
use bitcoin::p2p::message_blockdata::GetHeadersMessage;
use bitcoin::p2p::message_blockdata::Inventory;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::ServiceFlags;
use bitcoin::Block;
use bitcoin::BlockHash;
use bitcoin::Transaction;
use bitcoin::Txid;
use log::debug;
use log::info;
use log::warn;
use peerpool_common::Hash256;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::ReadHalf;
use tokio::io::WriteHalf;
use tokio::sync::mpsc;
use tokio::sync::watch;
use tokio::time::sleep_until;
use tokio::time::Instant;

use super::address::PeerAddress;
use super::codec::FrameCodec;
use super::error::WireError;
use super::pending::PendingRequest;
use super::pending::PendingRequests;
use super::pending::ResponseMatcher;
use super::transport::BoxedStream;
use super::ConnectionConfig;

const READ_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// The transport is being established
    Connecting,
    /// We sent our version and are waiting for the peer to finish the handshake
    Handshaking,
    /// Requests are accepted
    Ready,
    /// Gone for good
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Who opened the connection. This only changes how the handshake is validated.
pub enum Role {
    Outbound,
    Inbound,
}

#[derive(Debug)]
/// What a connection tells its owner
pub enum ConnectionEvent {
    /// The handshake is done
    Ready,
    /// The connection is gone. `None` means it was closed on request.
    Closed(Option<WireError>),
}

enum Command {
    /// `message` is sent once, and every request in `requests` waits on its own answer
    Request {
        message: NetworkMessage,
        requests: Vec<PendingRequest>,
    },
    Disconnect,
}

/// The task driving one peer connection
pub struct Connection {
    address: PeerAddress,
    role: Role,
    config: ConnectionConfig,
    reader: ReadHalf<BoxedStream>,
    writer: WriteHalf<BoxedStream>,
    codec: FrameCodec,
    pending: PendingRequests,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: watch::Sender<ConnectionState>,
    got_version: bool,
    handshake_deadline: Option<Instant>,
    idle_deadline: Option<Instant>,
}

impl Connection {
    /// Spawns a task that runs the protocol over `stream`, and returns a handle to it
    pub fn spawn(
        stream: BoxedStream,
        address: PeerAddress,
        role: Role,
        config: &ConnectionConfig,
        events: mpsc::UnboundedSender<ConnectionEvent>,
    ) -> ConnectionHandle {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (reader, writer) = tokio::io::split(stream);

        let connection = Connection {
            address,
            role,
            config: config.clone(),
            reader,
            writer,
            codec: FrameCodec::for_network(config.network),
            pending: PendingRequests::new(),
            commands: commands_rx,
            events,
            state: state_tx,
            got_version: false,
            handshake_deadline: None,
            idle_deadline: None,
        };
        tokio::spawn(connection.run());

        ConnectionHandle {
            address,
            request_timeout: config.request_timeout,
            commands: commands_tx,
            state: state_rx,
        }
    }

    /// Runs until the connection closes, then fails whatever is still pending and tells the
    /// owner why it closed.
    pub async fn run(mut self) {
        let result = self.connection_loop_inner().await;
        self.state.send_replace(ConnectionState::Closed);
        self.commands.close();
        self.pending.fail_all();
        let _ = self.writer.shutdown().await;

        let reason = match result {
            Ok(()) => {
                debug!("Connection to {} closed", self.address);
                None
            }
            Err(e) => {
                info!("Connection to {} lost: {e}", self.address);
                Some(e)
            }
        };

        let _ = self.events.send(ConnectionEvent::Closed(reason));
    }

    async fn connection_loop_inner(&mut self) -> Result<(), WireError> {
        let version = peer_utils::build_version_message(&self.config, &self.address);
        self.write(&version).await?;
        self.state.send_replace(ConnectionState::Handshaking);
        self.handshake_deadline = Some(Instant::now() + self.config.handshake_timeout);

        let mut buf = vec![0u8; READ_BUFFER_SIZE];
        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Request { message, requests }) => {
                        self.handle_request(message, requests).await?;
                    }
                    // Explicit disconnect, or every handle was dropped
                    Some(Command::Disconnect) | None => return Ok(()),
                },
                read = self.reader.read(&mut buf) => {
                    let read = read?;
                    if read == 0 {
                        return Err(WireError::ConnectionLost);
                    }

                    let mut frame = self.codec.feed(&buf[..read])?;
                    while let Some(complete) = frame {
                        let message = self.codec.decode(&complete)?;
                        self.handle_peer_message(message).await?;
                        frame = self.codec.next_frame()?;
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.handle_timeout()?;
                }
            }

            if self.pending.is_empty() {
                self.idle_deadline = None;
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        [
            self.handshake_deadline,
            self.idle_deadline,
            self.pending.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    fn handle_timeout(&mut self) -> Result<(), WireError> {
        let now = Instant::now();
        if self.handshake_deadline.is_some_and(|deadline| deadline <= now) {
            return Err(WireError::HandshakeTimeout);
        }

        if self.idle_deadline.is_some_and(|deadline| deadline <= now) {
            return Err(WireError::IdleTimeout);
        }

        let expired = self.pending.expire(now);
        if expired > 0 {
            debug!("{expired} request(s) to {} timed out", self.address);
        }

        Ok(())
    }

    async fn handle_request(
        &mut self,
        message: NetworkMessage,
        requests: Vec<PendingRequest>,
    ) -> Result<(), WireError> {
        if *self.state.borrow() != ConnectionState::Ready {
            for request in requests {
                request.fail(WireError::ConnectionNotReady);
            }
            return Ok(());
        }

        if requests.iter().all(PendingRequest::is_cancelled) {
            return Ok(());
        }

        self.write(&message).await?;
        if self.pending.is_empty() {
            self.idle_deadline = Some(Instant::now() + self.config.idle_timeout);
        }
        for request in requests {
            self.pending.push(request);
        }

        Ok(())
    }

    async fn handle_peer_message(&mut self, message: NetworkMessage) -> Result<(), WireError> {
        if self.role == Role::Inbound
            && !self.got_version
            && !matches!(message, NetworkMessage::Version(_))
        {
            return Err(WireError::UnexpectedMessage(message.command().to_string()));
        }

        if self.idle_deadline.is_some() {
            self.idle_deadline = Some(Instant::now() + self.config.idle_timeout);
        }

        match message {
            NetworkMessage::Version(version) => {
                debug!(
                    "Peer {} is {} at height {}",
                    self.address, version.user_agent, version.start_height
                );
                self.got_version = true;
                self.write(&NetworkMessage::Verack).await?;
            }
            NetworkMessage::Verack => {
                if *self.state.borrow() == ConnectionState::Handshaking {
                    self.handshake_deadline = None;
                    self.state.send_replace(ConnectionState::Ready);
                    info!("Connection to {} is ready", self.address);
                    let _ = self.events.send(ConnectionEvent::Ready);
                }
            }
            NetworkMessage::Ping(nonce) => {
                self.write(&NetworkMessage::Pong(nonce)).await?;
            }
            NetworkMessage::Reject(reject) => {
                if !self.pending.reject(&reject) {
                    warn!(
                        "Peer {} rejected a {} we didn't send: {}",
                        self.address, reject.message, reject.reason
                    );
                }
            }
            NetworkMessage::Unknown { command, .. } => {
                debug!("Ignoring unknown {command} from {}", self.address);
            }
            message => {
                if !self.pending.resolve(&message) {
                    debug!("Unsolicited {} from {}", message.command(), self.address);
                }
            }
        }

        Ok(())
    }

    async fn write(&mut self, message: &NetworkMessage) -> Result<(), WireError> {
        let data = self.codec.encode(message);
        self.writer.write_all(&data).await?;
        self.writer.flush().await?;
        Ok(())
    }
}

#[derive(Clone)]
/// A cheap handle to a running [`Connection`]
pub struct ConnectionHandle {
    address: PeerAddress,
    request_timeout: Duration,
    commands: mpsc::UnboundedSender<Command>,
    state: watch::Receiver<ConnectionState>,
}

impl Debug for ConnectionHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

impl ConnectionHandle {
    pub fn address(&self) -> PeerAddress {
        self.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ConnectionState::Ready
    }

    /// Waits until the connection reaches `state`. Fails with [`WireError::ConnectionLost`] if
    /// it closes first.
    pub async fn wait_for(&self, state: ConnectionState) -> Result<(), WireError> {
        let mut receiver = self.state.clone();
        let reached = receiver
            .wait_for(|current| *current == state || *current == ConnectionState::Closed)
            .await
            .map_err(|_| WireError::ConnectionLost)?;

        if *reached == state {
            return Ok(());
        }

        Err(WireError::ConnectionLost)
    }

    /// Asks the connection to close. Pending requests fail with [`WireError::ConnectionLost`].
    pub fn disconnect(&self) {
        let _ = self.commands.send(Command::Disconnect);
    }

    /// Sends `message` and waits for the first incoming message `matcher` accepts, for at most
    /// `timeout`.
    pub async fn send_request(
        &self,
        message: NetworkMessage,
        matcher: ResponseMatcher,
        timeout: Duration,
    ) -> Result<NetworkMessage, WireError> {
        if !self.is_ready() {
            return Err(WireError::ConnectionNotReady);
        }

        let (request, response) = PendingRequest::new(
            message.command().to_string(),
            matcher,
            Instant::now() + timeout,
        );

        self.commands
            .send(Command::Request {
                message,
                requests: vec![request],
            })
            .map_err(|_| WireError::ConnectionLost)?;

        response.await.map_err(|_| WireError::ConnectionLost)?
    }

    /// Like [`ConnectionHandle::send_request`], using the usual response for the command and the
    /// configured request timeout. A message nobody answers to will just time out.
    pub async fn request(&self, message: NetworkMessage) -> Result<NetworkMessage, WireError> {
        let matcher = default_matcher(&message);
        self.send_request(message, matcher, self.request_timeout)
            .await
    }

    /// Asks the peer for addresses of other peers
    pub async fn get_peers(&self) -> Result<Vec<PeerAddress>, WireError> {
        match self.request(NetworkMessage::GetAddr).await? {
            NetworkMessage::Addr(addresses) => Ok(addresses
                .iter()
                .filter_map(|(_, address)| PeerAddress::from_addr(address))
                .collect()),
            NetworkMessage::AddrV2(addresses) => Ok(addresses
                .iter()
                .filter_map(PeerAddress::from_addr_v2)
                .collect()),
            other => Err(unexpected(&other)),
        }
    }

    /// Sends a `getblocks` with `locator`, returns the inventory the peer answers with
    pub async fn get_block_list(&self, locator: &[Hash256]) -> Result<Vec<Inventory>, WireError> {
        match self.request(get_blocks_message(locator)).await? {
            NetworkMessage::Inv(inventory) => Ok(inventory),
            other => Err(unexpected(&other)),
        }
    }

    /// Sends a `getheaders` with `locator`
    pub async fn get_headers(&self, locator: &[Hash256]) -> Result<Vec<Header>, WireError> {
        match self.request(get_headers_message(locator)).await? {
            NetworkMessage::Headers(headers) => Ok(headers),
            other => Err(unexpected(&other)),
        }
    }

    /// Asks for the inventory of the peer's mempool
    pub async fn get_mem_pool(&self) -> Result<Vec<Inventory>, WireError> {
        match self.request(NetworkMessage::MemPool).await? {
            NetworkMessage::Inv(inventory) => Ok(inventory),
            other => Err(unexpected(&other)),
        }
    }

    /// Downloads a block. Returns `None` if the peer says it doesn't have it.
    pub async fn get_block(&self, hash: impl Into<Hash256>) -> Result<Option<Block>, WireError> {
        let mut blocks = self.get_blocks(&[hash.into()]).await?;
        Ok(blocks.pop().flatten())
    }

    /// Downloads a transaction. Returns `None` if the peer says it doesn't have it.
    pub async fn get_transaction(
        &self,
        txid: impl Into<Hash256>,
    ) -> Result<Option<Transaction>, WireError> {
        let mut transactions = self.get_transactions(&[txid.into()]).await?;
        Ok(transactions.pop().flatten())
    }

    /// Sends a single `getdata` for every item of `inventory` and waits for each item's answer,
    /// in the same order. Items the peer says it doesn't have come back as `None`.
    async fn get_data(
        &self,
        inventory: Vec<Inventory>,
    ) -> Result<Vec<Option<NetworkMessage>>, WireError> {
        if inventory.is_empty() {
            return Ok(Vec::new());
        }

        if !self.is_ready() {
            return Err(WireError::ConnectionNotReady);
        }

        let deadline = Instant::now() + self.request_timeout;
        let mut requests = Vec::with_capacity(inventory.len());
        let mut responses = Vec::with_capacity(inventory.len());
        for wanted in &inventory {
            let (request, response) =
                PendingRequest::new("getdata", getdata_matcher(*wanted), deadline);
            requests.push(request);
            responses.push(response);
        }

        self.commands
            .send(Command::Request {
                message: NetworkMessage::GetData(inventory.clone()),
                requests,
            })
            .map_err(|_| WireError::ConnectionLost)?;

        // One `notfound` may list several items, but it only resolves the oldest of them
        let mut missing: Vec<Inventory> = Vec::new();
        let mut answers = Vec::with_capacity(inventory.len());
        for (wanted, mut response) in inventory.iter().zip(responses) {
            if missing.iter().any(|item| same_item(item, wanted)) {
                // Dropping the receiver cancels the request if it is still pending
                let answer = match response.try_recv() {
                    Ok(Ok(message)) if !matches!(message, NetworkMessage::NotFound(_)) => {
                        Some(message)
                    }
                    _ => None,
                };
                answers.push(answer);
                continue;
            }

            match response.await.map_err(|_| WireError::ConnectionLost)?? {
                NetworkMessage::NotFound(items) => {
                    missing.extend(items);
                    answers.push(None);
                }
                message => answers.push(Some(message)),
            }
        }

        Ok(answers)
    }

    /// Downloads several blocks with a single `getdata`. Blocks the peer doesn't have are
    /// `None`.
    pub async fn get_blocks(&self, hashes: &[Hash256]) -> Result<Vec<Option<Block>>, WireError> {
        let inventory = hashes
            .iter()
            .map(|hash| Inventory::Block(BlockHash::from(*hash)))
            .collect();

        self.get_data(inventory)
            .await?
            .into_iter()
            .map(|answer| match answer {
                Some(NetworkMessage::Block(block)) => Ok(Some(block)),
                Some(other) => Err(unexpected(&other)),
                None => Ok(None),
            })
            .collect()
    }

    /// Downloads several transactions with a single `getdata`. Transactions the peer doesn't
    /// have are `None`.
    pub async fn get_transactions(
        &self,
        txids: &[Hash256],
    ) -> Result<Vec<Option<Transaction>>, WireError> {
        let inventory = txids
            .iter()
            .map(|txid| Inventory::Transaction(Txid::from(*txid)))
            .collect();

        self.get_data(inventory)
            .await?
            .into_iter()
            .map(|answer| match answer {
                Some(NetworkMessage::Tx(tx)) => Ok(Some(tx)),
                Some(other) => Err(unexpected(&other)),
                None => Ok(None),
            })
            .collect()
    }

    /// Pings the peer and returns the round trip time
    pub async fn ping(&self) -> Result<Duration, WireError> {
        let start = Instant::now();
        self.request(NetworkMessage::Ping(rand::random())).await?;
        Ok(start.elapsed())
    }
}

fn unexpected(message: &NetworkMessage) -> WireError {
    WireError::UnexpectedMessage(message.command().to_string())
}

fn locator_hashes(locator: &[Hash256]) -> Vec<BlockHash> {
    locator.iter().copied().map(BlockHash::from).collect()
}

/// A `getblocks` asking for everything after `locator`
pub fn get_blocks_message(locator: &[Hash256]) -> NetworkMessage {
    NetworkMessage::GetBlocks(GetBlocksMessage::new(
        locator_hashes(locator),
        BlockHash::all_zeros(),
    ))
}

/// A `getheaders` asking for everything after `locator`
pub fn get_headers_message(locator: &[Hash256]) -> NetworkMessage {
    NetworkMessage::GetHeaders(GetHeadersMessage::new(
        locator_hashes(locator),
        BlockHash::all_zeros(),
    ))
}

/// The matcher for the message a peer normally answers `request` with
pub fn default_matcher(request: &NetworkMessage) -> ResponseMatcher {
    match request {
        NetworkMessage::GetAddr => Box::new(|message| {
            matches!(
                message,
                NetworkMessage::Addr(_) | NetworkMessage::AddrV2(_)
            )
        }),
        NetworkMessage::GetBlocks(_) | NetworkMessage::MemPool => {
            Box::new(|message| matches!(message, NetworkMessage::Inv(_)))
        }
        NetworkMessage::GetHeaders(_) => {
            Box::new(|message| matches!(message, NetworkMessage::Headers(_)))
        }
        NetworkMessage::Ping(nonce) => {
            let nonce = *nonce;
            Box::new(move |message| matches!(message, NetworkMessage::Pong(n) if *n == nonce))
        }
        NetworkMessage::GetData(inventory) => match inventory.first() {
            Some(wanted) => getdata_matcher(*wanted),
            None => Box::new(|_| false),
        },
        _ => Box::new(|_| false),
    }
}

fn getdata_matcher(wanted: Inventory) -> ResponseMatcher {
    Box::new(move |message| match message {
        NetworkMessage::NotFound(missing) => missing.iter().any(|inv| same_item(inv, &wanted)),
        NetworkMessage::Block(block) => match wanted {
            Inventory::Block(hash) | Inventory::WitnessBlock(hash) => block.block_hash() == hash,
            _ => false,
        },
        NetworkMessage::Tx(tx) => match wanted {
            Inventory::Transaction(txid) | Inventory::WitnessTransaction(txid) => {
                tx.compute_txid() == txid
            }
            _ => false,
        },
        _ => false,
    })
}

/// Whether two inventory entries name the same object, ignoring the witness flag
fn same_item(a: &Inventory, b: &Inventory) -> bool {
    match (a, b) {
        (
            Inventory::Block(x) | Inventory::WitnessBlock(x),
            Inventory::Block(y) | Inventory::WitnessBlock(y),
        ) => x == y,
        (
            Inventory::Transaction(x) | Inventory::WitnessTransaction(x),
            Inventory::Transaction(y) | Inventory::WitnessTransaction(y),
        ) => x == y,
        _ => a == b,
    }
}

pub(super) mod peer_utils {
    use super::*;

    pub(super) fn build_version_message(
        config: &ConnectionConfig,
        address: &PeerAddress,
    ) -> NetworkMessage {
        // "standard UNIX timestamp in seconds"
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or_default();

        // "The network address of the node receiving this message"
        let receiver = Address::new(&address.socket_addr(), ServiceFlags::NONE);

        // We don't accept connections, so there's no address worth announcing
        let unroutable = SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0);
        let sender = Address::new(&unroutable, config.services);

        // "Node random nonce, randomly generated every time a version packet is sent"
        let nonce: u64 = rand::random();

        NetworkMessage::Version(VersionMessage::new(
            config.services,
            timestamp,
            receiver,
            sender,
            nonce,
            config.user_agent.clone(),
            config.start_height,
        ))
    }
}
