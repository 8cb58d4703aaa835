use std::collections::HashMap;
use std::io;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use bitcoin::block::Header;
use bitcoin::p2p::address::Address;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_network::VersionMessage;
use bitcoin::p2p::ServiceFlags;
use bitcoin::Network;
use futures::future::BoxFuture;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;

use crate::address::PeerAddress;
use crate::codec::FrameCodec;
use crate::connection::Connection;
use crate::connection::ConnectionEvent;
use crate::connection::ConnectionHandle;
use crate::connection::Role;
use crate::discovery::StaticDiscovery;
use crate::pool::Pool;
use crate::random::SeededRandom;
use crate::transport::BoxedStream;
use crate::transport::Connector;
use crate::ConnectionConfig;
use crate::PoolConfig;

const DUPLEX_BUFFER: usize = 1024 * 1024;

/// Builds replies for whatever a fake peer receives, besides the handshake and pings
pub type Responder = Arc<dyn Fn(&NetworkMessage) -> Vec<NetworkMessage> + Send + Sync>;

pub fn address(last_octet: u8) -> PeerAddress {
    PeerAddress::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, last_octet)), 8333)
}

/// The genesis header of `network`. Different networks give peers something to disagree on.
pub fn genesis_header(network: Network) -> Header {
    bitcoin::constants::genesis_block(network).header
}

/// A peer that answers `getheaders` with `headers` and `getaddr` with `peers`
pub fn serving(headers: Vec<Header>, peers: Vec<PeerAddress>) -> Behavior {
    Behavior::Serve(Arc::new(move |message| match message {
        NetworkMessage::GetHeaders(_) => vec![NetworkMessage::Headers(headers.clone())],
        NetworkMessage::GetAddr => {
            let addresses = peers
                .iter()
                .map(|peer| (0, Address::new(&peer.socket_addr(), ServiceFlags::NETWORK)))
                .collect();
            vec![NetworkMessage::Addr(addresses)]
        }
        _ => Vec::new(),
    }))
}

pub fn fake_version() -> NetworkMessage {
    let socket = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 8333);
    NetworkMessage::Version(VersionMessage::new(
        ServiceFlags::NETWORK,
        0,
        Address::new(&socket, ServiceFlags::NONE),
        Address::new(&socket, ServiceFlags::NONE),
        rand::random(),
        "/fake-peer:0.1.0/".to_string(),
        0,
    ))
}

/// The other side of a connection, driven by hand from a test
pub struct RawPeer {
    stream: DuplexStream,
    codec: FrameCodec,
}

impl RawPeer {
    pub fn new(stream: DuplexStream, network: Network) -> Self {
        RawPeer {
            stream,
            codec: FrameCodec::for_network(network),
        }
    }

    pub async fn send(&mut self, message: &NetworkMessage) -> io::Result<()> {
        let bytes = self.codec.encode(message);
        self.send_raw(&bytes).await
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await
    }

    /// The next message from the other side, `None` once it hangs up or sends garbage
    pub async fn recv(&mut self) -> Option<NetworkMessage> {
        let mut buf = [0u8; 4096];
        loop {
            if let Some(frame) = self.codec.next_frame().ok()? {
                return self.codec.decode(&frame).ok();
            }

            let read = self.stream.read(&mut buf).await.ok()?;
            if read == 0 {
                return None;
            }

            if let Some(frame) = self.codec.feed(&buf[..read]).ok()? {
                return self.codec.decode(&frame).ok();
            }
        }
    }

    /// Plays the remote side of the version handshake
    pub async fn handshake(&mut self) {
        assert!(matches!(self.recv().await, Some(NetworkMessage::Version(_))));
        self.send(&fake_version()).await.unwrap();
        self.send(&NetworkMessage::Verack).await.unwrap();
        assert_eq!(self.recv().await, Some(NetworkMessage::Verack));
    }
}

/// Spawns a connection over an in-memory pipe, returns its handle, its events and the peer
/// side of the pipe
pub fn connection_pair(
    role: Role,
    config: &ConnectionConfig,
) -> (
    ConnectionHandle,
    mpsc::UnboundedReceiver<ConnectionEvent>,
    RawPeer,
) {
    let (ours, theirs) = tokio::io::duplex(DUPLEX_BUFFER);
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let handle = Connection::spawn(Box::new(ours), address(1), role, config, events_tx);

    (handle, events_rx, RawPeer::new(theirs, config.network))
}

/// An outbound connection that already finished its handshake
pub async fn ready_connection(
    config: &ConnectionConfig,
) -> (
    ConnectionHandle,
    mpsc::UnboundedReceiver<ConnectionEvent>,
    RawPeer,
) {
    let (handle, mut events, mut peer) = connection_pair(Role::Outbound, config);
    peer.handshake().await;
    assert!(matches!(events.recv().await, Some(ConnectionEvent::Ready)));
    assert!(handle.is_ready());

    (handle, events, peer)
}

#[derive(Clone)]
/// How a fake peer behind [`MockConnector`] acts
pub enum Behavior {
    /// Connection refused
    Refuse,
    /// Accepts the stream but never answers the handshake
    Hang,
    /// Finishes the handshake and hangs up right after
    DropAfterHandshake,
    /// Finishes the handshake and answers requests
    Serve(Responder),
}

async fn run_fake_peer(stream: DuplexStream, network: Network, behavior: Behavior) {
    let mut peer = RawPeer::new(stream, network);
    while let Some(message) = peer.recv().await {
        let replies = match (&behavior, message) {
            (Behavior::Hang, _) => continue,
            (_, NetworkMessage::Version(_)) => vec![fake_version(), NetworkMessage::Verack],
            // Our verack means the other side is about to become ready
            (Behavior::DropAfterHandshake, NetworkMessage::Verack) => return,
            (_, NetworkMessage::Ping(nonce)) => vec![NetworkMessage::Pong(nonce)],
            (Behavior::Serve(responder), message) => responder(&message),
            _ => Vec::new(),
        };

        for reply in replies {
            if peer.send(&reply).await.is_err() {
                return;
            }
        }
    }
}

#[derive(Default)]
/// A connector that opens in-memory pipes to fake peers
pub struct MockConnector {
    peers: Mutex<HashMap<PeerAddress, Behavior>>,
    attempts: Mutex<HashMap<PeerAddress, usize>>,
}

impl MockConnector {
    pub fn new() -> Self {
        MockConnector::default()
    }

    pub fn with_peer(self, address: PeerAddress, behavior: Behavior) -> Self {
        self.peers.lock().unwrap().insert(address, behavior);
        self
    }

    pub fn set_behavior(&self, address: PeerAddress, behavior: Behavior) {
        self.peers.lock().unwrap().insert(address, behavior);
    }

    /// How many times someone tried to connect to `address`
    pub fn attempts(&self, address: &PeerAddress) -> usize {
        self.attempts
            .lock()
            .unwrap()
            .get(address)
            .copied()
            .unwrap_or(0)
    }
}

impl Connector for MockConnector {
    fn connect(&self, address: &PeerAddress) -> BoxFuture<'static, io::Result<BoxedStream>> {
        *self.attempts.lock().unwrap().entry(*address).or_default() += 1;

        let behavior = self.peers.lock().unwrap().get(address).cloned();
        Box::pin(async move {
            let behavior = match behavior {
                None | Some(Behavior::Refuse) => {
                    return Err(io::Error::from(io::ErrorKind::ConnectionRefused))
                }
                Some(behavior) => behavior,
            };

            let (ours, theirs) = tokio::io::duplex(DUPLEX_BUFFER);
            tokio::spawn(run_fake_peer(theirs, Network::Bitcoin, behavior));
            Ok(Box::new(ours) as BoxedStream)
        })
    }
}

/// A pool over `connector` with no discovery and a fixed seed
pub fn mock_pool(config: PoolConfig, connector: Arc<MockConnector>) -> Pool {
    Pool::new(
        config,
        connector,
        Arc::new(StaticDiscovery::default()),
        Arc::new(SeededRandom::new(7)),
    )
}

/// Polls `condition` until it holds, panics if it takes more than a few seconds
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let waiting = async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };

    tokio::time::timeout(Duration::from_secs(5), waiting)
        .await
        .expect("condition never held");
}
