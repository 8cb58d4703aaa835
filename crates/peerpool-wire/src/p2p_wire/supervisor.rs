//! Keeps one peer address connected, up to a point.
//!
//! A supervisor opens a connection to its address and, whenever that fails or drops, opens a
//! new one right away. Every failure counts against `max_retries`; once the count goes over it,
//! the supervisor stops and tells the pool, which blacklists the address. The count is cleared
//! the first time a connection becomes ready, and never again, so a peer that keeps accepting
//! us and then hanging up is still dropped after a few rounds.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::Context;
use std::task::Poll;

use log::debug;
use log::info;
use log::warn;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::time::timeout;

use super::address::PeerAddress;
use super::connection::Connection;
use super::connection::ConnectionEvent;
use super::connection::ConnectionHandle;
use super::connection::Role;
use super::error::WireError;
use super::transport::Connector;
use super::ConnectionConfig;

#[derive(Debug)]
/// What supervisors tell the pool
pub enum PoolEvent {
    /// A connection to this address is ready to take requests
    Ready(PeerAddress, ConnectionHandle),
    /// The ready connection to this address went away. The supervisor may still reconnect.
    Lost(PeerAddress),
    /// The supervisor ran out of retries and stopped
    GaveUp(PeerAddress),
}

/// Resolves with the first connection of a supervisor that becomes ready, or fails if the
/// supervisor gives up before that.
pub struct FirstReady {
    address: PeerAddress,
    receiver: oneshot::Receiver<ConnectionHandle>,
}

impl FirstReady {
    pub fn address(&self) -> PeerAddress {
        self.address
    }
}

impl Future for FirstReady {
    type Output = Result<ConnectionHandle, WireError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let address = self.address;
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| WireError::SupervisorGaveUp(address)))
    }
}

pub struct ConnectionSupervisor {
    address: PeerAddress,
    max_retries: u32,
    retries: u32,
    ever_ready: bool,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    pool_events: mpsc::UnboundedSender<PoolEvent>,
    first_ready: Option<oneshot::Sender<ConnectionHandle>>,
}

impl ConnectionSupervisor {
    pub fn new(
        address: PeerAddress,
        max_retries: u32,
        connector: Arc<dyn Connector>,
        config: ConnectionConfig,
        pool_events: mpsc::UnboundedSender<PoolEvent>,
    ) -> (Self, FirstReady) {
        let (first_ready_tx, first_ready_rx) = oneshot::channel();
        let supervisor = ConnectionSupervisor {
            address,
            max_retries,
            retries: 0,
            ever_ready: false,
            connector,
            config,
            pool_events,
            first_ready: Some(first_ready_tx),
        };

        let first_ready = FirstReady {
            address,
            receiver: first_ready_rx,
        };

        (supervisor, first_ready)
    }

    pub fn address(&self) -> PeerAddress {
        self.address
    }

    /// Connects, and reconnects, until retries run out. Returns how many attempts failed.
    pub async fn run(mut self) -> u32 {
        loop {
            match self.attempt().await {
                Ok(()) => debug!("Connection to {} was closed", self.address),
                Err(e) => debug!("Connection to {} failed: {e}", self.address),
            }

            self.retries += 1;
            if self.retries > self.max_retries {
                warn!(
                    "Giving up on {} after {} failed attempts",
                    self.address, self.retries
                );
                let _ = self.pool_events.send(PoolEvent::GaveUp(self.address));
                return self.retries;
            }

            debug!(
                "Reconnecting to {} (retry {}/{})",
                self.address, self.retries, self.max_retries
            );
        }
    }

    /// One connection, from opening the stream until it closes
    async fn attempt(&mut self) -> Result<(), WireError> {
        let stream = timeout(
            self.config.connect_timeout,
            self.connector.connect(&self.address),
        )
        .await
        .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connect timed out"))??;

        let (events_tx, mut events) = mpsc::unbounded_channel();
        let handle = Connection::spawn(
            stream,
            self.address,
            Role::Outbound,
            &self.config,
            events_tx,
        );

        let mut published = false;
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Ready => {
                    if !self.ever_ready {
                        self.ever_ready = true;
                        self.retries = 0;
                    }

                    if let Some(first_ready) = self.first_ready.take() {
                        let _ = first_ready.send(handle.clone());
                    }

                    info!("Peer {} is ready", self.address);
                    let _ = self
                        .pool_events
                        .send(PoolEvent::Ready(self.address, handle.clone()));
                    published = true;
                }
                ConnectionEvent::Closed(reason) => {
                    if published {
                        let _ = self.pool_events.send(PoolEvent::Lost(self.address));
                    }

                    return match reason {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                }
            }
        }

        Err(WireError::ConnectionLost)
    }
}
